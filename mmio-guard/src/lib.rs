// Copyright © 2026 The Guest Memory Plane Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Host-side registry of MMIO ranges shared with the hypervisor.
//!
//! On protected systems the hypervisor refuses host access to MMIO unless
//! the host has guarded the physical range first. This crate keeps the
//! host's view of what is guarded: a refcounted map of physical ranges, so
//! overlapping ioremap-style callers can share a window safely, mirrored
//! into the hypervisor with one map/unmap call per granule (or one per
//! range when the hypervisor supports it).

#[macro_use]
extern crate log;

mod guard;

pub use crate::guard::MmioGuard;
pub use hypercall::{Error, Result};
