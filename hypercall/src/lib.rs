// Copyright © 2026 The Guest Memory Plane Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! A thin abstraction around the hypervisor call interface
//!
//! The hypervisor is reached through a single primitive: eight argument
//! registers in, a status plus three result registers out. This crate owns
//! the closed set of operation identifiers, the mapping from
//! hypervisor-native status codes to the crate-wide error type, and the
//! typed wrappers the rest of the stack calls. Raw status codes never
//! escape this crate.

#[macro_use]
extern crate log;

mod error;
/// Hypervisor related module
mod hypervisor;
/// Operation identifiers and register conventions
mod ops;

pub use crate::error::{Error, Result};
pub use crate::hypervisor::{Hypervisor, HypercallTransport};
pub use crate::ops::{
    HypercallOp, HypercallRet, CAP_BLOCK_BASED_DEMAND_PAGING, CAP_ENABLE_DEMAND_PAGING,
    CAP_PROTECTED_VM, CAP_VM_GPA_SIZE, MMIO_GUARD_HAS_RANGE, PVM_GET_PVMFW_SIZE,
    PVM_SET_PROTECTED_VM, PVM_SET_PVMFW_GPA,
};

/// VM identifier the hypervisor hands back from a failed creation.
pub const INVALID_VM_ID: u16 = 0xffff;
