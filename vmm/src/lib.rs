// Copyright © 2026 The Guest Memory Plane Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Guest memory management for protected VMs
//!
//! A protected guest's memory is pinned host memory mapped into the guest
//! physical address space by the hypervisor, either up front (fully
//! populated) or on demand as the guest faults pages in. This crate tracks
//! the pinned pages of each VM in an ordered per-IPA map, serves demand
//! paging faults at page or block granularity, hands pages back when the
//! hypervisor relinquishes them, and reclaims everything at teardown. It
//! also provides the DMA-use accounting the IOMMU layer marks physical
//! ranges through.

#[macro_use]
extern crate log;

mod dma;
mod host;
mod mmu;
#[cfg(test)]
mod testing;
mod vcpu;
mod vm;

pub use crate::dma::DmaPageTracker;
pub use crate::host::{HostMemory, MlockHostMemory, PinnedHostPage};
pub use crate::vcpu::{ExitReason, FaultAction, Vcpu, VcpuRun};
pub use crate::vm::{MemAllocMode, Memslot, Vm, VmManager};
pub use hypercall::{Error, Result};

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

pub const MAX_VCPUS: usize = 8;
pub const MAX_MEM_REGIONS: usize = 10;

/// Pages demand-faulted in one go when block-based paging is enabled.
pub const BLOCK_BASED_DEMAND_PAGE_SIZE: u64 = 2 * 1024 * 1024;
