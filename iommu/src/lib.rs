// Copyright © 2026 The Guest Memory Plane Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! IOMMU domain management for the protected guest memory plane
//!
//! DMA-capable devices translate through per-domain stage-2 page tables so
//! that a device can only reach memory the host has explicitly surrendered
//! for DMA. This crate owns the domain descriptors and their refcount
//! discipline, the map/unmap paths with their bounded per-CPU unmap cache,
//! the page-donation pool that feeds page-table allocations, and the
//! ARM-LPAE page table itself. The hardware-facing side is injected as a
//! capability record ([`IommuBackend`]), keeping the crate independent of
//! any particular SMMU generation.

#[macro_use]
extern crate log;

mod domain;
mod pgtable;
mod pool;

pub use crate::domain::{
    DomainId, IommuBackend, IommuId, IommuInfo, IommuManager, MAX_DOMAINS, PADDR_CACHE_MAX,
};
pub use crate::pgtable::{PageTable, PageTableCfg, PageTableFmt};
pub use crate::pool::{PagePool, PAGE_SHIFT, PAGE_SIZE};
pub use hypercall::{Error, Result};

use bitflags::bitflags;

bitflags! {
    /// Protection attributes of an IOVA mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IommuProt: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const CACHE = 1 << 2;
        const NOEXEC = 1 << 3;
        const MMIO = 1 << 4;
        const PRIV = 1 << 5;
    }
}

/// Accounting of host pages surrendered for device DMA.
///
/// A physical range must be marked in DMA use before any IOMMU mapping to
/// it becomes observable, and unmarked once the last mapping is gone. The
/// guest memory layer provides the implementation.
pub trait DmaOwnership: Send + Sync {
    fn use_range(&self, paddr: u64, size: u64) -> Result<()>;
    fn unuse_range(&self, paddr: u64, size: u64) -> Result<()>;
}
