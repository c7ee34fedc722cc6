// Copyright © 2026 The Guest Memory Plane Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use hypercall::{Error, Result};

use crate::pgtable::PageTable;
use crate::pool::PagePool;
use crate::{DmaOwnership, IommuProt};

pub type IommuId = u32;
pub type DomainId = u32;

pub const MAX_DOMAINS: u32 = 1 << 16;
/// Domain descriptors per second-level table page.
const DOMAINS_PER_PAGE: u32 = 128;
/// Upper bound on paddrs collected per unmap walk before draining.
pub const PADDR_CACHE_MAX: usize = 511;

/// What the backend knows about one physical IOMMU instance.
#[derive(Debug, Clone, Copy)]
pub struct IommuInfo {
    pub nr_domains: u32,
}

/// Capability record for one IOMMU driver generation.
///
/// The domain manager owns descriptors, refcounts and page tables; the
/// backend touches hardware. All backend calls are made with the domain
/// table lock held.
pub trait IommuBackend: Send + Sync {
    fn init(&self) -> Result<()> {
        Ok(())
    }
    fn get_iommu_by_id(&self, iommu: IommuId) -> Option<IommuInfo>;
    fn alloc_domain(
        &self,
        iommu: IommuId,
        domain: DomainId,
        pgd_hva: u64,
        pool: &Arc<PagePool>,
    ) -> Result<PageTable>;
    fn free_domain(&self, iommu: IommuId, domain: DomainId) -> Result<()>;
    fn attach_dev(&self, iommu: IommuId, domain: DomainId, endpoint: u32) -> Result<()>;
    fn detach_dev(&self, iommu: IommuId, domain: DomainId, endpoint: u32) -> Result<()>;
}

#[derive(Default)]
struct DomainSlot {
    /// 0 = free, 1 = allocated, each attached endpoint adds one.
    refs: u32,
    pgtable: Option<PageTable>,
}

struct SlotPage {
    /// Pool address backing this second-level table, held for accounting.
    _addr: u64,
    slots: Vec<DomainSlot>,
}

struct IommuDomains {
    nr_domains: u32,
    /// Lazily allocated second-level tables; once allocated, never moved.
    table: Vec<Option<SlotPage>>,
}

thread_local! {
    static UNMAP_CACHE: RefCell<Vec<(u64, u64)>> =
        RefCell::new(Vec::with_capacity(PADDR_CACHE_MAX));
    #[cfg(test)]
    static DRAIN_LOG: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Domain lifecycle and the DMA map/unmap surface.
pub struct IommuManager {
    backend: Arc<dyn IommuBackend>,
    dma: Arc<dyn DmaOwnership>,
    pool: Arc<PagePool>,
    iommus: Mutex<HashMap<IommuId, IommuDomains>>,
}

impl IommuManager {
    pub fn new(
        backend: Arc<dyn IommuBackend>,
        dma: Arc<dyn DmaOwnership>,
        pool: Arc<PagePool>,
    ) -> Result<Self> {
        backend.init()?;
        Ok(IommuManager {
            backend,
            dma,
            pool,
            iommus: Mutex::new(HashMap::new()),
        })
    }

    pub fn pool(&self) -> &Arc<PagePool> {
        &self.pool
    }

    /// Allocate the domain and hand it a fresh page table. Fails if the
    /// domain is already in use.
    pub fn alloc_domain(&self, iommu: IommuId, domain: DomainId, pgd_hva: u64) -> Result<()> {
        let mut iommus = self.iommus.lock().unwrap();
        let slot = self.slot_mut(&mut iommus, iommu, domain)?;
        if slot.refs != 0 {
            return Err(Error::Invalid);
        }
        let pgtable = self.backend.alloc_domain(iommu, domain, pgd_hva, &self.pool)?;
        slot.pgtable = Some(pgtable);
        slot.refs = 1;
        Ok(())
    }

    /// Free the domain. Only legal with no endpoints attached.
    pub fn free_domain(&self, iommu: IommuId, domain: DomainId) -> Result<()> {
        let mut iommus = self.iommus.lock().unwrap();
        let slot = self.slot_mut(&mut iommus, iommu, domain)?;
        if slot.refs != 1 {
            return Err(Error::Invalid);
        }
        self.backend.free_domain(iommu, domain)?;
        if let Some(pgtable) = slot.pgtable.take() {
            pgtable.free();
        }
        slot.refs = 0;
        Ok(())
    }

    pub fn attach_dev(&self, iommu: IommuId, domain: DomainId, endpoint: u32) -> Result<()> {
        let mut iommus = self.iommus.lock().unwrap();
        let slot = self.slot_mut(&mut iommus, iommu, domain)?;
        if slot.refs == 0 || slot.refs == u32::MAX {
            return Err(Error::Invalid);
        }
        self.backend.attach_dev(iommu, domain, endpoint)?;
        slot.refs += 1;
        Ok(())
    }

    pub fn detach_dev(&self, iommu: IommuId, domain: DomainId, endpoint: u32) -> Result<()> {
        let mut iommus = self.iommus.lock().unwrap();
        let slot = self.slot_mut(&mut iommus, iommu, domain)?;
        if slot.refs <= 1 {
            return Err(Error::Invalid);
        }
        self.backend.detach_dev(iommu, domain, endpoint)?;
        slot.refs -= 1;
        Ok(())
    }

    /// Current refcount of a domain, zero when free.
    pub fn domain_refcount(&self, iommu: IommuId, domain: DomainId) -> Result<u32> {
        let mut iommus = self.iommus.lock().unwrap();
        Ok(self.slot_mut(&mut iommus, iommu, domain)?.refs)
    }

    /// Map `pgcount` pages of `pgsize` bytes from `paddr` at `iova`.
    ///
    /// The physical range is marked in DMA use before any mapping becomes
    /// visible; on partial success the unmapped suffix is unmarked again
    /// and the number of pages actually mapped is returned.
    pub fn map_pages(
        &self,
        iommu: IommuId,
        domain: DomainId,
        iova: u64,
        paddr: u64,
        pgsize: u64,
        pgcount: usize,
        prot: u32,
    ) -> Result<usize> {
        let prot = IommuProt::from_bits(prot).ok_or(Error::Invalid)?;
        let size = Self::checked_extent(iova, pgsize, pgcount)?;
        paddr.checked_add(size).ok_or(Error::Range)?;

        let mut iommus = self.iommus.lock().unwrap();
        let slot = self.slot_mut(&mut iommus, iommu, domain)?;
        if slot.refs == 0 {
            return Err(Error::Invalid);
        }
        let pgtable = slot.pgtable.as_mut().ok_or(Error::Invalid)?;

        let min_granule = 1u64 << pgtable.pgsize_bitmap().trailing_zeros();
        if (iova | paddr | pgsize) & (min_granule - 1) != 0 {
            return Err(Error::Range);
        }

        self.dma.use_range(paddr, size)?;
        // The range must be accountably in DMA use before a device can
        // observe any mapping to it.
        fence(Ordering::SeqCst);

        let mut mapped = 0usize;
        let mut ret = Ok(());
        while (mapped as u64) < size {
            let off = mapped as u64;
            let before = mapped;
            ret = pgtable.map_pages(
                iova + off,
                paddr + off,
                pgsize,
                ((size - off) / pgsize) as usize,
                prot,
                &mut mapped,
            );
            if ret.is_err() || mapped == before {
                break;
            }
        }

        if (mapped as u64) < size {
            // The suffix never became mappable; give it back.
            if let Err(e) = self.dma.unuse_range(paddr + mapped as u64, size - mapped as u64) {
                error!("failed to release unmapped dma suffix: {e}");
            }
        }
        if mapped == 0 {
            ret?;
        }
        Ok(mapped / pgsize as usize)
    }

    /// Unmap `pgcount` pages of `pgsize` bytes at `iova`, clearing the
    /// DMA-use marking of every page the walker frees. Returns the number
    /// of pages unmapped.
    pub fn unmap_pages(
        &self,
        iommu: IommuId,
        domain: DomainId,
        iova: u64,
        pgsize: u64,
        pgcount: usize,
    ) -> Result<usize> {
        let size = Self::checked_extent(iova, pgsize, pgcount)?;

        let mut iommus = self.iommus.lock().unwrap();
        let slot = self.slot_mut(&mut iommus, iommu, domain)?;
        if slot.refs == 0 {
            return Err(Error::Invalid);
        }
        let pgtable = slot.pgtable.as_mut().ok_or(Error::Invalid)?;

        let min_granule = 1u64 << pgtable.pgsize_bitmap().trailing_zeros();
        if (iova | pgsize) & (min_granule - 1) != 0 {
            return Err(Error::Range);
        }

        let dma = &self.dma;
        let mut total = 0u64;
        while total < size {
            let remaining = ((size - total) / pgsize) as usize;
            let max_pgcount = remaining.min(PADDR_CACHE_MAX);
            let unmapped = pgtable.unmap_pages_walk(iova + total, pgsize, max_pgcount, &mut |pa, sz| {
                UNMAP_CACHE.with(|c| {
                    let mut cache = c.borrow_mut();
                    cache.push((pa, sz));
                    if cache.len() == PADDR_CACHE_MAX {
                        Self::drain_cache(dma, &mut cache);
                    }
                });
            });
            UNMAP_CACHE.with(|c| Self::drain_cache(dma, &mut c.borrow_mut()));
            if unmapped == 0 {
                break;
            }
            total += unmapped;
        }

        Ok((total / pgsize) as usize)
    }

    /// Translate an IOVA through a domain's page table; zero when nothing
    /// is mapped there.
    pub fn iova_to_phys(&self, iommu: IommuId, domain: DomainId, iova: u64) -> u64 {
        let iommus = self.iommus.lock().unwrap();
        self.slot_ref(&iommus, iommu, domain)
            .and_then(|slot| slot.pgtable.as_ref())
            .map(|pgtable| pgtable.iova_to_phys(iova))
            .unwrap_or(0)
    }

    fn drain_cache(dma: &Arc<dyn DmaOwnership>, cache: &mut Vec<(u64, u64)>) {
        if cache.is_empty() {
            return;
        }
        #[cfg(test)]
        DRAIN_LOG.with(|log| log.borrow_mut().push(cache.len()));
        for (pa, sz) in cache.drain(..) {
            if let Err(e) = dma.unuse_range(pa, sz) {
                error!("failed to release dma range {pa:#x}+{sz:#x}: {e}");
            }
        }
    }

    fn checked_extent(iova: u64, pgsize: u64, pgcount: usize) -> Result<u64> {
        if pgsize == 0 || pgcount == 0 {
            return Err(Error::Invalid);
        }
        let size = pgsize.checked_mul(pgcount as u64).ok_or(Error::Range)?;
        iova.checked_add(size).ok_or(Error::Range)?;
        Ok(size)
    }

    /// Resolve `(iommu, domain)` to its descriptor slot, lazily allocating
    /// the second-level table from the donation pool.
    fn slot_mut<'a>(
        &self,
        iommus: &'a mut MutexGuard<'_, HashMap<IommuId, IommuDomains>>,
        iommu: IommuId,
        domain: DomainId,
    ) -> Result<&'a mut DomainSlot> {
        let domains = match iommus.entry(iommu) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(v) => {
                let info = self
                    .backend
                    .get_iommu_by_id(iommu)
                    .ok_or(Error::Invalid)?;
                v.insert(IommuDomains {
                    nr_domains: info.nr_domains.min(MAX_DOMAINS),
                    table: Vec::new(),
                })
            }
        };
        if domain >= domains.nr_domains {
            return Err(Error::Invalid);
        }

        let idx = (domain / DOMAINS_PER_PAGE) as usize;
        if domains.table.len() <= idx {
            domains.table.resize_with(idx + 1, || None);
        }
        if domains.table[idx].is_none() {
            let addr = self.pool.alloc_pages(1).ok_or(Error::NoMemory)?;
            let mut slots = Vec::new();
            slots.resize_with(DOMAINS_PER_PAGE as usize, DomainSlot::default);
            domains.table[idx] = Some(SlotPage { _addr: addr, slots });
        }
        Ok(&mut domains.table[idx].as_mut().unwrap().slots[(domain % DOMAINS_PER_PAGE) as usize])
    }

    fn slot_ref<'a>(
        &self,
        iommus: &'a MutexGuard<'_, HashMap<IommuId, IommuDomains>>,
        iommu: IommuId,
        domain: DomainId,
    ) -> Option<&'a DomainSlot> {
        let domains = iommus.get(&iommu)?;
        let page = domains.table.get((domain / DOMAINS_PER_PAGE) as usize)?.as_ref()?;
        page.slots.get((domain % DOMAINS_PER_PAGE) as usize)
    }
}
