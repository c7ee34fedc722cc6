// Copyright © 2026 The Guest Memory Plane Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use hypercall::{
    Error, Hypervisor, Result, CAP_BLOCK_BASED_DEMAND_PAGING, CAP_ENABLE_DEMAND_PAGING,
    CAP_PROTECTED_VM, INVALID_VM_ID, PVM_GET_PVMFW_SIZE, PVM_SET_PROTECTED_VM, PVM_SET_PVMFW_GPA,
};

use crate::host::HostMemory;
use crate::mmu::PinnedPage;
use crate::vcpu::Vcpu;
use crate::{BLOCK_BASED_DEMAND_PAGE_SIZE, MAX_MEM_REGIONS, MAX_VCPUS, PAGE_SHIFT, PAGE_SIZE};

/// Scratch buffer handed to the hypervisor when populating regions.
const REGION_BUF_SIZE: usize = 2 * PAGE_SIZE as usize;
/// Constituent runs fitting the buffer after its header.
const MAX_NR_CONSTITUENTS: usize = (REGION_BUF_SIZE - 32) / 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAllocMode {
    FullyPopulated,
    DemandPaging,
}

/// A contiguous region of guest physical address space backed by host
/// virtual memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Memslot {
    pub base_gfn: u64,
    pub npages: u64,
    pub userspace_addr: u64,
    pub flags: u32,
    pub slot_id: u32,
}

impl Memslot {
    pub fn end_gfn(&self) -> u64 {
        self.base_gfn + self.npages
    }

    pub fn contains(&self, gfn: u64) -> bool {
        gfn >= self.base_gfn && gfn < self.end_gfn()
    }

    pub fn gfn_to_hva(&self, gfn: u64) -> Result<u64> {
        if !self.contains(gfn) {
            return Err(Error::Invalid);
        }
        self.userspace_addr
            .checked_add((gfn - self.base_gfn) << PAGE_SHIFT)
            .ok_or(Error::Invalid)
    }
}

/// One run of physically contiguous pages reported to the hypervisor when
/// populating a region up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Constituent {
    address: u64,
    pg_cnt: u32,
}

/// A protected virtual machine and the host memory backing it.
pub struct Vm {
    vm_id: u16,
    hyp: Arc<Hypervisor>,
    host_mem: Arc<dyn HostMemory>,
    mem_alloc_mode: MemAllocMode,
    demand_page_gran: u64,
    pub(crate) memslots: Mutex<Vec<Memslot>>,
    /// Ordered by IPA so region teardown can walk a contiguous range.
    pub(crate) pinned_pages: Mutex<BTreeMap<u64, PinnedPage>>,
    /// PFNs of the block being faulted in; one block at a time.
    pub(crate) demand_page_buffer: Mutex<Vec<u64>>,
    is_dying: AtomicBool,
    vcpus: Mutex<Vec<Arc<Vcpu>>>,
}

impl Vm {
    pub fn vm_id(&self) -> u16 {
        self.vm_id
    }

    pub fn mem_alloc_mode(&self) -> MemAllocMode {
        self.mem_alloc_mode
    }

    pub fn demand_page_gran(&self) -> u64 {
        self.demand_page_gran
    }

    pub fn is_dying(&self) -> bool {
        self.is_dying.load(Ordering::Acquire)
    }

    pub(crate) fn hyp(&self) -> &Arc<Hypervisor> {
        &self.hyp
    }

    pub(crate) fn host_mem(&self) -> &Arc<dyn HostMemory> {
        &self.host_mem
    }

    /// Install a memory slot. Slots may not overlap in GFN space and slot
    /// ids are unique per VM.
    pub fn set_memslot(&self, slot: Memslot) -> Result<()> {
        if slot.npages == 0 || slot.base_gfn.checked_add(slot.npages).is_none() {
            return Err(Error::Invalid);
        }
        let mut slots = self.memslots.lock().unwrap();
        if slots.len() >= MAX_MEM_REGIONS {
            return Err(Error::NoMemory);
        }
        for existing in slots.iter() {
            if existing.slot_id == slot.slot_id
                || (slot.base_gfn < existing.end_gfn() && existing.base_gfn < slot.end_gfn())
            {
                return Err(Error::Invalid);
            }
        }
        slots.push(slot);
        Ok(())
    }

    /// Remove a slot, releasing every page pinned within it.
    pub fn remove_memslot(&self, slot_id: u32) -> Result<()> {
        let mut slots = self.memslots.lock().unwrap();
        let pos = slots
            .iter()
            .position(|s| s.slot_id == slot_id)
            .ok_or(Error::Invalid)?;
        let slot = slots.remove(pos);
        drop(slots);

        self.unpin_range(slot.base_gfn << PAGE_SHIFT, slot.end_gfn() << PAGE_SHIFT);
        Ok(())
    }

    pub fn find_memslot(&self, gfn: u64) -> Option<Memslot> {
        self.memslots
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.contains(gfn))
            .copied()
    }

    pub fn create_vcpu(self: &Arc<Self>, vcpuid: u32) -> Result<Arc<Vcpu>> {
        let mut vcpus = self.vcpus.lock().unwrap();
        if vcpus.len() >= MAX_VCPUS || vcpus.iter().any(|v| v.vcpuid() == vcpuid) {
            return Err(Error::Invalid);
        }
        let vcpu = Arc::new(Vcpu::new(Arc::downgrade(self), vcpuid));
        vcpus.push(vcpu.clone());
        Ok(vcpu)
    }

    /// Enable a VM capability, forwarding to the hypervisor.
    ///
    /// Enabling protection on a hypervisor without block-based demand
    /// paging populates all memory up front, since the protected guest
    /// cannot fault pages in efficiently afterwards.
    pub fn enable_cap(&self, cap: u64, args: [u64; 5]) -> Result<u64> {
        match cap {
            CAP_PROTECTED_VM => match args[0] {
                PVM_SET_PVMFW_GPA | PVM_SET_PROTECTED_VM => {
                    if self.demand_page_gran == PAGE_SIZE {
                        self.populate_all_regions()?;
                    }
                    self.hyp.enable_cap(self.vm_id, cap, args)
                }
                PVM_GET_PVMFW_SIZE => self.hyp.enable_cap(self.vm_id, cap, args),
                _ => Err(Error::Invalid),
            },
            CAP_ENABLE_DEMAND_PAGING | CAP_BLOCK_BASED_DEMAND_PAGING => {
                self.hyp.enable_cap(self.vm_id, cap, args)
            }
            _ => Err(Error::Invalid),
        }
    }

    /// Pin and report one slot's memory to the hypervisor, merging
    /// physically contiguous pages into constituent runs.
    pub fn populate_region(&self, slot_id: u32) -> Result<()> {
        let slot = {
            let slots = self.memslots.lock().unwrap();
            slots
                .iter()
                .find(|s| s.slot_id == slot_id)
                .copied()
                .ok_or(Error::Invalid)?
        };

        let mut gfn = slot.base_gfn;
        let gfn_end = slot.end_gfn();
        while gfn < gfn_end {
            let (constituents, nr_pages) =
                self.fill_constituents(&slot, gfn, gfn_end - gfn, MAX_NR_CONSTITUENTS)?;
            if nr_pages == 0 {
                error!("vm-{} failed to fill constituents", self.vm_id);
                return Err(Error::Fault);
            }
            debug_assert_eq!(
                constituents.iter().map(|c| u64::from(c.pg_cnt)).sum::<u64>(),
                nr_pages
            );
            if let Some(first) = constituents.first() {
                debug!(
                    "vm-{} slot {}: {} pages in {} runs from {:#x}",
                    self.vm_id,
                    slot.slot_id,
                    nr_pages,
                    constituents.len(),
                    first.address
                );
            }
            let region = constituents.as_ptr() as u64;
            if self
                .hyp
                .set_memregion(self.vm_id, REGION_BUF_SIZE, region)
                .is_err()
            {
                error!("vm-{} failed to register memregion", self.vm_id);
                return Err(Error::Fault);
            }
            gfn += nr_pages;
        }
        Ok(())
    }

    pub fn populate_all_regions(&self) -> Result<()> {
        let slot_ids: Vec<u32> = {
            let slots = self.memslots.lock().unwrap();
            slots
                .iter()
                .filter(|s| s.npages > 0)
                .map(|s| s.slot_id)
                .collect()
        };
        for slot_id in slot_ids {
            self.populate_region(slot_id)?;
        }
        Ok(())
    }

    /// Populate the constituent buffer until it is full or the range ends.
    /// Returns the runs and how many pages they cover.
    fn fill_constituents(
        &self,
        slot: &Memslot,
        gfn: u64,
        total_pages: u64,
        max_nr_consti: usize,
    ) -> Result<(Vec<Constituent>, u64)> {
        if total_pages == 0 {
            return Err(Error::Invalid);
        }

        let mut constituents: Vec<Constituent> = Vec::new();
        let mut nr_pages = 0;
        let mut prev_pfn = 0;
        let gfn_end = gfn + total_pages;
        let mut gfn = gfn;

        while gfn < gfn_end {
            let pfn = self.allocate_guest_page(slot, gfn).map_err(|_| Error::Fault)?;
            match constituents.last_mut() {
                Some(last) if pfn == prev_pfn + 1 => last.pg_cnt += 1,
                _ => {
                    if constituents.len() == max_nr_consti {
                        break;
                    }
                    constituents.push(Constituent {
                        address: pfn << PAGE_SHIFT,
                        pg_cnt: 1,
                    });
                }
            }
            prev_pfn = pfn;
            gfn += 1;
            nr_pages += 1;
        }

        Ok((constituents, nr_pages))
    }

    /// Protected and shared hypervisor memory charged to this VM.
    pub fn get_statistics(&self) -> Result<(u64, u64)> {
        self.hyp.get_statistics(self.vm_id)
    }

    pub fn pinned_page_count(&self) -> usize {
        self.pinned_pages.lock().unwrap().len()
    }

    /// Tear the VM down: vCPUs go first, then the hypervisor record, then
    /// every pinned page is released back to the host.
    pub fn destroy(&self) -> Result<()> {
        self.is_dying.store(true, Ordering::Release);
        self.vcpus.lock().unwrap().clear();

        let ret = self.hyp.destroy_vm(self.vm_id);
        if let Err(e) = ret {
            warn!("vm-{} destruction not acknowledged: {e}", self.vm_id);
        }
        self.unpin_all();
        ret
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        // Destroy already drained the map; this only matters for VMs
        // dropped without an explicit teardown.
        self.unpin_all();
    }
}

/// Process-wide list of live VMs.
pub struct VmManager {
    hyp: Arc<Hypervisor>,
    host_mem: Arc<dyn HostMemory>,
    vms: Mutex<Vec<Arc<Vm>>>,
}

impl VmManager {
    /// The hypervisor must answer the probe or the whole memory plane
    /// refuses to start.
    pub fn new(hyp: Arc<Hypervisor>, host_mem: Arc<dyn HostMemory>) -> Result<Self> {
        hyp.probe()?;
        Ok(VmManager {
            hyp,
            host_mem,
            vms: Mutex::new(Vec::new()),
        })
    }

    pub fn create_vm(
        &self,
        vm_type: u64,
        mem_alloc_mode: MemAllocMode,
        demand_page_gran: u64,
    ) -> Result<Arc<Vm>> {
        if demand_page_gran != PAGE_SIZE && demand_page_gran != BLOCK_BASED_DEMAND_PAGE_SIZE {
            return Err(Error::Invalid);
        }
        let vm_id = self.hyp.create_vm(vm_type)?;
        if vm_id == INVALID_VM_ID {
            return Err(Error::Fault);
        }
        let vm = Arc::new(Vm {
            vm_id,
            hyp: self.hyp.clone(),
            host_mem: self.host_mem.clone(),
            mem_alloc_mode,
            demand_page_gran,
            memslots: Mutex::new(Vec::new()),
            pinned_pages: Mutex::new(BTreeMap::new()),
            demand_page_buffer: Mutex::new(Vec::new()),
            is_dying: AtomicBool::new(false),
            vcpus: Mutex::new(Vec::new()),
        });
        self.vms.lock().unwrap().push(vm.clone());
        info!("created vm-{vm_id}");
        Ok(vm)
    }

    pub fn find_vm(&self, vm_id: u16) -> Option<Arc<Vm>> {
        self.vms
            .lock()
            .unwrap()
            .iter()
            .find(|vm| vm.vm_id() == vm_id)
            .cloned()
    }

    pub fn destroy_vm(&self, vm_id: u16) -> Result<()> {
        let vm = {
            let mut vms = self.vms.lock().unwrap();
            let pos = vms
                .iter()
                .position(|vm| vm.vm_id() == vm_id)
                .ok_or(Error::Invalid)?;
            vms.remove(pos)
        };
        vm.destroy()
    }

    pub fn destroy_all(&self) {
        let vms: Vec<Arc<Vm>> = self.vms.lock().unwrap().drain(..).collect();
        for vm in vms {
            if let Err(e) = vm.destroy() {
                warn!("vm-{} teardown failed: {e}", vm.vm_id());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture, Fixture};
    use hypercall::CAP_VM_GPA_SIZE;

    const SLOT_HVA: u64 = 0x7f00_0000_0000;

    fn slot(slot_id: u32, base_gfn: u64, npages: u64) -> Memslot {
        Memslot {
            base_gfn,
            npages,
            userspace_addr: SLOT_HVA + (base_gfn << PAGE_SHIFT),
            flags: 0,
            slot_id,
        }
    }

    fn demand_vm(f: &Fixture) -> Arc<Vm> {
        f.manager
            .create_vm(0, MemAllocMode::DemandPaging, PAGE_SIZE)
            .unwrap()
    }

    #[test]
    fn create_and_destroy_vm() {
        let f = fixture();
        let vm = demand_vm(&f);
        assert_eq!(vm.vm_id(), 7);

        f.manager.destroy_vm(7).unwrap();
        assert_eq!(*f.transport.destroyed.lock().unwrap(), vec![7]);

        // A second destroy of the same id is an argument error.
        assert_eq!(f.manager.destroy_vm(7), Err(Error::Invalid));
        assert_eq!(*f.transport.destroyed.lock().unwrap(), vec![7]);
    }

    #[test]
    fn vm_ids_are_unique_while_alive() {
        let f = fixture();
        let a = demand_vm(&f);
        let b = demand_vm(&f);
        assert_ne!(a.vm_id(), b.vm_id());
        assert!(f.manager.find_vm(a.vm_id()).is_some());
    }

    #[test]
    fn bad_demand_page_granularity_rejected() {
        let f = fixture();
        assert_eq!(
            f.manager
                .create_vm(0, MemAllocMode::DemandPaging, 3 * PAGE_SIZE)
                .err(),
            Some(Error::Invalid)
        );
    }

    #[test]
    fn overlapping_memslots_rejected() {
        let f = fixture();
        let vm = demand_vm(&f);
        vm.set_memslot(slot(0, 0x1000, 0x1000)).unwrap();

        // GFN overlap with a different id.
        assert_eq!(vm.set_memslot(slot(1, 0x1800, 0x1000)), Err(Error::Invalid));
        // Duplicate id without overlap.
        assert_eq!(vm.set_memslot(slot(0, 0x8000, 0x100)), Err(Error::Invalid));
        // Disjoint slot is fine.
        vm.set_memslot(slot(1, 0x4000, 0x100)).unwrap();
    }

    #[test]
    fn memslot_removal_releases_its_pages() {
        let f = fixture();
        let vm = demand_vm(&f);
        vm.set_memslot(slot(0, 0x1000, 0x100)).unwrap();
        vm.set_memslot(slot(1, 0x4000, 0x100)).unwrap();

        let slots = [vm.find_memslot(0x1000).unwrap(), vm.find_memslot(0x4000).unwrap()];
        for s in &slots {
            vm.allocate_guest_page(s, s.base_gfn).unwrap();
        }
        assert_eq!(vm.pinned_page_count(), 2);

        vm.remove_memslot(0).unwrap();
        assert_eq!(vm.pinned_page_count(), 1);
        assert_eq!(f.host_mem.outstanding_pins(), 1);
        assert_eq!(vm.remove_memslot(0), Err(Error::Invalid));
    }

    #[test]
    fn vcpu_limits_enforced() {
        let f = fixture();
        let vm = demand_vm(&f);
        for i in 0..MAX_VCPUS as u32 {
            vm.create_vcpu(i).unwrap();
        }
        assert_eq!(vm.create_vcpu(99).err(), Some(Error::Invalid));

        let vm2 = demand_vm(&f);
        vm2.create_vcpu(0).unwrap();
        assert_eq!(vm2.create_vcpu(0).err(), Some(Error::Invalid));
    }

    #[test]
    fn populate_merges_contiguous_runs() {
        let f = fixture();
        let vm = demand_vm(&f);
        vm.set_memslot(slot(0, 0x1000, 4)).unwrap();

        vm.populate_region(0).unwrap();

        // Contiguous host frames collapse into one constituent run, so a
        // single region registration covers the slot.
        assert_eq!(vm.pinned_page_count(), 4);
        assert_eq!(f.host_mem.outstanding_pins(), 4);
        let regions = f.transport.memregions.lock().unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].0, vm.vm_id());
        assert_eq!(regions[0].1, REGION_BUF_SIZE as u64);
    }

    #[test]
    fn enabling_protection_populates_page_granular_vms() {
        let f = fixture();
        let vm = demand_vm(&f);
        vm.set_memslot(slot(0, 0x1000, 8)).unwrap();

        vm.enable_cap(CAP_PROTECTED_VM, [PVM_SET_PROTECTED_VM, 0, 0, 0, 0])
            .unwrap();

        assert_eq!(vm.pinned_page_count(), 8);
        assert!(!f.transport.memregions.lock().unwrap().is_empty());
        assert_eq!(
            *f.transport.caps.lock().unwrap(),
            vec![(vm.vm_id(), CAP_PROTECTED_VM)]
        );
    }

    #[test]
    fn block_granular_vms_are_not_prepopulated() {
        let f = fixture();
        let vm = f
            .manager
            .create_vm(0, MemAllocMode::DemandPaging, BLOCK_BASED_DEMAND_PAGE_SIZE)
            .unwrap();
        vm.set_memslot(slot(0, 0x1000, 8)).unwrap();

        vm.enable_cap(CAP_PROTECTED_VM, [PVM_SET_PROTECTED_VM, 0, 0, 0, 0])
            .unwrap();
        assert_eq!(vm.pinned_page_count(), 0);
        assert!(f.transport.memregions.lock().unwrap().is_empty());
    }

    #[test]
    fn unknown_caps_rejected() {
        let f = fixture();
        let vm = demand_vm(&f);
        assert_eq!(vm.enable_cap(0xdead, [0; 5]), Err(Error::Invalid));
        assert_eq!(
            vm.enable_cap(CAP_PROTECTED_VM, [0xdead, 0, 0, 0, 0]),
            Err(Error::Invalid)
        );
        // Unhandled here, but a real capability.
        assert_eq!(vm.enable_cap(CAP_VM_GPA_SIZE, [0; 5]), Err(Error::Invalid));
    }

    #[test]
    fn teardown_releases_every_pin() {
        let f = fixture();
        let vm = demand_vm(&f);
        vm.set_memslot(slot(0, 0x1000, 0x10)).unwrap();
        let s = vm.find_memslot(0x1000).unwrap();
        for gfn in 0x1000..0x1010 {
            vm.allocate_guest_page(&s, gfn).unwrap();
        }
        assert_eq!(f.host_mem.outstanding_pins(), 0x10);

        let vm_id = vm.vm_id();
        drop(vm);
        f.manager.destroy_vm(vm_id).unwrap();

        assert_eq!(f.host_mem.outstanding_pins(), 0);
        assert_eq!(f.host_mem.total_pins(), f.host_mem.total_unpins());
        assert_eq!(*f.transport.destroyed.lock().unwrap(), vec![vm_id]);
    }

    #[test]
    fn statistics_come_from_the_hypervisor() {
        let f = fixture();
        let vm = demand_vm(&f);
        assert_eq!(vm.get_statistics(), Ok((0x10_0000, 0x4000)));
    }
}
