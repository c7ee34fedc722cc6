// Copyright © 2026 The Guest Memory Plane Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Pinning and demand paging of guest memory.

use hypercall::{Error, Result};
use vm_memory::{Address, GuestAddress};

use crate::host::PinnedHostPage;
use crate::vcpu::{ExitReason, FaultAction, Vcpu};
use crate::vm::{MemAllocMode, Memslot, Vm};
use crate::{PAGE_SHIFT, PAGE_SIZE};

/// A host page locked in memory and mapped at a specific IPA.
pub(crate) struct PinnedPage {
    pub page: PinnedHostPage,
    pub ipa: u64,
}

impl Vm {
    /// Pin the host page backing `hva` and record it at `ipa`.
    ///
    /// Two vCPUs faulting the same IPA race here by design: the loser
    /// finds the winner's entry, releases its own pin and succeeds with
    /// the existing frame.
    fn pin_one_page(&self, hva: u64, ipa: u64) -> Result<u64> {
        let page = self.host_mem().pin_page(hva)?;
        let pfn = page.pfn();

        let mut pages = self.pinned_pages.lock().unwrap();
        if let Some(existing) = pages.get(&ipa) {
            let existing_pfn = existing.page.pfn();
            drop(pages);
            self.host_mem().unpin_page(page, false);
            return Ok(existing_pfn);
        }
        pages.insert(ipa, PinnedPage { page, ipa });
        Ok(pfn)
    }

    /// Translate a GFN through its slot and pin the backing page.
    pub(crate) fn allocate_guest_page(&self, slot: &Memslot, gfn: u64) -> Result<u64> {
        let hva = slot.gfn_to_hva(gfn)?;
        self.pin_one_page(hva, gfn << PAGE_SHIFT)
    }

    fn handle_single_demand_page(&self, slot: &Memslot, gfn: u64) -> Result<()> {
        let pfn = self.allocate_guest_page(slot, gfn).map_err(fault_unless_interrupted)?;
        self.hyp()
            .map_guest(self.vm_id(), slot.slot_id, pfn, gfn, 1)
            .map_err(|_| Error::Fault)
    }

    fn handle_block_demand_page(&self, slot: &Memslot, gfn: u64) -> Result<()> {
        let nr_entries = self.demand_page_gran() / PAGE_SIZE;
        let mut start_gfn = gfn & !(nr_entries - 1);
        let mut nr = nr_entries;

        // Clip the block against the slot it faulted in.
        if start_gfn < slot.base_gfn {
            start_gfn = slot.base_gfn;
        }
        if start_gfn + nr > slot.end_gfn() {
            nr = slot.end_gfn() - start_gfn;
        }

        let mut buffer = self.demand_page_buffer.lock().unwrap();
        buffer.clear();
        for i in 0..nr {
            let pfn = self
                .allocate_guest_page(slot, start_gfn + i)
                .map_err(|e| {
                    warn!(
                        "vm-{} failed to allocate page for gfn {:#x}: {e}",
                        self.vm_id(),
                        start_gfn + i
                    );
                    fault_unless_interrupted(e)
                })?;
            buffer.push(pfn);
        }

        self.hyp()
            .map_guest_block(self.vm_id(), slot.slot_id, start_gfn, nr)
            .map_err(|_| Error::Fault)
    }

    /// Find the page for a faulting GPA and map it into the guest.
    pub fn handle_page_fault(&self, vcpu: &Vcpu) -> Result<()> {
        let gpa = vcpu.run.lock().unwrap().fault_gpa;
        let gfn = gpa.raw_value() >> PAGE_SHIFT;

        let slot = self.find_memslot(gfn).ok_or(Error::Fault)?;

        if self.mem_alloc_mode() == MemAllocMode::FullyPopulated {
            return Err(Error::Fault);
        }

        if self.demand_page_gran() == PAGE_SIZE {
            self.handle_single_demand_page(&slot, gfn)
        } else {
            self.handle_block_demand_page(&slot, gfn)
        }
    }

    /// The hypervisor reclaimed a page from the guest; release our pin.
    /// There is nothing to fail: an unknown IPA simply means the page was
    /// never pinned (or already released).
    pub fn handle_relinquish(&self, ipa: GuestAddress) -> Result<()> {
        let removed = self.pinned_pages.lock().unwrap().remove(&ipa.raw_value());
        if let Some(pinned) = removed {
            self.host_mem().unpin_page(pinned.page, true);
        }
        Ok(())
    }

    /// Dispatch one guest exit.
    pub fn handle_guest_exception(&self, vcpu: &Vcpu) -> FaultAction {
        let exit_reason = vcpu.run.lock().unwrap().exit_reason;
        match exit_reason {
            ExitReason::PageFault => match self.handle_page_fault(vcpu) {
                Ok(()) => FaultAction::Handled,
                Err(Error::Interrupted) => FaultAction::Retry,
                Err(_) => FaultAction::Fault,
            },
            _ => FaultAction::Fault,
        }
    }

    /// Release every pinned page whose IPA falls in `[start, end)`.
    pub(crate) fn unpin_range(&self, start: u64, end: u64) {
        let mut pages = self.pinned_pages.lock().unwrap();
        let ipas: Vec<u64> = pages.range(start..end).map(|(ipa, _)| *ipa).collect();
        for ipa in ipas {
            if let Some(pinned) = pages.remove(&ipa) {
                self.host_mem().unpin_page(pinned.page, true);
            }
        }
    }

    pub(crate) fn unpin_all(&self) {
        let mut pages = self.pinned_pages.lock().unwrap();
        while let Some((_, pinned)) = pages.pop_first() {
            debug!("vm-{} releasing page at ipa {:#x}", self.vm_id(), pinned.ipa);
            self.host_mem().unpin_page(pinned.page, true);
        }
    }
}

fn fault_unless_interrupted(e: Error) -> Error {
    match e {
        Error::Interrupted => Error::Interrupted,
        _ => Error::Fault,
    }
}
