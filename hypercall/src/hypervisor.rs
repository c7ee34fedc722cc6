// Copyright © 2026 The Guest Memory Plane Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{status_to_result, Error, Result};
use crate::ops::{HypercallOp, HypercallRet};

/// The single primitive through which the hypervisor is reached.
///
/// Implementations issue the platform conduit instruction (or emulate it in
/// tests); they do not interpret arguments or results.
pub trait HypercallTransport: Send + Sync {
    fn hypcall(&self, op: HypercallOp, args: [u64; 8]) -> HypercallRet;
}

/// Typed hypercall surface with the probe gate.
///
/// Every call other than `probe` returns [`Error::Unavailable`] until a
/// probe has succeeded, so a missing or incompatible hypervisor is caught
/// once at initialization instead of at each call site.
pub struct Hypervisor {
    transport: Arc<dyn HypercallTransport>,
    probed: AtomicBool,
}

impl Hypervisor {
    pub fn new(transport: Arc<dyn HypercallTransport>) -> Self {
        Hypervisor {
            transport,
            probed: AtomicBool::new(false),
        }
    }

    fn call(&self, op: HypercallOp, args: [u64; 8]) -> Result<HypercallRet> {
        if !self.probed.load(Ordering::Acquire) {
            return Err(Error::Unavailable);
        }
        let ret = self.transport.hypcall(op, args);
        status_to_result(ret.status)?;
        Ok(ret)
    }

    /// Ask the hypervisor whether it speaks this protocol at all.
    pub fn probe(&self) -> Result<()> {
        let ret = self.transport.hypcall(HypercallOp::Probe, [0; 8]);
        if let Err(e) = status_to_result(ret.status) {
            warn!("hypervisor probe failed: {e}");
            return Err(e);
        }
        self.probed.store(true, Ordering::Release);
        Ok(())
    }

    pub fn create_vm(&self, vm_type: u64) -> Result<u16> {
        let ret = self.call(HypercallOp::CreateVm, [vm_type, 0, 0, 0, 0, 0, 0, 0])?;
        Ok(ret.r1 as u16)
    }

    pub fn destroy_vm(&self, vm_id: u16) -> Result<()> {
        self.call(HypercallOp::DestroyVm, [vm_id as u64, 0, 0, 0, 0, 0, 0, 0])?;
        Ok(())
    }

    /// Hand the hypervisor a buffer of memory-region constituents.
    pub fn set_memregion(&self, vm_id: u16, buf_size: usize, region_phys: u64) -> Result<()> {
        self.call(
            HypercallOp::SetMemregion,
            [vm_id as u64, buf_size as u64, region_phys, 0, 0, 0, 0, 0],
        )?;
        Ok(())
    }

    /// Enable a capability; the first result register carries
    /// capability-specific data.
    pub fn enable_cap(&self, vm_id: u16, cap: u64, args: [u64; 5]) -> Result<u64> {
        let ret = self.call(
            HypercallOp::EnableCap,
            [
                vm_id as u64,
                cap,
                args[0],
                args[1],
                args[2],
                args[3],
                args[4],
                0,
            ],
        )?;
        Ok(ret.r1)
    }

    /// Map `nr_pages` host pages starting at `pfn` into the guest at `gfn`.
    pub fn map_guest(&self, vm_id: u16, memslot_id: u32, pfn: u64, gfn: u64, nr_pages: u64) -> Result<()> {
        self.call(
            HypercallOp::MapGuest,
            [vm_id as u64, memslot_id as u64, pfn, gfn, nr_pages, 0, 0, 0],
        )?;
        Ok(())
    }

    /// Map a whole demand-paging block; the host has already parked the page
    /// frames in the shared buffer.
    pub fn map_guest_block(&self, vm_id: u16, memslot_id: u32, gfn: u64, nr_pages: u64) -> Result<()> {
        self.call(
            HypercallOp::MapGuestBlock,
            [vm_id as u64, memslot_id as u64, gfn, nr_pages, 0, 0, 0, 0],
        )?;
        Ok(())
    }

    pub fn unmap_guest(&self, vm_id: u16, gfn: u64, nr_pages: u64) -> Result<()> {
        self.call(
            HypercallOp::UnmapGuest,
            [vm_id as u64, gfn, nr_pages, 0, 0, 0, 0, 0],
        )?;
        Ok(())
    }

    pub fn inform_exit(&self, vm_id: u16) -> Result<()> {
        self.call(HypercallOp::InformExit, [vm_id as u64, 0, 0, 0, 0, 0, 0, 0])?;
        Ok(())
    }

    /// Protected and shared hypervisor memory charged to this VM.
    pub fn get_statistics(&self, vm_id: u16) -> Result<(u64, u64)> {
        let ret = self.call(
            HypercallOp::GetStatistics,
            [vm_id as u64, 0, 0, 0, 0, 0, 0, 0],
        )?;
        Ok((ret.r1, ret.r2))
    }

    /// Guard granule and feature bits.
    pub fn mmio_guard_info(&self) -> Result<(u64, u64)> {
        let ret = self.call(HypercallOp::MmioGuardInfo, [0; 8])?;
        Ok((ret.r1, ret.r2))
    }

    pub fn mmio_guard_enroll(&self) -> Result<()> {
        self.call(HypercallOp::MmioGuardEnroll, [0; 8])?;
        Ok(())
    }

    /// Guard a single granule. Returns the number processed, which is
    /// always one on success.
    pub fn mmio_guard_map(&self, phys: u64) -> Result<u64> {
        self.call(HypercallOp::MmioGuardMap, [phys, 0, 0, 0, 0, 0, 0, 0])?;
        Ok(1)
    }

    pub fn mmio_guard_unmap(&self, phys: u64) -> Result<u64> {
        self.call(HypercallOp::MmioGuardUnmap, [phys, 0, 0, 0, 0, 0, 0, 0])?;
        Ok(1)
    }

    /// Range variant: the hypervisor may process fewer granules than asked
    /// for; the count actually done comes back in the first result register.
    pub fn mmio_rguard_map(&self, phys: u64, nr_granules: u64) -> Result<u64> {
        let ret = self.call(
            HypercallOp::MmioRguardMap,
            [phys, nr_granules, 0, 0, 0, 0, 0, 0],
        )?;
        Ok(ret.r1)
    }

    pub fn mmio_rguard_unmap(&self, phys: u64, nr_granules: u64) -> Result<u64> {
        let ret = self.call(
            HypercallOp::MmioRguardUnmap,
            [phys, nr_granules, 0, 0, 0, 0, 0, 0],
        )?;
        Ok(ret.r1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::MMIO_GUARD_HAS_RANGE;
    use std::sync::Mutex;

    struct RecordingTransport {
        probe_status: i64,
        calls: Mutex<Vec<(HypercallOp, [u64; 8])>>,
    }

    impl RecordingTransport {
        fn new(probe_status: i64) -> Self {
            RecordingTransport {
                probe_status,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl HypercallTransport for RecordingTransport {
        fn hypcall(&self, op: HypercallOp, args: [u64; 8]) -> HypercallRet {
            self.calls.lock().unwrap().push((op, args));
            match op {
                HypercallOp::Probe => HypercallRet::error(self.probe_status),
                HypercallOp::CreateVm => HypercallRet::ok(7, 0, 0),
                HypercallOp::MmioGuardInfo => HypercallRet::ok(0x1000, 1, 0),
                _ => HypercallRet::ok(0, 0, 0),
            }
        }
    }

    #[test]
    fn calls_gated_until_probe() {
        let hyp = Hypervisor::new(Arc::new(RecordingTransport::new(0)));
        assert_eq!(hyp.create_vm(0), Err(Error::Unavailable));
        assert_eq!(hyp.destroy_vm(7), Err(Error::Unavailable));
        hyp.probe().unwrap();
        assert_eq!(hyp.create_vm(0), Ok(7));
    }

    #[test]
    fn probe_failure_keeps_gate_shut() {
        let hyp = Hypervisor::new(Arc::new(RecordingTransport::new(-24)));
        assert_eq!(hyp.probe(), Err(Error::Unsupported));
        assert_eq!(hyp.create_vm(0), Err(Error::Unavailable));
    }

    #[test]
    fn typed_wrappers_marshal_registers() {
        let transport = Arc::new(RecordingTransport::new(0));
        let hyp = Hypervisor::new(transport.clone());
        hyp.probe().unwrap();

        hyp.map_guest(7, 2, 0x1234, 0x1000, 1).unwrap();
        hyp.map_guest_block(7, 2, 0x1e00, 0x200).unwrap();
        let (granule, flags) = hyp.mmio_guard_info().unwrap();
        assert_eq!(granule, 0x1000);
        assert_eq!(flags & MMIO_GUARD_HAS_RANGE, MMIO_GUARD_HAS_RANGE);

        let calls = transport.calls.lock().unwrap();
        assert!(calls.contains(&(
            HypercallOp::MapGuest,
            [7, 2, 0x1234, 0x1000, 1, 0, 0, 0]
        )));
        assert!(calls.contains(&(
            HypercallOp::MapGuestBlock,
            [7, 2, 0x1e00, 0x200, 0, 0, 0, 0]
        )));
    }
}
