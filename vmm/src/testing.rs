// Copyright © 2026 The Guest Memory Plane Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Hypervisor model shared by the crate's tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use hypercall::{HypercallOp, HypercallRet, HypercallTransport, Hypervisor};

use crate::host::testing::FakeHostMemory;
use crate::vm::VmManager;

/// Records every guest-memory hypercall and hands out VM ids starting at
/// seven.
pub(crate) struct TestHypervisor {
    next_vm_id: AtomicU64,
    pub destroyed: Mutex<Vec<u16>>,
    /// `(vm_id, slot, pfn, gfn, nr_pages)` per `MapGuest`.
    pub maps: Mutex<Vec<(u16, u32, u64, u64, u64)>>,
    /// `(vm_id, slot, gfn, nr_pages)` per `MapGuestBlock`.
    pub block_maps: Mutex<Vec<(u16, u32, u64, u64)>>,
    /// `(vm_id, buf_size, region)` per `SetMemregion`.
    pub memregions: Mutex<Vec<(u16, u64, u64)>>,
    /// `(vm_id, cap)` per `EnableCap`.
    pub caps: Mutex<Vec<(u16, u64)>>,
    pub fail_map_guest: AtomicBool,
}

impl TestHypervisor {
    pub fn new() -> Self {
        TestHypervisor {
            next_vm_id: AtomicU64::new(7),
            destroyed: Mutex::new(Vec::new()),
            maps: Mutex::new(Vec::new()),
            block_maps: Mutex::new(Vec::new()),
            memregions: Mutex::new(Vec::new()),
            caps: Mutex::new(Vec::new()),
            fail_map_guest: AtomicBool::new(false),
        }
    }
}

impl HypercallTransport for TestHypervisor {
    fn hypcall(&self, op: HypercallOp, args: [u64; 8]) -> HypercallRet {
        match op {
            HypercallOp::Probe => HypercallRet::ok(0, 0, 0),
            HypercallOp::CreateVm => {
                let id = self.next_vm_id.fetch_add(1, Ordering::SeqCst);
                HypercallRet::ok(id, 0, 0)
            }
            HypercallOp::DestroyVm => {
                self.destroyed.lock().unwrap().push(args[0] as u16);
                HypercallRet::ok(0, 0, 0)
            }
            HypercallOp::MapGuest => {
                if self.fail_map_guest.load(Ordering::SeqCst) {
                    return HypercallRet::error(-40);
                }
                self.maps.lock().unwrap().push((
                    args[0] as u16,
                    args[1] as u32,
                    args[2],
                    args[3],
                    args[4],
                ));
                HypercallRet::ok(0, 0, 0)
            }
            HypercallOp::MapGuestBlock => {
                self.block_maps.lock().unwrap().push((
                    args[0] as u16,
                    args[1] as u32,
                    args[2],
                    args[3],
                ));
                HypercallRet::ok(0, 0, 0)
            }
            HypercallOp::SetMemregion => {
                self.memregions
                    .lock()
                    .unwrap()
                    .push((args[0] as u16, args[1], args[2]));
                HypercallRet::ok(0, 0, 0)
            }
            HypercallOp::EnableCap => {
                self.caps.lock().unwrap().push((args[0] as u16, args[1]));
                HypercallRet::ok(0x9_0000, 0, 0)
            }
            HypercallOp::GetStatistics => HypercallRet::ok(0x10_0000, 0x4000, 0),
            HypercallOp::InformExit => HypercallRet::ok(0, 0, 0),
            HypercallOp::UnmapGuest => HypercallRet::ok(0, 0, 0),
            _ => HypercallRet::error(-24),
        }
    }
}

pub(crate) struct Fixture {
    pub transport: Arc<TestHypervisor>,
    pub host_mem: Arc<FakeHostMemory>,
    pub manager: VmManager,
}

pub(crate) fn fixture() -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let transport = Arc::new(TestHypervisor::new());
    let host_mem = Arc::new(FakeHostMemory::new());
    let hyp = Arc::new(Hypervisor::new(transport.clone()));
    let manager = VmManager::new(hyp, host_mem.clone()).unwrap();
    Fixture {
        transport,
        host_mem,
        manager,
    }
}
