// Copyright © 2026 The Guest Memory Plane Authors
//
// SPDX-License-Identifier: Apache-2.0
//

/// The closed set of operations the hypervisor understands.
///
/// Guest lifecycle and memory calls take a VM identifier in the first
/// argument register; the MMIO guard calls are host-global.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HypercallOp {
    Probe,
    CreateVm,
    DestroyVm,
    SetMemregion,
    EnableCap,
    MapGuest,
    MapGuestBlock,
    UnmapGuest,
    InformExit,
    GetStatistics,
    MmioGuardInfo,
    MmioGuardEnroll,
    MmioGuardMap,
    MmioGuardUnmap,
    MmioRguardMap,
    MmioRguardUnmap,
}

/// Result registers of one hypercall: the native status plus up to three
/// payload registers.
#[derive(Debug, Clone, Copy, Default)]
pub struct HypercallRet {
    pub status: i64,
    pub r1: u64,
    pub r2: u64,
    pub r3: u64,
}

impl HypercallRet {
    pub fn ok(r1: u64, r2: u64, r3: u64) -> Self {
        HypercallRet {
            status: 0,
            r1,
            r2,
            r3,
        }
    }

    pub fn error(status: i64) -> Self {
        HypercallRet {
            status,
            ..Default::default()
        }
    }
}

/// Feature bit in the second result register of `MmioGuardInfo`: the
/// hypervisor accepts the range variants of the guard calls.
pub const MMIO_GUARD_HAS_RANGE: u64 = 1 << 0;

// Capabilities negotiated through `EnableCap`.
pub const CAP_VM_GPA_SIZE: u64 = 0xa5;
pub const CAP_PROTECTED_VM: u64 = 0xffba_dab1;
pub const CAP_ENABLE_DEMAND_PAGING: u64 = 0xffba_dab2;
pub const CAP_BLOCK_BASED_DEMAND_PAGING: u64 = 0xffba_dab3;

// Sub-commands of `CAP_PROTECTED_VM`, carried in the first capability
// argument.
pub const PVM_SET_PVMFW_GPA: u64 = 0;
pub const PVM_GET_PVMFW_SIZE: u64 = 1;
pub const PVM_SET_PROTECTED_VM: u64 = 2;
