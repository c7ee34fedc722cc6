// Copyright © 2026 The Guest Memory Plane Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::{Mutex, Weak};

use hypercall::{Error, Result};
use vm_memory::GuestAddress;

use crate::vm::Vm;

/// Why a vCPU run returned to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitReason {
    #[default]
    Unknown,
    Mmio,
    Status,
    PageFault,
}

/// What the caller should do about a guest page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    Handled,
    Fault,
    Retry,
}

/// Shared run area of one vCPU.
///
/// Written by the core while handling an exit; the caller only reads it
/// once the run has returned.
#[derive(Debug, Clone, Copy)]
pub struct VcpuRun {
    pub exit_reason: ExitReason,
    /// Faulting guest physical address, valid for `PageFault` exits.
    pub fault_gpa: GuestAddress,
    /// Guest hypercall argument registers, valid for hypercall-driven
    /// exits such as memory relinquish.
    pub hypercall_args: [u64; 8],
}

impl Default for VcpuRun {
    fn default() -> Self {
        VcpuRun {
            exit_reason: ExitReason::default(),
            fault_gpa: GuestAddress(0),
            hypercall_args: [0; 8],
        }
    }
}

pub struct Vcpu {
    vm: Weak<Vm>,
    vcpuid: u32,
    pub run: Mutex<VcpuRun>,
}

impl Vcpu {
    pub(crate) fn new(vm: Weak<Vm>, vcpuid: u32) -> Self {
        Vcpu {
            vm,
            vcpuid,
            run: Mutex::new(VcpuRun::default()),
        }
    }

    pub fn vcpuid(&self) -> u32 {
        self.vcpuid
    }

    /// The owning VM. Fails once teardown has dropped the VM record; a
    /// vCPU never keeps its VM alive.
    pub fn vm(&self) -> Result<std::sync::Arc<Vm>> {
        self.vm.upgrade().ok_or(Error::Fault)
    }
}
