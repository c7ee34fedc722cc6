// Copyright © 2026 The Guest Memory Plane Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::io;

use hypercall::{Error, Result};

use crate::{PAGE_SHIFT, PAGE_SIZE};

/// A host page locked in memory on behalf of a guest.
///
/// Releasing it goes back through [`HostMemory::unpin_page`] so the backend
/// can drop its pin and, when asked, mark the page dirty.
#[derive(Debug)]
pub struct PinnedHostPage {
    pfn: u64,
    hva: u64,
}

impl PinnedHostPage {
    pub(crate) fn new(pfn: u64, hva: u64) -> Self {
        PinnedHostPage { pfn, hva }
    }

    pub fn pfn(&self) -> u64 {
        self.pfn
    }

    pub fn hva(&self) -> u64 {
        self.hva
    }
}

/// Long-term pinning of single host pages.
///
/// Pinning may sleep in the host mm and can fail with `Interrupted` when a
/// signal is pending; callers able to retry do so, the fault path turns it
/// into a guest retry.
pub trait HostMemory: Send + Sync {
    fn pin_page(&self, hva: u64) -> Result<PinnedHostPage>;
    fn unpin_page(&self, page: PinnedHostPage, dirty: bool);
}

/// `mlock`-backed pinner for real host mappings.
pub struct MlockHostMemory;

impl HostMemory for MlockHostMemory {
    fn pin_page(&self, hva: u64) -> Result<PinnedHostPage> {
        let addr = (hva & !(PAGE_SIZE - 1)) as *mut libc::c_void;
        // SAFETY: mlock validates the range itself and does not
        // dereference it.
        let ret = unsafe { libc::mlock(addr, PAGE_SIZE as usize) };
        if ret != 0 {
            return Err(match io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => Error::Interrupted,
                Some(libc::ENOMEM) | Some(libc::EAGAIN) => Error::NoMemory,
                _ => Error::Fault,
            });
        }
        Ok(PinnedHostPage::new(hva >> PAGE_SHIFT, hva))
    }

    fn unpin_page(&self, page: PinnedHostPage, _dirty: bool) {
        let addr = (page.hva() & !(PAGE_SIZE - 1)) as *mut libc::c_void;
        // SAFETY: releasing a lock taken in pin_page.
        unsafe {
            libc::munlock(addr, PAGE_SIZE as usize);
        }
    }
}
