// Copyright © 2026 The Guest Memory Plane Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

struct PoolInner {
    /// Donated frames currently free for page-table use.
    free: Vec<u64>,
    /// Frames handed out, keyed by the head frame of the allocation.
    live: HashMap<u64, Vec<u64>>,
    /// Every frame the host has donated, for idempotence.
    donated: HashSet<u64>,
    needs_refill: bool,
}

/// Pool of host-donated page frames backing page-table allocations.
///
/// The host donates frames one page at a time (`refill`) and takes them
/// back the same way (`reclaim`). When an allocation finds the pool empty
/// it fails and raises the refill request; the caller backs out and the
/// host retries the operation after donating more memory.
pub struct PagePool {
    inner: Mutex<PoolInner>,
}

impl Default for PagePool {
    fn default() -> Self {
        Self::new()
    }
}

impl PagePool {
    pub fn new() -> Self {
        PagePool {
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                live: HashMap::new(),
                donated: HashSet::new(),
                needs_refill: false,
            }),
        }
    }

    /// Take `npages` frames out of the pool. Returns the physical address
    /// of the allocation head, or `None` (with the refill request raised)
    /// when the pool cannot satisfy the allocation.
    pub fn alloc_pages(&self, npages: usize) -> Option<u64> {
        let mut inner = self.inner.lock().unwrap();
        if inner.free.len() < npages || npages == 0 {
            inner.needs_refill = true;
            return None;
        }
        let at = inner.free.len() - npages;
        let frames: Vec<u64> = inner.free.split_off(at);
        let head = frames[0];
        inner.live.insert(head, frames);
        Some(head << PAGE_SHIFT)
    }

    /// Return an allocation identified by its head address.
    pub fn free_pages(&self, addr: u64) {
        let mut inner = self.inner.lock().unwrap();
        match inner.live.remove(&(addr >> PAGE_SHIFT)) {
            Some(frames) => inner.free.extend(frames),
            None => warn!("free of unknown page-table allocation {addr:#x}"),
        }
    }

    /// Donate host frames to the pool. Frames already donated are ignored
    /// so a host retrying a failed call cannot double-fill the pool.
    pub fn refill<I: IntoIterator<Item = u64>>(&self, pfns: I) {
        let mut inner = self.inner.lock().unwrap();
        for pfn in pfns {
            if inner.donated.insert(pfn) {
                inner.free.push(pfn);
            }
        }
        inner.needs_refill = false;
    }

    /// Give free frames back to the host, at most `target` of them.
    pub fn reclaim(&self, target: usize) -> Vec<u64> {
        let mut inner = self.inner.lock().unwrap();
        let n = target.min(inner.free.len());
        let at = inner.free.len() - n;
        let frames = inner.free.split_off(at);
        for pfn in &frames {
            inner.donated.remove(pfn);
        }
        frames
    }

    /// Read and clear the refill request.
    pub fn take_refill_request(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        std::mem::take(&mut inner.needs_refill)
    }

    pub fn free_frames(&self) -> usize {
        self.inner.lock().unwrap().free.len()
    }
}
