// Copyright © 2026 The Guest Memory Plane Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::BTreeMap;
use std::sync::Mutex;

use hypercall::{Error, Result};
use iommu::DmaOwnership;

use crate::{PAGE_SHIFT, PAGE_SIZE};

/// Refcounted record of host frames surrendered for device DMA.
///
/// The IOMMU layer marks a range here before a mapping to it becomes
/// visible and clears the marking as mappings are torn down, so at any
/// point the host knows exactly which of its frames a device may write.
pub struct DmaPageTracker {
    frames: Mutex<BTreeMap<u64, u64>>,
}

impl Default for DmaPageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaPageTracker {
    pub fn new() -> Self {
        DmaPageTracker {
            frames: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn in_dma_use(&self, paddr: u64) -> bool {
        self.frames
            .lock()
            .unwrap()
            .contains_key(&(paddr >> PAGE_SHIFT))
    }

    pub fn used_frames(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    fn frame_range(paddr: u64, size: u64) -> Result<std::ops::Range<u64>> {
        if size == 0 || paddr % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
            return Err(Error::Range);
        }
        let end = paddr.checked_add(size).ok_or(Error::Range)?;
        Ok((paddr >> PAGE_SHIFT)..(end >> PAGE_SHIFT))
    }
}

impl DmaOwnership for DmaPageTracker {
    fn use_range(&self, paddr: u64, size: u64) -> Result<()> {
        let range = Self::frame_range(paddr, size)?;
        let mut frames = self.frames.lock().unwrap();
        for frame in range {
            *frames.entry(frame).or_insert(0) += 1;
        }
        Ok(())
    }

    fn unuse_range(&self, paddr: u64, size: u64) -> Result<()> {
        let range = Self::frame_range(paddr, size)?;
        let mut frames = self.frames.lock().unwrap();
        for frame in range.clone() {
            if !frames.contains_key(&frame) {
                error!("dma release of unused frame {frame:#x}");
                return Err(Error::Invalid);
            }
        }
        for frame in range {
            let count = frames.get_mut(&frame).unwrap();
            *count -= 1;
            if *count == 0 {
                frames.remove(&frame);
            }
        }
        Ok(())
    }
}
