// Copyright © 2026 The Guest Memory Plane Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! ARM LPAE page table for stage-1 and stage-2 translation.
//!
//! Up to four levels of power-of-two-sized tables. Non-leaf entries point
//! at the next-level table; leaves are blocks or pages. Table memory comes
//! exclusively from the donation pool and goes back to it when a subtree
//! empties out or the table is torn down.

use std::collections::HashMap;
use std::sync::Arc;

use hypercall::{Error, Result};

use crate::pool::{PagePool, PAGE_SIZE};
use crate::IommuProt;

pub type Pte = u64;

pub const MAX_LEVELS: u32 = 4;
const MAX_ADDR_BITS: u32 = 52;
const S2_MAX_CONCAT_ENTRIES: u64 = 16;

const PTE_TYPE_MASK: Pte = 0x3;
const PTE_TYPE_BLOCK: Pte = 1;
const PTE_TYPE_TABLE: Pte = 3;
const PTE_TYPE_PAGE: Pte = 3;

const PTE_ADDR_MASK: Pte = 0x0000_ffff_ffff_f000;

const PTE_XN: Pte = 3 << 53;
const PTE_AF: Pte = 1 << 10;
const PTE_SH_OS: Pte = 2 << 8;
const PTE_SH_IS: Pte = 3 << 8;

// Stage-1 bits.
const PTE_AP_UNPRIV: Pte = 1 << 6;
const PTE_AP_RDONLY: Pte = 2 << 6;
const PTE_NG: Pte = 1 << 11;
const PTE_ATTRINDX_SHIFT: u32 = 2;

// Stage-2 bits.
const PTE_HAP_READ: Pte = 1 << 6;
const PTE_HAP_WRITE: Pte = 2 << 6;
const PTE_MEMATTR_OIWB: Pte = 0xf << 2;
const PTE_MEMATTR_NC: Pte = 0x5 << 2;
const PTE_MEMATTR_DEV: Pte = 0x1 << 2;

const PTE_ATTR_LO_MASK: Pte = 0x3ff << 2;
const PTE_ATTR_HI_MASK: Pte = 6 << 52;
const PTE_ATTR_MASK: Pte = PTE_ATTR_LO_MASK | PTE_ATTR_HI_MASK;

const MAIR_ATTR_IDX_CACHE: Pte = 1;
const MAIR_ATTR_IDX_DEV: Pte = 2;

const SZ_4K: u64 = 4 << 10;
const SZ_16K: u64 = 16 << 10;
const SZ_64K: u64 = 64 << 10;
const SZ_2M: u64 = 2 << 20;
const SZ_32M: u64 = 32 << 20;
const SZ_512M: u64 = 512 << 20;
const SZ_1G: u64 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTableFmt {
    Stage1,
    Stage2,
}

#[derive(Debug, Clone, Copy)]
pub struct PageTableCfg {
    pub fmt: PageTableFmt,
    /// Bitmap of supported leaf sizes; restricted at construction to what
    /// the chosen granule can express.
    pub pgsize_bitmap: u64,
    /// Input (IOVA) address bits.
    pub ias: u32,
    /// Output (physical) address bits.
    pub oas: u32,
}

/// One translation tree. Tables are addressed physically; the backing
/// memory for each is owned here, keyed by its head address.
pub struct PageTable {
    cfg: PageTableCfg,
    bits_per_level: u32,
    start_level: u32,
    pgd_bits: u32,
    pgd: u64,
    tables: HashMap<u64, Vec<Pte>>,
    pool: Arc<PagePool>,
}

impl PageTable {
    pub fn new(mut cfg: PageTableCfg, pool: Arc<PagePool>) -> Result<Self> {
        restrict_pgsizes(&mut cfg);

        if cfg.pgsize_bitmap & (SZ_4K | SZ_16K | SZ_64K) == 0 {
            return Err(Error::Invalid);
        }
        if cfg.ias > MAX_ADDR_BITS || cfg.oas > MAX_ADDR_BITS {
            return Err(Error::Invalid);
        }

        let pg_shift = cfg.pgsize_bitmap.trailing_zeros();
        let bits_per_level = pg_shift - 3;
        let va_bits = cfg.ias - pg_shift;
        let levels = va_bits.div_ceil(bits_per_level);
        let mut start_level = MAX_LEVELS - levels;
        let mut pgd_bits = va_bits - bits_per_level * (levels - 1);

        // Concatenate stage-2 PGDs at level 1 when the level-0 table is
        // small enough, shortening every walk by one level.
        if cfg.fmt == PageTableFmt::Stage2
            && start_level == 0
            && (1u64 << pgd_bits) <= S2_MAX_CONCAT_ENTRIES
        {
            pgd_bits += bits_per_level;
            start_level += 1;
        }

        let entries = 1usize << pgd_bits;
        let npages = (entries * 8).div_ceil(PAGE_SIZE as usize);
        let mut tables = HashMap::new();
        let pgd = pool.alloc_pages(npages).ok_or(Error::NoMemory)?;
        tables.insert(pgd, vec![0; entries]);

        Ok(PageTable {
            cfg,
            bits_per_level,
            start_level,
            pgd_bits,
            pgd,
            tables,
            pool,
        })
    }

    pub fn pgsize_bitmap(&self) -> u64 {
        self.cfg.pgsize_bitmap
    }

    /// Tear the whole tree down, returning every table page to the pool.
    pub fn free(mut self) {
        self.free_subtree(self.pgd, self.start_level);
    }

    /// Map up to `pgcount` leaves of `pgsize` bytes. One call installs at
    /// most one run of entries within a single table; the caller loops on
    /// `mapped` until done. `mapped` advances by the bytes mapped here.
    pub fn map_pages(
        &mut self,
        iova: u64,
        paddr: u64,
        pgsize: u64,
        pgcount: usize,
        prot: IommuProt,
        mapped: &mut usize,
    ) -> Result<()> {
        if pgsize == 0 || pgsize & self.cfg.pgsize_bitmap != pgsize || pgcount == 0 {
            return Err(Error::Invalid);
        }
        if checked_shr(iova, self.cfg.ias) != 0 || checked_shr(paddr, self.cfg.oas) != 0 {
            return Err(Error::Range);
        }
        // No access means nothing to map.
        if !prot.intersects(IommuProt::READ | IommuProt::WRITE) {
            return Ok(());
        }

        let pte_prot = self.prot_to_pte(prot);
        self.do_map(
            iova,
            paddr,
            pgsize,
            pgcount,
            pte_prot,
            self.start_level,
            self.pgd,
            mapped,
        )
    }

    /// Unmap up to `max_pgcount` leaves of `pgsize` bytes starting at
    /// `iova`, invoking `on_unmap(paddr, size)` for every leaf removed.
    /// Returns the bytes unmapped; like mapping, one call covers at most
    /// one run within a single table.
    pub fn unmap_pages_walk(
        &mut self,
        iova: u64,
        pgsize: u64,
        max_pgcount: usize,
        on_unmap: &mut dyn FnMut(u64, u64),
    ) -> u64 {
        if pgsize == 0 || pgsize & self.cfg.pgsize_bitmap != pgsize || max_pgcount == 0 {
            return 0;
        }
        if checked_shr(iova, self.cfg.ias) != 0 {
            return 0;
        }
        self.do_unmap(iova, pgsize, max_pgcount, self.start_level, self.pgd, on_unmap)
    }

    pub fn iova_to_phys(&self, iova: u64) -> u64 {
        let mut lvl = self.start_level;
        let mut table = self.pgd;
        while lvl < MAX_LEVELS {
            let pte = self.read_pte(table, self.lvl_idx(iova, lvl));
            if pte == 0 {
                return 0;
            }
            if self.is_leaf(pte, lvl) {
                return self.pte_to_paddr(pte) | (iova & (self.block_size(lvl) - 1));
            }
            table = self.pte_to_paddr(pte);
            lvl += 1;
        }
        0
    }

    fn granule(&self) -> u64 {
        8 << self.bits_per_level
    }

    fn ptes_per_table(&self) -> usize {
        1 << self.bits_per_level
    }

    fn lvl_shift(&self, lvl: u32) -> u32 {
        (MAX_LEVELS - lvl) * self.bits_per_level + 3
    }

    fn block_size(&self, lvl: u32) -> u64 {
        1 << self.lvl_shift(lvl)
    }

    fn lvl_idx(&self, addr: u64, lvl: u32) -> usize {
        let bits = if lvl == self.start_level {
            self.pgd_bits
        } else {
            self.bits_per_level
        };
        ((addr >> self.lvl_shift(lvl)) & ((1 << bits) - 1)) as usize
    }

    fn table_entries(&self, lvl: u32) -> usize {
        if lvl == self.start_level {
            1 << self.pgd_bits
        } else {
            self.ptes_per_table()
        }
    }

    fn is_leaf(&self, pte: Pte, lvl: u32) -> bool {
        if lvl == MAX_LEVELS - 1 {
            pte & PTE_TYPE_MASK == PTE_TYPE_PAGE
        } else {
            pte & PTE_TYPE_MASK == PTE_TYPE_BLOCK
        }
    }

    fn leaf_type(&self, lvl: u32) -> Pte {
        if lvl == MAX_LEVELS - 1 {
            PTE_TYPE_PAGE
        } else {
            PTE_TYPE_BLOCK
        }
    }

    fn paddr_to_pte(&self, paddr: u64) -> Pte {
        // Of the bits which overlap, either 51:48 or 15:12 are always zero.
        (paddr | (paddr >> (48 - 12))) & PTE_ADDR_MASK
    }

    fn pte_to_paddr(&self, pte: Pte) -> u64 {
        let paddr = pte & PTE_ADDR_MASK;
        if self.granule() < SZ_64K {
            return paddr;
        }
        // Rotate the packed high-order bits back to the top.
        (paddr | (paddr << (48 - 12))) & (PTE_ADDR_MASK << 4)
    }

    fn read_pte(&self, table: u64, idx: usize) -> Pte {
        self.tables[&table][idx]
    }

    fn write_pte(&mut self, table: u64, idx: usize, pte: Pte) {
        self.tables.get_mut(&table).unwrap()[idx] = pte;
    }

    fn alloc_table(&mut self, entries: usize) -> Result<u64> {
        let npages = (entries * 8).div_ceil(PAGE_SIZE as usize);
        let addr = self.pool.alloc_pages(npages).ok_or(Error::NoMemory)?;
        self.tables.insert(addr, vec![0; entries]);
        Ok(addr)
    }

    #[allow(clippy::too_many_arguments)]
    fn do_map(
        &mut self,
        iova: u64,
        paddr: u64,
        size: u64,
        pgcount: usize,
        prot: Pte,
        lvl: u32,
        table: u64,
        mapped: &mut usize,
    ) -> Result<()> {
        let idx = self.lvl_idx(iova, lvl);
        let block = self.block_size(lvl);

        // Install leaves at this level if the size fits.
        if size == block {
            let max_entries = self.table_entries(lvl) - idx;
            let num = pgcount.min(max_entries);

            // Nothing is written until every target entry is known good.
            for i in 0..num {
                let pte = self.read_pte(table, idx + i);
                if self.is_leaf(pte, lvl) {
                    warn!("mapping already exists at iova {:#x}", iova + i as u64 * size);
                    return Err(Error::Invalid);
                }
                if pte != 0 {
                    // An old table hangs here; replace it with the block.
                    let child = self.pte_to_paddr(pte);
                    self.free_subtree(child, lvl + 1);
                    self.write_pte(table, idx + i, 0);
                }
            }
            let leaf = prot | self.leaf_type(lvl);
            for i in 0..num {
                let pa = paddr + i as u64 * size;
                self.write_pte(table, idx + i, leaf | self.paddr_to_pte(pa));
            }
            *mapped += num * size as usize;
            return Ok(());
        }

        if lvl >= MAX_LEVELS - 1 {
            return Err(Error::Invalid);
        }

        let pte = self.read_pte(table, idx);
        let child = if pte == 0 {
            let child = self.alloc_table(self.ptes_per_table())?;
            self.write_pte(
                table,
                idx,
                self.paddr_to_pte(child) | PTE_TYPE_TABLE,
            );
            child
        } else if self.is_leaf(pte, lvl) {
            warn!("mapping already exists at iova {iova:#x}");
            return Err(Error::Invalid);
        } else {
            self.pte_to_paddr(pte)
        };

        self.do_map(iova, paddr, size, pgcount, prot, lvl + 1, child, mapped)
    }

    fn do_unmap(
        &mut self,
        iova: u64,
        size: u64,
        pgcount: usize,
        lvl: u32,
        table: u64,
        on_unmap: &mut dyn FnMut(u64, u64),
    ) -> u64 {
        if lvl == MAX_LEVELS {
            return 0;
        }
        let idx = self.lvl_idx(iova, lvl);
        let pte = self.read_pte(table, idx);
        if pte == 0 {
            return 0;
        }

        // If the size matches this level, we're in the right place.
        if size == self.block_size(lvl) {
            let max_entries = self.table_entries(lvl) - idx;
            let num = pgcount.min(max_entries);
            let mut i = 0;
            while i < num {
                let pte = self.read_pte(table, idx + i);
                if pte == 0 {
                    break;
                }
                self.write_pte(table, idx + i, 0);
                if !self.is_leaf(pte, lvl) {
                    // The entry covered a whole subtree: report every leaf
                    // beneath it, then return its tables to the pool.
                    let child = self.pte_to_paddr(pte);
                    self.walk_subtree(child, lvl + 1, on_unmap);
                    self.free_subtree(child, lvl + 1);
                } else {
                    on_unmap(self.pte_to_paddr(pte), size);
                }
                i += 1;
            }
            return i as u64 * size;
        }

        if self.is_leaf(pte, lvl) {
            // Unmapping a piece of a larger block: split it into a table
            // mapping everything but the piece.
            return self.split_block_unmap(iova, size, pte, lvl + 1, table, idx, pgcount, on_unmap);
        }

        let child = self.pte_to_paddr(pte);
        self.do_unmap(iova, size, pgcount, lvl + 1, child, on_unmap)
    }

    #[allow(clippy::too_many_arguments)]
    fn split_block_unmap(
        &mut self,
        iova: u64,
        size: u64,
        blk_pte: Pte,
        lvl: u32,
        parent: u64,
        parent_idx: usize,
        pgcount: usize,
        on_unmap: &mut dyn FnMut(u64, u64),
    ) -> u64 {
        if lvl == MAX_LEVELS {
            return 0;
        }
        let table = match self.alloc_table(self.ptes_per_table()) {
            Ok(t) => t,
            // Bytes unmapped.
            Err(_) => return 0,
        };

        let split_sz = self.block_size(lvl);
        let entries = self.ptes_per_table();
        let (unmap_start, num) = if size == split_sz {
            let start = self.lvl_idx(iova, lvl);
            (start, pgcount.min(entries - start))
        } else {
            (0, 0)
        };

        let blk_paddr = self.pte_to_paddr(blk_pte);
        let prot = blk_pte & PTE_ATTR_MASK;
        let leaf = prot | self.leaf_type(lvl);
        for i in 0..entries {
            let pa = blk_paddr + i as u64 * split_sz;
            if num > 0 && i >= unmap_start && i < unmap_start + num {
                on_unmap(pa, split_sz);
                continue;
            }
            self.write_pte(table, i, leaf | self.paddr_to_pte(pa));
        }
        self.write_pte(parent, parent_idx, self.paddr_to_pte(table) | PTE_TYPE_TABLE);

        if num > 0 {
            return num as u64 * size;
        }
        self.do_unmap(iova, size, pgcount, lvl, table, on_unmap)
    }

    fn walk_subtree(&self, table: u64, lvl: u32, on_unmap: &mut dyn FnMut(u64, u64)) {
        if lvl == MAX_LEVELS {
            return;
        }
        for idx in 0..self.table_entries(lvl) {
            let pte = self.read_pte(table, idx);
            if pte == 0 {
                continue;
            }
            if self.is_leaf(pte, lvl) {
                on_unmap(self.pte_to_paddr(pte), self.block_size(lvl));
            } else {
                self.walk_subtree(self.pte_to_paddr(pte), lvl + 1, on_unmap);
            }
        }
    }

    fn free_subtree(&mut self, table: u64, lvl: u32) {
        let entries = match self.tables.remove(&table) {
            Some(e) => e,
            None => return,
        };
        if lvl < MAX_LEVELS - 1 {
            for pte in entries {
                if pte != 0 && !self.is_leaf(pte, lvl) {
                    self.free_subtree(self.pte_to_paddr(pte), lvl + 1);
                }
            }
        }
        self.pool.free_pages(table);
    }

    fn prot_to_pte(&self, prot: IommuProt) -> Pte {
        let mut pte;

        match self.cfg.fmt {
            PageTableFmt::Stage1 => {
                pte = PTE_NG;
                if !prot.contains(IommuProt::WRITE) && prot.contains(IommuProt::READ) {
                    pte |= PTE_AP_RDONLY;
                }
                if !prot.contains(IommuProt::PRIV) {
                    pte |= PTE_AP_UNPRIV;
                }
                if prot.contains(IommuProt::MMIO) {
                    pte |= MAIR_ATTR_IDX_DEV << PTE_ATTRINDX_SHIFT;
                } else if prot.contains(IommuProt::CACHE) {
                    pte |= MAIR_ATTR_IDX_CACHE << PTE_ATTRINDX_SHIFT;
                }
            }
            PageTableFmt::Stage2 => {
                pte = 0;
                if prot.contains(IommuProt::READ) {
                    pte |= PTE_HAP_READ;
                }
                if prot.contains(IommuProt::WRITE) {
                    pte |= PTE_HAP_WRITE;
                }
                if prot.contains(IommuProt::MMIO) {
                    pte |= PTE_MEMATTR_DEV;
                } else if prot.contains(IommuProt::CACHE) {
                    pte |= PTE_MEMATTR_OIWB;
                } else {
                    pte |= PTE_MEMATTR_NC;
                }
            }
        }

        if prot.contains(IommuProt::CACHE) {
            pte |= PTE_SH_IS;
        } else {
            pte |= PTE_SH_OS;
        }
        if prot.contains(IommuProt::NOEXEC) {
            pte |= PTE_XN;
        }
        pte | PTE_AF
    }
}

fn checked_shr(v: u64, shift: u32) -> u64 {
    if shift >= 64 {
        0
    } else {
        v >> shift
    }
}

/// Restrict the supported page sizes to what the chosen granule can
/// express, preferring the host page size.
fn restrict_pgsizes(cfg: &mut PageTableCfg) {
    let granule = if cfg.pgsize_bitmap & PAGE_SIZE != 0 {
        PAGE_SIZE
    } else if cfg.pgsize_bitmap & !(PAGE_SIZE - 1) != 0 {
        1 << (cfg.pgsize_bitmap & !(PAGE_SIZE - 1)).trailing_zeros()
    } else {
        0
    };

    let mut max_addr_bits = 48;
    let page_sizes = match granule {
        SZ_4K => SZ_4K | SZ_2M | SZ_1G,
        SZ_16K => SZ_16K | SZ_32M,
        SZ_64K => {
            max_addr_bits = 52;
            let mut sizes = SZ_64K | SZ_512M;
            if cfg.oas > 48 {
                sizes |= 1 << 42;
            }
            sizes
        }
        _ => 0,
    };

    cfg.pgsize_bitmap &= page_sizes;
    cfg.ias = cfg.ias.min(max_addr_bits);
    cfg.oas = cfg.oas.min(max_addr_bits);
}
