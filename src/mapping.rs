use log::debug;
use serde::{Deserialize, Serialize};

use crate::allocator::{AllocationStrategy, GenericAllocator};
use crate::event::{Engine, EventId};
use crate::memory::{MemAccess, Memory, MemoryType};
use crate::param::Parameter;
use crate::request::{Request, Response};
use crate::types::{Lpn, Lspn, Ppn, Psbn, Pspn, Tick};
use crate::util::Bitset;

/// Per-superblock bookkeeping shared by the mapping (valid bitmap, write
/// cursor, open tick) and the allocator (erase count, reclaim reset).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub valid_pages: Bitset,
    /// Write cursor; equals the page count exactly when the block is full.
    pub next_page_to_write: u32,
    /// Lifetime program/erase cycles.
    pub erased_count: u32,
    /// Tick the block was most recently opened or accessed.
    pub inserted_at: Tick,
    pub read_count_after_erase: u32,
}

impl BlockMetadata {
    fn new(pages: u32) -> Self {
        BlockMetadata {
            valid_pages: Bitset::new(pages),
            next_page_to_write: 0,
            erased_count: 0,
            inserted_at: 0,
            read_count_after_erase: 0,
        }
    }

    /// Page indices holding live data, ascending.
    pub fn valid_page_indices(&self) -> Vec<u32> {
        self.valid_pages.iter_ones().collect()
    }

    /// Reset after a physical erase. The erase count is advanced by the
    /// allocator's reclaim, not here.
    pub fn mark_erased(&mut self) {
        self.valid_pages.reset_all();
        self.next_page_to_write = 0;
        self.inserted_at = 0;
        self.read_count_after_erase = 0;
    }
}

/// Translation request counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingStats {
    pub requested_read: u64,
    pub requested_write: u64,
    pub requested_invalidate: u64,
    pub read_lpns: u64,
    pub write_lpns: u64,
    pub invalidate_lpns: u64,
}

// Table entries are the smallest of 2/4/6/8 bytes that hold every PSPN
// plus a validity flag in the top bit of the chosen width.

fn entry_size_for(total_physical_super_pages: u64) -> u32 {
    for size in [2u32, 4, 6] {
        if total_physical_super_pages < 1u64 << (8 * size - 1) {
            return size;
        }
    }
    8
}

fn read_raw(table: &[u8], index: u64, size: u32) -> u64 {
    let at = (index * size as u64) as usize;

    match size {
        2 => u16::from_le_bytes(table[at..at + 2].try_into().unwrap()) as u64,
        4 => u32::from_le_bytes(table[at..at + 4].try_into().unwrap()) as u64,
        // 48-bit entries are three 16-bit words; never an unaligned u64.
        6 => {
            let low = u16::from_le_bytes(table[at..at + 2].try_into().unwrap()) as u64;
            let mid = u16::from_le_bytes(table[at + 2..at + 4].try_into().unwrap()) as u64;
            let high = u16::from_le_bytes(table[at + 4..at + 6].try_into().unwrap()) as u64;
            low | mid << 16 | high << 32
        }
        8 => u64::from_le_bytes(table[at..at + 8].try_into().unwrap()),
        _ => unreachable!("entry size {size}"),
    }
}

fn write_raw(table: &mut [u8], index: u64, size: u32, raw: u64) {
    let at = (index * size as u64) as usize;

    match size {
        2 => table[at..at + 2].copy_from_slice(&(raw as u16).to_le_bytes()),
        4 => table[at..at + 4].copy_from_slice(&(raw as u32).to_le_bytes()),
        6 => {
            table[at..at + 2].copy_from_slice(&(raw as u16).to_le_bytes());
            table[at + 2..at + 4].copy_from_slice(&((raw >> 16) as u16).to_le_bytes());
            table[at + 4..at + 6].copy_from_slice(&((raw >> 32) as u16).to_le_bytes());
        }
        8 => table[at..at + 8].copy_from_slice(&raw.to_le_bytes()),
        _ => unreachable!("entry size {size}"),
    }
}

fn parse_entry(raw: u64, size: u32) -> Option<Pspn> {
    let valid_bit = 1u64 << (8 * size - 1);
    (raw & valid_bit != 0).then(|| Pspn(raw & (valid_bit - 1)))
}

fn make_entry(pspn: Pspn, size: u32) -> u64 {
    let valid_bit = 1u64 << (8 * size - 1);
    debug_assert!(pspn.0 < valid_bit);
    pspn.0 | valid_bit
}

/// Page-level logical-to-physical mapping.
///
/// Owns the LSPN→PSPN table and the block metadata. Every operation
/// accumulates a memory-access trace which is then drained serially
/// through the memory model; the caller's completion event fires only
/// after the whole trace finishes, which is what produces realistic
/// mapping latencies.
pub struct PageLevelMapping {
    entry_size: u32,
    metadata_entry_size: u32,
    table: Vec<u8>,
    table_base: u64,
    metadata_base: u64,
    blocks: Vec<BlockMetadata>,
    trace: Vec<MemAccess>,
    stats: MappingStats,
}

impl PageLevelMapping {
    pub fn new(param: &Parameter, memory: &mut Memory) -> Self {
        let entry_size = entry_size_for(param.total_physical_super_pages);
        let table_bytes = param.total_logical_super_pages * entry_size as u64;
        // Packed valid bitmap behind a 2-byte clock + 2-byte cursor header.
        let metadata_entry_size = param.page.div_ceil(8) + 4;
        let metadata_bytes = param.total_superblocks * metadata_entry_size as u64;

        let metadata_base = memory
            .allocate(metadata_bytes, MemoryType::Dram, "mapping block metadata", false)
            .expect("block metadata does not fit in DRAM");
        let table_base = memory
            .allocate(table_bytes, MemoryType::Dram, "mapping table", false)
            .expect("mapping table does not fit in DRAM");

        debug!(
            "mapping | {} logical superpages, {}-byte entries, {} superblocks",
            param.total_logical_super_pages, entry_size, param.total_superblocks
        );

        PageLevelMapping {
            entry_size,
            metadata_entry_size,
            table: vec![0; table_bytes as usize],
            table_base,
            metadata_base,
            blocks: (0..param.total_superblocks)
                .map(|_| BlockMetadata::new(param.page))
                .collect(),
            trace: Vec::new(),
            stats: MappingStats::default(),
        }
    }

    pub fn entry_size(&self) -> u32 {
        self.entry_size
    }

    pub fn stats(&self) -> MappingStats {
        self.stats
    }

    /// Minimum and preferred mapping granularity in logical pages.
    pub fn mapping_granularity(&self, param: &Parameter) -> (u32, u32) {
        (param.superpage, param.superpage)
    }

    pub fn block_metadata(&self, psbn: Psbn) -> &BlockMetadata {
        &self.blocks[psbn.0 as usize]
    }

    pub fn block_metadata_mut(&mut self, psbn: Psbn) -> &mut BlockMetadata {
        &mut self.blocks[psbn.0 as usize]
    }

    pub(crate) fn blocks_mut(&mut self) -> &mut [BlockMetadata] {
        &mut self.blocks
    }

    pub(crate) fn blocks(&self) -> &[BlockMetadata] {
        &self.blocks
    }

    fn table_address(&self, lspn: Lspn) -> u64 {
        self.table_base + lspn.0 * self.entry_size as u64
    }

    fn metadata_address(&self, psbn: Psbn) -> u64 {
        self.metadata_base + psbn.0 * self.metadata_entry_size as u64
    }

    fn push_trace(&mut self, access: MemAccess, enabled: bool) {
        if enabled {
            self.trace.push(access);
        }
    }

    fn read_internal(&mut self, param: &Parameter, now: Tick, lspn: Lspn) -> Option<Pspn> {
        assert!(
            lspn.0 < param.total_logical_super_pages,
            "LSPN {lspn} out of range"
        );

        let raw = read_raw(&self.table, lspn.0, self.entry_size);
        self.push_trace(
            MemAccess::read(self.table_address(lspn), self.entry_size),
            true,
        );

        let pspn = parse_entry(raw, self.entry_size)?;

        // Touch the accessed time.
        let psbn = param.psbn_of_pspn(pspn);
        self.blocks[psbn.0 as usize].inserted_at = now;
        self.push_trace(MemAccess::write(self.metadata_address(psbn), 2), true);

        Some(pspn)
    }

    fn write_internal(
        &mut self,
        param: &Parameter,
        allocator: &mut GenericAllocator,
        now: Tick,
        lspn: Lspn,
        init: bool,
        strategy: AllocationStrategy,
    ) -> Pspn {
        assert!(
            lspn.0 < param.total_logical_super_pages,
            "LSPN {lspn} out of range"
        );

        let raw = read_raw(&self.table, lspn.0, self.entry_size);
        self.push_trace(
            MemAccess::read(self.table_address(lspn), self.entry_size),
            !init,
        );

        if let Some(old) = parse_entry(raw, self.entry_size) {
            // Overwrite: drop the previous physical copy.
            let psbn = param.psbn_of_pspn(old);
            let page = param.page_index_of_pspn(old);

            self.blocks[psbn.0 as usize].valid_pages.reset(page);
            self.push_trace(
                MemAccess::write(self.metadata_address(psbn) + 4 + page as u64 / 8, 1),
                !init,
            );
        }

        let mut psbn = allocator.block_at(param, None);

        if self.blocks[psbn.0 as usize].next_page_to_write == param.page {
            allocator.allocate_block(param, &mut self.blocks, &mut psbn, strategy);

            assert!(
                self.blocks[psbn.0 as usize].next_page_to_write != param.page,
                "block allocator corrupted: {psbn} is already full"
            );
        }

        let metadata_address = self.metadata_address(psbn);
        let next = self.blocks[psbn.0 as usize].next_page_to_write;

        self.blocks[psbn.0 as usize].valid_pages.set(next);
        self.push_trace(
            MemAccess::write(metadata_address + 4 + next as u64 / 8, 1),
            !init,
        );

        let pspn = param.make_pspn(psbn, next);
        let block = &mut self.blocks[psbn.0 as usize];
        block.next_page_to_write = next + 1;
        block.inserted_at = now;
        self.push_trace(MemAccess::write(metadata_address, 4), !init);

        write_raw(
            &mut self.table,
            lspn.0,
            self.entry_size,
            make_entry(pspn, self.entry_size),
        );
        self.push_trace(
            MemAccess::write(self.table_address(lspn), self.entry_size),
            !init,
        );

        pspn
    }

    fn invalidate_internal(&mut self, param: &Parameter, lspn: Lspn) {
        assert!(
            lspn.0 < param.total_logical_super_pages,
            "LSPN {lspn} out of range"
        );

        let raw = read_raw(&self.table, lspn.0, self.entry_size);

        if let Some(old) = parse_entry(raw, self.entry_size) {
            self.push_trace(
                MemAccess::read(self.table_address(lspn), self.entry_size),
                true,
            );

            let psbn = param.psbn_of_pspn(old);
            let page = param.page_index_of_pspn(old);

            self.blocks[psbn.0 as usize].valid_pages.reset(page);
            self.push_trace(
                MemAccess::write(self.metadata_address(psbn) + 4 + page as u64 / 8, 1),
                true,
            );

            write_raw(&mut self.table, lspn.0, self.entry_size, 0);
            self.push_trace(
                MemAccess::write(self.table_address(lspn), self.entry_size),
                true,
            );
        }
    }

    /// Translate a read. An unmapped page completes with
    /// [`Response::Unwritten`] and no physical address.
    pub fn read_mapping(
        &mut self,
        param: &Parameter,
        engine: &mut Engine,
        memory: &mut Memory,
        req: &mut Request,
        completion: EventId,
    ) {
        self.stats.requested_read += 1;
        self.stats.read_lpns += param.superpage as u64;

        let lspn = param.lspn_of_lpn(req.lpn);
        let index = param.superpage_index_of_lpn(req.lpn);

        match self.read_internal(param, engine.now(), lspn) {
            Some(pspn) => req.ppn = param.make_ppn_of_pspn(pspn, index),
            None => {
                req.response = Response::Unwritten;
                req.ppn = Ppn::INVALID;
            }
        }

        debug!("read  | LPN {} -> PPN {}", req.lpn, req.ppn);

        self.flush_trace(engine, memory, completion, req.tag);
    }

    /// Translate a write, allocating the next page of the unit's open
    /// block (or a fresh block chosen by `strategy`).
    pub fn write_mapping(
        &mut self,
        param: &Parameter,
        engine: &mut Engine,
        memory: &mut Memory,
        allocator: &mut GenericAllocator,
        req: &mut Request,
        completion: EventId,
        init: bool,
        strategy: AllocationStrategy,
    ) {
        self.stats.requested_write += 1;
        self.stats.write_lpns += param.superpage as u64;

        let lspn = param.lspn_of_lpn(req.lpn);
        let index = param.superpage_index_of_lpn(req.lpn);

        let pspn = self.write_internal(param, allocator, engine.now(), lspn, init, strategy);
        req.ppn = param.make_ppn_of_pspn(pspn, index);

        debug!("write | LPN {} -> PPN {}", req.lpn, req.ppn);

        self.flush_trace(engine, memory, completion, req.tag);
    }

    /// Warm-up form: no memory traces, no completion event.
    pub fn write_mapping_init(
        &mut self,
        param: &Parameter,
        allocator: &mut GenericAllocator,
        lspn: Lspn,
    ) -> Pspn {
        self.write_internal(
            param,
            allocator,
            0,
            lspn,
            true,
            AllocationStrategy::LowestEraseCount,
        )
    }

    /// Drop the mapping of every logical super-page the request covers.
    /// Physical erase of the invalidated pages is left to garbage
    /// collection.
    pub fn invalidate_mapping(
        &mut self,
        param: &Parameter,
        engine: &mut Engine,
        memory: &mut Memory,
        req: &mut Request,
        completion: EventId,
    ) {
        assert!(req.nlp > 0, "invalidation of zero pages");

        self.stats.requested_invalidate += 1;
        self.stats.invalidate_lpns += req.nlp as u64;

        let first = param.lspn_of_lpn(req.lpn);
        let last = param.lspn_of_lpn(Lpn(req.lpn.0 + req.nlp as u64 - 1));

        for lspn in first.0..=last.0 {
            self.invalidate_internal(param, Lspn(lspn));
        }

        req.ppn = Ppn::INVALID;

        debug!("trim  | LPN {} (+{})", req.lpn, req.nlp);

        self.flush_trace(engine, memory, completion, req.tag);
    }

    fn flush_trace(&mut self, engine: &mut Engine, memory: &mut Memory, completion: EventId, data: u64) {
        let trace = std::mem::take(&mut self.trace);
        memory.submit(engine, &trace, completion, data);
    }

    /// Valid logical pages in `[slpn, slpn + nlp)`.
    pub fn page_usage(&self, param: &Parameter, slpn: Lpn, nlp: u64) -> u64 {
        let first = slpn.0 / param.superpage as u64;
        let count = nlp.div_ceil(param.superpage as u64);

        assert!(
            first + count <= param.total_logical_super_pages,
            "LPN range out of bounds"
        );

        let mut used = 0;
        for lspn in first..first + count {
            if parse_entry(read_raw(&self.table, lspn, self.entry_size), self.entry_size).is_some()
            {
                used += 1;
            }
        }

        used * param.superpage as u64
    }

    /// Raw table lookup, without timing side effects.
    pub fn lookup(&self, param: &Parameter, lspn: Lspn) -> Option<Pspn> {
        assert!(
            lspn.0 < param.total_logical_super_pages,
            "LSPN {lspn} out of range"
        );
        parse_entry(read_raw(&self.table, lspn.0, self.entry_size), self.entry_size)
    }

    pub fn valid_pages(&self, psbn: Psbn) -> u32 {
        self.blocks[psbn.0 as usize].valid_pages.count()
    }

    pub fn age(&self, psbn: Psbn) -> Tick {
        self.blocks[psbn.0 as usize].inserted_at
    }

    pub fn mark_block_erased(&mut self, psbn: Psbn) {
        self.blocks[psbn.0 as usize].mark_erased();
    }

    /// Valid / invalid page totals over every opened block.
    pub fn page_statistics(&self) -> (u64, u64) {
        let mut valid = 0;
        let mut invalid = 0;

        for block in &self.blocks {
            if block.next_page_to_write > 0 {
                let live = block.valid_pages.count() as u64;
                valid += live;
                invalid += block.next_page_to_write as u64 - live;
            }
        }

        (valid, invalid)
    }

    pub fn snapshot(&self) -> MappingSnapshot {
        MappingSnapshot {
            entry_size: self.entry_size,
            table: self.table.clone(),
            blocks: self.blocks.clone(),
            stats: self.stats,
        }
    }

    pub fn restore(&mut self, param: &Parameter, snapshot: MappingSnapshot) {
        assert!(
            snapshot.entry_size == self.entry_size
                && snapshot.table.len() == self.table.len()
                && snapshot.blocks.len() == param.total_superblocks as usize,
            "FTL configuration mismatch"
        );

        self.table = snapshot.table;
        self.blocks = snapshot.blocks;
        self.stats = snapshot.stats;
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MappingSnapshot {
    pub entry_size: u32,
    pub table: Vec<u8>,
    pub blocks: Vec<BlockMetadata>,
    pub stats: MappingStats,
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn entry_size_picks_smallest_width() {
        assert_eq!(2, entry_size_for(0x7fff));
        assert_eq!(4, entry_size_for(0x8000));
        assert_eq!(4, entry_size_for(0x7fff_ffff));
        assert_eq!(6, entry_size_for(0x8000_0000));
        assert_eq!(6, entry_size_for(0x7fff_ffff_ffff));
        assert_eq!(8, entry_size_for(0x8000_0000_0000));
    }

    #[test]
    fn entry_validity_bit_rides_the_top() {
        let mut table = vec![0u8; 12];

        assert_eq!(None, parse_entry(read_raw(&table, 1, 6), 6));

        write_raw(&mut table, 1, 6, make_entry(Pspn(0xdead_beef_cafe & !(1 << 47)), 6));
        let parsed = parse_entry(read_raw(&table, 1, 6), 6).unwrap();
        assert_eq!(Pspn(0xdead_beef_cafe & !(1 << 47)), parsed);
        // Slot 0 untouched.
        assert_eq!(None, parse_entry(read_raw(&table, 0, 6), 6));
    }

    proptest! {
        #[test]
        fn raw_round_trip(index in 0u64..8, pspn in 0u64..(1 << 46), size in prop::sample::select(vec![2u32, 4, 6, 8])) {
            let limit = 1u64 << (8 * size - 1);
            let pspn = pspn % (limit >> 1);
            let mut table = vec![0u8; (8 * size) as usize];

            write_raw(&mut table, index, size, make_entry(Pspn(pspn), size));
            prop_assert_eq!(Some(Pspn(pspn)), parse_entry(read_raw(&table, index, size), size));
        }
    }
}
