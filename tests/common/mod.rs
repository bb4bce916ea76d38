#![allow(dead_code)]

use std::collections::HashSet;

use nand_ftl_sim::{Ftl, FtlConfig, Lpn, Lspn, NandLayout, PageAllocation, Psbn};

/// The reference geometry used throughout the scenario tests:
/// 4 parallel elements, 64 physical superblocks, 2048 physical pages,
/// 1536 logical pages at 25% over-provisioning.
pub fn scenario_layout() -> NandLayout {
    NandLayout {
        channel: 2,
        way: 2,
        die: 1,
        plane: 1,
        block: 16,
        page: 32,
        page_size: 4096,
        spare_size: 16,
        page_allocation: [
            PageAllocation::Channel,
            PageAllocation::Way,
            PageAllocation::Die,
            PageAllocation::Plane,
        ],
    }
}

pub fn scenario_config() -> FtlConfig {
    let mut config = FtlConfig::new(scenario_layout());
    config.overprovision = 0.25;
    config.seed = 42;
    config
}

/// Check the structural invariants that must hold whenever the simulator
/// is idle.
pub fn assert_invariants(ftl: &Ftl) {
    let param = ftl.param();
    let mapping = ftl.mapping();
    let allocator = ftl.allocator();

    // Per-block: live pages never exceed the write cursor.
    for psbn in 0..param.total_superblocks {
        let block = mapping.block_metadata(Psbn(psbn));
        assert!(
            block.valid_pages.count() <= block.next_page_to_write,
            "block {psbn}: more valid pages than written pages"
        );
        assert!(block.next_page_to_write <= param.page);
    }

    // Every valid mapping entry points at a live page of an in-range
    // superblock.
    for lspn in 0..param.total_logical_super_pages {
        if let Some(pspn) = mapping.lookup(param, Lspn(lspn)) {
            let psbn = param.psbn_of_pspn(pspn);
            let page = param.page_index_of_pspn(pspn);
            assert!(
                mapping.block_metadata(psbn).valid_pages.test(page),
                "LSPN {lspn} maps to dead page {page} of block {psbn}"
            );
        }
    }

    // Every superblock is in exactly one of free / full / in-use, in its
    // own unit, and the pools stay erase-count ordered.
    let mut seen = HashSet::new();
    let mut free_total = 0u64;
    let mut full_total = 0u64;

    for unit in 0..param.units {
        let in_use = allocator.in_use(unit).expect("every unit has an open block");
        assert_eq!(unit, param.unit_of_psbn(in_use));
        assert!(seen.insert(in_use), "block {in_use} in two places");

        for list in [
            allocator.free_blocks(unit).collect::<Vec<_>>(),
            allocator.full_blocks(unit).collect::<Vec<_>>(),
        ] {
            for pair in list.windows(2) {
                assert!(
                    mapping.block_metadata(pair[0]).erased_count
                        <= mapping.block_metadata(pair[1]).erased_count,
                    "pool of unit {unit} out of erase-count order"
                );
            }
            for psbn in &list {
                assert_eq!(unit, param.unit_of_psbn(*psbn));
                assert!(seen.insert(*psbn), "block {psbn} in two places");
            }
        }

        free_total += allocator.free_blocks(unit).count() as u64;
        full_total += allocator.full_blocks(unit).count() as u64;
    }

    assert_eq!(param.total_superblocks as usize, seen.len());
    assert_eq!(free_total, allocator.free_block_count());
    assert_eq!(full_total, allocator.full_block_count());
    assert_eq!(
        param.total_superblocks,
        free_total + full_total + param.units
    );

    // Aggregate page usage equals the per-block valid counts.
    let per_block: u64 = (0..param.total_superblocks)
        .map(|psbn| mapping.block_metadata(Psbn(psbn)).valid_pages.count() as u64)
        .sum();
    assert_eq!(
        per_block * param.superpage as u64,
        ftl.page_usage(Lpn(0), param.total_logical_pages)
    );
}
