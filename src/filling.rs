use log::{debug, warn};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::allocator::GenericAllocator;
use crate::config::{FillMode, FtlConfig};
use crate::fil::FlashInterface;
use crate::mapping::PageLevelMapping;
use crate::param::Parameter;
use crate::types::{Lpn, Lspn};

/// Warm-up fill: pre-populate the mapping (and the flash spare areas)
/// before the simulation starts, optionally overwriting part of the data
/// to create invalid pages. Runs at tick zero with memory traces
/// suppressed.
pub fn fill<F: FlashInterface>(
    config: &FtlConfig,
    param: &Parameter,
    mapping: &mut PageLevelMapping,
    allocator: &mut GenericAllocator,
    fil: &mut F,
) {
    let total = param.total_logical_super_pages;
    let pages_to_warmup = (total as f64 * config.fill_ratio as f64) as u64;
    let mut pages_to_invalidate = (total as f64 * config.invalid_fill_ratio as f64) as u64;

    // Keep the fill below the foreground GC threshold; filling is not
    // allowed to start the simulation inside a GC storm.
    let max_pages_before_gc = (param.page as u64 as f64
        * param.total_superblocks as f64
        * (1.0 - config.fgc_threshold as f64)) as u64;

    if pages_to_warmup + pages_to_invalidate > max_pages_before_gc {
        warn!("filling ratio too high, clamping the invalidation pass");
        pages_to_invalidate = max_pages_before_gc.saturating_sub(pages_to_warmup);
    }

    if pages_to_warmup == 0 && pages_to_invalidate == 0 {
        return;
    }

    debug!(
        "filling | {pages_to_warmup} superpages to write, {pages_to_invalidate} to invalidate ({:?})",
        config.fill_mode
    );

    let mut rng = SmallRng::seed_from_u64(config.seed ^ 0x66696c6c);
    let write = |mapping: &mut PageLevelMapping,
                 allocator: &mut GenericAllocator,
                 fil: &mut F,
                 lspn: Lspn| {
        let pspn = mapping.write_mapping_init(param, allocator, lspn);

        for sub in 0..param.superpage {
            let lpn = Lpn(lspn.0 * param.superpage as u64 + sub as u64);
            fil.write_spare(param.make_ppn_of_pspn(pspn, sub), lpn);
        }
    };

    // Step 1: fill.
    match config.fill_mode {
        FillMode::SequentialSequential | FillMode::SequentialRandom => {
            for lspn in 0..pages_to_warmup {
                write(mapping, allocator, fil, Lspn(lspn));
            }
        }
        FillMode::RandomRandom => {
            for _ in 0..pages_to_warmup {
                write(mapping, allocator, fil, Lspn(rng.random_range(0..total)));
            }
        }
    }

    // Step 2: invalidate by overwriting.
    match config.fill_mode {
        FillMode::SequentialSequential => {
            for lspn in 0..pages_to_invalidate {
                write(mapping, allocator, fil, Lspn(lspn));
            }
        }
        FillMode::SequentialRandom => {
            // Step 1 was sequential, so restricting the range creates the
            // exact number of invalid pages.
            for _ in 0..pages_to_invalidate {
                let lspn = rng.random_range(0..pages_to_warmup.max(1));
                write(mapping, allocator, fil, Lspn(lspn));
            }
        }
        FillMode::RandomRandom => {
            for _ in 0..pages_to_invalidate {
                write(mapping, allocator, fil, Lspn(rng.random_range(0..total)));
            }
        }
    }

    let (valid, invalid) = mapping.page_statistics();
    debug!(
        "filling | finished: {valid} valid / {invalid} invalid physical superpages \
         (targets {pages_to_warmup} / {pages_to_invalidate})"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::AllocationStrategy;
    use crate::config::{NandLayout, PageAllocation};
    use crate::fil::LatencyFil;
    use crate::memory::Memory;
    use crate::types::Psbn;

    fn config() -> FtlConfig {
        let mut config = FtlConfig::new(NandLayout {
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
        });
        config.overprovision = 0.25;
        config
    }

    fn fixture(config: &FtlConfig) -> (Parameter, Memory, PageLevelMapping, GenericAllocator, LatencyFil) {
        let param = Parameter::new(config);
        let mut memory = Memory::new(&config.timings, config.sram_size, config.dram_size);
        let mut mapping = PageLevelMapping::new(&param, &mut memory);
        let mut allocator = GenericAllocator::new(&param, config);

        for _ in 0..param.units {
            let mut psbn = Psbn::INVALID;
            allocator.allocate_block(
                &param,
                mapping.blocks_mut(),
                &mut psbn,
                AllocationStrategy::LowestEraseCount,
            );
        }

        let fil = LatencyFil::new(&param, &config.timings);

        (param, memory, mapping, allocator, fil)
    }

    #[test]
    fn sequential_fill_maps_the_prefix_and_seeds_spares() {
        let mut config = config();
        config.fill_ratio = 0.25;
        let (param, _memory, mut mapping, mut allocator, mut fil) = fixture(&config);

        fill(&config, &param, &mut mapping, &mut allocator, &mut fil);

        let filled = (param.total_logical_super_pages as f64 * 0.25) as u64;
        assert_eq!(
            filled * param.superpage as u64,
            mapping.page_usage(&param, Lpn(0), param.total_logical_pages)
        );

        // Reverse mapping must be recoverable for every filled page.
        for lspn in 0..filled {
            let pspn = mapping.lookup(&param, Lspn(lspn)).unwrap();
            assert_eq!(Lpn(lspn), fil.read_spare(param.make_ppn_of_pspn(pspn, 0)));
        }
        assert!(mapping.lookup(&param, Lspn(filled)).is_none());
    }

    #[test]
    fn invalidation_pass_creates_invalid_pages() {
        let mut config = config();
        config.fill_ratio = 0.25;
        config.invalid_fill_ratio = 0.1;
        config.fill_mode = FillMode::SequentialSequential;
        let (param, _memory, mut mapping, mut allocator, mut fil) = fixture(&config);

        fill(&config, &param, &mut mapping, &mut allocator, &mut fil);

        let (valid, invalid) = mapping.page_statistics();
        assert_eq!((param.total_logical_super_pages as f64 * 0.25) as u64, valid);
        assert_eq!((param.total_logical_super_pages as f64 * 0.1) as u64, invalid);
    }
}
