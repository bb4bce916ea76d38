mod common;

use common::{assert_invariants, scenario_config};
use nand_ftl_sim::jobs::read_reclaim::ReadReclaimer;
use nand_ftl_sim::mapping::PageLevelMapping;
use nand_ftl_sim::memory::Memory;
use nand_ftl_sim::param::Parameter;
use nand_ftl_sim::{Ftl, Lpn, Lspn, Psbn, Request};

const PAGE_SIZE: u32 = 4096;
const TICKS_PER_DAY: u64 = 86_400 * 1_000_000_000;

/// The closed-form error model at the reference operating point: ten
/// thousand P/E cycles, 100 days of retention and a million reads push a
/// page well past fifty estimated bit errors.
#[test]
fn worn_hot_block_estimates_past_the_default_threshold() {
    let config = scenario_config();
    let param = Parameter::new(&config);
    let mut memory = Memory::new(&config.timings, config.sram_size, config.dram_size);
    let mut mapping = PageLevelMapping::new(&param, &mut memory);
    let mut rr = ReadReclaimer::new(&param, &config, &mut memory);

    let block = mapping.block_metadata_mut(Psbn(0));
    block.erased_count = 10_000;
    block.read_count_after_erase = 1_000_000;
    block.inserted_at = 0;

    let errors = rr.estimate_bit_errors(100 * TICKS_PER_DAY, mapping.block_metadata(Psbn(0)));
    assert!(errors >= 50, "estimated only {errors} bit errors");

    // A pristine block stays far below the threshold.
    let errors = rr.estimate_bit_errors(0, mapping.block_metadata(Psbn(1)));
    assert!(errors < 50);
}

#[test]
fn crossing_the_threshold_reclaims_the_block_once() {
    let mut config = scenario_config();
    config.wl_threshold = 0.0;
    let mut ftl = Ftl::new(config).unwrap();
    let param = ftl.param().clone();

    // Seal the first block of unit 0: 33 writes to the unit fill its 32
    // pages and the 33rd retires it to the full list.
    for lpn in 0..132u64 {
        assert!(ftl.write(Some(Request::write(lpn + 1, Lpn(lpn), Lpn(lpn), 1, 0, PAGE_SIZE))));
        ftl.run_until_idle();
    }

    let victim = Psbn(0);
    assert!(ftl.allocator().full_blocks(0).any(|b| b == victim));

    // Heavy wear and disturb so the next read's estimate crosses the line.
    let block = ftl.mapping_mut().block_metadata_mut(victim);
    block.erased_count = 10_000;
    block.read_count_after_erase = 100_000_000;

    ftl.read(Request::read(1000, Lpn(0), PAGE_SIZE));
    ftl.run_until_idle();

    let stats = ftl.stats();
    assert_eq!(1, stats.read_reclaim.triggers);
    assert_eq!(1, stats.read_reclaim.rounds);
    assert_eq!(1, stats.read_reclaim.erased_blocks);
    assert!(stats.read_reclaim.copied_pages >= 1);

    // The block was erased: counters reset, erase counted, and LPN 0 now
    // lives elsewhere.
    let block = ftl.mapping().block_metadata(victim);
    assert_eq!(0, block.read_count_after_erase);
    assert_eq!(10_001, block.erased_count);
    assert!(block.valid_pages.none());

    let new_home = param.psbn_of_pspn(ftl.mapping().lookup(&param, Lspn(0)).unwrap());
    assert_ne!(victim, new_home);

    // Re-reading the same logical page no longer trips the model.
    ftl.read(Request::read(1001, Lpn(0), PAGE_SIZE));
    ftl.run_until_idle();

    assert_eq!(1, ftl.stats().read_reclaim.triggers);
    assert_invariants(&ftl);
}
