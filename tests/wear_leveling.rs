mod common;

use common::{assert_invariants, scenario_config};
use nand_ftl_sim::{Ftl, Lpn, Psbn, Request};

const PAGE_SIZE: u32 = 4096;

/// Early in life only a handful of blocks have been erased, so the wear
/// factor is far below 1 and the first reclaim kicks static wear leveling
/// off: cold full blocks move onto the worn blocks.
#[test]
fn wear_leveling_follows_the_first_reclaims() {
    let mut config = scenario_config();
    config.wl_threshold = 0.5;
    let mut ftl = Ftl::new(config).unwrap();

    let logical = ftl.param().total_logical_pages;
    let mut tag = 0u64;

    for lpn in (0..logical).chain(0..logical / 2) {
        tag += 1;
        if !ftl.write(Some(Request::write(tag, Lpn(lpn), Lpn(lpn), 1, 0, PAGE_SIZE))) {
            ftl.run_until_idle();
        }
    }
    ftl.run_until_idle();

    let stats = ftl.stats();
    assert!(stats.gc.erased_blocks >= 1, "GC never ran");
    assert!(
        stats.wear_leveling.rounds >= 1,
        "skewed wear never triggered wear leveling"
    );
    assert!(stats.wear_leveling.copied_pages >= 1);

    // Wear leveling erases its victims too, so they re-enter the free
    // pool with a positive erase count.
    assert!(stats.erase_count_max >= 1);
    assert_invariants(&ftl);
}

/// The wear factor is the allocator's `(Σe)² / (N · Σe²)`: 1.0 for even
/// wear, small when a few blocks absorb all erases.
#[test]
fn wear_factor_reflects_skew() {
    let mut ftl = Ftl::new(scenario_config()).unwrap();

    // Pristine device: no erases at all reads as factor 0.
    assert_eq!(0.0, ftl.stats().wear_leveling_factor);

    let total = ftl.param().total_superblocks;

    // One worn block among pristine ones: heavily skewed.
    ftl.mapping_mut().block_metadata_mut(Psbn(0)).erased_count = 100;
    let skewed = ftl.stats().wear_leveling_factor;
    assert!(skewed < 0.05, "factor {skewed}");

    // Perfectly even wear reads as 1.
    for psbn in 0..total {
        ftl.mapping_mut().block_metadata_mut(Psbn(psbn)).erased_count = 100;
    }
    let even = ftl.stats().wear_leveling_factor;
    assert!((even - 1.0).abs() < 1e-9, "factor {even}");
}
