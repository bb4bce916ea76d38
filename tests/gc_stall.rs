mod common;

use std::collections::HashSet;

use common::{assert_invariants, scenario_config};
use nand_ftl_sim::{Ftl, GcMode, Lpn, Request, VictimPolicy};

const PAGE_SIZE: u32 = 4096;

/// Drive the device to the foreground threshold: writes stall, greedy GC
/// reclaims invalidated blocks, and the stall list drains in FIFO order.
#[test]
fn foreground_gc_stalls_and_resumes_writes() {
    let mut config = scenario_config();
    config.victim_policy = VictimPolicy::Greedy;
    config.gc_mode = GcMode::Naive;
    // Isolate GC from wear leveling.
    config.wl_threshold = 0.0;
    let mut ftl = Ftl::new(config).unwrap();

    let logical = ftl.param().total_logical_pages;
    let mut submitted = HashSet::new();
    let mut stalled_any = false;
    let mut tag = 0u64;

    // First pass fills the logical space; the overwrites that follow
    // invalidate pages and push allocation over the threshold.
    for lpn in (0..logical).chain(0..logical / 2) {
        tag += 1;
        submitted.insert(tag);

        if !ftl.write(Some(Request::write(tag, Lpn(lpn), Lpn(lpn), 1, 0, PAGE_SIZE))) {
            stalled_any = true;
            assert!(ftl.stalled_writes() > 0);
            // The request is retained; run the loop so GC can reclaim
            // and re-drive the stall list.
            ftl.run_until_idle();
            assert_eq!(0, ftl.stalled_writes());
        }
    }
    ftl.run_until_idle();

    assert!(stalled_any, "workload never hit the foreground threshold");

    let stats = ftl.stats();
    assert!(stats.gc.foreground_rounds >= 1);
    assert!(stats.gc.erased_blocks >= 1);
    assert!(stats.gc.copied_pages >= 1);

    // Every write completed exactly once, stalled or not.
    let completed: HashSet<u64> = ftl.drain_completions().iter().map(|c| c.tag).collect();
    assert_eq!(submitted, completed);

    // The reclaim did its job: the device is writable again.
    assert!(!ftl.allocator().check_foreground_gc_threshold());

    assert_invariants(&ftl);
}

#[test]
fn background_gc_runs_on_idle_time() {
    let mut config = scenario_config();
    config.gc_mode = GcMode::Advanced;
    config.wl_threshold = 0.0;
    // Generous background threshold so idle time finds work well before
    // writes would stall.
    config.bgc_threshold = 0.4;
    let mut ftl = Ftl::new(config).unwrap();

    let mut tag = 0u64;

    // Two passes over 1000 pages: the second pass invalidates the first,
    // so by the time the free ratio crosses the background threshold
    // there is plenty for idle-time GC to reclaim.
    for lpn in (0..1000u64).chain(0..1000) {
        tag += 1;
        assert!(ftl.write(Some(Request::write(tag, Lpn(lpn), Lpn(lpn), 1, 0, PAGE_SIZE))));
        ftl.run_until_idle();
    }

    let stats = ftl.stats();
    assert!(
        stats.gc.background_rounds >= 1,
        "idle time never started background GC"
    );
    assert!(stats.job_manager.idle_fires >= 1);
    assert_invariants(&ftl);
}

#[test]
fn preemption_pauses_new_reads_and_resumes() {
    let mut config = scenario_config();
    config.gc_mode = GcMode::Preemptible;
    config.wl_threshold = 0.0;
    let mut ftl = Ftl::new(config).unwrap();

    let logical = ftl.param().total_logical_pages;
    let mut tag = 0u64;

    // Push to the stall point so a foreground round is pending, then
    // preempt before running the loop.
    'outer: for lpn in (0..logical).chain(0..logical) {
        tag += 1;
        if !ftl.write(Some(Request::write(tag, Lpn(lpn), Lpn(lpn), 1, 0, PAGE_SIZE))) {
            break 'outer;
        }
    }

    ftl.request_gc_preemption();
    let fired_paused = ftl.run_until_idle();

    // GC stopped before erasing anything; the stall is still in place.
    assert_eq!(0, ftl.stats().gc.erased_blocks);
    assert!(ftl.stalled_writes() > 0);

    ftl.clear_gc_preemption();
    ftl.run_until_idle();

    assert!(ftl.stats().gc.erased_blocks >= 1);
    assert_eq!(0, ftl.stalled_writes());
    assert!(fired_paused > 0);
    assert_invariants(&ftl);
}
