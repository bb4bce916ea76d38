mod common;

use common::scenario_config;
use nand_ftl_sim::{Ftl, FtlCheckpoint, LatencyFil, Lpn, Request};

const PAGE_SIZE: u32 = 4096;

fn workload(ftl: &mut Ftl, base_tag: u64) {
    for lpn in 0..48u64 {
        ftl.submit(Request::write(base_tag + lpn, Lpn(lpn * 7 % 96), Lpn(lpn * 7 % 96), 1, 0, PAGE_SIZE));
        ftl.run_until_idle();
    }
    ftl.submit(Request::trim(base_tag + 100, Lpn(0), 8));
    ftl.run_until_idle();
}

fn round_trip(checkpoint: FtlCheckpoint) -> FtlCheckpoint {
    let json = serde_json::to_string(&checkpoint).unwrap();
    serde_json::from_str(&json).unwrap()
}

#[test]
fn checkpoint_restores_byte_equal_state() {
    let mut ftl = Ftl::new(scenario_config()).unwrap();
    workload(&mut ftl, 1);
    ftl.drain_completions();

    let checkpoint = round_trip(ftl.checkpoint());
    let restored = Ftl::restore(scenario_config(), LatencyFil::new, checkpoint).unwrap();

    // The restored simulator checkpoints back to the identical state,
    // table bytes and block metadata included.
    assert_eq!(
        serde_json::to_string(&ftl.checkpoint()).unwrap(),
        serde_json::to_string(&restored.checkpoint()).unwrap()
    );
}

#[test]
fn restored_simulator_continues_identically() {
    let mut original = Ftl::new(scenario_config()).unwrap();
    workload(&mut original, 1);
    original.drain_completions();

    let checkpoint = round_trip(original.checkpoint());
    let mut restored = Ftl::restore(scenario_config(), LatencyFil::new, checkpoint).unwrap();

    workload(&mut original, 1000);
    workload(&mut restored, 1000);

    assert_eq!(original.drain_completions(), restored.drain_completions());
    assert_eq!(
        serde_json::to_string(&original.stats()).unwrap(),
        serde_json::to_string(&restored.stats()).unwrap()
    );
}

#[test]
fn mid_flight_checkpoint_resumes_pending_events() {
    let mut original = Ftl::new(scenario_config()).unwrap();

    // Submit but only run partway: translations, NAND programs and the
    // idle timer are still in the queue.
    for lpn in 0..8u64 {
        original.submit(Request::write(lpn + 1, Lpn(lpn), Lpn(lpn), 1, 0, PAGE_SIZE));
    }
    original.run_until(1000);

    let checkpoint = round_trip(original.checkpoint());
    let mut restored = Ftl::restore(scenario_config(), LatencyFil::new, checkpoint).unwrap();

    original.run_until_idle();
    restored.run_until_idle();

    assert_eq!(original.drain_completions(), restored.drain_completions());
}

#[test]
#[should_panic(expected = "FTL configuration mismatch")]
fn restore_rejects_different_geometry() {
    let mut ftl = Ftl::new(scenario_config()).unwrap();
    workload(&mut ftl, 1);

    let checkpoint = ftl.checkpoint();

    let mut other = scenario_config();
    other.layout.block = 32;
    let _ = Ftl::restore(other, LatencyFil::new, checkpoint);
}
