mod common;

use common::{assert_invariants, scenario_config};
use nand_ftl_sim::{EventId, Ftl, Lpn, Lspn, NandOpKind, OpLogLevel, Opcode, Request, Response};

const PAGE_SIZE: u32 = 4096;

#[test]
fn cold_read_completes_unwritten_without_flash_io() {
    let mut ftl = Ftl::new(scenario_config()).unwrap();
    ftl.flash_mut().set_logging(OpLogLevel::Minimal);

    ftl.read(Request::read(1, Lpn(0), PAGE_SIZE));
    ftl.run_until_idle();

    let done = ftl.drain_completions();
    assert_eq!(1, done.len());
    assert_eq!(Response::Unwritten, done[0].response);
    // The only latency is the mapping-table lookup, no NAND involved.
    assert!(ftl.flash().operations().is_empty());
    assert!(done[0].at > 0);
}

#[test]
fn write_then_read_round_trip() {
    let mut ftl = Ftl::new(scenario_config()).unwrap();
    ftl.flash_mut().set_logging(OpLogLevel::Minimal);

    assert!(ftl.write(Some(Request::write(1, Lpn(0), Lpn(0), 1, 0, PAGE_SIZE))));
    ftl.run_until_idle();

    // The mapping is live and its block accounts for the page.
    let param = ftl.param().clone();
    let pspn = ftl.mapping().lookup(&param, Lspn(0)).expect("mapped after write");
    let psbn = param.psbn_of_pspn(pspn);
    let block = ftl.mapping().block_metadata(psbn);
    assert!(block.valid_pages.test(param.page_index_of_pspn(pspn)));
    assert!(block.next_page_to_write >= 1);

    ftl.read(Request::read(2, Lpn(0), PAGE_SIZE));
    ftl.run_until_idle();

    let done = ftl.drain_completions();
    assert_eq!(2, done.len());
    assert!(done.iter().all(|c| c.response == Response::Success));

    let kinds: Vec<NandOpKind> = ftl.flash().operations().iter().map(|op| op.kind).collect();
    assert_eq!(vec![NandOpKind::Program, NandOpKind::Read], kinds);
    // The read went to the written location.
    assert_eq!(
        ftl.flash().operations()[0].ppn,
        ftl.flash().operations()[1].ppn
    );

    assert_invariants(&ftl);
}

#[test]
fn overwrite_invalidates_the_old_copy() {
    let mut ftl = Ftl::new(scenario_config()).unwrap();
    let param = ftl.param().clone();

    ftl.write(Some(Request::write(1, Lpn(7), Lpn(7), 1, 0, PAGE_SIZE)));
    ftl.run_until_idle();
    let first = ftl.mapping().lookup(&param, Lspn(7)).unwrap();

    ftl.write(Some(Request::write(2, Lpn(7), Lpn(7), 1, 0, PAGE_SIZE)));
    ftl.run_until_idle();
    let second = ftl.mapping().lookup(&param, Lspn(7)).unwrap();

    assert_ne!(first, second);

    let old_block = param.psbn_of_pspn(first);
    let old_page = param.page_index_of_pspn(first);
    assert!(!ftl.mapping().block_metadata(old_block).valid_pages.test(old_page));

    assert_eq!(1, ftl.page_usage(Lpn(0), param.total_logical_pages));
    assert_invariants(&ftl);
}

#[test]
fn trim_unmaps_and_reads_come_back_unwritten() {
    let mut ftl = Ftl::new(scenario_config()).unwrap();

    for lpn in 0..4u64 {
        ftl.write(Some(Request::write(lpn + 1, Lpn(lpn), Lpn(0), 4, 0, PAGE_SIZE)));
    }
    ftl.run_until_idle();
    assert_eq!(4, ftl.page_usage(Lpn(0), 4));

    ftl.invalidate(Request::trim(10, Lpn(0), 4));
    ftl.run_until_idle();
    assert_eq!(0, ftl.page_usage(Lpn(0), 4));

    ftl.read(Request::read(11, Lpn(2), PAGE_SIZE));
    ftl.run_until_idle();

    let done = ftl.drain_completions();
    assert_eq!(Response::Unwritten, done.last().unwrap().response);
    assert_invariants(&ftl);
}

#[test]
fn flush_completes_immediately() {
    let mut ftl = Ftl::new(scenario_config()).unwrap();

    let mut req = Request::new(5, Opcode::Flush, Lpn(0), EventId::HostComplete, 5);
    req.nlp = 0;
    assert!(ftl.submit(req));
    ftl.run_until_idle();

    let done = ftl.drain_completions();
    assert_eq!(1, done.len());
    assert_eq!(0, done[0].at);
}

#[test]
fn completion_times_reflect_nand_serialization() {
    let config = scenario_config();
    let program = config.timings.nand_program.ticks();
    let mut ftl = Ftl::new(config).unwrap();

    // Five writes round-robin over four units: tags 1 and 5 share a
    // parallel element and must serialize; tags 1 and 2 overlap.
    for tag in 1..=5u64 {
        ftl.write(Some(Request::write(tag, Lpn(tag - 1), Lpn(tag - 1), 1, 0, PAGE_SIZE)));
    }
    ftl.run_until_idle();

    let done = ftl.drain_completions();
    let at = |tag| done.iter().find(|c| c.tag == tag).unwrap().at;

    assert!(at(2) - at(1) < program, "different elements overlap");
    assert!(at(5) - at(1) >= program, "same element serializes");
}

#[test]
fn identical_seeds_replay_identically() {
    let run = || {
        let mut ftl = Ftl::new(scenario_config()).unwrap();
        for lpn in 0..64u64 {
            ftl.write(Some(Request::write(lpn + 1, Lpn(lpn % 16), Lpn(lpn % 16), 1, 0, PAGE_SIZE)));
            ftl.run_until_idle();
        }
        for lpn in 0..16u64 {
            ftl.read(Request::read(1000 + lpn, Lpn(lpn), PAGE_SIZE));
        }
        ftl.run_until_idle();
        ftl.drain_completions()
    };

    assert_eq!(run(), run());
}

#[test]
fn mixed_workload_preserves_invariants() {
    let mut ftl = Ftl::new(scenario_config()).unwrap();
    let logical = ftl.param().total_logical_pages;

    let mut tag = 0u64;
    for round in 0..3u64 {
        for lpn in (round * 97..round * 97 + 400).map(|l| l % logical) {
            tag += 1;
            ftl.submit(Request::write(tag, Lpn(lpn), Lpn(lpn), 1, 0, PAGE_SIZE));
        }
        ftl.run_until_idle();

        tag += 1;
        ftl.submit(Request::trim(tag, Lpn(round * 31 % 512), 8));
        ftl.run_until_idle();
    }

    assert_invariants(&ftl);
}
