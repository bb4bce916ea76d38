use nand_ftl_sim::{
    Ftl, FtlConfig, Lpn, NandLayout, OpLogLevel, PageAllocation, Request,
};

pub fn main() {
    let layout = NandLayout {
        channel: 2,
        way: 2,
        die: 2,
        plane: 2,
        block: 64,
        page: 128,
        page_size: 4096,
        spare_size: 64,
        page_allocation: [
            PageAllocation::Channel,
            PageAllocation::Way,
            PageAllocation::Die,
            PageAllocation::Plane,
        ],
    };

    let mut ftl = Ftl::new(FtlConfig::new(layout)).unwrap();
    ftl.flash_mut().set_logging(OpLogLevel::Timed);

    let page_size = ftl.param().page_size;

    for lpn in 0..8 {
        ftl.submit(Request::write(lpn, Lpn(lpn), Lpn(0), 8, 0, page_size));
    }
    ftl.submit(Request::read(100, Lpn(3), page_size));
    ftl.run_until_idle();

    for done in ftl.drain_completions() {
        println!("tag {} -> {:?} at {} ns", done.tag, done.response, done.at);
    }
    for op in ftl.flash().operations() {
        println!("{:?}", op);
    }
    println!("{:#?}", ftl.stats());
}
