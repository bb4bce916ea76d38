use std::collections::{HashMap, VecDeque};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::allocator::{AllocationStrategy, AllocatorSnapshot, GenericAllocator};
use crate::config::{ConfigError, FtlConfig};
use crate::event::{Engine, EventId, Fired};
use crate::fil::{FilRequest, FilSnapshot, FlashInterface, LatencyFil};
use crate::filling;
use crate::jobs::copy::PipelineCtx;
use crate::jobs::gc::{GarbageCollector, GcRound, GcSnapshot};
use crate::jobs::read_reclaim::{ReadReclaimer, RrSnapshot};
use crate::jobs::wear_leveling::{WearLeveler, WlSnapshot};
use crate::jobs::{JobManager, JobManagerSnapshot, TriggerType};
use crate::mapping::{MappingSnapshot, PageLevelMapping};
use crate::memory::{Memory, MemorySnapshot, MemoryType};
use crate::param::Parameter;
use crate::request::{Opcode, Request, Response};
use crate::stats::SimSnapshot;
use crate::types::{Lpn, Ppn, Psbn, Tag, Tick};

/// A finished host request, as drained from the completion queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub tag: Tag,
    pub response: Response,
    pub at: Tick,
}

/// Read-modify-write counters of the controller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerStats {
    pub rmw_count: u64,
    pub rmw_merged: u64,
    pub rmw_read_pages: u64,
    pub rmw_written_pages: u64,
}

/// A gathered window that was not aligned to the mapping granularity and
/// is being read, merged and rewritten.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct RmwContext {
    aligned_begin: u64,
    chunk_begin: u64,
    slots: Vec<Option<Tag>>,
    write_pending: bool,
    counter: u32,
    begin_at: Tick,
    /// Later windows on the same alignment merged in while the head was
    /// still reading; they complete with the head, no extra NAND I/O.
    chain: Vec<RmwChainNode>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RmwChainNode {
    chunk_begin: u64,
    slots: Vec<Option<Tag>>,
}

macro_rules! pipeline_ctx {
    ($self:ident) => {
        PipelineCtx {
            param: &$self.param,
            engine: &mut $self.engine,
            fil: &mut $self.fil,
            memory: &mut $self.memory,
            mapping: &mut $self.mapping,
            allocator: &mut $self.allocator,
        }
    };
}

/// The page-level FTL: request admission and routing, read-modify-write
/// gathering, write stalling, background maintenance, and the event loop
/// that drives it all.
pub struct Ftl<F: FlashInterface = LatencyFil> {
    param: Parameter,
    page_size: u32,
    min_mapping_size: u32,
    merge_rmw: bool,

    engine: Engine,
    fil: F,
    memory: Memory,
    mapping: PageLevelMapping,
    allocator: GenericAllocator,
    manager: JobManager,
    gc: GarbageCollector,
    wl: WearLeveler,
    rr: ReadReclaimer,

    requests: HashMap<Tag, Request>,
    pending_list: Vec<Option<Tag>>,
    pending_base: u64,
    write_list: Vec<Vec<Tag>>,
    rmw_list: HashMap<Tag, RmwContext>,
    stalled: VecDeque<Tag>,
    completing: HashMap<u64, Completion>,
    completions: VecDeque<Completion>,
    stats: ControllerStats,
}

impl Ftl<LatencyFil> {
    /// Build the simulator with the reference flash timing model.
    pub fn new(config: FtlConfig) -> Result<Self, ConfigError> {
        Ftl::with_flash(config, LatencyFil::new)
    }
}

impl<F: FlashInterface> Ftl<F> {
    /// Build the simulator around a custom flash interface model.
    pub fn with_flash(
        config: FtlConfig,
        make_flash: impl FnOnce(&Parameter, &crate::config::Timings) -> F,
    ) -> Result<Self, ConfigError> {
        Self::build(config, make_flash, true)
    }

    fn build(
        config: FtlConfig,
        make_flash: impl FnOnce(&Parameter, &crate::config::Timings) -> F,
        warm_up: bool,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let param = Parameter::new(&config);
        let mut memory = Memory::new(&config.timings, config.sram_size, config.dram_size);
        let mut mapping = PageLevelMapping::new(&param, &mut memory);
        let mut allocator = GenericAllocator::new(&param, &config);

        // Open one block per parallelism unit.
        for _ in 0..param.units {
            let mut psbn = Psbn::INVALID;
            allocator.allocate_block(
                &param,
                mapping.blocks_mut(),
                &mut psbn,
                AllocationStrategy::LowestEraseCount,
            );
        }

        let gc = GarbageCollector::new(&param, &config, &mut memory);
        let wl = WearLeveler::new(&param, &config, &mut memory);
        let rr = ReadReclaimer::new(&param, &config, &mut memory);
        let mut manager = JobManager::new(&config);

        let (min_mapping_size, _) = mapping.mapping_granularity(&param);
        let pending_base = memory
            .allocate(
                min_mapping_size as u64 * param.page_size as u64,
                MemoryType::Dram,
                "rmw merge buffer",
                false,
            )
            .expect("RMW buffer does not fit in DRAM");

        let mut fil = make_flash(&param, &config.timings);

        if warm_up {
            filling::fill(&config, &param, &mut mapping, &mut allocator, &mut fil);
        }

        let mut engine = Engine::new();
        manager.reschedule_idle_detection(&mut engine, 0);

        Ok(Ftl {
            page_size: param.page_size,
            min_mapping_size,
            merge_rmw: config.merge_rmw,
            param,
            engine,
            fil,
            memory,
            mapping,
            allocator,
            manager,
            gc,
            wl,
            rr,
            requests: HashMap::new(),
            pending_list: vec![None; min_mapping_size as usize],
            pending_base,
            write_list: Vec::new(),
            rmw_list: HashMap::new(),
            stalled: VecDeque::new(),
            completing: HashMap::new(),
            completions: VecDeque::new(),
            stats: ControllerStats::default(),
        })
    }

    // Accessors, mainly for hosts and tests.

    pub fn param(&self) -> &Parameter {
        &self.param
    }

    pub fn now(&self) -> Tick {
        self.engine.now()
    }

    pub fn flash(&self) -> &F {
        &self.fil
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.fil
    }

    pub fn mapping(&self) -> &PageLevelMapping {
        &self.mapping
    }

    /// Mutable metadata access, for hosts that seed wear or disturb state.
    pub fn mapping_mut(&mut self) -> &mut PageLevelMapping {
        &mut self.mapping
    }

    pub fn allocator(&self) -> &GenericAllocator {
        &self.allocator
    }

    pub fn stalled_writes(&self) -> usize {
        self.stalled.len()
    }

    /// Cooperative GC preemption (preemptible mode only has an effect).
    pub fn request_gc_preemption(&mut self) {
        self.gc.request_preemption();
    }

    pub fn clear_gc_preemption(&mut self) {
        self.gc.clear_preemption(&mut self.engine);
    }

    /// Aggregate statistics snapshot.
    pub fn stats(&self) -> SimSnapshot {
        let (valid_pages, invalid_pages) = self.mapping.page_statistics();
        let (erase_min, erase_avg, erase_max) =
            self.allocator.erase_count_range(self.mapping.blocks());

        SimSnapshot {
            now: self.engine.now(),
            mapping: self.mapping.stats(),
            controller: self.stats,
            gc: self.gc.stats(),
            wear_leveling: self.wl.stats(),
            read_reclaim: self.rr.stats(),
            job_manager: self.manager.stats(),
            free_blocks: self.allocator.free_block_count(),
            full_blocks: self.allocator.full_block_count(),
            valid_pages,
            invalid_pages,
            erase_count_min: erase_min,
            erase_count_avg: erase_avg,
            erase_count_max: erase_max,
            wear_leveling_factor: self.allocator.wear_leveling_factor(self.mapping.blocks()),
        }
    }

    /// Valid logical pages in `[slpn, slpn + nlp)`.
    pub fn page_usage(&self, slpn: Lpn, nlp: u64) -> u64 {
        self.mapping.page_usage(&self.param, slpn, nlp)
    }

    // Host entry points.

    /// Route a host request by opcode. Returns `false` only for a stalled
    /// write, which the controller retains and resumes after GC.
    pub fn submit(&mut self, req: Request) -> bool {
        match req.opcode {
            Opcode::Read => {
                self.read(req);
                true
            }
            Opcode::Write => self.write(Some(req)),
            Opcode::Trim | Opcode::Format => {
                self.invalidate(req);
                true
            }
            Opcode::Flush => {
                self.flush(req);
                true
            }
        }
    }

    pub fn read(&mut self, req: Request) {
        let tag = self.admit(req);

        self.trigger(TriggerType::ReadMapping, Some(tag));

        let req = self.requests.get_mut(&tag).expect("admitted request");
        self.mapping.read_mapping(
            &self.param,
            &mut self.engine,
            &mut self.memory,
            req,
            EventId::ReadSubmit,
        );
    }

    /// Admit a write, or resume a stalled one when called with `None`.
    /// Returns `false` when the write was stalled by foreground GC; the
    /// request is kept on the stall list and re-driven after GC.
    pub fn write(&mut self, req: Option<Request>) -> bool {
        let mut tag = req.as_ref().map(|r| r.tag);
        if let Some(req) = req {
            self.admit(req);
        }

        if !self.stalled.is_empty() || self.gc.check_write_stall(&self.allocator) {
            if let Some(tag) = tag {
                self.stalled.push_back(tag);
            }

            if !self.gc.check_write_stall(&self.allocator) {
                // Stall cleared; continue with the oldest stalled write.
                let resumed = self.stalled.pop_front().expect("non-empty stall list");
                if tag.is_none() {
                    debug!("write | resume | tag {resumed}");
                }
                tag = Some(resumed);
            } else {
                if let Some(tag) = tag {
                    debug!("write | stopped by GC | tag {tag}");
                }
                self.gc.trigger_foreground(&self.allocator, &mut self.engine);

                return false;
            }
        }

        let tag = tag.expect("write(None) without stalled requests");

        self.trigger(TriggerType::WriteMapping, Some(tag));
        self.gather_write(tag);

        true
    }

    pub fn invalidate(&mut self, req: Request) {
        let tag = self.admit(req);

        let req = self.requests.get_mut(&tag).expect("admitted request");
        self.mapping.invalidate_mapping(
            &self.param,
            &mut self.engine,
            &mut self.memory,
            req,
            EventId::InvalidateSubmit,
        );
    }

    /// The core keeps no dirty host data, so a flush completes right away.
    pub fn flush(&mut self, req: Request) {
        let tag = self.admit(req);
        self.complete_request(tag);
    }

    fn admit(&mut self, req: Request) -> Tag {
        let tag = req.tag;
        let replaced = self.requests.insert(tag, req);
        assert!(replaced.is_none(), "tag {tag} is already in flight");
        tag
    }

    // Event loop.

    /// Run until no events remain. Returns the number of events fired.
    pub fn run_until_idle(&mut self) -> u64 {
        let mut fired = 0;

        while let Some(event) = self.engine.pop() {
            self.dispatch(event);
            fired += 1;
        }

        fired
    }

    /// Run every event scheduled up to and including `tick`.
    pub fn run_until(&mut self, tick: Tick) -> u64 {
        let mut fired = 0;

        while self.engine.peek_tick().is_some_and(|t| t <= tick) {
            let event = self.engine.pop().expect("peeked event");
            self.dispatch(event);
            fired += 1;
        }

        fired
    }

    /// Completions accumulated since the last drain, oldest first.
    pub fn drain_completions(&mut self) -> Vec<Completion> {
        self.completions.drain(..).collect()
    }

    fn dispatch(&mut self, event: Fired) {
        let Fired { tick, id, data } = event;

        match id {
            EventId::ReadSubmit => self.read_submit(data),
            EventId::ReadDone => self.read_done(data),
            EventId::WriteSubmit => self.write_submit(data),
            EventId::WriteDone => self.write_done(data),
            EventId::PartialReadSubmit => self.rmw_read_submit(tick, data),
            EventId::PartialReadDone => self.rmw_read_done(tick, data),
            EventId::PartialWriteSubmit => self.rmw_write_submit(tick, data),
            EventId::PartialWriteDone => self.rmw_write_done(tick, data),
            EventId::InvalidateSubmit => self.invalidate_submit(data),
            EventId::HostComplete => {
                let done = self
                    .completing
                    .remove(&data)
                    .expect("completion for unknown request");
                self.completions.push_back(done);
            }
            EventId::IdleTime => {
                self.manager.on_idle_fire();
                self.gc.trigger_by_idle(&self.allocator, &mut self.engine);
                // Wear leveling and read reclaim have their own triggers
                // (erase callback, read completion) and ignore idle time.
            }
            EventId::GcTrigger => self.gc.on_trigger(&mut pipeline_ctx!(self)),
            EventId::GcReadPage => self.gc.on_read_page(&mut pipeline_ctx!(self), data),
            EventId::GcUpdateMapping => self.gc.on_update_mapping(&mut pipeline_ctx!(self), data),
            EventId::GcWritePage => self.gc.on_write_page(&mut pipeline_ctx!(self), data),
            EventId::GcWriteDone => self.gc.on_write_done(&mut pipeline_ctx!(self), data),
            EventId::GcEraseDone => self.gc.on_erase_done(&mut pipeline_ctx!(self), data),
            EventId::GcDone => {
                let erased = self.gc.session_block(data);
                let round = self.gc.on_done(&mut pipeline_ctx!(self), data);

                self.wl.on_block_erased(&mut pipeline_ctx!(self), erased);

                if let GcRound::Complete { running_again } = round
                    && !running_again
                {
                    self.restart_stalled_requests();
                }
            }
            EventId::WlReadPage => self.wl.on_read_page(&mut pipeline_ctx!(self)),
            EventId::WlUpdateMapping => self.wl.on_update_mapping(&mut pipeline_ctx!(self)),
            EventId::WlWritePage => self.wl.on_write_page(&mut pipeline_ctx!(self)),
            EventId::WlWriteDone => self.wl.on_write_done(&mut pipeline_ctx!(self)),
            EventId::WlEraseDone => self.wl.on_erase_done(&mut pipeline_ctx!(self)),
            EventId::WlDone => self.wl.on_done(&mut pipeline_ctx!(self)),
            EventId::RrReadPage => self.rr.on_read_page(&mut pipeline_ctx!(self)),
            EventId::RrUpdateMapping => self.rr.on_update_mapping(&mut pipeline_ctx!(self)),
            EventId::RrWritePage => self.rr.on_write_page(&mut pipeline_ctx!(self)),
            EventId::RrWriteDone => self.rr.on_write_done(&mut pipeline_ctx!(self)),
            EventId::RrEraseDone => self.rr.on_erase_done(&mut pipeline_ctx!(self)),
            EventId::RrDone => {
                let erased = self.rr.session_block();
                self.rr.on_done(&mut pipeline_ctx!(self));
                self.wl.on_block_erased(&mut pipeline_ctx!(self), erased);
            }
        }
    }

    /// Notify the background jobs of a user-I/O phase; the first job found
    /// running short-circuits the fan-out. The manager's idle timer is
    /// disarmed on mapping triggers and re-armed on completions.
    fn trigger(&mut self, when: TriggerType, tag: Option<Tag>) {
        if matches!(when, TriggerType::ReadMapping | TriggerType::WriteMapping) {
            self.gc.request_arrived(self.engine.now());
        }

        if !self.gc.is_running() && !self.wl.is_running() && when == TriggerType::ReadComplete {
            let ppn = tag
                .and_then(|tag| self.requests.get(&tag))
                .map(|req| req.ppn);

            if let Some(ppn) = ppn
                && ppn.is_valid()
            {
                self.rr.check_read(&mut pipeline_ctx!(self), ppn);
            }
        }

        self.manager.on_user_trigger(&mut self.engine, when);
    }

    // Read path.

    fn read_submit(&mut self, tag: Tag) {
        self.trigger(TriggerType::ReadSubmit, Some(tag));

        let req = self.requests.get(&tag).expect("translated request");

        if req.response == Response::Success {
            let (ppn, dram_address) = (req.ppn, req.dram_address);
            let psbn = self.param.psbn_of_pspn(self.param.pspn_of_ppn(ppn));

            self.mapping.block_metadata_mut(psbn).read_count_after_erase += 1;
            self.fil.read(
                &mut self.engine,
                FilRequest::new(ppn, dram_address, EventId::ReadDone, tag),
            );
        } else {
            // Unwritten page: complete without touching the flash.
            self.complete_request(tag);
        }
    }

    fn read_done(&mut self, tag: Tag) {
        self.trigger(TriggerType::ReadComplete, Some(tag));
        self.complete_request(tag);
    }

    // Write path.

    fn gather_write(&mut self, tag: Tag) {
        let (lpn, slpn, nlp) = {
            let req = &self.requests[&tag];
            (req.lpn.0, req.slpn.0, req.nlp as u64)
        };
        let mms = self.min_mapping_size as u64;

        let aligned_begin = lpn / mms * mms;
        let aligned_end = aligned_begin + mms;
        let chunk_begin = slpn.max(aligned_begin);
        let chunk_end = (slpn + nlp).min(aligned_end);

        self.pending_list[(lpn - aligned_begin) as usize] = Some(tag);

        // Wait for the rest of the chunk.
        if lpn + 1 != chunk_end {
            return;
        }

        let first = self.pending_list.iter().flatten().next().copied().unwrap();
        let last = self.pending_list.iter().flatten().last().copied().unwrap();
        let skip_front = self.requests[&first].offset;
        let skip_end = self.page_size - self.requests[&last].length;

        if aligned_begin == chunk_begin && aligned_end == chunk_end && skip_front == 0 && skip_end == 0
        {
            // Fully aligned: translate once for the whole window.
            let slots: Vec<Tag> = self
                .pending_list
                .iter_mut()
                .map(|slot| slot.take().expect("aligned window is fully populated"))
                .collect();
            let front = slots[0];

            self.write_list.push(slots);

            let req = self.requests.get_mut(&front).expect("admitted request");
            self.mapping.write_mapping(
                &self.param,
                &mut self.engine,
                &mut self.memory,
                &mut self.allocator,
                req,
                EventId::WriteSubmit,
                false,
                AllocationStrategy::LowestEraseCount,
            );
        } else {
            debug!(
                "rmw | insert | chunk {chunk_begin:x}h (+{skip_front}) - {chunk_end:x}h \
                 (-{skip_end}) | align {aligned_begin:x}h - {aligned_end:x}h"
            );

            let slots = std::mem::replace(
                &mut self.pending_list,
                vec![None; self.min_mapping_size as usize],
            );

            let mut merged = false;
            if self.merge_rmw {
                for ctx in self.rmw_list.values_mut() {
                    if ctx.aligned_begin == aligned_begin && !ctx.write_pending {
                        ctx.chain.push(RmwChainNode {
                            chunk_begin,
                            slots: slots.clone(),
                        });
                        merged = true;
                        break;
                    }
                }
            }

            if merged {
                debug!("rmw | merged");
                self.stats.rmw_merged += 1;
                return;
            }

            let head = slots[(chunk_begin - aligned_begin) as usize]
                .expect("first slot of the chunk is populated");
            let previous = self.rmw_list.insert(
                head,
                RmwContext {
                    aligned_begin,
                    chunk_begin,
                    slots,
                    write_pending: false,
                    counter: 0,
                    begin_at: 0,
                    chain: Vec::new(),
                },
            );
            assert!(previous.is_none(), "duplicate write tag {head}");

            self.stats.rmw_count += 1;

            let req = self.requests.get_mut(&head).expect("admitted request");
            self.mapping.read_mapping(
                &self.param,
                &mut self.engine,
                &mut self.memory,
                req,
                EventId::PartialReadSubmit,
            );
        }
    }

    fn write_submit(&mut self, tag: Tag) {
        let at = self
            .write_list
            .iter()
            .position(|slots| slots[0] == tag)
            .expect("unexpected write context");
        let slots = self.write_list.remove(at);

        self.trigger(TriggerType::WriteSubmit, Some(tag));

        let front = &self.requests[&slots[0]];
        let (base_lpn, base_ppn) = (front.lpn.0, front.ppn.0);

        for (offset, slot) in slots.into_iter().enumerate() {
            let req = &self.requests[&slot];

            if req.response == Response::Success {
                let dram_address = req.dram_address;

                self.fil.program(
                    &mut self.engine,
                    Lpn(base_lpn + offset as u64),
                    FilRequest::new(
                        Ppn(base_ppn + offset as u64),
                        dram_address,
                        EventId::WriteDone,
                        slot,
                    ),
                );
            } else {
                self.complete_request(slot);
            }
        }

        self.gc.trigger_foreground(&self.allocator, &mut self.engine);
    }

    fn write_done(&mut self, tag: Tag) {
        self.trigger(TriggerType::WriteComplete, Some(tag));
        self.complete_request(tag);
        self.gc.trigger_foreground(&self.allocator, &mut self.engine);
    }

    // Read-modify-write path.

    fn rmw_read_submit(&mut self, now: Tick, tag: Tag) {
        let ctx = self.rmw_list.get_mut(&tag).expect("unexpected RMW tag");
        ctx.begin_at = now;

        let diff = (ctx.chunk_begin - ctx.aligned_begin) as usize;
        let head_tag = ctx.slots[diff].expect("head slot populated");
        let head = &self.requests[&head_tag];

        debug!(
            "rmw | read | align {:x}h - {:x}h",
            ctx.aligned_begin,
            ctx.aligned_begin + self.min_mapping_size as u64
        );

        if head.response == Response::Success {
            let ppn_begin = head.ppn.0 - diff as u64;
            let mut count = 0u32;

            // Read every slot that has to be merged: missing ones and
            // partial writes.
            for (i, slot) in ctx.slots.iter().enumerate() {
                let (needed, address) = match slot {
                    None => (true, self.pending_base + i as u64 * self.page_size as u64),
                    Some(slot) => {
                        let req = &self.requests[slot];
                        (
                            req.offset != 0 || req.length != self.page_size,
                            req.dram_address,
                        )
                    }
                };

                if needed {
                    self.fil.read(
                        &mut self.engine,
                        FilRequest::new(
                            Ppn(ppn_begin + i as u64),
                            address,
                            EventId::PartialReadDone,
                            tag,
                        ),
                    );
                    count += 1;
                }
            }

            ctx.counter = count;
            self.stats.rmw_read_pages += count as u64;

            if count == 0 {
                ctx.counter = 1;
                self.engine.schedule_now(EventId::PartialReadDone, tag);
            }
        } else {
            // Unwritten window: nothing to merge from the flash.
            ctx.counter = 1;
            self.engine.schedule_now(EventId::PartialReadDone, tag);
        }
    }

    fn rmw_read_done(&mut self, now: Tick, tag: Tag) {
        let ctx = self.rmw_list.get_mut(&tag).expect("unexpected RMW tag");
        ctx.counter -= 1;

        if ctx.counter != 0 {
            return;
        }

        debug!(
            "rmw | read | align {:x}h done ({} ticks)",
            ctx.aligned_begin,
            now - ctx.begin_at
        );

        let diff = (ctx.chunk_begin - ctx.aligned_begin) as usize;
        let head_tag = ctx.slots[diff].expect("head slot populated");

        let req = self.requests.get_mut(&head_tag).expect("admitted request");
        // An unwritten window merges as zeroes and is written out whole.
        req.response = Response::Success;

        self.mapping.write_mapping(
            &self.param,
            &mut self.engine,
            &mut self.memory,
            &mut self.allocator,
            req,
            EventId::PartialWriteSubmit,
            false,
            AllocationStrategy::LowestEraseCount,
        );
    }

    fn rmw_write_submit(&mut self, now: Tick, tag: Tag) {
        let ctx = self.rmw_list.get_mut(&tag).expect("unexpected RMW tag");
        ctx.begin_at = now;
        ctx.write_pending = true;

        let diff = (ctx.chunk_begin - ctx.aligned_begin) as usize;
        let head_tag = ctx.slots[diff].expect("head slot populated");
        let head = &self.requests[&head_tag];

        let lpn_begin = head.lpn.0 - diff as u64;
        let ppn_begin = head.ppn.0 - diff as u64;

        debug!(
            "rmw | write | align {lpn_begin:x}h -> PPN {ppn_begin:x}h"
        );

        let mms = self.min_mapping_size;

        for i in 0..mms as usize {
            let address = match &ctx.slots[i] {
                Some(slot) => self.requests[slot].dram_address,
                None => self.pending_base + i as u64 * self.page_size as u64,
            };

            self.fil.program(
                &mut self.engine,
                Lpn(lpn_begin + i as u64),
                FilRequest::new(
                    Ppn(ppn_begin + i as u64),
                    address,
                    EventId::PartialWriteDone,
                    tag,
                ),
            );
        }

        ctx.counter = mms;
        self.stats.rmw_written_pages += mms as u64;

        self.gc.trigger_foreground(&self.allocator, &mut self.engine);
    }

    fn rmw_write_done(&mut self, now: Tick, tag: Tag) {
        let ctx = self.rmw_list.get_mut(&tag).expect("unexpected RMW tag");
        ctx.counter -= 1;

        if ctx.counter != 0 {
            return;
        }

        let ctx = self.rmw_list.remove(&tag).expect("context present");

        debug!(
            "rmw | write | align {:x}h done ({} ticks)",
            ctx.aligned_begin,
            now - ctx.begin_at
        );

        for slot in ctx
            .slots
            .iter()
            .chain(ctx.chain.iter().flat_map(|node| node.slots.iter()))
            .flatten()
        {
            self.complete_request(*slot);
        }

        self.trigger(TriggerType::WriteComplete, None);
    }

    // Invalidate path.

    fn invalidate_submit(&mut self, tag: Tag) {
        // Mapping entries are already cleared; the stale physical pages
        // wait for garbage collection.
        self.complete_request(tag);
    }

    // Completion and stall handling.

    fn complete_request(&mut self, tag: Tag) {
        let req = self.requests.remove(&tag).expect("completing unknown request");

        debug!("complete | tag {tag} | {:?}", req.response);

        if req.event == EventId::HostComplete {
            self.completing.insert(
                req.data,
                Completion {
                    tag,
                    response: req.response,
                    at: self.engine.now(),
                },
            );
        }

        self.engine.schedule_now(req.event, req.data);
    }

    /// Re-drive stalled writes in FIFO order until the stall re-asserts
    /// or the list drains. Called when a GC round completes.
    pub fn restart_stalled_requests(&mut self) {
        while !self.stalled.is_empty() {
            if !self.write(None) {
                break;
            }
        }
    }

    // Checkpointing.

    /// Capture every piece of state a restore needs. The engine queue is
    /// included, so a restored simulator resumes mid-flight operations.
    pub fn checkpoint(&self) -> FtlCheckpoint {
        let mut requests: Vec<Request> = self.requests.values().cloned().collect();
        requests.sort_by_key(|req| req.tag);

        let mut rmw: Vec<(Tag, RmwContext)> = self
            .rmw_list
            .iter()
            .map(|(tag, ctx)| (*tag, ctx.clone()))
            .collect();
        rmw.sort_by_key(|(tag, _)| *tag);

        let mut completing: Vec<(u64, Completion)> = self
            .completing
            .iter()
            .map(|(data, done)| (*data, *done))
            .collect();
        completing.sort_by_key(|(data, _)| *data);

        FtlCheckpoint {
            total_physical_super_pages: self.param.total_physical_super_pages,
            total_superblocks: self.param.total_superblocks,
            units: self.param.units,
            entry_size: self.mapping.entry_size(),
            engine: self.engine.clone(),
            memory: self.memory.snapshot(),
            fil: self.fil.snapshot(),
            mapping: self.mapping.snapshot(),
            allocator: self.allocator.snapshot(),
            manager: self.manager.snapshot(),
            gc: self.gc.snapshot(),
            wear_leveling: self.wl.snapshot(),
            read_reclaim: self.rr.snapshot(),
            requests,
            pending_list: self.pending_list.clone(),
            write_list: self.write_list.clone(),
            rmw,
            stalled: self.stalled.iter().copied().collect(),
            completing,
            stats: self.stats,
        }
    }

    /// Rebuild a simulator from `config` and a checkpoint taken with the
    /// same configuration. Panics with "FTL configuration mismatch" when
    /// the derived dimensions disagree.
    pub fn restore(
        config: FtlConfig,
        make_flash: impl FnOnce(&Parameter, &crate::config::Timings) -> F,
        checkpoint: FtlCheckpoint,
    ) -> Result<Self, ConfigError> {
        let mut ftl = Self::build(config, make_flash, false)?;

        assert!(
            checkpoint.total_physical_super_pages == ftl.param.total_physical_super_pages
                && checkpoint.total_superblocks == ftl.param.total_superblocks
                && checkpoint.units == ftl.param.units
                && checkpoint.entry_size == ftl.mapping.entry_size(),
            "FTL configuration mismatch"
        );

        ftl.engine = checkpoint.engine;
        ftl.memory.restore(checkpoint.memory);
        ftl.fil.restore(checkpoint.fil);
        ftl.mapping.restore(&ftl.param, checkpoint.mapping);
        ftl.allocator.restore(checkpoint.allocator);
        ftl.manager.restore(checkpoint.manager);
        ftl.gc.restore(checkpoint.gc);
        ftl.wl.restore(checkpoint.wear_leveling);
        ftl.rr.restore(checkpoint.read_reclaim);

        ftl.requests = checkpoint
            .requests
            .into_iter()
            .map(|req| (req.tag, req))
            .collect();
        ftl.pending_list = checkpoint.pending_list;
        ftl.write_list = checkpoint.write_list;
        ftl.rmw_list = checkpoint.rmw.into_iter().collect();
        ftl.stalled = checkpoint.stalled.into_iter().collect();
        ftl.completing = checkpoint.completing.into_iter().collect();
        ftl.stats = checkpoint.stats;

        Ok(ftl)
    }
}

/// Serializable state tree of the whole core.
#[derive(Serialize, Deserialize)]
pub struct FtlCheckpoint {
    // Dimensions, validated on restore.
    pub total_physical_super_pages: u64,
    pub total_superblocks: u64,
    pub units: u64,
    pub entry_size: u32,

    pub engine: Engine,
    pub memory: MemorySnapshot,
    pub fil: FilSnapshot,
    pub mapping: MappingSnapshot,
    pub allocator: AllocatorSnapshot,
    pub manager: JobManagerSnapshot,
    pub gc: GcSnapshot,
    pub wear_leveling: WlSnapshot,
    pub read_reclaim: RrSnapshot,

    pub requests: Vec<Request>,
    pub pending_list: Vec<Option<Tag>>,
    pub write_list: Vec<Vec<Tag>>,
    rmw: Vec<(Tag, RmwContext)>,
    pub stalled: Vec<Tag>,
    pub completing: Vec<(u64, Completion)>,
    pub stats: ControllerStats,
}
