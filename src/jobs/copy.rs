use log::debug;
use serde::{Deserialize, Serialize};

use crate::allocator::{AllocationStrategy, GenericAllocator, Victim};
use crate::event::{Engine, EventId};
use crate::fil::{FilRequest, FlashInterface};
use crate::mapping::PageLevelMapping;
use crate::memory::{Memory, MemoryType};
use crate::param::Parameter;
use crate::request::Request;
use crate::types::{Lpn, Ppn, Psbn, Tick};

/// Everything a copy step needs from the rest of the core, as disjoint
/// borrows of the owning [`Ftl`](crate::Ftl).
pub struct PipelineCtx<'a> {
    pub param: &'a Parameter,
    pub engine: &'a mut Engine,
    pub fil: &'a mut dyn FlashInterface,
    pub memory: &'a mut Memory,
    pub mapping: &'a mut PageLevelMapping,
    pub allocator: &'a mut GenericAllocator,
}

/// One valid page being relocated out of a victim block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CopyEntry {
    /// Internal request carrying the recovered LPN and the new PPN.
    pub request: Request,
    pub page_index: u32,
    pub begin_at: Tick,
}

/// Per-session record of one victim block moving through the pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CopySession {
    pub block_id: Psbn,
    pub copy_list: Vec<CopyEntry>,
    pub page_read_index: u32,
    pub page_write_index: u32,
    pub read_counter: u32,
    pub write_counter: u32,
    pub begin_at: Tick,
    /// Set when a preempted session stopped before its next read.
    pub paused: bool,
}

impl CopySession {
    pub fn idle() -> Self {
        CopySession {
            block_id: Psbn::INVALID,
            copy_list: Vec::new(),
            page_read_index: 0,
            page_write_index: 0,
            read_counter: 0,
            write_counter: 0,
            begin_at: 0,
            paused: false,
        }
    }

    /// Start a session over `victim`, wiring the per-page internal
    /// requests to `write_page` with this session's index as data.
    pub fn start(victim: Victim, write_page: EventId, session_index: u64) -> Self {
        CopySession {
            block_id: victim.psbn,
            copy_list: victim
                .pages
                .into_iter()
                .map(|page_index| CopyEntry {
                    request: Request::internal(write_page, session_index),
                    page_index,
                    begin_at: 0,
                })
                .collect(),
            ..CopySession::idle()
        }
    }

    pub fn active(&self) -> bool {
        self.block_id.is_valid()
    }

    pub fn reset(&mut self) {
        *self = CopySession::idle();
    }
}

/// What [`CopyPipeline::read_page`] did for the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyStep {
    /// Issued a superpage of NAND reads for the next valid page.
    Read,
    /// All valid pages copied; issued the block erase.
    Erase,
}

/// The read → translate → program → erase machinery shared by garbage
/// collection, wear leveling, and read reclaim.
///
/// Each job owns one pipeline parameterized with its event set and its
/// allocation strategy; the session counters serialize the phases exactly:
/// `read_counter` counts outstanding sub-page reads, `write_counter`
/// counts outstanding sub-page programs and is reused for the erases.
pub struct CopyPipeline {
    label: &'static str,
    strategy: AllocationStrategy,
    read_page: EventId,
    update_mapping: EventId,
    write_page: EventId,
    write_done: EventId,
    erase_done: EventId,
    done: EventId,
    buffer_base: u64,
    superpage: u32,
    page_size: u32,
}

impl CopyPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        param: &Parameter,
        memory: &mut Memory,
        sessions: u32,
        label: &'static str,
        strategy: AllocationStrategy,
        events: [EventId; 6],
    ) -> Self {
        let required = sessions as u64 * param.superpage as u64 * param.page_size as u64;

        // Prefer SRAM for the copy buffers, fall back to DRAM.
        let buffer_base = if memory.allocate(required, MemoryType::Sram, "", true).is_some() {
            memory
                .allocate(required, MemoryType::Sram, label, false)
                .expect("SRAM probe succeeded")
        } else {
            memory
                .allocate(required, MemoryType::Dram, label, false)
                .expect("copy buffer does not fit in DRAM")
        };

        let [read_page, update_mapping, write_page, write_done, erase_done, done] = events;

        CopyPipeline {
            label,
            strategy,
            read_page,
            update_mapping,
            write_page,
            write_done,
            erase_done,
            done,
            buffer_base,
            superpage: param.superpage,
            page_size: param.page_size,
        }
    }

    pub fn write_page_event(&self) -> EventId {
        self.write_page
    }

    fn buffer_address(&self, session_index: u64, sub: u32) -> u64 {
        self.buffer_base
            + (session_index * self.superpage as u64 + sub as u64) * self.page_size as u64
    }

    /// Read the next valid page of the session, or erase the block once
    /// every valid page went through.
    pub fn read_page(&self, ctx: &mut PipelineCtx, session: &mut CopySession, index: u64) -> CopyStep {
        let now = ctx.engine.now();

        if (session.page_read_index as usize) < session.copy_list.len() {
            let entry = &mut session.copy_list[session.page_read_index as usize];
            session.page_read_index += 1;

            debug!(
                "{} | read  | PSBN {} page {}",
                self.label, session.block_id, entry.page_index
            );

            for sub in 0..self.superpage {
                let ppn = ctx.param.make_ppn(session.block_id, sub, entry.page_index);

                if sub == 0 {
                    entry.request.tag = index;
                    entry.request.ppn = ppn;
                    entry.request.dram_address = self.buffer_address(index, sub);
                }

                ctx.fil.read(
                    ctx.engine,
                    FilRequest::new(
                        ppn,
                        self.buffer_address(index, sub),
                        self.update_mapping,
                        index,
                    ),
                );
            }

            session.read_counter = self.superpage;
            entry.begin_at = now;

            CopyStep::Read
        } else {
            debug!("{} | erase | PSBN {}", self.label, session.block_id);

            for sub in 0..self.superpage {
                ctx.fil.erase(
                    ctx.engine,
                    FilRequest::new(
                        ctx.param.make_ppn(session.block_id, sub, 0),
                        0,
                        self.erase_done,
                        index,
                    ),
                );
            }

            session.begin_at = now;
            session.write_counter = self.superpage; // Reuse for the erases.

            CopyStep::Erase
        }
    }

    /// One sub-page read completed. When the whole superpage has arrived,
    /// recover the LPN from the spare area and run the write translation.
    pub fn update_mapping(&self, ctx: &mut PipelineCtx, session: &mut CopySession) {
        session.read_counter -= 1;

        if session.read_counter == 0 {
            let entry = &mut session.copy_list[session.page_write_index as usize];

            let lpn = ctx.fil.read_spare(entry.request.ppn);
            assert!(
                lpn.is_valid(),
                "invalid LPN recovered from spare of PPN {}",
                entry.request.ppn
            );
            entry.request.lpn = lpn;

            debug!(
                "{} | read  | PSBN {} PPN {} -> LPN {} ({} ticks)",
                self.label,
                session.block_id,
                entry.request.ppn,
                lpn,
                ctx.engine.now() - entry.begin_at
            );

            ctx.mapping.write_mapping(
                ctx.param,
                ctx.engine,
                ctx.memory,
                ctx.allocator,
                &mut entry.request,
                self.write_page,
                true,
                self.strategy,
            );
        }
    }

    /// Program the translated page to its new location.
    pub fn write_page(&self, ctx: &mut PipelineCtx, session: &mut CopySession, index: u64) {
        let entry = &mut session.copy_list[session.page_write_index as usize];
        session.page_write_index += 1;

        debug!(
            "{} | write | PSBN {} LPN {} -> PPN {}",
            self.label, session.block_id, entry.request.lpn, entry.request.ppn
        );

        for sub in 0..self.superpage {
            ctx.fil.program(
                ctx.engine,
                Lpn(entry.request.lpn.0 + sub as u64),
                FilRequest::new(
                    Ppn(entry.request.ppn.0 + sub as u64),
                    self.buffer_address(index, sub),
                    self.write_done,
                    index,
                ),
            );
        }

        session.write_counter += self.superpage; // Do not overwrite.
        entry.begin_at = ctx.engine.now();
    }

    /// One sub-page program completed; drive the next read when the whole
    /// superpage landed.
    pub fn write_done(&self, ctx: &mut PipelineCtx, session: &mut CopySession, index: u64) {
        session.write_counter -= 1;

        if session.write_counter == 0 {
            ctx.engine.schedule_now(self.read_page, index);
        }
    }

    /// One sub-block erase completed. When the last one lands, reclaim the
    /// block; the allocator schedules the job's `done` event.
    pub fn erase_done(&self, ctx: &mut PipelineCtx, session: &mut CopySession, index: u64) {
        session.write_counter -= 1;

        if session.write_counter == 0 {
            debug!(
                "{} | erase | PSBN {} done ({} ticks)",
                self.label,
                session.block_id,
                ctx.engine.now() - session.begin_at
            );

            ctx.allocator.reclaim_blocks(
                ctx.param,
                ctx.mapping.blocks_mut(),
                ctx.engine,
                session.block_id,
                self.done,
                index,
            );
        }
    }
}
