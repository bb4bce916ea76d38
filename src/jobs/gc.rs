use log::debug;
use serde::{Deserialize, Serialize};

use crate::allocator::{AllocationStrategy, GenericAllocator};
use crate::config::{FtlConfig, GcMode};
use crate::event::{Engine, EventId};
use crate::jobs::copy::{CopyPipeline, CopySession, CopyStep, PipelineCtx};
use crate::jobs::JobState;
use crate::memory::Memory;
use crate::param::Parameter;
use crate::types::Tick;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GcStats {
    pub foreground_rounds: u64,
    pub background_rounds: u64,
    pub copied_pages: u64,
    pub erased_blocks: u64,
    pub penalty_count: u64,
    pub total_penalty: u64,
    pub min_penalty: u64,
    pub max_penalty: u64,
}

impl Default for GcStats {
    fn default() -> Self {
        GcStats {
            foreground_rounds: 0,
            background_rounds: 0,
            copied_pages: 0,
            erased_blocks: 0,
            penalty_count: 0,
            total_penalty: 0,
            min_penalty: u64::MAX,
            max_penalty: 0,
        }
    }
}

/// Result of a session finishing, so the controller can restart stalled
/// writes once the whole round is over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcRound {
    InProgress,
    Complete {
        /// A new round was triggered immediately.
        running_again: bool,
    },
}

/// Garbage collector over parallel copy sessions.
///
/// `Naive` reclaims only when the foreground threshold trips; `Advanced`
/// also turns detected idle time into background rounds; `Preemptible`
/// additionally stops issuing new page reads while preemption is
/// requested (in-flight operations always drain).
pub struct GarbageCollector {
    mode: GcMode,
    state: JobState,
    resume_state: JobState,
    pipeline: CopyPipeline,
    sessions: Vec<CopySession>,
    fgc_sessions: u32,
    bgc_sessions: u32,
    begin_at: Tick,
    first_request_arrival: Tick,
    preempt_requested: bool,
    stats: GcStats,
}

impl GarbageCollector {
    pub fn new(param: &Parameter, config: &FtlConfig, memory: &mut Memory) -> Self {
        let default_sessions = param.units as u32;
        let fgc_sessions = match config.fgc_blocks_to_erase {
            0 => default_sessions,
            n => n,
        };
        let bgc_sessions = match config.bgc_blocks_to_erase {
            0 => default_sessions,
            n => n,
        };
        let sessions = fgc_sessions.max(bgc_sessions);

        GarbageCollector {
            mode: config.gc_mode,
            state: JobState::Idle,
            resume_state: JobState::Idle,
            pipeline: CopyPipeline::new(
                param,
                memory,
                sessions,
                "gc",
                AllocationStrategy::LowestEraseCount,
                [
                    EventId::GcReadPage,
                    EventId::GcUpdateMapping,
                    EventId::GcWritePage,
                    EventId::GcWriteDone,
                    EventId::GcEraseDone,
                    EventId::GcDone,
                ],
            ),
            sessions: (0..sessions).map(|_| CopySession::idle()).collect(),
            fgc_sessions,
            bgc_sessions,
            begin_at: u64::MAX,
            first_request_arrival: u64::MAX,
            preempt_requested: false,
            stats: GcStats::default(),
        }
    }

    pub fn stats(&self) -> GcStats {
        self.stats
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state != JobState::Idle
    }

    /// Victim block of a session, for the erase callback.
    pub fn session_block(&self, index: u64) -> crate::types::Psbn {
        self.sessions[index as usize].block_id
    }

    /// Writes must stall exactly while the foreground threshold holds.
    pub fn check_write_stall(&self, allocator: &GenericAllocator) -> bool {
        allocator.check_foreground_gc_threshold()
    }

    /// Stamp the first user arrival of the round for penalty accounting.
    pub fn request_arrived(&mut self, now: Tick) {
        self.first_request_arrival = self.first_request_arrival.min(now);
    }

    pub fn trigger_foreground(&mut self, allocator: &GenericAllocator, engine: &mut Engine) {
        if allocator.check_foreground_gc_threshold() && self.state == JobState::Idle {
            self.state = JobState::Foreground;
            self.begin_at = engine.now();
            engine.schedule_now(EventId::GcTrigger, 0);
        }
    }

    pub fn trigger_by_idle(&mut self, allocator: &GenericAllocator, engine: &mut Engine) {
        if self.mode != GcMode::Naive
            && allocator.check_background_gc_threshold()
            && self.state == JobState::Idle
        {
            self.state = JobState::Background;
            self.begin_at = engine.now();
            engine.schedule_now(EventId::GcTrigger, 0);
        }
    }

    /// Cooperative preemption hook of the preemptible variant. Nothing in
    /// the core requests preemption; the deciding policy is external.
    pub fn request_preemption(&mut self) {
        self.preempt_requested = true;
    }

    pub fn clear_preemption(&mut self, engine: &mut Engine) {
        self.preempt_requested = false;

        if self.state == JobState::Paused {
            self.state = self.resume_state;

            for (index, session) in self.sessions.iter_mut().enumerate() {
                if session.paused {
                    session.paused = false;
                    engine.schedule_now(EventId::GcReadPage, index as u64);
                }
            }
        }
    }

    /// Fetch one victim per session and start the copies.
    pub fn on_trigger(&mut self, ctx: &mut PipelineCtx) {
        if self.state != JobState::Foreground && self.state != JobState::Background {
            return;
        }

        // The foreground threshold may have tripped while an idle-time
        // round was pending; promote it.
        if self.state == JobState::Background && ctx.allocator.check_foreground_gc_threshold() {
            self.state = JobState::Foreground;
        }

        let wanted = if self.state == JobState::Foreground {
            self.stats.foreground_rounds += 1;
            self.fgc_sessions
        } else {
            self.stats.background_rounds += 1;
            self.bgc_sessions
        };

        let available = (ctx.allocator.full_block_count()).min(wanted as u64) as u32;

        debug!(
            "gc | {:?} | {} session(s)",
            self.state, available
        );

        if available == 0 {
            self.state = JobState::Idle;
            self.begin_at = u64::MAX;
            return;
        }

        for index in 0..available {
            let victim = ctx.allocator.get_victim_blocks(
                ctx.param,
                ctx.mapping.blocks(),
                ctx.engine,
                EventId::GcReadPage,
                index as u64,
                None,
            );

            self.sessions[index as usize] =
                CopySession::start(victim, self.pipeline.write_page_event(), index as u64);
        }
    }

    pub fn on_read_page(&mut self, ctx: &mut PipelineCtx, index: u64) {
        if self.mode == GcMode::Preemptible && self.preempt_requested {
            let session = &mut self.sessions[index as usize];
            session.paused = true;

            if self
                .sessions
                .iter()
                .all(|s| !s.active() || s.paused)
            {
                self.resume_state = self.state;
                self.state = JobState::Paused;
            }

            return;
        }

        let session = &mut self.sessions[index as usize];
        match self.pipeline.read_page(ctx, session, index) {
            CopyStep::Read => self.stats.copied_pages += ctx.param.superpage as u64,
            CopyStep::Erase => self.stats.erased_blocks += ctx.param.superpage as u64,
        }
    }

    pub fn on_update_mapping(&mut self, ctx: &mut PipelineCtx, index: u64) {
        self.pipeline
            .update_mapping(ctx, &mut self.sessions[index as usize]);
    }

    pub fn on_write_page(&mut self, ctx: &mut PipelineCtx, index: u64) {
        self.pipeline
            .write_page(ctx, &mut self.sessions[index as usize], index);
    }

    pub fn on_write_done(&mut self, ctx: &mut PipelineCtx, index: u64) {
        self.pipeline
            .write_done(ctx, &mut self.sessions[index as usize], index);
    }

    pub fn on_erase_done(&mut self, ctx: &mut PipelineCtx, index: u64) {
        self.pipeline
            .erase_done(ctx, &mut self.sessions[index as usize], index);
    }

    /// A session's block was reclaimed. When the last session finishes,
    /// close the round: account the penalty and re-check both thresholds.
    pub fn on_done(&mut self, ctx: &mut PipelineCtx, index: u64) -> GcRound {
        self.sessions[index as usize].reset();

        if self.sessions.iter().any(|s| s.active()) {
            return GcRound::InProgress;
        }

        let now = ctx.engine.now();
        let conflicted = self.first_request_arrival != u64::MAX;

        debug!(
            "gc | {:?} | round finished in {} ticks",
            self.state,
            now - self.begin_at
        );

        if self.first_request_arrival < now {
            let penalty = now - self.first_request_arrival;

            self.stats.penalty_count += 1;
            self.stats.total_penalty += penalty;
            self.stats.min_penalty = self.stats.min_penalty.min(penalty);
            self.stats.max_penalty = self.stats.max_penalty.max(penalty);
        }
        self.first_request_arrival = u64::MAX;

        self.state = JobState::Idle;
        self.begin_at = u64::MAX;

        self.trigger_foreground(ctx.allocator, ctx.engine);
        if self.state == JobState::Idle && !conflicted {
            // No user I/O interfered; keep using the idle stretch.
            self.trigger_by_idle(ctx.allocator, ctx.engine);
        }

        GcRound::Complete {
            running_again: self.state != JobState::Idle,
        }
    }

    pub fn snapshot(&self) -> GcSnapshot {
        GcSnapshot {
            state: self.state,
            resume_state: self.resume_state,
            sessions: self.sessions.clone(),
            begin_at: self.begin_at,
            first_request_arrival: self.first_request_arrival,
            preempt_requested: self.preempt_requested,
            stats: self.stats,
        }
    }

    pub fn restore(&mut self, snapshot: GcSnapshot) {
        assert_eq!(
            self.sessions.len(),
            snapshot.sessions.len(),
            "FTL configuration mismatch"
        );

        self.state = snapshot.state;
        self.resume_state = snapshot.resume_state;
        self.sessions = snapshot.sessions;
        self.begin_at = snapshot.begin_at;
        self.first_request_arrival = snapshot.first_request_arrival;
        self.preempt_requested = snapshot.preempt_requested;
        self.stats = snapshot.stats;
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GcSnapshot {
    pub state: JobState,
    pub resume_state: JobState,
    pub sessions: Vec<CopySession>,
    pub begin_at: Tick,
    pub first_request_arrival: Tick,
    pub preempt_requested: bool,
    pub stats: GcStats,
}
