use log::debug;
use serde::{Deserialize, Serialize};

use crate::allocator::AllocationStrategy;
use crate::config::{FtlConfig, VictimPolicy};
use crate::event::EventId;
use crate::jobs::copy::{CopyPipeline, CopySession, CopyStep, PipelineCtx};
use crate::jobs::JobState;
use crate::memory::Memory;
use crate::param::Parameter;
use crate::types::{Psbn, Tick};

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct WlStats {
    pub rounds: u64,
    pub copied_pages: u64,
    pub erased_blocks: u64,
}

/// Static wear leveling.
///
/// After every block erase the allocator-wide wear factor is evaluated;
/// when it falls below the threshold the least-erased full block is copied
/// out with the highest-erase-count allocation strategy, so its cold data
/// lands on the most worn block and frees a barely-worn one. One session
/// at a time.
pub struct WearLeveler {
    state: JobState,
    pipeline: CopyPipeline,
    session: CopySession,
    threshold: f64,
    begin_at: Tick,
    stats: WlStats,
}

impl WearLeveler {
    pub fn new(param: &Parameter, config: &FtlConfig, memory: &mut Memory) -> Self {
        WearLeveler {
            state: JobState::Idle,
            pipeline: CopyPipeline::new(
                param,
                memory,
                1,
                "wl",
                AllocationStrategy::HighestEraseCount,
                [
                    EventId::WlReadPage,
                    EventId::WlUpdateMapping,
                    EventId::WlWritePage,
                    EventId::WlWriteDone,
                    EventId::WlEraseDone,
                    EventId::WlDone,
                ],
            ),
            session: CopySession::idle(),
            threshold: config.wl_threshold,
            begin_at: 0,
            stats: WlStats::default(),
        }
    }

    pub fn stats(&self) -> WlStats {
        self.stats
    }

    pub fn is_running(&self) -> bool {
        self.state >= JobState::Foreground
    }

    /// Erase-callback trigger: start a round when wear skewed past the
    /// threshold and a full block is available to move.
    pub fn on_block_erased(&mut self, ctx: &mut PipelineCtx, _psbn: Psbn) {
        if self.state >= JobState::Foreground {
            return;
        }
        if ctx.allocator.full_block_count() == 0 {
            return;
        }

        let factor = ctx.allocator.wear_leveling_factor(ctx.mapping.blocks());
        if factor >= self.threshold {
            return;
        }

        let victim = ctx.allocator.get_victim_blocks(
            ctx.param,
            ctx.mapping.blocks(),
            ctx.engine,
            EventId::WlReadPage,
            0,
            Some(VictimPolicy::LeastErased),
        );

        debug!(
            "wl | factor {factor:.4} below {:.4}, moving PSBN {}",
            self.threshold, victim.psbn
        );

        self.session = CopySession::start(victim, self.pipeline.write_page_event(), 0);
        self.state = JobState::Foreground;
        self.begin_at = ctx.engine.now();
        self.stats.rounds += 1;
    }

    pub fn on_read_page(&mut self, ctx: &mut PipelineCtx) {
        match self.pipeline.read_page(ctx, &mut self.session, 0) {
            CopyStep::Read => self.stats.copied_pages += ctx.param.superpage as u64,
            CopyStep::Erase => self.stats.erased_blocks += ctx.param.superpage as u64,
        }
    }

    pub fn on_update_mapping(&mut self, ctx: &mut PipelineCtx) {
        self.pipeline.update_mapping(ctx, &mut self.session);
    }

    pub fn on_write_page(&mut self, ctx: &mut PipelineCtx) {
        self.pipeline.write_page(ctx, &mut self.session, 0);
    }

    pub fn on_write_done(&mut self, ctx: &mut PipelineCtx) {
        self.pipeline.write_done(ctx, &mut self.session, 0);
    }

    pub fn on_erase_done(&mut self, ctx: &mut PipelineCtx) {
        self.pipeline.erase_done(ctx, &mut self.session, 0);
    }

    pub fn on_done(&mut self, ctx: &mut PipelineCtx) {
        let moved = self.session.block_id;

        debug!(
            "wl | finished PSBN {} in {} ticks",
            moved,
            ctx.engine.now() - self.begin_at
        );

        self.session.reset();
        self.state = JobState::Idle;

        // The move itself erased a block; re-evaluate.
        self.on_block_erased(ctx, moved);
    }

    pub fn snapshot(&self) -> WlSnapshot {
        WlSnapshot {
            state: self.state,
            session: self.session.clone(),
            begin_at: self.begin_at,
            stats: self.stats,
        }
    }

    pub fn restore(&mut self, snapshot: WlSnapshot) {
        self.state = snapshot.state;
        self.session = snapshot.session;
        self.begin_at = snapshot.begin_at;
        self.stats = snapshot.stats;
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WlSnapshot {
    pub state: JobState,
    pub session: CopySession,
    pub begin_at: Tick,
    pub stats: WlStats,
}
