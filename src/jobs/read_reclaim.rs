use std::collections::VecDeque;

use log::debug;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::allocator::AllocationStrategy;
use crate::config::FtlConfig;
use crate::event::EventId;
use crate::jobs::copy::{CopyPipeline, CopySession, CopyStep, PipelineCtx};
use crate::jobs::JobState;
use crate::mapping::BlockMetadata;
use crate::memory::Memory;
use crate::param::Parameter;
use crate::types::{Ppn, Psbn, Tick};

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct RrStats {
    pub rounds: u64,
    pub copied_pages: u64,
    pub erased_blocks: u64,
    /// Reads whose error estimate crossed the threshold.
    pub triggers: u64,
}

// Raw bit-error-rate fit for a 2y-nm MLC device:
// rber = e + α·c^k (wear) + β·c^m·t^n (retention) + γ·c^p·r^q (disturb).
const E: f64 = 8.34e-05;
const ALPHA: f64 = 3.30e-11;
const BETA: f64 = 5.56e-19;
const GAMMA: f64 = 6.26e-13;
const K: f64 = 1.71;
const M: f64 = 2.49;
const N: f64 = 3.33;
const P: f64 = 1.76;
const Q: f64 = 0.47;

const TICKS_PER_DAY: f64 = 86_400.0 * 1e9;

/// Read reclaim: proactively rewrite blocks whose estimated raw bit-error
/// count crossed the threshold.
///
/// Every completed user read draws an error count for the enclosing block
/// from `Binomial(page_size, rber)`. One block is reclaimed at a time;
/// further victims queue by PSBN without duplicates.
pub struct ReadReclaimer {
    state: JobState,
    pipeline: CopyPipeline,
    session: CopySession,
    pending: VecDeque<Psbn>,
    threshold: u32,
    page_size: u32,
    rng: SmallRng,
    begin_at: Tick,
    stats: RrStats,
}

impl ReadReclaimer {
    pub fn new(param: &Parameter, config: &FtlConfig, memory: &mut Memory) -> Self {
        ReadReclaimer {
            state: JobState::Idle,
            pipeline: CopyPipeline::new(
                param,
                memory,
                1,
                "rr",
                AllocationStrategy::LowestEraseCount,
                [
                    EventId::RrReadPage,
                    EventId::RrUpdateMapping,
                    EventId::RrWritePage,
                    EventId::RrWriteDone,
                    EventId::RrEraseDone,
                    EventId::RrDone,
                ],
            ),
            session: CopySession::idle(),
            pending: VecDeque::new(),
            threshold: config.rr_bit_error_threshold,
            page_size: param.page_size,
            rng: SmallRng::seed_from_u64(config.seed ^ 0x72726563),
            begin_at: 0,
            stats: RrStats::default(),
        }
    }

    pub fn stats(&self) -> RrStats {
        self.stats
    }

    pub fn is_running(&self) -> bool {
        self.state > JobState::Idle
    }

    /// Victim block of the running session, for the erase callback.
    pub fn session_block(&self) -> Psbn {
        self.session.block_id
    }

    /// Estimated bit errors for a page of `block` at `now`.
    pub fn estimate_bit_errors(&mut self, now: Tick, block: &BlockMetadata) -> u32 {
        let cycles = block.erased_count as f64;
        let time = now.saturating_sub(block.inserted_at) as f64 / TICKS_PER_DAY;
        let reads = block.read_count_after_erase as f64;

        let rber = E
            + ALPHA * cycles.powf(K)
            + BETA * cycles.powf(M) * time.powf(N)
            + GAMMA * cycles.powf(P) * reads.powf(Q);

        binomial(&mut self.rng, self.page_size, rber)
    }

    /// Post-read error check; returns whether the block crossed the
    /// threshold.
    pub fn check_read(&mut self, ctx: &mut PipelineCtx, ppn: Ppn) -> bool {
        let psbn = ctx.param.psbn_of_pspn(ctx.param.pspn_of_ppn(ppn));
        let now = ctx.engine.now();
        let errors = self.estimate_bit_errors(now, ctx.mapping.block_metadata(psbn));

        if errors < self.threshold {
            return false;
        }

        self.stats.triggers += 1;

        if self.state < JobState::Foreground {
            if let Some(victim) = ctx.allocator.claim_victim(
                ctx.param,
                ctx.mapping.blocks(),
                ctx.engine,
                psbn,
                EventId::RrReadPage,
                0,
            ) {
                debug!("rr | {errors} estimated bit errors, reclaiming PSBN {psbn}");

                self.session = CopySession::start(victim, self.pipeline.write_page_event(), 0);
                self.state = JobState::Foreground;
                self.begin_at = ctx.engine.now();
                self.stats.rounds += 1;
            }
        } else if self.session.block_id != psbn && !self.pending.contains(&psbn) {
            self.pending.push_back(psbn);
        }

        true
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

    /// Block reclaimed; take the next pending victim, if any.
    pub fn on_done(&mut self, ctx: &mut PipelineCtx) {
        debug!(
            "rr | finished PSBN {} in {} ticks",
            self.session.block_id,
            ctx.engine.now() - self.begin_at
        );

        self.session.reset();

        while let Some(next) = self.pending.pop_front() {
            if let Some(victim) = ctx.allocator.claim_victim(
                ctx.param,
                ctx.mapping.blocks(),
                ctx.engine,
                next,
                EventId::RrReadPage,
                0,
            ) {
                self.session = CopySession::start(victim, self.pipeline.write_page_event(), 0);
                self.begin_at = ctx.engine.now();
                self.stats.rounds += 1;
                return;
            }
        }

        self.state = JobState::Idle;
    }

    pub fn snapshot(&self) -> RrSnapshot {
        RrSnapshot {
            state: self.state,
            session: self.session.clone(),
            pending: self.pending.iter().copied().collect(),
            begin_at: self.begin_at,
            stats: self.stats,
        }
    }

    pub fn restore(&mut self, snapshot: RrSnapshot) {
        self.state = snapshot.state;
        self.session = snapshot.session;
        self.pending = snapshot.pending.into_iter().collect();
        self.begin_at = snapshot.begin_at;
        self.stats = snapshot.stats;
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RrSnapshot {
    pub state: JobState,
    pub session: CopySession,
    pub pending: Vec<Psbn>,
    pub begin_at: Tick,
    pub stats: RrStats,
}

/// Draw from `Binomial(n, p)`: CDF inversion for small means, normal
/// approximation above.
fn binomial(rng: &mut SmallRng, n: u32, p: f64) -> u32 {
    if p <= 0.0 || n == 0 {
        return 0;
    }
    if p >= 1.0 {
        return n;
    }

    let mean = n as f64 * p;

    if mean < 32.0 {
        let mut f = (1.0 - p).powi(n as i32);
        let mut u: f64 = rng.random();
        let mut x = 0u32;

        while u > f && x < n {
            u -= f;
            x += 1;
            f *= (n - x + 1) as f64 / x as f64 * p / (1.0 - p);
        }

        x
    } else {
        let u1: f64 = rng.random();
        let u2: f64 = rng.random();
        let z = (-2.0 * u1.max(f64::MIN_POSITIVE).ln()).sqrt()
            * (std::f64::consts::TAU * u2).cos();
        let draw = mean + z * (mean * (1.0 - p)).sqrt();

        draw.round().clamp(0.0, n as f64) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binomial_tracks_the_mean() {
        let mut rng = SmallRng::seed_from_u64(1);

        // Small-mean branch.
        let total: u64 = (0..2000).map(|_| binomial(&mut rng, 4096, 1e-4) as u64).sum();
        let mean = total as f64 / 2000.0;
        assert!((0.2..0.7).contains(&mean), "mean {mean}");

        // Normal-approximation branch.
        let total: u64 = (0..2000).map(|_| binomial(&mut rng, 4096, 0.03) as u64).sum();
        let mean = total as f64 / 2000.0;
        assert!((110.0..135.0).contains(&mean), "mean {mean}");
    }

    #[test]
    fn binomial_degenerate_cases() {
        let mut rng = SmallRng::seed_from_u64(2);

        assert_eq!(0, binomial(&mut rng, 4096, 0.0));
        assert_eq!(4096, binomial(&mut rng, 4096, 1.0));
        assert_eq!(0, binomial(&mut rng, 0, 0.5));
    }
}
