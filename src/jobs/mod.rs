pub mod copy;
pub mod gc;
pub mod read_reclaim;
pub mod wear_leveling;

use serde::{Deserialize, Serialize};

use crate::config::FtlConfig;
use crate::event::{Engine, EventId};
use crate::types::Tick;

/// The six points around user I/O at which the controller notifies the
/// background jobs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerType {
    ReadMapping,
    ReadSubmit,
    ReadComplete,
    WriteMapping,
    WriteSubmit,
    WriteComplete,
}

/// State machine shared by the background jobs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobState {
    Idle,
    /// Preempted; outstanding NAND operations drain, no new ones start.
    Paused,
    Foreground,
    Background,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobManagerStats {
    /// Background invocations by idle-time detection.
    pub idle_fires: u64,
    /// Idle time the jobs could use, in ticks.
    pub usable: u64,
    /// Idle time shorter than the detection threshold, in ticks.
    pub wasted: u64,
}

/// Idle-time detection and accounting for the background jobs.
///
/// The timer is descheduled the moment a user request enters translation
/// and re-armed `idle_threshold` after a completion; it therefore only
/// fires when no user I/O arrived for a full threshold. The job fan-out
/// itself lives on the controller, which owns the jobs.
pub struct JobManager {
    idle_threshold: Tick,
    last_scheduled_at: Tick,
    last_complete_at: Tick,
    stats: JobManagerStats,
}

impl JobManager {
    pub fn new(config: &FtlConfig) -> Self {
        JobManager {
            idle_threshold: config.idle_threshold.ticks(),
            last_scheduled_at: 0,
            last_complete_at: 0,
            stats: JobManagerStats::default(),
        }
    }

    pub fn stats(&self) -> JobManagerStats {
        self.stats
    }

    pub fn reschedule_idle_detection(&mut self, engine: &mut Engine, now: Tick) {
        let tick = now + self.idle_threshold;

        if self.last_scheduled_at < tick {
            self.last_scheduled_at = tick;
            engine.deschedule(EventId::IdleTime);
            engine.schedule_abs(EventId::IdleTime, tick, 0);
        }
    }

    pub fn deschedule_idle_detection(&mut self, engine: &mut Engine) {
        self.last_scheduled_at = 0;
        engine.deschedule(EventId::IdleTime);
    }

    /// Bookkeeping for the controller's trigger fan-out.
    pub fn on_user_trigger(&mut self, engine: &mut Engine, when: TriggerType) {
        let now = engine.now();

        match when {
            TriggerType::ReadMapping | TriggerType::WriteMapping => {
                self.mark_user_mapping(now);
                self.deschedule_idle_detection(engine);
            }
            TriggerType::ReadComplete | TriggerType::WriteComplete => {
                self.last_complete_at = now;
                self.reschedule_idle_detection(engine, now);
            }
            _ => {}
        }
    }

    /// Idle stretches shorter than the threshold count as wasted; caught
    /// ones count as usable from the point the timer fired.
    fn mark_user_mapping(&mut self, now: Tick) {
        if self.last_complete_at > 0 {
            if now <= self.last_scheduled_at {
                self.stats.wasted += now - self.last_complete_at;
            } else {
                self.stats.usable += now - self.last_scheduled_at;
            }

            self.last_complete_at = 0;
        }
    }

    pub fn on_idle_fire(&mut self) {
        self.stats.idle_fires += 1;
    }

    pub fn snapshot(&self) -> JobManagerSnapshot {
        JobManagerSnapshot {
            last_scheduled_at: self.last_scheduled_at,
            last_complete_at: self.last_complete_at,
            stats: self.stats,
        }
    }

    pub fn restore(&mut self, snapshot: JobManagerSnapshot) {
        self.last_scheduled_at = snapshot.last_scheduled_at;
        self.last_complete_at = snapshot.last_complete_at;
        self.stats = snapshot.stats;
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobManagerSnapshot {
    pub last_scheduled_at: Tick,
    pub last_complete_at: Tick,
    pub stats: JobManagerStats,
}
