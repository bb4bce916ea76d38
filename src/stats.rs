use serde::{Deserialize, Serialize};

use crate::ftl::ControllerStats;
use crate::jobs::gc::GcStats;
use crate::jobs::read_reclaim::RrStats;
use crate::jobs::wear_leveling::WlStats;
use crate::jobs::JobManagerStats;
use crate::mapping::MappingStats;
use crate::types::Tick;

/// One-shot statistics capture across every component, in the spirit of a
/// device's SMART page.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SimSnapshot {
    pub now: Tick,
    pub mapping: MappingStats,
    pub controller: ControllerStats,
    pub gc: GcStats,
    pub wear_leveling: WlStats,
    pub read_reclaim: RrStats,
    pub job_manager: JobManagerStats,
    pub free_blocks: u64,
    pub full_blocks: u64,
    pub valid_pages: u64,
    pub invalid_pages: u64,
    pub erase_count_min: u32,
    pub erase_count_avg: f64,
    pub erase_count_max: u32,
    /// `(Σe)² / (N · Σe²)`; 1.0 means perfectly even wear.
    pub wear_leveling_factor: f64,
}

impl SimSnapshot {
    /// Mean foreground-GC penalty per affected round, in ticks.
    pub fn avg_gc_penalty(&self) -> f64 {
        if self.gc.penalty_count == 0 {
            0.0
        } else {
            self.gc.total_penalty as f64 / self.gc.penalty_count as f64
        }
    }
}
