use std::collections::VecDeque;

use log::warn;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::{FtlConfig, VictimPolicy};
use crate::event::{Engine, EventId};
use crate::mapping::BlockMetadata;
use crate::param::Parameter;
use crate::types::Psbn;

/// Which end of the erase-count-ordered free list a new block comes from.
///
/// Normal writes and GC copy-out take the least-worn block; wear leveling
/// deliberately lands its copies on the most-worn one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationStrategy {
    LowestEraseCount,
    HighestEraseCount,
}

/// A selected victim block and its live page indices.
#[derive(Clone, Debug)]
pub struct Victim {
    pub psbn: Psbn,
    pub pages: Vec<u32>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct UnitPools {
    in_use: Option<Psbn>,
    /// Ordered by non-decreasing erase count.
    free_blocks: VecDeque<Psbn>,
    /// Ordered by non-decreasing erase count.
    full_blocks: VecDeque<Psbn>,
}

/// Free/full block pools per parallelism unit plus victim selection.
pub struct GenericAllocator {
    units: u64,
    total_superblocks: u64,
    pools: Vec<UnitPools>,
    last_allocated: u64,
    last_erased: u64,
    free_block_count: u64,
    full_block_count: u64,
    fgc_threshold: f32,
    bgc_threshold: f32,
    policy: VictimPolicy,
    sampling_factor: u64,
    rng: SmallRng,
}

impl GenericAllocator {
    pub fn new(param: &Parameter, config: &FtlConfig) -> Self {
        let units = param.units;
        let total = param.total_superblocks;

        let mut fgc_threshold = config.fgc_threshold;
        if units as f32 / total as f32 * 2.0 >= fgc_threshold {
            fgc_threshold = (units + 1) as f32 / total as f32 * 2.0;
            warn!(
                "GC threshold cannot hold one free block per unit, raised to {fgc_threshold:.4}"
            );
        }

        let mut pools: Vec<UnitPools> = (0..units).map(|_| UnitPools::default()).collect();
        let per_unit = total / units;
        for (unit, pool) in pools.iter_mut().enumerate() {
            for row in 0..per_unit {
                pool.free_blocks.push_back(Psbn(unit as u64 + row * units));
            }
        }

        GenericAllocator {
            units,
            total_superblocks: total,
            pools,
            last_allocated: 0,
            last_erased: 0,
            free_block_count: total,
            full_block_count: 0,
            fgc_threshold,
            bgc_threshold: config.bgc_threshold,
            policy: config.victim_policy,
            sampling_factor: config.sampling_factor,
            rng: SmallRng::seed_from_u64(config.seed ^ 0x616c6c6f63),
        }
    }

    pub fn free_block_count(&self) -> u64 {
        self.free_block_count
    }

    pub fn full_block_count(&self) -> u64 {
        self.full_block_count
    }

    /// Retire `block_used` (if any) to its unit's full list and hand out a
    /// fresh free block per `strategy`. Panics when the pool is empty; the
    /// GC threshold guarantees that cannot happen in a sane configuration.
    pub fn allocate_block(
        &mut self,
        param: &Parameter,
        blocks: &mut [BlockMetadata],
        block_used: &mut Psbn,
        strategy: AllocationStrategy,
    ) {
        let unit = if block_used.is_valid() {
            let unit = param.unit_of_psbn(*block_used);
            let pool = &mut self.pools[unit as usize];

            assert_eq!(
                Some(*block_used),
                pool.in_use,
                "retired block {block_used} is not the unit's open block"
            );

            let erased = blocks[block_used.0 as usize].erased_count;
            let at = pool
                .full_blocks
                .iter()
                .position(|b| blocks[b.0 as usize].erased_count > erased)
                .unwrap_or(pool.full_blocks.len());
            pool.full_blocks.insert(at, *block_used);
            self.full_block_count += 1;

            unit
        } else {
            let unit = self.last_allocated;
            self.last_allocated = (self.last_allocated + 1) % self.units;
            unit
        };

        let pool = &mut self.pools[unit as usize];
        let fresh = match strategy {
            AllocationStrategy::LowestEraseCount => pool.free_blocks.pop_front(),
            AllocationStrategy::HighestEraseCount => pool.free_blocks.pop_back(),
        };
        let fresh = fresh.unwrap_or_else(|| panic!("no free blocks left in unit {unit}"));

        pool.in_use = Some(fresh);
        *block_used = fresh;
        self.free_block_count -= 1;
    }

    /// Open block of `unit`, or of the round-robin next unit when `None`.
    pub fn block_at(&mut self, param: &Parameter, unit: Option<u64>) -> Psbn {
        let unit = match unit {
            Some(unit) => {
                assert!(unit < param.units, "parallelism unit {unit} out of range");
                unit
            }
            None => {
                let unit = self.last_allocated;
                self.last_allocated = (self.last_allocated + 1) % self.units;
                unit
            }
        };

        self.pools[unit as usize]
            .in_use
            .expect("unit has no open block; allocator not initialized")
    }

    pub fn check_foreground_gc_threshold(&self) -> bool {
        (self.free_block_count as f32 / self.total_superblocks as f32) < self.fgc_threshold
    }

    pub fn check_background_gc_threshold(&self) -> bool {
        (self.free_block_count as f32 / self.total_superblocks as f32) < self.bgc_threshold
    }

    /// Select one victim from the round-robin next unit's full list, remove
    /// it, and schedule `completion(data)`.
    ///
    /// When fewer than `units · sampling_factor` full blocks remain, the
    /// configured policy is bypassed for plain least-erased so a nearly
    /// drained pool is reclaimed cheaply.
    pub fn get_victim_blocks(
        &mut self,
        param: &Parameter,
        blocks: &[BlockMetadata],
        engine: &mut Engine,
        completion: EventId,
        data: u64,
        policy_override: Option<VictimPolicy>,
    ) -> Victim {
        let mut unit = self.last_erased;
        self.last_erased = (self.last_erased + 1) % self.units;

        // Skip units with nothing to reclaim.
        let mut probed = 0;
        while self.pools[unit as usize].full_blocks.is_empty() {
            probed += 1;
            assert!(probed < self.units, "no full blocks to reclaim");
            unit = (unit + 1) % self.units;
        }

        let policy = policy_override.unwrap_or(self.policy);
        let policy = if self.full_block_count < self.units * self.sampling_factor {
            VictimPolicy::LeastErased
        } else {
            policy
        };

        let list = &self.pools[unit as usize].full_blocks;
        let at = pick_victim(policy, list, blocks, param.page, self.sampling_factor, &mut self.rng);
        let psbn = self.pools[unit as usize]
            .full_blocks
            .remove(at)
            .expect("victim index in range");
        self.full_block_count -= 1;

        engine.schedule_now(completion, data);

        Victim {
            psbn,
            pages: blocks[psbn.0 as usize].valid_page_indices(),
        }
    }

    /// Remove one specific full block for reclaim; read reclaim targets
    /// the block that crossed the error threshold rather than a policy
    /// pick. `None` when the block is not sealed (still open or free).
    pub fn claim_victim(
        &mut self,
        param: &Parameter,
        blocks: &[BlockMetadata],
        engine: &mut Engine,
        psbn: Psbn,
        completion: EventId,
        data: u64,
    ) -> Option<Victim> {
        let unit = param.unit_of_psbn(psbn);
        let pool = &mut self.pools[unit as usize];
        let at = pool.full_blocks.iter().position(|b| *b == psbn)?;

        pool.full_blocks.remove(at);
        self.full_block_count -= 1;

        engine.schedule_now(completion, data);

        Some(Victim {
            psbn,
            pages: blocks[psbn.0 as usize].valid_page_indices(),
        })
    }

    /// Count the erase, reset the block, and return it to the ordered free
    /// list of its unit.
    pub fn reclaim_blocks(
        &mut self,
        param: &Parameter,
        blocks: &mut [BlockMetadata],
        engine: &mut Engine,
        psbn: Psbn,
        completion: EventId,
        data: u64,
    ) {
        assert!(psbn.0 < self.total_superblocks, "PSBN {psbn} out of range");

        let meta = &mut blocks[psbn.0 as usize];
        meta.erased_count += 1;
        meta.mark_erased();
        let erased = meta.erased_count;

        let unit = param.unit_of_psbn(psbn);
        let pool = &mut self.pools[unit as usize];
        let at = pool
            .free_blocks
            .iter()
            .position(|b| blocks[b.0 as usize].erased_count > erased)
            .unwrap_or(pool.free_blocks.len());
        pool.free_blocks.insert(at, psbn);
        self.free_block_count += 1;

        engine.schedule_now(completion, data);
    }

    /// Wear-leveling factor `(Σe)² / (N · Σe²)`: 1.0 for perfectly even
    /// wear, approaching 0 as wear skews.
    pub fn wear_leveling_factor(&self, blocks: &[BlockMetadata]) -> f64 {
        let mut total = 0.0;
        let mut square = 0.0;

        for block in blocks {
            let erased = block.erased_count as f64;
            total += erased;
            square += erased * erased;
        }

        if square > 0.0 {
            total * total / square / blocks.len() as f64
        } else {
            0.0
        }
    }

    /// (min, average, max) lifetime erase counts.
    pub fn erase_count_range(&self, blocks: &[BlockMetadata]) -> (u32, f64, u32) {
        let mut min = u32::MAX;
        let mut max = 0;
        let mut total = 0u64;

        for block in blocks {
            min = min.min(block.erased_count);
            max = max.max(block.erased_count);
            total += block.erased_count as u64;
        }

        (min, total as f64 / blocks.len() as f64, max)
    }

    /// Open block of `unit`, without advancing the round-robin cursor.
    pub fn in_use(&self, unit: u64) -> Option<Psbn> {
        self.pools[unit as usize].in_use
    }

    /// Free blocks of `unit` in erase-count order.
    pub fn free_blocks(&self, unit: u64) -> impl Iterator<Item = Psbn> + '_ {
        self.pools[unit as usize].free_blocks.iter().copied()
    }

    /// Sealed blocks of `unit` in erase-count order.
    pub fn full_blocks(&self, unit: u64) -> impl Iterator<Item = Psbn> + '_ {
        self.pools[unit as usize].full_blocks.iter().copied()
    }

    #[cfg(test)]
    pub(crate) fn unit_lists(&self, unit: u64) -> (Option<Psbn>, Vec<Psbn>, Vec<Psbn>) {
        let pool = &self.pools[unit as usize];
        (
            pool.in_use,
            pool.free_blocks.iter().copied().collect(),
            pool.full_blocks.iter().copied().collect(),
        )
    }

    pub fn snapshot(&self) -> AllocatorSnapshot {
        AllocatorSnapshot {
            units: self.units,
            total_superblocks: self.total_superblocks,
            pools: self.pools.clone(),
            last_allocated: self.last_allocated,
            last_erased: self.last_erased,
            free_block_count: self.free_block_count,
            full_block_count: self.full_block_count,
        }
    }

    pub fn restore(&mut self, snapshot: AllocatorSnapshot) {
        assert!(
            snapshot.units == self.units && snapshot.total_superblocks == self.total_superblocks,
            "FTL configuration mismatch"
        );

        self.pools = snapshot.pools;
        self.last_allocated = snapshot.last_allocated;
        self.last_erased = snapshot.last_erased;
        self.free_block_count = snapshot.free_block_count;
        self.full_block_count = snapshot.full_block_count;
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AllocatorSnapshot {
    units: u64,
    total_superblocks: u64,
    pools: Vec<UnitPools>,
    last_allocated: u64,
    last_erased: u64,
    free_block_count: u64,
    full_block_count: u64,
}

/// Position of the victim in `list` under `policy`. Ties break on the
/// first block encountered in list order.
fn pick_victim(
    policy: VictimPolicy,
    list: &VecDeque<Psbn>,
    blocks: &[BlockMetadata],
    pages_per_block: u32,
    sampling_factor: u64,
    rng: &mut SmallRng,
) -> usize {
    let meta = |psbn: Psbn| &blocks[psbn.0 as usize];

    match policy {
        VictimPolicy::Random => rng.random_range(0..list.len()),
        VictimPolicy::Greedy => min_by_key(list.iter().copied(), |b| meta(b).valid_pages.count()),
        VictimPolicy::CostBenefit => {
            let mut best = 0;
            let mut min = f64::MAX;

            for (at, psbn) in list.iter().enumerate() {
                let util = meta(*psbn).valid_pages.count() as f64 / pages_per_block as f64;
                let cost = util / ((1.0 - util) * meta(*psbn).inserted_at as f64);

                if cost < min {
                    min = cost;
                    best = at;
                }
            }

            best
        }
        VictimPolicy::DChoice => {
            if list.len() as u64 <= sampling_factor {
                return 0;
            }

            let mut offsets = Vec::with_capacity(sampling_factor as usize);
            while (offsets.len() as u64) < sampling_factor {
                let candidate = rng.random_range(0..list.len());
                if !offsets.contains(&candidate) {
                    offsets.push(candidate);
                }
            }

            // Greedy among the sample.
            let mut best = offsets[0];
            let mut min = u32::MAX;
            offsets.sort_unstable();
            for at in offsets {
                let valid = meta(list[at]).valid_pages.count();
                if valid < min {
                    min = valid;
                    best = at;
                }
            }

            best
        }
        VictimPolicy::LeastErased => 0,
        VictimPolicy::MostErased => list.len() - 1,
        VictimPolicy::LeastRead => min_by_key(list.iter().copied(), |b| meta(b).read_count_after_erase),
        VictimPolicy::MostRead => max_by_key(list.iter().copied(), |b| meta(b).read_count_after_erase),
        VictimPolicy::Lru => min_by_key(list.iter().copied(), |b| meta(b).inserted_at),
        VictimPolicy::Mru => max_by_key(list.iter().copied(), |b| meta(b).inserted_at),
    }
}

fn min_by_key<K: Ord, I: Iterator<Item = Psbn>>(
    iter: impl IntoIterator<IntoIter = I>,
    mut key: impl FnMut(Psbn) -> K,
) -> usize {
    let mut best = 0;
    let mut min = None;

    for (at, psbn) in iter.into_iter().enumerate() {
        let k = key(psbn);
        if min.as_ref().is_none_or(|m| k < *m) {
            min = Some(k);
            best = at;
        }
    }

    best
}

fn max_by_key<K: Ord, I: Iterator<Item = Psbn>>(
    iter: impl IntoIterator<IntoIter = I>,
    mut key: impl FnMut(Psbn) -> K,
) -> usize {
    let mut best = 0;
    let mut max = None;

    for (at, psbn) in iter.into_iter().enumerate() {
        let k = key(psbn);
        if max.as_ref().is_none_or(|m| k > *m) {
            max = Some(k);
            best = at;
        }
    }

    best
}
