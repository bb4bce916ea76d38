use fugit::NanosDurationU64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Order in which the four parallelism dimensions interleave into the
/// physical page number space. The first entry owns the lowest digits, so
/// consecutive pages land on that dimension first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageAllocation {
    Channel,
    Way,
    Die,
    Plane,
}

/// Geometry of the simulated NAND array.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NandLayout {
    pub channel: u32,
    pub way: u32,
    pub die: u32,
    pub plane: u32,
    /// Blocks per plane.
    pub block: u32,
    /// Pages per block.
    pub page: u32,
    /// Data bytes per page.
    pub page_size: u32,
    /// Out-of-band bytes per page. Must hold at least a packed LPN.
    pub spare_size: u32,
    pub page_allocation: [PageAllocation; 4],
}

impl NandLayout {
    pub fn parallelism(&self) -> u64 {
        self.channel as u64 * self.way as u64 * self.die as u64 * self.plane as u64
    }

    pub fn total_physical_blocks(&self) -> u64 {
        self.parallelism() * self.block as u64
    }

    /// Size of `dim` in this layout.
    pub fn dimension(&self, dim: PageAllocation) -> u32 {
        match dim {
            PageAllocation::Channel => self.channel,
            PageAllocation::Way => self.way,
            PageAllocation::Die => self.die,
            PageAllocation::Plane => self.plane,
        }
    }
}

/// Victim-block selection policy for garbage collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VictimPolicy {
    /// Uniform pick from the full list.
    Random,
    /// Fewest valid pages.
    Greedy,
    /// Minimum `u / ((1 - u) * age)` with `u = valid / page`.
    CostBenefit,
    /// Greedy among `sampling_factor` uniformly sampled candidates.
    DChoice,
    LeastErased,
    MostErased,
    LeastRead,
    MostRead,
    /// Least recently opened block.
    Lru,
    /// Most recently opened block.
    Mru,
}

/// Which garbage collector variant runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GcMode {
    /// Foreground-threshold GC only.
    Naive,
    /// Adds background GC on idle detection.
    Advanced,
    /// Advanced plus a cooperative preemption hook.
    Preemptible,
}

/// Warm-up fill pattern (write pass / invalidation pass).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillMode {
    SequentialSequential,
    SequentialRandom,
    RandomRandom,
}

/// Latency parameters of the reference collaborator models.
#[derive(Clone, Copy, Debug)]
pub struct Timings {
    pub nand_read: NanosDurationU64,
    pub nand_program: NanosDurationU64,
    pub nand_erase: NanosDurationU64,
    /// Fixed cost per mapping-memory access.
    pub memory_access_overhead: NanosDurationU64,
    /// Incremental cost per byte of a mapping-memory access.
    pub memory_per_byte: NanosDurationU64,
}

impl Default for Timings {
    fn default() -> Self {
        // Ballpark MLC NAND and LPDDR figures.
        Timings {
            nand_read: NanosDurationU64::micros(45),
            nand_program: NanosDurationU64::micros(660),
            nand_erase: NanosDurationU64::millis(4),
            memory_access_overhead: NanosDurationU64::nanos(30),
            memory_per_byte: NanosDurationU64::nanos(1),
        }
    }
}

/// Complete configuration of the FTL core.
#[derive(Clone, Debug)]
pub struct FtlConfig {
    pub layout: NandLayout,
    /// Fraction of physical capacity withheld from the logical space.
    pub overprovision: f32,
    /// Pages striped into one mapping unit. Must equal the product of the
    /// leading `page_allocation` dimensions.
    pub superpage: u32,
    pub victim_policy: VictimPolicy,
    /// `d` of the d-choice policy; also gates the victim short-circuit.
    pub sampling_factor: u64,
    /// Free-block ratio below which writes stall and GC runs foreground.
    pub fgc_threshold: f32,
    /// Free-block ratio below which idle time starts background GC.
    pub bgc_threshold: f32,
    /// Parallel copy sessions per foreground trigger. 0 = one per unit.
    pub fgc_blocks_to_erase: u32,
    /// Parallel copy sessions per background trigger. 0 = one per unit.
    pub bgc_blocks_to_erase: u32,
    pub gc_mode: GcMode,
    /// Wear-leveling factor below which static wear leveling kicks in.
    pub wl_threshold: f64,
    /// Estimated bit errors per page at which read reclaim fires.
    pub rr_bit_error_threshold: u32,
    /// Quiet period after the last completion before jobs run on idle.
    pub idle_threshold: NanosDurationU64,
    /// Merge concurrent read-modify-write windows on the same alignment.
    pub merge_rmw: bool,
    pub fill_mode: FillMode,
    /// Fraction of the logical space written during warm-up.
    pub fill_ratio: f32,
    /// Fraction of the logical space overwritten to create invalid pages.
    pub invalid_fill_ratio: f32,
    /// Seed for every stochastic choice; equal seeds replay identically.
    pub seed: u64,
    pub timings: Timings,
    pub sram_size: u64,
    pub dram_size: u64,
}

impl FtlConfig {
    /// Configuration with every tunable at its default, for the given
    /// geometry.
    pub fn new(layout: NandLayout) -> Self {
        FtlConfig {
            layout,
            overprovision: 0.2,
            superpage: 1,
            victim_policy: VictimPolicy::Greedy,
            sampling_factor: 3,
            fgc_threshold: 0.05,
            bgc_threshold: 0.1,
            fgc_blocks_to_erase: 0,
            bgc_blocks_to_erase: 0,
            gc_mode: GcMode::Advanced,
            wl_threshold: 0.9,
            rr_bit_error_threshold: 50,
            idle_threshold: NanosDurationU64::millis(1),
            merge_rmw: true,
            fill_mode: FillMode::SequentialSequential,
            fill_ratio: 0.0,
            invalid_fill_ratio: 0.0,
            seed: 0,
            timings: Timings::default(),
            sram_size: 4 << 20,
            dram_size: 1 << 30,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let l = &self.layout;

        for (name, value) in [
            ("channel", l.channel),
            ("way", l.way),
            ("die", l.die),
            ("plane", l.plane),
            ("block", l.block),
            ("page", l.page),
            ("page_size", l.page_size),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroDimension(name));
            }
        }

        let mut seen = [false; 4];
        for dim in l.page_allocation {
            let slot = dim as usize;
            if seen[slot] {
                return Err(ConfigError::BadPageAllocation);
            }
            seen[slot] = true;
        }

        if (l.spare_size as usize) < size_of::<u64>() {
            return Err(ConfigError::SpareTooSmall(l.spare_size));
        }

        if !(0.0..1.0).contains(&self.overprovision) {
            return Err(ConfigError::BadRatio("overprovision", self.overprovision));
        }
        for (name, value) in [
            ("fgc_threshold", self.fgc_threshold),
            ("bgc_threshold", self.bgc_threshold),
            ("fill_ratio", self.fill_ratio),
            ("invalid_fill_ratio", self.invalid_fill_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::BadRatio(name, value));
            }
        }

        // The superpage must stripe across the leading page_allocation
        // dimensions so a super-page stays one contiguous PPN run.
        let mut product = 1u64;
        let mut matched = product == self.superpage as u64;
        for dim in l.page_allocation {
            product *= l.dimension(dim) as u64;
            matched |= product == self.superpage as u64;
        }
        if !matched || self.superpage == 0 {
            return Err(ConfigError::BadSuperpage {
                superpage: self.superpage,
                parallelism: l.parallelism(),
            });
        }

        if self.sampling_factor == 0 {
            return Err(ConfigError::ZeroDimension("sampling_factor"));
        }

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("dimension `{0}` must be nonzero")]
    ZeroDimension(&'static str),
    #[error("page_allocation must name each of channel/way/die/plane once")]
    BadPageAllocation,
    #[error("spare area of {0} bytes cannot hold a logical page number")]
    SpareTooSmall(u32),
    #[error("`{0}` out of range: {1}")]
    BadRatio(&'static str, f32),
    #[error(
        "superpage {superpage} is not a product of leading page_allocation \
         dimensions (parallelism {parallelism})"
    )]
    BadSuperpage { superpage: u32, parallelism: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> NandLayout {
        NandLayout {
            channel: 2,
            way: 2,
            die: 1,
            plane: 1,
            block: 16,
            page: 32,
            page_size: 4096,
            spare_size: 16,
            page_allocation: [
                PageAllocation::Channel,
                PageAllocation::Way,
                PageAllocation::Die,
                PageAllocation::Plane,
            ],
        }
    }

    #[test]
    fn default_config_validates() {
        FtlConfig::new(layout()).validate().unwrap();
    }

    #[test]
    fn superpage_must_follow_allocation_order() {
        let mut config = FtlConfig::new(layout());

        config.superpage = 2; // channel level
        config.validate().unwrap();
        config.superpage = 4; // channel * way
        config.validate().unwrap();

        config.superpage = 3;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadSuperpage { .. })
        ));
    }

    #[test]
    fn duplicate_allocation_dimension_rejected() {
        let mut config = FtlConfig::new(layout());
        config.layout.page_allocation[1] = PageAllocation::Channel;

        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadPageAllocation)
        ));
    }
}
