//! Discrete-event simulator of a NAND SSD's flash translation layer.
//!
//! This crate models the internal data path of an SSD with faithful
//! latency behavior: host reads, writes and trims of logical pages are
//! translated through a page-level mapping table into physical page
//! operations against a bank of flash dies, while garbage collection,
//! static wear leveling and read reclaim run in the background and
//! compete for the same blocks.
//!
//! Typical use:
//! - Describe the device with an [`FtlConfig`] (geometry, thresholds,
//!   victim policy, warm-up fill, RNG seed) and build an [`Ftl`].
//! - Submit [`Request`]s, then [`Ftl::run_until_idle`] to drain the event
//!   loop; completed requests appear in [`Ftl::drain_completions`] with
//!   their simulated completion ticks.
//! - Inspect behavior through [`Ftl::stats`], the mapping and allocator
//!   accessors, or the flash model's operation log.
//! - Capture an [`FtlCheckpoint`] to persist the full simulator state and
//!   resume it later.
//!
//! Everything is deterministic: equal configurations (including the seed)
//! replay identically, event for event.

pub mod allocator;
pub mod config;
pub mod event;
pub mod fil;
pub mod filling;
pub mod ftl;
pub mod jobs;
pub mod mapping;
pub mod memory;
pub mod param;
pub mod request;
pub mod stats;
pub mod types;
pub mod util;

pub use allocator::{AllocationStrategy, GenericAllocator, Victim};
pub use config::{
    ConfigError, FillMode, FtlConfig, GcMode, NandLayout, PageAllocation, Timings, VictimPolicy,
};
pub use event::{Engine, EventId};
pub use fil::{FilRequest, FlashInterface, LatencyFil, NandOp, NandOpKind, OpLogLevel};
pub use ftl::{Completion, ControllerStats, Ftl, FtlCheckpoint};
pub use mapping::{BlockMetadata, MappingStats, PageLevelMapping};
pub use memory::{MemAccess, Memory, MemoryType};
pub use param::{Parameter, PhysicalAddress};
pub use request::{Opcode, Request, Response};
pub use stats::SimSnapshot;
pub use types::{Lpn, Lspn, Ppn, Psbn, Pspn, Tag, Tick};
