use serde::{Deserialize, Serialize};

use crate::config::Timings;
use crate::event::{Engine, EventId};
use crate::types::Tick;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryType {
    Sram,
    Dram,
}

/// One entry of a mapping-operation memory trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemAccess {
    pub read: bool,
    pub address: u64,
    pub size: u32,
}

impl MemAccess {
    pub fn read(address: u64, size: u32) -> Self {
        MemAccess {
            read: true,
            address,
            size,
        }
    }

    pub fn write(address: u64, size: u32) -> Self {
        MemAccess {
            read: false,
            address,
            size,
        }
    }
}

const DRAM_BASE: u64 = 1 << 32;

/// Reference SRAM/DRAM model: bump allocation plus a single serialized
/// access queue.
///
/// A trace of accesses costs `Σ (overhead + size · per_byte)` and starts
/// no earlier than the previous trace finished, which preserves
/// per-operation memory latency without simulating individual beats.
pub struct Memory {
    access_overhead: Tick,
    per_byte: Tick,
    sram_size: u64,
    dram_size: u64,
    sram_used: u64,
    dram_used: u64,
    busy_until: Tick,
    accesses: u64,
    bytes: u64,
}

impl Memory {
    pub fn new(timings: &Timings, sram_size: u64, dram_size: u64) -> Self {
        Memory {
            access_overhead: timings.memory_access_overhead.ticks(),
            per_byte: timings.memory_per_byte.ticks(),
            sram_size,
            dram_size,
            sram_used: 0,
            dram_used: 0,
            busy_until: 0,
            accesses: 0,
            bytes: 0,
        }
    }

    /// Reserve `size` bytes of `kind` memory and return the base address.
    ///
    /// With `dry_run` the reservation is only probed: `Some(0)` means a
    /// real call would succeed. A failed real allocation returns `None`
    /// (callers fall back from SRAM to DRAM, or panic).
    pub fn allocate(&mut self, size: u64, kind: MemoryType, label: &str, dry_run: bool) -> Option<u64> {
        let (used, total, base) = match kind {
            MemoryType::Sram => (&mut self.sram_used, self.sram_size, 0),
            MemoryType::Dram => (&mut self.dram_used, self.dram_size, DRAM_BASE),
        };

        if *used + size > total {
            return None;
        }
        if dry_run {
            return Some(0);
        }

        let address = base + *used;
        *used += size;

        log::debug!("memory | allocate | {kind:?} {size} bytes at {address:#x} for {label}");

        Some(address)
    }

    /// Replay `trace` through the serialized queue and fire
    /// `completion(data)` when it drains. An empty trace completes at the
    /// current tick.
    pub fn submit(&mut self, engine: &mut Engine, trace: &[MemAccess], completion: EventId, data: u64) {
        if trace.is_empty() {
            engine.schedule_now(completion, data);
            return;
        }

        let mut duration = 0;
        for access in trace {
            duration += self.access_overhead + access.size as Tick * self.per_byte;
            self.accesses += 1;
            self.bytes += access.size as u64;
        }

        let start = engine.now().max(self.busy_until);
        let done = start + duration;

        self.busy_until = done;
        engine.schedule_abs(completion, done, data);
    }

    /// Total accesses served since construction.
    pub fn total_accesses(&self) -> u64 {
        self.accesses
    }

    /// Total bytes moved since construction.
    pub fn total_bytes(&self) -> u64 {
        self.bytes
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            sram_used: self.sram_used,
            dram_used: self.dram_used,
            busy_until: self.busy_until,
            accesses: self.accesses,
            bytes: self.bytes,
        }
    }

    pub fn restore(&mut self, snapshot: MemorySnapshot) {
        self.sram_used = snapshot.sram_used;
        self.dram_used = snapshot.dram_used;
        self.busy_until = snapshot.busy_until;
        self.accesses = snapshot.accesses;
        self.bytes = snapshot.bytes;
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub sram_used: u64,
    pub dram_used: u64,
    pub busy_until: Tick,
    pub accesses: u64,
    pub bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> Memory {
        Memory::new(&Timings::default(), 1024, 4096)
    }

    #[test]
    fn dry_run_probes_without_reserving() {
        let mut memory = memory();

        assert_eq!(Some(0), memory.allocate(1024, MemoryType::Sram, "", true));
        assert_eq!(Some(0), memory.allocate(1024, MemoryType::Sram, "a", false));
        // Exhausted now.
        assert_eq!(None, memory.allocate(1, MemoryType::Sram, "", true));
        assert!(memory.allocate(16, MemoryType::Dram, "b", false).unwrap() >= DRAM_BASE);
    }

    #[test]
    fn traces_serialize_back_to_back() {
        let mut memory = memory();
        let mut engine = Engine::new();
        let timings = Timings::default();
        let cost = timings.memory_access_overhead.ticks() + 4 * timings.memory_per_byte.ticks();

        memory.submit(&mut engine, &[MemAccess::read(0, 4)], EventId::ReadSubmit, 1);
        memory.submit(&mut engine, &[MemAccess::write(0, 4)], EventId::ReadSubmit, 2);

        let first = engine.pop().unwrap();
        let second = engine.pop().unwrap();
        assert_eq!(cost, first.tick);
        assert_eq!(2 * cost, second.tick);
    }

    #[test]
    fn empty_trace_completes_now() {
        let mut memory = memory();
        let mut engine = Engine::new();

        memory.submit(&mut engine, &[], EventId::WriteSubmit, 7);

        let fired = engine.pop().unwrap();
        assert_eq!((0, 7), (fired.tick, fired.data));
    }
}
