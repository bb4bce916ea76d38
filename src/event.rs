use std::cmp::Ordering;
use std::collections::BinaryHeap;

use serde::{Deserialize, Serialize};

use crate::types::Tick;

/// Every event the core can schedule, by stable name.
///
/// The payload word passed alongside (`data`) is a request tag for the
/// controller events and a copy-session index for the job events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventId {
    // Controller: read/write paths.
    ReadSubmit,
    ReadDone,
    WriteSubmit,
    WriteDone,
    PartialReadSubmit,
    PartialReadDone,
    PartialWriteSubmit,
    PartialWriteDone,
    InvalidateSubmit,
    /// Returns the request to the host (completion queue).
    HostComplete,
    /// Idle-time detection timer of the background job manager.
    IdleTime,
    // Garbage collector copy pipeline.
    GcTrigger,
    GcReadPage,
    GcUpdateMapping,
    GcWritePage,
    GcWriteDone,
    GcEraseDone,
    GcDone,
    // Wear leveling copy pipeline.
    WlReadPage,
    WlUpdateMapping,
    WlWritePage,
    WlWriteDone,
    WlEraseDone,
    WlDone,
    // Read reclaim copy pipeline.
    RrReadPage,
    RrUpdateMapping,
    RrWritePage,
    RrWriteDone,
    RrEraseDone,
    RrDone,
}

/// One pending entry in the event queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scheduled {
    pub tick: Tick,
    seq: u64,
    pub id: EventId,
    pub data: u64,
}

// Reversed so that `BinaryHeap` pops the earliest tick; ties fire in
// scheduling order.
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.tick, other.seq).cmp(&(self.tick, self.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// An event popped from the queue, ready for dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fired {
    pub tick: Tick,
    pub id: EventId,
    pub data: u64,
}

/// Deterministic discrete-event queue.
///
/// Single-threaded: all mutation happens between events. Time only moves
/// forward when an event is popped.
///
/// Serialization is canonical (entries ordered by firing order), so two
/// queues with equal content produce byte-equal checkpoints regardless of
/// their internal heap layout.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(from = "EngineState", into = "EngineState")]
pub struct Engine {
    now: Tick,
    seq: u64,
    queue: BinaryHeap<Scheduled>,
}

#[derive(Serialize, Deserialize)]
struct EngineState {
    now: Tick,
    seq: u64,
    queue: Vec<Scheduled>,
}

impl From<Engine> for EngineState {
    fn from(engine: Engine) -> Self {
        let mut queue = engine.queue.into_vec();
        queue.sort_by_key(|entry| (entry.tick, entry.seq));

        EngineState {
            now: engine.now,
            seq: engine.seq,
            queue,
        }
    }
}

impl From<EngineState> for Engine {
    fn from(state: EngineState) -> Self {
        Engine {
            now: state.now,
            seq: state.seq,
            queue: state.queue.into_iter().collect(),
        }
    }
}

impl Engine {
    pub fn new() -> Self {
        Engine::default()
    }

    /// Current simulation time.
    pub fn now(&self) -> Tick {
        self.now
    }

    /// Schedule `id` to fire `delay` ticks from now.
    pub fn schedule(&mut self, id: EventId, delay: Tick, data: u64) {
        self.schedule_abs(id, self.now + delay, data);
    }

    /// Schedule `id` to fire at the current tick, after already-queued
    /// events for this tick.
    pub fn schedule_now(&mut self, id: EventId, data: u64) {
        self.schedule_abs(id, self.now, data);
    }

    /// Schedule `id` at an absolute tick, which must not be in the past.
    pub fn schedule_abs(&mut self, id: EventId, tick: Tick, data: u64) {
        assert!(
            tick >= self.now,
            "scheduling {id:?} at {tick} before now ({})",
            self.now
        );

        self.queue.push(Scheduled {
            tick,
            seq: self.seq,
            id,
            data,
        });
        self.seq += 1;
    }

    /// Whether any entry for `id` is pending.
    pub fn is_scheduled(&self, id: EventId) -> bool {
        self.queue.iter().any(|entry| entry.id == id)
    }

    /// Remove every pending entry for `id`.
    pub fn deschedule(&mut self, id: EventId) {
        self.queue.retain(|entry| entry.id != id);
    }

    /// Pop the next event and advance time to it.
    pub fn pop(&mut self) -> Option<Fired> {
        let entry = self.queue.pop()?;

        debug_assert!(entry.tick >= self.now);
        self.now = entry.tick;

        Some(Fired {
            tick: entry.tick,
            id: entry.id,
            data: entry.data,
        })
    }

    /// Tick of the next pending event.
    pub fn peek_tick(&self) -> Option<Tick> {
        self.queue.peek().map(|entry| entry.tick)
    }

    /// Pending entry count.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_tick_then_fifo_order() {
        let mut engine = Engine::new();

        engine.schedule(EventId::ReadSubmit, 10, 1);
        engine.schedule(EventId::WriteSubmit, 5, 2);
        engine.schedule(EventId::ReadDone, 5, 3);

        let first = engine.pop().unwrap();
        assert_eq!((EventId::WriteSubmit, 5, 2), (first.id, first.tick, first.data));
        let second = engine.pop().unwrap();
        assert_eq!(EventId::ReadDone, second.id);
        let third = engine.pop().unwrap();
        assert_eq!((EventId::ReadSubmit, 10), (third.id, third.tick));
        assert_eq!(10, engine.now());
        assert!(engine.pop().is_none());
    }

    #[test]
    fn deschedule_removes_all_matching() {
        let mut engine = Engine::new();

        engine.schedule(EventId::IdleTime, 100, 0);
        engine.schedule(EventId::ReadSubmit, 50, 0);
        assert!(engine.is_scheduled(EventId::IdleTime));

        engine.deschedule(EventId::IdleTime);
        assert!(!engine.is_scheduled(EventId::IdleTime));
        assert_eq!(1, engine.pending());
    }

    #[test]
    #[should_panic(expected = "before now")]
    fn scheduling_in_the_past_panics() {
        let mut engine = Engine::new();

        engine.schedule(EventId::ReadSubmit, 10, 0);
        engine.pop();
        engine.schedule_abs(EventId::ReadSubmit, 5, 0);
    }
}
