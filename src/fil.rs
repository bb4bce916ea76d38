use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::Timings;
use crate::event::{Engine, EventId};
use crate::param::Parameter;
use crate::types::{Lpn, Ppn, Tick};

/// One operation handed to the flash interface layer.
#[derive(Clone, Copy, Debug)]
pub struct FilRequest {
    pub ppn: Ppn,
    pub dram_address: u64,
    pub completion: EventId,
    pub data: u64,
}

impl FilRequest {
    pub fn new(ppn: Ppn, dram_address: u64, completion: EventId, data: u64) -> Self {
        FilRequest {
            ppn,
            dram_address,
            completion,
            data,
        }
    }
}

/// Contract the core consumes from the NAND timing model.
///
/// `read`/`program`/`erase` complete by scheduling `completion(data)` on
/// the engine. The spare area stores the logical page number for reverse
/// mapping: `program` records it, `read_spare` recovers it synchronously
/// (the timing of the enclosing NAND read is already modeled by `read`),
/// and `write_spare` seeds it during warm-up fill.
pub trait FlashInterface {
    fn read(&mut self, engine: &mut Engine, req: FilRequest);
    fn program(&mut self, engine: &mut Engine, lpn: Lpn, req: FilRequest);
    /// Erase the block containing `req.ppn` (callers pass page index 0).
    fn erase(&mut self, engine: &mut Engine, req: FilRequest);
    fn write_spare(&mut self, ppn: Ppn, lpn: Lpn);
    /// Recover the LPN last programmed into `ppn`, or the invalid LPN.
    fn read_spare(&self, ppn: Ppn) -> Lpn;

    fn snapshot(&self) -> FilSnapshot {
        FilSnapshot::default()
    }
    fn restore(&mut self, _snapshot: FilSnapshot) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NandOpKind {
    Read,
    Program,
    Erase,
}

/// How much the flash model records about the operations it serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpLogLevel {
    /// No operation logging.
    None,
    /// Log operation kind and addresses.
    Minimal,
    /// Additionally log issue and completion ticks.
    Timed,
}

/// One logged NAND operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NandOp {
    pub kind: NandOpKind,
    pub ppn: Ppn,
    pub lpn: Option<Lpn>,
    pub issued_at: Option<Tick>,
    pub complete_at: Option<Tick>,
}

impl NandOp {
    fn record(level: OpLogLevel, kind: NandOpKind, ppn: Ppn, lpn: Option<Lpn>, issued_at: Tick, complete_at: Tick) -> Option<Self> {
        match level {
            OpLogLevel::None => None,
            OpLogLevel::Minimal => Some(NandOp {
                kind,
                ppn,
                lpn,
                issued_at: None,
                complete_at: None,
            }),
            OpLogLevel::Timed => Some(NandOp {
                kind,
                ppn,
                lpn,
                issued_at: Some(issued_at),
                complete_at: Some(complete_at),
            }),
        }
    }
}

/// Portable state of a flash model, for checkpointing.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FilSnapshot {
    pub busy_until: Vec<Tick>,
    pub spare: Vec<(u64, u64)>,
}

/// Reference flash timing model: fixed per-operation latencies, serialized
/// per (channel, way, die, plane) element, with an in-memory spare store
/// and an optional operation log.
pub struct LatencyFil {
    read_latency: Tick,
    program_latency: Tick,
    erase_latency: Tick,
    parallelism: u64,
    busy_until: Vec<Tick>,
    spare: HashMap<u64, Lpn>,
    log_level: OpLogLevel,
    log: Vec<NandOp>,
}

impl LatencyFil {
    pub fn new(param: &Parameter, timings: &Timings) -> Self {
        LatencyFil {
            read_latency: timings.nand_read.ticks(),
            program_latency: timings.nand_program.ticks(),
            erase_latency: timings.nand_erase.ticks(),
            parallelism: param.parallelism,
            busy_until: vec![0; param.parallelism as usize],
            spare: HashMap::new(),
            log_level: OpLogLevel::None,
            log: Vec::new(),
        }
    }

    pub fn set_logging(&mut self, level: OpLogLevel) {
        self.log_level = level;
    }

    /// Recorded operations, oldest first.
    pub fn operations(&self) -> &[NandOp] {
        &self.log
    }

    pub fn clear_operations(&mut self) {
        self.log.clear();
    }

    /// Serialize `req` behind earlier operations on the same parallel
    /// element and schedule its completion.
    fn submit(&mut self, engine: &mut Engine, latency: Tick, kind: NandOpKind, lpn: Option<Lpn>, req: FilRequest) {
        let element = (req.ppn.0 % self.parallelism) as usize;
        let start = engine.now().max(self.busy_until[element]);
        let done = start + latency;

        self.busy_until[element] = done;
        engine.schedule_abs(req.completion, done, req.data);

        if let Some(op) = NandOp::record(self.log_level, kind, req.ppn, lpn, engine.now(), done) {
            self.log.push(op);
        }
    }
}

impl FlashInterface for LatencyFil {
    fn read(&mut self, engine: &mut Engine, req: FilRequest) {
        self.submit(engine, self.read_latency, NandOpKind::Read, None, req);
    }

    fn program(&mut self, engine: &mut Engine, lpn: Lpn, req: FilRequest) {
        self.spare.insert(req.ppn.0, lpn);
        self.submit(engine, self.program_latency, NandOpKind::Program, Some(lpn), req);
    }

    fn erase(&mut self, engine: &mut Engine, req: FilRequest) {
        self.submit(engine, self.erase_latency, NandOpKind::Erase, None, req);
    }

    fn write_spare(&mut self, ppn: Ppn, lpn: Lpn) {
        self.spare.insert(ppn.0, lpn);
    }

    fn read_spare(&self, ppn: Ppn) -> Lpn {
        self.spare.get(&ppn.0).copied().unwrap_or(Lpn::INVALID)
    }

    fn snapshot(&self) -> FilSnapshot {
        let mut spare: Vec<(u64, u64)> = self.spare.iter().map(|(k, v)| (*k, v.0)).collect();
        spare.sort_unstable();

        FilSnapshot {
            busy_until: self.busy_until.clone(),
            spare,
        }
    }

    fn restore(&mut self, snapshot: FilSnapshot) {
        assert_eq!(
            self.busy_until.len(),
            snapshot.busy_until.len(),
            "FTL configuration mismatch"
        );

        self.busy_until = snapshot.busy_until;
        self.spare = snapshot
            .spare
            .into_iter()
            .map(|(k, v)| (k, Lpn(v)))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FtlConfig, NandLayout, PageAllocation};

    fn param() -> Parameter {
        let config = FtlConfig::new(NandLayout {
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
        });
        Parameter::new(&config)
    }

    #[test]
    fn same_element_serializes_different_elements_overlap() {
        let param = param();
        let mut engine = Engine::new();
        let mut fil = LatencyFil::new(&param, &Timings::default());
        fil.set_logging(OpLogLevel::Timed);

        // PPN 0 and 4 share parallel element 0; PPN 1 is element 1.
        fil.read(&mut engine, FilRequest::new(Ppn(0), 0, EventId::ReadDone, 1));
        fil.read(&mut engine, FilRequest::new(Ppn(4), 0, EventId::ReadDone, 2));
        fil.read(&mut engine, FilRequest::new(Ppn(1), 0, EventId::ReadDone, 3));

        let ops = fil.operations();
        let read = Timings::default().nand_read.ticks();
        assert_eq!(Some(read), ops[0].complete_at);
        assert_eq!(Some(2 * read), ops[1].complete_at);
        assert_eq!(Some(read), ops[2].complete_at);
    }

    #[test]
    fn spare_survives_program_and_seed() {
        let param = param();
        let mut engine = Engine::new();
        let mut fil = LatencyFil::new(&param, &Timings::default());

        assert!(!fil.read_spare(Ppn(9)).is_valid());

        fil.program(
            &mut engine,
            Lpn(7),
            FilRequest::new(Ppn(9), 0, EventId::WriteDone, 0),
        );
        assert_eq!(Lpn(7), fil.read_spare(Ppn(9)));

        fil.write_spare(Ppn(10), Lpn(8));
        assert_eq!(Lpn(8), fil.read_spare(Ppn(10)));
    }
}
