use serde::{Deserialize, Serialize};

use crate::event::EventId;
use crate::types::{Lpn, Ppn, Tag};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opcode {
    Read,
    Write,
    Trim,
    Format,
    Flush,
}

/// Outcome reported back to the host with the completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Success,
    /// Read of a logical page that was never written (or was trimmed).
    Unwritten,
}

/// One host sub-request: a single logical page of a possibly larger host
/// command.
///
/// `slpn`/`nlp` describe the enclosing command so the controller can tell
/// where a request sits inside its mapping-aligned window. The mapping
/// fills `ppn` and `response`; the controller fills `dram_address`; the
/// host owns the request again once `event` has fired with `data`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub tag: Tag,
    pub opcode: Opcode,
    pub lpn: Lpn,
    /// First LPN of the enclosing host command.
    pub slpn: Lpn,
    /// Number of logical pages in the enclosing host command.
    pub nlp: u32,
    /// First byte of this page the host actually touches.
    pub offset: u32,
    /// Bytes the host touches starting at `offset`.
    pub length: u32,
    pub ppn: Ppn,
    pub dram_address: u64,
    pub response: Response,
    pub event: EventId,
    pub data: u64,
}

impl Request {
    pub fn new(tag: Tag, opcode: Opcode, lpn: Lpn, event: EventId, data: u64) -> Self {
        Request {
            tag,
            opcode,
            lpn,
            slpn: lpn,
            nlp: 1,
            offset: 0,
            length: 0,
            ppn: Ppn::INVALID,
            dram_address: 0,
            response: Response::Success,
            event,
            data,
        }
    }

    /// Full-page read completing to the host queue.
    pub fn read(tag: Tag, lpn: Lpn, page_size: u32) -> Self {
        let mut req = Request::new(tag, Opcode::Read, lpn, EventId::HostComplete, tag);
        req.length = page_size;
        req
    }

    /// Write of `length` bytes at `offset` within `lpn`, part of a host
    /// command spanning `[slpn, slpn + nlp)`.
    pub fn write(tag: Tag, lpn: Lpn, slpn: Lpn, nlp: u32, offset: u32, length: u32) -> Self {
        let mut req = Request::new(tag, Opcode::Write, lpn, EventId::HostComplete, tag);
        req.slpn = slpn;
        req.nlp = nlp;
        req.offset = offset;
        req.length = length;
        req
    }

    /// Trim of `nlp` logical pages starting at `lpn`.
    pub fn trim(tag: Tag, lpn: Lpn, nlp: u32) -> Self {
        let mut req = Request::new(tag, Opcode::Trim, lpn, EventId::HostComplete, tag);
        req.nlp = nlp;
        req
    }

    /// Internal request used by the copy pipelines; the LPN is recovered
    /// from the spare area after the NAND read.
    pub(crate) fn internal(event: EventId, data: u64) -> Self {
        Request::new(u64::MAX, Opcode::Write, Lpn::INVALID, event, data)
    }
}
