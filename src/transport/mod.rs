//! Transports: byte-stream connections carrying framed RPC records.
//!
//! A transport owns one socket, assembles inbound records through a
//! nonblocking state machine, and drains a queue of outbound records through
//! vectored writes. Its owner (the RPC client) hears about life-cycle and
//! message events through [`TransportNotify`].

use smallvec::SmallVec;

use crate::iobuf::{Iobref, IobufSlice, IoPayload};

pub mod name;
pub mod socket;

pub use name::{AddrFamily, ResolvedAddr};
pub use socket::{SocketListener, SocketTransport, TransportOptions};

/// The unit of inbound delivery: one complete record, split into a header
/// region and an optional zero-copy payload region, with the references
/// keeping both alive.
#[derive(Debug)]
pub struct Pollin {
    /// The record bytes up to (not including) any vectored payload.
    pub hdr: IobufSlice,
    /// Vectored payload placed in its own buffer, when the record carried
    /// one.
    pub payload: Option<IobufSlice>,
    /// Keep-alive references for both regions.
    pub iobref: Iobref,
    /// Whether this record is a reply (vs an inbound call).
    pub is_reply: bool,
}

/// What the owner knows about an in-flight XID, consulted while a reply for
/// it is being read off the wire.
#[derive(Clone, Copy, Debug)]
pub struct RequestSpec {
    /// Length of the program reply header preceding any payload.
    pub proghdr_len: usize,
    /// Whether the reply carries a vectored payload to be placed in its own
    /// buffer.
    pub payload_expected: bool,
}

/// Upcalls from a transport to its owner. Never invoked with transport
/// locks held.
pub trait TransportNotify: Send + Sync {
    /// The nonblocking connect completed.
    fn on_connect(&self);

    /// The connection went away; in-flight state must unwind.
    fn on_disconnect(&self);

    /// One complete record arrived.
    fn on_msg(&self, pollin: Pollin);

    /// A reply for `xid` is being read; describe what to expect. `None` for
    /// an unknown xid makes the transport fall back to a simple read.
    fn map_xid(&self, xid: u32) -> Option<RequestSpec>;

    /// A queued record was fully written out.
    fn on_sent(&self) {}
}

/// One chunk of an outbound record.
#[derive(Debug)]
pub enum WriteChunk {
    /// Owned header bytes.
    Bytes(Vec<u8>),
    /// A view into a shared buffer.
    Buf(IobufSlice),
}

impl WriteChunk {
    /// The bytes of this chunk.
    pub fn as_slice(&self) -> &[u8] {
        match self {
            WriteChunk::Bytes(bytes) => bytes,
            WriteChunk::Buf(slice) => slice.as_slice(),
        }
    }
}

/// One outbound record: ordered chunks plus the references keeping shared
/// chunks alive until the record is fully drained.
#[derive(Debug)]
pub struct TransportMsg {
    /// Record chunks in wire order; the first begins with the fragment
    /// header.
    pub chunks: SmallVec<[WriteChunk; 4]>,
    /// Keep-alive set for chunk buffers.
    pub iobref: Iobref,
}

impl TransportMsg {
    /// Build a record from header bytes and an optional payload.
    pub fn new(rpchdr: Vec<u8>, proghdr: Vec<u8>, payload: Option<&IoPayload>) -> TransportMsg {
        let mut chunks: SmallVec<[WriteChunk; 4]> = SmallVec::new();
        let mut iobref = Iobref::new();
        chunks.push(WriteChunk::Bytes(rpchdr));
        if !proghdr.is_empty() {
            chunks.push(WriteChunk::Bytes(proghdr));
        }
        if let Some(payload) = payload {
            for slice in &payload.vector {
                chunks.push(WriteChunk::Buf(slice.clone()));
            }
            iobref.merge(&payload.iobref);
        }
        TransportMsg { chunks, iobref }
    }

    /// Total bytes across all chunks.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(|c| c.as_slice().len()).sum()
    }

    /// Whether the record is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
