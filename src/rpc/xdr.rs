//! Wire encoding: record marking and the fixed RPC headers.
//!
//! Messages are framed with the standard 4-byte record-marking header (high
//! bit: last fragment, low 31 bits: fragment size). Call headers carry a
//! project credential flavour holding the caller's identity; the verifier is
//! always empty. Only the handful of fixed header shapes are encoded here;
//! program payloads travel as opaque bytes.

use std::io;

use num_enum::TryFromPrimitive;
use zerocopy::byteorder::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::stack::Identity;

/// Size of the record-marking fragment header.
pub const FRAGHDR_SIZE: usize = 4;

/// Largest fragment expressible in record marking.
pub const MAX_FRAGMENT_SIZE: u32 = 0x7fff_ffff;

/// RPC protocol version spoken.
pub const RPC_VERSION: u32 = 2;

/// Credential flavour carrying `{pid, uid, gid, lk_owner, groups}`.
pub const AUTH_FLAVOUR: u32 = 390_039;

/// The empty flavour used for verifiers.
pub const AUTH_NONE: u32 = 0;

/// Supplementary groups carried on the wire, at most.
pub const MAX_AUTH_GROUPS: usize = 16;

/// Message direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum MsgType {
    /// A request.
    Call = 0,
    /// A response.
    Reply = 1,
}

/// Whether the server took the call at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum ReplyStat {
    /// Accepted; an accept status follows.
    Accepted = 0,
    /// Denied outright.
    Denied = 1,
}

/// Disposition of an accepted call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum AcceptStat {
    /// Executed; the program reply follows.
    Success = 0,
    /// No such program.
    ProgUnavail = 1,
    /// Version mismatch.
    ProgMismatch = 2,
    /// No such procedure.
    ProcUnavail = 3,
    /// Arguments undecodable.
    GarbageArgs = 4,
    /// Server-side failure.
    SystemErr = 5,
}

/// Build the fragment header for a record of `size` bytes.
pub fn encode_fraghdr(size: u32, last: bool) -> io::Result<[u8; 4]> {
    if size > MAX_FRAGMENT_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "fragment exceeds record-marking limit",
        ));
    }
    let word = if last { size | 0x8000_0000 } else { size };
    Ok(word.to_be_bytes())
}

/// Split a fragment header into `(size, last)`.
pub fn decode_fraghdr(raw: [u8; 4]) -> (u32, bool) {
    let word = u32::from_be_bytes(raw);
    (word & MAX_FRAGMENT_SIZE, word & 0x8000_0000 != 0)
}

#[derive(Debug, IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct CallPrefix {
    xid: U32,
    msg_type: U32,
    rpcvers: U32,
    prog: U32,
    vers: U32,
    proc_num: U32,
}

#[derive(Debug, IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct AuthBody {
    lk_owner: U64,
    pid: U32,
    uid: U32,
    gid: U32,
    ngrps: U32,
    groups: [U32; MAX_AUTH_GROUPS],
}

/// Encode the full call header (no fragment header): RPC prefix, identity
/// credential, empty verifier.
pub fn encode_call_header(
    xid: u32,
    prognum: u32,
    progver: u32,
    procnum: u32,
    identity: &Identity,
) -> Vec<u8> {
    let prefix = CallPrefix {
        xid: U32::new(xid),
        msg_type: U32::new(MsgType::Call as u32),
        rpcvers: U32::new(RPC_VERSION),
        prog: U32::new(prognum),
        vers: U32::new(progver),
        proc_num: U32::new(procnum),
    };

    let mut groups = [U32::new(0); MAX_AUTH_GROUPS];
    let ngrps = identity.groups.len().min(MAX_AUTH_GROUPS);
    for (slot, gid) in groups.iter_mut().zip(identity.groups.iter()) {
        *slot = U32::new(*gid);
    }
    let body = AuthBody {
        lk_owner: U64::new(identity.effective_lk_owner()),
        pid: U32::new(identity.pid as u32),
        uid: U32::new(identity.uid),
        gid: U32::new(identity.gid),
        ngrps: U32::new(ngrps as u32),
        groups,
    };
    let body_bytes = body.as_bytes();

    let mut out = Vec::with_capacity(
        std::mem::size_of::<CallPrefix>() + 16 + body_bytes.len(),
    );
    out.extend_from_slice(prefix.as_bytes());
    out.extend_from_slice(&AUTH_FLAVOUR.to_be_bytes());
    out.extend_from_slice(&(body_bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(body_bytes);
    out.extend_from_slice(&AUTH_NONE.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out
}

/// A decoded call header.
#[derive(Clone, Debug)]
pub struct CallHeader {
    /// Transaction id.
    pub xid: u32,
    /// Program number.
    pub prognum: u32,
    /// Program version.
    pub progver: u32,
    /// Procedure number.
    pub procnum: u32,
    /// Decoded caller identity.
    pub identity: Identity,
    /// Bytes consumed; the program arguments start here.
    pub header_len: usize,
}

fn read_u32(buf: &[u8], at: usize) -> io::Result<u32> {
    let end = at.checked_add(4).filter(|end| *end <= buf.len()).ok_or_else(short)?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..end]);
    Ok(u32::from_be_bytes(raw))
}

fn short() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "short RPC header")
}

fn bad(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Decode a call header (for the server half of a conversation).
pub fn decode_call_header(buf: &[u8]) -> io::Result<CallHeader> {
    let prefix = CallPrefix::read_from_bytes(
        buf.get(..std::mem::size_of::<CallPrefix>()).ok_or_else(short)?,
    )
    .map_err(|_| short())?;
    if prefix.msg_type.get() != MsgType::Call as u32 {
        return Err(bad("not a call"));
    }
    if prefix.rpcvers.get() != RPC_VERSION {
        return Err(bad("unsupported RPC version"));
    }

    let mut at = std::mem::size_of::<CallPrefix>();
    let cred_flavour = read_u32(buf, at)?;
    let cred_len = read_u32(buf, at + 4)? as usize;
    at += 8;

    let mut identity = Identity::default();
    if cred_flavour == AUTH_FLAVOUR {
        let body = AuthBody::read_from_bytes(
            buf.get(at..at + std::mem::size_of::<AuthBody>()).ok_or_else(short)?,
        )
        .map_err(|_| short())?;
        identity.lk_owner = body.lk_owner.get();
        identity.pid = body.pid.get() as i32;
        identity.uid = body.uid.get();
        identity.gid = body.gid.get();
        let ngrps = (body.ngrps.get() as usize).min(MAX_AUTH_GROUPS);
        identity.groups = body.groups[..ngrps].iter().map(|g| g.get()).collect();
    }
    at = at
        .checked_add(cred_len.div_ceil(4) * 4)
        .filter(|end| *end <= buf.len())
        .ok_or_else(short)?;

    let _verf_flavour = read_u32(buf, at)?;
    let verf_len = read_u32(buf, at + 4)? as usize;
    at = at
        .checked_add(8 + verf_len.div_ceil(4) * 4)
        .filter(|end| *end <= buf.len())
        .ok_or_else(short)?;

    Ok(CallHeader {
        xid: prefix.xid.get(),
        prognum: prefix.prog.get(),
        progver: prefix.vers.get(),
        procnum: prefix.proc_num.get(),
        identity,
        header_len: at,
    })
}

/// A decoded reply header.
#[derive(Clone, Debug)]
pub struct ReplyHeader {
    /// Transaction id echoing the call.
    pub xid: u32,
    /// Accepted or denied.
    pub reply_stat: ReplyStat,
    /// Disposition, present only when accepted.
    pub accept_stat: Option<AcceptStat>,
    /// Bytes consumed; the program reply starts here on success.
    pub header_len: usize,
}

impl ReplyHeader {
    /// Whether the program reply actually follows.
    pub fn is_success(&self) -> bool {
        self.reply_stat == ReplyStat::Accepted && self.accept_stat == Some(AcceptStat::Success)
    }
}

/// Decode a reply header.
pub fn decode_reply_header(buf: &[u8]) -> io::Result<ReplyHeader> {
    let xid = read_u32(buf, 0)?;
    let msg_type = read_u32(buf, 4)?;
    if msg_type != MsgType::Reply as u32 {
        return Err(bad("not a reply"));
    }
    let reply_stat = ReplyStat::try_from(read_u32(buf, 8)?).map_err(|_| bad("bad reply status"))?;

    match reply_stat {
        ReplyStat::Denied => Ok(ReplyHeader {
            xid,
            reply_stat,
            accept_stat: None,
            header_len: buf.len().min(12),
        }),
        ReplyStat::Accepted => {
            let _verf_flavour = read_u32(buf, 12)?;
            let verf_len = read_u32(buf, 16)? as usize;
            let at = 20usize
                .checked_add(verf_len.div_ceil(4) * 4)
                .ok_or_else(short)?;
            let accept_stat =
                AcceptStat::try_from(read_u32(buf, at)?).map_err(|_| bad("bad accept status"))?;
            Ok(ReplyHeader {
                xid,
                reply_stat,
                accept_stat: Some(accept_stat),
                header_len: at + 4,
            })
        }
    }
}

/// Encode a reply header (for test servers and the server half).
pub fn encode_reply_header(xid: u32, accept_stat: AcceptStat) -> Vec<u8> {
    let mut out = Vec::with_capacity(24);
    out.extend_from_slice(&xid.to_be_bytes());
    out.extend_from_slice(&(MsgType::Reply as u32).to_be_bytes());
    out.extend_from_slice(&(ReplyStat::Accepted as u32).to_be_bytes());
    out.extend_from_slice(&AUTH_NONE.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&(accept_stat as u32).to_be_bytes());
    out
}

/// Encode a denial (for test servers).
pub fn encode_denied_reply(xid: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&xid.to_be_bytes());
    out.extend_from_slice(&(MsgType::Reply as u32).to_be_bytes());
    out.extend_from_slice(&(ReplyStat::Denied as u32).to_be_bytes());
    // auth_error(1), rejected for bad credentials
    out.extend_from_slice(&1u32.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn fraghdr_roundtrip() {
        let hdr = encode_fraghdr(0x1234, true).unwrap();
        assert_eq!(decode_fraghdr(hdr), (0x1234, true));

        let hdr = encode_fraghdr(MAX_FRAGMENT_SIZE, false).unwrap();
        assert_eq!(decode_fraghdr(hdr), (MAX_FRAGMENT_SIZE, false));

        assert!(encode_fraghdr(MAX_FRAGMENT_SIZE + 1, true).is_err());
    }

    #[test]
    fn call_header_roundtrip() {
        let identity = Identity {
            uid: 500,
            gid: 100,
            pid: 4242,
            groups: smallvec![100, 27, 999],
            lk_owner: 0,
        };
        let raw = encode_call_header(77, 1_298_437, 1, 22, &identity);
        let decoded = decode_call_header(&raw).unwrap();

        assert_eq!(decoded.xid, 77);
        assert_eq!(decoded.prognum, 1_298_437);
        assert_eq!(decoded.procnum, 22);
        assert_eq!(decoded.identity.uid, 500);
        assert_eq!(decoded.identity.pid, 4242);
        assert_eq!(decoded.identity.groups.as_slice(), &[100, 27, 999]);
        // lk_owner fell back to the pid
        assert_eq!(decoded.identity.lk_owner, 4242);
        assert_eq!(decoded.header_len, raw.len());
    }

    #[test]
    fn reply_header_roundtrip() {
        let raw = encode_reply_header(88, AcceptStat::Success);
        let decoded = decode_reply_header(&raw).unwrap();
        assert_eq!(decoded.xid, 88);
        assert!(decoded.is_success());
        assert_eq!(decoded.header_len, raw.len());

        let raw = encode_reply_header(89, AcceptStat::ProcUnavail);
        let decoded = decode_reply_header(&raw).unwrap();
        assert!(!decoded.is_success());

        let raw = encode_denied_reply(90);
        let decoded = decode_reply_header(&raw).unwrap();
        assert_eq!(decoded.reply_stat, ReplyStat::Denied);
        assert!(!decoded.is_success());
    }

    #[test]
    fn truncated_headers_are_rejected() {
        let identity = Identity::default();
        let raw = encode_call_header(1, 2, 3, 4, &identity);
        for cut in [0, 3, 10, raw.len() - 1] {
            assert!(decode_call_header(&raw[..cut]).is_err());
        }
        let raw = encode_reply_header(5, AcceptStat::Success);
        assert!(decode_reply_header(&raw[..11]).is_err());
    }
}
