//! ONC-RPC client plumbing: programs, wire encoding, and the connection
//! state machine with its saved-frame tracking.

use std::time::Duration;

pub mod clnt;
pub mod xdr;

pub use clnt::{RpcClient, RpcEvent, RpcNotify, RpcReply};

/// A remote program a client can speak to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RpcProgram {
    /// Program name, for diagnostics.
    pub name: &'static str,
    /// Program number on the wire.
    pub prognum: u32,
    /// Program version on the wire.
    pub progver: u32,
}

/// The filesystem operation program; procedure numbers are
/// [`FopKind`](crate::fop::FopKind) values.
pub const FOP_PROGRAM: RpcProgram = RpcProgram {
    name: "stackfs-fop",
    prognum: 1_298_437,
    progver: 1,
};

/// The dump program carrying the liveness ping.
pub const DUMP_PROGRAM: RpcProgram = RpcProgram {
    name: "stackfs-dump",
    prognum: 123_451_501,
    progver: 1,
};

/// The null procedure of the dump program, used as the liveness ping.
pub const PROC_PING: u32 = 1;

/// Per-connection timing knobs.
#[derive(Clone, Debug)]
pub struct RpcConfig {
    /// Age after which an unanswered call is failed. One configurable, one
    /// default; the 10-second number sometimes seen near bailout code is
    /// the sweep cadence, not this timeout.
    pub frame_timeout: Duration,
    /// Idle window after which connection health is probed with a ping;
    /// zero disables the ping protocol.
    pub ping_timeout: Duration,
    /// Delay between reconnect attempts from the disconnected state.
    pub reconnect_interval: Duration,
    /// Cadence of the bailout sweep while calls are in flight.
    pub bailout_interval: Duration,
}

impl Default for RpcConfig {
    fn default() -> RpcConfig {
        RpcConfig {
            frame_timeout: Duration::from_secs(1800),
            ping_timeout: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(3),
            bailout_interval: Duration::from_secs(10),
        }
    }
}

impl RpcConfig {
    /// Build from translator options (`frame-timeout`, `ping-timeout` in
    /// seconds), falling back to the defaults.
    pub fn from_options(options: &crate::options::Options) -> RpcConfig {
        let mut config = RpcConfig::default();
        if let Some(secs) = options.get_i64("frame-timeout") {
            config.frame_timeout = Duration::from_secs(secs.max(0) as u64);
        }
        if let Some(secs) = options.get_i64("ping-timeout") {
            config.ping_timeout = Duration::from_secs(secs.max(0) as u64);
        }
        config
    }
}
