//! Stackable translator runtime for a distributed filesystem client.
//!
//! A client process assembles a directed acyclic graph of *translators*:
//! each receives POSIX-shaped filesystem calls from its parents, may
//! transform, split, or defer them, and forwards work to its children.
//! Leaves talk to remote storage endpoints over an ONC-RPC transport. This
//! crate is the machinery those translators stand on:
//!
//! - the asynchronous call/frame stack ([`stack`], [`fop`]) that winds
//!   operations down the graph and unwinds replies back up, preserving
//!   per-translator state and caller identity;
//! - the GFID-indexed inode and open-file tables ([`inode`], [`fd`]) with
//!   dentry aliasing, per-translator context slots and LRU eviction;
//! - the RPC client transport ([`rpc`], [`transport`]) with in-flight call
//!   tracking, bailout, reconnect, record framing and a liveness ping;
//! - the default forwarding plumbing every translator inherits
//!   ([`xlator`], [`stub`]), the notify fabric, address authentication
//!   ([`auth`]) and the by-GFID virtual-inode overlay ([`gfid_access`]).

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod auth;
pub mod ctx;
pub mod errno;
pub mod event;
pub mod fd;
pub mod fop;
pub mod gfid;
pub mod gfid_access;
pub mod inode;
pub mod iobuf;
pub mod options;
pub mod rpc;
pub mod stack;
pub mod stub;
pub mod sync;
pub mod timer;
pub mod transport;
pub mod types;
pub mod xlator;

pub use crate::ctx::Ctx;
pub use crate::errno::{Errno, OpResult};
pub use crate::fd::FdRef;
pub use crate::fop::{Fop, FopKind, FopReply};
pub use crate::gfid::Gfid;
pub use crate::inode::{InodeRef, InodeTable};
pub use crate::iobuf::{IoPayload, IobufPool, Iobref};
pub use crate::options::Options;
pub use crate::stack::{CallFrame, Identity, RootFrame};
pub use crate::stub::CallStub;
pub use crate::types::{IaType, Iatt, Loc};
pub use crate::xlator::{Event, Graph, Translator, XlatorBase};
