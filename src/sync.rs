//! Synctasks: sequential-looking code over the callback-driven stack.
//!
//! The graph's native API is continuation-passing: wind, then hear back in a
//! callback. A synctask runs on a dedicated worker pool where blocking on
//! the reply channel is harmless, so code can call `syncop_*` wrappers that
//! read like ordinary function calls. A task is runnable while queued,
//! running on a worker, and blocked whenever a wrapper is waiting for its
//! reply; the I/O and timer threads never execute task bodies.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;

use log::error;
use parking_lot::{Condvar, Mutex};

use crate::ctx::Ctx;
use crate::errno::{Errno, OpResult};
use crate::fd::FdRef;
use crate::fop::{EntryOk, Fop, FopReply, ReadvOk, Xdata};
use crate::iobuf::IoPayload;
use crate::stack::{self, Identity, RootFrame};
use crate::types::{Iatt, Loc, OpenFlags, Statfs};
use crate::xlator::Translator;

type Task = Box<dyn FnOnce() + Send>;

struct EnvShared {
    queue: Mutex<VecDeque<Task>>,
    cond: Condvar,
    shutdown: AtomicBool,
}

/// The synctask worker pool.
pub struct SyncEnv {
    shared: Arc<EnvShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEnv")
            .field("queued", &self.shared.queue.lock().len())
            .finish()
    }
}

impl SyncEnv {
    /// Start `worker_count` task workers (at least one).
    pub fn new(worker_count: usize) -> io::Result<SyncEnv> {
        let shared = Arc::new(EnvShared {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let mut workers = Vec::new();
        for idx in 0..worker_count.max(1) {
            let worker_shared = shared.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("syncenv-{idx}"))
                    .spawn(move || worker_loop(worker_shared))?,
            );
        }
        Ok(SyncEnv {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Queue a task; it runs on some worker, in submission order per worker
    /// pickup.
    pub fn spawn(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.queue.lock().push_back(Box::new(task));
        self.shared.cond.notify_one();
    }
}

impl Drop for SyncEnv {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.cond.notify_all();
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: Arc<EnvShared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if shared.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                match queue.pop_front() {
                    Some(task) => break task,
                    None => shared.cond.wait(&mut queue),
                }
            }
        };
        task();
    }
}

/// Run one operation to completion, blocking the calling thread until the
/// reply unwinds. This is the suspension point of every wrapper below.
fn syncop(ctx: &Ctx, xl: &Arc<dyn Translator>, identity: Identity, fop: Fop) -> FopReply {
    let kind = fop.kind();
    let (tx, rx) = mpsc::channel();
    let root = RootFrame::new(identity, ctx.next_unique(), move |reply| {
        // the task may have timed out and gone away; nothing to do then
        let _ = tx.send(reply);
    });
    stack::call(xl, root, fop);
    match rx.recv() {
        Ok(reply) => reply,
        Err(_) => {
            error!("reply channel for {kind:?} closed without a reply");
            FopReply::error_for(kind, Errno::EIO)
        }
    }
}

macro_rules! expect_reply {
    ($reply:expr, $variant:ident) => {
        match $reply {
            FopReply::$variant { op, .. } => op,
            other => {
                // arity checking in the stack makes this unreachable
                error!("mismatched reply shape {:?}", other.kind());
                Err(Errno::EIO)
            }
        }
    };
}

/// Resolve a location.
pub fn syncop_lookup(
    ctx: &Ctx,
    xl: &Arc<dyn Translator>,
    identity: Identity,
    loc: Loc,
    xdata: Xdata,
) -> OpResult<EntryOk> {
    expect_reply!(syncop(ctx, xl, identity, Fop::Lookup { loc, xdata }), Lookup)
}

/// Attributes of a location.
pub fn syncop_stat(
    ctx: &Ctx,
    xl: &Arc<dyn Translator>,
    identity: Identity,
    loc: Loc,
) -> OpResult<Iatt> {
    expect_reply!(syncop(ctx, xl, identity, Fop::Stat { loc, xdata: None }), Stat)
}

/// Open a file at a resolved location.
pub fn syncop_open(
    ctx: &Ctx,
    xl: &Arc<dyn Translator>,
    identity: Identity,
    loc: Loc,
    flags: OpenFlags,
    fd: FdRef,
) -> OpResult<FdRef> {
    expect_reply!(
        syncop(ctx, xl, identity, Fop::Open { loc, flags, fd, xdata: None }),
        Open
    )
}

/// Read from an open (or anonymous) handle.
pub fn syncop_readv(
    ctx: &Ctx,
    xl: &Arc<dyn Translator>,
    identity: Identity,
    fd: FdRef,
    size: usize,
    offset: u64,
) -> OpResult<ReadvOk> {
    expect_reply!(
        syncop(
            ctx,
            xl,
            identity,
            Fop::Readv { fd, size, offset, flags: 0, xdata: None }
        ),
        Readv
    )
}

/// Write through an open (or anonymous) handle.
pub fn syncop_writev(
    ctx: &Ctx,
    xl: &Arc<dyn Translator>,
    identity: Identity,
    fd: FdRef,
    payload: IoPayload,
    offset: u64,
) -> OpResult<crate::fop::PrePostOk> {
    expect_reply!(
        syncop(
            ctx,
            xl,
            identity,
            Fop::Writev { fd, payload, offset, flags: 0, xdata: None }
        ),
        Writev
    )
}

/// Filesystem-wide statistics.
pub fn syncop_statfs(
    ctx: &Ctx,
    xl: &Arc<dyn Translator>,
    identity: Identity,
    loc: Loc,
) -> OpResult<Statfs> {
    expect_reply!(syncop(ctx, xl, identity, Fop::Statfs { loc, xdata: None }), Statfs)
}

/// Directory entries from an open directory handle.
pub fn syncop_readdir(
    ctx: &Ctx,
    xl: &Arc<dyn Translator>,
    identity: Identity,
    fd: FdRef,
    size: usize,
    offset: u64,
) -> OpResult<Vec<crate::types::DirEntry>> {
    expect_reply!(
        syncop(ctx, xl, identity, Fop::Readdir { fd, size, offset, xdata: None }),
        Readdir
    )
}

/// Fetch a configuration specification by key.
pub fn syncop_getspec(
    ctx: &Ctx,
    xl: &Arc<dyn Translator>,
    identity: Identity,
    key: String,
) -> OpResult<String> {
    expect_reply!(
        syncop(ctx, xl, identity, Fop::Getspec { key, flags: 0, xdata: None }),
        Getspec
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xlator::tests_support::EchoLeaf;
    use std::time::Duration;

    #[test]
    fn spawn_runs_tasks() {
        let env = SyncEnv::new(2).unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..8 {
            let tx = tx.clone();
            env.spawn(move || {
                tx.send(i).unwrap();
            });
        }
        let mut got: Vec<i32> = (0..8)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        got.sort_unstable();
        assert_eq!(got, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn syncop_statfs_blocks_for_reply() {
        let ctx = Ctx::new().unwrap();
        let leaf: Arc<dyn Translator> = EchoLeaf::new("leaf");

        let (tx, rx) = mpsc::channel();
        let task_ctx = ctx.clone();
        let task_leaf = leaf.clone();
        ctx.syncenv().spawn(move || {
            let out = syncop_statfs(
                &task_ctx,
                &task_leaf,
                Identity::default(),
                Loc::default(),
            );
            tx.send(out).unwrap();
        });
        let out = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(out.is_ok());
    }
}
