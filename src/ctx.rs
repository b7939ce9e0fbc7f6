//! The runtime context.
//!
//! Everything that would otherwise be process-global state — the buffer
//! pool, the timer thread, the event loop, the synctask workers, the call
//! id counter — lives in one [`Ctx`] value threaded explicitly through the
//! pieces that need it.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::event::EventPool;
use crate::iobuf::IobufPool;
use crate::sync::SyncEnv;
use crate::timer::Timer;

/// Shared runtime services for one process.
#[derive(Debug)]
pub struct Ctx {
    iobuf_pool: IobufPool,
    timer: Timer,
    event: EventPool,
    syncenv: SyncEnv,
    unique: AtomicU64,
}

impl Ctx {
    /// Start the runtime threads with default sizing.
    pub fn new() -> io::Result<Arc<Ctx>> {
        Ctx::with_config(IobufPool::default(), 2)
    }

    /// Start with a specific buffer pool and synctask worker count.
    pub fn with_config(iobuf_pool: IobufPool, sync_workers: usize) -> io::Result<Arc<Ctx>> {
        Ok(Arc::new(Ctx {
            iobuf_pool,
            timer: Timer::new()?,
            event: EventPool::new()?,
            syncenv: SyncEnv::new(sync_workers)?,
            unique: AtomicU64::new(1),
        }))
    }

    /// The shared buffer pool.
    pub fn iobuf_pool(&self) -> &IobufPool {
        &self.iobuf_pool
    }

    /// The timer thread.
    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    /// The I/O event loop.
    pub fn event(&self) -> &EventPool {
        &self.event
    }

    /// The synctask worker pool.
    pub fn syncenv(&self) -> &SyncEnv {
        &self.syncenv
    }

    /// Next call id; every user request gets one.
    pub fn next_unique(&self) -> u64 {
        self.unique.fetch_add(1, Ordering::Relaxed)
    }
}
