//! Timed callbacks on a dedicated timer thread.
//!
//! Reconnect backoff, RPC bailout sweeps, ping deadlines and LRU
//! housekeeping all run here. Callbacks execute on the timer thread and must
//! not block; anything heavier reschedules itself onto a worker.

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::trace;
use parking_lot::{Condvar, Mutex};

type TimerCbk = Box<dyn FnOnce() + Send>;

struct TimerShared {
    queue: Mutex<BTreeMap<(Instant, u64), TimerCbk>>,
    cond: Condvar,
    shutdown: AtomicBool,
    seq: AtomicU64,
}

/// The timer thread and its pending-callback queue.
pub struct Timer {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("pending", &self.shared.queue.lock().len())
            .finish()
    }
}

impl Timer {
    /// Start the timer thread.
    pub fn new() -> io::Result<Timer> {
        let shared = Arc::new(TimerShared {
            queue: Mutex::new(BTreeMap::new()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            seq: AtomicU64::new(0),
        });
        let run_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("timer".to_owned())
            .spawn(move || timer_loop(run_shared))?;
        Ok(Timer {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Schedule `cbk` to run after `delay`. The returned handle cancels the
    /// callback if it has not fired yet; dropping the handle does not.
    pub fn call_after(&self, delay: Duration, cbk: impl FnOnce() + Send + 'static) -> TimerHandle {
        let seq = self.shared.seq.fetch_add(1, Ordering::Relaxed);
        let key = (Instant::now() + delay, seq);
        {
            let mut queue = self.shared.queue.lock();
            queue.insert(key, Box::new(cbk));
        }
        self.shared.cond.notify_one();
        TimerHandle {
            key,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Number of callbacks not yet fired.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.cond.notify_one();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

/// Cancellation handle for one scheduled callback.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    key: (Instant, u64),
    shared: Weak<TimerShared>,
}

impl TimerHandle {
    /// Remove the callback from the queue. Returns false if it already fired
    /// (or is firing right now) or was cancelled before.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        shared.queue.lock().remove(&self.key).is_some()
    }
}

fn timer_loop(shared: Arc<TimerShared>) {
    let mut queue = shared.queue.lock();
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        let next_deadline = match queue.keys().next().copied() {
            Some((deadline, seq)) => {
                if deadline <= now {
                    let Some(cbk) = queue.remove(&(deadline, seq)) else {
                        continue;
                    };
                    drop(queue);
                    trace!("timer: firing callback {seq}");
                    cbk();
                    queue = shared.queue.lock();
                    continue;
                }
                Some(deadline)
            }
            None => None,
        };
        match next_deadline {
            Some(deadline) => {
                shared.cond.wait_until(&mut queue, deadline);
            }
            None => {
                shared.cond.wait(&mut queue);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn fires_in_order() {
        let timer = Timer::new().unwrap();
        let (tx, rx) = mpsc::channel();

        let tx2 = tx.clone();
        timer.call_after(Duration::from_millis(60), move || tx2.send(2).unwrap());
        timer.call_after(Duration::from_millis(20), move || tx.send(1).unwrap());

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
    }

    #[test]
    fn cancel_prevents_firing() {
        let timer = Timer::new().unwrap();
        let (tx, rx) = mpsc::channel::<()>();

        let handle = timer.call_after(Duration::from_millis(50), move || {
            tx.send(()).unwrap();
        });
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(timer.pending(), 0);
    }
}
