//! Poll-driven event loop.
//!
//! One I/O thread multiplexes every registered descriptor. Handlers run on
//! that thread and must never block; a transport that has to wait captures
//! its state and returns. Registration changes from other threads are picked
//! up through a self-pipe wakeup.

use std::collections::HashMap;
use std::io;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bitflags::bitflags;
use log::{error, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use parking_lot::Mutex;

bitflags! {
    /// Readiness bits delivered to a handler.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PollEvents: u8 {
        /// Descriptor readable.
        const IN = 1 << 0;
        /// Descriptor writable.
        const OUT = 1 << 1;
        /// Error or hangup; the owner must tear the descriptor down.
        const ERR = 1 << 2;
    }
}

/// Receives readiness events for one registered descriptor.
pub trait EventHandler: Send + Sync {
    /// Called on the I/O thread whenever the descriptor is ready.
    fn handle_event(self: Arc<Self>, events: PollEvents);
}

/// Registration identifier, used to change interest or unregister.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Token(usize);

struct Registration {
    fd: RawFd,
    handler: Arc<dyn EventHandler>,
    poll_in: bool,
    poll_out: bool,
}

struct EventShared {
    regs: Mutex<HashMap<usize, Registration>>,
    next_token: AtomicUsize,
    wake_rd: RawFd,
    wake_wr: RawFd,
    shutdown: AtomicBool,
}

impl EventShared {
    fn wake(&self) {
        let byte = [0u8; 1];
        let rc = unsafe { libc::write(self.wake_wr, byte.as_ptr() as *const libc::c_void, 1) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                warn!("event: wakeup write failed: {err}");
            }
        }
    }
}

/// The event loop: one poller thread plus the registration table.
pub struct EventPool {
    shared: Arc<EventShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for EventPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPool")
            .field("registered", &self.shared.regs.lock().len())
            .finish()
    }
}

fn set_nonblock(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl EventPool {
    /// Start the poller thread.
    pub fn new() -> io::Result<EventPool> {
        let mut pipe_fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(pipe_fds.as_mut_ptr()) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        set_nonblock(pipe_fds[0])?;
        set_nonblock(pipe_fds[1])?;

        let shared = Arc::new(EventShared {
            regs: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(1),
            wake_rd: pipe_fds[0],
            wake_wr: pipe_fds[1],
            shutdown: AtomicBool::new(false),
        });
        let run_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("event-poll".to_owned())
            .spawn(move || poll_loop(run_shared))?;
        Ok(EventPool {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Register `fd` with its handler and initial interest set.
    pub fn register(
        &self,
        fd: RawFd,
        handler: Arc<dyn EventHandler>,
        poll_in: bool,
        poll_out: bool,
    ) -> Token {
        let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
        self.shared.regs.lock().insert(
            token,
            Registration {
                fd,
                handler,
                poll_in,
                poll_out,
            },
        );
        self.shared.wake();
        Token(token)
    }

    /// Change interest. `None` keeps the current setting for that direction.
    pub fn select_on(&self, token: Token, poll_in: Option<bool>, poll_out: Option<bool>) {
        let mut regs = self.shared.regs.lock();
        if let Some(reg) = regs.get_mut(&token.0) {
            if let Some(pi) = poll_in {
                reg.poll_in = pi;
            }
            if let Some(po) = poll_out {
                reg.poll_out = po;
            }
        }
        drop(regs);
        self.shared.wake();
    }

    /// Drop the registration. The descriptor itself stays open; closing it is
    /// the owner's job, after this returns.
    pub fn unregister(&self, token: Token) {
        self.shared.regs.lock().remove(&token.0);
        self.shared.wake();
    }
}

impl Drop for EventPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.wake();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
        unsafe {
            libc::close(self.shared.wake_rd);
            libc::close(self.shared.wake_wr);
        }
    }
}

fn poll_loop(shared: Arc<EventShared>) {
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }

        // Snapshot the table; handlers run without the lock so they can
        // re-register or unregister from inside the callback.
        let mut tokens = Vec::new();
        let mut pfds: Vec<PollFd<'_>> = Vec::new();
        {
            let regs = shared.regs.lock();
            for (token, reg) in regs.iter() {
                let mut events = PollFlags::empty();
                if reg.poll_in {
                    events |= PollFlags::POLLIN;
                }
                if reg.poll_out {
                    events |= PollFlags::POLLOUT;
                }
                tokens.push(*token);
                // fds stay open while registered; the owner unregisters
                // before closing
                pfds.push(PollFd::new(
                    unsafe { BorrowedFd::borrow_raw(reg.fd) },
                    events,
                ));
            }
        }
        pfds.push(PollFd::new(
            unsafe { BorrowedFd::borrow_raw(shared.wake_rd) },
            PollFlags::POLLIN,
        ));

        match poll(&mut pfds, PollTimeout::from(500u16)) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => {
                error!("event: poll failed: {err}");
                return;
            }
        }

        // Drain wakeup bytes.
        let wake_ready = pfds[pfds.len() - 1]
            .revents()
            .map(|r| r.contains(PollFlags::POLLIN))
            .unwrap_or(false);
        if wake_ready {
            let mut sink = [0u8; 64];
            loop {
                let rc = unsafe {
                    libc::read(shared.wake_rd, sink.as_mut_ptr() as *mut libc::c_void, 64)
                };
                if rc <= 0 {
                    break;
                }
            }
        }

        let revents: Vec<Option<PollFlags>> =
            pfds.iter().take(tokens.len()).map(|p| p.revents()).collect();
        drop(pfds);

        for (token, revents) in tokens.iter().zip(revents) {
            let Some(revents) = revents else {
                continue;
            };
            if revents.is_empty() {
                continue;
            }
            let mut events = PollEvents::empty();
            if revents.contains(PollFlags::POLLIN) {
                events |= PollEvents::IN;
            }
            if revents.contains(PollFlags::POLLOUT) {
                events |= PollEvents::OUT;
            }
            if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
                events |= PollEvents::ERR;
            }
            let handler = shared.regs.lock().get(token).map(|r| r.handler.clone());
            if let Some(handler) = handler {
                handler.handle_event(events);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    struct PipeHandler {
        tx: mpsc::Sender<PollEvents>,
    }

    impl EventHandler for PipeHandler {
        fn handle_event(self: Arc<Self>, events: PollEvents) {
            let _ = self.tx.send(events);
        }
    }

    #[test]
    fn readable_pipe_delivers_events() {
        let pool = EventPool::new().unwrap();
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let (tx, rx) = mpsc::channel();
        let token = pool.register(fds[0], Arc::new(PipeHandler { tx }), true, false);

        let byte = [7u8];
        unsafe { libc::write(fds[1], byte.as_ptr() as *const libc::c_void, 1) };

        let events = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(events.contains(PollEvents::IN));

        pool.unregister(token);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
