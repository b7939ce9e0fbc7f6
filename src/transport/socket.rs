//! Nonblocking socket transport.
//!
//! Outbound records queue as iovec sequences and drain on writability;
//! partial writes leave the residual vector for the next wakeup. Inbound
//! bytes run through a resumable record-assembly state machine that peels
//! the fragment header, sizes one buffer for the whole record, walks the
//! reply (or call) header structure, and optionally diverts a vectored
//! payload into its own buffer for zero-copy delivery. Any I/O error funnels
//! into one poll-error path: flush the write queue, close, tell the owner.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};

use crate::ctx::Ctx;
use crate::event::{EventHandler, PollEvents, Token};
use crate::iobuf::{Iobref, IobufMut, IobufSlice};
use crate::options::Options;
use crate::rpc::xdr::{self, MsgType, ReplyStat};

use super::name::{
    self, AddrFamily, ResolvedAddr, sockaddr_storage_from, sockaddr_un_from,
};
use super::{Pollin, RequestSpec, TransportMsg, TransportNotify};

/// Default remote port when only a host is configured.
pub const DEFAULT_REMOTE_PORT: u16 = 24007;

/// Default socket window (receive and send buffer) size.
pub const DEFAULT_WINDOW_SIZE: usize = 512 * 1024;

const MIN_WINDOW_SIZE: usize = 128 * 1024;
const MAX_WINDOW_SIZE: usize = 1024 * 1024;

/// Decides, for an inbound call, how many bytes of the record belong to the
/// inline header; the remainder is diverted to a payload buffer. Programs
/// that never take vectored requests leave this unset.
pub type CallSizer = Arc<dyn Fn(usize) -> Option<usize> + Send + Sync>;

/// Configuration of one socket transport.
#[derive(Clone, Default)]
pub struct TransportOptions {
    /// Remote host name or address (inet families).
    pub remote_host: Option<String>,
    /// Remote port; defaults to [`DEFAULT_REMOTE_PORT`].
    pub remote_port: Option<u16>,
    /// Remote path (unix family).
    pub connect_path: Option<PathBuf>,
    /// Local path a unix client binds to before connecting.
    pub bind_path: Option<PathBuf>,
    /// Address family; guessed from the configured endpoint when unset.
    pub address_family: Option<AddrFamily>,
    /// Socket window: applied to both SO_RCVBUF and SO_SNDBUF.
    pub window_size: usize,
    /// Disable Nagle; on by default.
    pub nodelay: bool,
    /// Keepalive `(idle, interval)` seconds; `None` leaves it off.
    pub keepalive: Option<(u32, u32)>,
    /// Use an ephemeral port instead of claiming a privileged one.
    pub bind_insecure: bool,
    /// Listen backlog for server endpoints.
    pub listen_backlog: i32,
}

impl std::fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportOptions")
            .field("remote_host", &self.remote_host)
            .field("remote_port", &self.remote_port)
            .field("connect_path", &self.connect_path)
            .finish()
    }
}

impl TransportOptions {
    /// Parse from flat options, with logged defaults.
    pub fn from_options(options: &Options) -> TransportOptions {
        let mut out = TransportOptions {
            window_size: DEFAULT_WINDOW_SIZE,
            nodelay: true,
            listen_backlog: 10,
            ..TransportOptions::default()
        };
        out.remote_host = options.get("remote-host").map(str::to_owned);
        out.remote_port = options
            .get_i64("remote-port")
            .and_then(|p| u16::try_from(p).ok());
        out.connect_path = options
            .get("transport.socket.connect-path")
            .map(PathBuf::from);
        out.bind_path = options.get("transport.socket.bind-path").map(PathBuf::from);
        out.address_family = options
            .get("transport.address-family")
            .and_then(AddrFamily::parse);
        if let Some(size) = options.get_i64("transport.window-size") {
            out.window_size = (size.max(0) as usize).clamp(MIN_WINDOW_SIZE, MAX_WINDOW_SIZE);
        }
        if let Some(nodelay) = options.get_bool("transport.socket.nodelay") {
            out.nodelay = nodelay;
        }
        if options.get_bool("transport.socket.keepalive") == Some(true) {
            let idle = options
                .get_u32("transport.socket.keepalive-idle")
                .unwrap_or(20);
            let intvl = options
                .get_u32("transport.socket.keepalive-interval")
                .unwrap_or(2);
            out.keepalive = Some((idle, intvl));
        }
        if let Some(insecure) = options.get_bool("transport.socket.bind-insecure") {
            out.bind_insecure = insecure;
        }
        if let Some(backlog) = options.get_i64("transport.listen-backlog") {
            out.listen_backlog = backlog.clamp(1, 1024) as i32;
        }
        out
    }
}

// ---- low-level fd helpers (failure surfaces as io::Error) ----

fn set_nonblock(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_nodelay(fd: RawFd) -> io::Result<()> {
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &on as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    trace!("NODELAY enabled for socket {fd}");
    Ok(())
}

fn set_window_size(fd: RawFd, size: usize) {
    for opt in [libc::SO_RCVBUF, libc::SO_SNDBUF] {
        let val = size as libc::c_int;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                &val as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc == -1 {
            error!(
                "setting window size {size} on socket {fd} failed: {}",
                io::Error::last_os_error()
            );
        }
    }
}

fn set_keepalive(fd: RawFd, idle: u32, intvl: u32) -> io::Result<()> {
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &on as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    for (opt, val) in [(libc::TCP_KEEPIDLE, idle), (libc::TCP_KEEPINTVL, intvl)] {
        let val = val as libc::c_int;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                opt,
                &val as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    trace!("keep-alive enabled for socket {fd}, idle {idle}, interval {intvl}");
    Ok(())
}

fn connect_finish_error(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }
    Ok(())
}

fn local_identifier(fd: RawFd) -> Option<String> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(
            fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc == -1 {
        return None;
    }
    identifier_of_storage(&storage)
}

fn peer_identifier_of(fd: RawFd) -> Option<String> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getpeername(
            fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc == -1 {
        return None;
    }
    identifier_of_storage(&storage)
}

fn identifier_of_storage(storage: &libc::sockaddr_storage) -> Option<String> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(format!("{}:{}", ip, u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(format!("{}:{}", ip, u16::from_be(sin6.sin6_port)))
        }
        libc::AF_UNIX => {
            let sun = unsafe { &*(storage as *const _ as *const libc::sockaddr_un) };
            let bytes: Vec<u8> = sun
                .sun_path
                .iter()
                .take_while(|c| **c != 0)
                .map(|c| *c as u8)
                .collect();
            Some(String::from_utf8_lossy(&bytes).into_owned())
        }
        _ => None,
    }
}

// ---- outbound queue ----

struct IoqEntry {
    msg: TransportMsg,
    chunk_idx: usize,
    chunk_off: usize,
}

impl IoqEntry {
    fn new(msg: TransportMsg) -> IoqEntry {
        IoqEntry {
            msg,
            chunk_idx: 0,
            chunk_off: 0,
        }
    }

    fn is_done(&self) -> bool {
        self.chunk_idx >= self.msg.chunks.len()
    }

    fn advance(&mut self, mut written: usize) {
        while written > 0 && !self.is_done() {
            let chunk_len = self.msg.chunks[self.chunk_idx].as_slice().len() - self.chunk_off;
            if written >= chunk_len {
                written -= chunk_len;
                self.chunk_idx += 1;
                self.chunk_off = 0;
            } else {
                self.chunk_off += written;
                written = 0;
            }
        }
        while !self.is_done() && self.msg.chunks[self.chunk_idx].as_slice().len() == self.chunk_off
        {
            self.chunk_idx += 1;
            self.chunk_off = 0;
        }
    }

    /// Write as much as the socket takes. `Ok(true)` when fully drained.
    fn churn(&mut self, fd: RawFd, written_total: &AtomicU64) -> io::Result<bool> {
        loop {
            if self.is_done() {
                return Ok(true);
            }
            let mut iovecs: Vec<libc::iovec> = Vec::with_capacity(self.msg.chunks.len());
            for (idx, chunk) in self.msg.chunks.iter().enumerate().skip(self.chunk_idx) {
                let slice = chunk.as_slice();
                let off = if idx == self.chunk_idx { self.chunk_off } else { 0 };
                iovecs.push(libc::iovec {
                    iov_base: slice[off..].as_ptr() as *mut libc::c_void,
                    iov_len: slice.len() - off,
                });
            }
            let rc = unsafe {
                libc::writev(fd, iovecs.as_ptr(), iovecs.len() as libc::c_int)
            };
            if rc == -1 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) => return Ok(false),
                    Some(libc::EINTR) => continue,
                    _ => {
                        warn!("writev failed: {err}");
                        return Err(err);
                    }
                }
            }
            if rc == 0 {
                return Ok(false);
            }
            written_total.fetch_add(rc as u64, Ordering::Relaxed);
            self.advance(rc as usize);
        }
    }
}

// ---- inbound record assembly ----

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RecordState {
    Nada,
    ReadingFraghdr,
    ReadFraghdr,
    ReadingFrag,
    Complete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FragPhase {
    /// Reading xid + message type.
    MsgType,
    /// A reply: waiting for the owner to describe the in-flight xid.
    AwaitXidMap,
    /// Reading the reply status word.
    ReplyStatus,
    /// Reading the verifier flavour and length.
    ReplyVerfHdr,
    /// Reading verifier bytes plus the accept status.
    ReplyVerfBytes { region_end: usize },
    /// Reading the inline program header that precedes a vectored payload.
    ProcHeader { region_end: usize },
    /// Reading the rest of the fragment into the record buffer.
    SimpleRest,
    /// Reading the rest of the fragment into the payload buffer.
    PayloadRest,
}

enum Step {
    WouldBlock,
    NeedXidMap(u32),
    Complete(Pollin),
    Eof,
    Failed(io::Error),
}

struct Incoming {
    record_state: RecordState,
    fraghdr_raw: [u8; 4],
    fraghdr_filled: usize,
    frag_size: usize,
    last_frag: bool,
    iobuf: Option<IobufMut>,
    hdr_filled: usize,
    phase: FragPhase,
    msg_type: Option<MsgType>,
    xid: u32,
    request_spec: Option<RequestSpec>,
    xid_mapped: bool,
    payload: Option<IobufMut>,
    payload_filled: usize,
}

impl Incoming {
    fn new() -> Incoming {
        Incoming {
            record_state: RecordState::Nada,
            fraghdr_raw: [0; 4],
            fraghdr_filled: 0,
            frag_size: 0,
            last_frag: false,
            iobuf: None,
            hdr_filled: 0,
            phase: FragPhase::MsgType,
            msg_type: None,
            xid: 0,
            request_spec: None,
            xid_mapped: false,
            payload: None,
            payload_filled: 0,
        }
    }

    fn reset(&mut self) {
        *self = Incoming::new();
    }

    fn frag_consumed(&self) -> usize {
        self.hdr_filled + self.payload_filled
    }

    fn hdr_word(&self, at: usize) -> u32 {
        let buf = match &self.iobuf {
            Some(buf) => buf,
            None => return 0,
        };
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&buf[at..at + 4]);
        u32::from_be_bytes(raw)
    }
}

enum FillOutcome {
    Progress(usize),
    WouldBlock,
    Eof,
    Failed(io::Error),
}

fn fill(fd: RawFd, buf: &mut [u8], read_total: &AtomicU64) -> FillOutcome {
    loop {
        let rc = unsafe {
            libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        if rc == 0 {
            // EOF from peer, treated like ENOTCONN
            return FillOutcome::Eof;
        }
        if rc == -1 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) => FillOutcome::WouldBlock,
                Some(libc::EINTR) => continue,
                _ => FillOutcome::Failed(err),
            };
        }
        read_total.fetch_add(rc as u64, Ordering::Relaxed);
        return FillOutcome::Progress(rc as usize);
    }
}

// ---- the transport ----

struct SocketPrivate {
    sock: RawFd,
    token: Option<Token>,
    /// -1 = not connected, 0 = connect in progress, 1 = connected.
    connected: i8,
    ioq: VecDeque<IoqEntry>,
    incoming: Incoming,
    connect_failed_logged: bool,
    submit_logged: bool,
}

/// A nonblocking, record-framed stream transport.
pub struct SocketTransport {
    name: String,
    ctx: Arc<Ctx>,
    options: TransportOptions,
    notify: RwLock<Weak<dyn TransportNotify>>,
    call_sizer: RwLock<Option<CallSizer>>,
    state: Mutex<SocketPrivate>,
    peer_id: Mutex<String>,
    my_id: Mutex<String>,
    total_bytes_read: AtomicU64,
    total_bytes_written: AtomicU64,
    self_ref: Weak<SocketTransport>,
}

impl std::fmt::Debug for SocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketTransport")
            .field("name", &self.name)
            .field("peer", &*self.peer_id.lock())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl SocketTransport {
    /// Build an unconnected transport.
    pub fn new(ctx: Arc<Ctx>, name: impl Into<String>, options: TransportOptions) -> Arc<SocketTransport> {
        let name = name.into();
        Arc::new_cyclic(|self_ref| SocketTransport {
            name,
            ctx,
            options,
            notify: RwLock::new(Weak::<DeadNotify>::new() as Weak<dyn TransportNotify>),
            call_sizer: RwLock::new(None),
            state: Mutex::new(SocketPrivate {
                sock: -1,
                token: None,
                connected: -1,
                ioq: VecDeque::new(),
                incoming: Incoming::new(),
                connect_failed_logged: false,
                submit_logged: false,
            }),
            peer_id: Mutex::new(String::new()),
            my_id: Mutex::new(String::new()),
            total_bytes_read: AtomicU64::new(0),
            total_bytes_written: AtomicU64::new(0),
            self_ref: self_ref.clone(),
        })
    }

    /// Register the owner's upcall hook.
    pub fn set_notify(&self, notify: Weak<dyn TransportNotify>) {
        *self.notify.write() = notify;
    }

    /// Register a vectored-request sizer for inbound calls.
    pub fn set_call_sizer(&self, sizer: CallSizer) {
        *self.call_sizer.write() = Some(sizer);
    }

    /// Adopt an already-connected descriptor (accepted server side).
    pub fn from_accepted(
        ctx: Arc<Ctx>,
        name: impl Into<String>,
        options: TransportOptions,
        fd: RawFd,
    ) -> io::Result<Arc<SocketTransport>> {
        set_nonblock(fd)?;
        let transport = SocketTransport::new(ctx, name, options);
        if let Some(id) = peer_identifier_of(fd) {
            *transport.peer_id.lock() = id;
        }
        if let Some(id) = local_identifier(fd) {
            *transport.my_id.lock() = id;
        }
        {
            let mut state = transport.state.lock();
            state.sock = fd;
            state.connected = 1;
        }
        let token = transport.ctx.event().register(
            fd,
            transport.clone() as Arc<dyn EventHandler>,
            true,
            false,
        );
        transport.state.lock().token = Some(token);
        Ok(transport)
    }

    /// The transport's configured name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifier of the remote endpoint.
    pub fn peer_identifier(&self) -> String {
        self.peer_id.lock().clone()
    }

    /// Identifier of the local endpoint after connect.
    pub fn my_identifier(&self) -> String {
        self.my_id.lock().clone()
    }

    /// Whether the connect has completed.
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected == 1
    }

    /// Bytes read off this transport since creation.
    pub fn total_read(&self) -> u64 {
        self.total_bytes_read.load(Ordering::Relaxed)
    }

    /// Bytes written to this transport since creation.
    pub fn total_written(&self) -> u64 {
        self.total_bytes_written.load(Ordering::Relaxed)
    }

    /// Start a nonblocking connect toward the configured remote.
    pub fn connect(&self) -> io::Result<()> {
        let (remote, family) = name::client_remote_addr(&self.options)?;
        *self.peer_id.lock() = remote.identifier();

        let mut state = self.state.lock();
        if state.sock != -1 {
            trace!("{}: connect() while already in progress", self.name);
            return Err(io::Error::from_raw_os_error(libc::EINPROGRESS));
        }

        let af = match family {
            AddrFamily::Inet | AddrFamily::InetSdp => libc::AF_INET,
            AddrFamily::Inet6 => libc::AF_INET6,
            AddrFamily::Unix => libc::AF_UNIX,
        };
        let fd = unsafe { libc::socket(af, libc::SOCK_STREAM, 0) };
        if fd == -1 {
            let err = io::Error::last_os_error();
            error!("{}: socket creation failed: {err}", self.name);
            return Err(err);
        }

        // option failures (other than nonblock) are reported but not fatal
        set_window_size(fd, self.options.window_size);
        if self.options.nodelay && family != AddrFamily::Unix {
            if let Err(err) = set_nodelay(fd) {
                error!("{}: setting NODELAY failed: {err}", self.name);
            }
        }
        if let Some((idle, intvl)) = self.options.keepalive {
            if let Err(err) = set_keepalive(fd, idle, intvl) {
                error!("{}: setting keep-alive failed: {err}", self.name);
            }
        }
        if let Err(err) = set_nonblock(fd) {
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let rc = match &remote {
            ResolvedAddr::Inet(addr) => {
                let local: SocketAddr = if addr.is_ipv6() {
                    "[::]:0".parse().map_err(|_| io::Error::other("bad local addr"))?
                } else {
                    "0.0.0.0:0".parse().map_err(|_| io::Error::other("bad local addr"))?
                };
                if let Err(err) = name::client_bind(fd, family, &local, &self.options) {
                    warn!("{}: client bind failed: {err}", self.name);
                    unsafe { libc::close(fd) };
                    return Err(err);
                }
                let (storage, len) = sockaddr_storage_from(addr);
                unsafe {
                    libc::connect(
                        fd,
                        &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                        len,
                    )
                }
            }
            ResolvedAddr::Unix(path) => {
                let (addr, len) = sockaddr_un_from(path)?;
                unsafe {
                    libc::connect(
                        fd,
                        &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                        len,
                    )
                }
            }
        };
        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                error!("{}: connection attempt to {} failed: {err}", self.name, remote.identifier());
                unsafe { libc::close(fd) };
                return Err(err);
            }
        }

        let Some(this) = self.self_ref.upgrade() else {
            unsafe { libc::close(fd) };
            return Err(io::Error::other("transport is being destroyed"));
        };
        state.sock = fd;
        state.connected = 0;
        state.connect_failed_logged = false;
        let token = self.ctx.event().register(fd, this, true, true);
        state.token = Some(token);
        Ok(())
    }

    /// Ask the kernel to tear the stream down; the poll-error path finishes
    /// the cleanup and notifies the owner.
    pub fn disconnect(&self) {
        let state = self.state.lock();
        if state.sock != -1 {
            let rc = unsafe { libc::shutdown(state.sock, libc::SHUT_RDWR) };
            if rc == -1 {
                debug!(
                    "{}: shutdown returned {}",
                    self.name,
                    io::Error::last_os_error()
                );
            }
        }
    }

    /// Queue one record; it goes out now if the socket takes it, otherwise
    /// on the next writable wakeup.
    pub fn submit_request(&self, msg: TransportMsg) -> io::Result<()> {
        let mut sent = false;
        {
            let mut state = self.state.lock();
            if state.connected != 1 {
                if !state.submit_logged {
                    info!("{}: not connected (state {})", self.name, state.connected);
                    state.submit_logged = true;
                }
                return Err(io::Error::from_raw_os_error(libc::ENOTCONN));
            }
            state.submit_logged = false;

            let mut entry = IoqEntry::new(msg);
            if state.ioq.is_empty() {
                match entry.churn(state.sock, &self.total_bytes_written) {
                    Ok(true) => sent = true,
                    Ok(false) => {
                        state.ioq.push_back(entry);
                        // first waiter: continue on writability
                        if let Some(token) = state.token {
                            self.ctx.event().select_on(token, None, Some(true));
                        }
                    }
                    Err(err) => return Err(err),
                }
            } else {
                state.ioq.push_back(entry);
            }
        }
        if sent {
            if let Some(notify) = self.notify.read().upgrade() {
                notify.on_sent();
            }
        }
        Ok(())
    }

    fn connect_finish(&self) {
        let mut notify_event: Option<bool> = None; // Some(true)=connect, Some(false)=fail
        {
            let mut state = self.state.lock();
            if state.connected != 0 {
                return;
            }
            match connect_finish_error(state.sock) {
                Ok(()) => {
                    state.connected = 1;
                    if let Some(id) = local_identifier(state.sock) {
                        *self.my_id.lock() = id;
                    }
                    notify_event = Some(true);
                }
                Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
                Err(err) => {
                    if !state.connect_failed_logged {
                        error!(
                            "{}: connection to {} failed: {err}",
                            self.name,
                            self.peer_id.lock()
                        );
                        state.connect_failed_logged = true;
                    }
                    notify_event = Some(false);
                }
            }
        }
        match notify_event {
            Some(true) => {
                if let Some(notify) = self.notify.read().upgrade() {
                    notify.on_connect();
                }
            }
            Some(false) => self.poll_err(),
            None => {}
        }
    }

    /// The single failure path: flush queued writes, close the socket,
    /// notify the owner of the disconnect.
    fn poll_err(&self) {
        {
            let mut state = self.state.lock();
            let flushed = state.ioq.len();
            if flushed > 0 {
                debug!("{}: flushing {flushed} queued records", self.name);
            }
            state.ioq.clear();
            if let Some(token) = state.token.take() {
                self.ctx.event().unregister(token);
            }
            if state.sock != -1 {
                unsafe { libc::close(state.sock) };
                state.sock = -1;
            }
            state.connected = -1;
            state.incoming.reset();
        }
        if let Some(notify) = self.notify.read().upgrade() {
            notify.on_disconnect();
        }
    }

    fn poll_out(&self) -> io::Result<()> {
        let mut completed = 0usize;
        {
            let mut state = self.state.lock();
            let sock = state.sock;
            if sock == -1 {
                return Ok(());
            }
            while let Some(entry) = state.ioq.front_mut() {
                match entry.churn(sock, &self.total_bytes_written)? {
                    true => {
                        state.ioq.pop_front();
                        completed += 1;
                    }
                    false => break,
                }
            }
            if state.ioq.is_empty() {
                if let Some(token) = state.token {
                    self.ctx.event().select_on(token, None, Some(false));
                }
            }
        }
        if completed > 0 {
            if let Some(notify) = self.notify.read().upgrade() {
                for _ in 0..completed {
                    notify.on_sent();
                }
            }
        }
        Ok(())
    }

    fn poll_in(&self) -> io::Result<()> {
        loop {
            let step = {
                let mut state = self.state.lock();
                if state.sock == -1 {
                    return Ok(());
                }
                let sock = state.sock;
                let sizer = self.call_sizer.read().clone();
                drive_record_machine(
                    &mut state.incoming,
                    sock,
                    &self.ctx,
                    &self.total_bytes_read,
                    sizer.as_ref(),
                )
            };
            match step {
                Step::WouldBlock => return Ok(()),
                Step::Eof => {
                    debug!("{}: EOF from peer {}", self.name, self.peer_id.lock());
                    return Err(io::Error::from_raw_os_error(libc::ENOTCONN));
                }
                Step::Failed(err) => {
                    warn!(
                        "{}: reading from socket failed: {err}, peer {}",
                        self.name,
                        self.peer_id.lock()
                    );
                    return Err(err);
                }
                Step::NeedXidMap(xid) => {
                    let spec = self
                        .notify
                        .read()
                        .upgrade()
                        .and_then(|notify| notify.map_xid(xid));
                    let mut state = self.state.lock();
                    state.incoming.request_spec = spec;
                    state.incoming.xid_mapped = true;
                }
                Step::Complete(pollin) => {
                    if let Some(notify) = self.notify.read().upgrade() {
                        notify.on_msg(pollin);
                    }
                }
            }
        }
    }
}

struct DeadNotify;
impl TransportNotify for DeadNotify {
    fn on_connect(&self) {}
    fn on_disconnect(&self) {}
    fn on_msg(&self, _pollin: Pollin) {}
    fn map_xid(&self, _xid: u32) -> Option<RequestSpec> {
        None
    }
}

impl EventHandler for SocketTransport {
    fn handle_event(self: Arc<Self>, events: PollEvents) {
        self.handle_event_arc(events);
    }
}

impl SocketTransport {
    fn handle_event_arc(&self, events: PollEvents) {
        if events.contains(PollEvents::ERR) {
            debug!("{}: poll error, disconnecting now", self.name);
            self.poll_err();
            return;
        }

        if self.state.lock().connected == 0 {
            self.connect_finish();
            if !self.is_connected() {
                return;
            }
            // connect consumed the writable edge; queued submits will
            // re-enable write interest as needed
            let state = self.state.lock();
            if let (Some(token), true) = (state.token, state.ioq.is_empty()) {
                self.ctx.event().select_on(token, Some(true), Some(false));
            }
        }

        if events.contains(PollEvents::OUT) {
            if let Err(err) = self.poll_out() {
                warn!("{}: write path failed: {err}", self.name);
                self.poll_err();
                return;
            }
        }
        if events.contains(PollEvents::IN) {
            if self.poll_in().is_err() {
                self.poll_err();
            }
        }
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Some(token) = state.token.take() {
            self.ctx.event().unregister(token);
        }
        if state.sock != -1 {
            unsafe { libc::close(state.sock) };
            state.sock = -1;
        }
    }
}

/// Run the record-assembly machine until it blocks, completes a record, or
/// needs the owner.
fn drive_record_machine(
    incoming: &mut Incoming,
    sock: RawFd,
    ctx: &Arc<Ctx>,
    read_total: &AtomicU64,
    call_sizer: Option<&CallSizer>,
) -> Step {
    loop {
        match incoming.record_state {
            RecordState::Nada => {
                incoming.fraghdr_filled = 0;
                incoming.record_state = RecordState::ReadingFraghdr;
            }
            RecordState::ReadingFraghdr => {
                while incoming.fraghdr_filled < xdr::FRAGHDR_SIZE {
                    let filled = incoming.fraghdr_filled;
                    match fill(sock, &mut incoming.fraghdr_raw[filled..], read_total) {
                        FillOutcome::Progress(n) => incoming.fraghdr_filled += n,
                        FillOutcome::WouldBlock => {
                            if incoming.fraghdr_filled > 0 {
                                trace!("partial fragment header read");
                            }
                            return Step::WouldBlock;
                        }
                        FillOutcome::Eof => return Step::Eof,
                        FillOutcome::Failed(err) => return Step::Failed(err),
                    }
                }
                incoming.record_state = RecordState::ReadFraghdr;
            }
            RecordState::ReadFraghdr => {
                let (size, last) = xdr::decode_fraghdr(incoming.fraghdr_raw);
                if !last {
                    // records are never spread over multiple fragments on
                    // this protocol; a continuation marks a corrupt stream
                    error!("multi-fragment record received, dropping connection");
                    return Step::Failed(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unsupported multi-fragment record",
                    ));
                }
                incoming.frag_size = size as usize;
                incoming.last_frag = last;
                incoming.iobuf = Some(ctx.iobuf_pool().get_sized(incoming.frag_size.max(1)));
                incoming.hdr_filled = 0;
                incoming.payload_filled = 0;
                incoming.phase = FragPhase::MsgType;
                incoming.msg_type = None;
                incoming.request_spec = None;
                incoming.xid_mapped = false;
                incoming.record_state = RecordState::ReadingFrag;
            }
            RecordState::ReadingFrag => match step_frag(incoming, sock, ctx, read_total, call_sizer) {
                FragStep::Blocked => return Step::WouldBlock,
                FragStep::NeedXidMap(xid) => return Step::NeedXidMap(xid),
                FragStep::Eof => return Step::Eof,
                FragStep::Failed(err) => return Step::Failed(err),
                FragStep::Done => incoming.record_state = RecordState::Complete,
            },
            RecordState::Complete => {
                let pollin = assemble_pollin(incoming);
                incoming.reset();
                return match pollin {
                    Ok(pollin) => Step::Complete(pollin),
                    Err(err) => Step::Failed(err),
                };
            }
        }
    }
}

enum FragStep {
    Blocked,
    NeedXidMap(u32),
    Eof,
    Failed(io::Error),
    Done,
}

fn read_hdr_region(
    incoming: &mut Incoming,
    sock: RawFd,
    end: usize,
    read_total: &AtomicU64,
) -> Option<FragStep> {
    if end > incoming.frag_size {
        return Some(FragStep::Failed(io::Error::new(
            io::ErrorKind::InvalidData,
            "record shorter than its headers",
        )));
    }
    let Incoming {
        iobuf, hdr_filled, ..
    } = incoming;
    let Some(iobuf) = iobuf.as_mut() else {
        return Some(FragStep::Failed(io::Error::other("record buffer missing")));
    };
    while *hdr_filled < end {
        match fill(sock, &mut iobuf[*hdr_filled..end], read_total) {
            FillOutcome::Progress(n) => *hdr_filled += n,
            FillOutcome::WouldBlock => return Some(FragStep::Blocked),
            FillOutcome::Eof => return Some(FragStep::Eof),
            FillOutcome::Failed(err) => return Some(FragStep::Failed(err)),
        }
    }
    None
}

fn step_frag(
    incoming: &mut Incoming,
    sock: RawFd,
    ctx: &Arc<Ctx>,
    read_total: &AtomicU64,
    call_sizer: Option<&CallSizer>,
) -> FragStep {
    loop {
        match incoming.phase {
            FragPhase::MsgType => {
                if let Some(out) = read_hdr_region(incoming, sock, 8, read_total) {
                    return out;
                }
                incoming.xid = incoming.hdr_word(0);
                let raw_type = incoming.hdr_word(4);
                match MsgType::try_from(raw_type) {
                    Ok(MsgType::Reply) => {
                        incoming.msg_type = Some(MsgType::Reply);
                        incoming.phase = FragPhase::AwaitXidMap;
                    }
                    Ok(MsgType::Call) => {
                        incoming.msg_type = Some(MsgType::Call);
                        let inline = call_sizer.and_then(|sizer| sizer(incoming.frag_size));
                        match inline {
                            Some(inline_len) if inline_len < incoming.frag_size => {
                                incoming.phase = FragPhase::ProcHeader {
                                    region_end: inline_len.max(incoming.hdr_filled),
                                };
                            }
                            _ => incoming.phase = FragPhase::SimpleRest,
                        }
                    }
                    Err(_) => {
                        error!("wrong message type {raw_type} received");
                        return FragStep::Failed(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "bad message type",
                        ));
                    }
                }
            }
            FragPhase::AwaitXidMap => {
                if !incoming.xid_mapped {
                    return FragStep::NeedXidMap(incoming.xid);
                }
                incoming.phase = FragPhase::ReplyStatus;
            }
            FragPhase::ReplyStatus => {
                if let Some(out) = read_hdr_region(incoming, sock, 12, read_total) {
                    return out;
                }
                let status = incoming.hdr_word(8);
                if status == ReplyStat::Accepted as u32 {
                    incoming.phase = FragPhase::ReplyVerfHdr;
                } else {
                    // denied replies carry no payload worth splitting
                    incoming.phase = FragPhase::SimpleRest;
                }
            }
            FragPhase::ReplyVerfHdr => {
                if let Some(out) = read_hdr_region(incoming, sock, 20, read_total) {
                    return out;
                }
                let verflen = incoming.hdr_word(16) as usize;
                let region_end = 20 + verflen.div_ceil(4) * 4 + 4;
                incoming.phase = FragPhase::ReplyVerfBytes { region_end };
            }
            FragPhase::ReplyVerfBytes { region_end } => {
                if let Some(out) = read_hdr_region(incoming, sock, region_end, read_total) {
                    return out;
                }
                let accept = incoming.hdr_word(region_end - 4);
                let vectored = accept == xdr::AcceptStat::Success as u32
                    && incoming
                        .request_spec
                        .map(|spec| spec.payload_expected)
                        .unwrap_or(false);
                if vectored {
                    let spec_len = incoming
                        .request_spec
                        .map(|spec| spec.proghdr_len)
                        .unwrap_or(0);
                    incoming.phase = FragPhase::ProcHeader {
                        region_end: region_end + spec_len,
                    };
                } else {
                    incoming.phase = FragPhase::SimpleRest;
                }
            }
            FragPhase::ProcHeader { region_end } => {
                if let Some(out) = read_hdr_region(incoming, sock, region_end, read_total) {
                    return out;
                }
                let remaining = incoming.frag_size - incoming.frag_consumed();
                incoming.payload = Some(ctx.iobuf_pool().get_sized(remaining.max(1)));
                incoming.phase = FragPhase::PayloadRest;
            }
            FragPhase::SimpleRest => {
                let end = incoming.frag_size - incoming.payload_filled;
                if let Some(out) = read_hdr_region(incoming, sock, end, read_total) {
                    return out;
                }
                return FragStep::Done;
            }
            FragPhase::PayloadRest => {
                let want = incoming.frag_size - incoming.hdr_filled;
                let Incoming {
                    payload,
                    payload_filled,
                    ..
                } = incoming;
                let Some(payload) = payload.as_mut() else {
                    return FragStep::Failed(io::Error::other("payload buffer missing"));
                };
                while *payload_filled < want {
                    match fill(sock, &mut payload[*payload_filled..want], read_total) {
                        FillOutcome::Progress(n) => *payload_filled += n,
                        FillOutcome::WouldBlock => return FragStep::Blocked,
                        FillOutcome::Eof => return FragStep::Eof,
                        FillOutcome::Failed(err) => return FragStep::Failed(err),
                    }
                }
                return FragStep::Done;
            }
        }
    }
}

fn assemble_pollin(incoming: &mut Incoming) -> io::Result<Pollin> {
    let iobuf = incoming
        .iobuf
        .take()
        .ok_or_else(|| io::Error::other("record buffer missing"))?
        .freeze();
    let mut iobref = Iobref::new();
    iobref.add(iobuf.clone());

    let payload = incoming.payload.take().map(|p| p.freeze()).map(|buf| {
        iobref.add(buf.clone());
        IobufSlice {
            buf,
            offset: 0,
            len: incoming.payload_filled,
        }
    });

    Ok(Pollin {
        hdr: IobufSlice {
            buf: iobuf,
            offset: 0,
            len: incoming.hdr_filled,
        },
        payload,
        iobref,
        is_reply: incoming.msg_type == Some(MsgType::Reply),
    })
}

// ---- listener (server half used by accept-time authentication) ----

/// Callback invoked with each accepted connection's descriptor and peer
/// identifier.
pub type AcceptFn = Box<dyn Fn(RawFd, String) + Send + Sync>;

/// A listening socket feeding accepted connections to a callback.
pub struct SocketListener {
    ctx: Arc<Ctx>,
    fd: RawFd,
    token: Mutex<Option<Token>>,
    on_accept: AcceptFn,
    local: ResolvedAddr,
}

impl std::fmt::Debug for SocketListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketListener")
            .field("local", &self.local.identifier())
            .finish()
    }
}

impl SocketListener {
    /// Bind and listen on `local`, delivering accepted descriptors to
    /// `on_accept` from the event thread.
    pub fn bind(
        ctx: Arc<Ctx>,
        local: ResolvedAddr,
        options: &TransportOptions,
        on_accept: AcceptFn,
    ) -> io::Result<Arc<SocketListener>> {
        let fd = match &local {
            ResolvedAddr::Inet(addr) => {
                let af = if addr.is_ipv6() { libc::AF_INET6 } else { libc::AF_INET };
                let fd = unsafe { libc::socket(af, libc::SOCK_STREAM, 0) };
                if fd == -1 {
                    return Err(io::Error::last_os_error());
                }
                let on: libc::c_int = 1;
                let rc = unsafe {
                    libc::setsockopt(
                        fd,
                        libc::SOL_SOCKET,
                        libc::SO_REUSEADDR,
                        &on as *const libc::c_int as *const libc::c_void,
                        std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                    )
                };
                if rc == -1 {
                    error!("setsockopt SO_REUSEADDR failed: {}", io::Error::last_os_error());
                }
                let (storage, len) = sockaddr_storage_from(addr);
                let rc = unsafe {
                    libc::bind(
                        fd,
                        &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                        len,
                    )
                };
                if rc == -1 {
                    let err = io::Error::last_os_error();
                    error!("binding to {} failed: {err}", local.identifier());
                    unsafe { libc::close(fd) };
                    return Err(err);
                }
                fd
            }
            ResolvedAddr::Unix(path) => {
                // reclaim a stale socket file: if nobody answers, unlink it
                let probe = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
                if probe != -1 {
                    if let Ok((addr, len)) = sockaddr_un_from(path) {
                        let rc = unsafe {
                            libc::connect(
                                probe,
                                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                                len,
                            )
                        };
                        if rc == -1
                            && io::Error::last_os_error().raw_os_error()
                                == Some(libc::ECONNREFUSED)
                        {
                            let _ = std::fs::remove_file(path);
                        }
                    }
                    unsafe { libc::close(probe) };
                }

                let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
                if fd == -1 {
                    return Err(io::Error::last_os_error());
                }
                let (addr, len) = sockaddr_un_from(path)?;
                let rc = unsafe {
                    libc::bind(fd, &addr as *const libc::sockaddr_un as *const libc::sockaddr, len)
                };
                if rc == -1 {
                    let err = io::Error::last_os_error();
                    error!("binding to {} failed: {err}", path.display());
                    unsafe { libc::close(fd) };
                    return Err(err);
                }
                fd
            }
        };

        set_nonblock(fd)?;
        let rc = unsafe { libc::listen(fd, options.listen_backlog) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            error!("could not set socket {fd} to listen mode: {err}");
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let listener = Arc::new(SocketListener {
            ctx: ctx.clone(),
            fd,
            token: Mutex::new(None),
            on_accept,
            local,
        });
        let token = ctx
            .event()
            .register(fd, listener.clone() as Arc<dyn EventHandler>, true, false);
        *listener.token.lock() = Some(token);
        Ok(listener)
    }

    /// The bound local endpoint, with the kernel-assigned port filled in.
    pub fn local_identifier(&self) -> String {
        local_identifier(self.fd).unwrap_or_else(|| self.local.identifier())
    }
}

impl EventHandler for SocketListener {
    fn handle_event(self: Arc<Self>, events: PollEvents) {
        if !events.contains(PollEvents::IN) {
            return;
        }
        loop {
            let accepted = unsafe { libc::accept(self.fd, std::ptr::null_mut(), std::ptr::null_mut()) };
            if accepted == -1 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) | Some(libc::EINTR) => return,
                    _ => {
                        warn!("accept failed: {err}");
                        return;
                    }
                }
            }
            let peer = peer_identifier_of(accepted).unwrap_or_default();
            (self.on_accept)(accepted, peer);
        }
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        if let Some(token) = self.token.lock().take() {
            self.ctx.event().unregister(token);
        }
        unsafe { libc::close(self.fd) };
    }
}
