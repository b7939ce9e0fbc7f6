//! The RPC client: a long-lived connection to one remote translator.
//!
//! Every submitted call gets a fresh XID and a saved frame that tracks it
//! until the reply, a bailout, or a disconnect resolves it. The connection
//! runs a three-state machine (disconnected, connecting, connected) with a
//! 3-second reconnect chain, a periodic bailout sweep that fails calls older
//! than the frame timeout, and a liveness ping that tears the transport down
//! when the peer goes quiet.
//!
//! The connection lock is never held across a callback; callbacks may
//! re-enter `submit`.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};

use crate::ctx::Ctx;
use crate::iobuf::{Iobref, IobufSlice, IoPayload};
use crate::stack::CallFrame;
use crate::timer::TimerHandle;
use crate::transport::{
    Pollin, RequestSpec, SocketTransport, TransportMsg, TransportNotify,
};
use crate::xlator::scope;

use super::xdr;
use super::{RpcConfig, RpcProgram, DUMP_PROGRAM, PROC_PING};

/// Connection life-cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// No transport; reconnect chain is (or will be) running.
    Disconnected,
    /// Nonblocking connect in flight.
    Connecting,
    /// Calls can be submitted.
    Connected,
}

/// Events the connection reports upward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpcEvent {
    /// The connection is usable.
    Connect,
    /// The connection went away; in-flight calls have been failed.
    Disconnect,
    /// A liveness ping completed with the given latency.
    Ping {
        /// Measured round-trip, in milliseconds.
        latency_ms: u64,
    },
}

/// Upcall hook for connection events.
pub trait RpcNotify: Send + Sync {
    /// Called outside all connection locks.
    fn on_rpc_event(&self, event: RpcEvent);
}

/// A delivered reply (or failure) for one call.
pub struct RpcReply {
    /// `0` on success; `-1` for transport error, bailout, denial, or a
    /// non-success accept status.
    pub status: i32,
    /// The program reply bytes, absent on failure.
    pub proghdr: Option<IobufSlice>,
    /// Vectored payload, when the call asked for one.
    pub payload: Option<IobufSlice>,
    /// Keep-alive references for both regions.
    pub iobref: Iobref,
}

impl std::fmt::Debug for RpcReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcReply")
            .field("status", &self.status)
            .field("payload", &self.payload.as_ref().map(|p| p.len))
            .finish()
    }
}

impl RpcReply {
    fn failed() -> RpcReply {
        RpcReply {
            status: -1,
            proghdr: None,
            payload: None,
            iobref: Iobref::new(),
        }
    }
}

/// Callback receiving the reply; the frame is the one passed to `submit`.
pub type ReplyCbk = Box<dyn FnOnce(RpcReply, Option<Arc<CallFrame>>) + Send>;

struct SavedFrame {
    prog: RpcProgram,
    procnum: u32,
    cbk: ReplyCbk,
    frame: Option<Arc<CallFrame>>,
    scope_name: String,
    saved_at: Instant,
    reply_spec: RequestSpec,
}

struct Connection {
    state: ConnState,
    xid: u64,
    saved: BTreeMap<u64, SavedFrame>,
    bailout_timer: Option<TimerHandle>,
    reconnect_timer: Option<TimerHandle>,
    ping_timer: Option<TimerHandle>,
    ping_deadline: Option<TimerHandle>,
    ping_in_flight: bool,
    last_sent: Instant,
    last_received: Instant,
    disabled: bool,
}

impl Connection {
    fn cancel_timer(slot: &mut Option<TimerHandle>) {
        if let Some(handle) = slot.take() {
            handle.cancel();
        }
    }
}

/// A client connection to one remote program endpoint.
pub struct RpcClient {
    name: String,
    ctx: Arc<Ctx>,
    config: RpcConfig,
    transport: Arc<SocketTransport>,
    conn: Mutex<Connection>,
    notify: RwLock<Weak<dyn RpcNotify>>,
    self_ref: Weak<RpcClient>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl RpcClient {
    /// Build a client over `transport`. Call [`start`](RpcClient::start) to
    /// begin connecting.
    pub fn new(
        ctx: Arc<Ctx>,
        name: impl Into<String>,
        transport: Arc<SocketTransport>,
        config: RpcConfig,
    ) -> Arc<RpcClient> {
        let now = Instant::now();
        let name = name.into();
        Arc::new_cyclic(|self_ref| RpcClient {
            name,
            ctx,
            config,
            transport,
            conn: Mutex::new(Connection {
                state: ConnState::Disconnected,
                xid: 0,
                saved: BTreeMap::new(),
                bailout_timer: None,
                reconnect_timer: None,
                ping_timer: None,
                ping_deadline: None,
                ping_in_flight: false,
                last_sent: now,
                last_received: now,
                disabled: false,
            }),
            notify: RwLock::new(Weak::<NullNotify>::new() as Weak<dyn RpcNotify>),
            self_ref: self_ref.clone(),
        })
    }

    /// Register the event hook.
    pub fn set_notify(&self, notify: Weak<dyn RpcNotify>) {
        *self.notify.write() = notify;
    }

    /// Wire the transport upcalls to this client and start the reconnect
    /// chain.
    pub fn start(&self) {
        let weak: Weak<dyn TransportNotify> = self.self_ref.clone();
        self.transport.set_notify(weak);
        self.reconnect();
    }

    /// Current connection state.
    pub fn state(&self) -> ConnState {
        self.conn.lock().state
    }

    /// Whether calls can be submitted right now.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// Number of calls awaiting replies.
    pub fn in_flight(&self) -> usize {
        self.conn.lock().saved.len()
    }

    /// The transport under this connection.
    pub fn transport(&self) -> &Arc<SocketTransport> {
        &self.transport
    }

    /// Permanently shut the client down: fail everything in flight, stop
    /// every timer, drop the transport link. Late timer firings become
    /// no-ops.
    pub fn destroy(&self) {
        {
            let mut conn = self.conn.lock();
            conn.disabled = true;
            Connection::cancel_timer(&mut conn.reconnect_timer);
            Connection::cancel_timer(&mut conn.ping_timer);
            Connection::cancel_timer(&mut conn.ping_deadline);
        }
        self.transport.disconnect();
        // if the transport never reaches its error path (it never
        // connected), unwind whatever is still saved
        self.connection_cleanup();
    }

    /// Submit one call. `proghdr` is the already-encoded program arguments;
    /// `payload` rides behind them in the same record. `reply_spec` tells
    /// the transport how to split this call's reply. The callback fires
    /// exactly once: with the reply, or with a failed status on transport
    /// error, denial, or bailout.
    pub fn submit(
        &self,
        prog: RpcProgram,
        procnum: u32,
        frame: Option<Arc<CallFrame>>,
        proghdr: Vec<u8>,
        payload: Option<&IoPayload>,
        reply_spec: RequestSpec,
        cbk: ReplyCbk,
    ) {
        let identity = frame
            .as_ref()
            .map(|f| f.identity().clone())
            .unwrap_or_default();

        let xid = {
            let mut conn = self.conn.lock();
            if conn.disabled {
                drop(conn);
                cbk(RpcReply::failed(), frame);
                return;
            }
            if conn.state == ConnState::Disconnected {
                // kick the chain; this call still fails fast below
                drop(conn);
                self.reconnect();
                conn = self.conn.lock();
            }
            conn.next_xid()
        };

        let header = xdr::encode_call_header(
            xid as u32,
            prog.prognum,
            prog.progver,
            procnum,
            &identity,
        );
        let payload_len = payload.map(IoPayload::len).unwrap_or(0);
        let frag_len = header.len() + proghdr.len() + payload_len;
        let fraghdr = match xdr::encode_fraghdr(frag_len as u32, true) {
            Ok(hdr) => hdr,
            Err(err) => {
                error!("{}: cannot frame call xid {xid}: {err}", self.name);
                cbk(RpcReply::failed(), frame);
                return;
            }
        };
        let mut rpchdr = Vec::with_capacity(4 + header.len());
        rpchdr.extend_from_slice(&fraghdr);
        rpchdr.extend_from_slice(&header);
        let msg = TransportMsg::new(rpchdr, proghdr, payload);

        // save before the bytes can possibly be answered
        {
            let mut conn = self.conn.lock();
            conn.saved.insert(
                xid,
                SavedFrame {
                    prog,
                    procnum,
                    cbk,
                    frame,
                    scope_name: scope::current(),
                    saved_at: Instant::now(),
                    reply_spec,
                },
            );
            if conn.bailout_timer.is_none() {
                conn.bailout_timer = Some(self.arm_bailout());
            }
        }

        if let Err(err) = self.transport.submit_request(msg) {
            debug!("{}: transmission of call xid {xid} failed: {err}", self.name);
            let removed = self.conn.lock().saved.remove(&xid);
            if let Some(saved) = removed {
                (saved.cbk)(RpcReply::failed(), saved.frame);
            }
            return;
        }

        self.conn.lock().last_sent = Instant::now();
        self.check_and_start_ping();
    }

    // ---- reconnect chain ----

    fn reconnect(&self) {
        let attempt = {
            let mut conn = self.conn.lock();
            Connection::cancel_timer(&mut conn.reconnect_timer);
            if conn.disabled {
                return;
            }
            if conn.state == ConnState::Connected {
                trace!("{}: breaking reconnect chain", self.name);
                false
            } else {
                trace!("{}: attempting reconnect", self.name);
                conn.state = ConnState::Connecting;
                true
            }
        };
        if !attempt {
            return;
        }

        match self.transport.connect() {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(err) => {
                debug!("{}: connect attempt failed: {err}", self.name);
                self.conn.lock().state = ConnState::Disconnected;
            }
        }

        let weak = self.self_ref.clone();
        let handle = self
            .ctx
            .timer()
            .call_after(self.config.reconnect_interval, move || {
                if let Some(client) = weak.upgrade() {
                    client.reconnect();
                }
            });
        let mut conn = self.conn.lock();
        if conn.disabled {
            handle.cancel();
        } else {
            conn.reconnect_timer = Some(handle);
        }
    }

    // ---- bailout ----

    fn arm_bailout(&self) -> TimerHandle {
        let weak = self.self_ref.clone();
        self.ctx
            .timer()
            .call_after(self.config.bailout_interval, move || {
                if let Some(client) = weak.upgrade() {
                    client.call_bail();
                }
            })
    }

    /// Fail every saved frame older than the frame timeout; saved frames are
    /// walked in send order (XIDs are monotonic).
    fn call_bail(&self) {
        let now = Instant::now();
        let timed_out = {
            let mut conn = self.conn.lock();
            if conn.disabled {
                return;
            }
            // chaining gives the one-shot timer call-always behavior
            conn.bailout_timer = Some(self.arm_bailout());
            let expired: Vec<u64> = conn
                .saved
                .iter()
                .take_while(|(_, saved)| now.duration_since(saved.saved_at) > self.config.frame_timeout)
                .map(|(xid, _)| *xid)
                .collect();
            expired
                .into_iter()
                .filter_map(|xid| conn.saved.remove(&xid).map(|saved| (xid, saved)))
                .collect::<Vec<_>>()
        };

        for (xid, saved) in timed_out {
            error!(
                "{}: bailing out frame type({}) op({}) xid {xid} sent {:?} ago, timeout {:?}",
                self.name,
                saved.prog.name,
                saved.procnum,
                now.duration_since(saved.saved_at),
                self.config.frame_timeout
            );
            let _scope = scope::enter(&saved.scope_name);
            (saved.cbk)(RpcReply::failed(), saved.frame);
        }
    }

    // ---- ping ----

    fn check_and_start_ping(&self) {
        if self.config.ping_timeout.is_zero() {
            return;
        }
        let mut conn = self.conn.lock();
        if conn.disabled
            || conn.state != ConnState::Connected
            || conn.ping_in_flight
            || conn.ping_timer.is_some()
        {
            return;
        }
        conn.ping_timer = Some(self.arm_ping_timer());
    }

    fn arm_ping_timer(&self) -> TimerHandle {
        let weak = self.self_ref.clone();
        self.ctx
            .timer()
            .call_after(self.config.ping_timeout, move || {
                if let Some(client) = weak.upgrade() {
                    client.ping_check();
                }
            })
    }

    /// The ping timer fired: recent traffic proves health; otherwise probe
    /// the peer and hold it to the same deadline.
    fn ping_check(&self) {
        let send_ping = {
            let mut conn = self.conn.lock();
            conn.ping_timer = None;
            if conn.disabled || conn.state != ConnState::Connected {
                return;
            }
            let now = Instant::now();
            let fresh = now.duration_since(conn.last_sent) < self.config.ping_timeout
                || now.duration_since(conn.last_received) < self.config.ping_timeout;
            if fresh {
                trace!(
                    "{}: ping timer expired but transport activity detected, not probing",
                    self.name
                );
                conn.ping_timer = Some(self.arm_ping_timer());
                false
            } else if conn.saved.is_empty() {
                // idle with nothing in flight; nothing to protect
                debug!("{}: no frames in flight, ping not needed", self.name);
                false
            } else {
                conn.ping_in_flight = true;
                conn.ping_deadline = Some(self.arm_ping_deadline());
                true
            }
        };
        if !send_ping {
            return;
        }

        let sent_at = Instant::now();
        let weak = self.self_ref.clone();
        self.submit(
            DUMP_PROGRAM,
            PROC_PING,
            None,
            Vec::new(),
            None,
            RequestSpec {
                proghdr_len: 0,
                payload_expected: false,
            },
            Box::new(move |reply, _frame| {
                let Some(client) = weak.upgrade() else {
                    return;
                };
                client.ping_cbk(reply.status, sent_at);
            }),
        );
    }

    fn arm_ping_deadline(&self) -> TimerHandle {
        let weak = self.self_ref.clone();
        self.ctx
            .timer()
            .call_after(self.config.ping_timeout, move || {
                let Some(client) = weak.upgrade() else {
                    return;
                };
                let still_waiting = {
                    let conn = client.conn.lock();
                    conn.ping_in_flight && !conn.disabled
                };
                if still_waiting {
                    error!(
                        "{}: server {} has not responded in the last {:?}, disconnecting",
                        client.name,
                        client.transport.peer_identifier(),
                        client.config.ping_timeout
                    );
                    client.transport.disconnect();
                }
            })
    }

    fn ping_cbk(&self, status: i32, sent_at: Instant) {
        let latency_ms = sent_at.elapsed().as_millis() as u64;
        {
            let mut conn = self.conn.lock();
            conn.ping_in_flight = false;
            Connection::cancel_timer(&mut conn.ping_deadline);
            if status != 0 {
                warn!("{}: ping failed against {}", self.name, self.transport.peer_identifier());
                return;
            }
            debug!("{}: ping latency is {latency_ms}ms", self.name);
            if !conn.disabled && conn.state == ConnState::Connected {
                conn.ping_timer = Some(self.arm_ping_timer());
            }
        }
        self.emit(RpcEvent::Ping { latency_ms });
    }

    // ---- transport event handling ----

    /// Fail everything in flight and reset the saved-frame collection. The
    /// bailout timer goes away with it.
    fn connection_cleanup(&self) {
        let drained = {
            let mut conn = self.conn.lock();
            debug!("{}: cleaning up connection state", self.name);
            Connection::cancel_timer(&mut conn.bailout_timer);
            Connection::cancel_timer(&mut conn.ping_timer);
            Connection::cancel_timer(&mut conn.ping_deadline);
            conn.ping_in_flight = false;
            conn.state = ConnState::Disconnected;
            std::mem::take(&mut conn.saved)
        };

        for (xid, saved) in drained {
            error!(
                "{}: forced unwinding frame type({}) op({}) xid {xid} sent {:?} ago",
                self.name,
                saved.prog.name,
                saved.procnum,
                saved.saved_at.elapsed()
            );
            let _scope = scope::enter(&saved.scope_name);
            (saved.cbk)(RpcReply::failed(), saved.frame);
        }
    }

    fn handle_reply(&self, pollin: Pollin) {
        self.conn.lock().last_received = Instant::now();

        let hdr_bytes = pollin.hdr.as_slice();
        let header = match xdr::decode_reply_header(hdr_bytes) {
            Ok(header) => header,
            Err(err) => {
                error!("{}: RPC reply decoding failed: {err}", self.name);
                return;
            }
        };

        let saved = self.conn.lock().saved.remove(&(header.xid as u64));
        let Some(saved) = saved else {
            error!(
                "{}: cannot lookup the saved frame for reply with xid {}",
                self.name, header.xid
            );
            return;
        };

        trace!(
            "{}: reply xid {}, program {}, proc {}",
            self.name, header.xid, saved.prog.name, saved.procnum
        );

        let reply = if header.is_success() {
            RpcReply {
                status: 0,
                proghdr: Some(IobufSlice {
                    buf: pollin.hdr.buf.clone(),
                    offset: pollin.hdr.offset + header.header_len,
                    len: pollin.hdr.len - header.header_len.min(pollin.hdr.len),
                }),
                payload: pollin.payload,
                iobref: pollin.iobref,
            }
        } else {
            debug!(
                "{}: reply xid {} carried failure ({:?}/{:?})",
                self.name, header.xid, header.reply_stat, header.accept_stat
            );
            RpcReply::failed()
        };

        let _scope = scope::enter(&saved.scope_name);
        (saved.cbk)(reply, saved.frame);
    }

    fn emit(&self, event: RpcEvent) {
        if let Some(notify) = self.notify.read().upgrade() {
            notify.on_rpc_event(event);
        }
    }
}

impl Connection {
    fn next_xid(&mut self) -> u64 {
        self.xid += 1;
        self.xid
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        // the poll-error path unhooks the transport from the event loop
        self.transport.disconnect();
    }
}

struct NullNotify;
impl RpcNotify for NullNotify {
    fn on_rpc_event(&self, _event: RpcEvent) {}
}

impl TransportNotify for RpcClient {
    fn on_connect(&self) {
        info!(
            "{}: connected to {}",
            self.name,
            self.transport.peer_identifier()
        );
        {
            let mut conn = self.conn.lock();
            conn.state = ConnState::Connected;
            conn.last_received = Instant::now();
            Connection::cancel_timer(&mut conn.reconnect_timer);
        }
        self.emit(RpcEvent::Connect);
        self.check_and_start_ping();
    }

    fn on_disconnect(&self) {
        info!(
            "{}: disconnected from {}",
            self.name,
            self.transport.peer_identifier()
        );
        self.connection_cleanup();

        let disabled = self.conn.lock().disabled;
        if !disabled {
            let weak = self.self_ref.clone();
            let handle = self
                .ctx
                .timer()
                .call_after(self.config.reconnect_interval, move || {
                    if let Some(client) = weak.upgrade() {
                        client.reconnect();
                    }
                });
            let mut conn = self.conn.lock();
            if conn.reconnect_timer.is_none() {
                conn.reconnect_timer = Some(handle);
            } else {
                handle.cancel();
            }
        }
        self.emit(RpcEvent::Disconnect);
    }

    fn on_msg(&self, pollin: Pollin) {
        if !pollin.is_reply {
            warn!("{}: inbound call on a client connection, dropping", self.name);
            return;
        }
        self.handle_reply(pollin);
    }

    fn map_xid(&self, xid: u32) -> Option<RequestSpec> {
        let conn = self.conn.lock();
        conn.saved.get(&(xid as u64)).map(|saved| saved.reply_spec)
    }

    fn on_sent(&self) {
        self.conn.lock().last_sent = Instant::now();
    }
}
