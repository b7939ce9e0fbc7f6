//! RPC client behavior against a scripted remote: replies, denials,
//! bailout, ping-driven disconnect, reconnect.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use stackfs::ctx::Ctx;
use stackfs::rpc::clnt::{RpcClient, RpcEvent, RpcNotify, RpcReply};
use stackfs::rpc::xdr;
use stackfs::rpc::{RpcConfig, DUMP_PROGRAM, FOP_PROGRAM, PROC_PING};
use stackfs::transport::{RequestSpec, SocketTransport, TransportOptions};

struct EventSink {
    tx: mpsc::Sender<RpcEvent>,
}

impl RpcNotify for EventSink {
    fn on_rpc_event(&self, event: RpcEvent) {
        let _ = self.tx.send(event);
    }
}

fn wait_for(rx: &mpsc::Receiver<RpcEvent>, wanted: RpcEvent, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let now = std::time::Instant::now();
        if now >= deadline {
            return false;
        }
        match rx.recv_timeout(deadline - now) {
            Ok(event) if event == wanted => return true,
            Ok(_) => continue,
            Err(_) => return false,
        }
    }
}

fn wait_for_ping(rx: &mpsc::Receiver<RpcEvent>, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let now = std::time::Instant::now();
        if now >= deadline {
            return false;
        }
        match rx.recv_timeout(deadline - now) {
            Ok(RpcEvent::Ping { .. }) => return true,
            Ok(_) => continue,
            Err(_) => return false,
        }
    }
}

/// Read one record off the stream: fragment header plus body.
fn read_record(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut hdr = [0u8; 4];
    stream.read_exact(&mut hdr)?;
    let (size, last) = xdr::decode_fraghdr(hdr);
    assert!(last, "test peers always send single-fragment records");
    let mut body = vec![0u8; size as usize];
    stream.read_exact(&mut body)?;
    Ok(body)
}

fn write_reply(stream: &mut TcpStream, xid: u32, body: &[u8]) -> std::io::Result<()> {
    let header = xdr::encode_reply_header(xid, xdr::AcceptStat::Success);
    let frag = xdr::encode_fraghdr((header.len() + body.len()) as u32, true).unwrap();
    stream.write_all(&frag)?;
    stream.write_all(&header)?;
    stream.write_all(body)?;
    Ok(())
}

/// What the scripted server does with each inbound call.
#[derive(Clone, Copy)]
enum ServerMode {
    /// Answer everything, pings included.
    Echo,
    /// Swallow everything.
    Mute,
    /// Answer pings only.
    PingOnly,
    /// Deny everything.
    Deny,
}

fn spawn_server(mode: ServerMode) -> (u16, Arc<AtomicBool>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = stop.clone();

    std::thread::spawn(move || {
        while !thread_stop.load(Ordering::SeqCst) {
            let Ok((mut stream, _addr)) = listener.accept() else {
                return;
            };
            std::thread::spawn(move || {
                loop {
                    // the connection thread ends on EOF when the client
                    // tears the transport down
                    let body = match read_record(&mut stream) {
                        Ok(body) => body,
                        Err(_) => return,
                    };
                    let call = xdr::decode_call_header(&body).unwrap();
                    let is_ping =
                        call.prognum == DUMP_PROGRAM.prognum && call.procnum == PROC_PING;
                    let answer = match mode {
                        ServerMode::Echo => true,
                        ServerMode::Mute => false,
                        ServerMode::PingOnly => is_ping,
                        ServerMode::Deny => {
                            let denial = xdr::encode_denied_reply(call.xid);
                            let frag =
                                xdr::encode_fraghdr(denial.len() as u32, true).unwrap();
                            stream.write_all(&frag).ok();
                            stream.write_all(&denial).ok();
                            false
                        }
                    };
                    if answer {
                        let body: &[u8] = if is_ping { b"" } else { b"pong" };
                        if write_reply(&mut stream, call.xid, body).is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });
    (port, stop)
}

fn client_for(
    ctx: &Arc<Ctx>,
    port: u16,
    config: RpcConfig,
) -> (Arc<RpcClient>, Arc<EventSink>, mpsc::Receiver<RpcEvent>) {
    let options = TransportOptions {
        remote_host: Some("127.0.0.1".to_owned()),
        remote_port: Some(port),
        bind_insecure: true,
        nodelay: true,
        window_size: 128 * 1024,
        listen_backlog: 10,
        ..TransportOptions::default()
    };
    let transport = SocketTransport::new(ctx.clone(), "client0", options);
    let client = RpcClient::new(ctx.clone(), "client0", transport, config);
    let (tx, rx) = mpsc::channel();
    let sink = Arc::new(EventSink { tx });
    client.set_notify(Arc::downgrade(&sink) as std::sync::Weak<dyn RpcNotify>);
    client.start();
    (client, sink, rx)
}

fn submit_and_wait(client: &Arc<RpcClient>, timeout: Duration) -> Option<(i32, Vec<u8>)> {
    let (tx, rx) = mpsc::channel();
    client.submit(
        FOP_PROGRAM,
        43, // statfs procedure; body content is irrelevant to the framing
        None,
        vec![0u8; 16],
        None,
        RequestSpec {
            proghdr_len: 0,
            payload_expected: false,
        },
        Box::new(move |reply: RpcReply, _frame| {
            let body = reply
                .proghdr
                .as_ref()
                .map(|slice| slice.as_slice().to_vec())
                .unwrap_or_default();
            let _ = tx.send((reply.status, body));
        }),
    );
    rx.recv_timeout(timeout).ok()
}

fn quick_config() -> RpcConfig {
    RpcConfig {
        frame_timeout: Duration::from_secs(1800),
        ping_timeout: Duration::ZERO,
        reconnect_interval: Duration::from_millis(200),
        bailout_interval: Duration::from_millis(200),
    }
}

#[test]
fn submit_receives_reply() {
    let _ = env_logger::builder().is_test(true).try_init();
    let ctx = Ctx::new().unwrap();
    let (port, stop) = spawn_server(ServerMode::Echo);
    let (client, _sink, events) = client_for(&ctx, port, quick_config());

    assert!(wait_for(&events, RpcEvent::Connect, Duration::from_secs(5)));
    let (status, body) = submit_and_wait(&client, Duration::from_secs(5)).unwrap();
    assert_eq!(status, 0);
    assert_eq!(body, b"pong");
    assert_eq!(client.in_flight(), 0);
    assert!(client.transport().total_written() > 0);
    assert!(client.transport().total_read() > 0);

    client.destroy();
    stop.store(true, Ordering::SeqCst);
}

#[test]
fn denied_reply_fails_the_call() {
    let _ = env_logger::builder().is_test(true).try_init();
    let ctx = Ctx::new().unwrap();
    let (port, stop) = spawn_server(ServerMode::Deny);
    let (client, _sink, events) = client_for(&ctx, port, quick_config());

    assert!(wait_for(&events, RpcEvent::Connect, Duration::from_secs(5)));
    let (status, _body) = submit_and_wait(&client, Duration::from_secs(5)).unwrap();
    assert_eq!(status, -1);

    client.destroy();
    stop.store(true, Ordering::SeqCst);
}

#[test]
fn bailout_fails_stuck_call_and_connection_stays_usable() {
    let _ = env_logger::builder().is_test(true).try_init();
    let ctx = Ctx::new().unwrap();
    let (port, stop) = spawn_server(ServerMode::Mute);
    let mut config = quick_config();
    config.frame_timeout = Duration::from_secs(1);
    let (client, _sink, events) = client_for(&ctx, port, config);

    assert!(wait_for(&events, RpcEvent::Connect, Duration::from_secs(5)));

    // the server never replies: the sweep must fail the call after ~1s
    let started = std::time::Instant::now();
    let (status, _body) = submit_and_wait(&client, Duration::from_secs(5)).unwrap();
    assert_eq!(status, -1);
    assert!(started.elapsed() >= Duration::from_millis(900));
    assert_eq!(client.in_flight(), 0);

    // the connection survives a bailout; later submits still go out
    assert!(client.is_connected());
    client.submit(
        FOP_PROGRAM,
        43,
        None,
        vec![0u8; 16],
        None,
        RequestSpec {
            proghdr_len: 0,
            payload_expected: false,
        },
        Box::new(|_reply, _frame| {}),
    );
    assert_eq!(client.in_flight(), 1);

    client.destroy();
    stop.store(true, Ordering::SeqCst);
}

#[test]
fn ping_keeps_live_connection_up() {
    let _ = env_logger::builder().is_test(true).try_init();
    let ctx = Ctx::new().unwrap();
    let (port, stop) = spawn_server(ServerMode::PingOnly);
    let mut config = quick_config();
    config.ping_timeout = Duration::from_millis(500);
    config.frame_timeout = Duration::from_secs(60);
    let (client, _sink, events) = client_for(&ctx, port, config);

    assert!(wait_for(&events, RpcEvent::Connect, Duration::from_secs(5)));

    // park a call the server will never answer so frames stay in flight,
    // then let the ping protocol probe the idle stream
    client.submit(
        FOP_PROGRAM,
        43,
        None,
        vec![0u8; 16],
        None,
        RequestSpec {
            proghdr_len: 0,
            payload_expected: false,
        },
        Box::new(|_reply, _frame| {}),
    );

    assert!(wait_for_ping(&events, Duration::from_secs(5)));
    assert!(client.is_connected());

    client.destroy();
    stop.store(true, Ordering::SeqCst);
}

#[test]
fn ping_timeout_disconnects_dead_peer() {
    let _ = env_logger::builder().is_test(true).try_init();
    let ctx = Ctx::new().unwrap();
    let (port, stop) = spawn_server(ServerMode::Mute);
    let mut config = quick_config();
    config.ping_timeout = Duration::from_millis(500);
    config.frame_timeout = Duration::from_secs(60);
    config.reconnect_interval = Duration::from_secs(60);
    let (client, _sink, events) = client_for(&ctx, port, config);

    assert!(wait_for(&events, RpcEvent::Connect, Duration::from_secs(5)));

    let (tx, rx) = mpsc::channel();
    client.submit(
        FOP_PROGRAM,
        43,
        None,
        vec![0u8; 16],
        None,
        RequestSpec {
            proghdr_len: 0,
            payload_expected: false,
        },
        Box::new(move |reply: RpcReply, _frame| {
            let _ = tx.send(reply.status);
        }),
    );

    // silence on the wire: the probe goes unanswered and the transport is
    // torn down, unwinding the in-flight call with a transport error
    assert!(wait_for(&events, RpcEvent::Disconnect, Duration::from_secs(5)));
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), -1);
    assert_eq!(client.in_flight(), 0);

    client.destroy();
    stop.store(true, Ordering::SeqCst);
}

#[test]
fn reconnects_when_server_appears() {
    let _ = env_logger::builder().is_test(true).try_init();
    let ctx = Ctx::new().unwrap();

    // reserve a port, then close the listener so the first attempts fail
    let probe = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let (client, _sink, events) = client_for(&ctx, port, quick_config());
    assert!(!wait_for(&events, RpcEvent::Connect, Duration::from_millis(600)));

    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
    std::thread::spawn(move || {
        let _stream = listener.accept();
        std::thread::sleep(Duration::from_secs(5));
    });

    assert!(wait_for(&events, RpcEvent::Connect, Duration::from_secs(10)));
    assert!(client.is_connected());

    client.destroy();
}
