//! Unix-domain transport endpoints: stale socket reclaim, accept-time
//! authentication, client connect over a path.

use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use stackfs::auth::{authenticate, AuthResult, PeerInput};
use stackfs::ctx::Ctx;
use stackfs::options::Options;
use stackfs::transport::{AddrFamily, ResolvedAddr, SocketListener, SocketTransport, TransportOptions};

fn wait_until(timeout: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if probe() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn listener_reclaims_stale_socket_and_accepts() {
    let _ = env_logger::builder().is_test(true).try_init();
    let ctx = Ctx::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("brick.sock");

    // leave a stale socket file behind
    let stale = UnixListener::bind(&path).unwrap();
    drop(stale);
    assert!(path.exists());

    let accepted = Arc::new(AtomicUsize::new(0));
    let auth_results = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let server_sides = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let config: Options = [("auth.addr.vol0.allow", "*")].into_iter().collect();
    let counter = accepted.clone();
    let results = auth_results.clone();
    let adopted = server_sides.clone();
    let accept_ctx = ctx.clone();
    let listener = SocketListener::bind(
        ctx.clone(),
        ResolvedAddr::Unix(path.clone()),
        &TransportOptions {
            listen_backlog: 10,
            ..TransportOptions::default()
        },
        Box::new(move |fd, peer| {
            // accept-time authentication, the way a server graph gates a
            // subvolume mount
            let verdict = authenticate(
                &PeerInput {
                    subvolume: "vol0",
                    identifier: &peer,
                    family: AddrFamily::Unix,
                    subdir: "/",
                },
                &config,
            );
            results.lock().push(verdict);
            counter.fetch_add(1, Ordering::SeqCst);
            match SocketTransport::from_accepted(
                accept_ctx.clone(),
                "server-side",
                TransportOptions::default(),
                fd,
            ) {
                Ok(transport) => {
                    assert!(transport.is_connected());
                    adopted.lock().push(transport);
                }
                Err(_) => unsafe {
                    libc::close(fd);
                },
            }
        }),
    )
    .unwrap();

    let client = SocketTransport::new(
        ctx.clone(),
        "unix-client",
        TransportOptions {
            connect_path: Some(path.clone()),
            nodelay: false,
            window_size: 128 * 1024,
            listen_backlog: 10,
            ..TransportOptions::default()
        },
    );
    client.connect().unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        accepted.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(auth_results.lock().as_slice(), &[AuthResult::Accept]);
    assert_eq!(client.peer_identifier(), path.display().to_string());
    let server_side = server_sides.lock().pop().unwrap();
    assert_eq!(server_side.my_identifier(), path.display().to_string());

    drop(listener);
}

#[test]
fn connect_reports_connected_state() {
    let _ = env_logger::builder().is_test(true).try_init();
    let ctx = Ctx::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("peer.sock");

    let (hold_tx, hold_rx) = mpsc::channel();
    let server = UnixListener::bind(&path).unwrap();
    std::thread::spawn(move || {
        if let Ok((stream, _)) = server.accept() {
            // hold the stream open until the test is done
            let _ = hold_rx.recv_timeout(Duration::from_secs(10));
            drop(stream);
        }
    });

    let client = SocketTransport::new(
        ctx.clone(),
        "unix-client",
        TransportOptions {
            connect_path: Some(path.clone()),
            window_size: 128 * 1024,
            listen_backlog: 10,
            ..TransportOptions::default()
        },
    );
    client.connect().unwrap();
    assert!(wait_until(Duration::from_secs(5), || client.is_connected()));
    let _ = hold_tx.send(());
}
