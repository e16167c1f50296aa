//! End-to-end gateway tests over real TCP sockets.
//!
//! Terminals and upstream hosts are plain blocking `std::net` sockets; the
//! gateway under test runs its own I/O loops and pipeline threads.

use bytes::BytesMut;
use isoswitch::prelude::*;
use isoswitch_iso8583::{FieldCodec, FrameCodec};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

fn options() -> GatewayOptions {
    GatewayOptions::new(OverflowPolicy::Block)
        .with_io_threads(2)
        .with_reconnect_ivl(Duration::from_millis(50))
        .with_reconnect_ivl_max(Duration::from_millis(200))
        .with_connect_timeout(Duration::from_secs(1))
}

fn profile() -> Profile {
    Profile::new("iso")
        .direction(Direction::Inbound, ["0200", "0800"])
        .direction(Direction::Outbound, ["0210", "0810"])
        .correlate_on([11, 37])
}

fn metadata(listen_port: u16, upstream_port: u16, allowed: &[&str]) -> Metadata {
    let mut server = ServerConfig::new("127.0.0.1", listen_port);
    for host in allowed {
        server = server.allow(SocketEndpoint::new(*host, 0));
    }
    Metadata::new().with_profile(profile()).with_channel(
        ChannelConfig::new("pay", "iso")
            .with_server(server)
            .with_client(ClientConfig::new(vec![SocketEndpoint::new(
                "127.0.0.1",
                upstream_port,
            )])),
    )
}

fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    check()
}

fn accept_within(listener: &TcpListener) -> TcpStream {
    listener.set_nonblocking(true).unwrap();
    let deadline = Instant::now() + WAIT;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false).unwrap();
                stream.set_read_timeout(Some(WAIT)).unwrap();
                return stream;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock && Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) => panic!("upstream accept failed: {e}"),
        }
    }
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    stream
}

fn send(stream: &mut TcpStream, fields: &FieldMap) {
    let payload = Iso8583Codec::default().encode(fields).unwrap();
    let mut out = BytesMut::new();
    LengthPrefixFramer::default().encode(&payload, &mut out).unwrap();
    stream.write_all(&out).unwrap();
}

fn recv(stream: &mut TcpStream) -> FieldMap {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).unwrap();
    let mut body = vec![0u8; usize::from(u16::from_be_bytes(header))];
    stream.read_exact(&mut body).unwrap();
    Iso8583Codec::default().decode(&body).unwrap()
}

/// Whether the peer closed the stream.
fn closed_by_peer(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 16];
    match stream.read(&mut buf) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) => e.kind() == ErrorKind::ConnectionReset,
    }
}

fn request(stan: &str) -> FieldMap {
    FieldMap::new()
        .with(MTI_FIELD, "0200")
        .with(4, "000000001500")
        .with(11, stan)
        .with(37, "RRN000000001")
        .with(41, "TERM0001")
}

fn reply_to(req: &FieldMap) -> FieldMap {
    FieldMap::new()
        .with(MTI_FIELD, "0210")
        .with(11, req.get(11).unwrap())
        .with(37, req.get(37).unwrap())
        .with(39, "00")
}

struct Fixture {
    gateway: Gateway,
    upstream: TcpListener,
    listen_port: u16,
}

fn fixture(allowed: &[&str]) -> Fixture {
    isoswitch::dev_tracing::init_tracing();
    let upstream = TcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_port = upstream.local_addr().unwrap().port();
    let listen_port = portpicker::pick_unused_port().expect("no free port");

    let gateway = Gateway::new(options(), metadata(listen_port, upstream_port, allowed)).unwrap();
    gateway.start().unwrap();
    Fixture {
        gateway,
        upstream,
        listen_port,
    }
}

fn up(gateway: &Gateway, key: &SocketKey) -> bool {
    gateway.socket_status(key).is_some_and(|s| s.up)
}

#[test]
fn test_request_and_reply_are_switched() {
    let f = fixture(&[]);
    let mut host = accept_within(&f.upstream);
    assert!(eventually(|| up(&f.gateway, &SocketKey::client("pay"))));

    let mut terminal = connect(f.listen_port);
    let req = request("000001");
    send(&mut terminal, &req);

    let forwarded = recv(&mut host);
    assert_eq!(forwarded, req);
    assert!(eventually(|| f.gateway.pending_correlations() == 1));

    send(&mut host, &reply_to(&req));
    let reply = recv(&mut terminal);
    assert_eq!(reply.get(MTI_FIELD), Some("0210"));
    assert_eq!(reply.get(11), Some("000001"));
    assert_eq!(reply.get(39), Some("00"));

    assert!(eventually(|| f.gateway.pending_correlations() == 0));
    let client = f.gateway.socket_status(&SocketKey::client("pay")).unwrap();
    assert_eq!(client.in_flight(), 0);
}

#[test]
fn test_replies_go_back_to_their_own_terminal() {
    let f = fixture(&[]);
    let mut host = accept_within(&f.upstream);
    assert!(eventually(|| up(&f.gateway, &SocketKey::client("pay"))));

    let mut first = connect(f.listen_port);
    let mut second = connect(f.listen_port);
    let req_a = request("000010");
    let req_b = request("000020");
    send(&mut first, &req_a);
    let seen_a = recv(&mut host);
    send(&mut second, &req_b);
    let seen_b = recv(&mut host);

    // Answer in reverse order
    send(&mut host, &reply_to(&seen_b));
    send(&mut host, &reply_to(&seen_a));

    assert_eq!(recv(&mut second).get(11), Some("000020"));
    assert_eq!(recv(&mut first).get(11), Some("000010"));
}

#[test]
fn test_unmatched_reply_is_not_delivered() {
    let f = fixture(&[]);
    let mut host = accept_within(&f.upstream);
    assert!(eventually(|| up(&f.gateway, &SocketKey::client("pay"))));

    let mut terminal = connect(f.listen_port);
    assert!(eventually(|| up(&f.gateway, &SocketKey::server("pay"))));

    send(&mut host, &reply_to(&request("999999")));
    terminal
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    let mut buf = [0u8; 8];
    let err = terminal.read(&mut buf).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut));
}

#[test]
fn test_allow_list_rejects_unknown_remote() {
    let f = fixture(&["10.99.99.99"]);
    let monitor = f.gateway.monitor();

    let mut terminal = connect(f.listen_port);
    assert!(closed_by_peer(&mut terminal));

    let deadline = Instant::now() + WAIT;
    let mut rejected = false;
    while let Ok(event) = monitor.recv_deadline(deadline) {
        if matches!(event, SocketEvent::Rejected { .. }) {
            rejected = true;
            break;
        }
    }
    assert!(rejected);
    let server = f.gateway.socket_status(&SocketKey::server("pay")).unwrap();
    assert!(server.connections.is_empty());
}

#[test]
fn test_reload_revokes_connections_in_place() {
    let f = fixture(&["127.0.0.1"]);
    let _host = accept_within(&f.upstream);
    let mut terminal = connect(f.listen_port);
    assert!(eventually(|| up(&f.gateway, &SocketKey::server("pay"))));
    let listening = f.gateway.local_addr(&SocketKey::server("pay"));

    let upstream_port = f.upstream.local_addr().unwrap().port();
    let summary = f
        .gateway
        .reload(metadata(f.listen_port, upstream_port, &["10.99.99.99"]))
        .unwrap();
    assert_eq!(summary.allow_list_updated, vec!["pay".to_string()]);
    assert!(summary.rebuilt.is_empty());
    assert_eq!(summary.connections_closed, 1);

    assert!(closed_by_peer(&mut terminal));
    // Listener kept running through the reload
    assert_eq!(f.gateway.local_addr(&SocketKey::server("pay")), listening);
}

#[test]
fn test_reload_adds_and_removes_channels() {
    let f = fixture(&[]);
    let _host = accept_within(&f.upstream);
    let upstream_port = f.upstream.local_addr().unwrap().port();
    let extra_port = portpicker::pick_unused_port().expect("no free port");

    let mut next = metadata(f.listen_port, upstream_port, &[]);
    next.channels.push(
        ChannelConfig::new("mgmt", "iso").with_server(ServerConfig::new("127.0.0.1", extra_port)),
    );
    let summary = f.gateway.reload(next).unwrap();
    assert_eq!(summary.added, vec!["mgmt".to_string()]);
    assert!(summary.failed.is_empty());
    assert!(f.gateway.local_addr(&SocketKey::server("mgmt")).is_some());
    let _probe = connect(extra_port);

    let summary = f
        .gateway
        .reload(metadata(f.listen_port, upstream_port, &[]))
        .unwrap();
    assert_eq!(summary.removed, vec!["mgmt".to_string()]);
    assert!(f.gateway.socket_status(&SocketKey::server("mgmt")).is_none());
}

#[test]
fn test_client_link_reconnects() {
    let f = fixture(&[]);
    let host = accept_within(&f.upstream);
    let key = SocketKey::client("pay");
    assert!(eventually(|| up(&f.gateway, &key)));

    drop(host);
    let mut host = accept_within(&f.upstream);
    assert!(eventually(|| up(&f.gateway, &key)));

    let status = f.gateway.socket_status(&key).unwrap();
    assert_eq!(status.links.len(), 1);
    assert_eq!(status.links[0].state, LinkState::Connected);

    // New link carries traffic
    let mut terminal = connect(f.listen_port);
    let req = request("000042");
    send(&mut terminal, &req);
    assert_eq!(recv(&mut host), req);
}

#[test]
fn test_admin_stop_and_close() {
    let f = fixture(&[]);
    let _host = accept_within(&f.upstream);
    let server = SocketKey::server("pay");

    let mut terminal = connect(f.listen_port);
    assert!(eventually(|| up(&f.gateway, &server)));
    let status = f.gateway.socket_status(&server).unwrap();
    let id = status.connections[0].id;

    assert!(f.gateway.close_connection(id));
    assert!(closed_by_peer(&mut terminal));
    assert!(!f.gateway.close_connection(id));

    let mut terminal = connect(f.listen_port);
    assert!(eventually(|| up(&f.gateway, &server)));
    f.gateway.stop_socket(&server).unwrap();
    assert!(closed_by_peer(&mut terminal));
    assert!(f.gateway.local_addr(&server).is_none());

    f.gateway.start_socket(&server).unwrap();
    let _terminal = connect(f.listen_port);
    assert!(eventually(|| up(&f.gateway, &server)));
}
