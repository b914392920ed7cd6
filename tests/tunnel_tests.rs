//! End-to-end tests: real loopback sockets, an in-process fake CONNECT proxy
//! that echoes tunnel bytes back, and the engine in between.

use bifrost_tunnel::config::{ProxyCredentials, ProxyEndpoint};
use bifrost_tunnel::connector::ConnectorOptions;
use bifrost_tunnel::engine::{Engine, EngineOptions, RunningEngine};
use bifrost_tunnel::error::TunnelError;
use bifrost_tunnel::registry::{ListenScope, TunnelRegistry, TunnelSpec};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy)]
enum Reply {
    /// Answer 200 (plus optional early bytes), then echo everything.
    Establish { early: &'static [u8] },
    /// Send this response verbatim and wait for the engine to hang up.
    Reject(&'static str),
    /// Answer 200, echo exactly `bytes` bytes, then drop the tunnel.
    DropAfter { bytes: usize },
}

/// What the fake proxy saw on one connection, reported when it closes.
#[derive(Debug)]
struct ProxyEvent {
    request: String,
    payload: Vec<u8>,
}

struct FakeProxy {
    addr: SocketAddr,
    events: mpsc::UnboundedReceiver<ProxyEvent>,
}

impl FakeProxy {
    async fn spawn(reply: Reply) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, events) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(handle_proxy_connection(stream, reply, tx));
            }
        });

        Self { addr, events }
    }

    async fn next_event(&mut self) -> ProxyEvent {
        timeout(WAIT, self.events.recv())
            .await
            .expect("proxy connection did not finish in time")
            .expect("fake proxy stopped")
    }
}

async fn handle_proxy_connection(mut stream: TcpStream, reply: Reply, tx: mpsc::UnboundedSender<ProxyEvent>) {
    // Byte at a time so no tunnel payload is consumed with the headers
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => return,
            Ok(_) => head.push(byte[0]),
        }
    }
    let request = String::from_utf8_lossy(&head).into_owned();

    let mut payload = Vec::new();
    match reply {
        Reply::Establish { early } => {
            let mut response = b"HTTP/1.1 200 Connection established\r\n\r\n".to_vec();
            response.extend_from_slice(early);
            if stream.write_all(&response).await.is_err() {
                return;
            }

            let mut buf = [0u8; 4096];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        payload.extend_from_slice(&buf[..n]);
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = stream.shutdown().await;
        }
        Reply::DropAfter { bytes } => {
            if stream.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n").await.is_err() {
                return;
            }
            payload.resize(bytes, 0);
            if stream.read_exact(&mut payload).await.is_err() {
                return;
            }
            let _ = stream.write_all(&payload).await;
            drop(stream);
        }
        Reply::Reject(response) => {
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.read_to_end(&mut payload).await;
        }
    }

    let _ = tx.send(ProxyEvent { request, payload });
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn tunnel(listen_port: u16, proxy: SocketAddr, target: &str) -> TunnelSpec {
    TunnelSpec {
        listen: ListenScope::Loopback,
        listen_port,
        target_host: target.to_string(),
        target_port: 22,
        proxy: ProxyEndpoint::new(proxy.ip().to_string(), proxy.port()),
        credentials: None,
        user_agent: "bifrost-tunnel-test/1.0".to_string(),
    }
}

async fn start(specs: Vec<TunnelSpec>) -> RunningEngine {
    let mut registry = TunnelRegistry::new();
    for spec in specs {
        registry.register(spec).unwrap();
    }
    let options = EngineOptions {
        connector: ConnectorOptions {
            connect_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(2),
            ..ConnectorOptions::default()
        },
        stats_interval: None,
    };
    Engine::new(registry, options).start().await.unwrap()
}

async fn connect(addr: SocketAddr) -> TcpStream {
    let addr = if addr.ip().is_unspecified() {
        SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port())
    } else {
        addr
    };
    TcpStream::connect(addr).await.unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_round_trip_through_proxy_with_credentials() {
    let mut proxy = FakeProxy::spawn(Reply::Establish { early: b"" }).await;
    let mut spec = tunnel(free_port(), proxy.addr, "target.example.com");
    spec.credentials = Some(ProxyCredentials::new("user", "secret"));
    let engine = start(vec![spec]).await;

    let client = connect(engine.local_addrs()[0]).await;
    let (mut client_read, mut client_write) = client.into_split();

    let data: Vec<u8> = (0..200_000u32).map(|i| (i * 7 % 256) as u8).collect();
    let sent = data.clone();
    let writer = tokio::spawn(async move {
        client_write.write_all(&sent).await.unwrap();
        client_write.shutdown().await.unwrap();
    });

    let mut echoed = Vec::new();
    timeout(WAIT, client_read.read_to_end(&mut echoed)).await.unwrap().unwrap();
    writer.await.unwrap();
    assert_eq!(echoed, data);

    let event = proxy.next_event().await;
    assert_eq!(
        event.request,
        "CONNECT target.example.com:22 HTTP/1.1\r\n\
         Host: target.example.com:22\r\n\
         User-Agent: bifrost-tunnel-test/1.0\r\n\
         Proxy-Authorization: Basic dXNlcjpzZWNyZXQ=\r\n\
         \r\n"
    );
    assert_eq!(event.payload, data);

    let counters = engine.counters();
    wait_until(|| counters.snapshot().sessions_active == 0).await;
    let snapshot = counters.snapshot();
    assert_eq!(snapshot.sessions_accepted, 1);
    assert_eq!(snapshot.sessions_failed, 0);
    assert_eq!(snapshot.bytes_client_to_tunnel, data.len() as u64);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_early_data_reaches_client_before_payload() {
    let mut proxy = FakeProxy::spawn(Reply::Establish { early: b"SSH-2.0-fake\r\n" }).await;
    let engine = start(vec![tunnel(free_port(), proxy.addr, "ssh.example.com")]).await;

    let mut client = connect(engine.local_addrs()[0]).await;

    let mut banner = [0u8; 14];
    timeout(WAIT, client.read_exact(&mut banner)).await.unwrap().unwrap();
    assert_eq!(&banner, b"SSH-2.0-fake\r\n");

    client.write_all(b"ping").await.unwrap();
    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    timeout(WAIT, client.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert_eq!(rest, b"ping");

    assert_eq!(proxy.next_event().await.payload, b"ping");
    engine.shutdown().await;
}

#[tokio::test]
async fn test_rejected_handshake_closes_client_and_forwards_nothing() {
    let mut proxy = FakeProxy::spawn(Reply::Reject("HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n")).await;
    let engine = start(vec![tunnel(free_port(), proxy.addr, "blocked.example.com")]).await;

    let mut client = connect(engine.local_addrs()[0]).await;
    client.write_all(b"must never reach the target").await.unwrap();

    // EOF or reset, either way the client is closed well within the handshake timeout
    let mut received = Vec::new();
    let read = timeout(WAIT, client.read_to_end(&mut received))
        .await
        .expect("client was not closed");
    if read.is_ok() {
        assert!(received.is_empty());
    }

    let event = proxy.next_event().await;
    assert!(event.request.starts_with("CONNECT blocked.example.com:22 HTTP/1.1\r\n"));
    assert!(event.payload.is_empty());

    let counters = engine.counters();
    wait_until(|| counters.snapshot().sessions_failed == 1).await;
    engine.shutdown().await;
}

#[tokio::test]
async fn test_client_half_close_reaches_tunnel() {
    let mut proxy = FakeProxy::spawn(Reply::Establish { early: b"" }).await;
    let engine = start(vec![tunnel(free_port(), proxy.addr, "ssh.example.com")]).await;

    let mut client = connect(engine.local_addrs()[0]).await;
    client.write_all(b"abc").await.unwrap();
    client.shutdown().await.unwrap();

    // The fake target only reports once it has read EOF
    let event = proxy.next_event().await;
    assert_eq!(event.payload, b"abc");

    let mut echoed = Vec::new();
    timeout(WAIT, client.read_to_end(&mut echoed)).await.unwrap().unwrap();
    assert_eq!(echoed, b"abc");

    let counters = engine.counters();
    wait_until(|| counters.snapshot().sessions_active == 0).await;
    engine.shutdown().await;
}

#[tokio::test]
async fn test_tunnels_are_independent() {
    let rejecting = FakeProxy::spawn(Reply::Reject("HTTP/1.1 502 Bad Gateway\r\n\r\n")).await;
    let accepting = FakeProxy::spawn(Reply::Establish { early: b"" }).await;

    let mut registry = TunnelRegistry::new();
    let a = registry.register(tunnel(free_port(), rejecting.addr, "a.example.com")).unwrap();
    let b = registry.register(tunnel(free_port(), accepting.addr, "b.example.com")).unwrap();
    let engine = Engine::new(registry, EngineOptions::default()).start().await.unwrap();
    let addr_a = engine.local_addr(a).unwrap();
    let addr_b = engine.local_addr(b).unwrap();

    let mut session_b = connect(addr_b).await;
    let mut buf = [0u8; 2];
    session_b.write_all(b"b1").await.unwrap();
    timeout(WAIT, session_b.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"b1");

    for _ in 0..5 {
        let mut session_a = connect(addr_a).await;
        let mut sink = Vec::new();
        let _ = timeout(WAIT, session_a.read_to_end(&mut sink)).await.unwrap();
        assert!(sink.is_empty());
    }

    session_b.write_all(b"b2").await.unwrap();
    timeout(WAIT, session_b.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"b2");

    // Tunnel A is still accepting too
    let _still_open = connect(addr_a).await;

    let counters = engine.counters();
    wait_until(|| counters.snapshot().sessions_failed >= 5).await;
    assert!(counters.snapshot().sessions_active >= 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_listen_port_binds_nothing() {
    let port = free_port();
    let proxy: SocketAddr = "127.0.0.1:3128".parse().unwrap();

    let mut registry = TunnelRegistry::new();
    registry.register(tunnel(port, proxy, "a.example.com")).unwrap();
    let result = registry.register(tunnel(port, proxy, "b.example.com"));
    assert!(matches!(result, Err(TunnelError::Config(_))));

    // Nothing has been bound yet
    assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
}

#[tokio::test]
async fn test_bind_failure_aborts_startup() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let busy_port = occupied.local_addr().unwrap().port();
    let free = free_port();
    let proxy: SocketAddr = "127.0.0.1:3128".parse().unwrap();

    let mut registry = TunnelRegistry::new();
    registry.register(tunnel(free, proxy, "a.example.com")).unwrap();
    registry.register(tunnel(busy_port, proxy, "b.example.com")).unwrap();

    let result = Engine::new(registry, EngineOptions::default()).start().await;
    match result {
        Err(e @ TunnelError::Bind { .. }) => assert!(e.is_fatal()),
        Err(other) => panic!("expected a bind error, got {}", other),
        Ok(_) => panic!("startup should fail while the port is taken"),
    }

    // The tunnel that did bind was released again
    assert!(std::net::TcpListener::bind(("127.0.0.1", free)).is_ok());
}

#[tokio::test]
async fn test_listen_scope_controls_bind_address() {
    let proxy: SocketAddr = "127.0.0.1:3128".parse().unwrap();

    let local = start(vec![tunnel(free_port(), proxy, "a.example.com")]).await;
    assert!(local.local_addrs()[0].ip().is_loopback());
    local.shutdown().await;

    let mut open = tunnel(free_port(), proxy, "a.example.com");
    open.listen = ListenScope::AllInterfaces;
    let open = start(vec![open]).await;
    assert!(open.local_addrs()[0].ip().is_unspecified());
    open.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_proxy_keeps_listener_alive() {
    let dead_proxy = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), free_port());
    let engine = start(vec![tunnel(free_port(), dead_proxy, "a.example.com")]).await;
    let addr = engine.local_addrs()[0];

    for _ in 0..3 {
        let mut client = connect(addr).await;
        let mut sink = Vec::new();
        let _ = timeout(WAIT, client.read_to_end(&mut sink)).await.unwrap();
        assert!(sink.is_empty());
    }

    let counters = engine.counters();
    wait_until(|| counters.snapshot().sessions_failed == 3).await;
    engine.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_open_sessions() {
    let mut proxy = FakeProxy::spawn(Reply::Establish { early: b"" }).await;
    let engine = start(vec![tunnel(free_port(), proxy.addr, "ssh.example.com")]).await;
    let addr = engine.local_addrs()[0];

    let mut client = connect(addr).await;
    client.write_all(b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();

    timeout(WAIT, engine.shutdown()).await.expect("shutdown hung");

    // Both legs of the session are gone
    let mut rest = Vec::new();
    let _ = timeout(WAIT, client.read_to_end(&mut rest)).await.unwrap();
    assert!(rest.is_empty());
    assert_eq!(proxy.next_event().await.payload, b"hi");

    // And the port is no longer accepting
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_shutdown_token_stops_waiting_engine() {
    let proxy: SocketAddr = "127.0.0.1:3128".parse().unwrap();
    let engine = start(vec![tunnel(free_port(), proxy, "a.example.com")]).await;
    let addr = engine.local_addrs()[0];
    let token = engine.shutdown_token();

    let waiter = tokio::spawn(engine.wait());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    token.cancel();
    timeout(WAIT, waiter).await.expect("wait hung").unwrap();
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_proxy_dropping_tunnel_mid_transfer_closes_client() {
    let mut proxy = FakeProxy::spawn(Reply::DropAfter { bytes: 5 }).await;
    let engine = start(vec![tunnel(free_port(), proxy.addr, "ssh.example.com")]).await;
    let addr = engine.local_addrs()[0];

    for _ in 0..2 {
        let mut client = connect(addr).await;
        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        timeout(WAIT, client.read_exact(&mut echoed)).await.unwrap().unwrap();
        assert_eq!(&echoed, b"hello");

        // EOF or reset once the proxy hangs up; nothing else arrives
        let mut rest = Vec::new();
        let read = timeout(WAIT, client.read_to_end(&mut rest))
            .await
            .expect("client was not closed after the tunnel dropped");
        if read.is_ok() {
            assert!(rest.is_empty());
        }
        drop(client);

        assert_eq!(proxy.next_event().await.payload, b"hello");
    }

    // The listener kept accepting across both dropped tunnels
    let counters = engine.counters();
    wait_until(|| counters.snapshot().sessions_active == 0).await;
    assert_eq!(counters.snapshot().sessions_accepted, 2);
    engine.shutdown().await;
}
