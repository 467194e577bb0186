/// End-to-end tests: a real relay, an agent or tunnel listener, and TCP
/// clients on loopback
use futures::{SinkExt, StreamExt};
use quickrelay_agent::{Agent, AgentConfig, ControlSession, RelayOptions, TunnelListener};
use quickrelay_connection::{framed, KeepaliveConfig};
use quickrelay_proto::{Frame, FrameCodec};
use quickrelay_server::{RelayConfig, RelayServer, ServiceOptions, StaticServices};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

const SERVICE: &str = "svc";

/// A hand-driven relay end of a physical connection
type RelaySide = Framed<TcpStream, FrameCodec>;
const TOKEN: &str = "T";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

async fn start_relay() -> (RelayServer, String) {
    init_tracing();
    let config = RelayConfig::default()
        .with_public_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .with_correlation_timeout(Duration::from_millis(500));
    let services = StaticServices::new().with_service(ServiceOptions::new(SERVICE, TOKEN, 0));
    let server = RelayServer::new(config, services);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let runner = server.clone();
    tokio::spawn(async move { runner.run(listener).await });

    (server, addr)
}

fn options(relay_addr: &str) -> RelayOptions {
    RelayOptions::new(relay_addr, SERVICE, TOKEN)
}

/// Poll until `condition` holds, failing the test after five seconds
async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_service(server: &RelayServer) -> SocketAddr {
    eventually("service to be published", || server.public_addr(SERVICE).is_some()).await;
    server.public_addr(SERVICE).unwrap()
}

/// Backend that answers "hello" with "world" and then echoes
async fn start_backend() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut hello = [0u8; 5];
                if socket.read_exact(&mut hello).await.is_err() || &hello != b"hello" {
                    return;
                }
                socket.write_all(b"world").await.unwrap();
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

/// Backend that hands every accepted socket to the test
async fn start_backend_sockets() -> (String, mpsc::Receiver<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (tx, rx) = mpsc::channel(8);

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            if tx.send(socket).await.is_err() {
                return;
            }
        }
    });

    (addr, rx)
}

async fn next_socket(sockets: &mut mpsc::Receiver<TcpStream>) -> TcpStream {
    tokio::time::timeout(Duration::from_secs(5), sockets.recv())
        .await
        .expect("backend never dialed")
        .unwrap()
}

/// Read with a deadline; the socket must reach EOF or fail
async fn assert_closed<S: AsyncRead + Unpin>(what: &str, socket: &mut S) {
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), socket.read(&mut buf))
        .await
        .unwrap_or_else(|_| panic!("{} was never closed", what));
    assert!(matches!(read, Ok(0) | Err(_)), "{} still open: {:?}", what, read);
}

async fn start_agent(relay_addr: &str, backend_addr: &str) -> Arc<Agent> {
    start_agent_with(options(relay_addr), backend_addr).await
}

async fn start_agent_with(options: RelayOptions, backend_addr: &str) -> Arc<Agent> {
    let agent = Arc::new(Agent::new(AgentConfig::new(options, backend_addr)));
    let runner = agent.clone();
    tokio::spawn(async move { runner.run().await });
    agent
}

/// Accept the agent's next physical connection on a hand-driven relay
async fn accept_agent(listener: &TcpListener) -> RelaySide {
    let (socket, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("agent never dialed the relay")
        .unwrap();
    framed(socket)
}

/// Next non-keepalive frame from the agent
async fn next_frame(conn: &mut RelaySide) -> Frame {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), conn.next())
            .await
            .expect("no frame from agent")
            .expect("agent closed the connection")
            .unwrap();
        if !frame.is_keepalive() {
            return frame;
        }
    }
}

#[tokio::test]
async fn test_agent_forwards_to_backend() {
    let (server, relay_addr) = start_relay().await;
    let backend_addr = start_backend().await;
    let agent = start_agent(&relay_addr, &backend_addr).await;
    let public_addr = wait_for_service(&server).await;

    let mut client = TcpStream::connect(public_addr).await.unwrap();
    client.write_all(b"hello").await.unwrap();

    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"world");

    // Later chunks arrive in order
    for chunk in [&b"one"[..], b"two", b"three"] {
        client.write_all(chunk).await.unwrap();
        let mut echoed = vec![0u8; chunk.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, chunk);
    }

    assert_eq!(server.connection_count(), 1);
    assert_eq!(agent.active_connections(), 1);

    agent.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn test_client_close_tears_down_both_sides() {
    let (server, relay_addr) = start_relay().await;
    let backend_addr = start_backend().await;
    let agent = start_agent(&relay_addr, &backend_addr).await;
    let public_addr = wait_for_service(&server).await;

    let mut client = TcpStream::connect(public_addr).await.unwrap();
    client.write_all(b"hello").await.unwrap();
    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).await.unwrap();

    drop(client);

    eventually("relay registry to drain", || server.connection_count() == 0).await;
    eventually("agent registry to drain", || agent.active_connections() == 0).await;

    // The session survives the logical connection
    assert_eq!(server.session_count(), 1);

    agent.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn test_backend_down_times_out_public_client() {
    let (server, relay_addr) = start_relay().await;

    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = unused.local_addr().unwrap().to_string();
    drop(unused);

    let agent = start_agent(&relay_addr, &backend_addr).await;
    let public_addr = wait_for_service(&server).await;

    let mut client = TcpStream::connect(public_addr).await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("public client was never closed");
    assert!(matches!(read, Ok(0) | Err(_)));

    eventually("pending entry to be reclaimed", || server.connection_count() == 0).await;
    assert_eq!(agent.active_connections(), 0);

    // The control connection is unaffected
    assert_eq!(server.session_count(), 1);

    agent.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn test_wrong_token_is_authentication_failure() {
    let (server, relay_addr) = start_relay().await;

    let agent = Agent::new(AgentConfig::new(
        RelayOptions::new(relay_addr.as_str(), SERVICE, "WRONG"),
        "127.0.0.1:1",
    ));
    let err = agent.run().await.unwrap_err();
    assert!(err.is_authentication_failure(), "unexpected error: {}", err);
    assert_eq!(server.session_count(), 0);

    server.shutdown();
}

#[tokio::test]
async fn test_second_agent_for_service_is_rejected() {
    let (server, relay_addr) = start_relay().await;
    let backend_addr = start_backend().await;
    let agent = start_agent(&relay_addr, &backend_addr).await;
    wait_for_service(&server).await;

    let err = ControlSession::connect(Arc::new(options(&relay_addr)))
        .await
        .unwrap_err();
    assert!(err.is_authentication_failure(), "unexpected error: {}", err);
    assert_eq!(server.session_count(), 1);

    agent.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn test_agent_shutdown_ends_session() {
    let (server, relay_addr) = start_relay().await;
    let backend_addr = start_backend().await;
    let agent = start_agent(&relay_addr, &backend_addr).await;
    wait_for_service(&server).await;

    agent.shutdown();
    eventually("session to close", || server.session_count() == 0).await;
    assert!(server.public_addr(SERVICE).is_none());

    server.shutdown();
}

#[tokio::test]
async fn test_tunnel_listener_accepts_streams() {
    let (server, relay_addr) = start_relay().await;
    let listener = TunnelListener::bind(options(&relay_addr)).await.unwrap();
    assert_eq!(listener.local_addr().to_string(), format!("{}@{}", SERVICE, relay_addr));

    let public_addr = wait_for_service(&server).await;

    let client = tokio::spawn(async move {
        let mut client = TcpStream::connect(public_addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        reply
    });

    let mut stream = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("no connection accepted")
        .unwrap();
    assert!(!stream.connection_id().is_empty());
    assert_eq!(stream.local_addr(), listener.local_addr());
    assert_eq!(stream.peer_addr(), relay_addr);

    let mut ping = [0u8; 4];
    stream.read_exact(&mut ping).await.unwrap();
    assert_eq!(&ping, b"ping");
    stream.write_all(b"pong").await.unwrap();

    assert_eq!(&client.await.unwrap(), b"pong");
    assert_eq!(listener.active_connections(), 1);

    drop(stream);
    eventually("relay registry to drain", || server.connection_count() == 0).await;

    server.shutdown();
}

#[tokio::test]
async fn test_closed_listener_fails_accept() {
    let (server, relay_addr) = start_relay().await;
    let listener = Arc::new(TunnelListener::bind(options(&relay_addr)).await.unwrap());

    let pending = tokio::spawn({
        let listener = listener.clone();
        async move { listener.accept().await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    listener.close();

    let err = pending.await.unwrap().unwrap_err();
    assert!(err.is_closed());
    assert!(listener.is_closed());
    assert!(listener.accept().await.unwrap_err().is_closed());

    eventually("session to close", || server.session_count() == 0).await;

    server.shutdown();
}

#[tokio::test]
async fn test_backend_close_flushes_data_to_client() {
    let (server, relay_addr) = start_relay().await;
    let (backend_addr, mut sockets) = start_backend_sockets().await;
    let agent = start_agent(&relay_addr, &backend_addr).await;
    let public_addr = wait_for_service(&server).await;

    let mut client = TcpStream::connect(public_addr).await.unwrap();

    let mut backend = next_socket(&mut sockets).await;
    backend.write_all(b"yo").await.unwrap();
    drop(backend);

    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut received))
        .await
        .expect("public client never saw EOF")
        .unwrap();
    assert_eq!(received, b"yo");

    eventually("relay registry to drain", || server.connection_count() == 0).await;
    eventually("agent registry to drain", || agent.active_connections() == 0).await;
    assert_eq!(server.session_count(), 1);

    agent.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn test_relay_shutdown_closes_live_connections() {
    let (server, relay_addr) = start_relay().await;
    let (backend_addr, mut sockets) = start_backend_sockets().await;
    let agent = start_agent(&relay_addr, &backend_addr).await;
    let public_addr = wait_for_service(&server).await;

    let mut client = TcpStream::connect(public_addr).await.unwrap();
    let mut backend = next_socket(&mut sockets).await;

    client.write_all(b"ping").await.unwrap();
    let mut ping = [0u8; 4];
    backend.read_exact(&mut ping).await.unwrap();
    assert_eq!(&ping, b"ping");

    server.shutdown();

    assert_closed("public client", &mut client).await;
    assert_closed("backend", &mut backend).await;

    // The public port is released with the session
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while TcpStream::connect(public_addr).await.is_ok() {
        assert!(tokio::time::Instant::now() < deadline, "public port still accepting");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    eventually("relay registry to drain", || server.connection_count() == 0).await;
    eventually("agent registry to drain", || agent.active_connections() == 0).await;

    agent.shutdown();
}

#[tokio::test]
async fn test_listener_close_disconnects_open_streams() {
    let (server, relay_addr) = start_relay().await;
    let listener = TunnelListener::bind(options(&relay_addr)).await.unwrap();
    let public_addr = wait_for_service(&server).await;

    let mut client = TcpStream::connect(public_addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();

    let mut stream = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("no connection accepted")
        .unwrap();
    let mut ping = [0u8; 4];
    stream.read_exact(&mut ping).await.unwrap();
    assert_eq!(&ping, b"ping");

    listener.close();

    let mut buf = [0u8; 8];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("stream was never closed")
        .unwrap();
    assert_eq!(read, 0);
    assert_closed("public client", &mut client).await;

    eventually("listener registry to drain", || listener.active_connections() == 0).await;
    eventually("relay registry to drain", || server.connection_count() == 0).await;

    server.shutdown();
}

#[tokio::test]
async fn test_disconnect_request_on_control_connection() {
    init_tracing();
    let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = relay.local_addr().unwrap().to_string();
    let (backend_addr, mut sockets) = start_backend_sockets().await;
    let agent = start_agent(&relay_addr, &backend_addr).await;

    let mut control = accept_agent(&relay).await;
    assert_eq!(next_frame(&mut control).await, Frame::handshake_request(SERVICE, TOKEN));
    control.send(Frame::handshake_response()).await.unwrap();

    control.send(Frame::connect_request("c1")).await.unwrap();
    let mut backend = next_socket(&mut sockets).await;
    let mut data = accept_agent(&relay).await;
    assert_eq!(next_frame(&mut data).await, Frame::connect_response("c1"));

    data.send(Frame::data(b"hi".to_vec())).await.unwrap();
    let mut hi = [0u8; 2];
    backend.read_exact(&mut hi).await.unwrap();
    assert_eq!(&hi, b"hi");
    assert_eq!(agent.active_connections(), 1);

    // Unknown IDs are ignored, so exactly one response comes back
    control.send(Frame::disconnect_request("nope")).await.unwrap();
    control.send(Frame::disconnect_request("c1")).await.unwrap();
    assert_eq!(next_frame(&mut control).await, Frame::disconnect_response());

    // The connection itself is torn down on its data connection
    assert_eq!(next_frame(&mut data).await, Frame::disconnect_request("c1"));
    data.send(Frame::disconnect_response()).await.unwrap();
    assert_closed("backend", &mut backend).await;
    eventually("agent registry to drain", || agent.active_connections() == 0).await;

    let extra = tokio::time::timeout(Duration::from_millis(200), async {
        loop {
            match control.next().await {
                Some(Ok(frame)) if frame.is_keepalive() => continue,
                other => return other,
            }
        }
    })
    .await;
    assert!(extra.is_err(), "unexpected frame: {:?}", extra);
    assert!(!agent.is_shutdown());

    agent.shutdown();
}

#[tokio::test]
async fn test_silent_relay_times_out_control_connection() {
    init_tracing();
    let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = relay.local_addr().unwrap().to_string();

    let keepalive = KeepaliveConfig::new(Duration::from_millis(100), Duration::from_millis(300));
    let agent = Agent::new(AgentConfig::new(
        options(&relay_addr).with_keepalive(keepalive),
        "127.0.0.1:1",
    ));
    let run = tokio::spawn(async move { agent.run().await });

    let mut control = accept_agent(&relay).await;
    next_frame(&mut control).await;
    control.send(Frame::handshake_response()).await.unwrap();

    // The agent's keepalives are read but never answered
    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("agent never gave up on the silent relay")
        .unwrap();
    assert!(result.is_err());
    assert!(!result.unwrap_err().is_authentication_failure());
    drop(control);
}
