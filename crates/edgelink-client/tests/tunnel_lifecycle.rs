//! End-to-end client lifecycle tests
//!
//! Drive a full tunnel client against the in-process transport, with real
//! loopback sockets standing in for the local target service.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use edgelink_client::{
    ChannelState, ClientError, ConnectionId, ControlMessage, CredentialError, CredentialResolver,
    HostRegistration, ResolvedCredentials, StaticCredentials, TunnelClient, TunnelConfig,
    TunnelEvents,
};
use edgelink_transport::memory::{self, MemoryConnector, MemoryPeer};

const END_GRACE: Duration = Duration::from_millis(50);
const DISCONNECT_GRACE: Duration = Duration::from_millis(80);

fn config(target_port: u16) -> TunnelConfig {
    TunnelConfig::builder()
        .server_type("https")
        .server_fqdn("svc.example.net")
        .target_host("127.0.0.1")
        .target_port(target_port)
        .end_grace(END_GRACE)
        .disconnect_grace(DISCONNECT_GRACE)
        .build()
        .unwrap()
}

async fn start_client(config: TunnelConfig, events: TunnelEvents) -> (TunnelClient, MemoryPeer) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("edgelink_client=debug")
        .try_init();

    let (transport, peer) = memory::pair();
    let mut client = TunnelClient::new(
        config,
        Arc::new(StaticCredentials::new("edge-eu1.example.net")),
        Arc::new(MemoryConnector::new(transport)),
        events,
    );
    client.start().await.unwrap();
    (client, peer)
}

async fn recv_payload(peer: &mut MemoryPeer) -> ControlMessage {
    timeout(Duration::from_secs(2), peer.recv())
        .await
        .expect("timed out waiting for envelope")
        .expect("client closed transport")
        .payload
}

async fn expect_register(peer: &mut MemoryPeer) {
    match recv_payload(peer).await {
        ControlMessage::RegisterServer {
            hostname,
            server_type,
        } => {
            assert_eq!(hostname, "svc.example.net");
            assert_eq!(server_type, "https");
        }
        other => panic!("Expected RegisterServer, got {:?}", other),
    }
}

fn create_connection(id: &str) -> ControlMessage {
    ControlMessage::CreateConnection {
        connection_id: ConnectionId::from(id),
    }
}

fn data(id: &str, payload: &[u8]) -> ControlMessage {
    ControlMessage::Data {
        connection_id: ConnectionId::from(id),
        payload: payload.to_vec(),
    }
}

fn host_registered(hostname: &str) -> ControlMessage {
    ControlMessage::HostRegistered {
        registration: HostRegistration {
            hostname: hostname.to_string(),
            uid: Some("u-1".to_string()),
        },
    }
}

async fn wait_until_empty(client: &TunnelClient) {
    timeout(Duration::from_secs(2), async {
        while client.active_connections().await != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection table did not drain");
}

async fn accept(listener: &TcpListener) -> TcpStream {
    timeout(Duration::from_secs(2), listener.accept())
        .await
        .expect("timed out waiting for local connect")
        .expect("accept failed")
        .0
}

#[tokio::test]
async fn test_registers_once_per_episode() {
    let connects = Arc::new(AtomicUsize::new(0));
    let counter = connects.clone();
    let events = TunnelEvents::new().on_connect(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let (client, mut peer) = start_client(config(9), events).await;

    peer.connect_session();
    expect_register(&mut peer).await;

    let mut states = client.state_changes();
    timeout(
        Duration::from_secs(2),
        states.wait_for(|state| *state == ChannelState::Registered),
    )
    .await
    .expect("never reached Registered")
    .unwrap();

    // A duplicate low-level connect notification does not re-register or
    // re-fire the callback.
    peer.connect_session();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(peer.try_recv().is_none());
    assert_eq!(connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_local_data_forwarded_then_error_close_sequence() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let opened = Arc::new(Mutex::new(Vec::new()));
    let opened_ids = opened.clone();
    let events = TunnelEvents::new().on_connection(move |id| {
        opened_ids.lock().unwrap().push(id);
    });

    let (client, mut peer) = start_client(config(port), events).await;
    peer.connect_session();
    expect_register(&mut peer).await;

    peer.send(create_connection("c1"));
    let mut socket = accept(&listener).await;

    socket.write_all(b"PING").await.unwrap();
    socket.flush().await.unwrap();

    match recv_payload(&mut peer).await {
        ControlMessage::Data {
            connection_id,
            payload,
        } => {
            assert_eq!(connection_id.as_str(), "c1");
            assert_eq!(payload, b"PING");
        }
        other => panic!("Expected Data, got {:?}", other),
    }

    assert_eq!(opened.lock().unwrap().as_slice(), &[ConnectionId::from("c1")]);

    // Local close with an error: reset the socket instead of closing it.
    socket.set_linger(Some(Duration::ZERO)).unwrap();
    drop(socket);

    match recv_payload(&mut peer).await {
        ControlMessage::ConnectionError { connection_id, .. } => {
            assert_eq!(connection_id.as_str(), "c1");
        }
        other => panic!("Expected ConnectionError, got {:?}", other),
    }
    match recv_payload(&mut peer).await {
        ControlMessage::DisconnectClient { connection_id } => {
            assert_eq!(connection_id.as_str(), "c1");
        }
        other => panic!("Expected DisconnectClient, got {:?}", other),
    }

    wait_until_empty(&client).await;
}

#[tokio::test]
async fn test_inbound_data_applied_in_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (_client, mut peer) = start_client(config(port), TunnelEvents::new()).await;

    peer.connect_session();
    expect_register(&mut peer).await;

    peer.send(create_connection("c1"));
    let mut socket = accept(&listener).await;

    peer.send(data("c1", b"hel"));
    peer.send(data("c1", b"lo"));

    let mut received = vec![0u8; 5];
    timeout(Duration::from_secs(2), socket.read_exact(&mut received))
        .await
        .expect("timed out reading from local socket")
        .unwrap();
    assert_eq!(&received, b"hello");
}

#[tokio::test]
async fn test_refused_target_cuts_client_without_disconnect() {
    // Bind then drop to get a loopback port with nothing listening.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let (client, mut peer) = start_client(config(port), TunnelEvents::new()).await;
    peer.connect_session();
    expect_register(&mut peer).await;

    peer.send(create_connection("c1"));

    match recv_payload(&mut peer).await {
        ControlMessage::ConnectionError { connection_id, .. } => {
            assert_eq!(connection_id.as_str(), "c1");
        }
        other => panic!("Expected ConnectionError, got {:?}", other),
    }
    match recv_payload(&mut peer).await {
        ControlMessage::CutClient { connection_id } => {
            assert_eq!(connection_id.as_str(), "c1");
        }
        other => panic!("Expected CutClient, got {:?}", other),
    }

    // No disconnect follows the cut.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(peer.try_recv().is_none());
    wait_until_empty(&client).await;
}

#[tokio::test]
async fn test_duplicate_create_connection_keeps_first_entry() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (client, mut peer) = start_client(config(port), TunnelEvents::new()).await;

    peer.connect_session();
    expect_register(&mut peer).await;

    peer.send(create_connection("c2"));
    let mut socket = accept(&listener).await;

    peer.send(create_connection("c2"));

    // The second create is rejected: no second local connect happens.
    assert!(timeout(Duration::from_millis(150), listener.accept())
        .await
        .is_err());
    assert_eq!(client.active_connections().await, 1);

    // The first entry still forwards untouched.
    socket.write_all(b"still alive").await.unwrap();
    match recv_payload(&mut peer).await {
        ControlMessage::Data {
            connection_id,
            payload,
        } => {
            assert_eq!(connection_id.as_str(), "c2");
            assert_eq!(payload, b"still alive");
        }
        other => panic!("Expected Data, got {:?}", other),
    }
}

#[tokio::test]
async fn test_channel_disconnect_drains_within_grace() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (client, mut peer) = start_client(config(port), TunnelEvents::new()).await;

    peer.connect_session();
    expect_register(&mut peer).await;

    peer.send(create_connection("c1"));
    peer.send(create_connection("c2"));
    let _s1 = accept(&listener).await;
    let _s2 = accept(&listener).await;
    assert_eq!(client.active_connections().await, 2);

    peer.disconnect_session();

    // Nothing is inserted while disconnected.
    peer.send(create_connection("c3"));
    assert!(timeout(Duration::from_millis(100), listener.accept())
        .await
        .is_err());

    tokio::time::sleep(DISCONNECT_GRACE * 3).await;
    assert_eq!(client.active_connections().await, 0);
}

#[tokio::test]
async fn test_host_registered_fires_once_per_episode() {
    let created = Arc::new(AtomicUsize::new(0));
    let counter = created.clone();
    let events = TunnelEvents::new().on_local_server_created(move |registration| {
        assert_eq!(registration.hostname, "svc.example.net");
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let (_client, mut peer) = start_client(config(9), events).await;
    peer.connect_session();
    expect_register(&mut peer).await;

    peer.send(host_registered("svc.example.net"));
    peer.send(host_registered("svc.example.net"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(created.load(Ordering::SeqCst), 1);

    // A new connection episode re-arms the one-shot.
    peer.disconnect_session();
    peer.connect_session();
    expect_register(&mut peer).await;
    peer.send(host_registered("svc.example.net"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(created.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_end_removes_connection_after_grace() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (client, mut peer) = start_client(config(port), TunnelEvents::new()).await;

    peer.connect_session();
    expect_register(&mut peer).await;

    // An _end without an id is ignored.
    peer.send(ControlMessage::End {
        connection_id: None,
    });

    peer.send(create_connection("c1"));
    let mut socket = accept(&listener).await;
    assert_eq!(client.active_connections().await, 1);

    peer.send(ControlMessage::End {
        connection_id: Some(ConnectionId::from("c1")),
    });

    wait_until_empty(&client).await;

    // The local socket observes the close.
    let mut buffer = [0u8; 1];
    let read = timeout(Duration::from_secs(2), socket.read(&mut buffer))
        .await
        .expect("timed out waiting for local close")
        .unwrap();
    assert_eq!(read, 0);
}

#[tokio::test]
async fn test_outbound_dropped_while_disconnected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (_client, mut peer) = start_client(config(port), TunnelEvents::new()).await;

    peer.connect_session();
    expect_register(&mut peer).await;

    peer.send(create_connection("c1"));
    let mut socket = accept(&listener).await;

    peer.disconnect_session();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The connection task still reads this, but the channel drops the
    // resulting data message instead of sending it.
    socket.write_all(b"too late").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(peer.try_recv().is_none());
}

#[tokio::test]
async fn test_data_for_unknown_connection_is_dropped() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (_client, mut peer) = start_client(config(port), TunnelEvents::new()).await;

    peer.connect_session();
    expect_register(&mut peer).await;

    peer.send(data("ghost", b"nobody home"));

    // The channel keeps working afterwards.
    peer.send(create_connection("c1"));
    let mut socket = accept(&listener).await;
    peer.send(data("c1", b"hi"));

    let mut received = vec![0u8; 2];
    timeout(Duration::from_secs(2), socket.read_exact(&mut received))
        .await
        .expect("timed out reading from local socket")
        .unwrap();
    assert_eq!(&received, b"hi");
}

#[tokio::test]
async fn test_shutdown_closes_outstanding_connections() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (mut client, mut peer) = start_client(config(port), TunnelEvents::new()).await;

    peer.connect_session();
    expect_register(&mut peer).await;

    peer.send(create_connection("c1"));
    let mut socket = accept(&listener).await;
    assert_eq!(client.active_connections().await, 1);

    client.shutdown().await;
    assert_eq!(client.active_connections().await, 0);
    assert_eq!(client.state(), ChannelState::Disconnected);

    // The local socket observes the teardown.
    let mut buffer = [0u8; 1];
    let read = timeout(Duration::from_secs(2), socket.read(&mut buffer))
        .await
        .expect("timed out waiting for local close");
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_permanent_transport_close_tears_down() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (client, mut peer) = start_client(config(port), TunnelEvents::new()).await;

    peer.connect_session();
    expect_register(&mut peer).await;

    peer.send(create_connection("c1"));
    let _socket = accept(&listener).await;
    assert_eq!(client.active_connections().await, 1);

    peer.close_session();

    wait_until_empty(&client).await;
    let mut states = client.state_changes();
    timeout(
        Duration::from_secs(2),
        states.wait_for(|state| *state == ChannelState::Disconnected),
    )
    .await
    .expect("never returned to Disconnected")
    .unwrap();
}

#[derive(Debug)]
struct FailingResolver;

#[async_trait]
impl CredentialResolver for FailingResolver {
    async fn resolve(&self, fqdn: &str) -> Result<ResolvedCredentials, CredentialError> {
        Err(CredentialError::NotFound {
            fqdn: fqdn.to_string(),
            path: "/nonexistent/creds".into(),
        })
    }
}

#[tokio::test]
async fn test_credential_failure_is_fatal_to_start() {
    let (transport, _peer) = memory::pair();
    let mut client = TunnelClient::new(
        config(9),
        Arc::new(FailingResolver),
        Arc::new(MemoryConnector::new(transport)),
        TunnelEvents::new(),
    );

    let err = client.start().await.unwrap_err();
    assert!(matches!(err, ClientError::CredentialResolution(_)));
    assert_eq!(client.state(), ChannelState::Disconnected);
    assert_eq!(client.active_connections().await, 0);
}
