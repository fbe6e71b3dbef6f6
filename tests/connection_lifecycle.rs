// ABOUTME: End-to-end tests driving real loopback TCP sockets through Connection/ConnectionManager
// ABOUTME: Exercises the scenarios from the specification: framing, checksums, close, throttling

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tcpcore::{
    CloseState, Connection, ConnectionManager, ConnectionManagerConfig, NetworkMessage,
    OutputMessage, Protocol, ServicePort, TokioDispatcher,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
enum Event {
    Connect,
    First(Vec<u8>),
    Message(Vec<u8>),
    Released,
}

/// A `Protocol` that records every callback it receives so a test can assert
/// on call order and payload contents from the outside.
struct RecordingProtocol {
    events: mpsc::UnboundedSender<Event>,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl RecordingProtocol {
    fn new(events: mpsc::UnboundedSender<Event>) -> Arc<Self> {
        Arc::new(RecordingProtocol {
            events,
            connection: Mutex::new(None),
        })
    }
}

impl Protocol for RecordingProtocol {
    fn on_connect(&self) {
        let _ = self.events.send(Event::Connect);
    }

    fn on_recv_first_message(self: Arc<Self>, message: &mut NetworkMessage) {
        let _ = self.events.send(Event::First(message.payload().to_vec()));
    }

    fn on_recv_message(self: Arc<Self>, message: &mut NetworkMessage) {
        let _ = self.events.send(Event::Message(message.payload().to_vec()));
    }

    fn on_send_message(&self, _message: &OutputMessage) {}

    fn release_protocol(&self) {
        let _ = self.events.send(Event::Released);
    }

    fn set_connection(&self, connection: Option<Arc<Connection>>) {
        *self.connection.lock().unwrap() = connection;
    }
}

/// A `ServicePort` that hands out one `RecordingProtocol`, remembering whether
/// the first frame it saw carried a valid checksum and optionally refusing
/// the connection outright.
struct RecordingPort {
    events: mpsc::UnboundedSender<Event>,
    observed_checksum: Mutex<Option<bool>>,
    refuse: bool,
}

impl RecordingPort {
    fn new(events: mpsc::UnboundedSender<Event>) -> Arc<Self> {
        Arc::new(RecordingPort {
            events,
            observed_checksum: Mutex::new(None),
            refuse: false,
        })
    }

    fn refusing(events: mpsc::UnboundedSender<Event>) -> Arc<Self> {
        Arc::new(RecordingPort {
            events,
            observed_checksum: Mutex::new(None),
            refuse: true,
        })
    }
}

impl ServicePort for RecordingPort {
    fn make_protocol(
        &self,
        checksum_enabled: bool,
        _message: &NetworkMessage,
    ) -> Option<Arc<dyn Protocol>> {
        *self.observed_checksum.lock().unwrap() = Some(checksum_enabled);
        if self.refuse {
            return None;
        }
        Some(RecordingProtocol::new(self.events.clone()))
    }
}

fn header(body_len: u16) -> [u8; 2] {
    body_len.to_le_bytes()
}

fn adler32_of(bytes: &[u8]) -> u32 {
    adler32::RollingAdler32::from_buffer(bytes).hash()
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for protocol event")
        .expect("event channel closed unexpectedly")
}

fn default_manager() -> Arc<ConnectionManager> {
    ConnectionManager::new(ConnectionManagerConfig::default())
}

/// S1: a bare frame with no protocol preinstalled causes the service port to
/// select a protocol from the first frame's payload, and that protocol
/// receives the frame via `on_recv_first_message`.
#[tokio::test]
async fn first_message_selects_a_protocol() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let manager = default_manager();
    let dispatcher = Arc::new(TokioDispatcher::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let port: Arc<dyn ServicePort> = RecordingPort::new(tx);

    let mut client = TcpStream::connect(addr).await.unwrap();
    let (socket, _) = listener.accept().await.unwrap();
    let conn = manager.create_connection(socket, Arc::downgrade(&port), dispatcher);
    conn.start();

    client.write_all(&header(4)).await.unwrap();
    client.write_all(&[0xDE, 0xAD, 0xBE, 0xEF]).await.unwrap();
    client.flush().await.unwrap();

    match next_event(&mut rx).await {
        Event::First(payload) => assert_eq!(payload, vec![0xDE, 0xAD, 0xBE, 0xEF]),
        other => panic!("expected First, got {other:?}"),
    }
}

/// S2: a checksummed frame following the first one is delivered with the
/// cursor advanced past the checksum, and a mismatching one is delivered with
/// the cursor left at the body head.
#[tokio::test]
async fn subsequent_message_checksum_is_detected_per_frame() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let manager = default_manager();
    let dispatcher = Arc::new(TokioDispatcher::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let port: Arc<dyn ServicePort> = RecordingPort::new(tx);

    let mut client = TcpStream::connect(addr).await.unwrap();
    let (socket, _) = listener.accept().await.unwrap();
    let conn = manager.create_connection(socket, Arc::downgrade(&port), dispatcher);
    conn.start();

    client.write_all(&header(4)).await.unwrap();
    client.write_all(&[0x01, 0x02, 0x03, 0x04]).await.unwrap();
    assert!(matches!(next_event(&mut rx).await, Event::First(_)));

    let tail = [0xAA, 0xBB, 0xCC, 0xDD];
    let checksum = adler32_of(&tail);
    let mut body = Vec::new();
    body.extend_from_slice(&checksum.to_le_bytes());
    body.extend_from_slice(&tail);
    client.write_all(&header(body.len() as u16)).await.unwrap();
    client.write_all(&body).await.unwrap();

    match next_event(&mut rx).await {
        Event::Message(payload) => assert_eq!(payload, tail),
        other => panic!("expected Message, got {other:?}"),
    }

    let bad_body = [0x11, 0x22, 0x33, 0x44];
    client
        .write_all(&header(bad_body.len() as u16))
        .await
        .unwrap();
    client.write_all(&bad_body).await.unwrap();

    match next_event(&mut rx).await {
        Event::Message(payload) => assert_eq!(payload, bad_body),
        other => panic!("expected Message, got {other:?}"),
    }
}

/// A service port that refuses the connection closes it immediately, without
/// ever calling `on_recv_first_message`.
#[tokio::test]
async fn refused_protocol_selection_closes_the_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let manager = default_manager();
    let dispatcher = Arc::new(TokioDispatcher::new());
    let (tx, _rx) = mpsc::unbounded_channel();
    let port: Arc<dyn ServicePort> = RecordingPort::refusing(tx);

    let mut client = TcpStream::connect(addr).await.unwrap();
    let (socket, _) = listener.accept().await.unwrap();
    let conn = manager.create_connection(socket, Arc::downgrade(&port), dispatcher);
    conn.start();

    client.write_all(&header(1)).await.unwrap();
    client.write_all(&[0x00]).await.unwrap();

    // No protocol was ever attached, so no Released event is posted either;
    // the only observable effect is the socket going away and the
    // connection leaving the registry.
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("timed out waiting for the connection to close")
        .unwrap();
    assert_eq!(n, 0, "connection should have been closed, not written to");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.connection_count(), 0);
}

/// A protocol preinstalled via `handle` (e.g. a dedicated login gateway)
/// skips exactly one opaque tag byte before the first frame is dispatched.
#[tokio::test]
async fn preinstalled_protocol_skips_one_tag_byte() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let manager = default_manager();
    let dispatcher = Arc::new(TokioDispatcher::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let protocol = RecordingProtocol::new(tx.clone());
    let port: Arc<dyn ServicePort> = RecordingPort::new(tx);

    let mut client = TcpStream::connect(addr).await.unwrap();
    let (socket, _) = listener.accept().await.unwrap();
    let conn = manager.create_connection(socket, Arc::downgrade(&port), dispatcher);
    conn.handle(protocol);

    assert!(matches!(next_event(&mut rx).await, Event::Connect));

    // Tag byte 0x7F followed by a 3-byte payload.
    client.write_all(&header(4)).await.unwrap();
    client
        .write_all(&[0x7F, 0x01, 0x02, 0x03])
        .await
        .unwrap();

    match next_event(&mut rx).await {
        Event::First(payload) => assert_eq!(payload, vec![0x01, 0x02, 0x03]),
        other => panic!("expected First, got {other:?}"),
    }
}

/// S4: concurrent `close()` calls from multiple tasks still result in the
/// protocol being released exactly once and the connection leaving the
/// registry exactly once.
#[tokio::test]
async fn concurrent_close_is_idempotent() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let manager = default_manager();
    let dispatcher = Arc::new(TokioDispatcher::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let protocol = RecordingProtocol::new(tx);

    let port: Arc<dyn ServicePort> = RecordingPort::new(mpsc::unbounded_channel().0);
    let _client = TcpStream::connect(addr).await.unwrap();
    let (socket, _) = listener.accept().await.unwrap();
    let conn = manager.create_connection(socket, Arc::downgrade(&port), dispatcher);
    conn.handle(protocol);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let conn = Arc::clone(&conn);
        handles.push(tokio::spawn(async move {
            conn.close();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let mut released = 0;
    loop {
        match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
            Ok(Some(Event::Released)) => released += 1,
            Ok(Some(_)) => {}
            _ => break,
        }
    }
    assert_eq!(released, 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.connection_count(), 0);
}

/// S6: the remote end closing the socket while a header read is outstanding
/// drives the connection through `Requested`/`Closing` and releases it.
#[tokio::test]
async fn remote_eof_tears_down_the_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let manager = default_manager();
    let dispatcher = Arc::new(TokioDispatcher::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let protocol = RecordingProtocol::new(tx);
    let port: Arc<dyn ServicePort> = RecordingPort::new(mpsc::unbounded_channel().0);

    let client = TcpStream::connect(addr).await.unwrap();
    let (socket, _) = listener.accept().await.unwrap();
    let conn = manager.create_connection(socket, Arc::downgrade(&port), dispatcher);
    conn.handle(protocol);

    assert!(matches!(next_event(&mut rx).await, Event::Connect));

    drop(client);

    assert!(matches!(next_event(&mut rx).await, Event::Released));
    assert_eq!(conn.close_state(), CloseState::Closing);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.connection_count(), 0);
}

/// S3: once the combined in-flight-plus-queued write count passes the
/// slow-consumer threshold, the connection closes itself -- even though the
/// peer eventually drains the socket and every queued frame is written.
#[tokio::test]
async fn slow_consumer_is_force_closed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let manager = default_manager();
    let dispatcher = Arc::new(TokioDispatcher::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let protocol = RecordingProtocol::new(tx);
    let port: Arc<dyn ServicePort> = RecordingPort::new(mpsc::unbounded_channel().0);

    let client = TcpStream::connect(addr).await.unwrap();
    let (socket, _) = listener.accept().await.unwrap();
    let conn = manager.create_connection(socket, Arc::downgrade(&port), dispatcher);
    conn.handle(protocol);
    assert!(matches!(next_event(&mut rx).await, Event::Connect));

    // Queue well over the 500-frame threshold without yielding, so none of
    // them have a chance to drain before the count is evaluated.
    for i in 0..600u32 {
        let msg = OutputMessage::builder(i.to_le_bytes().to_vec()).seal();
        conn.send(msg);
    }

    assert_ne!(conn.close_state(), CloseState::None);

    // Let the peer drain the socket so the in-flight writes can retire and
    // teardown can actually finish.
    let drain = tokio::spawn(async move {
        let mut client = client;
        let mut buf = [0u8; 4096];
        loop {
            match client.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    assert!(matches!(next_event(&mut rx).await, Event::Released));
    drain.await.unwrap();
}

/// Throttling is exercised end to end through the manager, independent of any
/// live socket (mirrors the unit tests in `manager.rs`, against the IPv4
/// address a real accepted socket would report).
#[tokio::test]
async fn ip_throttle_blocks_one_protocol_but_not_another() {
    let manager = ConnectionManager::new(ConnectionManagerConfig {
        max_login_tries: 3,
        retry_timeout: Duration::from_secs(5),
        login_timeout: Duration::from_secs(60),
        force_close_slow_connection: true,
    });
    let ip = Ipv4Addr::new(1, 2, 3, 4);
    for _ in 0..=3 {
        manager.add_attempt(ip, 10, false);
    }
    assert!(manager.is_disabled(ip, 10));
    assert!(!manager.is_disabled(ip, 20));
}
