// ABOUTME: Minimal standalone server demonstrating the connection layer end to end
// ABOUTME: Accepts loopback connections and echoes every frame back verbatim

use std::sync::Arc;

use tcpcore::{
    Connection, ConnectionManager, ConnectionManagerConfig, NetworkMessage, OutputMessage,
    Protocol, ServicePort, TokioDispatcher,
};
use tokio::net::TcpListener;
use tracing::info;

/// Echoes every inbound frame straight back to its sender, unframed payload
/// and all -- enough of a `Protocol` to exercise accept, read, write, and
/// close without pulling in a real application protocol.
struct EchoProtocol {
    connection: std::sync::Mutex<Option<Arc<Connection>>>,
}

impl EchoProtocol {
    fn new() -> Arc<Self> {
        Arc::new(EchoProtocol {
            connection: std::sync::Mutex::new(None),
        })
    }

    fn echo(&self, payload: &[u8]) {
        let Some(connection) = self.connection.lock().unwrap().clone() else {
            return;
        };
        let mut frame = Vec::with_capacity(2 + payload.len());
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(payload);
        connection.send(OutputMessage::builder(frame).seal());
    }
}

impl Protocol for EchoProtocol {
    fn on_connect(&self) {
        info!("client connected");
    }

    fn on_recv_first_message(self: Arc<Self>, message: &mut NetworkMessage) {
        self.echo(message.payload());
    }

    fn on_recv_message(self: Arc<Self>, message: &mut NetworkMessage) {
        self.echo(message.payload());
    }

    fn on_send_message(&self, _message: &OutputMessage) {}

    fn release_protocol(&self) {
        info!("client disconnected");
    }

    fn set_connection(&self, connection: Option<Arc<Connection>>) {
        *self.connection.lock().unwrap() = connection;
    }
}

struct EchoPort;

impl ServicePort for EchoPort {
    fn make_protocol(
        &self,
        _checksum_enabled: bool,
        _message: &NetworkMessage,
    ) -> Option<Arc<dyn Protocol>> {
        Some(EchoProtocol::new())
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt::init();

    let listener = TcpListener::bind("127.0.0.1:9999").await?;
    let manager = ConnectionManager::new(ConnectionManagerConfig::default());
    let dispatcher = Arc::new(TokioDispatcher::new());
    let port: Arc<dyn ServicePort> = Arc::new(EchoPort);

    info!(addr = %listener.local_addr()?, "echo server listening");

    loop {
        let (socket, peer) = listener.accept().await?;
        info!(%peer, "accepted connection");
        let connection =
            manager.create_connection(socket, Arc::downgrade(&port), Arc::clone(&dispatcher));
        connection.start();
    }
}
