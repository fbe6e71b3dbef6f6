// ABOUTME: Connection lifecycle, framing and per-IP login throttling for a long-lived TCP server
// ABOUTME: The socket/backpressure/close-state machinery; application protocols live outside this crate

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod manager;
pub mod message;
pub mod output_message;
pub mod protocol;

pub use config::ConnectionManagerConfig;
pub use connection::{CloseState, Connection, ConnectionId};
pub use dispatcher::{Dispatcher, Job, TokioDispatcher};
pub use error::FrameError;
pub use manager::{ConnectionManager, ProtocolId};
pub use message::NetworkMessage;
pub use output_message::{OutputMessage, OutputMessageBuilder};
pub use protocol::{Protocol, ServicePort};
