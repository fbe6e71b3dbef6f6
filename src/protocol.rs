// ABOUTME: The pluggable application-layer capability a Connection drives
// ABOUTME: Concrete protocols (login, game-world, web-login, ...) live outside this crate

use crate::connection::Connection;
use crate::message::NetworkMessage;
use crate::output_message::OutputMessage;
use std::sync::Arc;

/// Application-level handler attached to at most one [`Connection`].
///
/// A `Connection` never interprets frame payloads itself; every decoded
/// frame is handed to the attached `Protocol` unchanged. Implementations are
/// expected to be cheap to invoke synchronously from the connection's read
/// loop -- if a callback needs to do real work (DB lookups, world-state
/// mutation) it should hand that work off to the caller's own task queue
/// rather than blocking here.
pub trait Protocol: Send + Sync {
    /// Called once, immediately after the protocol is attached to a connection.
    fn on_connect(&self);

    /// Called exactly once, with the first decoded frame. The read cursor of
    /// `message` is positioned past any leading checksum (or, if this
    /// protocol was preinstalled on the connection, past one unvalidated
    /// opaque tag byte -- see [`Connection::handle`]).
    fn on_recv_first_message(self: Arc<Self>, message: &mut NetworkMessage);

    /// Called for every frame after the first.
    fn on_recv_message(self: Arc<Self>, message: &mut NetworkMessage);

    /// Called from [`Connection::send`] before the frame is written or
    /// queued, so the protocol can perform outbound encoding (encryption,
    /// additional framing) in place.
    fn on_send_message(&self, message: &OutputMessage);

    /// Posted as a dispatcher task when the owning connection transitions to
    /// `Closing`. Always runs after `set_connection(None)` has already been
    /// called for this protocol.
    fn release_protocol(&self);

    /// Back-reference installer. Called with `Some(connection)` when the
    /// protocol is attached, and with `None` right before the connection
    /// enters `Closing`. A protocol must not call back into `connection`
    /// after receiving `None`.
    fn set_connection(&self, connection: Option<Arc<Connection>>);
}

/// Factory that selects a [`Protocol`] for a newly arrived first packet.
///
/// Returning `None` means "reject this connection" -- the `Connection` closes
/// immediately without ever calling `on_recv_first_message`.
pub trait ServicePort: Send + Sync {
    fn make_protocol(
        &self,
        checksum_enabled: bool,
        message: &NetworkMessage,
    ) -> Option<Arc<dyn Protocol>>;
}
