// ABOUTME: Owned, refcounted outbound frame with an optional back-pointer to its originating protocol
// ABOUTME: Built via OutputMessageBuilder, sealed once, then shared between Connection and Protocol

use crate::protocol::Protocol;
use std::sync::Arc;

/// An outbound frame, ready for (or in the process of) transmission.
///
/// Cloning an `OutputMessage` is cheap: the byte payload is shared via
/// `Arc<[u8]>`, matching the spec's "refcounted send buffer" -- the
/// `Connection` holds one clone while the frame is queued or in flight, and
/// the `Protocol` that produced it may hold another until it releases its
/// own reference.
#[derive(Clone)]
pub struct OutputMessage {
    bytes: Arc<[u8]>,
    protocol: Option<Arc<dyn Protocol>>,
}

impl OutputMessage {
    /// Start building a frame. `bytes` must already be in wire format
    /// (length header included) -- this type does not frame its payload;
    /// framing is the producing `Protocol`'s responsibility, matching the
    /// spec's note that message serialization is out of scope for the core.
    pub fn builder(bytes: Vec<u8>) -> OutputMessageBuilder {
        OutputMessageBuilder {
            bytes,
            protocol: None,
        }
    }

    /// The originating protocol, if any. Used by `Connection::send` to invoke
    /// `on_send_message` before the frame is handed to the socket.
    pub fn protocol(&self) -> Option<&Arc<dyn Protocol>> {
        self.protocol.as_ref()
    }

    /// The wire bytes to write verbatim.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for OutputMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputMessage")
            .field("len", &self.bytes.len())
            .field("has_protocol", &self.protocol.is_some())
            .finish()
    }
}

/// Builder for an [`OutputMessage`]. Mutable until [`OutputMessageBuilder::seal`]
/// is called, after which the frame is immutable and safe to share.
pub struct OutputMessageBuilder {
    bytes: Vec<u8>,
    protocol: Option<Arc<dyn Protocol>>,
}

impl OutputMessageBuilder {
    /// Attach the protocol that produced this frame, so `Connection::send`
    /// can route `on_send_message` to it.
    pub fn with_protocol(mut self, protocol: Arc<dyn Protocol>) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Seal the frame. No further mutation is possible after this point.
    pub fn seal(self) -> OutputMessage {
        OutputMessage {
            bytes: Arc::from(self.bytes.into_boxed_slice()),
            protocol: self.protocol,
        }
    }
}
