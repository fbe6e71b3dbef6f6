// ABOUTME: Error types for frame decoding and connection-level failures
// ABOUTME: Mirrors the teacher crate's layered thiserror enums: one per concern, with `#[from]` glue

use thiserror::Error;

/// Errors raised while decoding a [`crate::message::NetworkMessage`] header or body.
///
/// These are "frame invalid" errors in the sense of the connection layer's error
/// policy: they always terminate the connection that produced them, but never
/// affect any other connection.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The buffer does not yet contain a complete frame. Not a real error: the
    /// caller should wait for more bytes and retry.
    #[error("incomplete frame")]
    Incomplete,

    /// The decoded body length is zero, negative, or larger than
    /// `NETWORKMESSAGE_MAXSIZE - 16`.
    #[error("frame body length {0} is out of range")]
    FrameTooLarge(u32),
}
