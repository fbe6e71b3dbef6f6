// ABOUTME: Fixed-capacity inbound frame buffer: header slot, body slot, and a read cursor
// ABOUTME: Owned exclusively by a connection's read loop -- at most one read is ever outstanding

use crate::config::{CHECKSUM_LENGTH, HEADER_LENGTH, MAX_BODY_LENGTH, NETWORKMESSAGE_MAXSIZE};
use crate::error::FrameError;

/// One reusable inbound frame buffer.
///
/// Mirrors the wire layout directly: the first [`HEADER_LENGTH`] bytes hold
/// the little-endian body length, followed by up to [`MAX_BODY_LENGTH`] bytes
/// of body. `length` tracks how many bytes of `buffer` currently hold valid
/// data (header + body read so far); `read_pos` is the cursor a `Protocol`
/// advances as it consumes the body.
pub struct NetworkMessage {
    buffer: Box<[u8; NETWORKMESSAGE_MAXSIZE]>,
    length: usize,
    read_pos: usize,
}

impl NetworkMessage {
    /// A fresh buffer with nothing read into it yet.
    pub fn new() -> Self {
        NetworkMessage {
            buffer: Box::new([0u8; NETWORKMESSAGE_MAXSIZE]),
            length: 0,
            read_pos: 0,
        }
    }

    /// The header slot, ready to receive exactly [`HEADER_LENGTH`] bytes from the socket.
    pub fn header_slot(&mut self) -> &mut [u8] {
        &mut self.buffer[..HEADER_LENGTH]
    }

    /// Interpret the header as a little-endian `u16` body length.
    ///
    /// Fails with [`FrameError::FrameTooLarge`] if the declared length is
    /// zero or greater than [`MAX_BODY_LENGTH`].
    pub fn decode_header(&self) -> Result<u16, FrameError> {
        let size = u16::from_le_bytes([self.buffer[0], self.buffer[1]]);
        if size == 0 || size as usize > MAX_BODY_LENGTH {
            return Err(FrameError::FrameTooLarge(size as u32));
        }
        Ok(size)
    }

    /// The body slot for a frame of declared `size`, ready to receive bytes from the socket.
    pub fn body_slot(&mut self, size: u16) -> &mut [u8] {
        let size = size as usize;
        self.length = HEADER_LENGTH + size;
        self.read_pos = HEADER_LENGTH;
        &mut self.buffer[HEADER_LENGTH..HEADER_LENGTH + size]
    }

    /// Bytes remaining between the read cursor and the end of the valid body.
    pub fn remaining(&self) -> usize {
        self.length - self.read_pos
    }

    /// Non-advancing peek at the 4 bytes starting at the read cursor,
    /// little-endian, matching the header's byte order.
    fn peek_u32(&self) -> u32 {
        let p = self.read_pos;
        u32::from_le_bytes([
            self.buffer[p],
            self.buffer[p + 1],
            self.buffer[p + 2],
            self.buffer[p + 3],
        ])
    }

    /// Advance the read cursor by `n` bytes without touching the data.
    pub fn skip_bytes(&mut self, n: usize) {
        self.read_pos += n;
    }

    /// The unread tail of the body, from the read cursor to the end.
    pub fn payload(&self) -> &[u8] {
        &self.buffer[self.read_pos..self.length]
    }

    /// Attempt to consume a leading Adler-32 checksum at the read cursor.
    ///
    /// Computes the checksum over everything *after* the candidate 4-byte
    /// checksum field and compares it to the 4 bytes actually present. If
    /// they match, the cursor advances past the checksum and `true` is
    /// returned; otherwise the cursor is left untouched and `false` is
    /// returned. Frames without a checksum are, by construction,
    /// indistinguishable from frames whose first 4 body bytes happen to
    /// equal the Adler-32 of the remainder -- this is inherent to the wire
    /// format, not a bug in this check.
    ///
    /// If fewer than [`CHECKSUM_LENGTH`] bytes remain at the cursor there is
    /// no candidate checksum to test; this returns `false` without reading
    /// out of bounds.
    pub fn try_consume_checksum(&mut self) -> bool {
        let remaining = self.remaining();
        if remaining < CHECKSUM_LENGTH {
            return false;
        }

        let received = self.peek_u32();
        let tail_len = remaining - CHECKSUM_LENGTH;
        let computed = if tail_len == 0 {
            0
        } else {
            let start = self.read_pos + CHECKSUM_LENGTH;
            adler32::RollingAdler32::from_buffer(&self.buffer[start..start + tail_len]).hash()
        };

        if received == computed {
            self.skip_bytes(CHECKSUM_LENGTH);
            true
        } else {
            false
        }
    }

    /// Skip exactly one opaque tag byte, used when a protocol was preinstalled
    /// on the connection before the first packet arrived (see
    /// [`crate::connection::Connection::handle`]). The tag is never validated.
    pub fn skip_preinstalled_tag(&mut self) {
        self.skip_bytes(1);
    }
}

impl Default for NetworkMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NetworkMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMessage")
            .field("length", &self.length)
            .field("read_pos", &self.read_pos)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_length_body() {
        let mut msg = NetworkMessage::new();
        msg.header_slot().copy_from_slice(&0u16.to_le_bytes());
        assert!(matches!(
            msg.decode_header(),
            Err(FrameError::FrameTooLarge(0))
        ));
    }

    #[test]
    fn rejects_body_length_over_max() {
        let mut msg = NetworkMessage::new();
        let too_big = (MAX_BODY_LENGTH + 1) as u16;
        msg.header_slot().copy_from_slice(&too_big.to_le_bytes());
        assert!(matches!(msg.decode_header(), Err(FrameError::FrameTooLarge(_))));
    }

    #[test]
    fn accepts_body_length_of_one() {
        let mut msg = NetworkMessage::new();
        msg.header_slot().copy_from_slice(&1u16.to_le_bytes());
        assert_eq!(msg.decode_header().unwrap(), 1);
    }

    #[test]
    fn checksum_match_advances_cursor_by_four() {
        let mut msg = NetworkMessage::new();
        let body: &[u8] = &[0xAA, 0xBB, 0xCC, 0xDD];
        let checksum = adler32::RollingAdler32::from_buffer(body).hash();
        msg.header_slot()
            .copy_from_slice(&(8u16).to_le_bytes());
        let slot = msg.body_slot(8);
        slot[..4].copy_from_slice(&checksum.to_le_bytes());
        slot[4..].copy_from_slice(body);

        assert!(msg.try_consume_checksum());
        assert_eq!(msg.payload(), body);
    }

    #[test]
    fn checksum_mismatch_leaves_cursor_at_body_head() {
        let mut msg = NetworkMessage::new();
        msg.header_slot().copy_from_slice(&(4u16).to_le_bytes());
        let slot = msg.body_slot(4);
        slot.copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);

        assert!(!msg.try_consume_checksum());
        assert_eq!(msg.payload(), &[0xDE, 0xAD, 0xBE, 0xEF]);
    }
}
