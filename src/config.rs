// ABOUTME: Wire-format constants and the policy knobs consumed by Connection/ConnectionManager
// ABOUTME: No file or environment parsing lives here -- callers own configuration loading

use std::time::Duration;

/// Number of bytes in the length header prefixing every frame.
///
/// The header itself is a little-endian `u16` body length, so this is fixed at 2.
pub const HEADER_LENGTH: usize = 2;

/// Hard ceiling on a single frame, header included. Frame bodies must satisfy
/// `body_length <= NETWORKMESSAGE_MAXSIZE - 16`, leaving headroom for the
/// optional checksum and whatever the application protocol layers on top.
pub const NETWORKMESSAGE_MAXSIZE: usize = 24590;

/// Largest body length a single frame may declare.
pub const MAX_BODY_LENGTH: usize = NETWORKMESSAGE_MAXSIZE - 16;

/// Number of queued-or-in-flight outbound frames above which a connection is
/// considered a slow consumer, subject to [`ConnectionManagerConfig::force_close_slow_connection`].
pub const SLOW_CONSUMER_THRESHOLD: usize = 500;

/// Size, in bytes, of an optional leading Adler-32 checksum.
pub const CHECKSUM_LENGTH: usize = 4;

/// Policy knobs for [`crate::manager::ConnectionManager`], sourced from the
/// embedder's own configuration loader. Field names mirror the configuration
/// keys named in the specification (`LOGIN_TRIES`, `RETRY_TIMEOUT`,
/// `LOGIN_TIMEOUT`, `FORCE_CLOSE_SLOW_CONNECTION`); the embedder is
/// responsible for converting millisecond config values to the `Duration`s
/// here before constructing this struct.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionManagerConfig {
    /// `LOGIN_TRIES`. Zero disables IP-login throttling entirely.
    pub max_login_tries: u32,
    /// `RETRY_TIMEOUT`, converted from milliseconds to seconds.
    pub retry_timeout: Duration,
    /// `LOGIN_TIMEOUT`, converted from milliseconds to seconds.
    pub login_timeout: Duration,
    /// `FORCE_CLOSE_SLOW_CONNECTION`. When true, a connection whose combined
    /// in-flight-plus-queued write count exceeds [`SLOW_CONSUMER_THRESHOLD`]
    /// is closed.
    pub force_close_slow_connection: bool,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        ConnectionManagerConfig {
            max_login_tries: 3,
            retry_timeout: Duration::from_secs(5),
            login_timeout: Duration::from_secs(60),
            force_close_slow_connection: true,
        }
    }
}
