//! Protocol configuration.
//!
//! All tunables live in one value handed to [`crate::session::PeerSession`]
//! at construction; nothing in the core reads ambient state.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Protocol tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Maximum chunk payload carried by one message
    pub max_chunk_size: usize,

    /// Maximum chunks in flight (sent but unacknowledged) per transfer
    pub send_window: usize,

    /// Time to wait for a reply before retrying a transaction
    pub transaction_timeout: Duration,

    /// Total transaction attempts, inclusive of the original send
    pub transaction_attempts: u32,

    /// Call is timed out after this long without progress
    pub call_timeout: Duration,

    /// Grace period for a closing call before it is forced closed
    pub close_grace: Duration,

    /// Bound on direct-connection establishment and handshake
    pub direct_timeout: Duration,

    /// Dispatched commands retained for out-of-order reply correlation
    pub history_limit: usize,

    /// Upper bound on any payload or frame length declared by the wire;
    /// larger declarations are discarded instead of buffered
    pub max_frame_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: slipwire_proto::DEFAULT_MAX_CHUNK,
            send_window: 8,
            transaction_timeout: Duration::from_secs(60),
            transaction_attempts: 3,
            // Official clients give up on stalled calls after 5 minutes
            call_timeout: Duration::from_secs(300),
            close_grace: Duration::from_secs(30),
            direct_timeout: Duration::from_secs(15),
            history_limit: 32,
            max_frame_size: 64 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = ProtocolConfig::default();
        assert_eq!(cfg.max_chunk_size, 1202);
        assert_eq!(cfg.transaction_attempts, 3);
        assert_eq!(cfg.call_timeout, Duration::from_secs(300));
        assert!(cfg.send_window >= 1);
        assert!(cfg.max_frame_size > cfg.max_chunk_size);
    }
}
