//! Error taxonomy for the protocol core.
//!
//! Failures attach to the most specific owning object: framing errors are
//! surfaced as connection-level warnings, transaction errors through the
//! transaction's error callback, call failures through the transfer's single
//! terminal notification.

use thiserror::Error;

/// Core protocol errors
#[derive(Debug, Error)]
pub enum Error {
    /// Wire-layer framing error
    #[error("framing error: {0}")]
    Framing(#[from] slipwire_proto::ProtoError),

    /// Transaction error
    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),

    /// Call state machine error
    #[error("call error: {0}")]
    Call(#[from] CallError),

    /// Backing store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// No transfer registered under the given handle
    #[error("unknown transfer handle")]
    UnknownHandle,
}

/// Errors terminating a transaction.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransactionError {
    /// No reply after the configured number of attempts
    #[error("timed out after {attempts} attempts")]
    Timeout {
        /// Attempts made, inclusive of the original send
        attempts: u32,
    },

    /// Relay negatively acknowledged the command
    #[error("negative acknowledgment from relay")]
    Nak,

    /// Relay answered with a numeric error code
    #[error("relay error code {0}")]
    RelayCode(u32),
}

/// Call state machine violations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CallError {
    /// Requested transition is not allowed
    #[error("invalid call transition: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Current state
        from: crate::call::CallState,
        /// Requested state
        to: crate::call::CallState,
    },
}

/// Backing store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Access outside the declared blob bounds
    #[error("out of bounds: offset {offset} + len {len} > total {total}")]
    OutOfBounds {
        /// Requested offset
        offset: u64,
        /// Requested length
        len: usize,
        /// Declared total size
        total: u64,
    },
}

/// Reason reported with a transfer's terminal failure notification.
///
/// Exactly one terminal notification (complete or failed) is delivered per
/// transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// No invite/accept/ack progress within the call timeout
    Timeout,
    /// Remote side rejected the invite with the given status code
    Rejected(u16),
    /// Received chunk offset did not match the reassembly cursor
    OutOfOrderChunk {
        /// Expected offset (current cursor)
        expected: u64,
        /// Offset declared by the chunk
        got: u64,
    },
    /// Cumulative ack size disagrees with the bytes sent so far
    AckGap {
        /// Expected cumulative size
        expected: u64,
        /// Acknowledged cumulative size
        got: u64,
    },
    /// Relay could not deliver a message carrying this transfer
    Delivery(TransactionError),
    /// Direct connection was lost after completing its handshake
    DirectLost,
    /// Backing store failure
    Store(String),
    /// Remote side closed the session before the transfer finished
    RemoteBye,
    /// Transfer cancelled locally
    Cancelled,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "call timed out"),
            Self::Rejected(code) => write!(f, "invite rejected with status {code}"),
            Self::OutOfOrderChunk { expected, got } => {
                write!(f, "out-of-order chunk: expected offset {expected}, got {got}")
            }
            Self::AckGap { expected, got } => {
                write!(f, "ack gap: expected cumulative {expected}, got {got}")
            }
            Self::Delivery(err) => write!(f, "relay delivery failed: {err}"),
            Self::DirectLost => write!(f, "direct connection lost mid-transfer"),
            Self::Store(msg) => write!(f, "store failure: {msg}"),
            Self::RemoteBye => write!(f, "session closed by remote before completion"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}
