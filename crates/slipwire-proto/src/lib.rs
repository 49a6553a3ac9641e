//! # Slipwire Proto
//!
//! Wire layer for the slipwire peer session protocol.
//!
//! This crate provides:
//! - Line-oriented command parsing and serialization
//! - Application messages (MIME-style header block plus body)
//! - Binary peer-session chunk framing (fixed 48-byte header)
//! - SLP negotiation bodies (invite / accept / bye)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Command                                   │
//! │   (one protocol line, optionally followed by a payload)         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                        Message                                   │
//! │   (header block + body carried inside a command payload)        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                 Peer header + chunk bytes                        │
//! │   (binary framing for one slice of a transferred blob)          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod command;
pub mod frame;
pub mod message;
pub mod sip;

pub use command::{Command, CommandError};
pub use frame::{Chunk, ChunkFlags, FrameError, PeerFooter, PeerHeader};
pub use message::{AckClass, Message, MessageError, MessageKind};
pub use sip::{
    DirectCandidate, SessionRequest, SipError, SipHeaders, SipMessage, SipMethod, SipRequest,
    SipResponse, SipStatus,
};

use thiserror::Error;

/// Fixed peer-session header size in bytes
pub const PEER_HEADER_SIZE: usize = 48;

/// Peer-session footer size in bytes
pub const PEER_FOOTER_SIZE: usize = 4;

/// Default maximum chunk payload carried by one relayed message
pub const DEFAULT_MAX_CHUNK: usize = 1202;

/// Line delimiter for commands and message header blocks
pub const LINE_DELIMITER: &str = "\r\n";

/// Wire-layer errors
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Command line error
    #[error("command error: {0}")]
    Command(#[from] CommandError),

    /// Chunk framing error
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Message parsing error
    #[error("message error: {0}")]
    Message(#[from] MessageError),

    /// Negotiation body error
    #[error("slp error: {0}")]
    Sip(#[from] SipError),
}
