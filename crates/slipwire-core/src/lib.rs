//! # Slipwire Core
//!
//! Protocol core of the slipwire peer session protocol: transactions and
//! the per-connection command processor, the call negotiation state
//! machine, chunked blob transfer with in-order reassembly, and transport
//! selection between the relay and an optional direct channel.
//!
//! The core is sans-IO and single-threaded: the external event loop owns
//! every socket and timer, feeds bytes and the current time into
//! [`PeerSession`], and drains outbound buffers and application events
//! from it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         PeerSession                              │
//! │     (facade: relay input, timers, transmit/event queues)         │
//! ├────────────────────────────┬─────────────────────────────────────┤
//! │         CmdProc            │            PeerLink (per remote)    │
//! │  transactions, retries,    │   calls, transfers, direct channel, │
//! │  reply correlation         │   transport selection               │
//! ├────────────────────────────┴─────────────────────────────────────┤
//! │    PeerCall state machine · chunk window / reassembly cursor     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod call;
pub mod cmdproc;
pub mod config;
pub mod directconn;
pub mod error;
pub mod link;
pub mod session;
pub mod store;
pub mod transaction;
pub mod transfer;

pub use call::{CallState, PeerCall};
pub use cmdproc::{CmdProc, CmdProcEvent};
pub use config::ProtocolConfig;
pub use directconn::{DirectConn, DirectEvent, DirectState};
pub use error::{CallError, Error, FailureReason, StoreError, TransactionError};
pub use link::PeerLink;
pub use session::{PeerSession, SessionEvent, Transmit};
pub use store::{BlobStore, FileStore, MemoryStore};
pub use transaction::Transaction;
pub use transfer::{AckOutcome, InboundTransfer, OutboundTransfer};

/// Opaque identifier of one transfer, stable for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferHandle(pub u64);

/// Allocator of transfer handles, owned by the session.
#[derive(Debug, Default)]
pub struct HandleSource {
    next: u64,
}

impl HandleSource {
    pub(crate) fn alloc(&mut self) -> TransferHandle {
        self.next += 1;
        TransferHandle(self.next)
    }
}
