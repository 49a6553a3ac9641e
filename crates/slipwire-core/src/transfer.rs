//! Per-session transfer progress: the sender's in-flight window and the
//! receiver's reassembly cursor.

use crate::error::{FailureReason, StoreError};
use crate::store::BlobStore;
use std::collections::VecDeque;
use tracing::trace;

/// A data chunk sent but not yet acknowledged.
#[derive(Debug, Clone, Copy)]
pub struct InFlight {
    /// Chunk identifier on the wire
    pub chunk_id: u32,
    /// Byte offset of the chunk within the blob
    pub offset: u64,
    /// Chunk body length
    pub len: u32,
}

/// Outcome of processing one acknowledgement on the sending side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// More of the blob remains unacknowledged
    Progress,
    /// The final byte has been acknowledged
    Complete,
    /// The ack did not match any in-flight chunk
    Unmatched,
}

/// Sending side of one session.
pub struct OutboundTransfer {
    /// Session this transfer belongs to
    pub session_id: u32,
    store: Box<dyn BlobStore>,
    total_size: u64,
    next_offset: u64,
    acked: u64,
    in_flight: VecDeque<InFlight>,
}

impl OutboundTransfer {
    /// Wrap a readable store as the source of an outbound transfer.
    #[must_use]
    pub fn new(session_id: u32, store: Box<dyn BlobStore>) -> Self {
        let total_size = store.total_size();
        Self {
            session_id,
            store,
            total_size,
            next_offset: 0,
            acked: 0,
            in_flight: VecDeque::new(),
        }
    }

    /// Total blob size in bytes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Bytes acknowledged so far.
    #[must_use]
    pub fn acked(&self) -> u64 {
        self.acked
    }

    /// Chunks currently awaiting acknowledgement.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether every byte has been handed to the link layer.
    #[must_use]
    pub fn fully_queued(&self) -> bool {
        self.next_offset >= self.total_size
    }

    /// Read the next chunk body from the store, up to `max_chunk` bytes.
    /// Returns `None` once the whole blob has been queued.
    pub fn next_chunk(&mut self, max_chunk: u32) -> Result<Option<(u64, Vec<u8>)>, StoreError> {
        if self.fully_queued() {
            return Ok(None);
        }
        let offset = self.next_offset;
        let remaining = self.total_size - offset;
        let len = u64::from(max_chunk).min(remaining) as usize;
        let mut body = vec![0u8; len];
        self.store.read_at(offset, &mut body)?;
        self.next_offset += len as u64;
        Ok(Some((offset, body)))
    }

    /// Record a chunk handed to the link layer.
    pub fn record_in_flight(&mut self, chunk_id: u32, offset: u64, len: u32) {
        self.in_flight.push_back(InFlight {
            chunk_id,
            offset,
            len,
        });
    }

    /// Process a peer-level ack for `chunk_id` carrying the receiver's
    /// cumulative byte count. An ack whose count disagrees with the end
    /// of the acknowledged chunk means the streams have diverged.
    pub fn handle_ack(
        &mut self,
        chunk_id: u32,
        ack_size: u64,
    ) -> Result<AckOutcome, FailureReason> {
        let Some(pos) = self.in_flight.iter().position(|f| f.chunk_id == chunk_id) else {
            trace!(session_id = self.session_id, chunk_id, "ack for unknown chunk");
            return Ok(AckOutcome::Unmatched);
        };
        let flight = self.in_flight[pos];
        let expected = flight.offset + u64::from(flight.len);
        if ack_size != expected {
            return Err(FailureReason::AckGap {
                expected,
                got: ack_size,
            });
        }
        self.in_flight.remove(pos);
        self.acked = self.acked.max(ack_size);
        trace!(
            session_id = self.session_id,
            chunk_id,
            acked = self.acked,
            total = self.total_size,
            "chunk acknowledged"
        );
        if self.acked >= self.total_size {
            Ok(AckOutcome::Complete)
        } else {
            Ok(AckOutcome::Progress)
        }
    }
}

/// Receiving side of one session. Chunks must arrive in offset order;
/// the cursor doubles as the cumulative ack count.
pub struct InboundTransfer {
    /// Session this transfer belongs to
    pub session_id: u32,
    store: Box<dyn BlobStore>,
    total_size: u64,
    cursor: u64,
}

impl InboundTransfer {
    /// Wrap a writable store as the sink of an inbound transfer.
    #[must_use]
    pub fn new(session_id: u32, store: Box<dyn BlobStore>) -> Self {
        let total_size = store.total_size();
        Self {
            session_id,
            store,
            total_size,
            cursor: 0,
        }
    }

    /// Total blob size in bytes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Bytes received so far; also the cumulative count placed in acks.
    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Accept one data chunk. Returns true once the blob is complete,
    /// after flushing the store.
    pub fn handle_chunk(&mut self, offset: u64, body: &[u8]) -> Result<bool, FailureReason> {
        if offset != self.cursor {
            return Err(FailureReason::OutOfOrderChunk {
                expected: self.cursor,
                got: offset,
            });
        }
        self.store
            .write_at(offset, body)
            .map_err(|e| FailureReason::Store(e.to_string()))?;
        self.cursor += body.len() as u64;
        trace!(
            session_id = self.session_id,
            cursor = self.cursor,
            total = self.total_size,
            "chunk stored"
        );
        if self.cursor >= self.total_size {
            self.store
                .complete()
                .map_err(|e| FailureReason::Store(e.to_string()))?;
            return Ok(true);
        }
        Ok(false)
    }
}
