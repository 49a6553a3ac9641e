//! Direct connection: nonce handshake and length-prefixed framing for
//! the peer-to-peer bypass channel.
//!
//! Every frame on the direct channel is a 4-byte little-endian length
//! prefix followed by that many payload bytes. The first frame in each
//! direction carries the handshake nonce agreed during negotiation; data
//! may only flow once both sides have verified it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Frame length prefix size on the direct channel.
pub const FRAME_PREFIX_SIZE: usize = 4;

/// Handshake progress of a direct channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectState {
    /// Waiting for the socket to come up
    Connecting,
    /// Socket up, nonce exchange in progress
    Handshaking,
    /// Nonce verified in both directions; data may flow
    Ready,
    /// Handshake failed or channel lost
    Failed,
}

/// Event produced while feeding bytes from the direct channel.
#[derive(Debug, PartialEq, Eq)]
pub enum DirectEvent {
    /// Handshake completed; the channel is usable for chunks
    Ready,
    /// A complete data frame arrived
    Data(Vec<u8>),
    /// The nonce did not verify; the channel must be abandoned
    Failed,
}

/// Generate a fresh handshake nonce.
#[must_use]
pub fn new_nonce() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode_upper(bytes)
}

/// One attempted direct channel to a remote peer.
pub struct DirectConn {
    /// Remote user the channel belongs to
    pub remote: String,
    nonce: String,
    /// True when the local side waits for the remote to connect in
    listener: bool,
    state: DirectState,
    /// Local nonce frame sent
    ack_sent: bool,
    /// Remote nonce frame verified
    ack_recv: bool,
    rx: Vec<u8>,
    outbox: VecDeque<Vec<u8>>,
    deadline: Instant,
    /// Largest frame length the peer may declare
    max_frame: usize,
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_PREFIX_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

impl DirectConn {
    /// Channel where the local side dials out to the advertised endpoint.
    #[must_use]
    pub fn new_connector(
        remote: &str,
        nonce: String,
        now: Instant,
        timeout: Duration,
        max_frame: usize,
    ) -> Self {
        Self::new(remote, nonce, false, now, timeout, max_frame)
    }

    /// Channel where the local side listens and the remote dials in.
    #[must_use]
    pub fn new_listener(
        remote: &str,
        nonce: String,
        now: Instant,
        timeout: Duration,
        max_frame: usize,
    ) -> Self {
        Self::new(remote, nonce, true, now, timeout, max_frame)
    }

    fn new(
        remote: &str,
        nonce: String,
        listener: bool,
        now: Instant,
        timeout: Duration,
        max_frame: usize,
    ) -> Self {
        Self {
            remote: remote.to_owned(),
            nonce,
            listener,
            state: DirectState::Connecting,
            ack_sent: false,
            ack_recv: false,
            rx: Vec::new(),
            outbox: VecDeque::new(),
            deadline: now + timeout,
            max_frame,
        }
    }

    /// Current handshake state.
    #[must_use]
    pub fn state(&self) -> DirectState {
        self.state
    }

    /// Whether chunks may be sent over this channel.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == DirectState::Ready
    }

    /// The socket is up. The connector speaks first; the listener waits
    /// for the incoming nonce before revealing anything.
    pub fn on_connected(&mut self) {
        if self.state != DirectState::Connecting {
            return;
        }
        self.state = DirectState::Handshaking;
        if !self.listener {
            self.outbox.push_back(frame(self.nonce.as_bytes()));
            self.ack_sent = true;
            debug!(remote = %self.remote, "direct handshake sent");
        }
    }

    /// Consume bytes read from the channel and surface complete events.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<DirectEvent> {
        let mut events = Vec::new();
        if self.state == DirectState::Failed {
            return events;
        }
        self.rx.extend_from_slice(bytes);
        while self.rx.len() >= FRAME_PREFIX_SIZE {
            let mut prefix = [0u8; FRAME_PREFIX_SIZE];
            prefix.copy_from_slice(&self.rx[..FRAME_PREFIX_SIZE]);
            let len = u32::from_le_bytes(prefix) as usize;
            if len > self.max_frame {
                warn!(remote = %self.remote, len, "direct frame length over limit");
                self.state = DirectState::Failed;
                self.rx.clear();
                events.push(DirectEvent::Failed);
                return events;
            }
            if self.rx.len() < FRAME_PREFIX_SIZE + len {
                break;
            }
            let payload: Vec<u8> = self
                .rx
                .drain(..FRAME_PREFIX_SIZE + len)
                .skip(FRAME_PREFIX_SIZE)
                .collect();
            match self.state {
                DirectState::Ready => events.push(DirectEvent::Data(payload)),
                _ => {
                    if self.handle_handshake(&payload) {
                        events.push(DirectEvent::Ready);
                    } else {
                        events.push(DirectEvent::Failed);
                        return events;
                    }
                }
            }
        }
        events
    }

    /// Verify the peer's nonce frame. Returns true once the channel is
    /// ready, false on mismatch.
    fn handle_handshake(&mut self, payload: &[u8]) -> bool {
        if payload != self.nonce.as_bytes() {
            warn!(remote = %self.remote, "direct handshake nonce mismatch");
            self.state = DirectState::Failed;
            return false;
        }
        self.ack_recv = true;
        if !self.ack_sent {
            // Listener side: echo the nonce back to confirm
            self.outbox.push_back(frame(self.nonce.as_bytes()));
            self.ack_sent = true;
        }
        self.state = DirectState::Ready;
        debug!(remote = %self.remote, "direct channel ready");
        true
    }

    /// Queue a chunk for the channel. Only valid once ready.
    pub fn send(&mut self, payload: &[u8]) {
        debug_assert!(self.is_ready());
        self.outbox.push_back(frame(payload));
    }

    /// Next buffer to write to the socket.
    pub fn poll_transmit(&mut self) -> Option<Vec<u8>> {
        self.outbox.pop_front()
    }

    /// Mark the channel lost.
    pub fn fail(&mut self) {
        self.state = DirectState::Failed;
    }

    /// Sweep the handshake timer. Returns true if the attempt expired.
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        if self.state == DirectState::Ready || self.state == DirectState::Failed {
            return false;
        }
        if now >= self.deadline {
            warn!(remote = %self.remote, "direct handshake timed out");
            self.state = DirectState::Failed;
            return true;
        }
        false
    }

    /// Handshake deadline, while still pending.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            DirectState::Connecting | DirectState::Handshaking => Some(self.deadline),
            _ => None,
        }
    }
}
