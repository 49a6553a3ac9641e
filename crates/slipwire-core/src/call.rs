//! Peer call: one invite/accept/bye negotiation instance.
//!
//! A call owns the negotiation identifiers (call id, branch, session id)
//! and the progress timeout. Chunks of its session cannot move before the
//! call has reached `Started`.

use crate::TransferHandle;
use crate::error::CallError;
use std::time::{Duration, Instant};
use tracing::debug;

/// Call lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Freshly created, nothing sent yet
    Created,
    /// Local invite sent, awaiting the remote answer
    Inviting,
    /// Accept exchanged, session being initialized
    Negotiating,
    /// Backing store ready; chunks may flow
    Started,
    /// First chunk acknowledged
    Active,
    /// Bye sent or last chunk acknowledged; draining
    Closing,
    /// Terminal: torn down
    Closed,
    /// Terminal: no progress within the timeout
    TimedOut,
}

/// One negotiation instance on a peer link.
pub struct PeerCall {
    /// Call identifier (GUID string)
    pub call_id: String,
    /// Via branch token
    pub branch: String,
    /// Session established or torn down by this call
    pub session_id: u32,
    /// Application id carried in the session request
    pub app_id: u32,
    /// True when the local side initiated the call
    pub outbound: bool,
    /// Remote user this call belongs to
    pub remote: String,
    /// Transfer handle surfaced to the application
    pub handle: TransferHandle,

    state: CallState,
    /// Waiting on the application (e.g. an unanswered incoming invite);
    /// suppresses the progress timeout.
    pub pending: bool,
    /// Progress observed since the last timer reset
    pub progress: bool,
    /// Marked for destruction
    pub wasted: bool,
    /// Terminal notification already delivered
    ended: bool,

    deadline: Instant,
    close_deadline: Option<Instant>,
}

fn new_guid() -> String {
    let bits: u128 = rand::random();
    format!(
        "{{{:08X}-{:04X}-{:04X}-{:04X}-{:012X}}}",
        (bits >> 96) as u32,
        (bits >> 80) as u16,
        (bits >> 64) as u16,
        (bits >> 48) as u16,
        bits & 0xFFFF_FFFF_FFFF
    )
}

impl PeerCall {
    /// Create a locally initiated call.
    #[must_use]
    pub fn new_outbound(
        handle: TransferHandle,
        remote: &str,
        session_id: u32,
        app_id: u32,
        now: Instant,
        timeout: Duration,
    ) -> Self {
        Self {
            call_id: new_guid(),
            branch: new_guid(),
            session_id,
            app_id,
            outbound: true,
            remote: remote.to_owned(),
            handle,
            state: CallState::Created,
            pending: false,
            progress: false,
            wasted: false,
            ended: false,
            deadline: now + timeout,
            close_deadline: None,
        }
    }

    /// Create a call for a received invite. Marked pending until the
    /// application answers, so it does not time out while waiting.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new_inbound(
        handle: TransferHandle,
        remote: &str,
        session_id: u32,
        app_id: u32,
        call_id: String,
        branch: String,
        now: Instant,
        timeout: Duration,
    ) -> Self {
        Self {
            call_id,
            branch,
            session_id,
            app_id,
            outbound: false,
            remote: remote.to_owned(),
            handle,
            state: CallState::Created,
            pending: true,
            progress: false,
            wasted: false,
            ended: false,
            deadline: now + timeout,
            close_deadline: None,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CallState {
        self.state
    }

    /// Whether the call can move from its current state to `to`.
    #[must_use]
    pub fn can_transition(&self, to: CallState) -> bool {
        use CallState::*;
        if self.is_terminal() {
            return false;
        }
        match (self.state, to) {
            // Timeout and explicit close are reachable from any live state
            (_, TimedOut | Closed) => true,
            (Created, Inviting | Negotiating) => true,
            (Inviting, Negotiating) => true,
            (Negotiating, Started) => true,
            (Started, Active | Closing) => true,
            (Active, Closing) => true,
            _ => false,
        }
    }

    /// Transition to `to`, or report the violation.
    pub fn transition_to(&mut self, to: CallState) -> Result<(), CallError> {
        if !self.can_transition(to) {
            return Err(CallError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        debug!(
            call_id = %self.call_id,
            session_id = self.session_id,
            from = ?self.state,
            to = ?to,
            "call transition"
        );
        self.state = to;
        if to == CallState::TimedOut {
            self.wasted = true;
        }
        Ok(())
    }

    /// Record progress: resets the timeout window.
    pub fn touch(&mut self, now: Instant, timeout: Duration) {
        self.progress = true;
        self.deadline = now + timeout;
    }

    /// Enter `Closing` with a bounded grace period.
    pub fn begin_close(&mut self, now: Instant, grace: Duration) -> Result<(), CallError> {
        self.transition_to(CallState::Closing)?;
        self.close_deadline = Some(now + grace);
        Ok(())
    }

    /// Sweep timers. Returns the state entered, if any timer fired.
    pub fn check_timeout(&mut self, now: Instant) -> Option<CallState> {
        if self.is_terminal() {
            return None;
        }
        if let Some(close_deadline) = self.close_deadline {
            if self.state == CallState::Closing && now >= close_deadline {
                self.state = CallState::Closed;
                return Some(CallState::Closed);
            }
        }
        if !self.pending && now >= self.deadline {
            self.state = CallState::TimedOut;
            self.wasted = true;
            return Some(CallState::TimedOut);
        }
        None
    }

    /// Next timer deadline for this call.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.is_terminal() {
            return None;
        }
        match (self.pending, self.close_deadline) {
            (_, Some(close)) if self.state == CallState::Closing => Some(close),
            (false, _) => Some(self.deadline),
            _ => None,
        }
    }

    /// Whether the call has reached a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, CallState::Closed | CallState::TimedOut)
    }

    /// Claim the single terminal notification slot. Returns false if it
    /// was already claimed.
    pub fn mark_ended(&mut self) -> bool {
        if self.ended {
            return false;
        }
        self.ended = true;
        true
    }
}
