//! Outbound commands awaiting a correlated reply.
//!
//! A transaction owns its retry policy: the command processor re-sends its
//! cached wire form until a matching reply arrives or the attempt budget is
//! exhausted, at which point the error callback fires with a timeout
//! indication.

use crate::cmdproc::CmdProc;
use crate::error::TransactionError;
use slipwire_proto::{Command, Message};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Instant;

/// Callback invoked when a reply with the registered command name arrives.
pub type ReplyCallback = Box<dyn FnMut(&mut CmdProc, &Command)>;

/// Callback invoked when the transaction fails for good.
pub type ErrorCallback = Box<dyn FnMut(&mut CmdProc, &Transaction, TransactionError)>;

/// Callback invoked on every timeout, including the ones that trigger a
/// retry.
pub type TimeoutCallback = Box<dyn FnMut(&mut CmdProc, &Transaction)>;

/// An outbound command with reply correlation and retry state.
pub struct Transaction {
    /// Sequence id, assigned by the command processor on send
    pub trid: u32,
    /// Command name
    pub command: String,
    /// Formatted parameters (transaction id excluded)
    pub params: Vec<String>,
    /// Optional payload
    pub payload: Option<Vec<u8>>,

    pub(crate) callbacks: Vec<(String, ReplyCallback)>,
    pub(crate) error_cb: Option<ErrorCallback>,
    pub(crate) timeout_cb: Option<TimeoutCallback>,

    /// Message carried by this transaction, if any, with its remote user.
    /// The reference keeps the message alive until the transaction
    /// resolves.
    pub(crate) msg: Option<(String, Rc<RefCell<Message>>)>,

    /// Invariant: at most one outstanding retry timer, expressed as a
    /// single deadline slot.
    pub(crate) deadline: Option<Instant>,
    pub(crate) attempts_made: u32,

    /// Commands blocked on this transaction's result, replayed FIFO once
    /// it resolves.
    pub(crate) queued: VecDeque<Transaction>,

    /// Cached wire form for retries
    pub(crate) wire: Vec<u8>,
}

impl Transaction {
    /// Create a transaction for `command` with its formatted parameters.
    #[must_use]
    pub fn new(command: &str, params: Vec<String>) -> Self {
        Self {
            trid: 0,
            command: command.to_owned(),
            params,
            payload: None,
            callbacks: Vec::new(),
            error_cb: None,
            timeout_cb: None,
            msg: None,
            deadline: None,
            attempts_made: 0,
            queued: VecDeque::new(),
            wire: Vec::new(),
        }
    }

    /// Attach a payload; its length becomes the final line parameter.
    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = Some(payload);
    }

    /// Attach the message this transaction carries, keyed by remote user.
    pub fn set_message(&mut self, remote: &str, msg: Rc<RefCell<Message>>) {
        self.msg = Some((remote.to_owned(), msg));
    }

    /// Register a callback for replies named `reply`.
    pub fn add_callback(&mut self, reply: &str, cb: ReplyCallback) {
        self.callbacks.push((reply.to_owned(), cb));
    }

    /// Register the terminal error callback.
    pub fn set_error_callback(&mut self, cb: ErrorCallback) {
        self.error_cb = Some(cb);
    }

    /// Register the per-timeout callback.
    pub fn set_timeout_callback(&mut self, cb: TimeoutCallback) {
        self.timeout_cb = Some(cb);
    }

    /// Queue a command blocked on this transaction's result.
    pub fn queue_command(&mut self, trans: Transaction) {
        self.queued.push_back(trans);
    }

    /// Whether a callback is registered for the given reply name.
    #[must_use]
    pub fn has_callback_for(&self, reply: &str) -> bool {
        self.callbacks.iter().any(|(name, _)| name == reply)
    }

    /// Build the full wire form (line plus payload) for the assigned trid.
    pub(crate) fn encode(&mut self, trid: u32) {
        self.trid = trid;
        let mut line = format!("{} {}", self.command, trid);
        for p in &self.params {
            line.push(' ');
            line.push_str(p);
        }
        if let Some(payload) = &self.payload {
            line.push(' ');
            line.push_str(&payload.len().to_string());
        }
        line.push_str("\r\n");

        let mut wire = line.into_bytes();
        if let Some(payload) = &self.payload {
            wire.extend_from_slice(payload);
        }
        self.wire = wire;
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("trid", &self.trid)
            .field("command", &self.command)
            .field("params", &self.params)
            .field("payload_len", &self.payload.as_ref().map(Vec::len))
            .field("attempts_made", &self.attempts_made)
            .field("queued", &self.queued.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_without_payload() {
        let mut trans = Transaction::new("USR", vec!["alice@example.com".into()]);
        trans.encode(7);
        assert_eq!(trans.wire, b"USR 7 alice@example.com\r\n");
        assert_eq!(trans.trid, 7);
    }

    #[test]
    fn encode_appends_payload_length() {
        let mut trans = Transaction::new("MSG", vec!["D".into()]);
        trans.set_payload(b"0123456789".to_vec());
        trans.encode(3);
        assert_eq!(&trans.wire[..], b"MSG 3 D 10\r\n0123456789".as_slice());
    }

    #[test]
    fn queued_commands_preserve_fifo() {
        let mut trans = Transaction::new("MSG", vec![]);
        trans.queue_command(Transaction::new("MSG", vec!["first".into()]));
        trans.queue_command(Transaction::new("MSG", vec!["second".into()]));
        let order: Vec<_> = trans
            .queued
            .iter()
            .map(|t| t.params[0].clone())
            .collect();
        assert_eq!(order, vec!["first", "second"]);
    }

    #[test]
    fn callback_lookup() {
        let mut trans = Transaction::new("MSG", vec![]);
        trans.add_callback("ACK", Box::new(|_, _| {}));
        assert!(trans.has_callback_for("ACK"));
        assert!(!trans.has_callback_for("NAK"));
    }
}
