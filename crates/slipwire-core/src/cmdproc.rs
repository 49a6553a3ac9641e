//! Per-connection command processor.
//!
//! Serializes outbound transactions with strictly increasing sequence ids,
//! parses inbound lines (suspending consumption while a declared payload is
//! still arriving), and routes replies back to their transactions. Malformed
//! input is surfaced as a warning; the connection itself is the transport's
//! to tear down.

use crate::config::ProtocolConfig;
use crate::error::TransactionError;
use crate::transaction::Transaction;
use slipwire_proto::{AckClass, Command, Message};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Handler for inbound commands not correlated to a transaction.
pub type CommandHandler = fn(&mut CmdProc, &Command);

/// Events produced by dispatch, drained by the owning session.
pub enum CmdProcEvent {
    /// An inbound relayed message
    Message {
        /// Sending user
        remote: String,
        /// Parsed message
        msg: Rc<RefCell<Message>>,
    },
    /// The relay acknowledged delivery of an outbound message
    MessageAcked {
        /// Destination user
        remote: String,
        /// The acknowledged message
        msg: Rc<RefCell<Message>>,
    },
    /// An outbound message could not be delivered
    MessageFailed {
        /// Destination user
        remote: String,
        /// The failed message
        msg: Rc<RefCell<Message>>,
        /// Why delivery failed
        error: TransactionError,
    },
    /// Inbound command with no transaction and no registered handler
    Command(Command),
    /// Recoverable framing problem; the offending input was discarded
    Warning(String),
}

/// Per logical connection command processor.
pub struct CmdProc {
    config: ProtocolConfig,
    next_trid: u32,
    pending: HashMap<u32, Transaction>,
    history: VecDeque<Command>,
    handlers: HashMap<String, CommandHandler>,
    payload_commands: HashSet<String>,
    rx: Vec<u8>,
    awaiting: Option<(Command, usize)>,
    /// Bytes of an over-limit payload still to be discarded
    skipping: usize,
    outbox: VecDeque<Vec<u8>>,
    events: VecDeque<CmdProcEvent>,
}

impl CmdProc {
    /// Create a processor with the given configuration.
    #[must_use]
    pub fn new(config: ProtocolConfig) -> Self {
        let mut payload_commands = HashSet::new();
        payload_commands.insert("MSG".to_owned());
        Self {
            config,
            next_trid: 1,
            pending: HashMap::new(),
            history: VecDeque::new(),
            handlers: HashMap::new(),
            payload_commands,
            rx: Vec::new(),
            awaiting: None,
            skipping: 0,
            outbox: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// Register a handler for an inbound command name.
    pub fn register_handler(&mut self, name: &str, handler: CommandHandler) {
        self.handlers.insert(name.to_owned(), handler);
    }

    /// Mark a command name as payload-carrying (final parameter declares
    /// the payload length).
    pub fn register_payload_command(&mut self, name: &str) {
        self.payload_commands.insert(name.to_owned());
    }

    /// Send a transaction: assign the next sequence id, serialize, start
    /// the retry timer.
    pub fn send(&mut self, now: Instant, mut trans: Transaction) -> u32 {
        let trid = self.next_trid;
        self.next_trid += 1;
        trans.encode(trid);
        trans.attempts_made = 1;
        trans.deadline = Some(now + self.config.transaction_timeout);
        trace!(trid, command = %trans.command, "sending transaction");
        self.outbox.push_back(trans.wire.clone());
        self.pending.insert(trid, trans);
        trid
    }

    /// Queue `trans` behind the unresolved transaction `blocking`.
    ///
    /// Returns the transaction back if `blocking` has already resolved, in
    /// which case the caller should send it directly.
    pub fn queue_on(&mut self, blocking: u32, trans: Transaction) -> Result<(), Transaction> {
        match self.pending.get_mut(&blocking) {
            Some(owner) => {
                owner.queue_command(trans);
                Ok(())
            }
            None => Err(trans),
        }
    }

    /// Wrap a message in a relayed payload command and send it.
    pub fn send_message(&mut self, now: Instant, remote: &str, msg: Rc<RefCell<Message>>) -> u32 {
        let (ack_param, payload) = {
            let msg = msg.borrow();
            (msg.ack_class.as_param().to_owned(), msg.gen_payload())
        };
        let mut trans = Transaction::new("MSG", vec![ack_param]);
        trans.set_payload(payload);
        trans.set_message(remote, Rc::clone(&msg));
        self.send(now, trans)
    }

    /// Feed raw bytes read off the connection.
    pub fn feed(&mut self, now: Instant, bytes: &[u8]) {
        self.rx.extend_from_slice(bytes);
        loop {
            if self.skipping > 0 {
                let n = self.skipping.min(self.rx.len());
                self.rx.drain(..n);
                self.skipping -= n;
                if self.skipping > 0 {
                    return;
                }
                continue;
            }
            if let Some((cmd, len)) = self.awaiting.take() {
                if self.rx.len() < len {
                    self.awaiting = Some((cmd, len));
                    return;
                }
                let payload: Vec<u8> = self.rx.drain(..len).collect();
                let mut cmd = cmd;
                cmd.payload = Some(payload);
                self.dispatch_payload(cmd);
                continue;
            }

            let Some(eol) = self.rx.windows(2).position(|w| w == b"\r\n") else {
                return;
            };
            let line: Vec<u8> = self.rx.drain(..eol + 2).collect();
            let Ok(line) = std::str::from_utf8(&line[..eol]) else {
                self.warning("command line is not valid utf-8".to_owned());
                continue;
            };
            match Command::from_line(line) {
                Ok(cmd) => {
                    if self.payload_commands.contains(&cmd.name) {
                        match cmd.declared_payload_len() {
                            Ok(len) if len > self.config.max_frame_size => {
                                self.warning(format!(
                                    "declared payload of {len} bytes exceeds the \
                                     {} byte limit, discarding",
                                    self.config.max_frame_size
                                ));
                                self.skipping = len;
                            }
                            Ok(len) => self.awaiting = Some((cmd, len)),
                            Err(err) => self.warning(format!("bad payload length: {err}")),
                        }
                    } else {
                        self.dispatch(now, cmd);
                    }
                }
                Err(err) => self.warning(format!("malformed command {line:?}: {err}")),
            }
        }
    }

    /// Dispatch a fully received inbound command.
    fn dispatch(&mut self, now: Instant, cmd: Command) {
        self.record(cmd.clone());

        if let Some(trid) = cmd.trid() {
            let is_reply = self.pending.get(&trid).is_some_and(|trans| {
                cmd.name == "ACK"
                    || cmd.name == "NAK"
                    || cmd.error_code().is_some()
                    || trans.has_callback_for(&cmd.name)
            });
            if is_reply {
                self.resolve(now, trid, &cmd);
                return;
            }
        }

        if let Some(handler) = self.handlers.get(&cmd.name).copied() {
            handler(self, &cmd);
            return;
        }
        self.events.push_back(CmdProcEvent::Command(cmd));
    }

    /// Resolve the transaction `trid` with the reply `cmd`.
    fn resolve(&mut self, now: Instant, trid: u32, cmd: &Command) {
        let Some(mut trans) = self.pending.remove(&trid) else {
            return;
        };
        trace!(trid, reply = %cmd.name, "transaction resolved");

        // Replay commands blocked on this transaction, preserving FIFO
        // order per target.
        let queued: Vec<Transaction> = trans.queued.drain(..).collect();
        for queued_trans in queued {
            self.send(now, queued_trans);
        }

        let error = match cmd.name.as_str() {
            "NAK" => Some(TransactionError::Nak),
            _ => cmd.error_code().map(TransactionError::RelayCode),
        };

        if let Some(error) = error {
            if let Some(mut cb) = trans.error_cb.take() {
                cb(self, &trans, error);
            }
            if let Some((remote, msg)) = trans.msg.take() {
                self.events
                    .push_back(CmdProcEvent::MessageFailed { remote, msg, error });
            }
            return;
        }

        let mut callbacks = std::mem::take(&mut trans.callbacks);
        for (name, cb) in &mut callbacks {
            if *name == cmd.name {
                cb(self, cmd);
            }
        }

        if cmd.name == "ACK" {
            if let Some((remote, msg)) = trans.msg.take() {
                self.events
                    .push_back(CmdProcEvent::MessageAcked { remote, msg });
            }
        }
    }

    /// Dispatch a payload-carrying command once its payload has arrived.
    fn dispatch_payload(&mut self, cmd: Command) {
        self.record(cmd.clone());
        if cmd.name == "MSG" {
            let Some(remote) = cmd.params.first().cloned() else {
                self.warning("relayed message without sender".to_owned());
                return;
            };
            let payload = cmd.payload.as_deref().unwrap_or_default();
            match Message::parse_payload(payload) {
                Ok(mut msg) => {
                    // The relay forwards the sender's ack-class flag as the
                    // second parameter.
                    if let Some(class) = cmd.params.get(1) {
                        msg.ack_class = AckClass::from_param(class);
                    }
                    self.events.push_back(CmdProcEvent::Message {
                        remote,
                        msg: Rc::new(RefCell::new(msg)),
                    });
                }
                Err(err) => self.warning(format!("discarding malformed message: {err}")),
            }
            return;
        }
        self.events.push_back(CmdProcEvent::Command(cmd));
    }

    /// Sweep transaction deadlines: retry or fail anything expired.
    pub fn handle_timeout(&mut self, now: Instant) {
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, t)| t.deadline.is_some_and(|d| d <= now))
            .map(|(trid, _)| *trid)
            .collect();

        for trid in expired {
            let Some(mut trans) = self.pending.remove(&trid) else {
                continue;
            };
            if let Some(mut cb) = trans.timeout_cb.take() {
                cb(self, &trans);
                trans.timeout_cb = Some(cb);
            }

            if trans.attempts_made < self.config.transaction_attempts {
                trans.attempts_made += 1;
                trans.deadline = Some(now + self.config.transaction_timeout);
                debug!(trid, attempt = trans.attempts_made, "retrying transaction");
                self.outbox.push_back(trans.wire.clone());
                self.pending.insert(trid, trans);
            } else {
                let error = TransactionError::Timeout {
                    attempts: trans.attempts_made,
                };
                warn!(trid, command = %trans.command, "transaction exhausted retries");
                if let Some(mut cb) = trans.error_cb.take() {
                    cb(self, &trans, error);
                }
                if let Some((remote, msg)) = trans.msg.take() {
                    self.events
                        .push_back(CmdProcEvent::MessageFailed { remote, msg, error });
                }
            }
        }
    }

    /// Earliest pending transaction deadline.
    #[must_use]
    pub fn next_timeout(&self) -> Option<Instant> {
        self.pending.values().filter_map(|t| t.deadline).min()
    }

    /// Drain one outbound buffer.
    pub fn poll_transmit(&mut self) -> Option<Vec<u8>> {
        self.outbox.pop_front()
    }

    /// Drain one dispatch event.
    pub fn poll_event(&mut self) -> Option<CmdProcEvent> {
        self.events.pop_front()
    }

    /// Look up a recently dispatched command by sequence id.
    #[must_use]
    pub fn recent(&self, trid: u32) -> Option<&Command> {
        self.history
            .iter()
            .rev()
            .find(|cmd| cmd.trid() == Some(trid))
    }

    /// Number of unresolved transactions.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn record(&mut self, cmd: Command) {
        if self.history.len() >= self.config.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(cmd);
    }

    fn warning(&mut self, text: String) {
        warn!("{text}");
        self.events.push_back(CmdProcEvent::Warning(text));
    }
}
