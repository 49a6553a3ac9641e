//! Session facade: the single object the event loop drives.
//!
//! The session owns the relay command processor and one [`PeerLink`] per
//! remote user. The external event loop feeds it socket bytes and timer
//! expiries, drains outbound buffers with [`PeerSession::poll_transmit`]
//! and application notifications with [`PeerSession::poll_event`].

use crate::HandleSource;
use crate::TransferHandle;
use crate::cmdproc::{CmdProc, CmdProcEvent};
use crate::config::ProtocolConfig;
use crate::error::{Error, FailureReason};
use crate::link::PeerLink;
use crate::store::BlobStore;
use slipwire_proto::{Message, MessageKind};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Instant;
use tracing::trace;

/// Notifications surfaced to the application.
#[derive(Debug)]
pub enum SessionEvent {
    /// A remote user offered a transfer; answer with
    /// [`PeerSession::accept_transfer`] or [`PeerSession::decline_transfer`].
    IncomingTransfer {
        /// Handle identifying this transfer from now on
        handle: TransferHandle,
        /// Offering user
        remote: String,
        /// Session id chosen by the remote
        session_id: u32,
        /// Application id (1 = object, 2 = file)
        app_id: u32,
        /// Opaque context announced with the offer
        context: String,
        /// Total blob size
        total_size: u64,
    },
    /// Bytes moved (acknowledged on the sending side, stored on the
    /// receiving side)
    TransferProgress {
        /// Transfer handle
        handle: TransferHandle,
        /// Bytes transferred so far
        transferred: u64,
        /// Total blob size
        total: u64,
    },
    /// Terminal: the blob arrived (or was fully acknowledged) intact
    TransferComplete {
        /// Transfer handle
        handle: TransferHandle,
    },
    /// Terminal: the transfer is dead
    TransferFailed {
        /// Transfer handle
        handle: TransferHandle,
        /// What killed it
        reason: FailureReason,
    },
    /// The event loop should dial this endpoint and report back through
    /// the `handle_direct_*` methods
    DirectConnect {
        /// Remote user the channel is for
        remote: String,
        /// Host to dial
        host: String,
        /// Port to dial
        port: u16,
    },
    /// A non-transfer message arrived on the relay
    Message {
        /// Sending user
        remote: String,
        /// The message
        msg: Rc<RefCell<Message>>,
    },
    /// Recoverable protocol problem; the offending input was discarded
    Warning(String),
}

/// One outbound buffer, tagged with its transport.
#[derive(Debug)]
pub enum Transmit {
    /// Write to the relay connection
    Relay(Vec<u8>),
    /// Write to the direct socket for `remote`
    Direct {
        /// Remote user whose direct socket to write to
        remote: String,
        /// Bytes to write
        data: Vec<u8>,
    },
}

/// Peer-session protocol endpoint for one local user.
pub struct PeerSession {
    local: String,
    config: ProtocolConfig,
    cmdproc: CmdProc,
    links: HashMap<String, PeerLink>,
    handles: HandleSource,
    events: VecDeque<SessionEvent>,
}

fn link_entry<'a>(
    links: &'a mut HashMap<String, PeerLink>,
    local: &str,
    config: &ProtocolConfig,
    remote: &str,
) -> &'a mut PeerLink {
    links
        .entry(remote.to_owned())
        .or_insert_with(|| PeerLink::new(local, remote, config.clone()))
}

impl PeerSession {
    /// Create a session for `local` with the given tunables.
    #[must_use]
    pub fn new(local: &str, config: ProtocolConfig) -> Self {
        Self {
            local: local.to_owned(),
            cmdproc: CmdProc::new(config.clone()),
            config,
            links: HashMap::new(),
            handles: HandleSource::default(),
            events: VecDeque::new(),
        }
    }

    // --- application surface ----------------------------------------------

    /// Offer a blob to `remote`. `listen` advertises a direct endpoint the
    /// local side is accepting connections on.
    pub fn request_transfer(
        &mut self,
        now: Instant,
        remote: &str,
        store: Box<dyn BlobStore>,
        context: &str,
        app_id: u32,
        listen: Option<(String, u16)>,
    ) -> TransferHandle {
        let handle = self.handles.alloc();
        let link = link_entry(&mut self.links, &self.local, &self.config, remote);
        link.request_transfer(now, handle, store, context, app_id, listen, &mut self.cmdproc);
        handle
    }

    /// Accept an offered transfer into `store`.
    pub fn accept_transfer(
        &mut self,
        now: Instant,
        handle: TransferHandle,
        store: Box<dyn BlobStore>,
        listen: Option<(String, u16)>,
    ) -> Result<(), Error> {
        let Self {
            links, cmdproc, ..
        } = self;
        let link = links
            .values_mut()
            .find(|l| l.owns(handle))
            .ok_or(Error::UnknownHandle)?;
        link.accept_transfer(now, handle, store, listen, cmdproc)
    }

    /// Decline an offered transfer.
    pub fn decline_transfer(&mut self, now: Instant, handle: TransferHandle) -> Result<(), Error> {
        let Self {
            links, cmdproc, ..
        } = self;
        let link = links
            .values_mut()
            .find(|l| l.owns(handle))
            .ok_or(Error::UnknownHandle)?;
        link.decline_transfer(now, handle, cmdproc)
    }

    /// Cancel a transfer in any live state.
    pub fn cancel_transfer(&mut self, now: Instant, handle: TransferHandle) -> Result<(), Error> {
        let Self {
            links,
            cmdproc,
            events,
            ..
        } = self;
        let link = links
            .values_mut()
            .find(|l| l.owns(handle))
            .ok_or(Error::UnknownHandle)?;
        link.cancel_transfer(now, handle, cmdproc, events)
    }

    /// Send a non-transfer message (text, typing, nudge) through the
    /// relay. Returns the transaction id.
    pub fn send_message(&mut self, now: Instant, remote: &str, msg: Rc<RefCell<Message>>) -> u32 {
        self.cmdproc.send_message(now, remote, msg)
    }

    // --- event loop surface -----------------------------------------------

    /// Feed bytes read from the relay connection. Partial reads are fine.
    pub fn handle_relay_input(&mut self, now: Instant, bytes: &[u8]) {
        self.cmdproc.feed(now, bytes);
        self.drain_cmdproc(now);
    }

    /// The direct socket for `remote` is connected (dialed out or
    /// accepted in).
    pub fn handle_direct_connected(&mut self, remote: &str) {
        if let Some(link) = self.links.get_mut(remote) {
            link.handle_direct_connected();
        }
    }

    /// Feed bytes read from the direct socket for `remote`.
    pub fn handle_direct_input(&mut self, now: Instant, remote: &str, bytes: &[u8]) {
        let Self {
            links,
            cmdproc,
            events,
            handles,
            ..
        } = self;
        if let Some(link) = links.get_mut(remote) {
            link.handle_direct_input(now, bytes, cmdproc, events, handles);
        }
    }

    /// The direct socket for `remote` failed or closed.
    pub fn handle_direct_error(&mut self, remote: &str) {
        if let Some(link) = self.links.get_mut(remote) {
            link.handle_direct_error(&mut self.events);
        }
    }

    /// Sweep every timer: transaction retries, call timeouts, direct
    /// handshake bounds.
    pub fn handle_timeout(&mut self, now: Instant) {
        self.cmdproc.handle_timeout(now);
        self.drain_cmdproc(now);
        for link in self.links.values_mut() {
            link.handle_timeout(now, &mut self.events);
        }
    }

    /// Earliest deadline across the whole session.
    #[must_use]
    pub fn next_timeout(&self) -> Option<Instant> {
        let links = self.links.values().filter_map(PeerLink::next_timeout);
        self.cmdproc.next_timeout().into_iter().chain(links).min()
    }

    /// Drain one outbound buffer.
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        if let Some(data) = self.cmdproc.poll_transmit() {
            return Some(Transmit::Relay(data));
        }
        for (remote, link) in &mut self.links {
            if let Some(data) = link.poll_direct_transmit() {
                return Some(Transmit::Direct {
                    remote: remote.clone(),
                    data,
                });
            }
        }
        None
    }

    /// Drain one application notification.
    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    fn drain_cmdproc(&mut self, now: Instant) {
        while let Some(event) = self.cmdproc.poll_event() {
            match event {
                CmdProcEvent::Message { remote, msg } => {
                    let kind = msg.borrow().kind;
                    if kind == MessageKind::Peer {
                        let Self {
                            links,
                            cmdproc,
                            events,
                            handles,
                            local,
                            config,
                        } = self;
                        let link = link_entry(links, local, config, &remote);
                        link.handle_peer_message(now, &msg, cmdproc, events, handles);
                    } else {
                        self.events.push_back(SessionEvent::Message { remote, msg });
                    }
                }
                CmdProcEvent::MessageAcked { remote, .. } => {
                    // Relay-level ack only; transfer progress is driven by
                    // peer-level acks.
                    trace!(%remote, "relay accepted message");
                }
                CmdProcEvent::MessageFailed { remote, msg, error } => {
                    let header = msg.borrow().peer_header;
                    match (header, self.links.get_mut(&remote)) {
                        (Some(header), Some(link)) => {
                            link.handle_delivery_failure(header.session_id, error, &mut self.events);
                        }
                        _ => {
                            self.events.push_back(SessionEvent::Warning(format!(
                                "message to {remote} failed: {error}"
                            )));
                        }
                    }
                }
                CmdProcEvent::Command(cmd) => {
                    trace!(command = %cmd.name, "unhandled relay command");
                }
                CmdProcEvent::Warning(text) => {
                    self.events.push_back(SessionEvent::Warning(text));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use slipwire_proto::sip::CONTENT_TYPE_SESSION_REQUEST;
    use slipwire_proto::{
        ChunkFlags, PeerFooter, PeerHeader, SessionRequest, SipHeaders, SipMessage, SipMethod,
        SipRequest,
    };

    fn session(local: &str) -> PeerSession {
        PeerSession::new(local, ProtocolConfig::default())
    }

    fn relay_invite_from(remote: &str, to: &str, session_id: u32) -> Vec<u8> {
        let body = SessionRequest {
            session_id,
            app_id: 2,
            total_size: 512,
            context: "notes.txt".into(),
            direct: None,
        }
        .to_body();
        let invite = SipMessage::Request(SipRequest {
            method: SipMethod::Invite,
            headers: SipHeaders {
                to: to.into(),
                from: remote.into(),
                branch: "{11112222-3333-4444-5555-666677778888}".into(),
                cseq: 0,
                call_id: "{AAAA2222-3333-4444-5555-666677778888}".into(),
                content_type: CONTENT_TYPE_SESSION_REQUEST.into(),
            },
            body,
        });
        let text = invite.to_text().into_bytes();
        let header = PeerHeader {
            session_id: 0,
            chunk_id: 1,
            offset: 0,
            total_size: text.len() as u64,
            length: text.len() as u32,
            flags: ChunkFlags::new(),
            ack_id: 0,
            ack_sub_id: 0,
            ack_size: 0,
        };
        let payload = Message::peer(header, text, PeerFooter { value: 0 }).gen_payload();
        let mut wire = format!("MSG {remote} Nick {}\r\n", payload.len()).into_bytes();
        wire.extend_from_slice(&payload);
        wire
    }

    #[test]
    fn request_transfer_sends_invite_over_relay() {
        let now = Instant::now();
        let mut sess = session("alice@example.com");
        let store = MemoryStore::from_vec(vec![7u8; 256]);
        sess.request_transfer(now, "bob@example.com", Box::new(store), "pic.png", 2, None);

        match sess.poll_transmit() {
            Some(Transmit::Relay(data)) => {
                assert!(data.starts_with(b"MSG "));
                let text = String::from_utf8_lossy(&data);
                assert!(text.contains("INVITE PEER:bob@example.com SLP/1.0"));
                assert!(text.contains("Context: pic.png"));
            }
            _ => panic!("expected relay transmit"),
        }
    }

    #[test]
    fn incoming_invite_surfaces_offer() {
        let now = Instant::now();
        let mut sess = session("bob@example.com");
        let wire = relay_invite_from("alice@example.com", "bob@example.com", 33);
        sess.handle_relay_input(now, &wire);

        match sess.poll_event() {
            Some(SessionEvent::IncomingTransfer {
                remote,
                session_id,
                context,
                total_size,
                ..
            }) => {
                assert_eq!(remote, "alice@example.com");
                assert_eq!(session_id, 33);
                assert_eq!(context, "notes.txt");
                assert_eq!(total_size, 512);
            }
            _ => panic!("expected IncomingTransfer"),
        }
    }

    #[test]
    fn duplicate_invite_is_ignored() {
        let now = Instant::now();
        let mut sess = session("bob@example.com");
        let wire = relay_invite_from("alice@example.com", "bob@example.com", 33);
        sess.handle_relay_input(now, &wire);
        assert!(matches!(
            sess.poll_event(),
            Some(SessionEvent::IncomingTransfer { .. })
        ));

        sess.handle_relay_input(now, &wire);
        assert!(sess.poll_event().is_none());
    }

    #[test]
    fn accepting_offer_answers_200() {
        let now = Instant::now();
        let mut sess = session("bob@example.com");
        let wire = relay_invite_from("alice@example.com", "bob@example.com", 33);
        sess.handle_relay_input(now, &wire);
        let handle = match sess.poll_event() {
            Some(SessionEvent::IncomingTransfer { handle, .. }) => handle,
            _ => panic!("expected IncomingTransfer"),
        };

        let sink = MemoryStore::with_capacity(512);
        sess.accept_transfer(now, handle, Box::new(sink), None)
            .unwrap();
        match sess.poll_transmit() {
            Some(Transmit::Relay(data)) => {
                let text = String::from_utf8_lossy(&data);
                assert!(text.contains("SLP/1.0 200 OK"));
            }
            _ => panic!("expected relay transmit"),
        }
    }

    #[test]
    fn declining_offer_answers_603() {
        let now = Instant::now();
        let mut sess = session("bob@example.com");
        let wire = relay_invite_from("alice@example.com", "bob@example.com", 33);
        sess.handle_relay_input(now, &wire);
        let handle = match sess.poll_event() {
            Some(SessionEvent::IncomingTransfer { handle, .. }) => handle,
            _ => panic!("expected IncomingTransfer"),
        };

        sess.decline_transfer(now, handle).unwrap();
        match sess.poll_transmit() {
            Some(Transmit::Relay(data)) => {
                let text = String::from_utf8_lossy(&data);
                assert!(text.contains("SLP/1.0 603 Decline"));
            }
            _ => panic!("expected relay transmit"),
        }
        // Answering again is an error.
        assert!(sess.decline_transfer(now, handle).is_err());
    }

    #[test]
    fn invite_timeout_fails_once_with_timeout_reason() {
        let now = Instant::now();
        let config = ProtocolConfig::default();
        let mut sess = PeerSession::new("alice@example.com", config.clone());
        let store = MemoryStore::from_vec(vec![1u8; 64]);
        let handle =
            sess.request_transfer(now, "bob@example.com", Box::new(store), "a.bin", 2, None);
        while sess.poll_transmit().is_some() {}

        let later = now + config.call_timeout + std::time::Duration::from_secs(1);
        sess.handle_timeout(later);
        // Repeated sweeps must not repeat the terminal notification.
        sess.handle_timeout(later + std::time::Duration::from_secs(60));

        let mut failures = 0;
        while let Some(event) = sess.poll_event() {
            if let SessionEvent::TransferFailed {
                handle: got,
                reason,
            } = event
            {
                assert_eq!(got, handle);
                assert_eq!(reason, FailureReason::Timeout);
                failures += 1;
            }
        }
        assert_eq!(failures, 1);
    }

    #[test]
    fn plain_text_message_surfaces_as_event() {
        let now = Instant::now();
        let mut sess = session("bob@example.com");
        let payload = Message::text("hello").gen_payload();
        let mut wire = format!("MSG alice@example.com Alice {}\r\n", payload.len()).into_bytes();
        wire.extend_from_slice(&payload);
        sess.handle_relay_input(now, &wire);
        match sess.poll_event() {
            Some(SessionEvent::Message { remote, msg }) => {
                assert_eq!(remote, "alice@example.com");
                assert_eq!(msg.borrow().body, b"hello");
            }
            _ => panic!("expected Message"),
        }
    }

    #[test]
    fn unknown_handle_rejected() {
        let now = Instant::now();
        let mut sess = session("bob@example.com");
        assert!(matches!(
            sess.cancel_transfer(now, TransferHandle(99)),
            Err(Error::UnknownHandle)
        ));
    }
}
