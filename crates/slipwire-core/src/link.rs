//! Peer link: per-remote aggregation of calls, sessions and transport.
//!
//! The link owns every active call towards one remote user, the outbound
//! and inbound transfers keyed by session id, and the optional direct
//! channel. Transport is selected per chunk: a ready direct channel wins,
//! anything else goes through the relay as a peer message.

use crate::HandleSource;
use crate::TransferHandle;
use crate::call::{CallState, PeerCall};
use crate::cmdproc::CmdProc;
use crate::config::ProtocolConfig;
use crate::directconn::{DirectConn, DirectEvent, new_nonce};
use crate::error::{Error, FailureReason};
use crate::session::SessionEvent;
use crate::store::BlobStore;
use crate::transfer::{AckOutcome, InboundTransfer, OutboundTransfer};
use slipwire_proto::sip::{CONTENT_TYPE_SESSION_CLOSE, CONTENT_TYPE_SESSION_REQUEST};
use slipwire_proto::{
    Chunk, ChunkFlags, DirectCandidate, Message, PeerFooter, PeerHeader, SessionRequest,
    SipHeaders, SipMessage, SipMethod, SipRequest, SipResponse, SipStatus,
};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// All peer-session state towards one remote user.
pub struct PeerLink {
    /// Remote user this link serves
    pub remote: String,
    local: String,
    config: ProtocolConfig,
    next_session_id: u32,
    next_chunk_id: u32,
    calls: Vec<PeerCall>,
    outbound: HashMap<u32, OutboundTransfer>,
    inbound: HashMap<u32, InboundTransfer>,
    /// Invites awaiting an application answer, keyed by their handle
    pending_invites: HashMap<TransferHandle, SipRequest>,
    direct: Option<DirectConn>,
}

impl PeerLink {
    /// Create the link for `remote`.
    #[must_use]
    pub fn new(local: &str, remote: &str, config: ProtocolConfig) -> Self {
        Self {
            remote: remote.to_owned(),
            local: local.to_owned(),
            config,
            next_session_id: 1,
            next_chunk_id: 1,
            calls: Vec::new(),
            outbound: HashMap::new(),
            inbound: HashMap::new(),
            pending_invites: HashMap::new(),
            direct: None,
        }
    }

    fn alloc_chunk_id(&mut self) -> u32 {
        let id = self.next_chunk_id;
        self.next_chunk_id = self.next_chunk_id.wrapping_add(1);
        id
    }

    fn call_idx_by_session(&self, session_id: u32) -> Option<usize> {
        self.calls
            .iter()
            .position(|c| !c.is_terminal() && c.session_id == session_id)
    }

    fn call_idx_by_call_id(&self, call_id: &str) -> Option<usize> {
        self.calls
            .iter()
            .position(|c| !c.is_terminal() && c.call_id == call_id)
    }

    fn call_idx_by_handle(&self, handle: TransferHandle) -> Option<usize> {
        self.calls
            .iter()
            .position(|c| !c.is_terminal() && c.handle == handle)
    }

    /// Whether the link still has live calls or an open direct channel.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.direct.is_some() || self.calls.iter().any(|c| !c.is_terminal())
    }

    /// Whether a live call on this link carries `handle`.
    #[must_use]
    pub fn owns(&self, handle: TransferHandle) -> bool {
        self.pending_invites.contains_key(&handle) || self.call_idx_by_handle(handle).is_some()
    }

    // --- outbound API -----------------------------------------------------

    /// Start an outbound transfer: allocate the session, open the call and
    /// send the invite. `listen` advertises a direct-connection endpoint
    /// the local side is accepting on.
    pub fn request_transfer(
        &mut self,
        now: Instant,
        handle: TransferHandle,
        store: Box<dyn BlobStore>,
        context: &str,
        app_id: u32,
        listen: Option<(String, u16)>,
        cmdproc: &mut CmdProc,
    ) {
        let session_id = self.next_session_id;
        self.next_session_id += 1;
        let total_size = store.total_size();
        self.outbound
            .insert(session_id, OutboundTransfer::new(session_id, store));

        let direct = listen.map(|(host, port)| {
            let nonce = new_nonce();
            self.direct = Some(DirectConn::new_listener(
                &self.remote,
                nonce.clone(),
                now,
                self.config.direct_timeout,
                self.config.max_frame_size,
            ));
            DirectCandidate { host, port, nonce }
        });

        let mut call = PeerCall::new_outbound(
            handle,
            &self.remote,
            session_id,
            app_id,
            now,
            self.config.call_timeout,
        );
        let body = SessionRequest {
            session_id,
            app_id,
            total_size,
            context: context.to_owned(),
            direct,
        }
        .to_body();
        let invite = SipRequest {
            method: SipMethod::Invite,
            headers: SipHeaders {
                to: self.remote.clone(),
                from: self.local.clone(),
                branch: call.branch.clone(),
                cseq: 0,
                call_id: call.call_id.clone(),
                content_type: CONTENT_TYPE_SESSION_REQUEST.to_owned(),
            },
            body,
        };
        // Invariant from the call state machine: nothing moves until the
        // invite is out.
        let _ = call.transition_to(CallState::Inviting);
        debug!(remote = %self.remote, session_id, handle = handle.0, "inviting");
        self.calls.push(call);
        self.send_control(now, cmdproc, &SipMessage::Request(invite));
    }

    /// Accept a pending incoming invite, providing the destination store.
    /// `listen` optionally advertises a direct endpoint from this side.
    pub fn accept_transfer(
        &mut self,
        now: Instant,
        handle: TransferHandle,
        store: Box<dyn BlobStore>,
        listen: Option<(String, u16)>,
        cmdproc: &mut CmdProc,
    ) -> Result<(), Error> {
        let invite = self
            .pending_invites
            .remove(&handle)
            .ok_or(Error::UnknownHandle)?;
        let idx = self
            .call_idx_by_handle(handle)
            .ok_or(Error::UnknownHandle)?;

        let (session_id, app_id) = (self.calls[idx].session_id, self.calls[idx].app_id);
        self.inbound
            .insert(session_id, InboundTransfer::new(session_id, store));

        let direct = listen.map(|(host, port)| {
            let nonce = new_nonce();
            self.direct = Some(DirectConn::new_listener(
                &self.remote,
                nonce.clone(),
                now,
                self.config.direct_timeout,
                self.config.max_frame_size,
            ));
            DirectCandidate { host, port, nonce }
        });
        let body = SessionRequest {
            session_id,
            app_id,
            total_size: 0,
            context: String::new(),
            direct,
        }
        .to_body();
        let answer = SipResponse::answer(&invite, SipStatus::Ok, body);

        let call = &mut self.calls[idx];
        call.pending = false;
        call.transition_to(CallState::Negotiating)?;
        // The destination store is handed over ready, so the session
        // starts immediately.
        call.transition_to(CallState::Started)?;
        call.touch(now, self.config.call_timeout);
        debug!(remote = %self.remote, session_id, "invite accepted");
        self.send_control(now, cmdproc, &SipMessage::Response(answer));
        Ok(())
    }

    /// Decline a pending incoming invite.
    pub fn decline_transfer(
        &mut self,
        now: Instant,
        handle: TransferHandle,
        cmdproc: &mut CmdProc,
    ) -> Result<(), Error> {
        let invite = self
            .pending_invites
            .remove(&handle)
            .ok_or(Error::UnknownHandle)?;
        if let Some(idx) = self.call_idx_by_handle(handle) {
            let call = &mut self.calls[idx];
            call.mark_ended();
            let _ = call.transition_to(CallState::Closed);
        }
        debug!(remote = %self.remote, handle = handle.0, "invite declined");
        let answer = SipResponse::answer(&invite, SipStatus::Decline, String::new());
        self.send_control(now, cmdproc, &SipMessage::Response(answer));
        Ok(())
    }

    /// Cancel a transfer in any live state. The terminal notification is
    /// `Cancelled`.
    pub fn cancel_transfer(
        &mut self,
        now: Instant,
        handle: TransferHandle,
        cmdproc: &mut CmdProc,
        events: &mut VecDeque<SessionEvent>,
    ) -> Result<(), Error> {
        if self.pending_invites.contains_key(&handle) {
            self.decline_transfer(now, handle, cmdproc)?;
            return Ok(());
        }
        let idx = self
            .call_idx_by_handle(handle)
            .ok_or(Error::UnknownHandle)?;
        let bye = self.bye_for(idx);
        self.send_control(now, cmdproc, &SipMessage::Request(bye));
        self.fail_call(idx, FailureReason::Cancelled, events);
        Ok(())
    }

    // --- inbound routing --------------------------------------------------

    /// Route a relayed peer message into the link.
    pub fn handle_peer_message(
        &mut self,
        now: Instant,
        msg: &Rc<RefCell<Message>>,
        cmdproc: &mut CmdProc,
        events: &mut VecDeque<SessionEvent>,
        handles: &mut HandleSource,
    ) {
        let (header, body, footer) = {
            let m = msg.borrow();
            let (Some(header), Some(footer)) = (m.peer_header, m.peer_footer) else {
                return;
            };
            (header, m.body.clone(), footer)
        };
        self.handle_chunk_frame(now, header, &body, footer, cmdproc, events, handles);
    }

    /// Route one framed chunk, from either transport.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_chunk_frame(
        &mut self,
        now: Instant,
        header: PeerHeader,
        body: &[u8],
        footer: PeerFooter,
        cmdproc: &mut CmdProc,
        events: &mut VecDeque<SessionEvent>,
        handles: &mut HandleSource,
    ) {
        if header.flags.is_ack() {
            if header.session_id != 0 {
                self.handle_ack(now, &header, cmdproc, events);
            }
            return;
        }
        if header.session_id == 0 {
            let Ok(text) = std::str::from_utf8(body) else {
                events.push_back(SessionEvent::Warning(
                    "negotiation chunk is not valid utf-8".to_owned(),
                ));
                return;
            };
            match SipMessage::parse(text) {
                Ok(sip) => self.handle_sip(now, &sip, cmdproc, events, handles),
                Err(err) => {
                    warn!(remote = %self.remote, %err, "discarding malformed negotiation");
                    events.push_back(SessionEvent::Warning(format!(
                        "malformed negotiation text: {err}"
                    )));
                }
            }
            return;
        }
        self.handle_data(now, &header, body, footer, cmdproc, events);
    }

    fn handle_data(
        &mut self,
        now: Instant,
        header: &PeerHeader,
        body: &[u8],
        footer: PeerFooter,
        cmdproc: &mut CmdProc,
        events: &mut VecDeque<SessionEvent>,
    ) {
        let session_id = header.session_id;
        let outcome = {
            let Some(transfer) = self.inbound.get_mut(&session_id) else {
                debug!(session_id, "data chunk for unknown session");
                return;
            };
            transfer
                .handle_chunk(header.offset, body)
                .map(|complete| (complete, transfer.cursor(), transfer.total_size()))
        };
        let Some(idx) = self.call_idx_by_session(session_id) else {
            return;
        };
        match outcome {
            Ok((complete, cursor, total)) => {
                let ack_id = self.alloc_chunk_id();
                let ack = header.ack(ack_id, cursor);
                self.transmit(now, cmdproc, ack, Vec::new(), footer);

                let call = &mut self.calls[idx];
                call.touch(now, self.config.call_timeout);
                if call.state() == CallState::Started {
                    let _ = call.transition_to(CallState::Active);
                }
                events.push_back(SessionEvent::TransferProgress {
                    handle: call.handle,
                    transferred: cursor,
                    total,
                });
                if complete {
                    if call.mark_ended() {
                        events.push_back(SessionEvent::TransferComplete {
                            handle: call.handle,
                        });
                    }
                    // Wait for the sender's bye, bounded by the grace
                    // period.
                    let _ = call.begin_close(now, self.config.close_grace);
                }
            }
            Err(reason) => self.fail_call(idx, reason, events),
        }
    }

    fn handle_ack(
        &mut self,
        now: Instant,
        header: &PeerHeader,
        cmdproc: &mut CmdProc,
        events: &mut VecDeque<SessionEvent>,
    ) {
        let session_id = header.session_id;
        let outcome = {
            let Some(transfer) = self.outbound.get_mut(&session_id) else {
                trace!(session_id, "ack for unknown session");
                return;
            };
            transfer
                .handle_ack(header.ack_id, header.ack_size)
                .map(|o| (o, transfer.acked(), transfer.total_size()))
        };
        let Some(idx) = self.call_idx_by_session(session_id) else {
            return;
        };
        match outcome {
            Ok((AckOutcome::Unmatched, _, _)) => {}
            Ok((outcome, acked, total)) => {
                {
                    let call = &mut self.calls[idx];
                    call.touch(now, self.config.call_timeout);
                    if call.state() == CallState::Started {
                        let _ = call.transition_to(CallState::Active);
                    }
                    events.push_back(SessionEvent::TransferProgress {
                        handle: call.handle,
                        transferred: acked,
                        total,
                    });
                }
                if outcome == AckOutcome::Complete {
                    let bye = self.bye_for(idx);
                    self.send_control(now, cmdproc, &SipMessage::Request(bye));
                    let call = &mut self.calls[idx];
                    if call.mark_ended() {
                        events.push_back(SessionEvent::TransferComplete {
                            handle: call.handle,
                        });
                    }
                    let _ = call.begin_close(now, self.config.close_grace);
                } else {
                    self.pump(now, cmdproc, events);
                }
            }
            Err(reason) => self.fail_call(idx, reason, events),
        }
    }

    fn handle_sip(
        &mut self,
        now: Instant,
        sip: &SipMessage,
        cmdproc: &mut CmdProc,
        events: &mut VecDeque<SessionEvent>,
        handles: &mut HandleSource,
    ) {
        match sip {
            SipMessage::Request(req) if req.method == SipMethod::Invite => {
                self.handle_invite(now, req, cmdproc, events, handles);
            }
            SipMessage::Request(req) => self.handle_bye(now, req, cmdproc, events),
            SipMessage::Response(resp) => self.handle_response(now, resp, cmdproc, events),
        }
    }

    fn handle_invite(
        &mut self,
        now: Instant,
        req: &SipRequest,
        cmdproc: &mut CmdProc,
        events: &mut VecDeque<SessionEvent>,
        handles: &mut HandleSource,
    ) {
        let session = match SessionRequest::from_body(&req.body) {
            Ok(session) => session,
            Err(err) => {
                warn!(remote = %self.remote, %err, "unreadable invite body");
                let answer = SipResponse::answer(req, SipStatus::InternalError, String::new());
                self.send_control(now, cmdproc, &SipMessage::Response(answer));
                return;
            }
        };
        // Duplicate invites for a live session are ignored.
        if self.call_idx_by_session(session.session_id).is_some() {
            debug!(
                remote = %self.remote,
                session_id = session.session_id,
                "ignoring duplicate invite"
            );
            return;
        }

        let handle = handles.alloc();
        let call = PeerCall::new_inbound(
            handle,
            &self.remote,
            session.session_id,
            session.app_id,
            req.headers.call_id.clone(),
            req.headers.branch.clone(),
            now,
            self.config.call_timeout,
        );
        debug!(
            remote = %self.remote,
            session_id = session.session_id,
            handle = handle.0,
            "incoming invite"
        );
        self.calls.push(call);
        self.pending_invites.insert(handle, req.clone());

        if let Some(candidate) = &session.direct {
            if self.direct.is_none() {
                self.direct = Some(DirectConn::new_connector(
                    &self.remote,
                    candidate.nonce.clone(),
                    now,
                    self.config.direct_timeout,
                    self.config.max_frame_size,
                ));
                events.push_back(SessionEvent::DirectConnect {
                    remote: self.remote.clone(),
                    host: candidate.host.clone(),
                    port: candidate.port,
                });
            }
        }
        events.push_back(SessionEvent::IncomingTransfer {
            handle,
            remote: self.remote.clone(),
            session_id: session.session_id,
            app_id: session.app_id,
            context: session.context,
            total_size: session.total_size,
        });
    }

    fn handle_bye(
        &mut self,
        now: Instant,
        req: &SipRequest,
        cmdproc: &mut CmdProc,
        events: &mut VecDeque<SessionEvent>,
    ) {
        let Some(idx) = self.call_idx_by_call_id(&req.headers.call_id) else {
            let answer = SipResponse::answer(req, SipStatus::NoSuchCall, String::new());
            self.send_control(now, cmdproc, &SipMessage::Response(answer));
            return;
        };
        let answer = SipResponse::answer(req, SipStatus::Ok, String::new());
        self.send_control(now, cmdproc, &SipMessage::Response(answer));

        let call = &mut self.calls[idx];
        debug!(remote = %self.remote, session_id = call.session_id, "bye received");
        self.pending_invites.remove(&call.handle);
        if call.mark_ended() {
            // The transfer had not completed; the remote tore it down.
            events.push_back(SessionEvent::TransferFailed {
                handle: call.handle,
                reason: FailureReason::RemoteBye,
            });
        }
        let session_id = call.session_id;
        let _ = call.transition_to(CallState::Closed);
        self.drop_session(session_id);
    }

    fn handle_response(
        &mut self,
        now: Instant,
        resp: &SipResponse,
        cmdproc: &mut CmdProc,
        events: &mut VecDeque<SessionEvent>,
    ) {
        let Some(idx) = self.call_idx_by_call_id(&resp.headers.call_id) else {
            trace!(remote = %self.remote, "response for unknown call");
            return;
        };
        match self.calls[idx].state() {
            CallState::Closing => {
                // Answer to our bye.
                let call = &mut self.calls[idx];
                let session_id = call.session_id;
                let _ = call.transition_to(CallState::Closed);
                self.drop_session(session_id);
            }
            CallState::Inviting => {
                if resp.status == SipStatus::Ok {
                    if let Ok(session) = SessionRequest::from_body(&resp.body) {
                        if let Some(candidate) = &session.direct {
                            if self.direct.is_none() {
                                self.direct = Some(DirectConn::new_connector(
                                    &self.remote,
                                    candidate.nonce.clone(),
                                    now,
                                    self.config.direct_timeout,
                                    self.config.max_frame_size,
                                ));
                                events.push_back(SessionEvent::DirectConnect {
                                    remote: self.remote.clone(),
                                    host: candidate.host.clone(),
                                    port: candidate.port,
                                });
                            }
                        }
                    }
                    let call = &mut self.calls[idx];
                    let _ = call.transition_to(CallState::Negotiating);
                    // Outbound stores are ready at request time.
                    let _ = call.transition_to(CallState::Started);
                    call.touch(now, self.config.call_timeout);
                    debug!(remote = %self.remote, session_id = call.session_id, "invite accepted by remote");
                    self.pump(now, cmdproc, events);
                } else {
                    let code = resp.status.code();
                    self.fail_call(idx, FailureReason::Rejected(code), events);
                }
            }
            state => {
                trace!(?state, "ignoring response in current state");
            }
        }
    }

    /// A relayed message carrying a chunk of `session_id` could not be
    /// delivered.
    pub fn handle_delivery_failure(
        &mut self,
        session_id: u32,
        error: crate::error::TransactionError,
        events: &mut VecDeque<SessionEvent>,
    ) {
        if session_id == 0 {
            // Control traffic failures surface through call timeouts.
            return;
        }
        if let Some(idx) = self.call_idx_by_session(session_id) {
            self.fail_call(idx, FailureReason::Delivery(error), events);
        }
    }

    // --- direct channel ---------------------------------------------------

    /// The direct socket for this remote is connected.
    pub fn handle_direct_connected(&mut self) {
        if let Some(conn) = &mut self.direct {
            conn.on_connected();
        }
    }

    /// Bytes arrived on the direct socket.
    pub fn handle_direct_input(
        &mut self,
        now: Instant,
        bytes: &[u8],
        cmdproc: &mut CmdProc,
        events: &mut VecDeque<SessionEvent>,
        handles: &mut HandleSource,
    ) {
        let direct_events = match &mut self.direct {
            Some(conn) => conn.feed(bytes),
            None => return,
        };
        for event in direct_events {
            match event {
                DirectEvent::Ready => {
                    debug!(remote = %self.remote, "switching transport to direct");
                }
                DirectEvent::Data(payload) => match Chunk::parse(&payload) {
                    Ok(chunk) => {
                        let (header, footer) = (chunk.header, chunk.footer);
                        let body = chunk.body.to_vec();
                        self.handle_chunk_frame(
                            now, header, &body, footer, cmdproc, events, handles,
                        );
                    }
                    Err(err) => {
                        events.push_back(SessionEvent::Warning(format!(
                            "malformed direct frame: {err}"
                        )));
                    }
                },
                DirectEvent::Failed => {
                    // Nonce mismatch or broken framing: tear the channel
                    // down.
                    self.handle_direct_error(events);
                    return;
                }
            }
        }
    }

    /// The direct socket failed or closed. Before the handshake finishes
    /// this falls back to relay silently; afterwards it is fatal to the
    /// transfers in flight.
    pub fn handle_direct_error(&mut self, events: &mut VecDeque<SessionEvent>) {
        let Some(conn) = self.direct.take() else {
            return;
        };
        if !conn.is_ready() {
            debug!(remote = %self.remote, "direct attempt failed, staying on relay");
            return;
        }
        warn!(remote = %self.remote, "direct channel lost mid-transfer");
        let live: Vec<usize> = (0..self.calls.len())
            .filter(|&i| {
                let c = &self.calls[i];
                !c.is_terminal()
                    && matches!(c.state(), CallState::Started | CallState::Active)
            })
            .collect();
        for idx in live {
            self.fail_call(idx, FailureReason::DirectLost, events);
        }
    }

    // --- transport --------------------------------------------------------

    /// Queue chunks from every running outbound transfer, up to the send
    /// window.
    pub fn pump(
        &mut self,
        now: Instant,
        cmdproc: &mut CmdProc,
        events: &mut VecDeque<SessionEvent>,
    ) {
        let running: Vec<(usize, u32, u32)> = self
            .calls
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c.state(), CallState::Started | CallState::Active))
            .map(|(i, c)| (i, c.session_id, c.app_id))
            .collect();

        for (idx, session_id, app_id) in running {
            loop {
                let next = {
                    let Some(transfer) = self.outbound.get_mut(&session_id) else {
                        break;
                    };
                    if transfer.in_flight() >= self.config.send_window {
                        break;
                    }
                    match transfer.next_chunk(self.config.max_chunk_size as u32) {
                        Ok(Some((offset, body))) => {
                            let total = transfer.total_size();
                            Some((offset, body, total))
                        }
                        Ok(None) => None,
                        Err(err) => {
                            self.fail_call(idx, FailureReason::Store(err.to_string()), events);
                            break;
                        }
                    }
                };
                let Some((offset, body, total_size)) = next else {
                    break;
                };
                let chunk_id = self.alloc_chunk_id();
                let flags = if app_id == 1 {
                    ChunkFlags::new().with_object()
                } else {
                    ChunkFlags::new().with_file()
                };
                let header = PeerHeader {
                    session_id,
                    chunk_id,
                    offset,
                    total_size,
                    length: body.len() as u32,
                    flags,
                    ack_id: 0,
                    ack_sub_id: 0,
                    ack_size: 0,
                };
                if let Some(transfer) = self.outbound.get_mut(&session_id) {
                    transfer.record_in_flight(chunk_id, offset, body.len() as u32);
                }
                self.transmit(now, cmdproc, header, body, PeerFooter { value: app_id });
            }
        }
    }

    /// Send a negotiation text as a session-0 control chunk.
    fn send_control(&mut self, now: Instant, cmdproc: &mut CmdProc, sip: &SipMessage) {
        let body = sip.to_text().into_bytes();
        let chunk_id = self.alloc_chunk_id();
        let header = PeerHeader {
            session_id: 0,
            chunk_id,
            offset: 0,
            total_size: body.len() as u64,
            length: body.len() as u32,
            flags: ChunkFlags::new(),
            ack_id: 0,
            ack_sub_id: 0,
            ack_size: 0,
        };
        self.transmit(now, cmdproc, header, body, PeerFooter { value: 0 });
    }

    /// Write one framed chunk to the preferred transport.
    fn transmit(
        &mut self,
        now: Instant,
        cmdproc: &mut CmdProc,
        header: PeerHeader,
        body: Vec<u8>,
        footer: PeerFooter,
    ) {
        if let Some(conn) = &mut self.direct {
            if conn.is_ready() {
                conn.send(&Chunk::build(&header, &body, &footer));
                return;
            }
        }
        let msg = Rc::new(RefCell::new(Message::peer(header, body, footer)));
        cmdproc.send_message(now, &self.remote, msg);
    }

    /// Drain one buffer queued on the direct channel.
    pub fn poll_direct_transmit(&mut self) -> Option<Vec<u8>> {
        self.direct.as_mut()?.poll_transmit()
    }

    // --- timers and teardown ----------------------------------------------

    /// Sweep call and direct-channel timers.
    pub fn handle_timeout(&mut self, now: Instant, events: &mut VecDeque<SessionEvent>) {
        if let Some(conn) = &mut self.direct {
            if conn.check_timeout(now) {
                self.handle_direct_error(events);
            }
        }
        for idx in 0..self.calls.len() {
            match self.calls[idx].check_timeout(now) {
                Some(CallState::TimedOut) => {
                    let session_id = self.calls[idx].session_id;
                    let call = &mut self.calls[idx];
                    warn!(remote = %self.remote, session_id, "call timed out");
                    if call.mark_ended() {
                        events.push_back(SessionEvent::TransferFailed {
                            handle: call.handle,
                            reason: FailureReason::Timeout,
                        });
                    }
                    self.drop_session(session_id);
                }
                Some(CallState::Closed) => {
                    // Grace expiry after close; the terminal notification
                    // went out when the transfer finished.
                    let session_id = self.calls[idx].session_id;
                    self.drop_session(session_id);
                }
                _ => {}
            }
        }
        self.reap();
    }

    /// Earliest pending deadline on this link.
    #[must_use]
    pub fn next_timeout(&self) -> Option<Instant> {
        let calls = self.calls.iter().filter_map(PeerCall::next_deadline);
        let direct = self.direct.as_ref().and_then(DirectConn::next_deadline);
        calls.chain(direct).min()
    }

    fn bye_for(&self, idx: usize) -> SipRequest {
        let call = &self.calls[idx];
        SipRequest {
            method: SipMethod::Bye,
            headers: SipHeaders {
                to: self.remote.clone(),
                from: self.local.clone(),
                branch: call.branch.clone(),
                cseq: 0,
                call_id: call.call_id.clone(),
                content_type: CONTENT_TYPE_SESSION_CLOSE.to_owned(),
            },
            body: String::new(),
        }
    }

    /// Terminate the call at `idx` with a failure. At most one terminal
    /// notification leaves per transfer.
    fn fail_call(
        &mut self,
        idx: usize,
        reason: FailureReason,
        events: &mut VecDeque<SessionEvent>,
    ) {
        let call = &mut self.calls[idx];
        let session_id = call.session_id;
        self.pending_invites.remove(&call.handle);
        warn!(
            remote = %self.remote,
            session_id,
            handle = call.handle.0,
            %reason,
            "transfer failed"
        );
        if call.mark_ended() {
            events.push_back(SessionEvent::TransferFailed {
                handle: call.handle,
                reason,
            });
        }
        call.wasted = true;
        let _ = call.transition_to(CallState::Closed);
        self.drop_session(session_id);
    }

    fn drop_session(&mut self, session_id: u32) {
        self.outbound.remove(&session_id);
        self.inbound.remove(&session_id);
    }

    fn reap(&mut self) {
        let before = self.calls.len();
        self.calls.retain(|c| !c.is_terminal());
        if self.calls.len() != before {
            trace!(remote = %self.remote, reaped = before - self.calls.len(), "reaped calls");
        }
    }
}
