//! Shared test harness: an in-memory relay (and direct socket pair)
//! coupling two peer sessions.
//!
//! The harness plays the switchboard: it acks relayed payload commands
//! back to the sender and forwards them to the other session, and it
//! shuttles direct-channel buffers straight across. Optional knobs
//! simulate the interesting failures (refused direct connects, tampered
//! handshakes).

use slipwire_core::{PeerSession, ProtocolConfig, SessionEvent, Transmit};
use slipwire_proto::AckClass;
use std::time::Instant;

/// Install a subscriber printing spans/events for failing tests.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Deterministic test blob.
pub fn blob(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31) % 251) as u8).collect()
}

enum Side {
    Left,
    Right,
}

/// Two coupled sessions plus the relay between them.
pub struct Harness {
    /// First endpoint
    pub left: PeerSession,
    /// Second endpoint
    pub right: PeerSession,
    left_name: String,
    right_name: String,
    /// Events drained from `left`
    pub left_events: Vec<SessionEvent>,
    /// Events drained from `right`
    pub right_events: Vec<SessionEvent>,
    /// Honor `DirectConnect` events by connecting both ends
    pub auto_direct: bool,
    /// Corrupt the first direct handshake frame in transit
    pub tamper_direct: bool,
    tampered: bool,
    /// Relayed payload commands forwarded
    pub relay_frames: usize,
    /// Direct-channel buffers delivered
    pub direct_frames: usize,
}

impl Harness {
    /// Couple two fresh sessions with the given tunables.
    pub fn new(left_name: &str, right_name: &str, config: ProtocolConfig) -> Self {
        Self {
            left: PeerSession::new(left_name, config.clone()),
            right: PeerSession::new(right_name, config),
            left_name: left_name.to_owned(),
            right_name: right_name.to_owned(),
            left_events: Vec::new(),
            right_events: Vec::new(),
            auto_direct: false,
            tamper_direct: false,
            tampered: false,
            relay_frames: 0,
            direct_frames: 0,
        }
    }

    /// Shuttle traffic and drain events until both sessions go quiet.
    pub fn pump(&mut self, now: Instant) {
        loop {
            let mut moved = false;
            while let Some(transmit) = self.left.poll_transmit() {
                self.deliver(now, Side::Left, transmit);
                moved = true;
            }
            while let Some(transmit) = self.right.poll_transmit() {
                self.deliver(now, Side::Right, transmit);
                moved = true;
            }
            moved |= self.collect_events();
            if !moved {
                break;
            }
        }
    }

    fn deliver(&mut self, now: Instant, from: Side, transmit: Transmit) {
        let (sender, receiver, sender_name) = match from {
            Side::Left => (&mut self.left, &mut self.right, self.left_name.as_str()),
            Side::Right => (&mut self.right, &mut self.left, self.right_name.as_str()),
        };
        match transmit {
            Transmit::Relay(wire) => {
                relay_forward(now, sender, receiver, sender_name, &wire);
                self.relay_frames += 1;
            }
            Transmit::Direct { remote: _, data } => {
                let mut data = data;
                if self.tamper_direct && !self.tampered {
                    // Flip one payload byte past the length prefix.
                    if data.len() > 4 {
                        data[4] ^= 0xFF;
                        self.tampered = true;
                    }
                }
                receiver.handle_direct_input(now, sender_name, &data);
                self.direct_frames += 1;
            }
        }
    }

    fn collect_events(&mut self) -> bool {
        let mut moved = false;
        while let Some(event) = self.left.poll_event() {
            moved = true;
            if self.auto_direct {
                if let SessionEvent::DirectConnect { remote, .. } = &event {
                    // The left side dials; the right side accepts.
                    let remote = remote.clone();
                    self.left.handle_direct_connected(&remote);
                    self.right.handle_direct_connected(&self.left_name);
                    self.left_events.push(event);
                    continue;
                }
            }
            self.left_events.push(event);
        }
        while let Some(event) = self.right.poll_event() {
            moved = true;
            if self.auto_direct {
                if let SessionEvent::DirectConnect { remote, .. } = &event {
                    let remote = remote.clone();
                    self.right.handle_direct_connected(&remote);
                    self.left.handle_direct_connected(&self.right_name);
                    self.right_events.push(event);
                    continue;
                }
            }
            self.right_events.push(event);
        }
        moved
    }
}

/// Play relay for one outbound buffer: ack it back to the sender (for the
/// ack classes that ask for one) and forward it under the sender's name.
fn relay_forward(
    now: Instant,
    sender: &mut PeerSession,
    receiver: &mut PeerSession,
    sender_name: &str,
    wire: &[u8],
) {
    let eol = wire
        .windows(2)
        .position(|w| w == b"\r\n")
        .expect("relay buffer has no line");
    let line = std::str::from_utf8(&wire[..eol]).expect("relay line not utf-8");
    let mut parts = line.split(' ');
    let name = parts.next().expect("empty relay line");
    if name != "MSG" {
        return;
    }
    let trid: u32 = parts.next().and_then(|p| p.parse().ok()).expect("no trid");
    let ack_class = parts.next().expect("no ack class");
    let payload = &wire[eol + 2..];

    if matches!(
        AckClass::from_param(ack_class),
        AckClass::Full | AckClass::Data
    ) {
        sender.handle_relay_input(now, format!("ACK {trid}\r\n").as_bytes());
    }
    let mut forwarded =
        format!("MSG {sender_name} {ack_class} {}\r\n", payload.len()).into_bytes();
    forwarded.extend_from_slice(payload);
    receiver.handle_relay_input(now, &forwarded);
}
