//! Application messages carried inside command payloads.
//!
//! A message payload mirrors minimal mail framing: a `Key: value` header
//! block terminated by a blank line, then the body. Peer-session messages
//! carry the binary chunk framing of [`crate::frame`] as their body.

use crate::frame::{Chunk, FrameError, PeerFooter, PeerHeader};
use thiserror::Error;

/// Header-block delimiter separating headers from the body
pub const BODY_DELIMITER: &[u8] = b"\r\n\r\n";

/// Content type of plain text messages
pub const CONTENT_TYPE_TEXT: &str = "text/plain";
/// Content type of typing notifications
pub const CONTENT_TYPE_TYPING: &str = "text/x-typing";
/// Content type of client capability announcements
pub const CONTENT_TYPE_CAPS: &str = "text/x-clientcaps";
/// Content type of nudges
pub const CONTENT_TYPE_NUDGE: &str = "text/x-nudge";
/// Content type of peer-session (chunk) messages
pub const CONTENT_TYPE_PEER: &str = "application/x-peer-session";

/// Message parsing/validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    /// Payload has no blank-line terminator after the header block
    #[error("missing header terminator")]
    MissingTerminator,

    /// Header block is not valid UTF-8
    #[error("header block is not valid utf-8")]
    HeaderNotUtf8,

    /// A header line has no `:` separator
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    /// Declared Content-Length disagrees with the actual body
    #[error("content length mismatch: declared {declared}, actual {actual}")]
    ContentLengthMismatch {
        /// Declared length
        declared: usize,
        /// Actual body length
        actual: usize,
    },

    /// Embedded chunk framing error
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Message type tag, derived from the content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Plain text
    Text,
    /// Typing notification
    Typing,
    /// Client capabilities
    Caps,
    /// Peer-session chunk traffic
    Peer,
    /// Nudge
    Nudge,
    /// Anything this implementation does not recognize
    Unknown,
}

impl MessageKind {
    fn for_content_type(ct: &str) -> Self {
        match ct {
            CONTENT_TYPE_TEXT => Self::Text,
            CONTENT_TYPE_TYPING => Self::Typing,
            CONTENT_TYPE_CAPS => Self::Caps,
            CONTENT_TYPE_NUDGE => Self::Nudge,
            CONTENT_TYPE_PEER => Self::Peer,
            _ => Self::Unknown,
        }
    }
}

/// Acknowledgment class requested for a relayed message.
///
/// Serialized as the single-character flag parameter of the relaying
/// command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckClass {
    /// No acknowledgment
    None,
    /// Negative acknowledgment only
    NakOnly,
    /// Always acknowledged
    Full,
    /// Always acknowledged, payload is binary data
    Data,
}

impl AckClass {
    /// Wire parameter for this class.
    #[must_use]
    pub fn as_param(self) -> &'static str {
        match self {
            Self::None => "U",
            Self::NakOnly => "N",
            Self::Full => "A",
            Self::Data => "D",
        }
    }

    /// Parse a wire parameter; unknown values fall back to `NakOnly`.
    #[must_use]
    pub fn from_param(p: &str) -> Self {
        match p {
            "U" => Self::None,
            "A" => Self::Full,
            "D" => Self::Data,
            _ => Self::NakOnly,
        }
    }
}

/// An application message: typed header block plus body.
///
/// Attribute insertion order is irrelevant for lookup but preserved for
/// serialization.
#[derive(Debug, Clone)]
pub struct Message {
    /// Type tag
    pub kind: MessageKind,
    /// Content type (without charset parameter)
    pub content_type: String,
    /// Optional charset parameter of the content type
    pub charset: Option<String>,
    /// Remaining headers, in insertion order
    attrs: Vec<(String, String)>,
    /// Body bytes (for peer messages, the chunk payload without framing)
    pub body: Vec<u8>,
    /// Binary peer header, present on peer-session messages
    pub peer_header: Option<PeerHeader>,
    /// Binary peer footer, present on peer-session messages
    pub peer_footer: Option<PeerFooter>,
    /// Acknowledgment class used when relaying this message
    pub ack_class: AckClass,
}

impl Message {
    /// Create a plain text message.
    #[must_use]
    pub fn text(body: &str) -> Self {
        Self {
            kind: MessageKind::Text,
            content_type: CONTENT_TYPE_TEXT.to_owned(),
            charset: Some("UTF-8".to_owned()),
            attrs: Vec::new(),
            body: body.as_bytes().to_vec(),
            peer_header: None,
            peer_footer: None,
            ack_class: AckClass::NakOnly,
        }
    }

    /// Create a peer-session message around one framed chunk.
    #[must_use]
    pub fn peer(header: PeerHeader, body: Vec<u8>, footer: PeerFooter) -> Self {
        debug_assert_eq!(header.length as usize, body.len());
        Self {
            kind: MessageKind::Peer,
            content_type: CONTENT_TYPE_PEER.to_owned(),
            charset: None,
            attrs: Vec::new(),
            body,
            peer_header: Some(header),
            peer_footer: Some(footer),
            ack_class: AckClass::Data,
        }
    }

    /// Set (or replace) a header attribute.
    pub fn set_attr(&mut self, key: &str, value: &str) {
        if let Some(slot) = self.attrs.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value.to_owned();
        } else {
            self.attrs.push((key.to_owned(), value.to_owned()));
        }
    }

    /// Look up a header attribute.
    #[must_use]
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All attributes in insertion order.
    #[must_use]
    pub fn attrs(&self) -> &[(String, String)] {
        &self.attrs
    }

    /// Serialize the full payload: header block, blank line, body.
    #[must_use]
    pub fn gen_payload(&self) -> Vec<u8> {
        let mut head = String::from("MIME-Version: 1.0\r\n");
        head.push_str("Content-Type: ");
        head.push_str(&self.content_type);
        if let Some(cs) = &self.charset {
            head.push_str("; charset=");
            head.push_str(cs);
        }
        head.push_str("\r\n");
        for (k, v) in &self.attrs {
            head.push_str(k);
            head.push_str(": ");
            head.push_str(v);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");

        let mut payload = head.into_bytes();
        match (&self.peer_header, &self.peer_footer) {
            (Some(hdr), Some(ftr)) => {
                payload.extend_from_slice(&Chunk::build(hdr, &self.body, ftr));
            }
            _ => payload.extend_from_slice(&self.body),
        }
        payload
    }

    /// Parse a payload received off the wire.
    pub fn parse_payload(payload: &[u8]) -> Result<Self, MessageError> {
        let split = payload
            .windows(BODY_DELIMITER.len())
            .position(|w| w == BODY_DELIMITER)
            .ok_or(MessageError::MissingTerminator)?;
        let head =
            std::str::from_utf8(&payload[..split]).map_err(|_| MessageError::HeaderNotUtf8)?;
        let raw_body = &payload[split + BODY_DELIMITER.len()..];

        let mut content_type = CONTENT_TYPE_TEXT.to_owned();
        let mut charset = None;
        let mut attrs = Vec::new();
        for line in head.split("\r\n").filter(|l| !l.is_empty()) {
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| MessageError::MalformedHeader(line.to_owned()))?;
            let (key, value) = (key.trim(), value.trim());
            match key {
                "MIME-Version" => {}
                "Content-Type" => {
                    let mut parts = value.split(';');
                    content_type = parts.next().unwrap_or("").trim().to_owned();
                    for param in parts {
                        if let Some(cs) = param.trim().strip_prefix("charset=") {
                            charset = Some(cs.to_owned());
                        }
                    }
                }
                _ => attrs.push((key.to_owned(), value.to_owned())),
            }
        }

        if let Some(declared) = attrs
            .iter()
            .find(|(k, _)| k == "Content-Length")
            .and_then(|(_, v)| v.parse::<usize>().ok())
        {
            if declared != raw_body.len() {
                return Err(MessageError::ContentLengthMismatch {
                    declared,
                    actual: raw_body.len(),
                });
            }
        }

        let kind = MessageKind::for_content_type(&content_type);
        let (body, peer_header, peer_footer) = if kind == MessageKind::Peer {
            let chunk = Chunk::parse(raw_body)?;
            (chunk.body.to_vec(), Some(chunk.header), Some(chunk.footer))
        } else {
            (raw_body.to_vec(), None, None)
        };

        Ok(Self {
            kind,
            content_type,
            charset,
            attrs,
            body,
            peer_header,
            peer_footer,
            ack_class: AckClass::NakOnly,
        })
    }
}
