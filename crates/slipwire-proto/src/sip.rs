//! SLP negotiation bodies: the SIP-like invite/accept/bye texts exchanged
//! inside peer-session control chunks.
//!
//! Requests look like `INVITE PEER:bob@example.com SLP/1.0` with `To`,
//! `From`, `Via` (carrying the branch), `CSeq`, `Call-ID` and content
//! headers; responses reuse the same header block after a status line such
//! as `SLP/1.0 200 OK`.

use thiserror::Error;

/// Protocol identifier used in start lines and `Via` headers
pub const SLP_VERSION: &str = "SLP/1.0";

/// Content type of a session-establishment body
pub const CONTENT_TYPE_SESSION_REQUEST: &str = "application/x-session-request";
/// Content type of a session-teardown body
pub const CONTENT_TYPE_SESSION_CLOSE: &str = "application/x-session-close";

/// Negotiation parsing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SipError {
    /// Start line is neither a known request nor a response
    #[error("malformed start line: {0:?}")]
    MalformedStartLine(String),

    /// A required header is absent
    #[error("missing header: {0}")]
    MissingHeader(&'static str),

    /// A header value failed to parse
    #[error("bad value for {field}: {value:?}")]
    BadField {
        /// Header or body field name
        field: &'static str,
        /// Offending value
        value: String,
    },
}

/// Request methods used by the negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipMethod {
    /// Open (or upgrade) a session
    Invite,
    /// Tear a session down
    Bye,
}

impl SipMethod {
    fn as_str(self) -> &'static str {
        match self {
            Self::Invite => "INVITE",
            Self::Bye => "BYE",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "INVITE" => Some(Self::Invite),
            "BYE" => Some(Self::Bye),
            _ => None,
        }
    }
}

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipStatus {
    /// Invite accepted
    Ok,
    /// No call matches the branch/call-id
    NoSuchCall,
    /// Internal failure on the remote side
    InternalError,
    /// Invite declined
    Decline,
}

impl SipStatus {
    /// Numeric code.
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::NoSuchCall => 481,
            Self::InternalError => 500,
            Self::Decline => 603,
        }
    }

    /// Reason phrase for the status line.
    #[must_use]
    pub fn reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::NoSuchCall => "No Such Call",
            Self::InternalError => "Internal Error",
            Self::Decline => "Decline",
        }
    }

    fn from_code(code: u16) -> Option<Self> {
        match code {
            200 => Some(Self::Ok),
            481 => Some(Self::NoSuchCall),
            500 => Some(Self::InternalError),
            603 => Some(Self::Decline),
            _ => None,
        }
    }
}

/// Shared header block of requests and responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipHeaders {
    /// Destination user
    pub to: String,
    /// Originating user
    pub from: String,
    /// Via branch token
    pub branch: String,
    /// Command sequence within the call
    pub cseq: u32,
    /// Call identifier (GUID string)
    pub call_id: String,
    /// Body content type
    pub content_type: String,
}

/// A negotiation request (INVITE or BYE).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipRequest {
    /// Method
    pub method: SipMethod,
    /// Header block
    pub headers: SipHeaders,
    /// Body text (key/value lines)
    pub body: String,
}

/// A negotiation response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipResponse {
    /// Status
    pub status: SipStatus,
    /// Header block
    pub headers: SipHeaders,
    /// Body text
    pub body: String,
}

impl SipResponse {
    /// Build the response answering `req`, echoing its correlation headers.
    #[must_use]
    pub fn answer(req: &SipRequest, status: SipStatus, body: String) -> Self {
        Self {
            status,
            headers: SipHeaders {
                // To/From swap on the return path
                to: req.headers.from.clone(),
                from: req.headers.to.clone(),
                branch: req.headers.branch.clone(),
                cseq: req.headers.cseq + 1,
                call_id: req.headers.call_id.clone(),
                content_type: req.headers.content_type.clone(),
            },
            body,
        }
    }
}

/// Either side of a negotiation exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    /// Request (INVITE/BYE)
    Request(SipRequest),
    /// Response (200/481/500/603)
    Response(SipResponse),
}

impl SipMessage {
    /// Serialize to its wire text.
    #[must_use]
    pub fn to_text(&self) -> String {
        let (start, headers, body) = match self {
            Self::Request(req) => (
                format!("{} PEER:{} {SLP_VERSION}", req.method.as_str(), req.headers.to),
                &req.headers,
                &req.body,
            ),
            Self::Response(resp) => (
                format!("{SLP_VERSION} {} {}", resp.status.code(), resp.status.reason()),
                &resp.headers,
                &resp.body,
            ),
        };
        format!(
            "{start}\r\n\
             To: <peer:{to}>\r\n\
             From: <peer:{from}>\r\n\
             Via: {SLP_VERSION}/TLP ;branch={branch}\r\n\
             CSeq: {cseq}\r\n\
             Call-ID: {call_id}\r\n\
             Max-Forwards: 0\r\n\
             Content-Type: {content_type}\r\n\
             Content-Length: {len}\r\n\
             \r\n\
             {body}",
            to = headers.to,
            from = headers.from,
            branch = headers.branch,
            cseq = headers.cseq,
            call_id = headers.call_id,
            content_type = headers.content_type,
            len = body.len(),
        )
    }

    /// Parse a negotiation text.
    pub fn parse(text: &str) -> Result<Self, SipError> {
        let (head, body) = text
            .split_once("\r\n\r\n")
            .ok_or(SipError::MissingHeader("body"))?;
        let mut lines = head.split("\r\n");
        let start = lines
            .next()
            .ok_or_else(|| SipError::MalformedStartLine(String::new()))?;

        let mut to = None;
        let mut from = None;
        let mut branch = None;
        let mut cseq = None;
        let mut call_id = None;
        let mut content_type = None;
        for line in lines.filter(|l| !l.is_empty()) {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "To" => to = Some(strip_peer_uri(value)),
                "From" => from = Some(strip_peer_uri(value)),
                "Via" => {
                    branch = value
                        .split_once("branch=")
                        .map(|(_, b)| b.trim().to_owned());
                }
                "CSeq" => {
                    cseq = Some(value.parse::<u32>().map_err(|_| SipError::BadField {
                        field: "CSeq",
                        value: value.to_owned(),
                    })?);
                }
                "Call-ID" => call_id = Some(value.to_owned()),
                "Content-Type" => content_type = Some(value.to_owned()),
                _ => {}
            }
        }

        let headers = SipHeaders {
            to: to.ok_or(SipError::MissingHeader("To"))?,
            from: from.ok_or(SipError::MissingHeader("From"))?,
            branch: branch.ok_or(SipError::MissingHeader("Via"))?,
            cseq: cseq.ok_or(SipError::MissingHeader("CSeq"))?,
            call_id: call_id.ok_or(SipError::MissingHeader("Call-ID"))?,
            content_type: content_type.ok_or(SipError::MissingHeader("Content-Type"))?,
        };
        let body = body.to_owned();

        if let Some(rest) = start.strip_prefix(SLP_VERSION) {
            let mut parts = rest.split_whitespace();
            let code_text = parts
                .next()
                .ok_or_else(|| SipError::MalformedStartLine(start.to_owned()))?;
            let code: u16 = code_text.parse().map_err(|_| SipError::BadField {
                field: "status",
                value: code_text.to_owned(),
            })?;
            let status = SipStatus::from_code(code).ok_or(SipError::BadField {
                field: "status",
                value: code_text.to_owned(),
            })?;
            return Ok(Self::Response(SipResponse {
                status,
                headers,
                body,
            }));
        }

        let mut parts = start.split_whitespace();
        let method = parts
            .next()
            .and_then(SipMethod::parse)
            .ok_or_else(|| SipError::MalformedStartLine(start.to_owned()))?;
        Ok(Self::Request(SipRequest {
            method,
            headers,
            body,
        }))
    }
}

fn strip_peer_uri(value: &str) -> String {
    value
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim_start_matches("peer:")
        .to_owned()
}

/// Direct-connection candidate advertised inside a session request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectCandidate {
    /// Host to connect to
    pub host: String,
    /// Listening port
    pub port: u16,
    /// Nonce the connecting side must echo during the handshake
    pub nonce: String,
}

/// Body of an INVITE / 200 OK: session parameters plus an optional
/// direct-connection candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    /// Session identifier chosen by the inviter
    pub session_id: u32,
    /// Application id (1 = object, 2 = file transfer)
    pub app_id: u32,
    /// Total size of the blob the inviter intends to send
    pub total_size: u64,
    /// Opaque context (e.g. file name announced to the peer)
    pub context: String,
    /// Direct-connection candidate, if the sender is listening
    pub direct: Option<DirectCandidate>,
}

impl SessionRequest {
    /// Serialize to key/value body lines.
    #[must_use]
    pub fn to_body(&self) -> String {
        let mut body = format!(
            "SessionID: {}\r\nAppID: {}\r\nSize: {}\r\nContext: {}\r\n",
            self.session_id, self.app_id, self.total_size, self.context
        );
        if let Some(direct) = &self.direct {
            body.push_str(&format!(
                "Direct-Host: {}\r\nDirect-Port: {}\r\nDirect-Nonce: {}\r\n",
                direct.host, direct.port, direct.nonce
            ));
        }
        body
    }

    /// Parse from body lines.
    pub fn from_body(body: &str) -> Result<Self, SipError> {
        let mut session_id = None;
        let mut app_id = None;
        let mut total_size = None;
        let mut context = None;
        let mut host = None;
        let mut port = None;
        let mut nonce = None;
        for line in body.split("\r\n").filter(|l| !l.is_empty()) {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "SessionID" => {
                    session_id = Some(value.parse::<u32>().map_err(|_| SipError::BadField {
                        field: "SessionID",
                        value: value.to_owned(),
                    })?);
                }
                "AppID" => {
                    app_id = Some(value.parse::<u32>().map_err(|_| SipError::BadField {
                        field: "AppID",
                        value: value.to_owned(),
                    })?);
                }
                "Size" => {
                    total_size = Some(value.parse::<u64>().map_err(|_| SipError::BadField {
                        field: "Size",
                        value: value.to_owned(),
                    })?);
                }
                "Context" => context = Some(value.to_owned()),
                "Direct-Host" => host = Some(value.to_owned()),
                "Direct-Port" => {
                    port = Some(value.parse::<u16>().map_err(|_| SipError::BadField {
                        field: "Direct-Port",
                        value: value.to_owned(),
                    })?);
                }
                "Direct-Nonce" => nonce = Some(value.to_owned()),
                _ => {}
            }
        }

        let direct = match (host, port, nonce) {
            (Some(host), Some(port), Some(nonce)) => Some(DirectCandidate { host, port, nonce }),
            _ => None,
        };
        Ok(Self {
            session_id: session_id.ok_or(SipError::MissingHeader("SessionID"))?,
            app_id: app_id.ok_or(SipError::MissingHeader("AppID"))?,
            total_size: total_size.unwrap_or(0),
            context: context.unwrap_or_default(),
            direct,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite() -> SipRequest {
        SipRequest {
            method: SipMethod::Invite,
            headers: SipHeaders {
                to: "bob@example.com".into(),
                from: "alice@example.com".into(),
                branch: "{B2E32C41-0A61-4D95-AA6B-2C9A1D6E0735}".into(),
                cseq: 0,
                call_id: "{0C4D4F5A-9D75-4C2E-8161-2F77306E55A1}".into(),
                content_type: CONTENT_TYPE_SESSION_REQUEST.into(),
            },
            body: SessionRequest {
                session_id: 41,
                app_id: 2,
                total_size: 10_000,
                context: "report.pdf".into(),
                direct: None,
            }
            .to_body(),
        }
    }

    #[test]
    fn request_roundtrip() {
        let req = invite();
        let text = SipMessage::Request(req.clone()).to_text();
        let parsed = SipMessage::parse(&text).unwrap();
        match parsed {
            SipMessage::Request(got) => {
                assert_eq!(got.method, SipMethod::Invite);
                assert_eq!(got.headers, req.headers);
                let body = SessionRequest::from_body(&got.body).unwrap();
                assert_eq!(body.session_id, 41);
                assert_eq!(body.app_id, 2);
            }
            SipMessage::Response(_) => panic!("parsed as response"),
        }
    }

    #[test]
    fn response_roundtrip() {
        let req = invite();
        let resp = SipResponse::answer(&req, SipStatus::Ok, req.body.clone());
        let text = SipMessage::Response(resp.clone()).to_text();
        match SipMessage::parse(&text).unwrap() {
            SipMessage::Response(got) => {
                assert_eq!(got.status, SipStatus::Ok);
                assert_eq!(got.headers.to, "alice@example.com");
                assert_eq!(got.headers.from, "bob@example.com");
                assert_eq!(got.headers.cseq, 1);
                assert_eq!(got.headers.call_id, req.headers.call_id);
            }
            SipMessage::Request(_) => panic!("parsed as request"),
        }
    }

    #[test]
    fn decline_status() {
        let req = invite();
        let resp = SipResponse::answer(&req, SipStatus::Decline, String::new());
        let text = SipMessage::Response(resp).to_text();
        assert!(text.starts_with("SLP/1.0 603 Decline\r\n"));
    }

    #[test]
    fn direct_candidate_roundtrip() {
        let body = SessionRequest {
            session_id: 9,
            app_id: 2,
            total_size: 64,
            context: "x".into(),
            direct: Some(DirectCandidate {
                host: "192.168.1.10".into(),
                port: 6891,
                nonce: "8A3C1F50E6D24B7B9C330F12A45D6601".into(),
            }),
        }
        .to_body();
        let parsed = SessionRequest::from_body(&body).unwrap();
        let direct = parsed.direct.unwrap();
        assert_eq!(direct.port, 6891);
        assert_eq!(direct.host, "192.168.1.10");
    }

    #[test]
    fn missing_headers_rejected() {
        assert_eq!(
            SipMessage::parse("INVITE PEER:x SLP/1.0\r\nTo: <peer:x>\r\n\r\n"),
            Err(SipError::MissingHeader("From"))
        );
    }

    #[test]
    fn unknown_method_rejected() {
        let text = SipMessage::Request(invite()).to_text().replace("INVITE", "NOTIFY");
        assert!(matches!(
            SipMessage::parse(&text),
            Err(SipError::MalformedStartLine(_))
        ));
    }
}
