//! Binary chunk framing for peer-session payloads.
//!
//! Every chunk of a transferred blob travels with a fixed 48-byte header
//! and a 4-byte footer. All multi-byte fields are little-endian; the
//! extended protocol variant (64-bit cumulative ack size) is the only one
//! implemented.

use crate::{PEER_FOOTER_SIZE, PEER_HEADER_SIZE};
use thiserror::Error;

/// Chunk framing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Buffer too short to hold a peer header
    #[error("peer frame too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Declared chunk length disagrees with the bytes on the wire
    #[error("chunk length mismatch: header declares {declared}, {available} available")]
    LengthMismatch {
        /// Length declared in the header
        declared: usize,
        /// Bytes actually present after the header
        available: usize,
    },

    /// Chunk length exceeds the declared total blob size
    #[error("chunk overruns blob: offset {offset} + length {length} > total {total}")]
    BlobOverrun {
        /// Absolute offset of the chunk
        offset: u64,
        /// Declared chunk length
        length: u32,
        /// Declared total blob size
        total: u64,
    },
}

/// Flag bitmap carried in a peer header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkFlags(u32);

impl ChunkFlags {
    /// Acknowledgment of a previously received chunk
    pub const ACK: u32 = 0x0000_0002;
    /// Chunk carries object data (icons, emoticons)
    pub const OBJECT: u32 = 0x0000_0020;
    /// Chunk carries file data
    pub const FILE: u32 = 0x0100_0000;

    /// Create empty flags (control / negotiation traffic)
    #[must_use]
    pub fn new() -> Self {
        Self(0)
    }

    /// Create flags from a raw wire value
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Mark as an acknowledgment
    #[must_use]
    pub fn with_ack(mut self) -> Self {
        self.0 |= Self::ACK;
        self
    }

    /// Mark as object data
    #[must_use]
    pub fn with_object(mut self) -> Self {
        self.0 |= Self::OBJECT;
        self
    }

    /// Mark as file data
    #[must_use]
    pub fn with_file(mut self) -> Self {
        self.0 |= Self::FILE;
        self
    }

    /// Check the acknowledgment bit
    #[must_use]
    pub fn is_ack(self) -> bool {
        self.0 & Self::ACK != 0
    }

    /// Check whether this chunk carries blob data of either kind
    #[must_use]
    pub fn is_data(self) -> bool {
        self.0 & (Self::OBJECT | Self::FILE) != 0
    }

    /// Get the raw wire value
    #[must_use]
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// Fixed-size binary header prefixed to every peer-session payload.
///
/// Control traffic (invites, byes, their acks) uses session id 0 with the
/// negotiation text as the chunk body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerHeader {
    /// Negotiated session this chunk belongs to (0 for control traffic)
    pub session_id: u32,
    /// Running chunk sequence within the session
    pub chunk_id: u32,
    /// Absolute offset of this chunk within the blob
    pub offset: u64,
    /// Total size of the blob being transferred
    pub total_size: u64,
    /// Number of payload bytes in this chunk
    pub length: u32,
    /// Flag bitmap
    pub flags: ChunkFlags,
    /// Chunk id being acknowledged
    pub ack_id: u32,
    /// Secondary ack correlation id
    pub ack_sub_id: u32,
    /// Cumulative number of bytes acknowledged so far
    pub ack_size: u64,
}

impl PeerHeader {
    /// Parse a header from the first [`PEER_HEADER_SIZE`] bytes of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < PEER_HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: PEER_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let u32_at = |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        let u64_at = |i: usize| {
            u64::from_le_bytes([
                data[i],
                data[i + 1],
                data[i + 2],
                data[i + 3],
                data[i + 4],
                data[i + 5],
                data[i + 6],
                data[i + 7],
            ])
        };

        Ok(Self {
            session_id: u32_at(0),
            chunk_id: u32_at(4),
            offset: u64_at(8),
            total_size: u64_at(16),
            length: u32_at(24),
            flags: ChunkFlags::from_raw(u32_at(28)),
            ack_id: u32_at(32),
            ack_sub_id: u32_at(36),
            ack_size: u64_at(40),
        })
    }

    /// Serialize the header into its fixed wire form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; PEER_HEADER_SIZE] {
        let mut buf = [0u8; PEER_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.session_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.chunk_id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_le_bytes());
        buf[16..24].copy_from_slice(&self.total_size.to_le_bytes());
        buf[24..28].copy_from_slice(&self.length.to_le_bytes());
        buf[28..32].copy_from_slice(&self.flags.as_u32().to_le_bytes());
        buf[32..36].copy_from_slice(&self.ack_id.to_le_bytes());
        buf[36..40].copy_from_slice(&self.ack_sub_id.to_le_bytes());
        buf[40..48].copy_from_slice(&self.ack_size.to_le_bytes());
        buf
    }

    /// Build the acknowledgment header for a received chunk.
    ///
    /// `ack_chunk_id` is the sender-side id assigned to the ack itself;
    /// `cumulative` is the receiver's reassembly cursor after writing the
    /// chunk.
    #[must_use]
    pub fn ack(&self, ack_chunk_id: u32, cumulative: u64) -> Self {
        Self {
            session_id: self.session_id,
            chunk_id: ack_chunk_id,
            offset: 0,
            total_size: self.total_size,
            length: 0,
            flags: ChunkFlags::new().with_ack(),
            ack_id: self.chunk_id,
            ack_sub_id: self.ack_id,
            ack_size: cumulative,
        }
    }

    /// Check that the chunk fits inside the declared blob.
    pub fn check_bounds(&self) -> Result<(), FrameError> {
        let end = self.offset.checked_add(u64::from(self.length));
        match end {
            Some(end) if end <= self.total_size => Ok(()),
            _ => Err(FrameError::BlobOverrun {
                offset: self.offset,
                length: self.length,
                total: self.total_size,
            }),
        }
    }
}

/// Trailing footer carrying the application id of the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerFooter {
    /// Application id (1 = object transfer, 2 = file transfer)
    pub value: u32,
}

impl PeerFooter {
    /// Parse a footer from exactly [`PEER_FOOTER_SIZE`] bytes.
    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < PEER_FOOTER_SIZE {
            return Err(FrameError::TooShort {
                expected: PEER_FOOTER_SIZE,
                actual: data.len(),
            });
        }
        Ok(Self {
            value: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
        })
    }

    /// Serialize the footer.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; PEER_FOOTER_SIZE] {
        self.value.to_le_bytes()
    }
}

/// Zero-copy view of a complete framed chunk: header, body, footer.
#[derive(Debug)]
pub struct Chunk<'a> {
    /// Parsed header
    pub header: PeerHeader,
    /// Chunk payload (exactly `header.length` bytes)
    pub body: &'a [u8],
    /// Parsed footer
    pub footer: PeerFooter,
}

impl<'a> Chunk<'a> {
    /// Parse a framed chunk out of a message body.
    ///
    /// Rejects headers whose offset and length overrun (or overflow past)
    /// the declared blob size before the body is ever looked at.
    pub fn parse(data: &'a [u8]) -> Result<Self, FrameError> {
        let header = PeerHeader::parse(data)?;
        header.check_bounds()?;
        let declared = header.length as usize;
        let available = data.len().saturating_sub(PEER_HEADER_SIZE + PEER_FOOTER_SIZE);
        if declared != available {
            return Err(FrameError::LengthMismatch {
                declared,
                available,
            });
        }
        let body = &data[PEER_HEADER_SIZE..PEER_HEADER_SIZE + declared];
        let footer = PeerFooter::parse(&data[PEER_HEADER_SIZE + declared..])?;
        Ok(Self {
            header,
            body,
            footer,
        })
    }

    /// Frame a chunk into a single contiguous buffer.
    #[must_use]
    pub fn build(header: &PeerHeader, body: &[u8], footer: &PeerFooter) -> Vec<u8> {
        debug_assert_eq!(header.length as usize, body.len());
        let mut buf = Vec::with_capacity(PEER_HEADER_SIZE + body.len() + PEER_FOOTER_SIZE);
        buf.extend_from_slice(&header.to_bytes());
        buf.extend_from_slice(body);
        buf.extend_from_slice(&footer.to_bytes());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> PeerHeader {
        PeerHeader {
            session_id: 7,
            chunk_id: 3,
            offset: 2800,
            total_size: 10_000,
            length: 1400,
            flags: ChunkFlags::new().with_file(),
            ack_id: 0,
            ack_sub_id: 0,
            ack_size: 0,
        }
    }

    #[test]
    fn header_roundtrip() {
        let hdr = sample_header();
        let parsed = PeerHeader::parse(&hdr.to_bytes()).unwrap();
        assert_eq!(parsed, hdr);
    }

    #[test]
    fn header_too_short() {
        assert!(matches!(
            PeerHeader::parse(&[0u8; 12]),
            Err(FrameError::TooShort { expected: 48, .. })
        ));
    }

    #[test]
    fn chunk_roundtrip() {
        let mut hdr = sample_header();
        let body = vec![0xAB; 1400];
        hdr.length = body.len() as u32;
        let footer = PeerFooter { value: 2 };

        let framed = Chunk::build(&hdr, &body, &footer);
        let chunk = Chunk::parse(&framed).unwrap();
        assert_eq!(chunk.header, hdr);
        assert_eq!(chunk.body, &body[..]);
        assert_eq!(chunk.footer.value, 2);
    }

    #[test]
    fn chunk_length_mismatch() {
        let mut hdr = sample_header();
        hdr.length = 1400;
        let mut framed = Chunk::build(&hdr, &vec![0u8; 1400], &PeerFooter::default());
        framed.truncate(framed.len() - 100);
        assert!(matches!(
            Chunk::parse(&framed),
            Err(FrameError::LengthMismatch { declared: 1400, .. })
        ));
    }

    #[test]
    fn ack_references_original() {
        let hdr = sample_header();
        let ack = hdr.ack(91, 4200);
        assert!(ack.flags.is_ack());
        assert_eq!(ack.session_id, hdr.session_id);
        assert_eq!(ack.ack_id, hdr.chunk_id);
        assert_eq!(ack.ack_sub_id, hdr.ack_id);
        assert_eq!(ack.ack_size, 4200);
        assert_eq!(ack.length, 0);
    }

    #[test]
    fn bounds_check_rejects_overrun() {
        let mut hdr = sample_header();
        hdr.offset = 9_800;
        hdr.length = 1400;
        assert!(hdr.check_bounds().is_err());
        hdr.length = 200;
        assert!(hdr.check_bounds().is_ok());
    }

    #[test]
    fn bounds_check_rejects_offset_overflow() {
        let mut hdr = sample_header();
        hdr.offset = u64::MAX - 100;
        hdr.length = 1400;
        assert!(matches!(
            hdr.check_bounds(),
            Err(FrameError::BlobOverrun { .. })
        ));
    }

    #[test]
    fn parse_rejects_out_of_bounds_chunk() {
        let body = vec![0u8; 64];
        let mut hdr = sample_header();
        hdr.offset = u64::MAX - 10;
        hdr.length = body.len() as u32;
        let framed = Chunk::build(&hdr, &body, &PeerFooter::default());
        assert!(matches!(
            Chunk::parse(&framed),
            Err(FrameError::BlobOverrun { .. })
        ));
    }
}
