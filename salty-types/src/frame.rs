//! Frame header layout and nonce derivation.
//!
//! ```text
//! +----------------+-----+------+-----------+----------------------+
//! | cookie (16)    | src | dest | csn (6)   | payload (>= 1)       |
//! +----------------+-----+------+-----------+----------------------+
//! ```
//!
//! The 24 header bytes double as the box nonce for the payload, which ties
//! replay protection (cookie + CSN) to the encryption itself.

use crate::address::Address;
use crate::cookie::{Cookie, COOKIE_SIZE};
use crate::csn::{CombinedSequenceNumber, CSN_SIZE};
use crate::error::{CodecError, CodecResult};

/// Header size in bytes.
pub const HEADER_SIZE: usize = 24;

/// Smallest valid frame: header plus one payload byte.
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + 1;

/// Box nonce (identical to the header bytes).
pub type Nonce = [u8; HEADER_SIZE];

const SRC_OFFSET: usize = COOKIE_SIZE;
const DEST_OFFSET: usize = COOKIE_SIZE + 1;
const CSN_OFFSET: usize = COOKIE_SIZE + 2;

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Sender's cookie.
    pub cookie: Cookie,
    /// Source address.
    pub source: Address,
    /// Destination address.
    pub destination: Address,
    /// Sender's sequence number for this direction.
    pub csn: CombinedSequenceNumber,
}

impl Header {
    /// Parse a header from the front of `bytes`.
    pub fn parse(bytes: &[u8]) -> CodecResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(CodecError::HeaderTooShort(bytes.len()));
        }
        let mut cookie = [0u8; COOKIE_SIZE];
        cookie.copy_from_slice(&bytes[..COOKIE_SIZE]);
        let mut csn = [0u8; CSN_SIZE];
        csn.copy_from_slice(&bytes[CSN_OFFSET..HEADER_SIZE]);
        Ok(Self {
            cookie: Cookie::new(cookie),
            source: Address::new(bytes[SRC_OFFSET]),
            destination: Address::new(bytes[DEST_OFFSET]),
            csn: CombinedSequenceNumber::from_bytes(csn),
        })
    }

    /// Serialize for sending. Fails once the CSN is at its sentinel.
    pub fn to_bytes(&self) -> CodecResult<[u8; HEADER_SIZE]> {
        let csn = self.csn.as_bytes()?;
        let mut out = self.layout();
        out[CSN_OFFSET..].copy_from_slice(&csn);
        Ok(out)
    }

    /// Nonce for this header's payload.
    ///
    /// Uses the raw layout even for a sentinel CSN, so inbound frames can
    /// always be checked against the bytes the peer actually sent.
    pub fn make_nonce(&self) -> Nonce {
        let mut out = self.layout();
        out[CSN_OFFSET..CSN_OFFSET + 2].copy_from_slice(&self.csn.overflow_number().to_be_bytes());
        out[CSN_OFFSET + 2..].copy_from_slice(&self.csn.sequence_number().to_be_bytes());
        out
    }

    /// The `id` of a frame as used by `send-error`: src, dest and csn.
    pub fn message_id(&self) -> [u8; 8] {
        let nonce = self.make_nonce();
        let mut id = [0u8; 8];
        id.copy_from_slice(&nonce[SRC_OFFSET..]);
        id
    }

    fn layout(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..COOKIE_SIZE].copy_from_slice(self.cookie.as_bytes());
        out[SRC_OFFSET] = self.source.value();
        out[DEST_OFFSET] = self.destination.value();
        out
    }
}

/// A received frame split into header and payload.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    /// Parsed header.
    pub header: Header,
    /// Payload bytes (ciphertext or plain MessagePack).
    pub payload: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Split raw bytes into a frame.
    pub fn parse(data: &'a [u8]) -> CodecResult<Self> {
        if data.len() < MIN_FRAME_SIZE {
            return Err(CodecError::FrameTooShort(data.len()));
        }
        Ok(Self {
            header: Header::parse(data)?,
            payload: &data[HEADER_SIZE..],
        })
    }
}

/// Concatenate a header and a payload into a frame.
pub fn write_frame(header: &Header, payload: &[u8]) -> CodecResult<Vec<u8>> {
    let head = header.to_bytes()?;
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&head);
    out.extend_from_slice(payload);
    Ok(out)
}
