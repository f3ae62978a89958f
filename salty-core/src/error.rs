//! Protocol errors and their close codes.

use std::fmt;

use salty_types::{Address, CloseCode, CodecError, CombinedSequenceNumber};
use thiserror::Error;

/// Direction of a per-connection sequence counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to server.
    Inbound,
    /// Server to client.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => write!(f, "inbound"),
            Self::Outbound => write!(f, "outbound"),
        }
    }
}

/// A violation that ends one connection and nothing else.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame, crypto or payload failure.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Relay between these addresses is not permitted for this client.
    #[error("message from {from} to {destination} not allowed")]
    NotAllowedMessage {
        /// Claimed source.
        from: Address,
        /// Requested destination.
        destination: Address,
    },

    /// Frame source does not match the client's assigned address.
    #[error("identities do not match: expected {expected}, got {actual}")]
    NotMatchedIdentities {
        /// Client's address.
        expected: Address,
        /// Source in the frame.
        actual: Address,
    },

    /// First cookie from the client equals the server's own cookie.
    #[error("client reflected the server cookie")]
    CookieReflected,

    /// Cookie differs from the one the client used before.
    #[error("cookie changed within the connection")]
    CookieMismatch,

    /// `client-auth` did not echo the server cookie.
    #[error("client did not echo the server cookie")]
    CookieNotEchoed,

    /// First CSN from the client has a non-zero overflow number.
    #[error("initial overflow number must be zero")]
    InvalidOverflowNumber,

    /// CSN is not the one expected next.
    #[error("unexpected csn: expected {expected}, got {actual}")]
    NotExpectedCsn {
        /// Expected value.
        expected: CombinedSequenceNumber,
        /// Received value.
        actual: CombinedSequenceNumber,
    },

    /// The sequence counter for this direction is exhausted.
    #[error("{0} csn overflow sentinel reached, cannot exchange any more messages")]
    OverflowSentinel(Direction),

    /// Message is not acceptable in the current handshake state.
    #[error("unexpected {kind} in state {state}")]
    UnexpectedMessage {
        /// Message `type`.
        kind: &'static str,
        /// Handshake state at the time.
        state: String,
    },

    /// Operation requires an authenticated client.
    #[error("client is not authenticated")]
    NotAuthenticated,

    /// Only an initiator may do this.
    #[error("only the initiator may send {0}")]
    NotInitiator(&'static str),

    /// No subprotocol shared, or the first shared one differs from the
    /// one negotiated at upgrade.
    #[error("subprotocol mismatch")]
    SubprotocolMismatch,

    /// `your_key` names a key the server does not have.
    #[error("requested permanent key is unknown")]
    InvalidPermanentKey,

    /// The server has no permanent key to authenticate with.
    #[error("no permanent key configured")]
    NoPermanentKey,

    /// Every responder slot of the path is taken.
    #[error("path is full")]
    PathFull,

    /// A responder left but the path has no initiator to tell.
    #[error("no initiator on path to notify")]
    NoInitiator,
}

impl ProtocolError {
    /// Close code to end the connection with.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::PathFull => CloseCode::PathFull,
            Self::InvalidPermanentKey | Self::NoPermanentKey => CloseCode::InvalidKey,
            Self::SubprotocolMismatch => CloseCode::SubprotocolError,
            Self::Codec(CodecError::CantEncryptPayload | CodecError::Serialization(_)) => {
                CloseCode::InternalError
            }
            _ => CloseCode::ProtocolError,
        }
    }
}

/// Result type alias for protocol operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_codes() {
        assert_eq!(ProtocolError::PathFull.close_code(), CloseCode::PathFull);
        assert_eq!(
            ProtocolError::InvalidPermanentKey.close_code(),
            CloseCode::InvalidKey
        );
        assert_eq!(
            ProtocolError::SubprotocolMismatch.close_code(),
            CloseCode::SubprotocolError
        );
        assert_eq!(
            ProtocolError::Codec(CodecError::CantEncryptPayload).close_code(),
            CloseCode::InternalError
        );
        assert_eq!(
            ProtocolError::Codec(CodecError::CantDecryptPayload).close_code(),
            CloseCode::ProtocolError
        );
        assert_eq!(
            ProtocolError::CookieMismatch.close_code(),
            CloseCode::ProtocolError
        );
    }

    #[test]
    fn not_allowed_message_names_both_addresses() {
        let err = ProtocolError::NotAllowedMessage {
            from: Address::new(0x02),
            destination: Address::new(0x03),
        };
        assert_eq!(err.to_string(), "message from 0x02 to 0x03 not allowed");
        assert!(std::error::Error::source(&err).is_none());
    }

    #[test]
    fn sentinel_message_names_direction() {
        let err = ProtocolError::OverflowSentinel(Direction::Outbound);
        assert!(err.to_string().starts_with("outbound csn overflow sentinel"));
    }
}
