//! Error types for the SaltyRTC wire format.

use std::fmt;

use thiserror::Error;

/// Why a payload field was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldError {
    /// The field is present but its value is not acceptable.
    InvalidFieldValue,
    /// A required field is absent.
    MissingField,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFieldValue => write!(f, "invalid field value"),
            Self::MissingField => write!(f, "missing field"),
        }
    }
}

/// Errors that can occur while framing, encrypting or encoding messages.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame is shorter than header plus one payload byte.
    #[error("frame too short: {0} bytes")]
    FrameTooShort(usize),

    /// Fewer than 24 bytes available for the header.
    #[error("header too short: {0} bytes")]
    HeaderTooShort(usize),

    /// The combined sequence number has reached its terminal value.
    #[error("combined sequence number overflow sentinel reached")]
    OverflowSentinel,

    /// Box open failed (wrong keys, wrong nonce or tampered ciphertext).
    #[error("cannot decrypt payload")]
    CantDecryptPayload,

    /// Box seal failed.
    #[error("cannot encrypt payload")]
    CantEncryptPayload,

    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// A decoded payload carries a field that does not validate.
    #[error("{kind}: field '{field}': {error}")]
    PayloadField {
        /// Message type the field belongs to.
        kind: String,
        /// Field name on the wire.
        field: &'static str,
        /// What is wrong with it.
        error: FieldError,
    },

    /// An encrypted message was packed without the peer's public key.
    #[error("client key required for encrypted message")]
    MissingClientKey,

    /// Key material has the wrong length or encoding.
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

impl CodecError {
    /// Shorthand for an invalid field value error.
    pub fn invalid_field(kind: &str, field: &'static str) -> Self {
        Self::PayloadField {
            kind: kind.to_string(),
            field,
            error: FieldError::InvalidFieldValue,
        }
    }
}

/// Result type alias for codec operations.
pub type CodecResult<T> = std::result::Result<T, CodecError>;
