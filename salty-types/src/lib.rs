//! # salty-types
//!
//! Wire format types for the SaltyRTC signalling relay.
//!
//! This crate provides the vocabulary shared by the relay core and server:
//! - [`Address`], [`AddressType`], [`ClientType`] - Path addressing
//! - [`CombinedSequenceNumber`], [`Cookie`] - Replay protection
//! - [`Header`], [`Frame`] - 24-byte header framing and nonce derivation
//! - [`KeyPair`] and box helpers - NaCl box encryption
//! - [`Message`] and its variants - MessagePack payload schema
//! - [`CloseCode`] - WebSocket close codes
//! - [`CodecError`] - Error types
//!
//! ## Frame
//!
//! ```text
//! cookie(16) | src(1) | dest(1) | csn(6) | payload
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod address;
mod close;
mod cookie;
mod csn;
mod error;
mod frame;
mod messages;

pub mod crypto;

pub use address::{Address, AddressType, ClientType};
pub use close::CloseCode;
pub use cookie::{Cookie, COOKIE_SIZE};
pub use crypto::{KeyPair, PublicKey, SecretKey, KEY_SIZE};
pub use csn::{CombinedSequenceNumber, CSN_SIZE};
pub use error::{CodecError, CodecResult, FieldError};
pub use frame::{write_frame, Frame, Header, Nonce, HEADER_SIZE, MIN_FRAME_SIZE};
pub use messages::{
    decode_payload, encode_payload, payload_kind, ClientAuth, ClientHello, Disconnected,
    DropResponder, EncodingOpts, MarshalPayload, Message, NewInitiator, NewResponder, RawMessage,
    SendError, ServerAuth, ServerAuthTarget, ServerHello, SUBPROTOCOL_V1,
};
