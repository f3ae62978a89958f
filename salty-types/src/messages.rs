//! Signalling messages and their MessagePack payload schema.
//!
//! Every payload is a MessagePack map with a `type` string. Hello messages
//! travel in plain text, everything else is boxed with the session keys.
//! Relayed frames ([`RawMessage`]) are never decoded.

use serde::de::{self, DeserializeOwned, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::address::Address;
use crate::close::CloseCode;
use crate::cookie::Cookie;
use crate::crypto::{encrypt_payload, public_key_from_slice, sign_keys, KeyPair, PublicKey};
use crate::error::{CodecError, CodecResult};
use crate::frame::{Header, Nonce};

/// The only subprotocol this relay speaks.
pub const SUBPROTOCOL_V1: &str = "v1.saltyrtc.org";

/// `type` of [`ServerHello`].
pub const TYPE_SERVER_HELLO: &str = "server-hello";
/// `type` of [`ClientHello`].
pub const TYPE_CLIENT_HELLO: &str = "client-hello";
/// `type` of [`ClientAuth`].
pub const TYPE_CLIENT_AUTH: &str = "client-auth";
/// `type` of [`ServerAuth`].
pub const TYPE_SERVER_AUTH: &str = "server-auth";
/// `type` of [`NewInitiator`].
pub const TYPE_NEW_INITIATOR: &str = "new-initiator";
/// `type` of [`NewResponder`].
pub const TYPE_NEW_RESPONDER: &str = "new-responder";
/// `type` of [`DropResponder`].
pub const TYPE_DROP_RESPONDER: &str = "drop-responder";
/// `type` of [`SendError`].
pub const TYPE_SEND_ERROR: &str = "send-error";
/// `type` of [`Disconnected`].
pub const TYPE_DISCONNECTED: &str = "disconnected";

/// Keys and nonce used to build one outgoing payload.
///
/// Messages never hold keys themselves; the caller packing a frame
/// supplies them. On the server `peer_key` is the client's public key and
/// `local_session` the per-connection server key pair.
#[derive(Debug, Clone, Copy)]
pub struct EncodingOpts<'a> {
    /// Public key of the receiving party.
    pub peer_key: Option<&'a PublicKey>,
    /// Sender's session key pair.
    pub local_session: &'a KeyPair,
    /// Server permanent key pair, used to sign keys in `server-auth`.
    pub server_permanent: Option<&'a KeyPair>,
    /// Nonce of the frame (its header bytes).
    pub nonce: Nonce,
}

/// Anything that can produce the payload bytes of a frame.
pub trait MarshalPayload {
    /// Encode (and encrypt, where the message type requires it).
    fn marshal_payload(&self, opts: &EncodingOpts<'_>) -> CodecResult<Vec<u8>>;
}

/// `server-hello`: the server's session public key. Sent in plain text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    /// Server session public key.
    pub key: PublicKey,
}

/// `client-hello`: a responder's permanent public key. Sent in plain text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    /// Client public key.
    pub key: PublicKey,
}

/// `client-auth`: cookie echo, subprotocols and optional server key choice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAuth {
    /// The server's cookie, echoed back.
    pub your_cookie: Cookie,
    /// Subprotocols offered by the client, in preference order.
    pub subprotocols: Vec<String>,
    /// Requested WebSocket ping interval in seconds (0 = none).
    pub ping_interval: u32,
    /// Server permanent public key the client expects.
    pub your_key: Option<PublicKey>,
}

/// Role-dependent part of [`ServerAuth`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAuthTarget {
    /// Sent to an initiator: the responders already on the path.
    Initiator {
        /// Authenticated responder addresses.
        responders: Vec<Address>,
    },
    /// Sent to a responder: whether an initiator is on the path.
    Responder {
        /// True if an initiator is authenticated.
        initiator_connected: bool,
    },
}

/// `server-auth`: the server's answer to a successful `client-auth`.
///
/// `signed_keys` is added while marshalling whenever a permanent key is
/// supplied in the [`EncodingOpts`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAuth {
    /// The client's cookie, echoed back.
    pub your_cookie: Cookie,
    /// Initiator or responder shaped content.
    pub target: ServerAuthTarget,
}

/// `new-initiator`: tells responders that an initiator authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NewInitiator;

/// `new-responder`: tells the initiator that a responder authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewResponder {
    /// The responder's address.
    pub id: Address,
}

/// `drop-responder`: initiator asks the server to drop a responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropResponder {
    /// Responder to drop.
    pub id: Address,
    /// Close code for the dropped connection.
    pub reason: Option<CloseCode>,
}

/// `send-error`: a relayed frame could not be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendError {
    /// Source, destination and CSN of the failed frame.
    pub id: [u8; 8],
}

/// `disconnected`: a peer on the path went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected {
    /// Address of the peer that left.
    pub id: Address,
}

/// A frame addressed to another client. Relayed byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Parsed header of the frame.
    pub header: Header,
    /// The complete frame, header included.
    pub data: Vec<u8>,
}

/// Any message the relay handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `server-hello`
    ServerHello(ServerHello),
    /// `client-hello`
    ClientHello(ClientHello),
    /// `client-auth`
    ClientAuth(ClientAuth),
    /// `server-auth`
    ServerAuth(ServerAuth),
    /// `new-initiator`
    NewInitiator(NewInitiator),
    /// `new-responder`
    NewResponder(NewResponder),
    /// `drop-responder`
    DropResponder(DropResponder),
    /// `send-error`
    SendError(SendError),
    /// `disconnected`
    Disconnected(Disconnected),
    /// Relayed frame.
    Raw(RawMessage),
}

impl Message {
    /// Wire `type` of this message (`"raw"` for relayed frames).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ServerHello(_) => TYPE_SERVER_HELLO,
            Self::ClientHello(_) => TYPE_CLIENT_HELLO,
            Self::ClientAuth(_) => TYPE_CLIENT_AUTH,
            Self::ServerAuth(_) => TYPE_SERVER_AUTH,
            Self::NewInitiator(_) => TYPE_NEW_INITIATOR,
            Self::NewResponder(_) => TYPE_NEW_RESPONDER,
            Self::DropResponder(_) => TYPE_DROP_RESPONDER,
            Self::SendError(_) => TYPE_SEND_ERROR,
            Self::Disconnected(_) => TYPE_DISCONNECTED,
            Self::Raw(_) => "raw",
        }
    }

    /// Decode a plain-text payload, dispatching on its `type` field.
    ///
    /// Only types a client may legitimately send towards the server are
    /// accepted here; anything else is a `type` field error.
    pub fn decode(plain: &[u8]) -> CodecResult<Self> {
        let tagged: TypeTag = decode_payload(plain)?;
        match tagged.kind.as_str() {
            TYPE_SERVER_HELLO => ServerHello::decode(plain).map(Self::ServerHello),
            TYPE_CLIENT_HELLO => ClientHello::decode(plain).map(Self::ClientHello),
            TYPE_CLIENT_AUTH => ClientAuth::decode(plain).map(Self::ClientAuth),
            TYPE_NEW_INITIATOR => NewInitiator::decode(plain).map(Self::NewInitiator),
            TYPE_NEW_RESPONDER => NewResponder::decode(plain).map(Self::NewResponder),
            TYPE_DROP_RESPONDER => DropResponder::decode(plain).map(Self::DropResponder),
            other => Err(CodecError::invalid_field(other, "type")),
        }
    }
}

impl MarshalPayload for Message {
    fn marshal_payload(&self, opts: &EncodingOpts<'_>) -> CodecResult<Vec<u8>> {
        match self {
            Self::ServerHello(m) => m.marshal_payload(opts),
            Self::ClientHello(m) => m.marshal_payload(opts),
            Self::ClientAuth(m) => m.marshal_payload(opts),
            Self::ServerAuth(m) => m.marshal_payload(opts),
            Self::NewInitiator(m) => m.marshal_payload(opts),
            Self::NewResponder(m) => m.marshal_payload(opts),
            Self::DropResponder(m) => m.marshal_payload(opts),
            Self::SendError(m) => m.marshal_payload(opts),
            Self::Disconnected(m) => m.marshal_payload(opts),
            Self::Raw(m) => m.marshal_payload(opts),
        }
    }
}

impl ServerHello {
    /// Decode from plain MessagePack.
    pub fn decode(plain: &[u8]) -> CodecResult<Self> {
        let wire: KeyWire = decode_typed(plain, TYPE_SERVER_HELLO)?;
        Ok(Self {
            key: parse_key(TYPE_SERVER_HELLO, "key", &wire.key.0)?,
        })
    }
}

impl MarshalPayload for ServerHello {
    fn marshal_payload(&self, _opts: &EncodingOpts<'_>) -> CodecResult<Vec<u8>> {
        encode_payload(&KeyWire {
            kind: TYPE_SERVER_HELLO.into(),
            key: Bin(self.key.as_bytes().to_vec()),
        })
    }
}

impl ClientHello {
    /// Decode from plain MessagePack.
    pub fn decode(plain: &[u8]) -> CodecResult<Self> {
        let wire: KeyWire = decode_typed(plain, TYPE_CLIENT_HELLO)?;
        Ok(Self {
            key: parse_key(TYPE_CLIENT_HELLO, "key", &wire.key.0)?,
        })
    }
}

impl MarshalPayload for ClientHello {
    fn marshal_payload(&self, _opts: &EncodingOpts<'_>) -> CodecResult<Vec<u8>> {
        encode_payload(&KeyWire {
            kind: TYPE_CLIENT_HELLO.into(),
            key: Bin(self.key.as_bytes().to_vec()),
        })
    }
}

impl ClientAuth {
    /// Decode from decrypted MessagePack.
    pub fn decode(plain: &[u8]) -> CodecResult<Self> {
        let wire: ClientAuthWire = decode_typed(plain, TYPE_CLIENT_AUTH)?;
        let your_cookie = Cookie::from_slice(&wire.your_cookie.0)
            .ok_or_else(|| CodecError::invalid_field(TYPE_CLIENT_AUTH, "your_cookie"))?;
        let your_key = wire
            .your_key
            .map(|key| parse_key(TYPE_CLIENT_AUTH, "your_key", &key.0))
            .transpose()?;
        Ok(Self {
            your_cookie,
            subprotocols: wire.subprotocols,
            ping_interval: wire.ping_interval,
            your_key,
        })
    }
}

impl MarshalPayload for ClientAuth {
    fn marshal_payload(&self, opts: &EncodingOpts<'_>) -> CodecResult<Vec<u8>> {
        let plain = encode_payload(&ClientAuthWire {
            kind: TYPE_CLIENT_AUTH.into(),
            your_cookie: Bin(self.your_cookie.as_bytes().to_vec()),
            subprotocols: self.subprotocols.clone(),
            ping_interval: self.ping_interval,
            your_key: self.your_key.as_ref().map(|k| Bin(k.as_bytes().to_vec())),
        })?;
        seal(opts, &plain)
    }
}

impl ServerAuth {
    /// Decode from decrypted MessagePack, returning the `signed_keys` box
    /// alongside when the server included one.
    pub fn decode(plain: &[u8]) -> CodecResult<(Self, Option<Vec<u8>>)> {
        let wire: ServerAuthWire = decode_typed(plain, TYPE_SERVER_AUTH)?;
        let your_cookie = Cookie::from_slice(&wire.your_cookie.0)
            .ok_or_else(|| CodecError::invalid_field(TYPE_SERVER_AUTH, "your_cookie"))?;
        let target = match (wire.responders, wire.initiator_connected) {
            (Some(ids), None) => ServerAuthTarget::Initiator {
                responders: ids.into_iter().map(Address::new).collect(),
            },
            (None, Some(initiator_connected)) => {
                ServerAuthTarget::Responder { initiator_connected }
            }
            _ => return Err(CodecError::invalid_field(TYPE_SERVER_AUTH, "responders")),
        };
        Ok((Self { your_cookie, target }, wire.signed_keys.map(|b| b.0)))
    }
}

impl MarshalPayload for ServerAuth {
    fn marshal_payload(&self, opts: &EncodingOpts<'_>) -> CodecResult<Vec<u8>> {
        let signed_keys = match opts.server_permanent {
            Some(permanent) => {
                let client_key = opts.peer_key.ok_or(CodecError::MissingClientKey)?;
                Some(Bin(sign_keys(
                    client_key,
                    opts.local_session.public_key(),
                    permanent.secret_key(),
                    &opts.nonce,
                )?))
            }
            None => None,
        };
        let (responders, initiator_connected) = match &self.target {
            ServerAuthTarget::Initiator { responders } => {
                (Some(responders.iter().map(|a| a.value()).collect()), None)
            }
            ServerAuthTarget::Responder {
                initiator_connected,
            } => (None, Some(*initiator_connected)),
        };
        let plain = encode_payload(&ServerAuthWire {
            kind: TYPE_SERVER_AUTH.into(),
            your_cookie: Bin(self.your_cookie.as_bytes().to_vec()),
            signed_keys,
            initiator_connected,
            responders,
        })?;
        seal(opts, &plain)
    }
}

impl NewInitiator {
    /// Decode from decrypted MessagePack.
    pub fn decode(plain: &[u8]) -> CodecResult<Self> {
        decode_typed::<TypeTag>(plain, TYPE_NEW_INITIATOR)?;
        Ok(Self)
    }
}

impl MarshalPayload for NewInitiator {
    fn marshal_payload(&self, opts: &EncodingOpts<'_>) -> CodecResult<Vec<u8>> {
        let plain = encode_payload(&TypeTag {
            kind: TYPE_NEW_INITIATOR.into(),
        })?;
        seal(opts, &plain)
    }
}

impl NewResponder {
    /// Decode from decrypted MessagePack.
    pub fn decode(plain: &[u8]) -> CodecResult<Self> {
        let wire: IdWire = decode_typed(plain, TYPE_NEW_RESPONDER)?;
        Ok(Self {
            id: parse_responder(TYPE_NEW_RESPONDER, wire.id)?,
        })
    }
}

impl MarshalPayload for NewResponder {
    fn marshal_payload(&self, opts: &EncodingOpts<'_>) -> CodecResult<Vec<u8>> {
        let plain = encode_payload(&IdWire {
            kind: TYPE_NEW_RESPONDER.into(),
            id: self.id.value(),
        })?;
        seal(opts, &plain)
    }
}

impl DropResponder {
    /// Decode from decrypted MessagePack.
    ///
    /// The target must be a responder address and the reason, if any, one
    /// of the codes an initiator may use.
    pub fn decode(plain: &[u8]) -> CodecResult<Self> {
        let wire: DropResponderWire = decode_typed(plain, TYPE_DROP_RESPONDER)?;
        let id = parse_responder(TYPE_DROP_RESPONDER, wire.id)?;
        let reason = wire
            .reason
            .map(|code| {
                CloseCode::from_code(code)
                    .filter(|c| c.is_valid_drop_reason())
                    .ok_or_else(|| CodecError::invalid_field(TYPE_DROP_RESPONDER, "reason"))
            })
            .transpose()?;
        Ok(Self { id, reason })
    }
}

impl MarshalPayload for DropResponder {
    fn marshal_payload(&self, opts: &EncodingOpts<'_>) -> CodecResult<Vec<u8>> {
        let plain = encode_payload(&DropResponderWire {
            kind: TYPE_DROP_RESPONDER.into(),
            id: self.id.value(),
            reason: self.reason.map(CloseCode::code),
        })?;
        seal(opts, &plain)
    }
}

impl SendError {
    /// Decode from decrypted MessagePack.
    pub fn decode(plain: &[u8]) -> CodecResult<Self> {
        let wire: SendErrorWire = decode_typed(plain, TYPE_SEND_ERROR)?;
        let id = <[u8; 8]>::try_from(wire.id.0.as_slice())
            .map_err(|_| CodecError::invalid_field(TYPE_SEND_ERROR, "id"))?;
        Ok(Self { id })
    }
}

impl MarshalPayload for SendError {
    fn marshal_payload(&self, opts: &EncodingOpts<'_>) -> CodecResult<Vec<u8>> {
        let plain = encode_payload(&SendErrorWire {
            kind: TYPE_SEND_ERROR.into(),
            id: Bin(self.id.to_vec()),
        })?;
        seal(opts, &plain)
    }
}

impl Disconnected {
    /// Decode from decrypted MessagePack.
    pub fn decode(plain: &[u8]) -> CodecResult<Self> {
        let wire: IdWire = decode_typed(plain, TYPE_DISCONNECTED)?;
        if wire.id == Address::SERVER.value() {
            return Err(CodecError::invalid_field(TYPE_DISCONNECTED, "id"));
        }
        Ok(Self {
            id: Address::new(wire.id),
        })
    }
}

impl MarshalPayload for Disconnected {
    fn marshal_payload(&self, opts: &EncodingOpts<'_>) -> CodecResult<Vec<u8>> {
        let plain = encode_payload(&IdWire {
            kind: TYPE_DISCONNECTED.into(),
            id: self.id.value(),
        })?;
        seal(opts, &plain)
    }
}

impl MarshalPayload for RawMessage {
    fn marshal_payload(&self, _opts: &EncodingOpts<'_>) -> CodecResult<Vec<u8>> {
        Ok(self.data.clone())
    }
}

/// Read just the `type` field of a plain payload.
pub fn payload_kind(plain: &[u8]) -> CodecResult<String> {
    decode_payload::<TypeTag>(plain).map(|tagged| tagged.kind)
}

/// Decode any payload struct from MessagePack.
pub fn decode_payload<T: DeserializeOwned>(plain: &[u8]) -> CodecResult<T> {
    rmp_serde::from_slice(plain).map_err(CodecError::Deserialization)
}

/// Encode a payload struct as a MessagePack map with named fields.
pub fn encode_payload<T: Serialize>(wire: &T) -> CodecResult<Vec<u8>> {
    rmp_serde::to_vec_named(wire).map_err(CodecError::Serialization)
}

fn decode_typed<T: DeserializeOwned + Typed>(plain: &[u8], expected: &str) -> CodecResult<T> {
    let wire: T = decode_payload(plain)?;
    if wire.kind() != expected {
        return Err(CodecError::invalid_field(wire.kind(), "type"));
    }
    Ok(wire)
}

fn seal(opts: &EncodingOpts<'_>, plain: &[u8]) -> CodecResult<Vec<u8>> {
    let peer = opts.peer_key.ok_or(CodecError::MissingClientKey)?;
    encrypt_payload(peer, opts.local_session.secret_key(), &opts.nonce, plain)
}

fn parse_key(kind: &str, field: &'static str, bytes: &[u8]) -> CodecResult<PublicKey> {
    public_key_from_slice(bytes).ok_or_else(|| CodecError::invalid_field(kind, field))
}

fn parse_responder(kind: &str, id: u8) -> CodecResult<Address> {
    let address = Address::new(id);
    if !address.is_valid_responder() {
        return Err(CodecError::invalid_field(kind, "id"));
    }
    Ok(address)
}

trait Typed {
    fn kind(&self) -> &str;
}

macro_rules! typed {
    ($($wire:ty),*) => {
        $(impl Typed for $wire {
            fn kind(&self) -> &str {
                &self.kind
            }
        })*
    };
}

typed!(
    TypeTag,
    KeyWire,
    ClientAuthWire,
    ServerAuthWire,
    IdWire,
    DropResponderWire,
    SendErrorWire
);

#[derive(Serialize, Deserialize)]
struct TypeTag {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Serialize, Deserialize)]
struct KeyWire {
    #[serde(rename = "type")]
    kind: String,
    key: Bin,
}

#[derive(Serialize, Deserialize)]
struct ClientAuthWire {
    #[serde(rename = "type")]
    kind: String,
    your_cookie: Bin,
    subprotocols: Vec<String>,
    ping_interval: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    your_key: Option<Bin>,
}

#[derive(Serialize, Deserialize)]
struct ServerAuthWire {
    #[serde(rename = "type")]
    kind: String,
    your_cookie: Bin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signed_keys: Option<Bin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    initiator_connected: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    responders: Option<Vec<u8>>,
}

#[derive(Serialize, Deserialize)]
struct IdWire {
    #[serde(rename = "type")]
    kind: String,
    id: u8,
}

#[derive(Serialize, Deserialize)]
struct DropResponderWire {
    #[serde(rename = "type")]
    kind: String,
    id: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<u16>,
}

#[derive(Serialize, Deserialize)]
struct SendErrorWire {
    #[serde(rename = "type")]
    kind: String,
    id: Bin,
}

/// Byte string that encodes as MessagePack `bin` instead of an int array.
struct Bin(Vec<u8>);

impl Serialize for Bin {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Bin {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_byte_buf(BinVisitor).map(Bin)
    }
}

struct BinVisitor;

impl<'de> Visitor<'de> for BinVisitor {
    type Value = Vec<u8>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a byte string")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
        Ok(v.to_vec())
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
        Ok(v)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(byte) = seq.next_element::<u8>()? {
            out.push(byte);
        }
        Ok(out)
    }
}
