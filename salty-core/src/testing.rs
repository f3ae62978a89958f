//! Scripted SaltyRTC client for tests.
//!
//! [`TestPeer`] builds the frames a real client would send and checks
//! what the server sends back: server cookie stability, CSN continuity
//! and decryption. Methods panic on misuse; this is test tooling.

use salty_types::crypto::decrypt_payload;
use salty_types::{
    payload_kind, write_frame, Address, ClientAuth, ClientHello, CloseCode, CodecError,
    CodecResult, CombinedSequenceNumber, Cookie, Disconnected, DropResponder, EncodingOpts, Frame,
    Header, KeyPair, MarshalPayload, NewInitiator, NewResponder, Nonce, PublicKey, SendError,
    ServerAuth, ServerHello, KEY_SIZE,
};

/// What a peer got from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// `server-hello`
    ServerHello(ServerHello),
    /// `server-auth`, with the nonce of its frame.
    ServerAuth {
        /// Decoded message.
        auth: ServerAuth,
        /// `signed_keys` box, if present.
        signed_keys: Option<Vec<u8>>,
        /// Nonce of the frame.
        nonce: Nonce,
    },
    /// `new-initiator`
    NewInitiator,
    /// `new-responder`
    NewResponder(Address),
    /// `disconnected`
    Disconnected(Address),
    /// `send-error` with the failed message id.
    SendError([u8; 8]),
    /// A frame relayed from another client, as received.
    Relayed(Vec<u8>),
}

/// A scripted client.
pub struct TestPeer {
    keys: KeyPair,
    cookie: Cookie,
    csn: CombinedSequenceNumber,
    id: Address,
    server_cookie: Option<Cookie>,
    server_csn: Option<CombinedSequenceNumber>,
    server_session: Option<PublicKey>,
}

impl Default for TestPeer {
    fn default() -> Self {
        Self::new()
    }
}

impl TestPeer {
    /// Peer with a fresh permanent key.
    pub fn new() -> Self {
        Self::with_keys(KeyPair::generate())
    }

    /// Peer with the given permanent key. An initiator's key names its path.
    pub fn with_keys(keys: KeyPair) -> Self {
        Self {
            keys,
            cookie: Cookie::random(),
            csn: CombinedSequenceNumber::random(),
            id: Address::SERVER,
            server_cookie: None,
            server_csn: None,
            server_session: None,
        }
    }

    /// Permanent key pair.
    pub fn keys(&self) -> &KeyPair {
        &self.keys
    }

    /// Permanent public key.
    pub fn public_key(&self) -> &PublicKey {
        self.keys.public_key()
    }

    /// Lowercase hex of the public key, as used in the URL path.
    pub fn path_hex(&self) -> String {
        self.keys.public_hex()
    }

    /// Address assigned by `server-auth` (`0x00` before).
    pub fn id(&self) -> Address {
        self.id
    }

    /// Cookie this peer sends.
    pub fn cookie(&self) -> Cookie {
        self.cookie
    }

    /// Cookie the server uses, once seen.
    pub fn server_cookie(&self) -> Option<Cookie> {
        self.server_cookie
    }

    /// Override the source address of later frames.
    pub fn set_id(&mut self, id: Address) {
        self.id = id;
    }

    /// Override the cookie of later frames.
    pub fn set_cookie(&mut self, cookie: Cookie) {
        self.cookie = cookie;
    }

    /// Override the next outgoing CSN.
    pub fn set_csn(&mut self, csn: CombinedSequenceNumber) {
        self.csn = csn;
    }

    /// Override the server cookie echoed in `client-auth`.
    pub fn set_server_cookie(&mut self, cookie: Cookie) {
        self.server_cookie = Some(cookie);
    }

    /// Frame `payload` to `destination` with the next header.
    pub fn frame(&mut self, destination: Address, payload: &[u8]) -> Vec<u8> {
        let header = self.next_header(destination);
        write_frame(&header, payload).expect("csn exhausted")
    }

    /// Plain-text `client-hello`.
    pub fn client_hello(&mut self) -> Vec<u8> {
        let hello = ClientHello {
            key: self.keys.public_key().clone(),
        };
        let header = self.next_header(Address::SERVER);
        let payload = hello
            .marshal_payload(&EncodingOpts {
                peer_key: None,
                local_session: &self.keys,
                server_permanent: None,
                nonce: header.make_nonce(),
            })
            .expect("encode client-hello");
        write_frame(&header, &payload).expect("csn exhausted")
    }

    /// `client-auth` boxed for the server session key.
    pub fn client_auth(
        &mut self,
        subprotocols: &[&str],
        ping_interval: u32,
        your_key: Option<PublicKey>,
    ) -> Vec<u8> {
        let auth = ClientAuth {
            your_cookie: self.server_cookie.expect("no server-hello yet"),
            subprotocols: subprotocols.iter().map(|p| p.to_string()).collect(),
            ping_interval,
            your_key,
        };
        self.seal_to_server(&auth)
    }

    /// `drop-responder` boxed for the server session key.
    pub fn drop_responder(&mut self, id: Address, reason: Option<CloseCode>) -> Vec<u8> {
        self.seal_to_server(&DropResponder { id, reason })
    }

    /// Parse a frame from the server.
    ///
    /// # Panics
    ///
    /// If the server cookie changes or the server CSN skips.
    pub fn receive(&mut self, data: &[u8]) -> CodecResult<Received> {
        let frame = Frame::parse(data)?;
        let header = frame.header;
        if header.source != Address::SERVER {
            return Ok(Received::Relayed(data.to_vec()));
        }

        match self.server_cookie {
            None => self.server_cookie = Some(header.cookie),
            Some(cookie) => assert_eq!(cookie, header.cookie, "server cookie changed"),
        }
        if let Some(expected) = self.server_csn {
            assert_eq!(expected, header.csn, "server csn out of order");
        }
        let mut next = header.csn;
        next.increment()?;
        self.server_csn = Some(next);

        let Some(session) = self.server_session.clone() else {
            let hello = ServerHello::decode(frame.payload)?;
            self.server_session = Some(hello.key.clone());
            return Ok(Received::ServerHello(hello));
        };

        let nonce = header.make_nonce();
        let plain = decrypt_payload(&session, self.keys.secret_key(), &nonce, frame.payload)?;
        let kind = payload_kind(&plain)?;
        match kind.as_str() {
            "server-auth" => {
                let (auth, signed_keys) = ServerAuth::decode(&plain)?;
                self.id = header.destination;
                Ok(Received::ServerAuth {
                    auth,
                    signed_keys,
                    nonce,
                })
            }
            "new-initiator" => NewInitiator::decode(&plain).map(|_| Received::NewInitiator),
            "new-responder" => {
                NewResponder::decode(&plain).map(|m| Received::NewResponder(m.id))
            }
            "disconnected" => Disconnected::decode(&plain).map(|m| Received::Disconnected(m.id)),
            "send-error" => SendError::decode(&plain).map(|m| Received::SendError(m.id)),
            other => Err(CodecError::invalid_field(other, "type")),
        }
    }

    /// True if `signed_keys` opens with `permanent` to the server session
    /// key followed by our key.
    pub fn verify_signed_keys(&self, permanent: &PublicKey, nonce: &Nonce, signed: &[u8]) -> bool {
        let Some(session) = &self.server_session else {
            return false;
        };
        match decrypt_payload(permanent, self.keys.secret_key(), nonce, signed) {
            Ok(opened) => {
                opened.len() == KEY_SIZE * 2
                    && &opened[..KEY_SIZE] == session.as_bytes()
                    && &opened[KEY_SIZE..] == self.keys.public_key().as_bytes()
            }
            Err(_) => false,
        }
    }

    fn seal_to_server<M: MarshalPayload>(&mut self, message: &M) -> Vec<u8> {
        let server = self.server_session.clone().expect("no server-hello yet");
        let header = self.next_header(Address::SERVER);
        let payload = message
            .marshal_payload(&EncodingOpts {
                peer_key: Some(&server),
                local_session: &self.keys,
                server_permanent: None,
                nonce: header.make_nonce(),
            })
            .expect("encode message");
        write_frame(&header, &payload).expect("csn exhausted")
    }

    fn next_header(&mut self, destination: Address) -> Header {
        let header = Header {
            cookie: self.cookie,
            source: self.id,
            destination,
            csn: self.csn,
        };
        self.csn.increment().expect("csn exhausted");
        header
    }
}
