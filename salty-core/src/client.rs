//! Per-connection protocol state machine.
//!
//! # Handshake
//!
//! ```text
//! None -> ServerHello -> ClientHello -> ClientAuth -> ServerAuth   (responder)
//! None -> ServerHello ---------------> ClientAuth -> ServerAuth   (initiator)
//! ```
//!
//! The server speaks first with `server-hello`. A responder introduces its
//! key with `client-hello`; an initiator is recognised by sending
//! `client-auth` right away, boxed for the path key. `server-auth` is sent
//! from a dispatched job once the client has been installed on its path.
//!
//! # Locking
//!
//! Each client guards its state with one mutex. Handlers only ever lock
//! their own client. Server messages for another client (`new-initiator`,
//! `new-responder`, `disconnected`) go into that client's inbox and are
//! packed by a dispatched job that locks the target alone. Relayed frames
//! go straight into the target's [`ConnectionSink`] unless its inbox still
//! holds messages, in which case they queue behind them. The inbox lock is
//! always taken last, so it never closes a cycle.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use salty_types::crypto::decrypt_payload;
use salty_types::{
    Address, AddressType, ClientAuth, ClientHello, ClientType, CloseCode, CombinedSequenceNumber,
    Cookie, Disconnected, DropResponder, EncodingOpts, Frame, Header, KeyPair, MarshalPayload,
    Message, NewInitiator, NewResponder, PublicKey, RawMessage, SendError, ServerAuth,
    ServerAuthTarget, ServerHello,
};

use crate::error::{Direction, ProtocolError, ProtocolResult};
use crate::outbound::ConnectionSink;
use crate::path::Path;
use crate::relay::{Relay, RelayMetrics};

/// Handshake progress of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing sent yet.
    None,
    /// `server-hello` sent.
    ServerHello,
    /// `client-hello` received (responders only).
    ClientHello,
    /// `client-auth` accepted, `server-auth` pending.
    ClientAuth,
    /// `server-auth` sent; the client is authenticated.
    ServerAuth,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::ServerHello => "server-hello",
            Self::ClientHello => "client-hello",
            Self::ClientAuth => "client-auth",
            Self::ServerAuth => "server-auth",
        };
        f.write_str(name)
    }
}

struct ClientState {
    path: Arc<Path>,
    handshake: HandshakeState,
    id: Address,
    role: Option<ClientType>,
    authenticated: bool,
    client_key: Option<PublicKey>,
    session: KeyPair,
    permanent: Option<Arc<KeyPair>>,
    cookie_out: Cookie,
    cookie_in: Option<Cookie>,
    csn_out: CombinedSequenceNumber,
    csn_in: Option<CombinedSequenceNumber>,
    ping_interval: u32,
    /// Set once the connection is torn down.
    gone: bool,
}

/// Something another client wants delivered to this one.
enum Delivery {
    /// Server message, packed for the target when delivered.
    Notice(Message),
    /// Frame from a peer, forwarded unchanged.
    Relayed(Vec<u8>),
}

/// Inbound cookie and CSN updates, applied only once a frame is accepted.
#[derive(Default)]
struct PendingCommit {
    cookie_in: Option<Cookie>,
    csn_in: Option<CombinedSequenceNumber>,
}

impl PendingCommit {
    fn apply(self, st: &mut ClientState) {
        if let Some(cookie) = self.cookie_in {
            st.cookie_in = Some(cookie);
        }
        if let Some(csn) = self.csn_in {
            st.csn_in = Some(csn);
        }
    }
}

struct Installed {
    id: Address,
    displaced: Option<Arc<Client>>,
}

/// One WebSocket connection speaking the signalling protocol.
pub struct Client {
    connection_id: u64,
    relay: Arc<Relay>,
    sink: ConnectionSink,
    subprotocol: String,
    state: Mutex<ClientState>,
    inbox: Mutex<VecDeque<Delivery>>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // try_lock: Debug may run while a handler holds the state.
        let mut out = f.debug_struct("Client");
        out.field("connection_id", &self.connection_id);
        if let Ok(st) = self.state.try_lock() {
            out.field("path", &st.path.number())
                .field("id", &st.id)
                .field("role", &st.role)
                .field("state", &st.handshake);
        }
        out.finish_non_exhaustive()
    }
}

impl Client {
    /// New client on `path` with a fresh session key, cookie and CSN.
    ///
    /// `subprotocol` is the one agreed during the WebSocket upgrade.
    pub fn new(
        relay: Arc<Relay>,
        path: Arc<Path>,
        sink: ConnectionSink,
        subprotocol: impl Into<String>,
    ) -> Arc<Self> {
        let connection_id = relay.next_connection_id();
        Arc::new(Self {
            connection_id,
            relay,
            sink,
            subprotocol: subprotocol.into(),
            state: Mutex::new(ClientState {
                path,
                handshake: HandshakeState::None,
                id: Address::SERVER,
                role: None,
                authenticated: false,
                client_key: None,
                session: KeyPair::generate(),
                permanent: None,
                cookie_out: Cookie::random(),
                cookie_in: None,
                csn_out: CombinedSequenceNumber::random(),
                csn_in: None,
                ping_interval: 0,
                gone: false,
            }),
            inbox: Mutex::new(VecDeque::new()),
        })
    }

    /// Connection id, for logs.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Assigned address (`0x00` until authenticated).
    pub fn id(&self) -> Address {
        self.lock().id
    }

    /// Role, once known.
    pub fn role(&self) -> Option<ClientType> {
        self.lock().role
    }

    /// True once `server-auth` has been sent.
    pub fn is_authenticated(&self) -> bool {
        self.lock().authenticated
    }

    /// Current handshake state.
    pub fn handshake_state(&self) -> HandshakeState {
        self.lock().handshake
    }

    /// Path the client is on.
    pub fn path(&self) -> Arc<Path> {
        Arc::clone(&self.lock().path)
    }

    /// Server session public key of this connection.
    pub fn session_public_key(&self) -> PublicKey {
        self.lock().session.public_key().clone()
    }

    /// Subprotocol agreed at upgrade.
    pub fn subprotocol(&self) -> &str {
        &self.subprotocol
    }

    /// Ask the writer to close the connection.
    pub fn close(&self, code: CloseCode) {
        tracing::debug!("Closing connection {} with {}", self.connection_id, code);
        self.sink.close(code);
    }

    /// Log `err`, count it and close the connection with its code.
    pub fn fail(&self, err: &ProtocolError) {
        let code = err.close_code();
        if code == CloseCode::ProtocolError {
            RelayMetrics::bump(&self.relay.metrics().protocol_errors);
        }
        tracing::warn!("Connection {}: {}", self.connection_id, err);
        self.close(code);
    }

    /// Send `server-hello` and start the handshake.
    pub fn send_server_hello(&self) -> ProtocolResult<()> {
        let mut st = self.lock();
        if st.handshake != HandshakeState::None {
            return Err(unexpected("server-hello", st.handshake));
        }
        let hello = ServerHello {
            key: st.session.public_key().clone(),
        };
        let frame = self.pack_locked(&mut st, Address::SERVER, &hello)?;
        st.handshake = HandshakeState::ServerHello;
        self.sink.send_binary(frame);
        tracing::debug!(
            "Connection {}: sent server-hello on path {}",
            self.connection_id,
            st.path.number()
        );
        Ok(())
    }

    /// Handle one inbound binary frame.
    pub fn received(self: &Arc<Self>, data: &[u8]) -> ProtocolResult<()> {
        let mut st = self.lock();
        let message = self.unpack_locked(&mut st, data)?;
        match message {
            Message::ClientHello(hello) => self.handle_client_hello(&mut st, hello),
            Message::ClientAuth(auth) => self.handle_client_auth(&mut st, auth),
            Message::DropResponder(drop) => self.handle_drop_responder(&mut st, drop),
            Message::Raw(raw) => self.handle_raw(&mut st, raw),
            other => {
                tracing::warn!(
                    "Connection {}: ignoring unexpected {}",
                    self.connection_id,
                    other.kind()
                );
                Ok(())
            }
        }
    }

    /// Validate and decode one inbound frame.
    ///
    /// Cookie and CSN state only change if the whole frame is accepted.
    pub fn unpack(&self, data: &[u8]) -> ProtocolResult<Message> {
        let mut st = self.lock();
        self.unpack_locked(&mut st, data)
    }

    /// Build a frame from the server to `destination`, advancing the
    /// outbound CSN.
    pub fn pack<M: MarshalPayload + ?Sized>(
        &self,
        destination: Address,
        message: &M,
    ) -> ProtocolResult<Vec<u8>> {
        let mut st = self.lock();
        self.pack_locked(&mut st, destination, message)
    }

    /// Encrypt `message` for this client and queue it.
    pub fn send_message(&self, message: &Message) -> ProtocolResult<()> {
        let mut st = self.lock();
        self.send_locked(&mut st, message)
    }

    /// Install the client on its path, send `server-auth` and notify the
    /// other side of the path.
    pub fn send_server_auth(self: &Arc<Self>) -> ProtocolResult<()> {
        let mut st = self.lock();
        if st.gone {
            tracing::debug!(
                "Connection {} left before server-auth",
                self.connection_id
            );
            return Ok(());
        }
        if st.handshake != HandshakeState::ClientAuth {
            return Err(unexpected("server-auth", st.handshake));
        }
        let role = st
            .role
            .ok_or_else(|| unexpected("server-auth", st.handshake))?;
        let your_cookie = st.cookie_in.ok_or(ProtocolError::CookieNotEchoed)?;

        let installed = self.install(&mut st, role)?;
        let path = Arc::clone(&st.path);
        let target = match role {
            ClientType::Initiator => ServerAuthTarget::Initiator {
                responders: path.slots().responder_ids(),
            },
            ClientType::Responder => ServerAuthTarget::Responder {
                initiator_connected: path.slots().initiator().is_some(),
            },
        };
        let auth = ServerAuth {
            your_cookie,
            target,
        };
        let frame = match self.pack_locked(&mut st, installed.id, &auth) {
            Ok(frame) => frame,
            Err(e) => {
                path.slots()
                    .remove_if(installed.id, |c| Arc::ptr_eq(c, self));
                return Err(e);
            }
        };

        st.id = installed.id;
        st.authenticated = true;
        st.handshake = HandshakeState::ServerAuth;
        self.sink.send_binary(frame);
        if st.ping_interval > 0 {
            self.sink
                .keep_alive(Duration::from_secs(u64::from(st.ping_interval)));
        }

        // Queued before our own lock is released, so a later `disconnected`
        // from this client always lands behind them.
        match role {
            ClientType::Initiator => {
                for (_, responder) in path.slots().responders() {
                    responder.notify(Message::NewInitiator(NewInitiator));
                }
            }
            ClientType::Responder => {
                if let Some(initiator) = path.slots().initiator() {
                    initiator.notify(Message::NewResponder(NewResponder { id: installed.id }));
                }
            }
        }
        drop(st);

        RelayMetrics::bump(&self.relay.metrics().authenticated_total);
        tracing::info!(
            "Connection {} authenticated as {} {} on path {}",
            self.connection_id,
            role,
            installed.id,
            path.number()
        );

        if let Some(previous) = installed.displaced {
            if !Arc::ptr_eq(&previous, self) {
                tracing::info!(
                    "Initiator connection {} displaced on path {}",
                    previous.connection_id,
                    path.number()
                );
                previous.close(CloseCode::DropByInitiator);
            }
        }
        Ok(())
    }

    /// Tear down after the connection ended.
    ///
    /// Frees the client's slot, tells the other side of the path and
    /// prunes the path once empty. A client that was dropped or displaced
    /// no longer owns its slot and leaves silently.
    pub fn disconnected(self: &Arc<Self>) -> ProtocolResult<()> {
        let (path, id, role, authenticated) = {
            let mut st = self.lock();
            st.gone = true;
            (Arc::clone(&st.path), st.id, st.role, st.authenticated)
        };
        let removed = authenticated
            && path
                .slots()
                .remove_if(id, |c| Arc::ptr_eq(c, self))
                .is_some();
        self.relay.paths().prune(&path);

        tracing::debug!(
            "Connection {} gone from path {} (slot freed: {})",
            self.connection_id,
            path.number(),
            removed
        );
        if !removed {
            return Ok(());
        }

        match role {
            Some(ClientType::Initiator) => {
                for (_, responder) in path.slots().responders() {
                    responder.notify(Message::Disconnected(Disconnected { id }));
                }
                Ok(())
            }
            Some(ClientType::Responder) => match path.slots().initiator() {
                Some(initiator) => {
                    initiator.notify(Message::Disconnected(Disconnected { id }));
                    Ok(())
                }
                None => Err(ProtocolError::NoInitiator),
            },
            None => Ok(()),
        }
    }

    fn handle_client_hello(
        &self,
        st: &mut ClientState,
        hello: ClientHello,
    ) -> ProtocolResult<()> {
        if st.role.is_some() || st.handshake != HandshakeState::ServerHello {
            return Err(unexpected("client-hello", st.handshake));
        }
        st.client_key = Some(hello.key);
        st.role = Some(ClientType::Responder);
        st.handshake = HandshakeState::ClientHello;
        tracing::debug!("Connection {}: client-hello, responder", self.connection_id);
        Ok(())
    }

    fn handle_client_auth(
        self: &Arc<Self>,
        st: &mut ClientState,
        auth: ClientAuth,
    ) -> ProtocolResult<()> {
        let role = match (st.handshake, st.role) {
            (HandshakeState::ServerHello, None) => ClientType::Initiator,
            (HandshakeState::ClientHello, Some(ClientType::Responder)) => ClientType::Responder,
            _ => return Err(unexpected("client-auth", st.handshake)),
        };
        if auth.your_cookie != st.cookie_out {
            return Err(ProtocolError::CookieNotEchoed);
        }

        let shared = auth
            .subprotocols
            .iter()
            .find(|p| self.relay.subprotocols().contains(p));
        match shared {
            Some(p) if *p == self.subprotocol => {}
            _ => return Err(ProtocolError::SubprotocolMismatch),
        }

        let permanent = match &auth.your_key {
            Some(key) => self
                .relay
                .find_permanent_key(key)
                .ok_or(ProtocolError::InvalidPermanentKey)?,
            None => self
                .relay
                .primary_key()
                .ok_or(ProtocolError::NoPermanentKey)?,
        };

        if role == ClientType::Initiator {
            st.client_key = Some(st.path.initiator_key().clone());
        }
        st.role = Some(role);
        st.permanent = Some(permanent);
        st.ping_interval = auth.ping_interval;
        st.handshake = HandshakeState::ClientAuth;
        tracing::debug!(
            "Connection {}: client-auth accepted as {}",
            self.connection_id,
            role
        );

        let this = Arc::clone(self);
        self.relay.dispatch(Box::new(move || {
            if let Err(e) = this.send_server_auth() {
                this.fail(&e);
            }
        }));
        Ok(())
    }

    fn handle_drop_responder(
        &self,
        st: &mut ClientState,
        drop: DropResponder,
    ) -> ProtocolResult<()> {
        if !st.authenticated || st.role != Some(ClientType::Initiator) {
            return Err(ProtocolError::NotInitiator("drop-responder"));
        }
        match st.path.slots().del(drop.id) {
            Some(responder) => {
                let reason = drop.reason.unwrap_or(CloseCode::DropByInitiator);
                tracing::info!(
                    "Initiator dropped responder {} on path {} ({})",
                    drop.id,
                    st.path.number(),
                    reason
                );
                responder.close(reason);
                RelayMetrics::bump(&self.relay.metrics().dropped_responders);
            }
            None => {
                tracing::debug!(
                    "drop-responder for {} on path {}: no such responder",
                    drop.id,
                    st.path.number()
                );
            }
        }
        Ok(())
    }

    fn handle_raw(&self, st: &mut ClientState, raw: RawMessage) -> ProtocolResult<()> {
        let path = Arc::clone(&st.path);
        let owns_slot = path
            .slots()
            .get(st.id)
            .is_some_and(|c| std::ptr::eq(Arc::as_ptr(&c), self));
        if !owns_slot {
            tracing::debug!(
                "Connection {}: no longer on path, not relaying",
                self.connection_id
            );
            return Ok(());
        }

        let len = raw.data.len();
        let delivered = match path.slots().get(raw.header.destination) {
            Some(peer) => peer.forward(raw.data),
            None => false,
        };
        if delivered {
            let metrics = self.relay.metrics();
            RelayMetrics::bump(&metrics.relayed_messages);
            metrics
                .relayed_bytes
                .fetch_add(len as u64, Ordering::Relaxed);
            tracing::trace!(
                "Relayed {} bytes {} -> {} on path {}",
                len,
                raw.header.source,
                raw.header.destination,
                path.number()
            );
            return Ok(());
        }

        let id = st.id;
        let frame = self.pack_locked(
            st,
            id,
            &SendError {
                id: raw.header.message_id(),
            },
        )?;
        self.sink.send_binary(frame);
        RelayMetrics::bump(&self.relay.metrics().send_errors);
        tracing::debug!(
            "send-error to {} on path {}: {} unreachable",
            id,
            path.number(),
            raw.header.destination
        );
        Ok(())
    }

    fn unpack_locked(&self, st: &mut ClientState, data: &[u8]) -> ProtocolResult<Message> {
        let frame = Frame::parse(data)?;
        let header = frame.header;

        let destination_type = header.destination.kind();
        if destination_type != AddressType::Server {
            let allowed = st.authenticated
                && st
                    .role
                    .is_some_and(|role| role.address_type() != destination_type);
            if !allowed {
                return Err(ProtocolError::NotAllowedMessage {
                    from: header.source,
                    destination: header.destination,
                });
            }
        }
        if header.source != st.id {
            return Err(ProtocolError::NotMatchedIdentities {
                expected: st.id,
                actual: header.source,
            });
        }
        if destination_type != AddressType::Server {
            return Ok(Message::Raw(RawMessage {
                header,
                data: data.to_vec(),
            }));
        }

        let mut pending = PendingCommit::default();
        match st.cookie_in {
            None => {
                if header.cookie == st.cookie_out {
                    return Err(ProtocolError::CookieReflected);
                }
                pending.cookie_in = Some(header.cookie);
            }
            Some(cookie) if cookie != header.cookie => {
                return Err(ProtocolError::CookieMismatch);
            }
            Some(_) => {}
        }

        let mut next = match st.csn_in {
            None => {
                if header.csn.overflow_number() != 0 {
                    return Err(ProtocolError::InvalidOverflowNumber);
                }
                header.csn
            }
            Some(expected) => {
                if expected.is_overflow_sentinel() {
                    return Err(ProtocolError::OverflowSentinel(Direction::Inbound));
                }
                if header.csn != expected {
                    return Err(ProtocolError::NotExpectedCsn {
                        expected,
                        actual: header.csn,
                    });
                }
                expected
            }
        };
        next.increment()?;
        pending.csn_in = Some(next);

        let message = self.open_payload(st, &frame)?;
        pending.apply(st);
        Ok(message)
    }

    fn open_payload(&self, st: &ClientState, frame: &Frame<'_>) -> ProtocolResult<Message> {
        if st.handshake == HandshakeState::ServerHello && st.role.is_none() {
            // Plain client-hello, or an initiator's boxed client-auth.
            if let Ok(hello @ Message::ClientHello(_)) = Message::decode(frame.payload) {
                return Ok(hello);
            }
        }
        let client_key = st
            .client_key
            .as_ref()
            .unwrap_or_else(|| st.path.initiator_key());
        let plain = decrypt_payload(
            client_key,
            st.session.secret_key(),
            &frame.header.make_nonce(),
            frame.payload,
        )?;
        Ok(Message::decode(&plain)?)
    }

    fn pack_locked<M: MarshalPayload + ?Sized>(
        &self,
        st: &mut ClientState,
        destination: Address,
        message: &M,
    ) -> ProtocolResult<Vec<u8>> {
        if st.csn_out.is_overflow_sentinel() {
            return Err(ProtocolError::OverflowSentinel(Direction::Outbound));
        }
        let header = Header {
            cookie: st.cookie_out,
            source: Address::SERVER,
            destination,
            csn: st.csn_out,
        };
        let head = header.to_bytes()?;
        let opts = EncodingOpts {
            peer_key: st.client_key.as_ref(),
            local_session: &st.session,
            server_permanent: st.permanent.as_deref(),
            nonce: head,
        };
        let payload = message.marshal_payload(&opts)?;

        let mut next = st.csn_out;
        next.increment()?;
        st.csn_out = next;

        let mut frame = Vec::with_capacity(head.len() + payload.len());
        frame.extend_from_slice(&head);
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    fn send_locked(&self, st: &mut ClientState, message: &Message) -> ProtocolResult<()> {
        if !st.authenticated {
            return Err(ProtocolError::NotAuthenticated);
        }
        let id = st.id;
        let frame = self.pack_locked(st, id, message)?;
        self.sink.send_binary(frame);
        Ok(())
    }

    /// Queue a server message for this client and schedule its delivery.
    ///
    /// Messages queued by one caller arrive in the order they were queued.
    fn notify(self: &Arc<Self>, message: Message) {
        self.lock_inbox().push_back(Delivery::Notice(message));
        let target = Arc::clone(self);
        self.relay.dispatch(Box::new(move || target.deliver_pending()));
    }

    /// Forward a relayed frame, behind any messages still in the inbox.
    /// Returns false if the writer is gone.
    fn forward(&self, data: Vec<u8>) -> bool {
        let mut inbox = self.lock_inbox();
        if inbox.is_empty() {
            return self.sink.send_binary(data);
        }
        inbox.push_back(Delivery::Relayed(data));
        !self.sink.is_closed()
    }

    /// Pack and send everything in the inbox, in order.
    fn deliver_pending(&self) {
        let mut st = self.lock();
        let mut inbox = self.lock_inbox();
        while let Some(delivery) = inbox.pop_front() {
            let sent = match delivery {
                Delivery::Notice(message) => self.send_locked(&mut st, &message),
                Delivery::Relayed(data) => {
                    self.sink.send_binary(data);
                    Ok(())
                }
            };
            if let Err(e) = sent {
                inbox.clear();
                drop(inbox);
                drop(st);
                self.fail(&e);
                return;
            }
        }
    }

    /// Put the client into its slot, moving off an orphaned path first.
    fn install(self: &Arc<Self>, st: &mut ClientState, role: ClientType) -> ProtocolResult<Installed> {
        loop {
            if st.path.is_orphan() {
                st.path = self.relay.paths().get_or_create(st.path.initiator_key());
            }
            let path = Arc::clone(&st.path);
            let installed = match role {
                ClientType::Initiator => Installed {
                    id: Address::INITIATOR,
                    displaced: path.slots().set_initiator(Arc::clone(self)),
                },
                ClientType::Responder => Installed {
                    id: path
                        .slots()
                        .add_responder(Arc::clone(self))
                        .map_err(|_| ProtocolError::PathFull)?,
                    displaced: None,
                },
            };
            if !path.is_orphan() {
                return Ok(installed);
            }
            // Pruned while we were installing; try the live path.
            path.slots()
                .remove_if(installed.id, |c| Arc::ptr_eq(c, self));
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_inbox(&self) -> MutexGuard<'_, VecDeque<Delivery>> {
        self.inbox.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn unexpected(kind: &'static str, state: HandshakeState) -> ProtocolError {
    ProtocolError::UnexpectedMessage {
        kind,
        state: state.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Job, QueuedDispatcher};
    use crate::outbound::Outbound;
    use crate::relay::RelayOptions;
    use crate::testing::{Received, TestPeer};
    use salty_types::{CodecError, SUBPROTOCOL_V1};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        relay: Arc<Relay>,
        jobs: Arc<QueuedDispatcher>,
        permanent: KeyPair,
    }

    struct Conn {
        client: Arc<Client>,
        rx: UnboundedReceiver<Outbound>,
        peer: TestPeer,
    }

    impl Harness {
        fn new() -> Self {
            let jobs = Arc::new(QueuedDispatcher::new());
            let permanent = KeyPair::generate();
            let relay = Arc::new(Relay::new(
                RelayOptions {
                    subprotocols: vec![SUBPROTOCOL_V1.to_string()],
                    permanent_keys: vec![permanent.clone()],
                },
                jobs.clone(),
            ));
            Self {
                relay,
                jobs,
                permanent,
            }
        }

        /// Open a connection on the path of `initiator_key` and consume
        /// the server-hello.
        fn connect(&self, initiator_key: &PublicKey, peer: TestPeer) -> Conn {
            let path = self.relay.paths().get_or_create(initiator_key);
            let (sink, rx) = ConnectionSink::channel();
            let client = Client::new(self.relay.clone(), path, sink, SUBPROTOCOL_V1);
            client.send_server_hello().unwrap();
            let mut conn = Conn { client, rx, peer };
            assert!(matches!(conn.next(), Received::ServerHello(_)));
            conn
        }

        fn initiator(&self) -> Conn {
            let peer = TestPeer::new();
            let key = peer.public_key().clone();
            let mut conn = self.connect(&key, peer);
            let auth = conn.peer.client_auth(&[SUBPROTOCOL_V1], 0, None);
            conn.client.received(&auth).unwrap();
            self.jobs.run_pending();
            assert!(matches!(conn.next(), Received::ServerAuth { .. }));
            conn
        }

        fn responder(&self, initiator_key: &PublicKey) -> Conn {
            let mut conn = self.connect(initiator_key, TestPeer::new());
            let hello = conn.peer.client_hello();
            conn.client.received(&hello).unwrap();
            let auth = conn.peer.client_auth(&[SUBPROTOCOL_V1], 0, None);
            conn.client.received(&auth).unwrap();
            self.jobs.run_pending();
            assert!(matches!(conn.next(), Received::ServerAuth { .. }));
            conn
        }
    }

    impl Conn {
        fn next_outbound(&mut self) -> Outbound {
            self.rx.try_recv().expect("nothing queued")
        }

        fn next(&mut self) -> Received {
            match self.next_outbound() {
                Outbound::Binary(frame) => self.peer.receive(&frame).unwrap(),
                other => panic!("expected a frame, got {other:?}"),
            }
        }

        fn idle(&mut self) -> bool {
            self.rx.try_recv().is_err()
        }
    }

    #[test]
    fn server_hello_is_first_and_only_once() {
        let h = Harness::new();
        let conn = h.connect(&KeyPair::generate().public_key().clone(), TestPeer::new());
        assert_eq!(conn.client.handshake_state(), HandshakeState::ServerHello);
        assert!(matches!(
            conn.client.send_server_hello(),
            Err(ProtocolError::UnexpectedMessage { .. })
        ));
    }

    #[test]
    fn client_hello_marks_responder() {
        let h = Harness::new();
        let mut conn = h.connect(KeyPair::generate().public_key(), TestPeer::new());
        let hello = conn.peer.client_hello();
        conn.client.received(&hello).unwrap();

        assert_eq!(conn.client.role(), Some(ClientType::Responder));
        assert_eq!(conn.client.handshake_state(), HandshakeState::ClientHello);
        assert!(!conn.client.is_authenticated());
        assert!(conn.idle());
    }

    #[test]
    fn initiator_handshake() {
        let h = Harness::new();
        let peer = TestPeer::new();
        let key = peer.public_key().clone();
        let mut conn = h.connect(&key, peer);

        let auth = conn.peer.client_auth(&[SUBPROTOCOL_V1], 0, None);
        conn.client.received(&auth).unwrap();
        assert_eq!(conn.client.handshake_state(), HandshakeState::ClientAuth);
        // server-auth waits for its job
        assert!(conn.idle());
        assert_eq!(h.jobs.run_pending(), 1);

        match conn.next() {
            Received::ServerAuth {
                auth,
                signed_keys,
                nonce,
            } => {
                assert_eq!(auth.your_cookie, conn.peer.cookie());
                assert_eq!(
                    auth.target,
                    ServerAuthTarget::Initiator { responders: vec![] }
                );
                let signed = signed_keys.expect("signed_keys missing");
                assert!(conn
                    .peer
                    .verify_signed_keys(h.permanent.public_key(), &nonce, &signed));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(conn.client.is_authenticated());
        assert_eq!(conn.client.id(), Address::INITIATOR);
        assert_eq!(conn.peer.id(), Address::INITIATOR);
        assert!(conn.client.path().slots().initiator().is_some());
    }

    #[test]
    fn responder_joins_after_initiator() {
        let h = Harness::new();
        let mut init = h.initiator();
        let key = init.peer.public_key().clone();

        let mut resp = h.connect(&key, TestPeer::new());
        let hello = resp.peer.client_hello();
        resp.client.received(&hello).unwrap();
        let auth = resp.peer.client_auth(&[SUBPROTOCOL_V1], 0, None);
        resp.client.received(&auth).unwrap();
        h.jobs.run_pending();

        match resp.next() {
            Received::ServerAuth { auth, .. } => assert_eq!(
                auth.target,
                ServerAuthTarget::Responder {
                    initiator_connected: true
                }
            ),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(resp.client.id(), Address::new(0x02));
        assert_eq!(init.next(), Received::NewResponder(Address::new(0x02)));
    }

    #[test]
    fn initiator_learns_of_waiting_responders() {
        let h = Harness::new();
        let initiator_peer = TestPeer::new();
        let key = initiator_peer.public_key().clone();

        let mut r1 = h.responder(&key);
        let mut r2 = h.responder(&key);

        let mut init = h.connect(&key, initiator_peer);
        let auth = init.peer.client_auth(&[SUBPROTOCOL_V1], 0, None);
        init.client.received(&auth).unwrap();
        h.jobs.run_pending();

        match init.next() {
            Received::ServerAuth { auth, .. } => assert_eq!(
                auth.target,
                ServerAuthTarget::Initiator {
                    responders: vec![Address::new(0x02), Address::new(0x03)]
                }
            ),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(r1.next(), Received::NewInitiator);
        assert_eq!(r2.next(), Received::NewInitiator);
    }

    /// Open a responder on `key` and run only its server-auth job, leaving
    /// the notice for the initiator queued.
    fn half_joined_responder(h: &Harness, key: &PublicKey) -> Conn {
        let mut resp = h.connect(key, TestPeer::new());
        let hello = resp.peer.client_hello();
        resp.client.received(&hello).unwrap();
        let auth = resp.peer.client_auth(&[SUBPROTOCOL_V1], 0, None);
        resp.client.received(&auth).unwrap();
        assert!(h.jobs.run_next());
        assert!(matches!(resp.next(), Received::ServerAuth { .. }));
        assert_eq!(h.jobs.pending(), 1);
        resp
    }

    #[test]
    fn relayed_frame_waits_behind_new_responder() {
        let h = Harness::new();
        let mut init = h.initiator();
        let key = init.peer.public_key().clone();
        let mut resp = half_joined_responder(&h, &key);

        let frame = resp.peer.frame(Address::INITIATOR, b"hurry");
        resp.client.received(&frame).unwrap();
        assert!(init.idle());

        h.jobs.run_pending();
        assert_eq!(init.next(), Received::NewResponder(Address::new(0x02)));
        assert_eq!(init.next(), Received::Relayed(frame));
        assert!(init.idle());
    }

    #[test]
    fn departure_follows_arrival() {
        let h = Harness::new();
        let mut init = h.initiator();
        let key = init.peer.public_key().clone();
        let resp = half_joined_responder(&h, &key);

        resp.client.disconnected().unwrap();
        // Deliver in reverse dispatch order; the inbox keeps them straight.
        let jobs: Vec<Job> = std::iter::from_fn(|| h.jobs.take_next()).collect();
        for job in jobs.into_iter().rev() {
            job();
        }

        assert_eq!(init.next(), Received::NewResponder(Address::new(0x02)));
        assert_eq!(init.next(), Received::Disconnected(Address::new(0x02)));
    }

    #[test]
    fn leaving_before_server_auth_takes_no_slot() {
        let h = Harness::new();
        let mut init = h.initiator();
        let key = init.peer.public_key().clone();

        let mut resp = h.connect(&key, TestPeer::new());
        let hello = resp.peer.client_hello();
        resp.client.received(&hello).unwrap();
        let auth = resp.peer.client_auth(&[SUBPROTOCOL_V1], 0, None);
        resp.client.received(&auth).unwrap();

        resp.client.disconnected().unwrap();
        h.jobs.run_pending();

        assert!(!resp.client.is_authenticated());
        assert!(resp.idle());
        assert!(init.idle());
        assert!(init.client.path().slots().responder_ids().is_empty());
    }

    #[test]
    fn relay_is_byte_for_byte() {
        let h = Harness::new();
        let mut init = h.initiator();
        let key = init.peer.public_key().clone();
        let mut resp = h.responder(&key);
        init.next(); // new-responder

        let frame = resp.peer.frame(Address::INITIATOR, b"opaque payload");
        resp.client.received(&frame).unwrap();
        assert_eq!(init.next(), Received::Relayed(frame));

        let back = init.peer.frame(Address::new(0x02), b"answer");
        init.client.received(&back).unwrap();
        assert_eq!(resp.next(), Received::Relayed(back));

        let metrics = h.relay.metrics();
        assert_eq!(metrics.relayed_messages.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn relay_to_missing_peer_sends_error() {
        let h = Harness::new();
        let mut init = h.initiator();

        let frame = init.peer.frame(Address::new(0x09), b"nobody home");
        init.client.received(&frame).unwrap();

        let expected = Header::parse(&frame).unwrap().message_id();
        assert_eq!(init.next(), Received::SendError(expected));
    }

    #[test]
    fn unauthenticated_client_cannot_relay() {
        let h = Harness::new();
        let mut conn = h.connect(KeyPair::generate().public_key(), TestPeer::new());
        let frame = conn.peer.frame(Address::INITIATOR, b"early");
        assert!(matches!(
            conn.client.received(&frame),
            Err(ProtocolError::NotAllowedMessage { .. })
        ));
    }

    #[test]
    fn responders_cannot_talk_to_responders() {
        let h = Harness::new();
        let init = h.initiator();
        let key = init.peer.public_key().clone();
        let mut r1 = h.responder(&key);
        let _r2 = h.responder(&key);

        let frame = r1.peer.frame(Address::new(0x03), b"sideways");
        assert!(matches!(
            r1.client.received(&frame),
            Err(ProtocolError::NotAllowedMessage { .. })
        ));
    }

    #[test]
    fn spoofed_source_is_rejected() {
        let h = Harness::new();
        let mut init = h.initiator();
        init.peer.set_id(Address::new(0x05));
        let frame = init.peer.frame(Address::SERVER, b"x");
        assert!(matches!(
            init.client.received(&frame),
            Err(ProtocolError::NotMatchedIdentities { .. })
        ));
    }

    #[test]
    fn reflected_cookie_is_rejected() {
        let h = Harness::new();
        let mut conn = h.connect(KeyPair::generate().public_key(), TestPeer::new());
        let server_cookie = conn.peer.server_cookie().unwrap();
        conn.peer.set_cookie(server_cookie);
        let hello = conn.peer.client_hello();
        assert!(matches!(
            conn.client.received(&hello),
            Err(ProtocolError::CookieReflected)
        ));
    }

    #[test]
    fn cookie_must_not_change() {
        let h = Harness::new();
        let mut conn = h.connect(KeyPair::generate().public_key(), TestPeer::new());
        let hello = conn.peer.client_hello();
        conn.client.received(&hello).unwrap();

        conn.peer.set_cookie(Cookie::random());
        let auth = conn.peer.client_auth(&[SUBPROTOCOL_V1], 0, None);
        assert!(matches!(
            conn.client.received(&auth),
            Err(ProtocolError::CookieMismatch)
        ));
    }

    #[test]
    fn first_csn_needs_zero_overflow() {
        let h = Harness::new();
        let mut conn = h.connect(KeyPair::generate().public_key(), TestPeer::new());
        conn.peer.set_csn(CombinedSequenceNumber::new(1, 0));
        let hello = conn.peer.client_hello();
        assert!(matches!(
            conn.client.received(&hello),
            Err(ProtocolError::InvalidOverflowNumber)
        ));
    }

    #[test]
    fn replayed_frame_is_rejected() {
        let h = Harness::new();
        let mut conn = h.connect(KeyPair::generate().public_key(), TestPeer::new());
        let hello = conn.peer.client_hello();
        conn.client.received(&hello).unwrap();
        assert!(matches!(
            conn.client.received(&hello),
            Err(ProtocolError::NotExpectedCsn { .. })
        ));
    }

    #[test]
    fn rejected_frame_leaves_state_untouched() {
        let h = Harness::new();
        let mut conn = h.connect(KeyPair::generate().public_key(), TestPeer::new());

        // Undecryptable first frame: cookie and csn must not be recorded.
        let junk = conn.peer.frame(Address::SERVER, b"not a box at all");
        assert!(matches!(
            conn.client.received(&junk),
            Err(ProtocolError::Codec(CodecError::CantDecryptPayload))
        ));

        // A fresh cookie and a restarted csn are still acceptable.
        conn.peer.set_cookie(Cookie::random());
        conn.peer.set_csn(CombinedSequenceNumber::new(0, 42));
        let hello = conn.peer.client_hello();
        conn.client.received(&hello).unwrap();
        assert_eq!(conn.client.role(), Some(ClientType::Responder));
    }

    #[test]
    fn inbound_sentinel_ends_the_conversation() {
        let h = Harness::new();
        let mut conn = h.connect(KeyPair::generate().public_key(), TestPeer::new());
        let hello = conn.peer.client_hello();
        conn.client.received(&hello).unwrap();

        conn.client.lock().csn_in = Some(CombinedSequenceNumber::new(u16::MAX, u32::MAX));
        let auth = conn.peer.client_auth(&[SUBPROTOCOL_V1], 0, None);
        assert!(matches!(
            conn.client.received(&auth),
            Err(ProtocolError::OverflowSentinel(Direction::Inbound))
        ));
    }

    #[test]
    fn outbound_sentinel_stops_packing() {
        let h = Harness::new();
        let conn = h.connect(KeyPair::generate().public_key(), TestPeer::new());
        conn.client.lock().csn_out = CombinedSequenceNumber::new(u16::MAX, u32::MAX);
        assert!(matches!(
            conn.client.pack(Address::SERVER, &NewInitiator),
            Err(ProtocolError::OverflowSentinel(Direction::Outbound))
        ));
    }

    #[test]
    fn outbound_csn_increments_per_frame() {
        let h = Harness::new();
        let conn = h.connect(KeyPair::generate().public_key(), TestPeer::new());
        conn.client.lock().client_key = Some(KeyPair::generate().public_key().clone());

        let a = Header::parse(&conn.client.pack(Address::SERVER, &NewInitiator).unwrap()).unwrap();
        let b = Header::parse(&conn.client.pack(Address::SERVER, &NewInitiator).unwrap()).unwrap();
        assert_eq!(b.csn.combined(), a.csn.combined() + 1);
        assert_eq!(a.cookie, b.cookie);
        assert_eq!(a.source, Address::SERVER);
    }

    #[test]
    fn cookie_must_be_echoed() {
        let h = Harness::new();
        let peer = TestPeer::new();
        let key = peer.public_key().clone();
        let mut conn = h.connect(&key, peer);
        conn.peer.set_server_cookie(Cookie::random());
        let auth = conn.peer.client_auth(&[SUBPROTOCOL_V1], 0, None);
        assert!(matches!(
            conn.client.received(&auth),
            Err(ProtocolError::CookieNotEchoed)
        ));
    }

    #[test]
    fn unknown_permanent_key_is_refused() {
        let h = Harness::new();
        let peer = TestPeer::new();
        let key = peer.public_key().clone();
        let mut conn = h.connect(&key, peer);
        let bogus = KeyPair::generate().public_key().clone();
        let auth = conn.peer.client_auth(&[SUBPROTOCOL_V1], 0, Some(bogus));

        let err = conn.client.received(&auth).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPermanentKey));
        assert_eq!(err.close_code(), CloseCode::InvalidKey);
    }

    #[test]
    fn requested_permanent_key_is_used() {
        let h = Harness::new();
        let peer = TestPeer::new();
        let key = peer.public_key().clone();
        let mut conn = h.connect(&key, peer);
        let auth = conn.peer.client_auth(
            &[SUBPROTOCOL_V1],
            0,
            Some(h.permanent.public_key().clone()),
        );
        conn.client.received(&auth).unwrap();
        h.jobs.run_pending();
        assert!(matches!(conn.next(), Received::ServerAuth { .. }));
    }

    #[test]
    fn subprotocol_must_match_upgrade() {
        let h = Harness::new();
        let peer = TestPeer::new();
        let key = peer.public_key().clone();
        let mut conn = h.connect(&key, peer);
        let auth = conn.peer.client_auth(&["v0.example"], 0, None);

        let err = conn.client.received(&auth).unwrap_err();
        assert!(matches!(err, ProtocolError::SubprotocolMismatch));
        assert_eq!(err.close_code(), CloseCode::SubprotocolError);
    }

    #[test]
    fn ping_interval_requests_keep_alive() {
        let h = Harness::new();
        let peer = TestPeer::new();
        let key = peer.public_key().clone();
        let mut conn = h.connect(&key, peer);
        let auth = conn.peer.client_auth(&[SUBPROTOCOL_V1], 15, None);
        conn.client.received(&auth).unwrap();
        h.jobs.run_pending();

        assert!(matches!(conn.next(), Received::ServerAuth { .. }));
        assert_eq!(
            conn.next_outbound(),
            Outbound::KeepAlive(Duration::from_secs(15))
        );
    }

    #[test]
    fn drop_responder_closes_and_frees_slot() {
        let h = Harness::new();
        let mut init = h.initiator();
        let key = init.peer.public_key().clone();
        let mut resp = h.responder(&key);
        init.next();

        let drop = init.peer.drop_responder(Address::new(0x02), None);
        init.client.received(&drop).unwrap();

        assert_eq!(
            resp.next_outbound(),
            Outbound::Close(CloseCode::DropByInitiator)
        );
        assert!(init.client.path().slots().get(Address::new(0x02)).is_none());

        // Dropped responder leaves silently.
        resp.client.disconnected().unwrap();
        h.jobs.run_pending();
        assert!(init.idle());
    }

    #[test]
    fn drop_responder_uses_given_reason() {
        let h = Harness::new();
        let mut init = h.initiator();
        let key = init.peer.public_key().clone();
        let mut resp = h.responder(&key);
        init.next();

        let drop = init
            .peer
            .drop_responder(Address::new(0x02), Some(CloseCode::InitiatorCouldNotDecrypt));
        init.client.received(&drop).unwrap();
        assert_eq!(
            resp.next_outbound(),
            Outbound::Close(CloseCode::InitiatorCouldNotDecrypt)
        );
    }

    #[test]
    fn only_initiator_may_drop() {
        let h = Harness::new();
        let init = h.initiator();
        let key = init.peer.public_key().clone();
        let mut resp = h.responder(&key);

        let drop = resp.peer.drop_responder(Address::new(0x02), None);
        assert!(matches!(
            resp.client.received(&drop),
            Err(ProtocolError::NotInitiator(_))
        ));
    }

    #[test]
    fn new_initiator_displaces_old_one() {
        let h = Harness::new();
        let mut first = h.initiator();
        let keys = first.peer.keys().clone();

        let mut second = h.connect(keys.public_key(), TestPeer::with_keys(keys.clone()));
        let auth = second.peer.client_auth(&[SUBPROTOCOL_V1], 0, None);
        second.client.received(&auth).unwrap();
        h.jobs.run_pending();
        assert!(matches!(second.next(), Received::ServerAuth { .. }));

        assert_eq!(
            first.next_outbound(),
            Outbound::Close(CloseCode::DropByInitiator)
        );
        let path = second.client.path();
        let current = path.slots().initiator().unwrap();
        assert!(Arc::ptr_eq(&current, &second.client));

        // The displaced initiator's teardown leaves the new one in place.
        first.client.disconnected().unwrap();
        assert!(path.slots().initiator().is_some());
    }

    #[test]
    fn responder_leaving_notifies_initiator() {
        let h = Harness::new();
        let mut init = h.initiator();
        let key = init.peer.public_key().clone();
        let resp = h.responder(&key);
        init.next();

        resp.client.disconnected().unwrap();
        h.jobs.run_pending();
        assert_eq!(init.next(), Received::Disconnected(Address::new(0x02)));
    }

    #[test]
    fn initiator_leaving_notifies_responders() {
        let h = Harness::new();
        let init = h.initiator();
        let key = init.peer.public_key().clone();
        let mut r1 = h.responder(&key);
        let mut r2 = h.responder(&key);

        init.client.disconnected().unwrap();
        h.jobs.run_pending();
        assert_eq!(r1.next(), Received::Disconnected(Address::INITIATOR));
        assert_eq!(r2.next(), Received::Disconnected(Address::INITIATOR));
    }

    #[test]
    fn responder_leaving_without_initiator_is_an_error() {
        let h = Harness::new();
        let key = KeyPair::generate().public_key().clone();
        let resp = h.responder(&key);
        assert!(matches!(
            resp.client.disconnected(),
            Err(ProtocolError::NoInitiator)
        ));
    }

    #[test]
    fn last_client_leaving_prunes_path() {
        let h = Harness::new();
        let init = h.initiator();
        let path = init.client.path();
        assert_eq!(h.relay.paths().len(), 1);

        init.client.disconnected().unwrap();
        assert!(h.relay.paths().is_empty());
        assert!(path.is_orphan());
    }

    #[test]
    fn unauthenticated_leave_prunes_quietly() {
        let h = Harness::new();
        let conn = h.connect(KeyPair::generate().public_key(), TestPeer::new());
        conn.client.disconnected().unwrap();
        assert!(h.relay.paths().is_empty());
    }

    #[test]
    fn client_on_orphaned_path_moves_to_live_one() {
        let h = Harness::new();
        let peer = TestPeer::new();
        let key = peer.public_key().clone();
        let mut conn = h.connect(&key, peer);
        let stale = conn.client.path();

        // Another connection on the same path leaves and prunes it.
        assert!(h.relay.paths().prune(&stale));

        let auth = conn.peer.client_auth(&[SUBPROTOCOL_V1], 0, None);
        conn.client.received(&auth).unwrap();
        h.jobs.run_pending();
        assert!(matches!(conn.next(), Received::ServerAuth { .. }));

        let live = conn.client.path();
        assert!(!Arc::ptr_eq(&stale, &live));
        assert!(stale.is_empty());
        assert!(Arc::ptr_eq(
            &h.relay.paths().get(live.key_hex()).unwrap(),
            &live
        ));
    }

    #[test]
    fn prune_leaves_occupied_path_live() {
        let h = Harness::new();
        let init = h.initiator();
        let path = init.client.path();

        assert!(!h.relay.paths().prune(&path));
        assert!(!path.is_orphan());
        assert!(Arc::ptr_eq(
            &h.relay.paths().get(path.key_hex()).unwrap(),
            &path
        ));
    }

    #[test]
    fn concurrent_join_and_leave_keep_clients_on_live_path() {
        let h = Harness::new();
        let key = KeyPair::generate().public_key().clone();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..200 {
                        let mut conn = h.connect(&key, TestPeer::new());
                        let hello = conn.peer.client_hello();
                        conn.client.received(&hello).unwrap();
                        let auth = conn.peer.client_auth(&[SUBPROTOCOL_V1], 0, None);
                        conn.client.received(&auth).unwrap();
                        // Other threads may run our server-auth job.
                        while !conn.client.is_authenticated() {
                            h.jobs.run_pending();
                            std::thread::yield_now();
                        }

                        let path = conn.client.path();
                        let live = h
                            .relay
                            .paths()
                            .get(path.key_hex())
                            .expect("authenticated client on unregistered path");
                        assert!(Arc::ptr_eq(&live, &path));

                        // No initiator: leaving reports NoInitiator.
                        let _ = conn.client.disconnected();
                    }
                });
            }
        });
        h.jobs.run_pending();
        assert!(h.relay.paths().is_empty());
    }

    #[test]
    fn full_path_closes_with_3000() {
        let h = Harness::new();
        let key = KeyPair::generate().public_key().clone();
        let path = h.relay.paths().get_or_create(&key);

        // Occupy every responder slot.
        let (sink, _rx) = ConnectionSink::channel();
        let filler = Client::new(h.relay.clone(), path.clone(), sink, SUBPROTOCOL_V1);
        for _ in Address::responders() {
            path.slots().add_responder(filler.clone()).unwrap();
        }

        let mut conn = h.connect(&key, TestPeer::new());
        let hello = conn.peer.client_hello();
        conn.client.received(&hello).unwrap();
        let auth = conn.peer.client_auth(&[SUBPROTOCOL_V1], 0, None);
        conn.client.received(&auth).unwrap();
        h.jobs.run_pending();

        assert_eq!(conn.next_outbound(), Outbound::Close(CloseCode::PathFull));
        assert!(!conn.client.is_authenticated());
    }

    #[test]
    fn notification_to_vanished_writer_is_harmless() {
        let h = Harness::new();
        let init = h.initiator();
        let key = init.peer.public_key().clone();
        drop(init.rx);

        let resp = h.responder(&key);
        assert!(resp.client.is_authenticated());
        assert!(init.client.is_authenticated());
    }
}
