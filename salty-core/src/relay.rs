//! Shared relay context.
//!
//! One `Relay` per server: the permanent keys, supported subprotocols,
//! the path registry, the job dispatcher and operational counters. Every
//! client holds an `Arc` to it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use salty_types::{KeyPair, PublicKey};

use crate::dispatch::{Dispatcher, Job};
use crate::paths::Paths;

/// Operational metrics for monitoring relay activity.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Connections handed to the protocol.
    pub connections_total: AtomicU64,
    /// Clients that completed the handshake.
    pub authenticated_total: AtomicU64,
    /// Frames relayed between clients.
    pub relayed_messages: AtomicU64,
    /// Bytes relayed between clients.
    pub relayed_bytes: AtomicU64,
    /// Connections closed for a protocol error.
    pub protocol_errors: AtomicU64,
    /// Responders dropped on an initiator's request.
    pub dropped_responders: AtomicU64,
    /// `send-error` messages sent.
    pub send_errors: AtomicU64,
}

impl RelayMetrics {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Settings the relay core needs.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Supported subprotocols, most preferred first.
    pub subprotocols: Vec<String>,
    /// Permanent key pairs. The first one is used when a client does not
    /// ask for a specific key.
    pub permanent_keys: Vec<KeyPair>,
}

/// Shared state of one relay server.
pub struct Relay {
    subprotocols: Vec<String>,
    permanent_keys: Vec<Arc<KeyPair>>,
    paths: Paths,
    dispatcher: Arc<dyn Dispatcher>,
    metrics: RelayMetrics,
    next_connection: AtomicU64,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("subprotocols", &self.subprotocols)
            .field("permanent_keys", &self.permanent_keys.len())
            .field("paths", &self.paths.len())
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl Relay {
    /// Create a relay that runs deferred work on `dispatcher`.
    pub fn new(options: RelayOptions, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            subprotocols: options.subprotocols,
            permanent_keys: options.permanent_keys.into_iter().map(Arc::new).collect(),
            paths: Paths::new(),
            dispatcher,
            metrics: RelayMetrics::default(),
            next_connection: AtomicU64::new(1),
        }
    }

    /// Supported subprotocols, most preferred first.
    pub fn subprotocols(&self) -> &[String] {
        &self.subprotocols
    }

    /// Pick the first subprotocol offered by the client that we support.
    pub fn negotiate_subprotocol<'a, I>(&self, offered: I) -> Option<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        offered
            .into_iter()
            .map(str::trim)
            .find(|p| self.subprotocols.iter().any(|s| s == p))
            .map(str::to_owned)
    }

    /// Key pair used when a client does not request one.
    pub fn primary_key(&self) -> Option<Arc<KeyPair>> {
        self.permanent_keys.first().cloned()
    }

    /// Key pair whose public half is `public`.
    pub fn find_permanent_key(&self, public: &PublicKey) -> Option<Arc<KeyPair>> {
        self.permanent_keys
            .iter()
            .find(|pair| pair.public_key() == public)
            .cloned()
    }

    /// Path registry.
    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    /// Operational metrics.
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Schedule deferred work.
    pub fn dispatch(&self, job: Job) {
        self.dispatcher.dispatch(job);
    }

    /// Allocate an id for a new connection, for logs.
    pub fn next_connection_id(&self) -> u64 {
        RelayMetrics::bump(&self.metrics.connections_total);
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }
}
