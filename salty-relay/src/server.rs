//! Relay server: listener, accept loop and shutdown.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::TcpListener;

use salty_core::{Relay, RelayOptions};
use salty_types::KeyPair;

use crate::config::Config;
use crate::connection::{self, ConnectionContext};
use crate::error::{RelayError, Result};
use crate::pool::WorkerPool;

/// A bound relay server.
pub struct RelayServer {
    listener: TcpListener,
    context: Arc<ConnectionContext>,
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("relay", &self.context.relay)
            .field("pool", &self.context.pool)
            .finish()
    }
}

impl RelayServer {
    /// Validate `config` and bind its listen address.
    ///
    /// `permanent_keys` must already be loaded; the first is the primary
    /// key. A bind failure is reported as [`RelayError::Bind`].
    pub async fn bind(config: &Config, permanent_keys: Vec<KeyPair>) -> Result<Self> {
        config.validate()?;
        if permanent_keys.is_empty() {
            tracing::warn!("No permanent keys configured; every client-auth will fail");
        }

        let address = &config.server.bind_address;
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| RelayError::Bind {
                address: address.clone(),
                source,
            })?;

        let pool = WorkerPool::new(&config.workers, tokio::runtime::Handle::current());
        let relay = Arc::new(Relay::new(
            RelayOptions {
                subprotocols: config.server.subprotocols.clone(),
                permanent_keys,
            },
            Arc::new(pool.clone()),
        ));

        tracing::info!(
            "Relay listening on {} ({} workers, subprotocols: {})",
            listener.local_addr()?,
            pool.size(),
            config.server.subprotocols.join(", ")
        );

        Ok(Self {
            listener,
            context: Arc::new(ConnectionContext {
                relay,
                pool,
                limits: config.limits.clone(),
            }),
        })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared relay state.
    pub fn relay(&self) -> Arc<Relay> {
        self.context.relay.clone()
    }

    /// Accept connections forever.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` completes, then stop the pool
    /// and log metrics.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!("set_nodelay for {} failed: {}", peer, e);
                        }
                        tokio::spawn(connection::handle(stream, peer, self.context.clone()));
                    }
                    // Per-connection accept failures (e.g. EMFILE) must not stop the server
                    Err(e) => tracing::warn!("Accept failed: {}", e),
                }
            }
        }

        tracing::info!("Shutting down");
        self.context.pool.close();
        log_metrics(&self.context.relay);
        Ok(())
    }
}

fn log_metrics(relay: &Relay) {
    let m = relay.metrics();
    tracing::info!(
        "Metrics: connections={} authenticated={} relayed={} ({} bytes) protocol_errors={} dropped={} send_errors={} paths={}",
        m.connections_total.load(Ordering::Relaxed),
        m.authenticated_total.load(Ordering::Relaxed),
        m.relayed_messages.load(Ordering::Relaxed),
        m.relayed_bytes.load(Ordering::Relaxed),
        m.protocol_errors.load(Ordering::Relaxed),
        m.dropped_responders.load(Ordering::Relaxed),
        m.send_errors.load(Ordering::Relaxed),
        relay.paths().len()
    );
}
