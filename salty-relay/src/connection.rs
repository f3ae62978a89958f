//! One WebSocket connection: upgrade, reader loop, writer task, teardown.
//!
//! The reader hands every binary frame to the worker pool and waits for
//! the result before reading the next one, so frames of one connection
//! are handled in arrival order. Everything the protocol wants to send
//! arrives on the client's outbound channel and is written by a separate
//! writer task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use salty_core::{Client, ConnectionSink, Outbound, ProtocolError, Relay};
use salty_types::crypto::public_key_from_hex;
use salty_types::{CloseCode, PublicKey, KEY_SIZE};

use crate::config::LimitsConfig;
use crate::error::{PoolError, Result};
use crate::pool::WorkerPool;

type WsStream = WebSocketStream<TcpStream>;

/// What every connection task shares.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionContext {
    pub relay: Arc<Relay>,
    pub pool: WorkerPool,
    pub limits: LimitsConfig,
}

/// Outcome of the upgrade callback.
struct Upgrade {
    key: PublicKey,
    subprotocol: Option<String>,
}

/// Why the reader stopped.
enum ReadEnd {
    /// The peer went away or sent a close frame.
    Peer,
    /// We asked the writer to close.
    Closing,
    /// The writer task already finished.
    WriterDone,
}

/// Serve one accepted TCP connection until it closes.
pub(crate) async fn handle(stream: TcpStream, peer: SocketAddr, ctx: Arc<ConnectionContext>) {
    if let Err(e) = serve(stream, peer, &ctx).await {
        tracing::debug!("Connection from {} ended: {}", peer, e);
    }
}

async fn serve(stream: TcpStream, peer: SocketAddr, ctx: &ConnectionContext) -> Result<()> {
    let deadline = Duration::from_secs(ctx.limits.handshake_timeout_secs);
    let Ok(accepted) = tokio::time::timeout(deadline, accept_upgrade(stream, ctx)).await else {
        tracing::debug!("Upgrade from {} not finished in {}s", peer, deadline.as_secs());
        return Ok(());
    };
    let Some((mut ws, upgrade)) = accepted? else {
        return Ok(());
    };

    let Some(subprotocol) = upgrade.subprotocol else {
        tracing::info!("Connection from {} shares no subprotocol", peer);
        ws.close(Some(close_frame(CloseCode::SubprotocolError)))
            .await?;
        return Ok(());
    };

    let path = ctx.relay.paths().get_or_create(&upgrade.key);
    let (sink, outbound) = ConnectionSink::channel();
    let client = Client::new(ctx.relay.clone(), path.clone(), sink, subprotocol);
    tracing::info!(
        "Connection {} from {} on path {}",
        client.connection_id(),
        peer,
        path.number()
    );

    let (write, read) = ws.split();
    let mut writer = tokio::spawn(write_loop(write, outbound, client.connection_id()));

    let hello = {
        let client = client.clone();
        ctx.pool.execute(move || client.send_server_hello()).await
    };
    let end = match hello {
        Ok(Ok(())) => read_loop(read, &client, ctx, &mut writer).await,
        Ok(Err(e)) => {
            client.fail(&e);
            ReadEnd::Closing
        }
        Err(e) => {
            pool_failure(&client, e);
            ReadEnd::Closing
        }
    };

    teardown(&client, ctx).await;

    if !matches!(end, ReadEnd::WriterDone) {
        if matches!(end, ReadEnd::Peer) {
            client.close(CloseCode::Normal);
        }
        let _ = writer.await;
    }
    tracing::info!("Connection {} closed", client.connection_id());
    Ok(())
}

/// Run the WebSocket upgrade, validating the path and picking a
/// subprotocol. Returns `None` if the request was rejected.
async fn accept_upgrade(
    stream: TcpStream,
    ctx: &ConnectionContext,
) -> Result<Option<(WsStream, Upgrade)>> {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(ctx.limits.max_message_size);
    config.max_frame_size = Some(ctx.limits.max_message_size);

    let mut outcome: Option<Upgrade> = None;
    let relay = &ctx.relay;
    let callback = |request: &Request, mut response: Response| {
        let Some(key) = path_key(request.uri().path()) else {
            tracing::debug!("Rejecting upgrade for path {}", request.uri().path());
            return Err(reject(StatusCode::BAD_REQUEST, "invalid path"));
        };

        let offered = request
            .headers()
            .get_all(SEC_WEBSOCKET_PROTOCOL)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','));
        let subprotocol = relay.negotiate_subprotocol(offered);
        if let Some(value) = subprotocol
            .as_deref()
            .and_then(|p| HeaderValue::from_str(p).ok())
        {
            response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }

        outcome = Some(Upgrade { key, subprotocol });
        Ok(response)
    };

    let accepted =
        tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(config)).await;
    let ws = match accepted {
        Ok(ws) => ws,
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            tracing::debug!("Upgrade rejected with {}", response.status());
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    Ok(outcome.map(|upgrade| (ws, upgrade)))
}

/// Initiator key from a request path of exactly 64 hex characters.
fn path_key(path: &str) -> Option<PublicKey> {
    let encoded = path.strip_prefix('/')?;
    if encoded.len() != KEY_SIZE * 2 || !encoded.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    public_key_from_hex(encoded).ok()
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

fn close_frame(code: CloseCode) -> CloseFrame<'static> {
    CloseFrame {
        code: WsCloseCode::from(code.code()),
        reason: code.reason().into(),
    }
}

async fn read_loop(
    mut read: SplitStream<WsStream>,
    client: &Arc<Client>,
    ctx: &ConnectionContext,
    writer: &mut JoinHandle<()>,
) -> ReadEnd {
    let deadline = tokio::time::sleep(Duration::from_secs(ctx.limits.handshake_timeout_secs));
    tokio::pin!(deadline);
    let mut handshake_pending = true;

    loop {
        tokio::select! {
            _ = &mut deadline, if handshake_pending => {
                handshake_pending = false;
                if !client.is_authenticated() {
                    tracing::warn!(
                        "Connection {}: handshake not finished in {}s",
                        client.connection_id(),
                        ctx.limits.handshake_timeout_secs
                    );
                    client.close(CloseCode::Timeout);
                    return ReadEnd::Closing;
                }
            }
            _ = &mut *writer => return ReadEnd::WriterDone,
            frame = read.next() => match frame {
                Some(Ok(Message::Binary(data))) => {
                    let handler = client.clone();
                    match ctx.pool.execute(move || handler.received(&data)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            client.fail(&e);
                            return ReadEnd::Closing;
                        }
                        Err(e) => {
                            pool_failure(client, e);
                            return ReadEnd::Closing;
                        }
                    }
                }
                Some(Ok(Message::Text(_))) => {
                    tracing::warn!("Connection {}: text message", client.connection_id());
                    client.close(CloseCode::ProtocolError);
                    return ReadEnd::Closing;
                }
                Some(Ok(Message::Close(_))) | None => return ReadEnd::Peer,
                // Pings are answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => match read_error_code(&e) {
                    Some(code) => {
                        tracing::warn!("Connection {}: read error: {}", client.connection_id(), e);
                        client.close(code);
                        return ReadEnd::Closing;
                    }
                    None => {
                        tracing::debug!("Connection {}: read error: {}", client.connection_id(), e);
                        return ReadEnd::Peer;
                    }
                },
            }
        }
    }
}

/// Close code for a read error the peer caused, or `None` if the
/// connection is simply gone.
fn read_error_code(err: &WsError) -> Option<CloseCode> {
    match err {
        WsError::Capacity(_) => Some(CloseCode::MessageTooBig),
        WsError::Protocol(_) => Some(CloseCode::ProtocolError),
        _ => None,
    }
}

fn pool_failure(client: &Client, err: PoolError) {
    tracing::error!("Connection {}: {}", client.connection_id(), err);
    client.close(CloseCode::InternalError);
}

/// Free the client's slot and notify the rest of the path.
async fn teardown(client: &Arc<Client>, ctx: &ConnectionContext) {
    let leaving = client.clone();
    let result = match ctx.pool.execute(move || leaving.disconnected()).await {
        Ok(result) => result,
        // Slot bookkeeping must happen even when the pool refuses work.
        Err(_) => client.disconnected(),
    };
    match result {
        Ok(()) => {}
        Err(ProtocolError::NoInitiator) => tracing::debug!(
            "Connection {}: responder left a path without initiator",
            client.connection_id()
        ),
        Err(e) => tracing::warn!("Connection {}: teardown: {}", client.connection_id(), e),
    }
}

async fn write_loop(
    mut write: SplitSink<WsStream, Message>,
    mut outbound: UnboundedReceiver<Outbound>,
    connection_id: u64,
) {
    let mut ping: Option<Interval> = None;
    loop {
        let command = tokio::select! {
            command = outbound.recv() => command,
            _ = tick(&mut ping) => {
                if write.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
                continue;
            }
        };

        match command {
            Some(Outbound::Binary(data)) => {
                if let Err(e) = write.send(Message::Binary(data)).await {
                    tracing::debug!("Connection {}: write error: {}", connection_id, e);
                    break;
                }
            }
            Some(Outbound::KeepAlive(period)) if !period.is_zero() => {
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ping = Some(interval);
            }
            Some(Outbound::KeepAlive(_)) => ping = None,
            Some(Outbound::Close(code)) => {
                let _ = write.send(Message::Close(Some(close_frame(code)))).await;
                break;
            }
            None => {
                let _ = write.close().await;
                break;
            }
        }
    }
}

async fn tick(ping: &mut Option<Interval>) {
    match ping {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_key_requires_64_hex_chars() {
        let hex = "ee".repeat(32);
        assert!(path_key(&format!("/{hex}")).is_some());
        assert!(path_key(&format!("/{}", hex.to_uppercase())).is_some());

        assert!(path_key(&hex).is_none());
        assert!(path_key("/").is_none());
        assert!(path_key(&format!("/{}", &hex[..62])).is_none());
        assert!(path_key(&format!("/{hex}00")).is_none());
        assert!(path_key(&format!("/{}zz", &hex[..62])).is_none());
        assert!(path_key(&format!("/{hex}/")).is_none());
    }

    #[test]
    fn close_frames_carry_relay_codes() {
        let frame = close_frame(CloseCode::DropByInitiator);
        assert_eq!(u16::from(frame.code), 3004);
        assert_eq!(frame.reason, CloseCode::DropByInitiator.reason());
    }

    #[test]
    fn peer_faults_on_read_get_a_close_code() {
        use tokio_tungstenite::tungstenite::error::{CapacityError, ProtocolError as WsProtocolError};

        let too_long = WsError::Capacity(CapacityError::MessageTooLong { size: 10, max_size: 5 });
        assert_eq!(read_error_code(&too_long), Some(CloseCode::MessageTooBig));
        let masked = WsError::Protocol(WsProtocolError::UnmaskedFrameFromClient);
        assert_eq!(read_error_code(&masked), Some(CloseCode::ProtocolError));
        assert_eq!(read_error_code(&WsError::ConnectionClosed), None);
        assert_eq!(read_error_code(&WsError::AlreadyClosed), None);
    }

    #[test]
    fn rejection_has_status_and_reason() {
        let response = reject(StatusCode::BAD_REQUEST, "invalid path");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.body().as_deref(), Some("invalid path"));
    }
}
