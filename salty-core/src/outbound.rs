//! Outbound side of a connection.
//!
//! The core never touches sockets. Everything a client sends, relayed
//! frames included, goes into an unbounded channel drained by the
//! connection's writer task, so sending never blocks protocol logic.

use std::time::Duration;

use salty_types::CloseCode;
use tokio::sync::mpsc;

/// A command for a connection writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Send a binary WebSocket message.
    Binary(Vec<u8>),
    /// Send a close frame with this code, then stop.
    Close(CloseCode),
    /// Start sending WebSocket pings at this interval.
    KeepAlive(Duration),
}

/// Handle for queueing outbound commands on one connection.
#[derive(Debug, Clone)]
pub struct ConnectionSink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionSink {
    /// New sink and the receiver its writer drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a binary message. Returns false if the writer is gone.
    pub fn send_binary(&self, data: Vec<u8>) -> bool {
        self.tx.send(Outbound::Binary(data)).is_ok()
    }

    /// Ask the writer to close the connection.
    pub fn close(&self, code: CloseCode) {
        let _ = self.tx.send(Outbound::Close(code));
    }

    /// Ask the writer to start pinging.
    pub fn keep_alive(&self, interval: Duration) {
        let _ = self.tx.send(Outbound::KeepAlive(interval));
    }

    /// True once the writer has dropped its receiver.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
