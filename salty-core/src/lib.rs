//! # salty-core
//!
//! Protocol logic of the SaltyRTC signalling relay, with no I/O.
//!
//! This crate decides what happens to every frame a client sends; the
//! server crate only moves bytes. Key pieces:
//! - [`Client`] - Per-connection handshake, framing and relay state machine
//! - [`Path`], [`SlotMap`] - Initiator and responder slots of one path
//! - [`Paths`] - Registry of live paths
//! - [`Relay`] - Shared context (keys, subprotocols, paths, metrics)
//! - [`ConnectionSink`] - Outbound queue towards a connection writer
//! - [`Dispatcher`] - Where deferred jobs run
//!
//! ## Testing
//!
//! Everything is synchronous. Drive a [`Relay`] with a
//! [`QueuedDispatcher`] and in-memory sinks, and script clients with
//! `testing::TestPeer` (feature `testing`).

#![warn(missing_docs)]
#![warn(clippy::all)]

mod client;
mod dispatch;
mod error;
mod outbound;
mod path;
mod paths;
mod relay;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{Client, HandshakeState};
pub use dispatch::{Dispatcher, Job, QueuedDispatcher};
pub use error::{Direction, ProtocolError, ProtocolResult};
pub use outbound::{ConnectionSink, Outbound};
pub use path::{Path, SlotMap, SlotsFull};
pub use paths::Paths;
pub use relay::{Relay, RelayMetrics, RelayOptions};
