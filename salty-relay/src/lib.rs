//! # salty-relay
//!
//! SaltyRTC signalling relay server.
//!
//! Clients connect over WebSocket to `/<initiator public key as hex>`,
//! authenticate against the server, and then exchange end-to-end
//! encrypted frames with the other clients on the same path. The relay
//! only sees headers.
//!
//! ## Architecture
//!
//! ```text
//! Initiator ──┐                         ┌── Responder 0x02
//!             │   WebSocket (binary)    │
//!             ├────────────────────────►├── Responder 0x03
//!             │                         │
//!         ┌───┴─────────────────────────┴───┐
//!         │           salty-relay           │
//!         │  accept ─► connection tasks     │
//!         │              │                  │
//!         │              ▼                  │
//!         │   WorkerPool ─► salty-core      │
//!         │                 (Client, Path)  │
//!         └─────────────────────────────────┘
//! ```
//!
//! Each connection has a reader that feeds frames to the [`pool::WorkerPool`]
//! one at a time, and a writer that drains the client's outbound queue.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
mod connection;
pub mod error;
pub mod keys;
pub mod pool;
pub mod server;

pub use config::Config;
pub use error::{PoolError, RelayError, Result};
pub use server::RelayServer;
