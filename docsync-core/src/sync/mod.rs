//! Client side of the sync server.
//!
//! - [`SnapshotClient`] pushes full replicas to `POST /sync` for durable merging.
//! - [`RelayMessage`] is the CBOR frame format of the live relay channel.
//! - Request/response bodies shared with the server live in [`protocol`].

mod client;
mod error;
pub mod protocol;

pub use client::{check_server, http_url, ws_url, SnapshotClient};
pub use error::SyncError;
pub use protocol::RelayMessage;
