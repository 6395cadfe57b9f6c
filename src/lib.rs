//! Docsync server and client support.
//!
//! The replica, presence and provider machinery lives in `docsync-core`;
//! this crate adds configuration and the sync server.

pub mod config;
pub mod server;
