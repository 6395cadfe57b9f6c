//! The relay seam: what a concrete live-channel transport must provide.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;

use crate::broker::Credential;
use crate::presence::PresenceChannel;
use crate::replica::ReplicaHandle;

/// Status events a relay emits over the life of a connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    /// A new connection attempt started.
    Connecting,
    /// The transport is up.
    Connected,
    /// Initial reconciliation with the relay's state completed.
    Synced,
    /// The connection ended.
    Disconnected,
}

/// Relay failures. The provider adapter logs and swallows these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("no credential available")]
    MissingCredential,

    #[error("credential expired")]
    ExpiredCredential,

    #[error("relay was destroyed")]
    Destroyed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// A live-channel transport for one document.
///
/// The relay owns the replica and presence instances it synchronizes; the
/// accessors hand out those same instances, never copies.
pub trait Relay: Send + Sync + 'static {
    fn replica(&self) -> &ReplicaHandle;

    fn presence(&self) -> &Arc<PresenceChannel>;

    /// Subscribes to status events.
    fn status(&self) -> broadcast::Receiver<RelayStatus>;

    /// True while a connection attempt is in progress or established.
    fn is_active(&self) -> bool;

    /// Supplies the credential used by the next connection attempt.
    fn authorize(&self, credential: Credential) -> impl Future<Output = ()> + Send;

    /// Starts a connection attempt. Returns once the attempt is underway;
    /// progress is reported through [`Relay::status`]. Calling this while
    /// already active is a no-op.
    fn connect(&self) -> impl Future<Output = Result<(), RelayError>> + Send;

    fn disconnect(&self) -> impl Future<Output = Result<(), RelayError>> + Send;

    /// Disconnects and refuses further connection attempts.
    fn destroy(&self) -> impl Future<Output = ()> + Send;
}
