//! Docsync Core Library
//!
//! Replicas, presence, the provider adapter and the sync clients shared by
//! docsync applications.

pub mod broker;
pub mod document_id;
pub mod presence;
pub mod provider;
pub mod replica;
pub mod session;
pub mod snapshot;
pub mod sync;

pub use broker::{Credential, TokenBroker};
pub use document_id::{ClientId, DocumentId, DocumentIdError};
pub use presence::{Cursor, PresenceChannel, PresenceState, PresenceUpdate};
pub use provider::{
    ConnectionState, LinkState, ProviderAdapter, Relay, RelayError, RelayStatus, WebSocketRelay,
};
pub use replica::{
    ChangeOrigin, LocalDocStorage, LocalMutation, LocalStorageError, Replica, ReplicaError,
    ReplicaHandle, ReplicaStore,
};
pub use session::{CollabSession, SessionConfig, SessionMode};
pub use snapshot::{merge_snapshots, DecodeError, EncodedSnapshot, Merged};
pub use sync::{check_server, RelayMessage, SnapshotClient, SyncError};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
