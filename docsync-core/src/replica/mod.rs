//! Replica store: one CRDT document per document id.
//!
//! Built on Automerge. A [`Replica`] owns the document and an outbox of
//! deltas waiting for the live channel; a [`ReplicaHandle`] is the shared
//! reference the editing layer, provider and relay all hold; the
//! [`ReplicaStore`] guarantees there is exactly one handle per document.

mod document;
mod storage;
mod store;

pub use document::{LocalMutation, Replica, ReplicaError, CONTENT_KEY, TITLE_KEY};
pub use storage::{LocalDocStorage, LocalStorageError};
pub use store::{ChangeOrigin, ReplicaHandle, ReplicaStore};
