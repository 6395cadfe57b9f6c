//! Shared replica handles and the per-process replica store.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, Notify};

use super::document::{LocalMutation, Replica, ReplicaError};
use super::storage::LocalDocStorage;
use crate::document_id::DocumentId;
use crate::snapshot::EncodedSnapshot;

/// Where a replica change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

struct Inner {
    document_id: DocumentId,
    replica: Mutex<Replica>,
    /// Wakes the transport when local deltas are queued.
    local_change: Notify,
    changes: broadcast::Sender<ChangeOrigin>,
}

/// Cheaply cloneable reference to one shared replica.
///
/// Every clone points at the same document; the store hands out exactly one
/// underlying instance per document id, and the provider and relay hold
/// clones of that instance rather than copies of its state.
#[derive(Clone)]
pub struct ReplicaHandle {
    inner: Arc<Inner>,
}

impl ReplicaHandle {
    pub fn new(document_id: DocumentId, replica: Replica) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                document_id,
                replica: Mutex::new(replica),
                local_change: Notify::new(),
                changes,
            }),
        }
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.inner.document_id
    }

    /// True if both handles refer to the same replica instance.
    pub fn ptr_eq(&self, other: &ReplicaHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Applies a local mutation. Visible immediately, propagated later.
    pub async fn apply(&self, mutation: LocalMutation) -> Result<(), ReplicaError> {
        self.inner.replica.lock().await.apply(mutation)?;
        self.inner.local_change.notify_one();
        let _ = self.inner.changes.send(ChangeOrigin::Local);
        Ok(())
    }

    pub async fn encode(&self) -> EncodedSnapshot {
        self.inner.replica.lock().await.encode()
    }

    /// Merges a full remote snapshot.
    pub async fn merge(&self, snapshot: &EncodedSnapshot) -> Result<usize, ReplicaError> {
        let applied = self.inner.replica.lock().await.merge(snapshot)?;
        if applied > 0 {
            let _ = self.inner.changes.send(ChangeOrigin::Remote);
        }
        Ok(applied)
    }

    /// Applies a delta received from a peer.
    pub async fn apply_remote(&self, delta: &[u8]) -> Result<usize, ReplicaError> {
        let applied = self.inner.replica.lock().await.apply_remote(delta)?;
        if applied > 0 {
            let _ = self.inner.changes.send(ChangeOrigin::Remote);
        }
        Ok(applied)
    }

    pub async fn take_pending(&self) -> Vec<Vec<u8>> {
        self.inner.replica.lock().await.take_pending()
    }

    pub async fn clear_pending(&self) {
        self.inner.replica.lock().await.clear_pending();
    }

    pub async fn pending_len(&self) -> usize {
        self.inner.replica.lock().await.pending_len()
    }

    pub async fn text(&self) -> Result<String, ReplicaError> {
        self.inner.replica.lock().await.text()
    }

    pub async fn title(&self) -> Result<String, ReplicaError> {
        self.inner.replica.lock().await.title()
    }

    pub async fn heads(&self) -> Vec<automerge::ChangeHash> {
        self.inner.replica.lock().await.heads()
    }

    /// Resolves once a local mutation has been queued since the last call.
    pub async fn local_change(&self) {
        self.inner.local_change.notified().await;
    }

    /// Subscribes to change notifications.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeOrigin> {
        self.inner.changes.subscribe()
    }
}

impl std::fmt::Debug for ReplicaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaHandle")
            .field("document_id", &self.inner.document_id)
            .finish()
    }
}

/// Holds one replica per document id.
pub struct ReplicaStore {
    storage: Option<LocalDocStorage>,
    replicas: Mutex<HashMap<DocumentId, ReplicaHandle>>,
}

impl ReplicaStore {
    /// A store that keeps replicas in memory only.
    pub fn in_memory() -> Self {
        Self {
            storage: None,
            replicas: Mutex::new(HashMap::new()),
        }
    }

    /// A store backed by local disk storage.
    pub fn with_storage(storage: LocalDocStorage) -> Self {
        Self {
            storage: Some(storage),
            replicas: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the shared replica for `document_id`, loading it from disk or
    /// creating it from genesis on first use.
    pub async fn open(&self, document_id: &DocumentId) -> Result<ReplicaHandle, ReplicaError> {
        let mut replicas = self.replicas.lock().await;

        if let Some(handle) = replicas.get(document_id) {
            return Ok(handle.clone());
        }

        let stored = match &self.storage {
            Some(storage) => storage.load(document_id)?,
            None => None,
        };

        let replica = match stored {
            Some(snapshot) => {
                tracing::debug!("Loaded local replica for {}", document_id);
                Replica::from_snapshot(&snapshot)?
            }
            None => Replica::new(),
        };

        let handle = ReplicaHandle::new(document_id.clone(), replica);
        replicas.insert(document_id.clone(), handle.clone());
        Ok(handle)
    }

    /// Writes the replica to local storage.
    ///
    /// Returns `Ok(false)` if the store is memory-only or the document is not open.
    pub async fn persist(&self, document_id: &DocumentId) -> Result<bool, ReplicaError> {
        let Some(storage) = &self.storage else {
            return Ok(false);
        };

        let handle = match self.replicas.lock().await.get(document_id) {
            Some(handle) => handle.clone(),
            None => return Ok(false),
        };

        let snapshot = handle.encode().await;
        storage.save(document_id, &snapshot)?;
        Ok(true)
    }

    /// Ids of all currently open replicas.
    pub async fn open_documents(&self) -> Vec<DocumentId> {
        let mut ids: Vec<_> = self.replicas.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
