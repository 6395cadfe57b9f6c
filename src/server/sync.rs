//! Snapshot sync: merge an incoming replica into the durable record.
//!
//! The load, merge and write sequence is a critical section per document.
//! Writers in this process queue on a per-document lock; writers that get
//! past it anyway (another process on the same database) are caught by the
//! version check on the conditional update, and the sequence re-runs
//! against the newer record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use docsync_core::{merge_snapshots, ClientId, DecodeError, DocumentId, EncodedSnapshot};
use tokio::sync::OwnedMutexGuard;

use super::error::ApiError;
use super::storage::DocumentStore;

/// Attempts before a version conflict is reported as a storage error.
const MAX_ATTEMPTS: usize = 5;

/// What a sync did to the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The merge added changes; the record is now at `version`.
    Merged { version: i64 },
    /// The record already contained everything; nothing was written.
    Unchanged,
}

/// Per-document async locks.
#[derive(Debug, Default)]
struct DocumentLocks {
    locks: Mutex<HashMap<DocumentId, Arc<tokio::sync::Mutex<()>>>>,
}

impl DocumentLocks {
    async fn acquire(&self, document_id: &DocumentId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            // Drop locks nobody holds or waits on
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(document_id.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Merge-then-write service behind `POST /sync`.
#[derive(Debug)]
pub struct SnapshotSync {
    store: DocumentStore,
    locks: DocumentLocks,
}

impl SnapshotSync {
    pub fn new(store: DocumentStore) -> Self {
        Self {
            store,
            locks: DocumentLocks::default(),
        }
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    #[cfg(test)]
    pub(crate) async fn lock(&self, document_id: &DocumentId) -> OwnedMutexGuard<()> {
        self.locks.acquire(document_id).await
    }

    /// Merges `incoming` into the record for `document_id`.
    pub async fn sync(
        &self,
        document_id: &DocumentId,
        incoming: &EncodedSnapshot,
        client_id: &ClientId,
    ) -> Result<SyncOutcome, ApiError> {
        // Reject garbage and foreign documents before touching the record
        incoming.decode_document()?;

        let _guard = self.locks.acquire(document_id).await;

        for attempt in 1..=MAX_ATTEMPTS {
            let record = self
                .store
                .get(document_id)
                .await?
                .ok_or_else(|| ApiError::NotFound(document_id.to_string()))?;

            let merged = merge_snapshots(&record.snapshot(), incoming).map_err(|e| match e {
                // The merge result would not load as a document
                DecodeError::Shape(_) => ApiError::Decode(e),
                e => ApiError::Storage(format!(
                    "persisted snapshot for {} is unreadable: {}",
                    document_id, e
                )),
            })?;

            if merged.is_unchanged() {
                tracing::debug!("Sync from {} for {} added nothing", client_id, document_id);
                return Ok(SyncOutcome::Unchanged);
            }

            if self
                .store
                .update_if_version(document_id, &merged.snapshot, client_id, record.version)
                .await?
            {
                tracing::info!(
                    "Merged {} changes from {} into {} (version {})",
                    merged.new_changes,
                    client_id,
                    document_id,
                    record.version + 1
                );
                return Ok(SyncOutcome::Merged {
                    version: record.version + 1,
                });
            }

            tracing::warn!(
                "Version conflict syncing {} (attempt {}/{})",
                document_id,
                attempt,
                MAX_ATTEMPTS
            );
        }

        Err(ApiError::Storage(format!(
            "gave up on {} after {} conflicting writes",
            document_id, MAX_ATTEMPTS
        )))
    }
}
