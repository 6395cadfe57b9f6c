//! Durable document records and collaboration sessions in SQLite.
//!
//! ```text
//! documents       document_id | snapshot | last_client_id | created_at | updated_at | version
//! collab_sessions document_id | session_id | created_at
//! ```
//!
//! Writes to `documents` are conditional on `version`, so a writer that
//! loaded a stale record never overwrites a newer one.

use chrono::Utc;
use docsync_core::{ClientId, DocumentId, EncodedSnapshot};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Initialize the database connection pool and run migrations
pub async fn init_db(path: &Path) -> Result<SqlitePool, StorageError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| StorageError::Io(parent.display().to_string(), e))?;
    }

    let db_url = format!("sqlite:{}?mode=rwc", path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| StorageError::Migration(e.to_string()))?;

    Ok(pool)
}

/// The persisted row for a document.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DocumentRecord {
    pub document_id: String,
    pub snapshot: Vec<u8>,
    pub last_client_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub version: i64,
}

impl DocumentRecord {
    pub fn snapshot(&self) -> EncodedSnapshot {
        EncodedSnapshot::new(self.snapshot.clone())
    }
}

/// Errors from the document store.
#[derive(Debug)]
pub enum StorageError {
    Database(sqlx::Error),
    Migration(String),
    Io(String, std::io::Error),
    AlreadyExists(String),
}

impl StorageError {
    /// True if the database itself could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StorageError::Database(
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ) | StorageError::Io(..)
        )
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Database(e) => write!(f, "Database error: {}", e),
            StorageError::Migration(e) => write!(f, "Migration failed: {}", e),
            StorageError::Io(path, e) => write!(f, "I/O error for {}: {}", path, e),
            StorageError::AlreadyExists(id) => write!(f, "Document already exists: {}", id),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Database(e) => Some(e),
            StorageError::Io(_, e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        StorageError::Database(e)
    }
}

/// Document and session records.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    pool: SqlitePool,
}

impl DocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Provisions a new document record.
    pub async fn create(
        &self,
        document_id: &DocumentId,
        snapshot: &EncodedSnapshot,
        client_id: Option<&ClientId>,
    ) -> Result<DocumentRecord, StorageError> {
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            "INSERT INTO documents (document_id, snapshot, last_client_id, created_at, updated_at, version)
             VALUES (?, ?, ?, ?, ?, 0)
             ON CONFLICT(document_id) DO NOTHING",
        )
        .bind(document_id.as_str())
        .bind(snapshot.as_bytes())
        .bind(client_id.map(|c| c.as_str()))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::AlreadyExists(document_id.to_string()));
        }

        self.get(document_id)
            .await?
            .ok_or_else(|| StorageError::Database(sqlx::Error::RowNotFound))
    }

    pub async fn get(&self, document_id: &DocumentId) -> Result<Option<DocumentRecord>, StorageError> {
        let record = sqlx::query_as::<_, DocumentRecord>(
            "SELECT document_id, snapshot, last_client_id, created_at, updated_at, version
             FROM documents WHERE document_id = ?",
        )
        .bind(document_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn list(&self) -> Result<Vec<DocumentRecord>, StorageError> {
        let records = sqlx::query_as::<_, DocumentRecord>(
            "SELECT document_id, snapshot, last_client_id, created_at, updated_at, version
             FROM documents ORDER BY document_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Writes a new snapshot if the record is still at `expected_version`.
    ///
    /// Returns false on a version conflict. The update is a single
    /// statement, so a failure leaves the prior record intact.
    pub async fn update_if_version(
        &self,
        document_id: &DocumentId,
        snapshot: &EncodedSnapshot,
        client_id: &ClientId,
        expected_version: i64,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE documents
             SET snapshot = ?, last_client_id = ?, updated_at = ?, version = version + 1
             WHERE document_id = ? AND version = ?",
        )
        .bind(snapshot.as_bytes())
        .bind(client_id.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(document_id.as_str())
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Returns the session for a document, creating it with `candidate`
    /// if none exists yet.
    pub async fn get_or_create_session(
        &self,
        document_id: &DocumentId,
        candidate: &str,
    ) -> Result<String, StorageError> {
        sqlx::query(
            "INSERT INTO collab_sessions (document_id, session_id, created_at)
             VALUES (?, ?, ?)
             ON CONFLICT(document_id) DO NOTHING",
        )
        .bind(document_id.as_str())
        .bind(candidate)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        let (session_id,): (String,) =
            sqlx::query_as("SELECT session_id FROM collab_sessions WHERE document_id = ?")
                .bind(document_id.as_str())
                .fetch_one(&self.pool)
                .await?;

        Ok(session_id)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use docsync_core::Replica;
    use tempfile::{tempdir, TempDir};

    pub(crate) async fn test_store() -> (TempDir, DocumentStore) {
        let temp_dir = tempdir().unwrap();
        let pool = init_db(&temp_dir.path().join("test.db")).await.unwrap();
        (temp_dir, DocumentStore::new(pool))
    }

    fn doc(id: &str) -> DocumentId {
        DocumentId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn test_init_db_creates_tables() {
        let (_dir, store) = test_store().await;

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '_sqlx_%' ORDER BY name",
        )
        .fetch_all(store.pool())
        .await
        .unwrap();

        let table_names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert_eq!(table_names, vec!["collab_sessions", "documents"]);
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (_dir, store) = test_store().await;
        let snapshot = Replica::genesis_snapshot();

        let record = store.create(&doc("notes"), &snapshot, None).await.unwrap();
        assert_eq!(record.version, 0);
        assert_eq!(record.snapshot(), snapshot);
        assert!(record.last_client_id.is_none());

        assert_eq!(store.get(&doc("notes")).await.unwrap(), Some(record));
        assert!(store.get(&doc("missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let (_dir, store) = test_store().await;
        let snapshot = Replica::genesis_snapshot();

        store.create(&doc("notes"), &snapshot, None).await.unwrap();
        let result = store.create(&doc("notes"), &snapshot, None).await;
        assert!(matches!(result, Err(StorageError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_update_if_version() {
        let (_dir, store) = test_store().await;
        let client = ClientId::parse("c1").unwrap();
        store
            .create(&doc("notes"), &Replica::genesis_snapshot(), None)
            .await
            .unwrap();

        let next = EncodedSnapshot::new(vec![9, 9, 9]);
        assert!(store
            .update_if_version(&doc("notes"), &next, &client, 0)
            .await
            .unwrap());
        // Stale version loses
        assert!(!store
            .update_if_version(&doc("notes"), &next, &client, 0)
            .await
            .unwrap());

        let record = store.get(&doc("notes")).await.unwrap().unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.snapshot, vec![9, 9, 9]);
        assert_eq!(record.last_client_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_session_is_created_once() {
        let (_dir, store) = test_store().await;

        let first = store
            .get_or_create_session(&doc("notes"), "session-a")
            .await
            .unwrap();
        let second = store
            .get_or_create_session(&doc("notes"), "session-b")
            .await
            .unwrap();

        assert_eq!(first, "session-a");
        assert_eq!(second, "session-a");
    }

    #[tokio::test]
    async fn test_list_is_sorted() {
        let (_dir, store) = test_store().await;
        let snapshot = Replica::genesis_snapshot();
        store.create(&doc("b"), &snapshot, None).await.unwrap();
        store.create(&doc("a"), &snapshot, None).await.unwrap();

        let ids: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.document_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
