//! Snapshot sync error types.

use crate::snapshot::DecodeError;

/// Errors surfaced by a snapshot push.
///
/// Unlike credential failures these reach the caller: the client should keep
/// its replica and retry later.
#[derive(Debug)]
pub enum SyncError {
    /// The request was rejected as malformed (HTTP 400)
    InvalidRequest(String),
    /// The server has no record for the document (HTTP 404)
    NotFound(String),
    /// Missing or rejected API key (HTTP 401)
    Unauthorized,
    /// The server failed to persist the merge (HTTP 5xx)
    StorageError(String),
    /// Transport failure reaching the server
    HttpError(String),
    /// Local snapshot could not be produced or decoded
    Decode(DecodeError),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::InvalidRequest(e) => write!(f, "Invalid sync request: {}", e),
            SyncError::NotFound(doc_id) => write!(
                f,
                "Document not found on server: {}. Create it with docsync-admin first.",
                doc_id
            ),
            SyncError::Unauthorized => write!(f, "Server rejected the API key"),
            SyncError::StorageError(e) => write!(f, "Server storage error: {}", e),
            SyncError::HttpError(e) => write!(f, "HTTP error: {}", e),
            SyncError::Decode(e) => write!(f, "Snapshot error: {}", e),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::HttpError(e.to_string())
    }
}

impl From<DecodeError> for SyncError {
    fn from(e: DecodeError) -> Self {
        SyncError::Decode(e)
    }
}
