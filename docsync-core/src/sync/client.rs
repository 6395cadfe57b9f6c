//! HTTP client for the snapshot sync endpoint.
//!
//! Pushes a full encoded replica so the server can merge it into the durable
//! record. Pushes are safe to repeat: the server merges, it never overwrites.

use std::time::Duration;

use reqwest::StatusCode;

use super::error::SyncError;
use super::protocol::{ErrorBody, HealthResponse, SnapshotSyncRequest, SnapshotSyncResponse};
use crate::document_id::{ClientId, DocumentId};
use crate::snapshot::EncodedSnapshot;

/// Timeout for the server reachability probe.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

/// Pushes snapshots to the sync server.
#[derive(Debug, Clone)]
pub struct SnapshotClient {
    http: reqwest::Client,
    server_url: String,
    api_key: Option<String>,
}

impl SnapshotClient {
    pub fn new(server_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            server_url: server_url.into(),
            api_key,
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Sends the snapshot for merging into the persisted record.
    pub async fn push(
        &self,
        document_id: &DocumentId,
        snapshot: &EncodedSnapshot,
        client_id: &ClientId,
    ) -> Result<(), SyncError> {
        let body = SnapshotSyncRequest {
            document_id: Some(document_id.to_string()),
            encoded_snapshot: Some(snapshot.to_base64()),
            client_id: Some(client_id.to_string()),
        };

        let mut request = self
            .http
            .post(http_url(&self.server_url, "/sync"))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            let ack: SnapshotSyncResponse = response.json().await?;
            if !ack.success {
                return Err(SyncError::StorageError(
                    "server did not acknowledge the sync".to_string(),
                ));
            }
            tracing::debug!(
                "Pushed {} byte snapshot for {}",
                snapshot.len(),
                document_id
            );
            return Ok(());
        }

        let message = response
            .json::<ErrorBody>()
            .await
            .map(|b| b.message)
            .unwrap_or_else(|_| format!("server returned status {}", status));

        Err(match status {
            StatusCode::BAD_REQUEST => SyncError::InvalidRequest(message),
            StatusCode::NOT_FOUND => SyncError::NotFound(document_id.to_string()),
            StatusCode::UNAUTHORIZED => SyncError::Unauthorized,
            s if s.is_server_error() => SyncError::StorageError(message),
            _ => SyncError::HttpError(message),
        })
    }
}

/// Returns true if the server answers its health check.
pub async fn check_server(server_url: &str) -> bool {
    let client = match reqwest::Client::builder().timeout(HEALTH_TIMEOUT).build() {
        Ok(client) => client,
        Err(_) => return false,
    };

    match client.get(http_url(server_url, "/health")).send().await {
        Ok(response) if response.status().is_success() => response
            .json::<HealthResponse>()
            .await
            .map(|h| h.status == "ok")
            .unwrap_or(false),
        _ => false,
    }
}

/// Builds an HTTP URL for a given path.
///
/// Accepts `ws(s)://`, `http(s)://` or scheme-less server URLs.
pub fn http_url(server_url: &str, path: &str) -> String {
    let base_url = if let Some(rest) = server_url.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else if let Some(rest) = server_url.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if !server_url.starts_with("http://") && !server_url.starts_with("https://") {
        format!("http://{}", server_url)
    } else {
        server_url.to_string()
    };

    format!("{}{}", base_url.trim_end_matches('/'), path)
}

/// Builds a WebSocket URL from any server or relay URL.
pub fn ws_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if !url.starts_with("ws://") && !url.starts_with("wss://") {
        format!("ws://{}", url)
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode as AxumStatus, routing::post, Json, Router};

    #[test]
    fn test_http_url() {
        assert_eq!(
            http_url("http://localhost:8080", "/sync"),
            "http://localhost:8080/sync"
        );
        assert_eq!(
            http_url("ws://localhost:8080/", "/sync"),
            "http://localhost:8080/sync"
        );
        assert_eq!(
            http_url("wss://sync.example.com", "/health"),
            "https://sync.example.com/health"
        );
        assert_eq!(http_url("localhost:8080", "/sync"), "http://localhost:8080/sync");
    }

    #[test]
    fn test_ws_url() {
        assert_eq!(ws_url("http://localhost:8080/relay/a"), "ws://localhost:8080/relay/a");
        assert_eq!(ws_url("https://example.com/relay/a"), "wss://example.com/relay/a");
        assert_eq!(ws_url("wss://example.com/relay/a"), "wss://example.com/relay/a");
        assert_eq!(ws_url("localhost:8080/relay/a"), "ws://localhost:8080/relay/a");
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn ids() -> (DocumentId, ClientId) {
        (
            DocumentId::parse("doc-1").unwrap(),
            ClientId::parse("client-1").unwrap(),
        )
    }

    #[tokio::test]
    async fn test_push_success() {
        let app = Router::new().route(
            "/sync",
            post(|Json(body): Json<SnapshotSyncRequest>| async move {
                assert_eq!(body.document_id.as_deref(), Some("doc-1"));
                assert_eq!(body.client_id.as_deref(), Some("client-1"));
                Json(SnapshotSyncResponse { success: true })
            }),
        );
        let url = serve(app).await;
        let (doc, client) = ids();

        let result = SnapshotClient::new(url, None)
            .push(&doc, &EncodedSnapshot::new(vec![1, 2, 3]), &client)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_push_maps_status_codes() {
        let app = Router::new().route(
            "/sync",
            post(|| async {
                (
                    AxumStatus::NOT_FOUND,
                    Json(ErrorBody {
                        error: "not_found".to_string(),
                        message: "unknown document".to_string(),
                    }),
                )
            }),
        );
        let url = serve(app).await;
        let (doc, client) = ids();

        let result = SnapshotClient::new(url, None)
            .push(&doc, &EncodedSnapshot::new(vec![1]), &client)
            .await;
        assert!(matches!(result, Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_push_unreachable_is_surfaced() {
        let (doc, client) = ids();
        let result = SnapshotClient::new("http://127.0.0.1:1", None)
            .push(&doc, &EncodedSnapshot::new(vec![1]), &client)
            .await;
        assert!(matches!(result, Err(SyncError::HttpError(_))));
    }

    #[tokio::test]
    async fn test_check_server_unreachable() {
        assert!(!check_server("http://127.0.0.1:1").await);
    }
}
