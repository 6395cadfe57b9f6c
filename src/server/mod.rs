//! The docsync HTTP and relay server.
//!
//! # Endpoints
//!
//! - `GET /health`: health check (no auth)
//! - `POST /credentials`: issue a relay credential for a document
//! - `OPTIONS /credentials`: cross-origin pre-flight (no auth)
//! - `POST /sync`: merge a full snapshot into the durable record
//! - `GET /relay/{documentId}?token=…&clientId=…`: live relay WebSocket

pub mod auth;
pub mod error;
pub mod issuer;
pub mod relay;
pub mod storage;
pub mod sync;
pub mod tokens;

pub use auth::{ApiKeyStore, AuthClient};
pub use error::ApiError;
pub use issuer::SessionIssuer;
pub use relay::RelayHub;
pub use storage::{init_db, DocumentRecord, DocumentStore, StorageError};
pub use sync::{SnapshotSync, SyncOutcome};
pub use tokens::CredentialStore;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State, WebSocketUpgrade},
    http::{header, Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use docsync_core::sync::protocol::{
    CredentialRequest, HealthResponse, SnapshotSyncRequest, SnapshotSyncResponse,
};
use docsync_core::{ClientId, Credential, DocumentId, EncodedSnapshot};
use serde::Deserialize;
use sqlx::SqlitePool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;

/// Interval between purges of expired credentials.
const TOKEN_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub api_keys: Arc<ApiKeyStore>,
    pub credentials: Arc<CredentialStore>,
    pub issuer: Arc<SessionIssuer>,
    pub snapshots: Arc<SnapshotSync>,
    pub relay: Arc<RelayHub>,
}

impl AppState {
    pub fn new(config: &ServerConfig, pool: SqlitePool) -> Self {
        let store = DocumentStore::new(pool);
        let credentials = Arc::new(CredentialStore::new(config.credential_ttl()));
        let snapshots = Arc::new(SnapshotSync::new(store.clone()));

        Self {
            api_keys: Arc::new(ApiKeyStore::new(&config.api_keys)),
            issuer: Arc::new(SessionIssuer::new(
                store,
                credentials.clone(),
                config.public_url(),
            )),
            relay: Arc::new(RelayHub::new(snapshots.clone())),
            credentials,
            snapshots,
        }
    }
}

/// Builds the router.
pub fn app(state: AppState) -> Router {
    let auth = middleware::from_fn_with_state(state.clone(), auth::auth_middleware);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/health", get(health))
        .route(
            "/credentials",
            post(issue_credential)
                .route_layer(auth.clone())
                .options(preflight),
        )
        .route("/sync", post(sync_snapshot).route_layer(auth))
        .route("/relay/{document_id}", get(relay_socket))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Periodically drops expired credentials.
pub fn spawn_token_cleanup(credentials: Arc<CredentialStore>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TOKEN_CLEANUP_INTERVAL);
        loop {
            ticker.tick().await;
            let removed = credentials.cleanup_expired();
            if removed > 0 {
                tracing::debug!("Purged {} expired credentials", removed);
            }
        }
    })
}

/// Health check endpoint (no auth required)
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

fn parse_document_id(raw: Option<&str>) -> Result<DocumentId, ApiError> {
    let raw = raw.ok_or_else(|| ApiError::InvalidRequest("documentId is required".to_string()))?;
    DocumentId::parse(raw).map_err(|e| ApiError::InvalidRequest(e.to_string()))
}

fn parse_client_id(raw: Option<&str>) -> Result<ClientId, ApiError> {
    let raw = raw.ok_or_else(|| ApiError::InvalidRequest("clientId is required".to_string()))?;
    ClientId::parse(raw).map_err(|e| ApiError::InvalidRequest(e.to_string()))
}

async fn issue_credential(
    State(state): State<AppState>,
    body: Result<Json<CredentialRequest>, JsonRejection>,
) -> Result<Json<Credential>, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    let document_id = parse_document_id(request.document_id.as_deref())?;

    Ok(Json(state.issuer.issue(&document_id).await?))
}

async fn sync_snapshot(
    State(state): State<AppState>,
    body: Result<Json<SnapshotSyncRequest>, JsonRejection>,
) -> Result<Json<SnapshotSyncResponse>, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;

    let document_id = parse_document_id(request.document_id.as_deref())?;
    let client_id = parse_client_id(request.client_id.as_deref())?;
    let encoded = request
        .encoded_snapshot
        .as_deref()
        .ok_or_else(|| ApiError::InvalidRequest("encodedSnapshot is required".to_string()))?;
    let snapshot = EncodedSnapshot::from_base64(encoded)?;

    state
        .snapshots
        .sync(&document_id, &snapshot, &client_id)
        .await?;

    Ok(Json(SnapshotSyncResponse { success: true }))
}

#[derive(Debug, Deserialize)]
struct RelayParams {
    token: Option<String>,
    #[serde(rename = "clientId")]
    client_id: Option<String>,
}

async fn relay_socket(
    ws: WebSocketUpgrade,
    Path(document_id): Path<String>,
    Query(params): Query<RelayParams>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let document_id = parse_document_id(Some(&document_id))?;
    let client_id = parse_client_id(params.client_id.as_deref())?;
    let token = params
        .token
        .ok_or(ApiError::Unauthorized("credential token required"))?;

    state
        .credentials
        .verify(&token, &document_id)
        .ok_or(ApiError::Unauthorized("invalid or expired credential"))?;

    let hub = state.relay.clone();
    Ok(ws
        .on_upgrade(move |socket| hub.serve_socket(socket, document_id, client_id))
        .into_response())
}
