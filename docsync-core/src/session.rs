//! Client session controller.
//!
//! Owns the lifecycle of one document on one client: fetch a credential,
//! go live through the provider adapter or stay offline, apply edits, and
//! push full snapshots to the server for durable merging. Local editing is
//! never blocked by the network.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::broker::TokenBroker;
use crate::document_id::{ClientId, DocumentId};
use crate::presence::{PresenceChannel, PresenceState};
use crate::provider::{ProviderAdapter, Relay, WebSocketRelay};
use crate::replica::{LocalMutation, ReplicaError, ReplicaHandle, ReplicaStore};
use crate::sync::{SnapshotClient, SyncError};

/// How to reach the server and who we are.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub server_url: String,
    pub api_key: Option<String>,
    pub client_id: ClientId,
    /// Display name published as presence.
    pub name: Option<String>,
}

/// Whether the session obtained a live channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// A credential was obtained and the relay was asked to connect.
    Live,
    /// No credential; edits stay local until the next snapshot push.
    Offline,
}

/// An open collaborative editing session for one document.
pub struct CollabSession<R: Relay> {
    config: SessionConfig,
    adapter: ProviderAdapter<R>,
    broker: TokenBroker,
    snapshots: SnapshotClient,
    mode: SessionMode,
}

impl CollabSession<WebSocketRelay> {
    /// Opens `document_id` from `store` and starts a session over WebSocket.
    pub async fn open(
        store: &ReplicaStore,
        document_id: &DocumentId,
        config: SessionConfig,
    ) -> Result<Self, ReplicaError> {
        let replica = store.open(document_id).await?;
        let presence = Arc::new(PresenceChannel::new(config.client_id.clone()));
        let relay = WebSocketRelay::new(config.client_id.clone(), replica, presence);
        Ok(Self::start(relay, config).await)
    }
}

impl<R: Relay> CollabSession<R> {
    /// Starts a session over an existing relay.
    pub async fn start(relay: R, config: SessionConfig) -> Self {
        let broker = TokenBroker::new(config.server_url.clone(), config.api_key.clone());
        let snapshots = SnapshotClient::new(config.server_url.clone(), config.api_key.clone());
        let adapter = ProviderAdapter::new(relay);

        let mut state = PresenceState::new(config.client_id.clone());
        if let Some(name) = &config.name {
            state = state.with_name(name.clone());
        }
        adapter.presence().publish(state).await;

        let mut session = Self {
            config,
            adapter,
            broker,
            snapshots,
            mode: SessionMode::Offline,
        };
        session.go_live().await;
        session
    }

    async fn go_live(&mut self) -> SessionMode {
        let document_id = self.document_id().clone();
        self.mode = match self.broker.get_credential(&document_id).await {
            Some(credential) => {
                self.adapter.relay().authorize(credential).await;
                self.adapter.connect().await;
                SessionMode::Live
            }
            None => {
                tracing::info!("Editing {} offline", document_id);
                SessionMode::Offline
            }
        };
        self.mode
    }

    /// Drops the current connection and starts over with a fresh credential.
    pub async fn reconnect(&mut self) -> SessionMode {
        self.adapter.disconnect().await;
        self.go_live().await
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn document_id(&self) -> &DocumentId {
        self.adapter.relay().replica().document_id()
    }

    pub fn client_id(&self) -> &ClientId {
        &self.config.client_id
    }

    pub fn adapter(&self) -> &ProviderAdapter<R> {
        &self.adapter
    }

    pub fn replica(&self) -> ReplicaHandle {
        self.adapter.replica()
    }

    /// Applies a local edit. Works regardless of connectivity.
    pub async fn apply(&self, mutation: LocalMutation) -> Result<(), ReplicaError> {
        self.adapter.replica().apply(mutation).await
    }

    /// Pushes the full replica to the snapshot sync endpoint.
    pub async fn push_snapshot(&self) -> Result<(), SyncError> {
        let replica = self.adapter.replica();
        let snapshot = replica.encode().await;
        self.snapshots
            .push(replica.document_id(), &snapshot, &self.config.client_id)
            .await
    }

    /// Periodically pushes the replica while it keeps changing.
    ///
    /// Failures are logged; the next tick retries.
    pub fn spawn_autosave(&self, period: Duration) -> JoinHandle<()> {
        let replica = self.adapter.replica();
        let snapshots = self.snapshots.clone();
        let client_id = self.config.client_id.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut pushed_heads = Vec::new();

            loop {
                ticker.tick().await;
                let heads = replica.heads().await;
                if heads == pushed_heads {
                    continue;
                }

                let snapshot = replica.encode().await;
                match snapshots
                    .push(replica.document_id(), &snapshot, &client_id)
                    .await
                {
                    Ok(()) => {
                        tracing::debug!("Autosaved {}", replica.document_id());
                        pushed_heads = heads;
                    }
                    Err(e) => {
                        tracing::warn!("Autosave of {} failed: {}", replica.document_id(), e);
                    }
                }
            }
        })
    }

    /// Tears down the live channel and pushes a final snapshot.
    pub async fn close(self) -> Result<(), SyncError> {
        self.adapter.destroy().await;
        self.push_snapshot().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Credential;
    use crate::sync::protocol::{CredentialRequest, SnapshotSyncRequest, SnapshotSyncResponse};
    use axum::{routing::post, Json, Router};
    use chrono::Utc;
    use tokio::sync::mpsc;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn config(server_url: &str) -> SessionConfig {
        SessionConfig {
            server_url: server_url.to_string(),
            api_key: None,
            client_id: ClientId::parse("client-a").unwrap(),
            name: Some("Ada".to_string()),
        }
    }

    #[tokio::test]
    async fn test_offline_session_keeps_editing() {
        let store = ReplicaStore::in_memory();
        let doc = DocumentId::parse("offline-doc").unwrap();

        let session = CollabSession::open(&store, &doc, config("http://127.0.0.1:1"))
            .await
            .unwrap();
        assert_eq!(session.mode(), SessionMode::Offline);

        session.apply(LocalMutation::insert(0, "draft")).await.unwrap();
        assert_eq!(session.replica().text().await.unwrap(), "draft");
        assert!(!session.adapter().is_connected());

        // Sync failures are surfaced, not swallowed
        assert!(session.push_snapshot().await.is_err());
    }

    #[tokio::test]
    async fn test_session_shares_store_replica() {
        let store = ReplicaStore::in_memory();
        let doc = DocumentId::parse("shared").unwrap();

        let session = CollabSession::open(&store, &doc, config("http://127.0.0.1:1"))
            .await
            .unwrap();
        session.apply(LocalMutation::insert(0, "hi")).await.unwrap();

        let handle = store.open(&doc).await.unwrap();
        assert!(handle.ptr_eq(&session.replica()));
        assert_eq!(
            session.adapter().presence().local_state().await.unwrap().name.as_deref(),
            Some("Ada")
        );
    }

    #[tokio::test]
    async fn test_live_session_pushes_snapshots() {
        let (tx, mut pushed) = mpsc::unbounded_channel();
        let app = Router::new()
            .route(
                "/credentials",
                post(|Json(body): Json<CredentialRequest>| async move {
                    Json(Credential {
                        token: "tok".to_string(),
                        // Relay is unreachable; the session still counts as live
                        url: "ws://127.0.0.1:1/relay/live-doc".to_string(),
                        document_id: DocumentId::parse(&body.document_id.unwrap()).unwrap(),
                        session_id: "s-1".to_string(),
                        expires_at: Utc::now() + chrono::Duration::minutes(10),
                    })
                }),
            )
            .route(
                "/sync",
                post(move |Json(body): Json<SnapshotSyncRequest>| {
                    let tx = tx.clone();
                    async move {
                        tx.send(body).unwrap();
                        Json(SnapshotSyncResponse { success: true })
                    }
                }),
            );
        let url = serve(app).await;

        let store = ReplicaStore::in_memory();
        let doc = DocumentId::parse("live-doc").unwrap();
        let session = CollabSession::open(&store, &doc, config(&url)).await.unwrap();
        assert_eq!(session.mode(), SessionMode::Live);

        session.apply(LocalMutation::insert(0, "saved")).await.unwrap();
        let autosave = session.spawn_autosave(Duration::from_millis(20));

        let body = tokio::time::timeout(Duration::from_secs(5), pushed.recv())
            .await
            .unwrap()
            .unwrap();
        autosave.abort();
        assert_eq!(body.document_id.as_deref(), Some("live-doc"));
        assert_eq!(body.client_id.as_deref(), Some("client-a"));

        session.close().await.unwrap();
    }
}
