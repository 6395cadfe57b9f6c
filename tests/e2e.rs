//! End-to-end tests: a real server on a local port and real client sessions.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use docsync::config::{ApiKeyEntry, ServerConfig};
use docsync::server::{app, init_db, AppState, DocumentStore};
use docsync_core::{
    ClientId, CollabSession, DocumentId, LocalMutation, Replica, ReplicaStore, SessionConfig,
    SessionMode, SyncError, WebSocketRelay,
};
use tempfile::TempDir;

const API_KEY: &str = "e2e-secret";

struct TestServer {
    _dir: TempDir,
    addr: SocketAddr,
    store: DocumentStore,
}

impl TestServer {
    async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let config = ServerConfig {
            data_dir: dir.path().to_path_buf(),
            public_url: Some(format!("http://{}", addr)),
            api_keys: vec![ApiKeyEntry {
                key: API_KEY.to_string(),
                name: Some("e2e".to_string()),
            }],
            ..ServerConfig::default()
        };
        let pool = init_db(&config.database_path()).await.unwrap();
        let store = DocumentStore::new(pool.clone());
        let state = AppState::new(&config, pool);

        tokio::spawn(async move {
            axum::serve(listener, app(state)).await.unwrap();
        });

        Self {
            _dir: dir,
            addr,
            store,
        }
    }

    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    async fn provision(&self, id: &str) -> DocumentId {
        let document_id = DocumentId::parse(id).unwrap();
        self.store
            .create(&document_id, &Replica::genesis_snapshot(), None)
            .await
            .unwrap();
        document_id
    }

    async fn stored_text(&self, document_id: &DocumentId) -> String {
        let record = self.store.get(document_id).await.unwrap().unwrap();
        Replica::from_snapshot(&record.snapshot())
            .unwrap()
            .text()
            .unwrap()
    }
}

fn session_config(server_url: &str, api_key: &str, name: &str) -> SessionConfig {
    SessionConfig {
        server_url: server_url.to_string(),
        api_key: Some(api_key.to_string()),
        client_id: ClientId::generate(),
        name: Some(name.to_string()),
    }
}

async fn open(
    store: &ReplicaStore,
    document_id: &DocumentId,
    config: SessionConfig,
) -> CollabSession<WebSocketRelay> {
    CollabSession::open(store, document_id, config).await.unwrap()
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("condition not met within 5s");
}

#[tokio::test]
async fn test_two_clients_converge_through_relay() {
    let server = TestServer::start().await;
    let doc = server.provision("shared-notes").await;

    let store_a = ReplicaStore::in_memory();
    let store_b = ReplicaStore::in_memory();
    let alice = open(&store_a, &doc, session_config(&server.url(), API_KEY, "alice")).await;
    let bob = open(&store_b, &doc, session_config(&server.url(), API_KEY, "bob")).await;

    assert_eq!(alice.mode(), SessionMode::Live);
    assert_eq!(bob.mode(), SessionMode::Live);
    assert!(alice.adapter().wait_synced(Duration::from_secs(5)).await);
    assert!(bob.adapter().wait_synced(Duration::from_secs(5)).await);

    alice.apply(LocalMutation::insert(0, "hello")).await.unwrap();
    let bob_replica = bob.replica();
    eventually(|| {
        let replica = bob_replica.clone();
        async move { replica.text().await.unwrap() == "hello" }
    })
    .await;

    bob.apply(LocalMutation::insert(5, " world")).await.unwrap();
    let alice_replica = alice.replica();
    eventually(|| {
        let replica = alice_replica.clone();
        async move { replica.text().await.unwrap() == "hello world" }
    })
    .await;

    let bob_id = bob.client_id().clone();
    let presence = alice.adapter().presence();
    eventually(|| {
        let presence = presence.clone();
        let bob_id = bob_id.clone();
        async move {
            presence
                .peers()
                .await
                .iter()
                .any(|p| p.client_id == bob_id && p.name.as_deref() == Some("bob"))
        }
    })
    .await;

    alice.push_snapshot().await.unwrap();
    assert_eq!(server.stored_text(&doc).await, "hello world");

    alice.close().await.unwrap();
    bob.close().await.unwrap();
    assert_eq!(server.stored_text(&doc).await, "hello world");
}

#[tokio::test]
async fn test_late_joiner_receives_live_state() {
    let server = TestServer::start().await;
    let doc = server.provision("late").await;

    let store_a = ReplicaStore::in_memory();
    let alice = open(&store_a, &doc, session_config(&server.url(), API_KEY, "alice")).await;
    assert!(alice.adapter().wait_synced(Duration::from_secs(5)).await);
    alice.apply(LocalMutation::set_title("Agenda")).await.unwrap();
    alice.apply(LocalMutation::insert(0, "item one")).await.unwrap();

    // Give the relay a moment to fold alice's edits into the room.
    let alice_replica = alice.replica();
    eventually(|| {
        let replica = alice_replica.clone();
        async move { replica.pending_len().await == 0 }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let store_b = ReplicaStore::in_memory();
    let bob = open(&store_b, &doc, session_config(&server.url(), API_KEY, "bob")).await;
    assert!(bob.adapter().wait_synced(Duration::from_secs(5)).await);

    let bob_replica = bob.replica();
    eventually(|| {
        let replica = bob_replica.clone();
        async move { replica.text().await.unwrap() == "item one" }
    })
    .await;
    assert_eq!(bob_replica.title().await.unwrap(), "Agenda");

    bob.close().await.unwrap();
    alice.close().await.unwrap();
}

#[tokio::test]
async fn test_offline_when_server_down() {
    // Reserve a port, then release it so nothing is listening.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let store = ReplicaStore::in_memory();
    let doc = DocumentId::parse("offline").unwrap();
    let session = open(&store, &doc, session_config(&url, API_KEY, "solo")).await;

    assert_eq!(session.mode(), SessionMode::Offline);
    assert!(!session.adapter().is_connected());

    session.apply(LocalMutation::insert(0, "still editing")).await.unwrap();
    assert_eq!(session.replica().text().await.unwrap(), "still editing");

    let result = session.push_snapshot().await;
    assert!(matches!(result, Err(SyncError::HttpError(_))));
}

#[tokio::test]
async fn test_rejected_api_key_stays_offline() {
    let server = TestServer::start().await;
    let doc = server.provision("guarded").await;

    let store = ReplicaStore::in_memory();
    let session = open(&store, &doc, session_config(&server.url(), "wrong-key", "mallory")).await;

    assert_eq!(session.mode(), SessionMode::Offline);
    let result = session.push_snapshot().await;
    assert!(matches!(result, Err(SyncError::Unauthorized)));
}

#[tokio::test]
async fn test_relay_rejects_unknown_token() {
    let server = TestServer::start().await;
    server.provision("notes").await;

    let url = format!("ws://{}/relay/notes?token=bogus&clientId=intruder", server.addr);
    let result = tokio_tungstenite::connect_async(url).await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_push_to_unprovisioned_document_is_not_found() {
    let server = TestServer::start().await;

    let store = ReplicaStore::in_memory();
    let doc = DocumentId::parse("never-created").unwrap();
    let session = open(&store, &doc, session_config(&server.url(), API_KEY, "alice")).await;
    session.apply(LocalMutation::insert(0, "draft")).await.unwrap();

    let result = session.push_snapshot().await;
    assert!(matches!(result, Err(SyncError::NotFound(_))));
}
