//! WebSocket relay transport.
//!
//! One background task per connection attempt. The task performs the
//! welcome / sync-step / synced handshake, then forwards local deltas and
//! presence to the relay and applies whatever the relay sends back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::relay::{Relay, RelayError, RelayStatus};
use crate::broker::Credential;
use crate::document_id::ClientId;
use crate::presence::{PresenceChannel, PresenceUpdate};
use crate::replica::ReplicaHandle;
use crate::snapshot::EncodedSnapshot;
use crate::sync::{ws_url, RelayMessage};

/// Timeout for opening the socket.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the welcome / synced handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `disconnect` waits for the task to close the socket.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

struct Running {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

/// Everything the connection task needs, detached from the relay.
struct Link {
    url: String,
    client_id: ClientId,
    replica: ReplicaHandle,
    presence: Arc<PresenceChannel>,
    status: broadcast::Sender<RelayStatus>,
}

impl Link {
    fn emit(&self, status: RelayStatus) {
        // No subscribers is fine
        let _ = self.status.send(status);
    }
}

/// Relay over a WebSocket connection to the sync server.
pub struct WebSocketRelay {
    client_id: ClientId,
    replica: ReplicaHandle,
    presence: Arc<PresenceChannel>,
    status: broadcast::Sender<RelayStatus>,
    credential: Mutex<Option<Credential>>,
    running: Mutex<Option<Running>>,
    destroyed: AtomicBool,
}

impl WebSocketRelay {
    pub fn new(client_id: ClientId, replica: ReplicaHandle, presence: Arc<PresenceChannel>) -> Self {
        let (status, _) = broadcast::channel(32);
        Self {
            client_id,
            replica,
            presence,
            status,
            credential: Mutex::new(None),
            running: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    fn connect_url(&self, credential: &Credential) -> String {
        let base = ws_url(&credential.url);
        let separator = if base.contains('?') { '&' } else { '?' };
        format!(
            "{}{}token={}&clientId={}",
            base,
            separator,
            urlencoding::encode(&credential.token),
            urlencoding::encode(self.client_id.as_str())
        )
    }
}

impl Relay for WebSocketRelay {
    fn replica(&self) -> &ReplicaHandle {
        &self.replica
    }

    fn presence(&self) -> &Arc<PresenceChannel> {
        &self.presence
    }

    fn status(&self) -> broadcast::Receiver<RelayStatus> {
        self.status.subscribe()
    }

    fn is_active(&self) -> bool {
        self.running
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| !r.handle.is_finished())
            .unwrap_or(false)
    }

    async fn authorize(&self, credential: Credential) {
        *self.credential.lock().unwrap() = Some(credential);
    }

    async fn connect(&self) -> Result<(), RelayError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(RelayError::Destroyed);
        }

        let mut running = self.running.lock().unwrap();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Ok(());
        }

        let credential = self
            .credential
            .lock()
            .unwrap()
            .clone()
            .ok_or(RelayError::MissingCredential)?;
        if credential.is_expired() {
            return Err(RelayError::ExpiredCredential);
        }

        let link = Link {
            url: self.connect_url(&credential),
            client_id: self.client_id.clone(),
            replica: self.replica.clone(),
            presence: self.presence.clone(),
            status: self.status.clone(),
        };
        let shutdown = Arc::new(Notify::new());

        link.emit(RelayStatus::Connecting);
        tracing::info!(
            "Connecting to relay for {} (session {})",
            credential.document_id,
            credential.session_id
        );

        let handle = tokio::spawn(run_connection(link, shutdown.clone()));
        *running = Some(Running { handle, shutdown });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), RelayError> {
        let running = self.running.lock().unwrap().take();
        let Some(Running {
            mut handle,
            shutdown,
        }) = running
        else {
            return Ok(());
        };

        shutdown.notify_one();
        if timeout(DISCONNECT_GRACE, &mut handle).await.is_err() {
            tracing::warn!("Relay connection did not close in time, aborting");
            handle.abort();
            self.presence.reset().await;
            let _ = self.status.send(RelayStatus::Disconnected);
        }
        Ok(())
    }

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        if let Err(e) = self.disconnect().await {
            tracing::debug!("Disconnect during destroy failed: {}", e);
        }
    }
}

async fn run_connection(link: Link, shutdown: Arc<Notify>) {
    tokio::select! {
        result = connection(&link) => {
            if let Err(e) = result {
                tracing::warn!("Relay connection ended: {}", e);
            }
        }
        _ = shutdown.notified() => {
            tracing::debug!("Relay connection shut down");
        }
    }

    link.presence.reset().await;
    link.emit(RelayStatus::Disconnected);
}

async fn connection(link: &Link) -> Result<(), RelayError> {
    let (ws_stream, _) = timeout(CONNECT_TIMEOUT, connect_async(&link.url))
        .await
        .map_err(|_| RelayError::Transport("connect timed out".to_string()))?
        .map_err(|e| RelayError::Transport(e.to_string()))?;

    link.emit(RelayStatus::Connected);

    let (mut sender, mut receiver) = ws_stream.split();

    timeout(HANDSHAKE_TIMEOUT, handshake(link, &mut sender, &mut receiver))
        .await
        .map_err(|_| RelayError::Protocol("handshake timed out".to_string()))??;

    link.emit(RelayStatus::Synced);

    let (presence_tx, mut presence_rx) = mpsc::unbounded_channel();
    link.presence.attach(presence_tx).await;

    // Edits made during the handshake
    send_pending(link, &mut sender).await?;

    loop {
        tokio::select! {
            _ = link.replica.local_change() => {
                send_pending(link, &mut sender).await?;
            }
            Some(state) = presence_rx.recv() => {
                send(&mut sender, &RelayMessage::Presence {
                    sender_id: link.client_id.clone(),
                    state: Some(state),
                }).await?;
            }
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Binary(data))) => {
                        let msg = RelayMessage::decode(&data)
                            .map_err(|e| RelayError::Protocol(e.to_string()))?;
                        handle_message(link, msg).await?;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        sender
                            .send(Message::Pong(data))
                            .await
                            .map_err(|e| RelayError::Transport(e.to_string()))?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("Relay closed the connection");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(RelayError::Transport(e.to_string())),
                }
            }
        }
    }
}

/// Reconciles full state with the relay.
///
/// The relay's state is merged first, then the merged full state goes back,
/// which subsumes any queued deltas.
async fn handshake<S, R>(link: &Link, sender: &mut S, receiver: &mut R) -> Result<(), RelayError>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
    R: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut welcomed = false;

    while let Some(frame) = receiver.next().await {
        let data = match frame {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(_)) => {
                return Err(RelayError::Protocol(
                    "relay closed connection during handshake".to_string(),
                ))
            }
            Ok(_) => continue,
            Err(e) => return Err(RelayError::Transport(e.to_string())),
        };

        match RelayMessage::decode(&data).map_err(|e| RelayError::Protocol(e.to_string()))? {
            RelayMessage::Welcome {
                document_id,
                snapshot,
            } => {
                if &document_id != link.replica.document_id() {
                    return Err(RelayError::Protocol(format!(
                        "relay welcomed us to {}",
                        document_id
                    )));
                }
                if !snapshot.is_empty() {
                    let applied = link
                        .replica
                        .merge(&EncodedSnapshot::new(snapshot))
                        .await
                        .map_err(|e| RelayError::Protocol(e.to_string()))?;
                    tracing::debug!("Merged {} changes from relay", applied);
                }

                link.replica.clear_pending().await;
                let snapshot = link.replica.encode().await;
                send(
                    sender,
                    &RelayMessage::SyncStep {
                        snapshot: snapshot.into_bytes(),
                    },
                )
                .await?;
                welcomed = true;
            }
            RelayMessage::Synced { .. } if welcomed => return Ok(()),
            RelayMessage::Error { message } => return Err(RelayError::Protocol(message)),
            other => {
                tracing::debug!("Ignoring {:?} during handshake", other);
            }
        }
    }

    Err(RelayError::Protocol(
        "connection closed before handshake completed".to_string(),
    ))
}

async fn handle_message(link: &Link, msg: RelayMessage) -> Result<(), RelayError> {
    match msg {
        RelayMessage::Update { sender_id, data } => {
            match link.replica.apply_remote(&data).await {
                Ok(applied) => {
                    tracing::trace!("Applied {} changes from {}", applied, sender_id);
                }
                Err(e) => {
                    tracing::warn!("Dropping bad update from {}: {}", sender_id, e);
                }
            }
        }
        RelayMessage::Presence { sender_id, state } => {
            let update = match state {
                Some(state) => PresenceUpdate::Changed(state),
                None => PresenceUpdate::Left(sender_id),
            };
            link.presence.receive_remote(update).await;
        }
        RelayMessage::Error { message } => return Err(RelayError::Protocol(message)),
        other => {
            tracing::debug!("Ignoring unexpected relay message {:?}", other);
        }
    }
    Ok(())
}

async fn send_pending<S>(link: &Link, sender: &mut S) -> Result<(), RelayError>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    for data in link.replica.take_pending().await {
        send(
            sender,
            &RelayMessage::Update {
                sender_id: link.client_id.clone(),
                data,
            },
        )
        .await?;
    }
    Ok(())
}

async fn send<S>(sender: &mut S, msg: &RelayMessage) -> Result<(), RelayError>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let encoded = msg
        .encode()
        .map_err(|e| RelayError::Protocol(e.to_string()))?;
    sender
        .send(Message::Binary(encoded.into()))
        .await
        .map_err(|e| RelayError::Transport(e.to_string()))
}
