//! Relay hub: per-document rooms for live collaboration.
//!
//! Each room holds the in-memory authoritative state of one document while
//! at least one client is connected. A connection goes through:
//!
//! 1. relay sends `welcome` with the room state
//! 2. client answers with `sync-step` carrying its full state, which is merged
//! 3. relay sends `synced` and fans out whatever the client contributed
//! 4. `update` and `presence` frames are applied and fanned out to the rest
//!    of the room until the socket closes
//!
//! When the last client leaves, the room state is merged into the durable
//! record through [`SnapshotSync`] and the room is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use automerge::{AutoCommit, ChangeHash};
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use docsync_core::snapshot::check_shape;
use docsync_core::{
    ClientId, DecodeError, DocumentId, EncodedSnapshot, PresenceState, RelayMessage, Replica,
};
use tokio::sync::broadcast;

use super::error::ApiError;
use super::sync::SnapshotSync;

/// How long a client has to answer the welcome.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames buffered per room before slow receivers lag.
const ROOM_CAPACITY: usize = 256;

/// An encoded frame and the connection it came from.
#[derive(Debug, Clone)]
struct Frame {
    origin: u64,
    data: Bytes,
}

#[derive(Debug, Default)]
struct Members {
    connections: usize,
    presence: HashMap<ClientId, PresenceState>,
    last_writer: Option<ClientId>,
}

/// Live state of one document.
#[derive(Debug)]
pub struct Room {
    document_id: DocumentId,
    doc: tokio::sync::Mutex<AutoCommit>,
    frames: broadcast::Sender<Frame>,
    members: Mutex<Members>,
}

impl Room {
    fn new(document_id: DocumentId, doc: AutoCommit) -> Self {
        let (frames, _) = broadcast::channel(ROOM_CAPACITY);
        Self {
            document_id,
            doc: tokio::sync::Mutex::new(doc),
            frames,
            members: Mutex::new(Members::default()),
        }
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub async fn snapshot(&self) -> EncodedSnapshot {
        EncodedSnapshot::new(self.doc.lock().await.save())
    }

    pub fn connections(&self) -> usize {
        self.members.lock().unwrap().connections
    }

    /// Merges a client's full state. Returns the changes it contributed,
    /// encoded incrementally, if any.
    async fn merge_full(
        &self,
        snapshot: &[u8],
        client_id: &ClientId,
    ) -> Result<Option<Vec<u8>>, DecodeError> {
        let mut incoming = EncodedSnapshot::new(snapshot.to_vec()).decode_document()?;

        let mut doc = self.doc.lock().await;
        let before = doc.get_heads();
        let mut next = doc.clone();
        next.merge(&mut incoming)
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;
        self.commit(&mut *doc, next, &before, client_id)
    }

    /// Applies an incremental update. Returns the update if it was new.
    async fn apply_update(
        &self,
        data: &[u8],
        client_id: &ClientId,
    ) -> Result<Option<Vec<u8>>, DecodeError> {
        let mut doc = self.doc.lock().await;
        let before = doc.get_heads();
        let mut next = doc.clone();
        next.load_incremental(data)
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;
        self.commit(&mut *doc, next, &before, client_id)
    }

    /// Installs `next` if it added changes and kept the document shape.
    fn commit(
        &self,
        doc: &mut AutoCommit,
        mut next: AutoCommit,
        before: &[ChangeHash],
        client_id: &ClientId,
    ) -> Result<Option<Vec<u8>>, DecodeError> {
        if next.get_changes(before).is_empty() {
            return Ok(None);
        }
        check_shape(&next)?;

        let delta = next.save_after(before);
        *doc = next;
        self.members.lock().unwrap().last_writer = Some(client_id.clone());
        Ok(Some(delta))
    }

    fn set_presence(&self, client_id: &ClientId, state: Option<PresenceState>) {
        let mut members = self.members.lock().unwrap();
        match state {
            Some(state) => {
                members.presence.insert(client_id.clone(), state);
            }
            None => {
                members.presence.remove(client_id);
            }
        }
    }

    fn presence(&self) -> Vec<PresenceState> {
        self.members.lock().unwrap().presence.values().cloned().collect()
    }

    fn broadcast(&self, origin: u64, msg: &RelayMessage) {
        match msg.encode() {
            Ok(encoded) => {
                // No other members is fine
                let _ = self.frames.send(Frame {
                    origin,
                    data: Bytes::from(encoded),
                });
            }
            Err(e) => tracing::error!("Failed to encode relay frame: {}", e),
        }
    }
}

/// All open rooms.
#[derive(Debug)]
pub struct RelayHub {
    rooms: tokio::sync::Mutex<HashMap<DocumentId, Arc<Room>>>,
    snapshots: Arc<SnapshotSync>,
    next_connection: AtomicU64,
}

impl RelayHub {
    pub fn new(snapshots: Arc<SnapshotSync>) -> Self {
        Self {
            rooms: tokio::sync::Mutex::new(HashMap::new()),
            snapshots,
            next_connection: AtomicU64::new(1),
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    /// Joins the document's room, opening it from the durable record (or
    /// the genesis state for documents not provisioned yet).
    ///
    /// The hub lock is not held while the record loads, so opening one
    /// document never stalls joins to another.
    pub async fn join(&self, document_id: &DocumentId) -> Result<Arc<Room>, ApiError> {
        {
            let rooms = self.rooms.lock().await;
            if let Some(room) = rooms.get(document_id) {
                room.members.lock().unwrap().connections += 1;
                return Ok(room.clone());
            }
        }

        let snapshot = match self.snapshots.store().get(document_id).await? {
            Some(record) => record.snapshot(),
            None => Replica::genesis_snapshot(),
        };
        let doc = snapshot
            .decode_document()
            .map_err(|e| ApiError::Storage(format!("cannot open {}: {}", document_id, e)))?;

        let mut rooms = self.rooms.lock().await;
        // Another connection may have opened it meanwhile
        let room = rooms
            .entry(document_id.clone())
            .or_insert_with(|| {
                tracing::info!("Opened relay room for {}", document_id);
                Arc::new(Room::new(document_id.clone(), doc))
            })
            .clone();
        room.members.lock().unwrap().connections += 1;
        Ok(room)
    }

    /// Leaves a room. The last one out folds the room into the record.
    pub async fn leave(&self, room: &Arc<Room>, client_id: &ClientId, origin: u64) {
        let last_writer = {
            let mut rooms = self.rooms.lock().await;
            let (remaining, last_writer) = {
                let mut members = room.members.lock().unwrap();
                members.connections = members.connections.saturating_sub(1);
                members.presence.remove(client_id);
                (members.connections, members.last_writer.clone())
            };

            room.broadcast(
                origin,
                &RelayMessage::Presence {
                    sender_id: client_id.clone(),
                    state: None,
                },
            );

            if remaining > 0 {
                return;
            }

            if rooms
                .get(&room.document_id)
                .is_some_and(|open| Arc::ptr_eq(open, room))
            {
                rooms.remove(&room.document_id);
            }
            tracing::info!("Closed relay room for {}", room.document_id);
            last_writer
        };

        // Nothing was written live; the record already has everything
        let Some(writer) = last_writer else {
            return;
        };

        // A room reopened meanwhile starts from the older record; the fold
        // merges into whatever is persisted by then, so nothing is lost.
        let snapshot = room.snapshot().await;
        match self.snapshots.sync(&room.document_id, &snapshot, &writer).await {
            Ok(outcome) => tracing::debug!("Folded room {}: {:?}", room.document_id, outcome),
            Err(ApiError::NotFound(_)) => tracing::warn!(
                "Document {} is not provisioned, discarding its relay state",
                room.document_id
            ),
            Err(e) => tracing::error!("Failed to fold room {}: {}", room.document_id, e),
        }
    }

    /// Runs one client connection to completion.
    pub async fn serve_socket(
        self: Arc<Self>,
        mut socket: WebSocket,
        document_id: DocumentId,
        client_id: ClientId,
    ) {
        let room = match self.join(&document_id).await {
            Ok(room) => room,
            Err(e) => {
                let _ = send(&mut socket, &RelayMessage::Error { message: e.to_string() }).await;
                return;
            }
        };

        let origin = self.next_connection.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Client {} joined {}", client_id, document_id);

        let mut frames = room.frames.subscribe();
        if let Err(e) = connection(&room, &mut socket, &mut frames, &client_id, origin).await {
            tracing::warn!("Relay connection for {} ended: {}", client_id, e);
        }

        self.leave(&room, &client_id, origin).await;
        tracing::info!("Client {} left {}", client_id, document_id);
    }
}

async fn connection(
    room: &Room,
    socket: &mut WebSocket,
    frames: &mut broadcast::Receiver<Frame>,
    client_id: &ClientId,
    origin: u64,
) -> Result<(), String> {
    let welcome = RelayMessage::Welcome {
        document_id: room.document_id.clone(),
        snapshot: room.snapshot().await.into_bytes(),
    };
    send(socket, &welcome).await?;

    for state in room.presence() {
        send(
            socket,
            &RelayMessage::Presence {
                sender_id: state.client_id.clone(),
                state: Some(state),
            },
        )
        .await?;
    }

    let Some(snapshot) = tokio::time::timeout(HANDSHAKE_TIMEOUT, await_sync_step(socket))
        .await
        .map_err(|_| "handshake timed out".to_string())??
    else {
        return Ok(());
    };

    let contributed = match room.merge_full(&snapshot, client_id).await {
        Ok(delta) => delta,
        Err(e) => {
            let message = format!("malformed sync step: {}", e);
            send(socket, &RelayMessage::Error { message: message.clone() }).await?;
            return Err(message);
        }
    };

    send(
        socket,
        &RelayMessage::Synced {
            document_id: room.document_id.clone(),
        },
    )
    .await?;

    if let Some(data) = contributed {
        room.broadcast(
            origin,
            &RelayMessage::Update {
                sender_id: client_id.clone(),
                data,
            },
        );
    }

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let msg = RelayMessage::decode(&data).map_err(|e| e.to_string())?;
                        handle_message(room, msg, client_id, origin).await;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.to_string()),
                }
            }
            frame = frames.recv() => {
                match frame {
                    Ok(frame) if frame.origin != origin => {
                        socket
                            .send(Message::Binary(frame.data))
                            .await
                            .map_err(|e| e.to_string())?;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Client has to reconnect and resync
                        return Err(format!("client fell behind by {} frames", skipped));
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }
    }
}

/// Waits for the client's full state. `None` if the client went away.
async fn await_sync_step(socket: &mut WebSocket) -> Result<Option<Vec<u8>>, String> {
    while let Some(msg) = socket.recv().await {
        match msg.map_err(|e| e.to_string())? {
            Message::Binary(data) => match RelayMessage::decode(&data).map_err(|e| e.to_string())? {
                RelayMessage::SyncStep { snapshot } => return Ok(Some(snapshot)),
                other => tracing::debug!("Ignoring {:?} before sync step", other),
            },
            Message::Close(_) => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}

async fn handle_message(room: &Room, msg: RelayMessage, client_id: &ClientId, origin: u64) {
    match msg {
        RelayMessage::Update { data, .. } => match room.apply_update(&data, client_id).await {
            Ok(Some(_)) => room.broadcast(
                origin,
                &RelayMessage::Update {
                    sender_id: client_id.clone(),
                    data,
                },
            ),
            Ok(None) => {}
            Err(e) => tracing::warn!("Dropping bad update from {}: {}", client_id, e),
        },
        RelayMessage::SyncStep { snapshot } => match room.merge_full(&snapshot, client_id).await {
            Ok(Some(data)) => room.broadcast(
                origin,
                &RelayMessage::Update {
                    sender_id: client_id.clone(),
                    data,
                },
            ),
            Ok(None) => {}
            Err(e) => tracing::warn!("Dropping bad sync step from {}: {}", client_id, e),
        },
        RelayMessage::Presence { state, .. } => {
            // Senders speak only for themselves
            let state = state.map(|mut s| {
                s.client_id = client_id.clone();
                s
            });
            room.set_presence(client_id, state.clone());
            room.broadcast(
                origin,
                &RelayMessage::Presence {
                    sender_id: client_id.clone(),
                    state,
                },
            );
        }
        other => tracing::debug!("Ignoring {:?} from {}", other, client_id),
    }
}

async fn send(socket: &mut WebSocket, msg: &RelayMessage) -> Result<(), String> {
    let encoded = msg.encode().map_err(|e| e.to_string())?;
    socket
        .send(Message::Binary(encoded.into()))
        .await
        .map_err(|e| e.to_string())
}
