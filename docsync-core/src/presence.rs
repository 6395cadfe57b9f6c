//! Presence channel: ephemeral per-client state shared with connected peers.
//!
//! Presence (who is here, where their cursor is) rides alongside the replica
//! on the live channel but is never persisted. Everything in the channel
//! belongs to the current connection: [`PresenceChannel::reset`] drops all
//! peer state and ends every open subscription, and nothing is replayed after
//! a reconnect.

use std::collections::HashMap;

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::document_id::ClientId;

/// Buffer for presence fan-out. Slow subscribers skip stale updates.
const PRESENCE_BUFFER: usize = 64;

/// A text selection. `anchor == head` is a caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub anchor: usize,
    pub head: usize,
}

/// What one client shares about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceState {
    pub client_id: ClientId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

impl PresenceState {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            name: None,
            color: None,
            cursor: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_cursor(mut self, anchor: usize, head: usize) -> Self {
        self.cursor = Some(Cursor { anchor, head });
        self
    }
}

/// A change in a peer's presence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceUpdate {
    Changed(PresenceState),
    Left(ClientId),
}

struct Connection {
    peers: HashMap<ClientId, PresenceState>,
    updates: broadcast::Sender<PresenceUpdate>,
    outbound: Option<mpsc::UnboundedSender<PresenceState>>,
}

impl Connection {
    fn new() -> Self {
        let (updates, _) = broadcast::channel(PRESENCE_BUFFER);
        Self {
            peers: HashMap::new(),
            updates,
            outbound: None,
        }
    }
}

/// Ephemeral presence shared with the peers of one document.
pub struct PresenceChannel {
    local_id: ClientId,
    local: Mutex<Option<PresenceState>>,
    connection: Mutex<Connection>,
}

impl PresenceChannel {
    pub fn new(local_id: ClientId) -> Self {
        Self {
            local_id,
            local: Mutex::new(None),
            connection: Mutex::new(Connection::new()),
        }
    }

    pub fn local_id(&self) -> &ClientId {
        &self.local_id
    }

    /// Records the local presence and broadcasts it to connected peers.
    ///
    /// While offline the state is only recorded; it is announced when a
    /// transport attaches.
    pub async fn publish(&self, mut state: PresenceState) {
        state.client_id = self.local_id.clone();
        *self.local.lock().await = Some(state.clone());

        let mut connection = self.connection.lock().await;
        if let Some(outbound) = &connection.outbound {
            if outbound.send(state).is_err() {
                connection.outbound = None;
            }
        }
    }

    pub async fn local_state(&self) -> Option<PresenceState> {
        self.local.lock().await.clone()
    }

    /// Subscribes to peer presence updates for the current connection.
    ///
    /// The stream is unbounded and ends when the connection is reset;
    /// subscribe again after reconnecting.
    pub async fn subscribe(&self) -> BoxStream<'static, PresenceUpdate> {
        let receiver = self.connection.lock().await.updates.subscribe();

        stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(update) => return Some((update, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Presence subscriber skipped {} updates", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    /// Current peer states, excluding the local client.
    pub async fn peers(&self) -> Vec<PresenceState> {
        let connection = self.connection.lock().await;
        let mut peers: Vec<_> = connection.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.client_id.as_str().cmp(b.client_id.as_str()));
        peers
    }

    /// Attaches a transport sink and announces the local state through it.
    pub async fn attach(&self, outbound: mpsc::UnboundedSender<PresenceState>) {
        let local = self.local.lock().await.clone();
        if let Some(state) = local {
            let _ = outbound.send(state);
        }
        self.connection.lock().await.outbound = Some(outbound);
    }

    /// Applies an update received from the relay.
    pub async fn receive_remote(&self, update: PresenceUpdate) {
        let mut connection = self.connection.lock().await;

        match &update {
            PresenceUpdate::Changed(state) => {
                if state.client_id == self.local_id {
                    return;
                }
                connection
                    .peers
                    .insert(state.client_id.clone(), state.clone());
            }
            PresenceUpdate::Left(client_id) => {
                if connection.peers.remove(client_id).is_none() {
                    return;
                }
            }
        }

        let _ = connection.updates.send(update);
    }

    /// Drops all connection-scoped state: peers, transport and subscriptions.
    pub async fn reset(&self) {
        *self.connection.lock().await = Connection::new();
    }
}
