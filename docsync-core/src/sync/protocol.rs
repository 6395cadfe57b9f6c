//! Wire types for the live relay channel and the HTTP endpoints.
//!
//! Relay frames are CBOR-encoded binary WebSocket messages. Field names use
//! camelCase to match the JSON bodies of the HTTP endpoints.

use serde::{Deserialize, Serialize};

use crate::document_id::{ClientId, DocumentId};
use crate::presence::PresenceState;

/// Messages exchanged with the relay.
///
/// Connection sequence:
/// 1. relay → client: `welcome` with the relay's current document state
/// 2. client → relay: `sync-step` with the client's full state
/// 3. relay → client: `synced` once both sides are reconciled
/// 4. both ways: `update` deltas and `presence` until the socket closes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RelayMessage {
    #[serde(rename = "welcome")]
    Welcome {
        #[serde(rename = "documentId")]
        document_id: DocumentId,
        #[serde(with = "serde_bytes")]
        snapshot: Vec<u8>,
    },
    #[serde(rename = "sync-step")]
    SyncStep {
        #[serde(with = "serde_bytes")]
        snapshot: Vec<u8>,
    },
    #[serde(rename = "synced")]
    Synced {
        #[serde(rename = "documentId")]
        document_id: DocumentId,
    },
    #[serde(rename = "update")]
    Update {
        #[serde(rename = "senderId")]
        sender_id: ClientId,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    /// `state: None` announces that the sender left.
    #[serde(rename = "presence")]
    Presence {
        #[serde(rename = "senderId")]
        sender_id: ClientId,
        state: Option<PresenceState>,
    },
    #[serde(rename = "error")]
    Error { message: String },
}

impl RelayMessage {
    /// Encode message as CBOR bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ciborium::ser::Error<std::io::Error>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)?;
        Ok(buf)
    }

    /// Decode message from CBOR bytes.
    pub fn decode(data: &[u8]) -> Result<Self, ciborium::de::Error<std::io::Error>> {
        ciborium::from_reader(data)
    }
}

/// Body of a credential request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRequest {
    pub document_id: Option<String>,
}

/// Body of a snapshot sync request.
///
/// Fields are optional on the wire so that a missing field is reported as an
/// invalid request rather than a generic parse failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSyncRequest {
    pub document_id: Option<String>,
    /// Base64 of the full encoded replica.
    pub encoded_snapshot: Option<String>,
    pub client_id: Option<String>,
}

/// Successful snapshot sync acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSyncResponse {
    pub success: bool,
}

/// Error body returned by every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// Response from the health endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
