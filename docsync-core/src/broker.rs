//! Token broker: obtains a document-scoped credential before going live.
//!
//! Any failure (server unreachable, rejected, malformed or expired answer)
//! yields `None`. Callers treat `None` as "stay offline", never as fatal.
//! One request per call; retry policy belongs to the session controller.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document_id::DocumentId;
use crate::sync::http_url;
use crate::sync::protocol::CredentialRequest;

/// Short-lived token authorizing one client to join one document's session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    /// Opaque bearer token for the relay.
    pub token: String,
    /// Relay endpoint for this document.
    pub url: String,
    pub document_id: DocumentId,
    pub session_id: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// True if the credential expires within `margin`.
    pub fn expires_within(&self, margin: Duration) -> bool {
        Utc::now() + margin >= self.expires_at
    }
}

/// Why a credential request failed. Only ever logged.
#[derive(Error, Debug)]
enum BrokerError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("credential is for {0}, not the requested document")]
    WrongDocument(DocumentId),

    #[error("credential already expired")]
    Expired,
}

/// Requests credentials from the session issuer.
#[derive(Debug, Clone)]
pub struct TokenBroker {
    http: reqwest::Client,
    server_url: String,
    api_key: Option<String>,
}

impl TokenBroker {
    pub fn new(server_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            server_url: server_url.into(),
            api_key,
        }
    }

    /// Fetches a credential for `document_id`, or `None` to operate offline.
    pub async fn get_credential(&self, document_id: &DocumentId) -> Option<Credential> {
        match self.request(document_id).await {
            Ok(credential) => {
                tracing::debug!(
                    "Obtained credential for {} (session {})",
                    document_id,
                    credential.session_id
                );
                Some(credential)
            }
            Err(e) => {
                tracing::warn!(
                    "No credential for {}, continuing offline: {}",
                    document_id,
                    e
                );
                None
            }
        }
    }

    async fn request(&self, document_id: &DocumentId) -> Result<Credential, BrokerError> {
        let body = CredentialRequest {
            document_id: Some(document_id.to_string()),
        };

        let mut request = self
            .http
            .post(http_url(&self.server_url, "/credentials"))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(BrokerError::Status(response.status()));
        }

        let credential: Credential = response.json().await?;

        if &credential.document_id != document_id {
            return Err(BrokerError::WrongDocument(credential.document_id));
        }
        if credential.is_expired() {
            return Err(BrokerError::Expired);
        }

        Ok(credential)
    }
}
