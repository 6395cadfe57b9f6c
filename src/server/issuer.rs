//! Session issuer: one collaboration session per document, and credentials
//! bound to it.

use std::sync::Arc;

use docsync_core::sync::ws_url;
use docsync_core::{Credential, DocumentId};

use super::error::ApiError;
use super::storage::DocumentStore;
use super::tokens::CredentialStore;

#[derive(Debug)]
pub struct SessionIssuer {
    store: DocumentStore,
    credentials: Arc<CredentialStore>,
    public_url: String,
}

impl SessionIssuer {
    pub fn new(
        store: DocumentStore,
        credentials: Arc<CredentialStore>,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            credentials,
            public_url: public_url.into(),
        }
    }

    /// Relay endpoint for a document.
    pub fn relay_url(&self, document_id: &DocumentId) -> String {
        format!(
            "{}/relay/{}",
            ws_url(self.public_url.trim_end_matches('/')),
            urlencoding::encode(document_id.as_str())
        )
    }

    /// Creates or fetches the document's session and mints a credential.
    ///
    /// Repeated calls for the same document always name the same session.
    pub async fn issue(&self, document_id: &DocumentId) -> Result<Credential, ApiError> {
        let candidate = uuid::Uuid::new_v4().to_string();
        let session_id = self
            .store
            .get_or_create_session(document_id, &candidate)
            .await
            .map_err(|e| {
                if e.is_unavailable() {
                    ApiError::ServiceUnavailable(e.to_string())
                } else {
                    ApiError::Storage(e.to_string())
                }
            })?;

        let (token, grant) = self.credentials.mint(document_id, &session_id);
        tracing::info!(
            "Issued credential for {} (session {}, expires {})",
            document_id,
            session_id,
            grant.expires_at
        );

        Ok(Credential {
            token,
            url: self.relay_url(document_id),
            document_id: document_id.clone(),
            session_id,
            expires_at: grant.expires_at,
        })
    }
}
