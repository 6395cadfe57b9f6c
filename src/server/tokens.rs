//! In-memory store of relay credential tokens.
//!
//! Only the SHA-256 hash of a token is kept. Tokens stay valid until they
//! expire so a client can reconnect with the same credential; expired
//! entries are dropped by [`CredentialStore::cleanup_expired`].

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use docsync_core::DocumentId;
use rand::Rng;
use sha2::{Digest, Sha256};

/// What a token grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub document_id: DocumentId,
    pub session_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Thread-safe via internal RwLock.
#[derive(Debug)]
pub struct CredentialStore {
    /// Grants indexed by hex SHA-256 of the token.
    grants: RwLock<HashMap<String, TokenGrant>>,
    ttl: Duration,
}

impl CredentialStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            grants: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mints a token for a document session.
    ///
    /// Returns the token (32 bytes, base64url encoded) and its grant.
    pub fn mint(&self, document_id: &DocumentId, session_id: &str) -> (String, TokenGrant) {
        self.mint_with_ttl(document_id, session_id, self.ttl)
    }

    pub fn mint_with_ttl(
        &self,
        document_id: &DocumentId,
        session_id: &str,
        ttl: Duration,
    ) -> (String, TokenGrant) {
        let token = generate_token();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let grant = TokenGrant {
            document_id: document_id.clone(),
            session_id: session_id.to_string(),
            expires_at: Utc::now().checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };

        let mut grants = self.grants.write().unwrap();
        grants.insert(hash_token(&token), grant.clone());

        (token, grant)
    }

    /// Returns the grant if `token` is known, unexpired and scoped to
    /// `document_id`.
    pub fn verify(&self, token: &str, document_id: &DocumentId) -> Option<TokenGrant> {
        let grants = self.grants.read().unwrap();
        let grant = grants.get(&hash_token(token))?;

        if Utc::now() >= grant.expires_at || &grant.document_id != document_id {
            return None;
        }

        Some(grant.clone())
    }

    /// Removes all expired grants.
    ///
    /// Returns the number of grants removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut grants = self.grants.write().unwrap();
        let now = Utc::now();

        let before = grants.len();
        grants.retain(|_, grant| grant.expires_at > now);
        before - grants.len()
    }

    pub fn len(&self) -> usize {
        self.grants.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(10 * 60))
    }
}

/// Generates a secure random token.
///
/// Returns 32 random bytes encoded as base64url (no padding).
fn generate_token() -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
