//! API key authentication for the HTTP endpoints.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::HashMap;

use super::error::ApiError;
use super::AppState;
use crate::config::ApiKeyEntry;

/// Authenticated caller, added to request extensions after auth
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthClient {
    pub name: String,
}

/// API key store - maps key -> AuthClient
#[derive(Debug, Clone, Default)]
pub struct ApiKeyStore {
    keys: HashMap<String, AuthClient>,
}

impl ApiKeyStore {
    pub fn new(entries: &[ApiKeyEntry]) -> Self {
        let keys = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let name = entry
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("key-{}", i + 1));
                (entry.key.clone(), AuthClient { name })
            })
            .collect();
        Self { keys }
    }

    /// With no keys configured the API is open.
    pub fn is_open(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Validate an API key and return the associated client
    pub fn validate(&self, key: &str) -> Option<AuthClient> {
        self.keys.get(key).cloned()
    }
}

/// Authentication middleware
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    if state.api_keys.is_open() {
        return next.run(request).await;
    }

    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let api_key = match auth_header {
        Some(h) if h.starts_with("Bearer ") => &h[7..],
        Some(_) => {
            return ApiError::Unauthorized("Authorization header must use Bearer scheme")
                .into_response();
        }
        None => return ApiError::Unauthorized("Authorization header required").into_response(),
    };

    match state.api_keys.validate(api_key) {
        Some(client) => {
            tracing::debug!("Authenticated {}", client.name);
            request.extensions_mut().insert(client);
            next.run(request).await
        }
        None => ApiError::Unauthorized("Invalid API key").into_response(),
    }
}
