//! Document and client identifiers.
//!
//! A `DocumentId` is an opaque string shared by clients, the session issuer
//! and the snapshot endpoint. Freshly generated ids are UUIDs encoded with
//! bs58check, the same form automerge-repo uses, but any string made of
//! `[A-Za-z0-9._:-]` is accepted.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Maximum length of a document id.
pub const MAX_DOCUMENT_ID_LEN: usize = 256;

/// Maximum length of a client id.
pub const MAX_CLIENT_ID_LEN: usize = 128;

/// Errors that can occur when parsing identifiers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentIdError {
    #[error("Document ID is empty")]
    Empty,

    #[error("Document ID is too long: {0} characters (max 256)")]
    TooLong(usize),

    #[error("Document ID contains invalid character {0:?}")]
    InvalidCharacter(char),

    #[error("Client ID is empty")]
    EmptyClientId,

    #[error("Client ID is too long: {0} characters (max 128)")]
    ClientIdTooLong(usize),

    #[error("Client ID contains a control character")]
    ClientIdControlCharacter,
}

/// Identifier of one collaborative document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(String);

impl DocumentId {
    /// Generate a new random document ID
    pub fn generate() -> Self {
        let uuid = Uuid::new_v4();
        Self(bs58::encode(uuid.as_bytes()).with_check().into_string())
    }

    /// Parse and validate a document ID
    pub fn parse(s: &str) -> Result<Self, DocumentIdError> {
        if s.is_empty() {
            return Err(DocumentIdError::Empty);
        }

        let len = s.chars().count();
        if len > MAX_DOCUMENT_ID_LEN {
            return Err(DocumentIdError::TooLong(len));
        }

        if let Some(c) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-')))
        {
            return Err(DocumentIdError::InvalidCharacter(c));
        }

        Ok(Self(s.to_string()))
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for DocumentId {
    type Err = DocumentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for DocumentId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for DocumentId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Identifies the writer of a sync. Attribution only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    /// Generate a random client ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Parse and validate a client ID
    pub fn parse(s: &str) -> Result<Self, DocumentIdError> {
        if s.is_empty() {
            return Err(DocumentIdError::EmptyClientId);
        }

        let len = s.chars().count();
        if len > MAX_CLIENT_ID_LEN {
            return Err(DocumentIdError::ClientIdTooLong(len));
        }

        if s.chars().any(char::is_control) {
            return Err(DocumentIdError::ClientIdControlCharacter);
        }

        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for ClientId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ClientId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_unique() {
        let id1 = DocumentId::generate();
        let id2 = DocumentId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_generated_id_is_valid() {
        let id = DocumentId::generate();
        let parsed = DocumentId::parse(id.as_str()).unwrap();
        assert_eq!(id, parsed);

        // bs58check of 16 bytes lands around 23-25 chars
        assert!(id.as_str().len() >= 20 && id.as_str().len() <= 30);
    }

    #[test]
    fn test_parse_accepts_opaque_ids() {
        assert!(DocumentId::parse("notes-2024").is_ok());
        assert!(DocumentId::parse("workspace:page.42").is_ok());
        assert!(DocumentId::parse("a_b").is_ok());
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert_eq!(DocumentId::parse(""), Err(DocumentIdError::Empty));
        assert_eq!(
            DocumentId::parse("../evil"),
            Err(DocumentIdError::InvalidCharacter('/'))
        );
        assert_eq!(
            DocumentId::parse("has space"),
            Err(DocumentIdError::InvalidCharacter(' '))
        );

        let long = "a".repeat(MAX_DOCUMENT_ID_LEN + 1);
        assert!(matches!(
            DocumentId::parse(&long),
            Err(DocumentIdError::TooLong(_))
        ));
    }

    #[test]
    fn test_display() {
        let id = DocumentId::parse("doc-1").unwrap();
        assert_eq!(format!("{}", id), "doc-1");
    }

    #[test]
    fn test_serialization() {
        let id = DocumentId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let deserialized: DocumentId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, deserialized);
    }

    #[test]
    fn test_deserialize_rejects_invalid() {
        let result: Result<DocumentId, _> = serde_json::from_str("\"\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_client_id() {
        let id = ClientId::generate();
        assert!(uuid::Uuid::parse_str(id.as_str()).is_ok());

        assert!(ClientId::parse("laptop").is_ok());
        assert_eq!(ClientId::parse(""), Err(DocumentIdError::EmptyClientId));
        assert_eq!(
            ClientId::parse("bad\nid"),
            Err(DocumentIdError::ClientIdControlCharacter)
        );
    }
}
