//! Encoded snapshots and the merge primitive.
//!
//! An [`EncodedSnapshot`] is the full Automerge encoding of a replica. The
//! bytes are opaque to everything except [`merge_snapshots`], which folds
//! two encodings together with Automerge's native merge. Merging is
//! commutative, associative and idempotent, so the order in which snapshots
//! arrive never matters.

use automerge::{AutoCommit, ObjType, ReadDoc, Value, ROOT};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::replica::CONTENT_KEY;

/// A snapshot could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Snapshot is empty")]
    Empty,

    #[error("Snapshot is not valid base64: {0}")]
    Base64(String),

    #[error("Malformed snapshot: {0}")]
    Malformed(String),

    #[error("Snapshot is not a docsync document: {0}")]
    Shape(String),
}

/// Full serialized state of a replica at a point in time.
#[derive(Clone, PartialEq, Eq)]
pub struct EncodedSnapshot(Vec<u8>);

impl EncodedSnapshot {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Encode as standard base64 for JSON transport.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    /// Decode from standard base64.
    pub fn from_base64(s: &str) -> Result<Self, DecodeError> {
        STANDARD
            .decode(s.trim())
            .map(Self)
            .map_err(|e| DecodeError::Base64(e.to_string()))
    }

    /// Decode into a live Automerge document.
    pub fn decode(&self) -> Result<AutoCommit, DecodeError> {
        if self.0.is_empty() {
            return Err(DecodeError::Empty);
        }
        AutoCommit::load(&self.0).map_err(|e| DecodeError::Malformed(e.to_string()))
    }

    /// Decode and require the document shape every replica relies on.
    pub fn decode_document(&self) -> Result<AutoCommit, DecodeError> {
        let doc = self.decode()?;
        check_shape(&doc)?;
        Ok(doc)
    }
}

/// Checks that the root `content` key resolves to a text object.
///
/// Automerge accepts any document, and a concurrent write of another type
/// under `content` can win the key, so this holds after merges too.
pub fn check_shape(doc: &AutoCommit) -> Result<(), DecodeError> {
    match doc.get(ROOT, CONTENT_KEY) {
        Ok(Some((Value::Object(ObjType::Text), _))) => Ok(()),
        Ok(_) => Err(DecodeError::Shape(format!("`{}` is not text", CONTENT_KEY))),
        Err(e) => Err(DecodeError::Malformed(e.to_string())),
    }
}

impl std::fmt::Debug for EncodedSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncodedSnapshot({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for EncodedSnapshot {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl Serialize for EncodedSnapshot {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for EncodedSnapshot {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

/// Result of folding one snapshot into another.
#[derive(Debug, Clone)]
pub struct Merged {
    /// The merged encoding.
    pub snapshot: EncodedSnapshot,
    /// Number of changes the incoming snapshot contributed.
    pub new_changes: usize,
}

impl Merged {
    /// True when the incoming snapshot added nothing.
    pub fn is_unchanged(&self) -> bool {
        self.new_changes == 0
    }
}

/// Merge `incoming` into `base`.
///
/// Both inputs are decoded before anything is merged; a decode failure on
/// either side leaves nothing half-applied. A merge whose result would lose
/// the document shape fails with [`DecodeError::Shape`]. When `incoming`
/// contributes no changes, the returned snapshot is `base` byte-for-byte.
pub fn merge_snapshots(
    base: &EncodedSnapshot,
    incoming: &EncodedSnapshot,
) -> Result<Merged, DecodeError> {
    let mut incoming_doc = incoming.decode_document()?;
    let mut doc = base.decode()?;

    let before = doc.get_heads();
    doc.merge(&mut incoming_doc)
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let new_changes = doc.get_changes(&before).len();
    if new_changes > 0 {
        check_shape(&doc)?;
    }

    let snapshot = if new_changes == 0 {
        base.clone()
    } else {
        EncodedSnapshot(doc.save())
    };

    Ok(Merged {
        snapshot,
        new_changes,
    })
}
