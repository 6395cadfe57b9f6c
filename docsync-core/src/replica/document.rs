//! A single collaborative document replica.
//!
//! Document shape:
//! ```text
//! {
//!   "title":   <string register>,
//!   "content": <Text>
//! }
//! ```
//!
//! Every replica starts from the same deterministic genesis change (fixed
//! actor, fixed timestamp). Replicas created independently, for example
//! offline on two devices, therefore agree on the identity of the `content`
//! text object and merge without conflicting roots.

use std::collections::VecDeque;

use automerge::transaction::{CommitOptions, Transactable};
use automerge::{ActorId, AutoCommit, ChangeHash, ObjId, ObjType, ReadDoc, Value, ROOT};
use thiserror::Error;

use super::storage::LocalStorageError;
use crate::snapshot::{DecodeError, EncodedSnapshot};

/// Root key holding the document title.
pub const TITLE_KEY: &str = "title";
/// Root key holding the collaborative text.
pub const CONTENT_KEY: &str = "content";

/// Actor used for the genesis change only.
const GENESIS_ACTOR: [u8; 16] = *b"docsync-genesis!";

/// Errors produced by replica operations.
#[derive(Error, Debug)]
pub enum ReplicaError {
    #[error("Index out of range: {index}+{len} exceeds text length {length}")]
    OutOfRange {
        index: usize,
        len: usize,
        length: usize,
    },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Automerge error: {0}")]
    Automerge(String),

    #[error(transparent)]
    Storage(#[from] LocalStorageError),
}

impl From<automerge::AutomergeError> for ReplicaError {
    fn from(e: automerge::AutomergeError) -> Self {
        ReplicaError::Automerge(e.to_string())
    }
}

/// A local edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalMutation {
    /// Insert `text` at character `index` of the content.
    InsertText { index: usize, text: String },
    /// Delete `len` characters starting at `index`.
    DeleteText { index: usize, len: usize },
    /// Replace the title.
    SetTitle(String),
}

impl LocalMutation {
    pub fn insert(index: usize, text: impl Into<String>) -> Self {
        LocalMutation::InsertText {
            index,
            text: text.into(),
        }
    }

    pub fn delete(index: usize, len: usize) -> Self {
        LocalMutation::DeleteText { index, len }
    }

    pub fn set_title(title: impl Into<String>) -> Self {
        LocalMutation::SetTitle(title.into())
    }
}

/// Builds the shared genesis document.
fn genesis() -> AutoCommit {
    let mut doc = AutoCommit::new().with_actor(ActorId::from(GENESIS_ACTOR.as_slice()));
    doc.put(ROOT, TITLE_KEY, "")
        .expect("genesis writes to a fresh document");
    doc.put_object(ROOT, CONTENT_KEY, ObjType::Text)
        .expect("genesis writes to a fresh document");
    doc.commit_with(CommitOptions::default().with_time(0));
    doc
}

/// One node's copy of a document.
///
/// Local mutations are applied immediately; the resulting delta is queued
/// in `pending` until the transport drains it.
#[derive(Debug)]
pub struct Replica {
    doc: AutoCommit,
    content: ObjId,
    pending: VecDeque<Vec<u8>>,
}

impl Replica {
    /// Creates a fresh replica from the shared genesis.
    pub fn new() -> Self {
        let mut doc = genesis();
        doc.set_actor(ActorId::random());
        let content = content_id(&doc).expect("genesis has a content object");
        Self {
            doc,
            content,
            pending: VecDeque::new(),
        }
    }

    /// Loads a replica from a full snapshot.
    pub fn from_snapshot(snapshot: &EncodedSnapshot) -> Result<Self, ReplicaError> {
        let doc = snapshot.decode()?;
        let content = content_id(&doc)?;
        Ok(Self {
            doc,
            content,
            pending: VecDeque::new(),
        })
    }

    /// The encoding every replica starts from.
    pub fn genesis_snapshot() -> EncodedSnapshot {
        EncodedSnapshot::new(genesis().save())
    }

    /// Applies a local mutation and queues its delta for propagation.
    pub fn apply(&mut self, mutation: LocalMutation) -> Result<(), ReplicaError> {
        let before = self.doc.get_heads();

        match mutation {
            LocalMutation::InsertText { index, text } => {
                let length = self.doc.length(&self.content);
                if index > length {
                    return Err(ReplicaError::OutOfRange {
                        index,
                        len: 0,
                        length,
                    });
                }
                self.doc.splice_text(&self.content, index, 0, &text)?;
            }
            LocalMutation::DeleteText { index, len } => {
                let length = self.doc.length(&self.content);
                if index.checked_add(len).map_or(true, |end| end > length) {
                    return Err(ReplicaError::OutOfRange { index, len, length });
                }
                self.doc
                    .splice_text(&self.content, index, len as isize, "")?;
            }
            LocalMutation::SetTitle(title) => {
                self.doc.put(ROOT, TITLE_KEY, title)?;
            }
        }

        self.doc.commit();
        let delta = self.doc.save_after(&before);
        if !delta.is_empty() {
            self.pending.push_back(delta);
        }
        Ok(())
    }

    /// Encodes the full replica state.
    pub fn encode(&mut self) -> EncodedSnapshot {
        EncodedSnapshot::new(self.doc.save())
    }

    /// Folds a remote snapshot into this replica.
    ///
    /// Returns the number of new changes. On error the replica is unchanged.
    pub fn merge(&mut self, snapshot: &EncodedSnapshot) -> Result<usize, ReplicaError> {
        let mut other = snapshot.decode_document()?;
        let mut next = self.doc.clone();
        let before = next.get_heads();
        next.merge(&mut other)
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let applied = next.get_changes(&before).len();
        self.replace(next)?;
        Ok(applied)
    }

    /// Folds an incremental delta received over the live channel.
    ///
    /// Deltas may arrive out of order; changes with missing dependencies
    /// are held by Automerge until their dependencies arrive.
    pub fn apply_remote(&mut self, delta: &[u8]) -> Result<usize, ReplicaError> {
        let mut next = self.doc.clone();
        let applied = next
            .load_incremental(delta)
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;
        self.replace(next)?;
        Ok(applied)
    }

    /// Swaps in a merged document if it still has the replica's shape.
    fn replace(&mut self, next: AutoCommit) -> Result<(), ReplicaError> {
        let content = content_id(&next)?;
        self.doc = next;
        self.content = content;
        Ok(())
    }

    /// Removes and returns all queued deltas.
    pub fn take_pending(&mut self) -> Vec<Vec<u8>> {
        self.pending.drain(..).collect()
    }

    /// Drops queued deltas after a full-state reconciliation covered them.
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Current content text.
    pub fn text(&self) -> Result<String, ReplicaError> {
        Ok(self.doc.text(&self.content)?)
    }

    /// Current title.
    pub fn title(&self) -> Result<String, ReplicaError> {
        match self.doc.get(ROOT, TITLE_KEY)? {
            Some((Value::Scalar(s), _)) => Ok(s.to_str().unwrap_or_default().to_string()),
            _ => Ok(String::new()),
        }
    }

    /// Sorted heads of the underlying document.
    pub fn heads(&mut self) -> Vec<ChangeHash> {
        let mut heads = self.doc.get_heads();
        heads.sort();
        heads
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

/// Looks up the `content` text object.
fn content_id(doc: &AutoCommit) -> Result<ObjId, ReplicaError> {
    match doc.get(ROOT, CONTENT_KEY)? {
        Some((Value::Object(ObjType::Text), id)) => Ok(id),
        _ => Err(DecodeError::Shape("document has no content text".to_string()).into()),
    }
}
