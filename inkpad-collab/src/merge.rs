//! Convergent content engine.
//!
//! Wraps a Yrs document holding the editable payload as a root text named
//! `"content"`. Local edits are applied in a single transaction and returned
//! as an incremental update to put on the wire; remote updates are applied
//! commutatively, so replicas converge to the same content regardless of
//! arrival order, and re-applying an update is a no-op — which is what makes
//! replay-after-reconnect safe.

use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, TextRef, Update};

/// A local edit against the current content.
///
/// Indices are UTF-8 byte offsets into the current merged content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    Insert { index: u32, text: String },
    Delete { index: u32, len: u32 },
    Replace { index: u32, len: u32, text: String },
}

/// Merge-level errors.
#[derive(Debug, Clone)]
pub enum MergeError {
    /// A remote update or state vector failed to decode/apply
    BadUpdate(String),
    /// An edit addressed a range outside the current content
    OutOfBounds { index: u32, len: u32 },
}

impl std::fmt::Display for MergeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadUpdate(e) => write!(f, "Bad update: {e}"),
            Self::OutOfBounds { index, len } => {
                write!(f, "Edit out of bounds: index {index}, content length {len}")
            }
        }
    }
}

impl std::error::Error for MergeError {}

/// The per-session content replica.
pub struct MergeEngine {
    doc: Doc,
    content: TextRef,
}

impl MergeEngine {
    /// Create a replica for `doc_id` seeded with `initial` content.
    ///
    /// The seed is encoded as an update built in a throwaway doc whose
    /// client id derives from `doc_id`, so every replica bootstrapping the
    /// same (document, content) emits identical seed operations — duplicated
    /// bootstraps merge into one instead of repeating the text. All replicas
    /// of a document must seed the same initial content.
    pub fn new(doc_id: Uuid, initial: &str) -> Self {
        let doc = Doc::new();
        let content = doc.get_or_insert_text("content");
        let mut engine = Self { doc, content };
        if !initial.is_empty() {
            let seed = Self::seed_update(doc_id, initial);
            // Applying the update we just encoded cannot fail
            let _ = engine.apply_remote(&seed);
        }
        engine
    }

    /// Deterministic bootstrap update for (doc_id, initial).
    fn seed_update(doc_id: Uuid, initial: &str) -> Vec<u8> {
        let bits = doc_id.as_u128();
        // Client ids stay within Yjs' 53-bit interop range
        let client_id = ((bits as u64) ^ ((bits >> 64) as u64)) & ((1 << 53) - 1);
        let seed_doc = Doc::with_client_id(client_id);
        let text = seed_doc.get_or_insert_text("content");
        let mut txn = yrs::Transact::transact_mut(&seed_doc);
        text.insert(&mut txn, 0, initial);
        txn.encode_update_v1()
    }

    /// Apply a local edit and return the incremental update to broadcast.
    pub fn apply_edit(&mut self, edit: &Edit) -> Result<Vec<u8>, MergeError> {
        let mut txn = yrs::Transact::transact_mut(&self.doc);
        let len = self.content.len(&txn);
        match edit {
            Edit::Insert { index, text } => {
                if *index > len {
                    return Err(MergeError::OutOfBounds { index: *index, len });
                }
                self.content.insert(&mut txn, *index, text);
            }
            Edit::Delete { index, len: span } => {
                if index.checked_add(*span).map_or(true, |end| end > len) {
                    return Err(MergeError::OutOfBounds { index: *index, len });
                }
                self.content.remove_range(&mut txn, *index, *span);
            }
            Edit::Replace { index, len: span, text } => {
                if index.checked_add(*span).map_or(true, |end| end > len) {
                    return Err(MergeError::OutOfBounds { index: *index, len });
                }
                self.content.remove_range(&mut txn, *index, *span);
                self.content.insert(&mut txn, *index, text);
            }
        }
        Ok(txn.encode_update_v1())
    }

    /// Apply a remote update (idempotent, order-independent).
    pub fn apply_remote(&mut self, update: &[u8]) -> Result<(), MergeError> {
        let decoded =
            Update::decode_v1(update).map_err(|e| MergeError::BadUpdate(e.to_string()))?;
        let mut txn = yrs::Transact::transact_mut(&self.doc);
        txn.apply_update(decoded)
            .map_err(|e| MergeError::BadUpdate(e.to_string()))?;
        Ok(())
    }

    /// Current merged content.
    pub fn content(&self) -> String {
        let txn = yrs::Transact::transact(&self.doc);
        self.content.get_string(&txn)
    }

    /// Content length in UTF-8 bytes.
    pub fn len(&self) -> u32 {
        let txn = yrs::Transact::transact(&self.doc);
        self.content.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encoded state vector for the sync handshake.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = yrs::Transact::transact(&self.doc);
        txn.state_vector().encode_v1()
    }

    /// Update containing everything the remote state vector is missing.
    pub fn diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, MergeError> {
        let sv =
            StateVector::decode_v1(remote_sv).map_err(|e| MergeError::BadUpdate(e.to_string()))?;
        let txn = yrs::Transact::transact(&self.doc);
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Full replica state as one update.
    pub fn encode_full(&self) -> Vec<u8> {
        let txn = yrs::Transact::transact(&self.doc);
        txn.encode_state_as_update_v1(&StateVector::default())
    }
}
