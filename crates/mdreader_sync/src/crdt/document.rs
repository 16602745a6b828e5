//! The replicated document CRDT.
//!
//! A [`SyncedDocument`] wraps one Y.Doc with two roots:
//! - a Y.Text named `content` holding the free-form document body
//! - a Y.Map named `metadata` holding the title and other string properties
//!
//! Every local mutation returns the incremental update it produced, so the
//! caller can hand it to local persistence and to the replication binding.
//! Text positions are measured in UTF-16 code units, matching Y.js peers.

use yrs::{
    Doc, GetString, Map, OffsetKind, Options, ReadTxn, StateVector, Text, Transact, Update,
    updates::decoder::Decode, updates::encoder::Encode,
};

use crate::error::{Result, SyncError};

/// Name of the Y.Text holding the document body.
pub const CONTENT_TEXT_NAME: &str = "content";

/// Name of the Y.Map holding document metadata.
pub const METADATA_MAP_NAME: &str = "metadata";

/// Metadata key of the document title.
pub const TITLE_KEY: &str = "title";

/// A CRDT document for one editable document.
pub struct SyncedDocument {
    doc: Doc,
    content: yrs::TextRef,
    metadata: yrs::MapRef,
}

impl Default for SyncedDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncedDocument {
    /// Create a new empty document.
    pub fn new() -> Self {
        let doc = Doc::with_options(Options {
            offset_kind: OffsetKind::Utf16,
            ..Options::default()
        });
        let content = doc.get_or_insert_text(CONTENT_TEXT_NAME);
        let metadata = doc.get_or_insert_map(METADATA_MAP_NAME);
        Self {
            doc,
            content,
            metadata,
        }
    }

    /// Create a document from a full-state snapshot.
    ///
    /// A snapshot that fails to decode is an error: starting empty would
    /// silently drop the user's local edits on the next save.
    pub fn from_snapshot(snapshot: &[u8]) -> Result<Self> {
        let document = Self::new();
        document.apply_remote(snapshot)?;
        Ok(document)
    }

    // ==================== Content ====================

    /// Full body content.
    pub fn content(&self) -> String {
        let txn = self.doc.transact();
        self.content.get_string(&txn)
    }

    /// Body length in UTF-16 code units.
    pub fn content_len(&self) -> u32 {
        let txn = self.doc.transact();
        self.content.len(&txn)
    }

    /// Insert `text` at `index`. Returns the incremental update.
    pub fn insert_text(&self, index: u32, text: &str) -> Result<Vec<u8>> {
        let len = self.content_len();
        if index > len {
            return Err(SyncError::InvalidOperation(format!(
                "insert at {} is past the end of a {}-unit document",
                index, len
            )));
        }

        let sv_before = self.state_vector();
        {
            let mut txn = self.doc.transact_mut();
            self.content.insert(&mut txn, index, text);
        }
        Ok(self.update_since(&sv_before))
    }

    /// Delete `length` units starting at `index`. Returns the incremental update.
    pub fn delete_text(&self, index: u32, length: u32) -> Result<Vec<u8>> {
        let len = self.content_len();
        if index.checked_add(length).is_none_or(|end| end > len) {
            return Err(SyncError::InvalidOperation(format!(
                "delete of {}..+{} is outside a {}-unit document",
                index, length, len
            )));
        }

        let sv_before = self.state_vector();
        {
            let mut txn = self.doc.transact_mut();
            self.content.remove_range(&mut txn, index, length);
        }
        Ok(self.update_since(&sv_before))
    }

    /// Replace the body with `new_content` using a minimal prefix/suffix diff.
    ///
    /// Unchanged runs keep their CRDT identity so concurrent edits elsewhere
    /// in the text still merge. Returns `None` if nothing changed.
    pub fn set_content(&self, new_content: &str) -> Option<Vec<u8>> {
        let (current, sv_before) = {
            let txn = self.doc.transact();
            (self.content.get_string(&txn), txn.state_vector())
        };
        if current == new_content {
            return None;
        }

        let current_chars: Vec<char> = current.chars().collect();
        let new_chars: Vec<char> = new_content.chars().collect();

        let common_prefix = current_chars
            .iter()
            .zip(new_chars.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let remaining = (current_chars.len() - common_prefix).min(new_chars.len() - common_prefix);
        let common_suffix = current_chars[common_prefix..]
            .iter()
            .rev()
            .zip(new_chars[common_prefix..].iter().rev())
            .take_while(|(a, b)| a == b)
            .take(remaining)
            .count();

        let removed = &current_chars[common_prefix..current_chars.len() - common_suffix];
        let inserted: String = new_chars[common_prefix..new_chars.len() - common_suffix]
            .iter()
            .collect();
        let start = utf16_len(&current_chars[..common_prefix]);

        {
            let mut txn = self.doc.transact_mut();
            if !removed.is_empty() {
                self.content
                    .remove_range(&mut txn, start, utf16_len(removed));
            }
            if !inserted.is_empty() {
                self.content.insert(&mut txn, start, &inserted);
            }
        }
        Some(self.update_since(&sv_before))
    }

    // ==================== Metadata ====================

    /// Document title, if set.
    pub fn title(&self) -> Option<String> {
        self.metadata(TITLE_KEY)
    }

    /// Set the document title. Returns the incremental update.
    pub fn set_title(&self, title: &str) -> Vec<u8> {
        self.set_metadata(TITLE_KEY, title)
    }

    /// Read a metadata property.
    pub fn metadata(&self, key: &str) -> Option<String> {
        let txn = self.doc.transact();
        self.metadata
            .get(&txn, key)
            .and_then(|v| v.cast::<String>().ok())
    }

    /// Write a metadata property. Returns the incremental update.
    pub fn set_metadata(&self, key: &str, value: &str) -> Vec<u8> {
        let sv_before = self.state_vector();
        {
            let mut txn = self.doc.transact_mut();
            self.metadata.insert(&mut txn, key, value);
        }
        self.update_since(&sv_before)
    }

    /// Remove a metadata property. Returns the incremental update.
    pub fn remove_metadata(&self, key: &str) -> Vec<u8> {
        let sv_before = self.state_vector();
        {
            let mut txn = self.doc.transact_mut();
            self.metadata.remove(&mut txn, key);
        }
        self.update_since(&sv_before)
    }

    /// All metadata keys, sorted.
    pub fn metadata_keys(&self) -> Vec<String> {
        let txn = self.doc.transact();
        let mut keys: Vec<String> = self.metadata.keys(&txn).map(String::from).collect();
        keys.sort();
        keys
    }

    // ==================== Sync ====================

    /// Encode the current state vector (SyncStep1 payload).
    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.state_vector().encode_v1()
    }

    /// Encode the full state as an update (the persisted snapshot).
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode what a peer with `remote_state_vector` is missing (SyncStep2 payload).
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| SyncError::Crdt(format!("Failed to decode state vector: {}", e)))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Apply an update received from a peer or loaded from storage.
    pub fn apply_remote(&self, update: &[u8]) -> Result<()> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| SyncError::Crdt(format!("Failed to decode update: {}", e)))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| SyncError::Crdt(format!("Failed to apply update: {}", e)))?;
        Ok(())
    }

    fn state_vector(&self) -> StateVector {
        let txn = self.doc.transact();
        txn.state_vector()
    }

    fn update_since(&self, sv_before: &StateVector) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(sv_before)
    }
}

impl std::fmt::Debug for SyncedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncedDocument")
            .field("content_len", &self.content_len())
            .finish_non_exhaustive()
    }
}

fn utf16_len(chars: &[char]) -> u32 {
    chars.iter().map(|c| c.len_utf16() as u32).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_document_is_empty() {
        let doc = SyncedDocument::new();
        assert_eq!(doc.content(), "");
        assert_eq!(doc.content_len(), 0);
        assert!(doc.title().is_none());
    }

    #[test]
    fn test_insert_and_delete() {
        let doc = SyncedDocument::new();
        doc.insert_text(0, "Hello World").unwrap();
        doc.insert_text(5, ",").unwrap();
        assert_eq!(doc.content(), "Hello, World");

        doc.delete_text(5, 1).unwrap();
        assert_eq!(doc.content(), "Hello World");
    }

    #[test]
    fn test_out_of_range_edits_are_rejected() {
        let doc = SyncedDocument::new();
        doc.insert_text(0, "abc").unwrap();
        assert!(matches!(
            doc.insert_text(4, "x"),
            Err(SyncError::InvalidOperation(_))
        ));
        assert!(doc.delete_text(2, 2).is_err());
        assert!(doc.delete_text(u32::MAX, 2).is_err());
        assert_eq!(doc.content(), "abc");
    }

    #[test]
    fn test_set_content_minimal_diff_preserves_concurrent_edit() {
        let a = SyncedDocument::new();
        a.set_content("The quick fox");
        let b = SyncedDocument::from_snapshot(&a.encode_state()).unwrap();

        // A rewrites the middle, B appends at the end concurrently
        let ua = a.set_content("The slow fox").unwrap();
        let ub = b.insert_text(b.content_len(), "!").unwrap();

        a.apply_remote(&ub).unwrap();
        b.apply_remote(&ua).unwrap();
        assert_eq!(a.content(), "The slow fox!");
        assert_eq!(a.content(), b.content());
    }

    #[test]
    fn test_set_content_unchanged_is_noop() {
        let doc = SyncedDocument::new();
        doc.set_content("same");
        assert!(doc.set_content("same").is_none());
    }

    #[test]
    fn test_utf16_positions() {
        let doc = SyncedDocument::new();
        doc.set_content("a😀b");
        assert_eq!(doc.content_len(), 4);
        doc.set_content("a😀xb");
        assert_eq!(doc.content(), "a😀xb");
        doc.delete_text(1, 2).unwrap();
        assert_eq!(doc.content(), "axb");
    }

    #[test]
    fn test_metadata() {
        let doc = SyncedDocument::new();
        doc.set_title("Roadmap");
        doc.set_metadata("kind", "mindmap");
        assert_eq!(doc.title().as_deref(), Some("Roadmap"));
        assert_eq!(doc.metadata_keys(), vec!["kind", "title"]);

        doc.remove_metadata("kind");
        assert!(doc.metadata("kind").is_none());
    }

    #[test]
    fn test_state_vector_diff_sync() {
        let local = SyncedDocument::new();
        let remote = SyncedDocument::new();
        local.insert_text(0, "local").unwrap();
        remote.set_title("remote title");

        let diff = remote.encode_diff(&local.encode_state_vector()).unwrap();
        local.apply_remote(&diff).unwrap();
        assert_eq!(local.title().as_deref(), Some("remote title"));
        assert_eq!(local.content(), "local");
    }

    #[test]
    fn test_corrupt_snapshot_is_error() {
        assert!(matches!(
            SyncedDocument::from_snapshot(&[0xFF, 0xFF, 0xFF]),
            Err(SyncError::Crdt(_))
        ));
    }
}
