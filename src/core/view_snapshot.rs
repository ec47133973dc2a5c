use std::collections::{BTreeMap, BTreeSet};

use crate::core::query::Query;
use crate::model::{Document, DocumentKey, DocumentSet};

/// Whether the client considers itself connected to the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineState {
    Unknown,
    Online,
    Offline,
}

/// Per-view synchronization state. `None` only before the first snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    None,
    Local,
    Synced,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentViewChangeType {
    Added,
    Removed,
    Modified,
    Metadata,
}

/// A single change to the documents a view exposes.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub document: Document,
    pub change_type: DocumentViewChangeType,
}

impl DocumentViewChange {
    pub fn new(document: Document, change_type: DocumentViewChangeType) -> Self {
        Self {
            document,
            change_type,
        }
    }
}

/// Accumulates per-key changes while a view recomputes, merging successive
/// changes for the same document into the single change a listener should see.
#[derive(Debug, Default)]
pub struct DocumentViewChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentViewChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, change: DocumentViewChange) {
        use DocumentViewChangeType::*;

        let key = change.document.key().clone();
        let old = match self.changes.get(&key) {
            None => {
                self.changes.insert(key, change);
                return;
            }
            Some(old) => old.clone(),
        };

        let merged = match (old.change_type, change.change_type) {
            (Metadata, new_type) if new_type != Metadata => Some(change),
            (old_type, Metadata) if old_type != Removed => {
                Some(DocumentViewChange::new(change.document, old_type))
            }
            (Modified, Modified) => Some(DocumentViewChange::new(change.document, Modified)),
            (Added, Modified) => Some(DocumentViewChange::new(change.document, Added)),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange::new(old.document, Removed)),
            (Removed, Added) => Some(DocumentViewChange::new(change.document, Modified)),
            (old_type, new_type) => {
                panic!("Unsupported change merge: {old_type:?} after {new_type:?}")
            }
        };

        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    pub fn into_changes(self) -> Vec<DocumentViewChange> {
        self.changes.into_values().collect()
    }
}

/// Immutable description of a query result delivered to listeners.
#[derive(Clone, Debug)]
pub struct ViewSnapshot {
    query: Query,
    documents: DocumentSet,
    old_documents: DocumentSet,
    changes: Vec<DocumentViewChange>,
    from_cache: bool,
    mutated_keys: BTreeSet<DocumentKey>,
    sync_state_changed: bool,
}

impl ViewSnapshot {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        query: Query,
        documents: DocumentSet,
        old_documents: DocumentSet,
        changes: Vec<DocumentViewChange>,
        from_cache: bool,
        mutated_keys: BTreeSet<DocumentKey>,
        sync_state_changed: bool,
    ) -> Self {
        Self {
            query,
            documents,
            old_documents,
            changes,
            from_cache,
            mutated_keys,
            sync_state_changed,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn documents(&self) -> &DocumentSet {
        &self.documents
    }

    pub fn old_documents(&self) -> &DocumentSet {
        &self.old_documents
    }

    pub fn changes(&self) -> &[DocumentViewChange] {
        &self.changes
    }

    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    pub fn mutated_keys(&self) -> &BTreeSet<DocumentKey> {
        &self.mutated_keys
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }

    pub fn sync_state_changed(&self) -> bool {
        self.sync_state_changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DocumentState, ObjectValue, SnapshotVersion};

    fn doc(path: &str) -> Document {
        Document::new(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(1, 0),
            ObjectValue::empty(),
            DocumentState::Synced,
        )
    }

    fn change(path: &str, change_type: DocumentViewChangeType) -> DocumentViewChange {
        DocumentViewChange::new(doc(path), change_type)
    }

    #[test]
    fn added_then_removed_cancels_out() {
        let mut set = DocumentViewChangeSet::new();
        set.track(change("users/a", DocumentViewChangeType::Added));
        set.track(change("users/a", DocumentViewChangeType::Removed));
        assert!(set.into_changes().is_empty());
    }

    #[test]
    fn added_then_modified_stays_added() {
        let mut set = DocumentViewChangeSet::new();
        set.track(change("users/a", DocumentViewChangeType::Added));
        set.track(change("users/a", DocumentViewChangeType::Modified));
        let changes = set.into_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, DocumentViewChangeType::Added);
    }

    #[test]
    fn removed_then_added_becomes_modified() {
        let mut set = DocumentViewChangeSet::new();
        set.track(change("users/a", DocumentViewChangeType::Removed));
        set.track(change("users/a", DocumentViewChangeType::Added));
        let changes = set.into_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, DocumentViewChangeType::Modified);
    }
}
