use std::collections::{BTreeMap, BTreeSet};

use crate::core::query::Query;
use crate::core::view_snapshot::{
    DocumentViewChange, DocumentViewChangeSet, DocumentViewChangeType, OnlineState, SyncState,
    ViewSnapshot,
};
use crate::model::{Document, DocumentKey, DocumentSet, MaybeDocument};
use crate::remote::remote_event::TargetChange;

/// Change to the set of documents being tracked for limbo resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimboDocumentChangeType {
    Added,
    Removed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LimboDocumentChange {
    pub change_type: LimboDocumentChangeType,
    pub key: DocumentKey,
}

impl LimboDocumentChange {
    pub fn added(key: DocumentKey) -> Self {
        Self {
            change_type: LimboDocumentChangeType::Added,
            key,
        }
    }

    pub fn removed(key: DocumentKey) -> Self {
        Self {
            change_type: LimboDocumentChangeType::Removed,
            key,
        }
    }
}

/// Intermediate result of applying a change map to the view's document set.
/// Not yet visible to the user; [`View::apply_changes`] turns it into a
/// snapshot.
pub struct DocumentChanges {
    document_set: DocumentSet,
    change_set: DocumentViewChangeSet,
    needs_refill: bool,
    mutated_keys: BTreeSet<DocumentKey>,
}

impl DocumentChanges {
    pub fn needs_refill(&self) -> bool {
        self.needs_refill
    }
}

/// Result of applying document changes and/or a target change to a view.
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Materializes a query result from locally cached documents plus the
/// server's view of target membership, detecting documents the server claims
/// but the cache cannot produce (limbo documents).
pub struct View {
    query: Query,
    /// Keys the server has confirmed to be in the query result at the current
    /// resume point.
    synced_documents: BTreeSet<DocumentKey>,
    document_set: DocumentSet,
    limbo_documents: BTreeSet<DocumentKey>,
    mutated_keys: BTreeSet<DocumentKey>,
    current: bool,
    sync_state: SyncState,
}

impl View {
    pub fn new(query: Query, synced_documents: BTreeSet<DocumentKey>) -> Self {
        let comparator = query.comparator();
        Self {
            query,
            synced_documents,
            document_set: DocumentSet::new(comparator),
            limbo_documents: BTreeSet::new(),
            mutated_keys: BTreeSet::new(),
            current: false,
            sync_state: SyncState::None,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync_state
    }

    /// Computes how `changes` alters the view's document set. Pure with
    /// respect to the view; pass the result to [`View::apply_changes`].
    ///
    /// `previous` carries the partial result of an earlier pass when a limit
    /// query had to be re-filled from the full local result.
    pub fn compute_doc_changes(
        &self,
        changes: &BTreeMap<DocumentKey, MaybeDocument>,
        previous: Option<DocumentChanges>,
    ) -> DocumentChanges {
        let (mut new_document_set, mut change_set, mut mutated_keys) = match previous {
            Some(previous) => (
                previous.document_set,
                previous.change_set,
                previous.mutated_keys,
            ),
            None => (
                self.document_set.clone(),
                DocumentViewChangeSet::new(),
                self.mutated_keys.clone(),
            ),
        };
        let mut needs_refill = false;

        // When the result set sits exactly at the limit, any removal or
        // reordering past the boundary may pull a previously discarded
        // document back in, which only a fresh query against the local store
        // can discover.
        let last_doc_in_limit = match self.query.limit() {
            Some(limit) if new_document_set.len() == limit as usize => {
                new_document_set.last().cloned()
            }
            _ => None,
        };

        for (key, maybe_doc) in changes {
            let old_doc = new_document_set.get(key).cloned();
            let new_doc = maybe_doc
                .document()
                .filter(|doc| self.query.matches(doc))
                .cloned();

            let old_had_pending = old_doc
                .as_ref()
                .map(|doc| mutated_keys.contains(doc.key()))
                .unwrap_or(false);
            let new_has_pending = new_doc
                .as_ref()
                .map(|doc| {
                    doc.has_local_mutations()
                        || (mutated_keys.contains(doc.key()) && doc.has_committed_mutations())
                })
                .unwrap_or(false);

            let mut change_applied = false;
            match (&old_doc, &new_doc) {
                (Some(old), Some(new)) => {
                    if old.data() != new.data() {
                        if !Self::should_wait_for_synced_document(old, new) {
                            change_set.track(DocumentViewChange::new(
                                new.clone(),
                                DocumentViewChangeType::Modified,
                            ));
                            change_applied = true;
                            if let Some(last) = &last_doc_in_limit {
                                if self.query.compare(new, last) == std::cmp::Ordering::Greater {
                                    needs_refill = true;
                                }
                            }
                        }
                    } else if old_had_pending != new_has_pending {
                        change_set.track(DocumentViewChange::new(
                            new.clone(),
                            DocumentViewChangeType::Metadata,
                        ));
                        change_applied = true;
                    }
                }
                (None, Some(new)) => {
                    change_set.track(DocumentViewChange::new(
                        new.clone(),
                        DocumentViewChangeType::Added,
                    ));
                    change_applied = true;
                }
                (Some(old), None) => {
                    change_set.track(DocumentViewChange::new(
                        old.clone(),
                        DocumentViewChangeType::Removed,
                    ));
                    change_applied = true;
                    if last_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new) => {
                        new_document_set.insert(new.clone());
                        if new_has_pending {
                            mutated_keys.insert(new.key().clone());
                        } else {
                            mutated_keys.remove(new.key());
                        }
                    }
                    None => {
                        new_document_set.remove(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = self.query.limit() {
            while new_document_set.len() > limit as usize {
                let over_limit = new_document_set
                    .last()
                    .cloned()
                    .expect("non-empty set above limit");
                new_document_set.remove(over_limit.key());
                mutated_keys.remove(over_limit.key());
                change_set.track(DocumentViewChange::new(
                    over_limit,
                    DocumentViewChangeType::Removed,
                ));
            }
        }

        DocumentChanges {
            document_set: new_document_set,
            change_set,
            needs_refill,
            mutated_keys,
        }
    }

    /// A locally mutated document whose committed replacement arrives via the
    /// write acknowledgment keeps its latency-compensated contents until the
    /// watch stream confirms the same version.
    fn should_wait_for_synced_document(old: &Document, new: &Document) -> bool {
        old.has_local_mutations() && new.has_committed_mutations() && !new.has_local_mutations()
    }

    /// Applies precomputed document changes plus the target's server-side
    /// membership delta, recomputing limbo state and emitting a snapshot when
    /// anything observable changed.
    ///
    /// `resolved_limbo_documents` carries keys whose resolution listen
    /// terminally failed: they leave `synced_documents` even without a target
    /// change, which is what releases their limbo tracking.
    pub fn apply_changes(
        &mut self,
        doc_changes: DocumentChanges,
        target_change: Option<&TargetChange>,
        resolved_limbo_documents: &BTreeSet<DocumentKey>,
    ) -> ViewChange {
        assert!(
            !doc_changes.needs_refill,
            "Cannot apply changes that need a refill"
        );

        let old_documents =
            std::mem::replace(&mut self.document_set, doc_changes.document_set.clone());
        self.mutated_keys = doc_changes.mutated_keys;

        let mut changes = doc_changes.change_set.into_changes();
        changes.sort_by(|left, right| {
            Self::change_type_order(left.change_type)
                .cmp(&Self::change_type_order(right.change_type))
                .then_with(|| self.query.compare(&left.document, &right.document))
        });

        self.apply_target_change(target_change, resolved_limbo_documents);
        let limbo_changes = self.update_limbo_documents();

        let synced = self.current && self.limbo_documents.is_empty();
        let new_sync_state = if synced {
            SyncState::Synced
        } else {
            SyncState::Local
        };
        let sync_state_changed = new_sync_state != self.sync_state;
        self.sync_state = new_sync_state;

        let snapshot = if changes.is_empty() && !sync_state_changed {
            None
        } else {
            Some(ViewSnapshot::new(
                self.query.clone(),
                self.document_set.clone(),
                old_documents,
                changes,
                new_sync_state == SyncState::Local,
                self.mutated_keys.clone(),
                sync_state_changed,
            ))
        };

        ViewChange {
            snapshot,
            limbo_changes,
        }
    }

    fn change_type_order(change_type: DocumentViewChangeType) -> u8 {
        match change_type {
            DocumentViewChangeType::Removed => 0,
            DocumentViewChangeType::Added => 1,
            DocumentViewChangeType::Modified => 2,
            DocumentViewChangeType::Metadata => 2,
        }
    }

    fn apply_target_change(
        &mut self,
        target_change: Option<&TargetChange>,
        resolved_limbo_documents: &BTreeSet<DocumentKey>,
    ) {
        if let Some(change) = target_change {
            for key in &change.added_documents {
                self.synced_documents.insert(key.clone());
            }
            for key in &change.modified_documents {
                debug_assert!(
                    self.synced_documents.contains(key),
                    "Modified document {key} not in synced set"
                );
            }
            for key in &change.removed_documents {
                self.synced_documents.remove(key);
            }
            self.current = change.current;
        }

        for key in resolved_limbo_documents {
            self.synced_documents.remove(key);
        }
    }

    /// Recomputes which server-confirmed keys the local result cannot
    /// produce. Only meaningful once the target is CURRENT; before that the
    /// server has not finished describing the result.
    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }

        let old_limbo = std::mem::take(&mut self.limbo_documents);
        self.limbo_documents = self
            .synced_documents
            .iter()
            .filter(|key| !self.document_set.contains(key))
            .cloned()
            .collect();

        let mut changes = Vec::new();
        for key in self.limbo_documents.difference(&old_limbo) {
            changes.push(LimboDocumentChange::added(key.clone()));
        }
        for key in old_limbo.difference(&self.limbo_documents) {
            changes.push(LimboDocumentChange::removed(key.clone()));
        }
        changes
    }

    /// Going offline drops CURRENT: snapshots revert to from-cache until the
    /// stream recovers. Never produces limbo changes.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if online_state == OnlineState::Offline && self.current {
            self.current = false;
            let unchanged = DocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentViewChangeSet::new(),
                needs_refill: false,
                mutated_keys: self.mutated_keys.clone(),
            };
            return self.apply_changes(unchanged, None, &BTreeSet::new());
        }
        ViewChange {
            snapshot: None,
            limbo_changes: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DocumentState, NoDocument, ObjectValue, SnapshotVersion};
    use serde_json::{json, Value};
    use std::collections::BTreeMap;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(path: &str, pairs: &[(&str, Value)]) -> Document {
        let map: BTreeMap<String, Value> = pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        Document::new(
            key(path),
            SnapshotVersion::new(1, 0),
            ObjectValue::new(map),
            DocumentState::Synced,
        )
    }

    fn changes(docs: &[Document]) -> BTreeMap<DocumentKey, MaybeDocument> {
        docs.iter()
            .map(|doc| (doc.key().clone(), MaybeDocument::Document(doc.clone())))
            .collect()
    }

    fn no_doc(path: &str) -> (DocumentKey, MaybeDocument) {
        (
            key(path),
            MaybeDocument::NoDocument(NoDocument::new(key(path), SnapshotVersion::NONE, false)),
        )
    }

    fn users_query() -> Query {
        Query::collection("users").unwrap()
    }

    #[test]
    fn first_snapshot_is_from_cache() {
        let mut view = View::new(users_query(), BTreeSet::new());
        let doc_changes = view.compute_doc_changes(&changes(&[doc("users/a", &[])]), None);
        let change = view.apply_changes(doc_changes, None, &BTreeSet::new());

        let snapshot = change.snapshot.expect("initial snapshot");
        assert!(snapshot.from_cache());
        assert!(snapshot.sync_state_changed());
        assert_eq!(snapshot.documents().len(), 1);
        assert!(change.limbo_changes.is_empty());
    }

    #[test]
    fn current_marker_transitions_to_synced() {
        let mut view = View::new(users_query(), BTreeSet::new());
        let doc_changes = view.compute_doc_changes(&changes(&[doc("users/a", &[])]), None);
        view.apply_changes(doc_changes, None, &BTreeSet::new());

        let mut target_change = TargetChange::current_marker();
        target_change.added_documents.insert(key("users/a"));
        let doc_changes = view.compute_doc_changes(&BTreeMap::new(), None);
        let change = view.apply_changes(doc_changes, Some(&target_change), &BTreeSet::new());

        let snapshot = change.snapshot.expect("sync state snapshot");
        assert!(!snapshot.from_cache());
        assert!(change.limbo_changes.is_empty());
    }

    #[test]
    fn server_confirmed_key_missing_locally_enters_limbo() {
        let mut view = View::new(users_query(), BTreeSet::new());
        let doc_changes = view.compute_doc_changes(&BTreeMap::new(), None);
        view.apply_changes(doc_changes, None, &BTreeSet::new());

        let mut target_change = TargetChange::current_marker();
        target_change.added_documents.insert(key("users/x"));
        let doc_changes = view.compute_doc_changes(&BTreeMap::new(), None);
        let change = view.apply_changes(doc_changes, Some(&target_change), &BTreeSet::new());

        assert_eq!(
            change.limbo_changes,
            vec![LimboDocumentChange::added(key("users/x"))]
        );
        // Still from-cache and still empty: nothing observable changed.
        assert!(change.snapshot.is_none());
        assert_eq!(view.sync_state(), SyncState::Local);
    }

    #[test]
    fn limbo_clears_once_document_arrives() {
        let mut view = View::new(users_query(), BTreeSet::new());
        let initial = view.compute_doc_changes(&BTreeMap::new(), None);
        view.apply_changes(initial, None, &BTreeSet::new());

        let mut target_change = TargetChange::current_marker();
        target_change.added_documents.insert(key("users/x"));
        let doc_changes = view.compute_doc_changes(&BTreeMap::new(), None);
        view.apply_changes(doc_changes, Some(&target_change), &BTreeSet::new());

        let doc_changes = view.compute_doc_changes(&changes(&[doc("users/x", &[])]), None);
        let change = view.apply_changes(doc_changes, None, &BTreeSet::new());

        assert_eq!(
            change.limbo_changes,
            vec![LimboDocumentChange::removed(key("users/x"))]
        );
        let snapshot = change.snapshot.expect("snapshot");
        assert!(!snapshot.from_cache());
        assert_eq!(snapshot.documents().len(), 1);
    }

    #[test]
    fn resolved_limbo_key_leaves_synced_set() {
        let mut synced = BTreeSet::new();
        synced.insert(key("users/x"));
        let mut view = View::new(users_query(), synced);

        let doc_changes = view.compute_doc_changes(&BTreeMap::new(), None);
        view.apply_changes(
            doc_changes,
            Some(&TargetChange::current_marker()),
            &BTreeSet::new(),
        );
        assert!(view.limbo_documents().contains(&key("users/x")));

        let resolved: BTreeSet<_> = [key("users/x")].into_iter().collect();
        let purge: BTreeMap<_, _> = [no_doc("users/x")].into_iter().collect();
        let doc_changes = view.compute_doc_changes(&purge, None);
        let change = view.apply_changes(doc_changes, None, &resolved);

        assert!(view.synced_documents().is_empty());
        assert_eq!(
            change.limbo_changes,
            vec![LimboDocumentChange::removed(key("users/x"))]
        );
    }

    #[test]
    fn removal_inside_limit_window_needs_refill() {
        let query = users_query().with_limit(2);
        let mut view = View::new(query, BTreeSet::new());
        let initial =
            view.compute_doc_changes(&changes(&[doc("users/a", &[]), doc("users/b", &[])]), None);
        view.apply_changes(initial, None, &BTreeSet::new());

        let mut removal = BTreeMap::new();
        removal.extend([no_doc("users/a")]);
        let doc_changes = view.compute_doc_changes(&removal, None);
        assert!(doc_changes.needs_refill());
    }

    #[test]
    fn offline_reverts_to_from_cache_without_limbo_changes() {
        let mut view = View::new(users_query(), BTreeSet::new());
        let initial = view.compute_doc_changes(&BTreeMap::new(), None);
        view.apply_changes(
            initial,
            Some(&TargetChange::current_marker()),
            &BTreeSet::new(),
        );
        assert_eq!(view.sync_state(), SyncState::Synced);

        let change = view.apply_online_state_change(OnlineState::Offline);
        assert!(change.limbo_changes.is_empty());
        let snapshot = change.snapshot.expect("offline snapshot");
        assert!(snapshot.from_cache());
        assert!(snapshot.sync_state_changed());

        // Already offline: no further snapshot.
        let change = view.apply_online_state_change(OnlineState::Offline);
        assert!(change.snapshot.is_none());
    }
}
