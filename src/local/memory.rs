use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_lock::Mutex;
use async_trait::async_trait;

use crate::auth::User;
use crate::core::query::Query;
use crate::core::target_id_generator::TargetIdGenerator;
use crate::error::{internal_error, SyncResult};
use crate::local::local_store::{
    LocalStore, LocalViewChanges, LocalWriteResult, QueryData, QueryPurpose,
};
use crate::local::reference_set::ReferenceSet;
use crate::model::{
    BatchId, Document, DocumentKey, ListenSequenceNumber, MaybeDocument, Mutation, MutationBatch,
    MutationBatchResult, SnapshotVersion, TargetId, BATCH_ID_UNKNOWN,
};
use crate::remote::remote_event::RemoteEvent;

/// In-memory [`LocalStore`]: a remote document cache plus per-user mutation
/// queues applied as latency-compensating overlays.
pub struct MemoryLocalStore {
    inner: Mutex<Inner>,
}

struct Inner {
    remote_documents: BTreeMap<DocumentKey, MaybeDocument>,
    queues_by_user: BTreeMap<User, Vec<MutationBatch>>,
    current_user: User,
    next_batch_id: BatchId,
    targets_by_query: HashMap<Query, QueryData>,
    remote_keys_by_target: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
    target_id_generator: TargetIdGenerator,
    sequence_number: ListenSequenceNumber,
    pinned_documents: ReferenceSet,
}

impl Inner {
    fn queue(&self) -> &[MutationBatch] {
        self.queues_by_user
            .get(&self.current_user)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Latency-compensated view of a single key: the remote base with every
    /// pending batch of the current user applied on top.
    fn local_view(&self, key: &DocumentKey) -> Option<MaybeDocument> {
        let mut current = self.remote_documents.get(key).cloned();
        for batch in self.queue() {
            current = batch.apply_to_local_view(key, current);
        }
        current
    }

    fn local_views(&self, keys: &BTreeSet<DocumentKey>) -> BTreeMap<DocumentKey, MaybeDocument> {
        keys.iter()
            .filter_map(|key| self.local_view(key).map(|doc| (key.clone(), doc)))
            .collect()
    }
}

impl MemoryLocalStore {
    pub fn new(initial_user: User) -> Self {
        Self {
            inner: Mutex::new(Inner {
                remote_documents: BTreeMap::new(),
                queues_by_user: BTreeMap::new(),
                current_user: initial_user,
                next_batch_id: 1,
                targets_by_query: HashMap::new(),
                remote_keys_by_target: BTreeMap::new(),
                target_id_generator: TargetIdGenerator::for_local_store(0),
                sequence_number: 0,
                pinned_documents: ReferenceSet::new(),
            }),
        }
    }

    /// Seeds the remote document cache, as if the document had been received
    /// from the backend in a previous session.
    pub async fn restore_document(&self, doc: MaybeDocument) {
        let mut inner = self.inner.lock().await;
        inner.remote_documents.insert(doc.key().clone(), doc);
    }

    /// Keys currently pinned for a target by active views.
    pub async fn pinned_document_keys(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        let inner = self.inner.lock().await;
        inner.pinned_documents.references_for_id(target_id)
    }

    pub async fn pending_batch_ids(&self) -> Vec<BatchId> {
        let inner = self.inner.lock().await;
        inner.queue().iter().map(|batch| batch.batch_id).collect()
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn allocate_query(&self, query: Query) -> SyncResult<QueryData> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.targets_by_query.get(&query) {
            return Ok(existing.clone());
        }

        let target_id = inner.target_id_generator.next_id();
        inner.sequence_number += 1;
        let query_data = QueryData::new(
            query.clone(),
            target_id,
            inner.sequence_number,
            QueryPurpose::Listen,
        );
        inner.targets_by_query.insert(query, query_data.clone());
        inner.remote_keys_by_target.entry(target_id).or_default();
        Ok(query_data)
    }

    async fn release_query(&self, query: &Query) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        let query_data = inner
            .targets_by_query
            .remove(query)
            .ok_or_else(|| internal_error(format!("Release of unknown query: {}", query.canonical_id())))?;
        inner.remote_keys_by_target.remove(&query_data.target_id);
        inner
            .pinned_documents
            .remove_references_for_id(query_data.target_id);
        Ok(())
    }

    async fn execute_query(&self, query: &Query) -> SyncResult<BTreeMap<DocumentKey, Document>> {
        let inner = self.inner.lock().await;

        let mut candidates: BTreeSet<DocumentKey> = inner
            .remote_documents
            .keys()
            .filter(|key| query.path().is_prefix_of(key.path()))
            .cloned()
            .collect();
        for batch in inner.queue() {
            candidates.extend(batch.document_keys());
        }

        let mut results = BTreeMap::new();
        for key in candidates {
            if let Some(MaybeDocument::Document(doc)) = inner.local_view(&key) {
                if query.matches(&doc) {
                    results.insert(key, doc);
                }
            }
        }
        Ok(results)
    }

    async fn get_remote_document_keys(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        let inner = self.inner.lock().await;
        inner
            .remote_keys_by_target
            .get(&target_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn write_locally(&self, mutations: Vec<Mutation>) -> SyncResult<LocalWriteResult> {
        let mut inner = self.inner.lock().await;
        let batch_id = inner.next_batch_id;
        inner.next_batch_id += 1;

        let batch = MutationBatch::new(batch_id, SnapshotVersion::now(), mutations);
        let affected: BTreeSet<DocumentKey> = batch.document_keys().into_iter().collect();
        let user = inner.current_user.clone();
        inner.queues_by_user.entry(user).or_default().push(batch);

        Ok(LocalWriteResult {
            batch_id,
            changes: inner.local_views(&affected),
        })
    }

    async fn apply_remote_event(
        &self,
        event: RemoteEvent,
    ) -> SyncResult<BTreeMap<DocumentKey, MaybeDocument>> {
        let mut inner = self.inner.lock().await;

        for (target_id, change) in &event.target_changes {
            let keys = inner.remote_keys_by_target.entry(*target_id).or_default();
            for key in &change.removed_documents {
                keys.remove(key);
            }
            for key in change
                .added_documents
                .iter()
                .chain(change.modified_documents.iter())
            {
                keys.insert(key.clone());
            }
        }
        for target_id in &event.target_mismatches {
            inner.remote_keys_by_target.remove(target_id);
        }

        let mut changed = BTreeSet::new();
        for (key, update) in &event.document_updates {
            let authoritative = event.resolved_limbo_documents.contains(key);
            let apply = match inner.remote_documents.get(key) {
                None => true,
                Some(existing) => authoritative || update.version() >= existing.version(),
            };
            if apply {
                inner.remote_documents.insert(key.clone(), update.clone());
                changed.insert(key.clone());
            } else {
                log::debug!(
                    "Ignoring outdated watch update for {key}; current version {:?}, watch version {:?}",
                    inner.remote_documents.get(key).map(|doc| doc.version()),
                    update.version()
                );
            }
        }

        Ok(inner.local_views(&changed))
    }

    async fn acknowledge_batch(
        &self,
        result: MutationBatchResult,
    ) -> SyncResult<BTreeMap<DocumentKey, MaybeDocument>> {
        let mut inner = self.inner.lock().await;
        let batch_id = result.batch_id();

        let user = inner.current_user.clone();
        let queue = inner.queues_by_user.entry(user).or_default();
        let position = queue
            .iter()
            .position(|batch| batch.batch_id == batch_id)
            .ok_or_else(|| internal_error(format!("Acknowledged batch {batch_id} not in queue")))?;
        let batch = queue.remove(position);

        for mutation in &batch.mutations {
            let key = mutation.key();
            let version = result
                .doc_versions
                .get(key)
                .copied()
                .unwrap_or(result.commit_version);
            let existing = inner.remote_documents.get(key);
            let apply = existing
                .map(|existing| version > existing.version())
                .unwrap_or(true);
            if apply {
                let updated = mutation.apply_to_remote_document(existing, version);
                inner.remote_documents.insert(key.clone(), updated);
            }
        }

        let affected: BTreeSet<DocumentKey> = batch.document_keys().into_iter().collect();
        Ok(inner.local_views(&affected))
    }

    async fn reject_batch(
        &self,
        batch_id: BatchId,
    ) -> SyncResult<BTreeMap<DocumentKey, MaybeDocument>> {
        let mut inner = self.inner.lock().await;

        let user = inner.current_user.clone();
        let queue = inner.queues_by_user.entry(user).or_default();
        let position = queue
            .iter()
            .position(|batch| batch.batch_id == batch_id)
            .ok_or_else(|| internal_error(format!("Rejected batch {batch_id} not in queue")))?;
        let batch = queue.remove(position);

        let affected: BTreeSet<DocumentKey> = batch.document_keys().into_iter().collect();
        Ok(inner.local_views(&affected))
    }

    async fn notify_local_view_changes(&self, changes: Vec<LocalViewChanges>) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        for change in changes {
            for key in change.added {
                inner.pinned_documents.add_reference(key, change.target_id);
            }
            for key in &change.removed {
                inner
                    .pinned_documents
                    .remove_reference(key, change.target_id);
            }
        }
        Ok(())
    }

    async fn get_highest_unacknowledged_batch_id(&self) -> BatchId {
        let inner = self.inner.lock().await;
        inner
            .queue()
            .last()
            .map(|batch| batch.batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN)
    }

    async fn handle_user_change(
        &self,
        user: User,
    ) -> SyncResult<BTreeMap<DocumentKey, MaybeDocument>> {
        let mut inner = self.inner.lock().await;

        let mut affected: BTreeSet<DocumentKey> = BTreeSet::new();
        for batch in inner.queue() {
            affected.extend(batch.document_keys());
        }
        inner.current_user = user;
        for batch in inner.queue() {
            affected.extend(batch.document_keys());
        }

        // Keys visible only through the old user's queue have no local view
        // anymore; report a tombstone so views drop them.
        Ok(affected
            .into_iter()
            .map(|key| {
                let view = inner.local_view(&key).unwrap_or_else(|| {
                    MaybeDocument::NoDocument(crate::model::NoDocument::new(
                        key.clone(),
                        SnapshotVersion::NONE,
                        false,
                    ))
                });
                (key, view)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DocumentState, ObjectValue};
    use serde_json::json;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn fields(pairs: &[(&str, serde_json::Value)]) -> ObjectValue {
        let map: BTreeMap<String, serde_json::Value> = pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        ObjectValue::new(map)
    }

    fn synced_doc(path: &str, version: i64, pairs: &[(&str, serde_json::Value)]) -> MaybeDocument {
        MaybeDocument::Document(Document::new(
            key(path),
            SnapshotVersion::new(version, 0),
            fields(pairs),
            DocumentState::Synced,
        ))
    }

    #[tokio::test]
    async fn allocates_even_target_ids() {
        let store = MemoryLocalStore::new(User::unauthenticated());
        let first = store
            .allocate_query(Query::collection("users").unwrap())
            .await
            .unwrap();
        let second = store
            .allocate_query(Query::collection("rooms").unwrap())
            .await
            .unwrap();
        assert_eq!(first.target_id % 2, 0);
        assert_eq!(second.target_id % 2, 0);
        assert!(second.target_id > first.target_id);
        assert!(second.sequence_number > first.sequence_number);
    }

    #[tokio::test]
    async fn reallocating_live_query_returns_existing_target() {
        let store = MemoryLocalStore::new(User::unauthenticated());
        let query = Query::collection("users").unwrap();
        let first = store.allocate_query(query.clone()).await.unwrap();
        let second = store.allocate_query(query).await.unwrap();
        assert_eq!(first.target_id, second.target_id);
    }

    #[tokio::test]
    async fn execute_query_overlays_pending_mutations() {
        let store = MemoryLocalStore::new(User::unauthenticated());
        store
            .restore_document(synced_doc("users/a", 1, &[("n", json!(1))]))
            .await;

        store
            .write_locally(vec![Mutation::Set {
                key: key("users/b"),
                value: fields(&[("n", json!(2))]),
            }])
            .await
            .unwrap();

        let results = store
            .execute_query(&Query::collection("users").unwrap())
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[&key("users/b")].has_local_mutations());
    }

    #[tokio::test]
    async fn local_delete_hides_remote_document() {
        let store = MemoryLocalStore::new(User::unauthenticated());
        store
            .restore_document(synced_doc("users/a", 1, &[("n", json!(1))]))
            .await;

        let result = store
            .write_locally(vec![Mutation::Delete { key: key("users/a") }])
            .await
            .unwrap();
        assert!(!result.changes[&key("users/a")].exists());

        let results = store
            .execute_query(&Query::collection("users").unwrap())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn acknowledge_applies_batch_to_remote_cache() {
        let store = MemoryLocalStore::new(User::unauthenticated());
        let write = store
            .write_locally(vec![Mutation::Set {
                key: key("users/a"),
                value: fields(&[("n", json!(2))]),
            }])
            .await
            .unwrap();

        let batch = MutationBatch::new(
            write.batch_id,
            SnapshotVersion::now(),
            vec![Mutation::Set {
                key: key("users/a"),
                value: fields(&[("n", json!(2))]),
            }],
        );
        let changes = store
            .acknowledge_batch(MutationBatchResult::new(batch, SnapshotVersion::new(5, 0)))
            .await
            .unwrap();

        let doc = changes[&key("users/a")].document().unwrap();
        assert!(doc.has_committed_mutations());
        assert_eq!(doc.version(), SnapshotVersion::new(5, 0));
        assert_eq!(store.get_highest_unacknowledged_batch_id().await, BATCH_ID_UNKNOWN);
    }

    #[tokio::test]
    async fn reject_drops_batch_without_touching_cache() {
        let store = MemoryLocalStore::new(User::unauthenticated());
        store
            .restore_document(synced_doc("users/a", 1, &[("n", json!(1))]))
            .await;
        let write = store
            .write_locally(vec![Mutation::Set {
                key: key("users/a"),
                value: fields(&[("n", json!(9))]),
            }])
            .await
            .unwrap();

        let changes = store.reject_batch(write.batch_id).await.unwrap();
        let doc = changes[&key("users/a")].document().unwrap();
        assert_eq!(
            doc.data().get(&crate::model::FieldPath::from_dot_separated("n").unwrap()),
            Some(&json!(1))
        );
        assert!(!doc.has_pending_writes());
    }

    #[tokio::test]
    async fn outdated_watch_updates_are_ignored() {
        let store = MemoryLocalStore::new(User::unauthenticated());
        store
            .restore_document(synced_doc("users/a", 5, &[("n", json!(5))]))
            .await;

        let mut event = RemoteEvent::default();
        event.document_updates.insert(
            key("users/a"),
            synced_doc("users/a", 3, &[("n", json!(3))]),
        );
        let changes = store.apply_remote_event(event).await.unwrap();
        assert!(changes.is_empty());
    }

    #[tokio::test]
    async fn user_change_swaps_visible_queue() {
        let store = MemoryLocalStore::new(User::new("u1"));
        store
            .write_locally(vec![Mutation::Set {
                key: key("users/a"),
                value: fields(&[("n", json!(1))]),
            }])
            .await
            .unwrap();

        let changes = store.handle_user_change(User::new("u2")).await.unwrap();
        // u1's pending set no longer applies: the key surfaces as a tombstone.
        assert!(!changes[&key("users/a")].exists());
        assert_eq!(store.get_highest_unacknowledged_batch_id().await, BATCH_ID_UNKNOWN);

        let changes = store.handle_user_change(User::new("u1")).await.unwrap();
        assert!(changes[&key("users/a")].exists());
    }
}
