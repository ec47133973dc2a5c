use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_lock::Mutex;
use async_trait::async_trait;

use crate::auth::User;
use crate::core::query::Query;
use crate::core::target_id_generator::TargetIdGenerator;
use crate::core::transaction::Transaction;
use crate::core::view::{LimboDocumentChange, LimboDocumentChangeType, View};
use crate::core::view_snapshot::{OnlineState, ViewSnapshot};
use crate::error::{cancelled, ErrorCode, SyncError, SyncResult};
use crate::local::local_store::{
    LocalStore, LocalViewChanges, QueryData, QueryPurpose, INVALID_SEQUENCE_NUMBER,
};
use crate::local::reference_set::ReferenceSet;
use crate::model::{
    BatchId, DocumentKey, MaybeDocument, MutationBatchResult, Mutation, NoDocument,
    SnapshotVersion, TargetId, BATCH_ID_UNKNOWN,
};
use crate::remote::datastore::is_permanent_error;
use crate::remote::remote_event::RemoteEvent;
use crate::remote::remote_store::{RemoteStore, RemoteStoreCallback};
use crate::util::completion::Completion;

/// Notifications the sync engine raises toward the event manager.
pub trait SyncEngineCallback: Send + Sync {
    /// New view snapshots, in the order of the signals that produced them.
    fn on_view_snapshots(&self, snapshots: Vec<ViewSnapshot>);

    /// A user listen failed permanently.
    fn on_error(&self, query: &Query, error: SyncError);

    fn handle_online_state_change(&self, online_state: OnlineState);
}

/// Binds a query to its target id and materialized view.
struct QueryView {
    target_id: TargetId,
    view: View,
}

/// Tracks a single limbo resolution listen.
struct LimboResolution {
    key: DocumentKey,
    /// Set once the resolution target delivered the document. Consulted by
    /// [`RemoteStoreCallback::get_remote_keys_for_target`] so the watch
    /// aggregator can manufacture a delete when a CURRENT marker arrives
    /// without one.
    received_document: bool,
}

/// Central coordinator of the client: glue between the event manager, the
/// local store, and the remote store.
///
/// The sync engine maintains a [`View`] for every active query, unifying the
/// locally cached documents and queued mutations with the authoritative
/// remote updates; it discovers and resolves limbo documents, tracks mutation
/// acknowledgments back to user completions, and drives the remote store's
/// listen set.
///
/// All methods are serialized through the engine's internal state lock,
/// mirroring the single worker queue the surrounding client dispatches on.
/// Violations of the documented preconditions are programmer errors and
/// panic.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<SyncEngineInner>,
}

struct SyncEngineInner {
    local_store: Arc<dyn LocalStore>,
    remote_store: Arc<dyn RemoteStore>,
    state: Mutex<SyncEngineState>,
    /// Installed in a second construction phase; the event manager needs the
    /// engine to exist first.
    callback: RwLock<Option<Arc<dyn SyncEngineCallback>>>,
}

struct SyncEngineState {
    query_views_by_query: HashMap<Query, QueryView>,
    queries_by_target: BTreeMap<TargetId, Query>,
    limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    limbo_document_refs: ReferenceSet,
    mutation_user_callbacks: HashMap<User, BTreeMap<BatchId, Completion>>,
    pending_writes_callbacks: BTreeMap<BatchId, Vec<Completion>>,
    target_id_generator: TargetIdGenerator,
    current_user: User,
}

impl SyncEngine {
    pub fn new(
        local_store: Arc<dyn LocalStore>,
        remote_store: Arc<dyn RemoteStore>,
        initial_user: User,
    ) -> Self {
        Self {
            inner: Arc::new(SyncEngineInner {
                local_store,
                remote_store,
                state: Mutex::new(SyncEngineState {
                    query_views_by_query: HashMap::new(),
                    queries_by_target: BTreeMap::new(),
                    limbo_targets_by_key: BTreeMap::new(),
                    limbo_resolutions_by_target: BTreeMap::new(),
                    limbo_document_refs: ReferenceSet::new(),
                    mutation_user_callbacks: HashMap::new(),
                    pending_writes_callbacks: BTreeMap::new(),
                    target_id_generator: TargetIdGenerator::for_sync_engine(),
                    current_user: initial_user,
                }),
                callback: RwLock::new(None),
            }),
        }
    }

    /// Second construction phase: installs the event-manager callback.
    pub fn set_callback(&self, callback: Arc<dyn SyncEngineCallback>) {
        *self.inner.callback.write().unwrap() = Some(callback);
    }

    /// Initiates a new listen. The local store is queried for initial data
    /// and the listen is forwarded to the remote store. The registered
    /// callback receives the resulting view snapshots and listen errors.
    ///
    /// Panics when the query is already being listened to.
    pub async fn listen(&self, query: Query) -> SyncResult<TargetId> {
        let callback = self.inner.assert_callback("listen");
        let mut state = self.inner.state.lock().await;
        assert!(
            !state.query_views_by_query.contains_key(&query),
            "We already listen to query: {}",
            query.canonical_id()
        );

        let query_data = self.inner.local_store.allocate_query(query).await?;
        let target_id = query_data.target_id;
        let snapshot = self
            .inner
            .initialize_view_and_compute_snapshot(&mut state, &query_data)
            .await?;
        callback.on_view_snapshots(vec![snapshot]);

        self.inner.remote_store.listen(query_data).await?;
        Ok(target_id)
    }

    /// Stops listening to a query previously started with [`SyncEngine::listen`].
    pub async fn stop_listening(&self, query: &Query) -> SyncResult<()> {
        self.inner.assert_callback("stop_listening");
        let mut state = self.inner.state.lock().await;

        let query_view = state
            .query_views_by_query
            .get(query)
            .unwrap_or_else(|| panic!("Trying to stop listening to a query not found"));
        let target_id = query_view.target_id;

        self.inner.local_store.release_query(query).await?;
        self.inner.remote_store.stop_listening(target_id).await?;
        self.inner
            .remove_and_cleanup_query(&mut state, query.clone(), target_id)
            .await
    }

    /// Applies a mutation batch locally, registers the user completion for
    /// its acknowledgment, raises the resulting snapshots, and pokes the
    /// write pipeline.
    pub async fn write_mutations(
        &self,
        mutations: Vec<Mutation>,
        user_completion: Completion,
    ) -> SyncResult<()> {
        self.inner.assert_callback("write_mutations");
        {
            let mut state = self.inner.state.lock().await;
            let result = self.inner.local_store.write_locally(mutations).await?;
            let user = state.current_user.clone();
            state
                .mutation_user_callbacks
                .entry(user)
                .or_default()
                .insert(result.batch_id, user_completion);
            self.inner
                .emit_new_snaps_and_notify_local_store(&mut state, result.changes, None)
                .await?;
        }
        self.inner.remote_store.fill_write_pipeline().await
    }

    /// Registers a completion that resolves once every currently pending
    /// write has been acknowledged or rejected by the backend.
    pub async fn register_pending_writes_task(&self, completion: Completion) -> SyncResult<()> {
        if !self.inner.remote_store.can_use_network() {
            log::debug!(
                "The network is disabled. The task returned by 'await_pending_writes' will not \
                 complete until the network is enabled."
            );
        }

        let mut state = self.inner.state.lock().await;
        let largest_pending_batch_id = self
            .inner
            .local_store
            .get_highest_unacknowledged_batch_id()
            .await;
        if largest_pending_batch_id == BATCH_ID_UNKNOWN {
            completion.resolve();
            return Ok(());
        }

        state
            .pending_writes_callbacks
            .entry(largest_pending_batch_id)
            .or_default()
            .push(completion);
        Ok(())
    }

    /// Runs `update_fn` against a fresh transaction, committing its writes
    /// atomically. Retryable failures (of the function or the commit) restart
    /// the whole exchange with a new transaction, at most `retries` times.
    pub async fn transaction<F, Fut, T>(&self, update_fn: F, retries: u32) -> SyncResult<T>
    where
        F: Fn(Arc<Transaction>) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut remaining = retries;
        loop {
            let transaction = Arc::new(self.inner.remote_store.create_transaction());
            let attempt = update_fn(Arc::clone(&transaction)).await;

            let error = match attempt {
                Ok(value) => match transaction.commit().await {
                    Ok(()) => return Ok(value),
                    Err(error) => error,
                },
                Err(error) => error,
            };

            if remaining > 0 && is_retryable_transaction_error(&error) {
                remaining -= 1;
                continue;
            }
            return Err(error);
        }
    }

    /// Applies an online-state change to every view and forwards it to the
    /// event manager.
    pub async fn handle_online_state_change(&self, online_state: OnlineState) -> SyncResult<()> {
        let callback = self.inner.assert_callback("handle_online_state_change");
        let mut state = self.inner.state.lock().await;

        let mut new_snapshots = Vec::new();
        for query_view in state.query_views_by_query.values_mut() {
            let view_change = query_view.view.apply_online_state_change(online_state);
            assert!(
                view_change.limbo_changes.is_empty(),
                "OnlineState should not affect limbo documents."
            );
            if let Some(snapshot) = view_change.snapshot {
                new_snapshots.push(snapshot);
            }
        }

        callback.on_view_snapshots(new_snapshots);
        callback.handle_online_state_change(online_state);
        Ok(())
    }

    /// Switches the engine to a new user: cancels the previous user's
    /// pending-writes waiters, swaps the local mutation queue, and restarts
    /// the remote streams.
    pub async fn handle_credential_change(&self, user: User) -> SyncResult<()> {
        {
            let mut state = self.inner.state.lock().await;
            let user_changed = state.current_user != user;
            state.current_user = user.clone();

            if user_changed {
                let callbacks = std::mem::take(&mut state.pending_writes_callbacks);
                for completion in callbacks.into_values().flatten() {
                    completion.reject(cancelled(
                        "'await_pending_writes' is cancelled due to a user change.",
                    ));
                }

                let changes = self.inner.local_store.handle_user_change(user).await?;
                self.inner
                    .emit_new_snaps_and_notify_local_store(&mut state, changes, None)
                    .await?;
            }
        }

        self.inner.remote_store.handle_credential_change().await
    }

    /// Test-only inspector: a defensive copy of the limbo key → target
    /// mapping.
    pub async fn current_limbo_documents(&self) -> BTreeMap<DocumentKey, TargetId> {
        let state = self.inner.state.lock().await;
        state.limbo_targets_by_key.clone()
    }

    /// Test-only inspector: the target id serving `query`, if listened to.
    pub async fn target_id_for_query(&self, query: &Query) -> Option<TargetId> {
        let state = self.inner.state.lock().await;
        state
            .query_views_by_query
            .get(query)
            .map(|query_view| query_view.target_id)
    }
}

#[async_trait]
impl RemoteStoreCallback for SyncEngine {
    async fn handle_remote_event(&self, event: RemoteEvent) -> SyncResult<()> {
        self.inner.assert_callback("handle_remote_event");
        let mut state = self.inner.state.lock().await;
        self.inner.apply_remote_event(&mut state, event).await
    }

    async fn handle_rejected_listen(
        &self,
        target_id: TargetId,
        error: SyncError,
    ) -> SyncResult<()> {
        let callback = self.inner.assert_callback("handle_rejected_listen");
        let mut state = self.inner.state.lock().await;

        if let Some(limbo_resolution) = state.limbo_resolutions_by_target.remove(&target_id) {
            // The listen already failed; there is nothing to unlisten from.
            // Purge the document through the normal remote-event path with a
            // synthetic delete so every local-store invariant holds.
            let key = limbo_resolution.key;
            state.limbo_targets_by_key.remove(&key);

            let mut event = RemoteEvent::default();
            event.document_updates.insert(
                key.clone(),
                MaybeDocument::NoDocument(NoDocument::new(
                    key.clone(),
                    SnapshotVersion::NONE,
                    false,
                )),
            );
            event.resolved_limbo_documents.insert(key);
            return self.inner.apply_remote_event(&mut state, event).await;
        }

        let query = state
            .queries_by_target
            .get(&target_id)
            .cloned()
            .unwrap_or_else(|| panic!("Unknown target: {target_id}"));
        self.inner.local_store.release_query(&query).await?;
        self.inner
            .remove_and_cleanup_query(&mut state, query.clone(), target_id)
            .await?;
        log_error_if_interesting(
            &error,
            &format!("Listen for {} failed", query.canonical_id()),
        );
        callback.on_error(&query, error);
        Ok(())
    }

    async fn handle_successful_write(&self, result: MutationBatchResult) -> SyncResult<()> {
        self.inner.assert_callback("handle_successful_write");
        let mut state = self.inner.state.lock().await;
        let batch_id = result.batch_id();

        // The local store may or may not be able to raise events immediately,
        // so resolve user callbacks first: they consistently precede the
        // listen events derived from the same acknowledgment.
        notify_user(&mut state, batch_id, None);
        resolve_pending_writes_callbacks(&mut state, batch_id);

        let changes = self.inner.local_store.acknowledge_batch(result).await?;
        self.inner
            .emit_new_snaps_and_notify_local_store(&mut state, changes, None)
            .await
    }

    async fn handle_rejected_write(&self, batch_id: BatchId, error: SyncError) -> SyncResult<()> {
        self.inner.assert_callback("handle_rejected_write");
        let mut state = self.inner.state.lock().await;

        let changes = self.inner.local_store.reject_batch(batch_id).await?;
        if let Some(first_key) = changes.keys().next() {
            log_error_if_interesting(&error, &format!("Write failed at {first_key}"));
        }

        notify_user(&mut state, batch_id, Some(error));
        resolve_pending_writes_callbacks(&mut state, batch_id);

        self.inner
            .emit_new_snaps_and_notify_local_store(&mut state, changes, None)
            .await
    }

    async fn handle_online_state_change(&self, online_state: OnlineState) -> SyncResult<()> {
        SyncEngine::handle_online_state_change(self, online_state).await
    }

    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        let state = self.inner.state.lock_blocking();
        if let Some(limbo_resolution) = state.limbo_resolutions_by_target.get(&target_id) {
            if limbo_resolution.received_document {
                let mut keys = BTreeSet::new();
                keys.insert(limbo_resolution.key.clone());
                return keys;
            }
            return BTreeSet::new();
        }
        state
            .queries_by_target
            .get(&target_id)
            .and_then(|query| state.query_views_by_query.get(query))
            .map(|query_view| query_view.view.synced_documents().clone())
            .unwrap_or_default()
    }
}

impl SyncEngineInner {
    fn assert_callback(&self, method: &str) -> Arc<dyn SyncEngineCallback> {
        self.callback
            .read()
            .unwrap()
            .clone()
            .unwrap_or_else(|| panic!("Trying to call {method} before setting callback"))
    }

    async fn initialize_view_and_compute_snapshot(
        &self,
        state: &mut SyncEngineState,
        query_data: &QueryData,
    ) -> SyncResult<ViewSnapshot> {
        let query = query_data.query.clone();

        let docs = self.local_store.execute_query(&query).await?;
        let remote_keys = self
            .local_store
            .get_remote_document_keys(query_data.target_id)
            .await;

        let changes: BTreeMap<DocumentKey, MaybeDocument> = docs
            .into_iter()
            .map(|(key, doc)| (key, MaybeDocument::Document(doc)))
            .collect();

        let mut view = View::new(query.clone(), remote_keys);
        let view_doc_changes = view.compute_doc_changes(&changes, None);
        let view_change = view.apply_changes(view_doc_changes, None, &BTreeSet::new());
        assert!(
            view.limbo_documents().is_empty(),
            "View returned limbo docs before target ack from the server"
        );

        let snapshot = view_change
            .snapshot
            .expect("initial view computation always produces a snapshot");

        state.query_views_by_query.insert(
            query.clone(),
            QueryView {
                target_id: query_data.target_id,
                view,
            },
        );
        state.queries_by_target.insert(query_data.target_id, query);
        Ok(snapshot)
    }

    /// Common path for real and synthesized remote events.
    async fn apply_remote_event(
        &self,
        state: &mut SyncEngineState,
        event: RemoteEvent,
    ) -> SyncResult<()> {
        // Update `received_document` for any limbo targets in the event.
        for (target_id, target_change) in &event.target_changes {
            if let Some(limbo_resolution) =
                state.limbo_resolutions_by_target.get_mut(target_id)
            {
                // Limbo resolutions cover a single document; it can be added,
                // modified, or removed, but not a combination.
                assert!(
                    target_change.change_count() <= 1,
                    "Limbo resolution for single document contains multiple changes."
                );
                if !target_change.added_documents.is_empty() {
                    limbo_resolution.received_document = true;
                } else if !target_change.modified_documents.is_empty() {
                    assert!(
                        limbo_resolution.received_document,
                        "Received change for limbo target document without add."
                    );
                } else if !target_change.removed_documents.is_empty() {
                    assert!(
                        limbo_resolution.received_document,
                        "Received remove for limbo target document without add."
                    );
                    limbo_resolution.received_document = false;
                }
            }
        }

        let changes = self.local_store.apply_remote_event(event.clone()).await?;
        self.emit_new_snaps_and_notify_local_store(state, changes, Some(&event))
            .await
    }

    /// Recomputes every view against `changes`, raises the new snapshots in
    /// one batch, and reports the per-view membership deltas back to the
    /// local store.
    async fn emit_new_snaps_and_notify_local_store(
        &self,
        state: &mut SyncEngineState,
        changes: BTreeMap<DocumentKey, MaybeDocument>,
        remote_event: Option<&RemoteEvent>,
    ) -> SyncResult<()> {
        let callback = self.assert_callback("emit_new_snaps_and_notify_local_store");

        let empty_resolved = BTreeSet::new();
        let resolved_limbo_documents = remote_event
            .map(|event| &event.resolved_limbo_documents)
            .unwrap_or(&empty_resolved);

        let mut new_snapshots = Vec::new();
        let mut document_changes_in_all_views = Vec::new();
        let mut limbo_updates = Vec::new();

        let queries: Vec<Query> = state.query_views_by_query.keys().cloned().collect();
        for query in queries {
            let query_view = state
                .query_views_by_query
                .get_mut(&query)
                .expect("query list derived from the registry");
            let target_id = query_view.target_id;

            let mut view_doc_changes = query_view.view.compute_doc_changes(&changes, None);
            if view_doc_changes.needs_refill() {
                // The query has a limit and the delta removed a document
                // inside the limit window; re-run it against the local store
                // so documents past the old boundary are not lost.
                let docs = self.local_store.execute_query(&query).await?;
                let full_changes: BTreeMap<DocumentKey, MaybeDocument> = docs
                    .into_iter()
                    .map(|(key, doc)| (key, MaybeDocument::Document(doc)))
                    .collect();
                view_doc_changes = query_view
                    .view
                    .compute_doc_changes(&full_changes, Some(view_doc_changes));
            }

            let target_change =
                remote_event.and_then(|event| event.target_changes.get(&target_id));
            let view_change = query_view.view.apply_changes(
                view_doc_changes,
                target_change,
                resolved_limbo_documents,
            );
            limbo_updates.push((view_change.limbo_changes, target_id));

            if let Some(snapshot) = view_change.snapshot {
                document_changes_in_all_views
                    .push(LocalViewChanges::from_view_snapshot(target_id, &snapshot));
                new_snapshots.push(snapshot);
            }
        }

        for (limbo_changes, target_id) in limbo_updates {
            self.update_tracked_limbo_documents(state, limbo_changes, target_id)
                .await?;
        }

        callback.on_view_snapshots(new_snapshots);
        self.local_store
            .notify_local_view_changes(document_changes_in_all_views)
            .await
    }

    async fn update_tracked_limbo_documents(
        &self,
        state: &mut SyncEngineState,
        limbo_changes: Vec<LimboDocumentChange>,
        target_id: TargetId,
    ) -> SyncResult<()> {
        for limbo_change in limbo_changes {
            match limbo_change.change_type {
                LimboDocumentChangeType::Added => {
                    state
                        .limbo_document_refs
                        .add_reference(limbo_change.key.clone(), target_id);
                    self.track_limbo_change(state, limbo_change.key).await?;
                }
                LimboDocumentChangeType::Removed => {
                    log::debug!("Document no longer in limbo: {}", limbo_change.key);
                    state
                        .limbo_document_refs
                        .remove_reference(&limbo_change.key, target_id);
                    if !state.limbo_document_refs.contains_key(&limbo_change.key) {
                        self.remove_limbo_target(state, &limbo_change.key).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn track_limbo_change(
        &self,
        state: &mut SyncEngineState,
        key: DocumentKey,
    ) -> SyncResult<()> {
        if state.limbo_targets_by_key.contains_key(&key) {
            return Ok(());
        }

        log::debug!("New document in limbo: {key}");
        let limbo_target_id = state.target_id_generator.next_id();
        let query = Query::at_path(key.path().clone());
        let query_data = QueryData::new(
            query,
            limbo_target_id,
            INVALID_SEQUENCE_NUMBER,
            QueryPurpose::LimboResolution,
        );
        state.limbo_resolutions_by_target.insert(
            limbo_target_id,
            LimboResolution {
                key: key.clone(),
                received_document: false,
            },
        );
        self.remote_store.listen(query_data).await?;
        state.limbo_targets_by_key.insert(key, limbo_target_id);
        Ok(())
    }

    /// Idempotent: the target may already be gone because its listen was
    /// rejected.
    async fn remove_limbo_target(
        &self,
        state: &mut SyncEngineState,
        key: &DocumentKey,
    ) -> SyncResult<()> {
        let target_id = match state.limbo_targets_by_key.get(key) {
            Some(target_id) => *target_id,
            None => return Ok(()),
        };
        self.remote_store.stop_listening(target_id).await?;
        state.limbo_targets_by_key.remove(key);
        state.limbo_resolutions_by_target.remove(&target_id);
        Ok(())
    }

    async fn remove_and_cleanup_query(
        &self,
        state: &mut SyncEngineState,
        query: Query,
        target_id: TargetId,
    ) -> SyncResult<()> {
        state.query_views_by_query.remove(&query);
        state.queries_by_target.remove(&target_id);

        let limbo_keys = state.limbo_document_refs.remove_references_for_id(target_id);
        for key in limbo_keys {
            if !state.limbo_document_refs.contains_key(&key) {
                self.remove_limbo_target(state, &key).await?;
            }
        }
        Ok(())
    }
}

/// Resolves the per-batch user completion, if one was registered by the
/// current user. Batches restored from persistence have no completion.
fn notify_user(state: &mut SyncEngineState, batch_id: BatchId, status: Option<SyncError>) {
    let completion = state
        .mutation_user_callbacks
        .get_mut(&state.current_user)
        .and_then(|callbacks| callbacks.remove(&batch_id));
    if let Some(completion) = completion {
        match status {
            Some(error) => completion.reject(error),
            None => completion.resolve(),
        }
    }
}

fn resolve_pending_writes_callbacks(state: &mut SyncEngineState, batch_id: BatchId) {
    if let Some(completions) = state.pending_writes_callbacks.remove(&batch_id) {
        for completion in completions {
            completion.resolve();
        }
    }
}

/// Developer-mistake errors (missing index, permission denied) log at warn;
/// everything else stays at debug.
fn log_error_if_interesting(error: &SyncError, context: &str) {
    if error_is_interesting(error) {
        log::warn!("{context}: {error}");
    } else {
        log::debug!("{context}: {error}");
    }
}

fn error_is_interesting(error: &SyncError) -> bool {
    match error.code {
        ErrorCode::FailedPrecondition => error.message().contains("requires an index"),
        ErrorCode::PermissionDenied => true,
        _ => false,
    }
}

/// Outdated reads fail with FAILED_PRECONDITION and version races with
/// ABORTED; both retry, as does anything the datastore layer does not
/// classify as permanent.
fn is_retryable_transaction_error(error: &SyncError) -> bool {
    error.code == ErrorCode::Aborted
        || error.code == ErrorCode::FailedPrecondition
        || !is_permanent_error(error.code)
}
