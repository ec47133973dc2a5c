use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;

use crate::auth::User;
use crate::core::query::Query;
use crate::core::view_snapshot::{DocumentViewChangeType, ViewSnapshot};
use crate::error::SyncResult;
use crate::model::{
    BatchId, Document, DocumentKey, ListenSequenceNumber, MaybeDocument, Mutation,
    MutationBatchResult, TargetId,
};
use crate::remote::remote_event::RemoteEvent;

/// Sequence number for targets outside the local store's LRU accounting
/// (limbo resolutions).
pub const INVALID_SEQUENCE_NUMBER: ListenSequenceNumber = -1;

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryPurpose {
    /// An ordinary user listen.
    Listen,
    /// Resolving whether a single server-confirmed document still exists.
    LimboResolution,
    /// Refetching a target whose existence filter mismatched.
    ExistenceFilterMismatch,
}

/// A query's registration with the target machinery.
#[derive(Clone, Debug)]
pub struct QueryData {
    pub query: Query,
    pub target_id: TargetId,
    pub sequence_number: ListenSequenceNumber,
    pub purpose: QueryPurpose,
}

impl QueryData {
    pub fn new(
        query: Query,
        target_id: TargetId,
        sequence_number: ListenSequenceNumber,
        purpose: QueryPurpose,
    ) -> Self {
        Self {
            query,
            target_id,
            sequence_number,
            purpose,
        }
    }
}

/// Result of applying a write batch locally: the assigned batch id plus the
/// latency-compensated view of every affected document.
#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: BTreeMap<DocumentKey, MaybeDocument>,
}

/// Per-target membership delta derived from a view snapshot, used by the
/// local store to pin and unpin cached documents.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub added: BTreeSet<DocumentKey>,
    pub removed: BTreeSet<DocumentKey>,
}

impl LocalViewChanges {
    pub fn from_view_snapshot(target_id: TargetId, snapshot: &ViewSnapshot) -> Self {
        let mut added = BTreeSet::new();
        let mut removed = BTreeSet::new();
        for change in snapshot.changes() {
            match change.change_type {
                DocumentViewChangeType::Added => {
                    added.insert(change.document.key().clone());
                }
                DocumentViewChangeType::Removed => {
                    removed.insert(change.document.key().clone());
                }
                _ => {}
            }
        }
        Self {
            target_id,
            added,
            removed,
        }
    }
}

/// Persistent cache of documents and the pending mutation queue.
///
/// Everything here is consumed by the sync engine; durability and index
/// maintenance live behind this contract.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Registers a query, assigning it a target id from the local store's
    /// (even) range. Re-allocating a live query returns its existing data.
    async fn allocate_query(&self, query: Query) -> SyncResult<QueryData>;

    async fn release_query(&self, query: &Query) -> SyncResult<()>;

    /// Runs the query against the latency-compensated local documents.
    async fn execute_query(&self, query: &Query) -> SyncResult<BTreeMap<DocumentKey, Document>>;

    /// Keys the server confirmed for the target at its resume point.
    async fn get_remote_document_keys(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// Appends a batch to the mutation queue and applies it to the local
    /// view.
    async fn write_locally(&self, mutations: Vec<Mutation>) -> SyncResult<LocalWriteResult>;

    /// Applies an aggregated remote event to the document cache, returning
    /// the changed documents (latency-compensated).
    async fn apply_remote_event(
        &self,
        event: RemoteEvent,
    ) -> SyncResult<BTreeMap<DocumentKey, MaybeDocument>>;

    async fn acknowledge_batch(
        &self,
        result: MutationBatchResult,
    ) -> SyncResult<BTreeMap<DocumentKey, MaybeDocument>>;

    async fn reject_batch(
        &self,
        batch_id: BatchId,
    ) -> SyncResult<BTreeMap<DocumentKey, MaybeDocument>>;

    /// View membership deltas, used to pin documents referenced by active
    /// views.
    async fn notify_local_view_changes(&self, changes: Vec<LocalViewChanges>) -> SyncResult<()>;

    /// Largest batch id still awaiting acknowledgment, or
    /// [`crate::model::BATCH_ID_UNKNOWN`] when the queue is empty.
    async fn get_highest_unacknowledged_batch_id(&self) -> BatchId;

    /// Swaps the visible mutation queue for `user`'s, returning every
    /// document whose latency-compensated view changed.
    async fn handle_user_change(
        &self,
        user: User,
    ) -> SyncResult<BTreeMap<DocumentKey, MaybeDocument>>;
}
