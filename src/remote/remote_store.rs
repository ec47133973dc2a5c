use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::core::transaction::Transaction;
use crate::core::view_snapshot::OnlineState;
use crate::error::{SyncError, SyncResult};
use crate::local::local_store::QueryData;
use crate::model::{BatchId, DocumentKey, MutationBatchResult, TargetId};
use crate::remote::remote_event::RemoteEvent;

/// Control surface of the remote subsystem: watch/write stream management
/// behind a narrow contract. Stream framing, resumption, and backoff live
/// behind this trait.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Starts (or queues, while offline) a server-side listen.
    async fn listen(&self, query_data: QueryData) -> SyncResult<()>;

    async fn stop_listening(&self, target_id: TargetId) -> SyncResult<()>;

    /// Polls the mutation queue and pushes pending batches onto the write
    /// stream.
    async fn fill_write_pipeline(&self) -> SyncResult<()>;

    /// A fresh transaction; transactions are single-use.
    fn create_transaction(&self) -> Transaction;

    fn can_use_network(&self) -> bool;

    /// Credentials changed: tear down and restart the streams so they pick up
    /// the new token.
    async fn handle_credential_change(&self) -> SyncResult<()>;
}

/// Callbacks the remote store delivers back into the sync engine. Installed
/// after construction; the implementation's lifetime covers the remote
/// store's.
#[async_trait]
pub trait RemoteStoreCallback: Send + Sync {
    /// A consistent watch snapshot was aggregated.
    async fn handle_remote_event(&self, event: RemoteEvent) -> SyncResult<()>;

    /// The backend rejected a listen.
    async fn handle_rejected_listen(&self, target_id: TargetId, error: SyncError)
        -> SyncResult<()>;

    /// A mutation batch was committed.
    async fn handle_successful_write(&self, result: MutationBatchResult) -> SyncResult<()>;

    /// A mutation batch was rejected with a permanent error.
    async fn handle_rejected_write(&self, batch_id: BatchId, error: SyncError) -> SyncResult<()>;

    async fn handle_online_state_change(&self, online_state: OnlineState) -> SyncResult<()>;

    /// Keys currently known to be in a target's result, consulted by the
    /// watch aggregator to manufacture deletes when a CURRENT marker implies
    /// them.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;
}
