//! Client-side synchronization core for EstuaryDB.
//!
//! The crate keeps a live, eventually-consistent local view of a remote
//! document collection. Its centerpiece is the [`core::SyncEngine`], which
//! reconciles three independent sources of truth — cached documents, locally
//! queued mutations, and authoritative remote updates — into per-query
//! materialized views with well-defined ordering, limbo-document resolution,
//! pending-write acknowledgment, and user-switch invalidation.
//!
//! Collaborators are expressed as contracts: the [`local::LocalStore`]
//! persists documents and the mutation queue (an in-memory implementation
//! ships in [`local::MemoryLocalStore`]), the [`remote::RemoteStore`] owns
//! the watch and write channels, and the [`core::EventManager`] fans view
//! snapshots out to application listeners.

pub mod auth;
pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod util;

#[doc(inline)]
pub use crate::core::{
    EventManager, OnlineState, Query, QueryEventListener, SyncEngine, SyncEngineCallback,
    SyncState, Transaction, ViewSnapshot,
};

#[doc(inline)]
pub use crate::error::{ErrorCode, SyncError, SyncResult};

#[doc(inline)]
pub use crate::model::{
    Document, DocumentKey, DocumentSet, MaybeDocument, Mutation, MutationBatch,
    MutationBatchResult, NoDocument, ObjectValue, ResourcePath, SnapshotVersion,
};

#[doc(inline)]
pub use crate::auth::User;
