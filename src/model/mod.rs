pub mod document;
pub mod document_key;
pub mod document_set;
pub mod fields;
pub mod mutation;
pub mod resource_path;
pub mod snapshot_version;

/// Identifier of a server-side subscription (watch target).
pub type TargetId = i32;

/// Identifier of a queued mutation batch.
pub type BatchId = i32;

/// Sequence number assigned to targets by the local store's LRU accounting.
pub type ListenSequenceNumber = i64;

pub use document::{Document, DocumentState, MaybeDocument, NoDocument};
pub use document_key::DocumentKey;
pub use document_set::{DocumentComparator, DocumentSet};
pub use fields::{value_compare, values_comparable, FieldPath, ObjectValue};
pub use mutation::{Mutation, MutationBatch, MutationBatchResult, BATCH_ID_UNKNOWN};
pub use resource_path::ResourcePath;
pub use snapshot_version::SnapshotVersion;
