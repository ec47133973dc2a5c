pub mod event_manager;
pub mod query;
pub mod sync_engine;
pub mod target_id_generator;
pub mod transaction;
pub mod view;
pub mod view_snapshot;

pub use event_manager::{EventManager, QueryEventListener};
pub use query::{FieldFilter, FilterOperator, OrderBy, OrderDirection, Query};
pub use sync_engine::{SyncEngine, SyncEngineCallback};
pub use target_id_generator::TargetIdGenerator;
pub use transaction::Transaction;
pub use view::{DocumentChanges, LimboDocumentChange, LimboDocumentChangeType, View, ViewChange};
pub use view_snapshot::{
    DocumentViewChange, DocumentViewChangeSet, DocumentViewChangeType, OnlineState, SyncState,
    ViewSnapshot,
};
