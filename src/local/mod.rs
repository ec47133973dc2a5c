pub mod local_store;
pub mod memory;
pub mod reference_set;

pub use local_store::{
    LocalStore, LocalViewChanges, LocalWriteResult, QueryData, QueryPurpose,
    INVALID_SEQUENCE_NUMBER,
};
pub use memory::MemoryLocalStore;
pub use reference_set::ReferenceSet;
