pub mod datastore;
pub mod remote_event;
pub mod remote_store;

pub use datastore::{is_permanent_error, Datastore, Precondition, Write};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::{RemoteStore, RemoteStoreCallback};
