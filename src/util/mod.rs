pub mod completion;

pub use completion::{completion_pair, Completion, CompletionHandle};
