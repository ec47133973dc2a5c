use async_trait::async_trait;

use crate::error::{ErrorCode, SyncResult};
use crate::model::{DocumentKey, MaybeDocument, Mutation, SnapshotVersion};

/// Precondition attached to a transactional write.
#[derive(Clone, Debug, PartialEq)]
pub enum Precondition {
    None,
    /// The document must exist (or not) at commit time.
    Exists(bool),
    /// The document must still be at this version at commit time.
    UpdateTime(SnapshotVersion),
}

/// A mutation paired with its commit precondition, as sent to the backend.
#[derive(Clone, Debug, PartialEq)]
pub enum Write {
    Mutate {
        mutation: Mutation,
        precondition: Precondition,
    },
    /// No data change: assert the document is still at `version`.
    Verify {
        key: DocumentKey,
        version: SnapshotVersion,
    },
}

/// Non-streaming backend access used by transactions: versioned lookups and
/// atomic commits.
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn lookup(&self, keys: Vec<DocumentKey>) -> SyncResult<Vec<MaybeDocument>>;

    async fn commit(&self, writes: Vec<Write>) -> SyncResult<()>;
}

/// Whether an error code, once received, will repeat for the same request.
/// Permanent errors must not be retried.
pub fn is_permanent_error(code: ErrorCode) -> bool {
    match code {
        ErrorCode::Cancelled
        | ErrorCode::Unknown
        | ErrorCode::DeadlineExceeded
        | ErrorCode::ResourceExhausted
        | ErrorCode::Internal
        | ErrorCode::Unavailable
        // Receiving UNAUTHENTICATED most likely means an expired token, which
        // a retry picks up fresh.
        | ErrorCode::Unauthenticated => false,
        ErrorCode::InvalidArgument
        | ErrorCode::NotFound
        | ErrorCode::AlreadyExists
        | ErrorCode::PermissionDenied
        | ErrorCode::FailedPrecondition
        | ErrorCode::Aborted
        | ErrorCode::OutOfRange
        | ErrorCode::Unimplemented
        | ErrorCode::DataLoss => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_codes_are_not_permanent() {
        assert!(!is_permanent_error(ErrorCode::Unavailable));
        assert!(!is_permanent_error(ErrorCode::Unauthenticated));
        assert!(is_permanent_error(ErrorCode::PermissionDenied));
        assert!(is_permanent_error(ErrorCode::FailedPrecondition));
    }
}
