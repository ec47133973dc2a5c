use std::collections::{BTreeMap, BTreeSet};

use crate::model::{DocumentKey, MaybeDocument, SnapshotVersion, TargetId};

/// Aggregated, consistent snapshot of watch-stream activity: everything the
/// backend told us up to a single snapshot version.
#[derive(Clone, Debug, Default)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose backing data mismatched an existence filter and must be
    /// re-listened from scratch.
    pub target_mismatches: BTreeSet<TargetId>,
    pub document_updates: BTreeMap<DocumentKey, MaybeDocument>,
    /// Keys whose limbo resolution completed inside this event; their
    /// document updates apply unconditionally.
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.target_mismatches.is_empty()
            && self.document_updates.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}

/// Per-target membership delta reported by the watch stream.
#[derive(Clone, Debug, Default)]
pub struct TargetChange {
    pub resume_token: Option<Vec<u8>>,
    /// Set once the backend has sent every document matching the target up to
    /// the resume point.
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    /// Marker-only change: the target became CURRENT with no membership delta.
    pub fn current_marker() -> Self {
        Self {
            current: true,
            ..Self::default()
        }
    }

    pub fn change_count(&self) -> usize {
        self.added_documents.len() + self.modified_documents.len() + self.removed_documents.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_event_reports_empty() {
        assert!(RemoteEvent::default().is_empty());
    }

    #[test]
    fn change_count_sums_all_membership_sets() {
        let mut change = TargetChange::current_marker();
        change
            .added_documents
            .insert(DocumentKey::from_string("users/a").unwrap());
        change
            .removed_documents
            .insert(DocumentKey::from_string("users/b").unwrap());
        assert_eq!(change.change_count(), 2);
        assert!(change.current);
    }
}
