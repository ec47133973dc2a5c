use std::collections::BTreeMap;

use crate::model::document::{Document, DocumentState, MaybeDocument, NoDocument};
use crate::model::document_key::DocumentKey;
use crate::model::fields::{FieldPath, ObjectValue};
use crate::model::snapshot_version::SnapshotVersion;
use crate::model::BatchId;

/// Sentinel batch id for "no pending batches".
pub const BATCH_ID_UNKNOWN: BatchId = -1;

/// A single user write. Field-level last-writer-wins: a later mutation for
/// the same key overrides earlier ones where their masks overlap.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    /// Replaces the whole document.
    Set { key: DocumentKey, value: ObjectValue },
    /// Overwrites the masked fields, leaving the rest of the document alone.
    /// Applies only when the document exists.
    Patch {
        key: DocumentKey,
        data: ObjectValue,
        mask: Vec<FieldPath>,
    },
    Delete { key: DocumentKey },
}

impl Mutation {
    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. } => key,
            Mutation::Patch { key, .. } => key,
            Mutation::Delete { key } => key,
        }
    }

    /// Applies this mutation to the latency-compensated local view of its
    /// document. Returns the base unchanged when the mutation does not apply
    /// (a patch against a missing document).
    pub fn apply_to_local_view(&self, base: Option<&MaybeDocument>) -> Option<MaybeDocument> {
        let base_version = base.map(|doc| doc.version()).unwrap_or(SnapshotVersion::NONE);
        match self {
            Mutation::Set { key, value } => Some(MaybeDocument::Document(Document::new(
                key.clone(),
                base_version,
                value.clone(),
                DocumentState::LocalMutations,
            ))),
            Mutation::Patch { key, data, mask } => {
                let existing = base.and_then(|doc| doc.document())?;
                let patched = patch_object(existing.data().clone(), data, mask);
                Some(MaybeDocument::Document(Document::new(
                    key.clone(),
                    existing.version(),
                    patched,
                    DocumentState::LocalMutations,
                )))
            }
            Mutation::Delete { key } => Some(MaybeDocument::NoDocument(NoDocument::new(
                key.clone(),
                SnapshotVersion::NONE,
                false,
            ))),
        }
    }

    /// Applies the acknowledged form of this mutation at `version`. Used when
    /// a batch commit lands before the watch stream catches up.
    pub fn apply_to_remote_document(
        &self,
        base: Option<&MaybeDocument>,
        version: SnapshotVersion,
    ) -> MaybeDocument {
        match self {
            Mutation::Set { key, value } => MaybeDocument::Document(Document::new(
                key.clone(),
                version,
                value.clone(),
                DocumentState::CommittedMutations,
            )),
            Mutation::Patch { key, data, mask } => match base.and_then(|doc| doc.document()) {
                Some(existing) => MaybeDocument::Document(Document::new(
                    key.clone(),
                    version,
                    patch_object(existing.data().clone(), data, mask),
                    DocumentState::CommittedMutations,
                )),
                // The backend accepted a patch we cannot reconstruct locally;
                // keep a tombstone until the watch stream delivers the result.
                None => MaybeDocument::NoDocument(NoDocument::new(key.clone(), version, true)),
            },
            Mutation::Delete { key } => {
                MaybeDocument::NoDocument(NoDocument::new(key.clone(), version, true))
            }
        }
    }
}

fn patch_object(mut base: ObjectValue, data: &ObjectValue, mask: &[FieldPath]) -> ObjectValue {
    for path in mask {
        if let Some(value) = data.get(path) {
            base.set(path, value.clone());
        }
    }
    base
}

/// Atomic group of mutations queued together. Batch ids increase
/// monotonically per client session.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: SnapshotVersion,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: SnapshotVersion,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            mutations,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn document_keys(&self) -> Vec<DocumentKey> {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }

    /// Applies every mutation in this batch touching `key` to `base`.
    pub fn apply_to_local_view(
        &self,
        key: &DocumentKey,
        base: Option<MaybeDocument>,
    ) -> Option<MaybeDocument> {
        let mut current = base;
        for mutation in &self.mutations {
            if mutation.key() == key {
                current = mutation.apply_to_local_view(current.as_ref()).or(current);
            }
        }
        current
    }
}

/// Successful acknowledgment of a single mutation batch.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn new(batch: MutationBatch, commit_version: SnapshotVersion) -> Self {
        let doc_versions = batch
            .mutations
            .iter()
            .map(|mutation| (mutation.key().clone(), commit_version))
            .collect();
        Self {
            batch,
            commit_version,
            doc_versions,
        }
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch.batch_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn fields(pairs: &[(&str, serde_json::Value)]) -> ObjectValue {
        let map: BTreeMap<String, serde_json::Value> = pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        ObjectValue::new(map)
    }

    #[test]
    fn set_produces_locally_mutated_document() {
        let mutation = Mutation::Set {
            key: key("users/a"),
            value: fields(&[("n", json!(1))]),
        };
        let result = mutation.apply_to_local_view(None).unwrap();
        let doc = result.document().unwrap();
        assert!(doc.has_local_mutations());
        assert_eq!(doc.version(), SnapshotVersion::NONE);
    }

    #[test]
    fn patch_skips_missing_document() {
        let mutation = Mutation::Patch {
            key: key("users/a"),
            data: fields(&[("n", json!(2))]),
            mask: vec![FieldPath::from_dot_separated("n").unwrap()],
        };
        assert!(mutation.apply_to_local_view(None).is_none());
    }

    #[test]
    fn patch_overwrites_only_masked_fields() {
        let base = MaybeDocument::Document(Document::new(
            key("users/a"),
            SnapshotVersion::new(1, 0),
            fields(&[("n", json!(1)), ("city", json!("Oslo"))]),
            DocumentState::Synced,
        ));
        let mutation = Mutation::Patch {
            key: key("users/a"),
            data: fields(&[("n", json!(2))]),
            mask: vec![FieldPath::from_dot_separated("n").unwrap()],
        };
        let result = mutation.apply_to_local_view(Some(&base)).unwrap();
        let doc = result.document().unwrap();
        assert_eq!(
            doc.data().get(&FieldPath::from_dot_separated("n").unwrap()),
            Some(&json!(2))
        );
        assert_eq!(
            doc.data()
                .get(&FieldPath::from_dot_separated("city").unwrap()),
            Some(&json!("Oslo"))
        );
    }

    #[test]
    fn batch_result_assigns_commit_version_per_key() {
        let batch = MutationBatch::new(
            3,
            SnapshotVersion::now(),
            vec![Mutation::Delete { key: key("users/a") }],
        );
        let result = MutationBatchResult::new(batch, SnapshotVersion::new(5, 0));
        assert_eq!(result.batch_id(), 3);
        assert_eq!(
            result.doc_versions.get(&key("users/a")),
            Some(&SnapshotVersion::new(5, 0))
        );
    }
}
