use crate::model::fields::ObjectValue;
use crate::model::document_key::DocumentKey;
use crate::model::snapshot_version::SnapshotVersion;

/// Mutation state of a cached document, used to drive snapshot metadata and
/// acknowledgment handling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentState {
    /// Local mutations are applied on top of the remote base.
    LocalMutations,
    /// The batch producing this version was acknowledged but the watch stream
    /// has not caught up yet.
    CommittedMutations,
    /// The document matches what the backend last sent us.
    Synced,
}

/// An existing document with its fields.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    key: DocumentKey,
    version: SnapshotVersion,
    data: ObjectValue,
    state: DocumentState,
}

impl Document {
    pub fn new(
        key: DocumentKey,
        version: SnapshotVersion,
        data: ObjectValue,
        state: DocumentState,
    ) -> Self {
        Self {
            key,
            version,
            data,
            state,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn data(&self) -> &ObjectValue {
        &self.data
    }

    pub fn has_local_mutations(&self) -> bool {
        self.state == DocumentState::LocalMutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.state == DocumentState::CommittedMutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations() || self.has_committed_mutations()
    }
}

/// A tombstone: the backend (or a local delete) says this key has no document
/// at `version`.
#[derive(Clone, Debug, PartialEq)]
pub struct NoDocument {
    key: DocumentKey,
    version: SnapshotVersion,
    has_committed_mutations: bool,
}

impl NoDocument {
    pub fn new(key: DocumentKey, version: SnapshotVersion, has_committed_mutations: bool) -> Self {
        Self {
            key,
            version,
            has_committed_mutations,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.has_committed_mutations
    }
}

/// Either a document or a tombstone for its key.
#[derive(Clone, Debug, PartialEq)]
pub enum MaybeDocument {
    Document(Document),
    NoDocument(NoDocument),
}

impl MaybeDocument {
    pub fn key(&self) -> &DocumentKey {
        match self {
            MaybeDocument::Document(doc) => doc.key(),
            MaybeDocument::NoDocument(tombstone) => tombstone.key(),
        }
    }

    pub fn version(&self) -> SnapshotVersion {
        match self {
            MaybeDocument::Document(doc) => doc.version(),
            MaybeDocument::NoDocument(tombstone) => tombstone.version(),
        }
    }

    pub fn document(&self) -> Option<&Document> {
        match self {
            MaybeDocument::Document(doc) => Some(doc),
            MaybeDocument::NoDocument(_) => None,
        }
    }

    pub fn exists(&self) -> bool {
        matches!(self, MaybeDocument::Document(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn pending_writes_follow_document_state() {
        let doc = Document::new(
            key("users/a"),
            SnapshotVersion::new(1, 0),
            ObjectValue::empty(),
            DocumentState::LocalMutations,
        );
        assert!(doc.has_pending_writes());

        let synced = Document::new(
            key("users/a"),
            SnapshotVersion::new(1, 0),
            ObjectValue::empty(),
            DocumentState::Synced,
        );
        assert!(!synced.has_pending_writes());
    }

    #[test]
    fn maybe_document_exposes_key_and_existence() {
        let tombstone =
            MaybeDocument::NoDocument(NoDocument::new(key("users/a"), SnapshotVersion::NONE, false));
        assert_eq!(tombstone.key(), &key("users/a"));
        assert!(!tombstone.exists());
    }
}
