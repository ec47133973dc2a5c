use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::model::document::Document;
use crate::model::document_key::DocumentKey;

/// Ordering applied to a result set. Captured from the owning query so the
/// set can maintain order incrementally.
pub type DocumentComparator = Arc<dyn Fn(&Document, &Document) -> Ordering + Send + Sync>;

/// Result set ordered by the owning query's comparator (key-ascending
/// tie-break), with O(log n) membership by key.
#[derive(Clone)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    by_key: BTreeMap<DocumentKey, Document>,
    order: Vec<DocumentKey>,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            comparator,
            by_key: BTreeMap::new(),
            order: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&Document> {
        self.order.first().and_then(|key| self.by_key.get(key))
    }

    pub fn last(&self) -> Option<&Document> {
        self.order.last().and_then(|key| self.by_key.get(key))
    }

    /// Inserts `doc`, replacing any previous document with the same key.
    pub fn insert(&mut self, doc: Document) {
        self.remove(doc.key());
        let position = self
            .order
            .binary_search_by(|existing| {
                let existing = &self.by_key[existing];
                (self.comparator)(existing, &doc)
            })
            .unwrap_or_else(|insertion| insertion);
        self.order.insert(position, doc.key().clone());
        self.by_key.insert(doc.key().clone(), doc);
    }

    pub fn remove(&mut self, key: &DocumentKey) -> Option<Document> {
        let doc = self.by_key.remove(key)?;
        let position = self
            .order
            .iter()
            .position(|existing| existing == key)
            .expect("order and by_key stay in sync");
        self.order.remove(position);
        Some(doc)
    }

    /// Documents in query order.
    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.order.iter().map(|key| &self.by_key[key])
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.order.iter()
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.order == other.order
            && self
                .iter()
                .zip(other.iter())
                .all(|(left, right)| left == right)
    }
}

impl fmt::Debug for DocumentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.order.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::document::DocumentState;
    use crate::model::fields::ObjectValue;
    use crate::model::snapshot_version::SnapshotVersion;

    fn doc(path: &str) -> Document {
        Document::new(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(1, 0),
            ObjectValue::empty(),
            DocumentState::Synced,
        )
    }

    fn key_ordered() -> DocumentSet {
        DocumentSet::new(Arc::new(|a: &Document, b: &Document| a.key().cmp(b.key())))
    }

    #[test]
    fn keeps_documents_in_comparator_order() {
        let mut set = key_ordered();
        set.insert(doc("users/c"));
        set.insert(doc("users/a"));
        set.insert(doc("users/b"));

        let ids: Vec<_> = set.iter().map(|doc| doc.key().id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(set.first().unwrap().key().id(), "a");
        assert_eq!(set.last().unwrap().key().id(), "c");
    }

    #[test]
    fn insert_replaces_existing_key() {
        let mut set = key_ordered();
        set.insert(doc("users/a"));
        set.insert(doc("users/a"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn remove_keeps_order_consistent() {
        let mut set = key_ordered();
        set.insert(doc("users/a"));
        set.insert(doc("users/b"));
        set.remove(&DocumentKey::from_string("users/a").unwrap());
        assert_eq!(set.len(), 1);
        assert_eq!(set.first().unwrap().key().id(), "b");
    }
}
