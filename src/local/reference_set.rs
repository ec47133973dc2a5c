use std::collections::{BTreeMap, BTreeSet};

use crate::model::{DocumentKey, TargetId};

/// Many-to-many relation between document keys and the ids referencing them.
/// Indexed both ways so callers can ask "which keys does this id hold?" and
/// "does anything still reference this key?".
#[derive(Debug, Default)]
pub struct ReferenceSet {
    by_key: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    by_id: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: TargetId) {
        self.by_key.entry(key.clone()).or_default().insert(id);
        self.by_id.entry(id).or_default().insert(key);
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, id: TargetId) {
        if let Some(ids) = self.by_key.get_mut(key) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_key.remove(key);
            }
        }
        if let Some(keys) = self.by_id.get_mut(&id) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_id.remove(&id);
            }
        }
    }

    /// Removes every reference held by `id` and returns the keys it held.
    pub fn remove_references_for_id(&mut self, id: TargetId) -> BTreeSet<DocumentKey> {
        let keys = self.by_id.remove(&id).unwrap_or_default();
        for key in &keys {
            if let Some(ids) = self.by_key.get_mut(key) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_key.remove(key);
                }
            }
        }
        keys
    }

    pub fn references_for_id(&self, id: TargetId) -> BTreeSet<DocumentKey> {
        self.by_id.get(&id).cloned().unwrap_or_default()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }
}
