use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_lock::Mutex;

use crate::error::{aborted, failed_precondition, invalid_argument, SyncResult};
use crate::model::{
    DocumentKey, FieldPath, MaybeDocument, Mutation, ObjectValue, SnapshotVersion,
};
use crate::remote::datastore::{Datastore, Precondition, Write};

/// A single atomic read-then-write exchange with the backend.
///
/// Reads record the version of every document they see; writes carry those
/// versions as preconditions so the commit fails with ABORTED when anything
/// read has changed underneath. Transactions are single-use: after a commit
/// attempt (successful or not) a fresh one must be created.
pub struct Transaction {
    datastore: Arc<dyn Datastore>,
    state: Mutex<TransactionState>,
}

#[derive(Default)]
struct TransactionState {
    read_versions: BTreeMap<DocumentKey, SnapshotVersion>,
    writes: Vec<Write>,
    written_docs: BTreeSet<DocumentKey>,
    committed: bool,
}

impl Transaction {
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self {
            datastore,
            state: Mutex::new(TransactionState::default()),
        }
    }

    /// Reads the given documents, recording their versions for the commit
    /// precondition. All reads must happen before any write.
    pub async fn lookup(&self, keys: Vec<DocumentKey>) -> SyncResult<Vec<MaybeDocument>> {
        {
            let state = self.state.lock().await;
            ensure_commit_not_called(&state)?;
            if !state.writes.is_empty() {
                return Err(invalid_argument(
                    "Transactions require all reads to be executed before all writes",
                ));
            }
        }

        let docs = self.datastore.lookup(keys).await?;
        let mut state = self.state.lock().await;
        for doc in &docs {
            record_version(&mut state, doc.key().clone(), doc.version())?;
        }
        Ok(docs)
    }

    pub async fn set(&self, key: DocumentKey, value: ObjectValue) -> SyncResult<()> {
        let mut state = self.state.lock().await;
        ensure_commit_not_called(&state)?;
        let precondition = precondition_for(&state, &key);
        state.writes.push(Write::Mutate {
            mutation: Mutation::Set {
                key: key.clone(),
                value,
            },
            precondition,
        });
        state.written_docs.insert(key);
        Ok(())
    }

    pub async fn update(
        &self,
        key: DocumentKey,
        data: ObjectValue,
        mask: Vec<FieldPath>,
    ) -> SyncResult<()> {
        let mut state = self.state.lock().await;
        ensure_commit_not_called(&state)?;
        let precondition = precondition_for_update(&state, &key)?;
        state.writes.push(Write::Mutate {
            mutation: Mutation::Patch {
                key: key.clone(),
                data,
                mask,
            },
            precondition,
        });
        state.written_docs.insert(key);
        Ok(())
    }

    pub async fn delete(&self, key: DocumentKey) -> SyncResult<()> {
        let mut state = self.state.lock().await;
        ensure_commit_not_called(&state)?;
        let precondition = precondition_for(&state, &key);
        state.writes.push(Write::Mutate {
            mutation: Mutation::Delete { key: key.clone() },
            precondition,
        });
        state.written_docs.insert(key);
        Ok(())
    }

    /// Commits the queued writes. Documents read but not written become
    /// verify-only writes so the atomicity guarantee covers them too.
    pub async fn commit(&self) -> SyncResult<()> {
        let writes = {
            let mut state = self.state.lock().await;
            ensure_commit_not_called(&state)?;
            state.committed = true;

            let mut writes = std::mem::take(&mut state.writes);
            let unwritten: Vec<_> = state
                .read_versions
                .iter()
                .filter(|(key, _)| !state.written_docs.contains(*key))
                .map(|(key, version)| (key.clone(), *version))
                .collect();
            for (key, version) in unwritten {
                writes.push(Write::Verify { key, version });
            }
            writes
        };

        self.datastore.commit(writes).await
    }
}

fn ensure_commit_not_called(state: &TransactionState) -> SyncResult<()> {
    if state.committed {
        return Err(invalid_argument(
            "A transaction object cannot be used after its update callback has been invoked",
        ));
    }
    Ok(())
}

fn record_version(
    state: &mut TransactionState,
    key: DocumentKey,
    version: SnapshotVersion,
) -> SyncResult<()> {
    match state.read_versions.get(&key) {
        Some(existing) if *existing != version => Err(aborted(format!(
            "Document {key} changed between two reads in the same transaction"
        ))),
        _ => {
            state.read_versions.insert(key, version);
            Ok(())
        }
    }
}

fn precondition_for(state: &TransactionState, key: &DocumentKey) -> Precondition {
    match state.read_versions.get(key) {
        Some(version) if !state.written_docs.contains(key) => {
            if version.is_none() {
                Precondition::Exists(false)
            } else {
                Precondition::UpdateTime(*version)
            }
        }
        _ => Precondition::None,
    }
}

fn precondition_for_update(
    state: &TransactionState,
    key: &DocumentKey,
) -> SyncResult<Precondition> {
    match state.read_versions.get(key) {
        Some(version) if !state.written_docs.contains(key) => {
            if version.is_none() {
                // Updating a document the transaction observed as missing can
                // only fail.
                Err(failed_precondition(format!(
                    "Can't update a document that doesn't exist: {key}"
                )))
            } else {
                Ok(Precondition::UpdateTime(*version))
            }
        }
        _ => Ok(Precondition::Exists(true)),
    }
}
