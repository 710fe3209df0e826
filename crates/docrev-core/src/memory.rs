//! In-memory revision store.

use crate::error::{Error, Result};
use crate::rev_id::RevisionId;
use crate::store::{
    ContentOptions, EvictionListener, PurgeReport, PurgeRequest, PurgeSelector, RevisionDraft,
    RevisionRecord, RevisionStore,
};
use crate::tree::RevisionTree;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A [`RevisionStore`] holding one [`RevisionTree`] per document.
#[derive(Debug, Default)]
pub struct MemoryStore {
    trees: RwLock<HashMap<String, RevisionTree>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents with at least one revision.
    #[must_use]
    pub fn document_count(&self) -> usize {
        self.read().len()
    }

    /// Total number of revisions of a document.
    #[must_use]
    pub fn revision_count(&self, doc_id: &str) -> usize {
        self.read().get(doc_id).map_or(0, RevisionTree::len)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, RevisionTree>> {
        self.trees.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, RevisionTree>> {
        self.trees.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RevisionStore for MemoryStore {
    fn revision(
        &self,
        doc_id: &str,
        rev_id: Option<&RevisionId>,
        options: ContentOptions,
    ) -> Result<RevisionRecord> {
        let trees = self.read();
        let tree = trees
            .get(doc_id)
            .ok_or_else(|| Error::NotFound(format!("document {doc_id}")))?;
        let found = match rev_id {
            Some(rev_id) => tree.get(rev_id, options),
            None => tree.winner().map(|mut winner| {
                if options.no_body {
                    winner.body = None;
                }
                winner
            }),
        };
        found.ok_or_else(|| match rev_id {
            Some(rev_id) => Error::NotFound(format!("revision {rev_id} of {doc_id}")),
            None => Error::NotFound(format!("document {doc_id}")),
        })
    }

    fn leaf_revisions(&self, doc_id: &str) -> Result<Vec<RevisionRecord>> {
        Ok(self
            .read()
            .get(doc_id)
            .map(RevisionTree::leaves)
            .unwrap_or_default())
    }

    fn revision_history(
        &self,
        doc_id: &str,
        rev_id: &RevisionId,
    ) -> Result<Vec<RevisionRecord>> {
        self.read()
            .get(doc_id)
            .ok_or_else(|| Error::NotFound(format!("document {doc_id}")))?
            .history(rev_id)
    }

    fn put_revision(
        &self,
        draft: RevisionDraft,
        expected_parent: Option<&RevisionId>,
        allow_conflict: bool,
    ) -> Result<RevisionRecord> {
        let mut trees = self.write();
        let tree = trees
            .entry(draft.doc_id.clone())
            .or_insert_with(|| RevisionTree::new(draft.doc_id.clone()));
        let result = tree.put(&draft, expected_parent, allow_conflict);
        if tree.is_empty() {
            trees.remove(&draft.doc_id);
        }
        let record = result?;
        tracing::trace!(
            doc_id = %record.doc_id,
            rev_id = %record.rev_id,
            deleted = record.deleted,
            "Stored revision"
        );
        Ok(record)
    }

    fn purge_revisions(
        &self,
        request: &PurgeRequest,
        listener: &dyn EvictionListener,
    ) -> Result<PurgeReport> {
        let mut report = PurgeReport::default();
        let mut emptied = Vec::new();
        let mut pruned = Vec::new();
        {
            let mut trees = self.write();
            for (doc_id, selector) in request.iter() {
                let purged = match selector {
                    PurgeSelector::All => trees
                        .remove(doc_id)
                        .map(|tree| tree.revision_ids().cloned().collect())
                        .unwrap_or_default(),
                    PurgeSelector::Revisions(revs) => match trees.get_mut(doc_id) {
                        Some(tree) => tree.purge(revs),
                        None => Vec::new(),
                    },
                };
                let now_empty = trees.get(doc_id).map_or(true, RevisionTree::is_empty);
                if now_empty {
                    trees.remove(doc_id);
                    emptied.push(doc_id.clone());
                } else if !purged.is_empty() {
                    pruned.push(doc_id.clone());
                }
                report.purged.insert(doc_id.clone(), purged);
            }
        }

        // Listener runs without the tree lock held.
        for doc_id in &emptied {
            listener.document_purged(doc_id);
        }
        for doc_id in &pruned {
            listener.revisions_purged(doc_id);
        }
        Ok(report)
    }
}
