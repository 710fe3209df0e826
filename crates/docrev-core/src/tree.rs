//! In-memory model of one document's revision tree.
//!
//! Shared by the reference stores. Implements the store side of the
//! contract: winner selection, conflict detection on commit, content-derived
//! revision IDs, ancestry walks and purge pruning.

use crate::error::{Error, Result};
use crate::properties::Properties;
use crate::rev_id::RevisionId;
use crate::store::{ContentOptions, RevisionDraft, RevisionRecord};
use std::cmp::Reverse;
use std::collections::HashMap;

/// Length of the hex hash suffix of generated revision IDs.
const HASH_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq)]
struct Node {
    parent: Option<RevisionId>,
    deleted: bool,
    body: Properties,
    children: usize,
}

/// The revision forest of a single document.
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionTree {
    doc_id: String,
    nodes: HashMap<RevisionId, Node>,
}

impl RevisionTree {
    /// Create an empty tree.
    #[must_use]
    pub fn new(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            nodes: HashMap::new(),
        }
    }

    /// Rebuild a tree from stored records, in any order.
    ///
    /// Records without a body are stored with an empty one.
    #[must_use]
    pub fn from_records(
        doc_id: impl Into<String>,
        records: impl IntoIterator<Item = RevisionRecord>,
    ) -> Self {
        let mut tree = Self::new(doc_id);
        let records: Vec<_> = records.into_iter().collect();
        for record in &records {
            tree.nodes.insert(
                record.rev_id.clone(),
                Node {
                    parent: record.parent_id.clone(),
                    deleted: record.deleted,
                    body: record.body.clone().unwrap_or_default(),
                    children: 0,
                },
            );
        }
        for record in &records {
            if let Some(parent) = record.parent_id.as_ref() {
                if let Some(node) = tree.nodes.get_mut(parent) {
                    node.children += 1;
                }
            }
        }
        tree
    }

    /// Document this tree belongs to.
    #[must_use]
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Number of revisions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the tree has no revisions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check whether a revision exists.
    #[must_use]
    pub fn contains(&self, rev_id: &RevisionId) -> bool {
        self.nodes.contains_key(rev_id)
    }

    /// Check whether a revision exists and has no children.
    #[must_use]
    pub fn is_leaf(&self, rev_id: &RevisionId) -> bool {
        self.nodes.get(rev_id).is_some_and(|n| n.children == 0)
    }

    /// All revision IDs, unordered.
    pub fn revision_ids(&self) -> impl Iterator<Item = &RevisionId> {
        self.nodes.keys()
    }

    /// Look up one revision.
    #[must_use]
    pub fn get(&self, rev_id: &RevisionId, options: ContentOptions) -> Option<RevisionRecord> {
        self.nodes
            .get(rev_id)
            .map(|node| self.record(rev_id, node, options))
    }

    /// Leaves, winner first, then by descending revision ID.
    #[must_use]
    pub fn leaves(&self) -> Vec<RevisionRecord> {
        let mut leaves: Vec<_> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.children == 0)
            .collect();
        leaves.sort_by_key(|(rev_id, node)| Reverse((!node.deleted, (*rev_id).clone())));
        leaves
            .into_iter()
            .map(|(rev_id, node)| self.record(rev_id, node, ContentOptions::default()))
            .collect()
    }

    /// The winning leaf: live beats deleted, then the greater ID.
    #[must_use]
    pub fn winner(&self) -> Option<RevisionRecord> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.children == 0)
            .max_by(|(a_id, a), (b_id, b)| (!a.deleted, *a_id).cmp(&(!b.deleted, *b_id)))
            .map(|(rev_id, node)| self.record(rev_id, node, ContentOptions::default()))
    }

    /// Ancestor chain of a revision, newest first.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the revision is not in the tree.
    pub fn history(&self, rev_id: &RevisionId) -> Result<Vec<RevisionRecord>> {
        let mut chain = Vec::new();
        let mut cursor = Some(rev_id.clone());
        while let Some(id) = cursor {
            let node = self
                .nodes
                .get(&id)
                .ok_or_else(|| Error::NotFound(format!("revision {id} of {}", self.doc_id)))?;
            cursor = node.parent.clone();
            chain.push(self.record(&id, node, ContentOptions::default()));
        }
        Ok(chain)
    }

    /// Validate a commit and compute the record it would create.
    ///
    /// Does not modify the tree.
    ///
    /// # Errors
    ///
    /// See [`crate::store::RevisionStore::put_revision`].
    pub fn prepare(
        &self,
        draft: &RevisionDraft,
        expected_parent: Option<&RevisionId>,
        allow_conflict: bool,
    ) -> Result<RevisionRecord> {
        if draft.doc_id.is_empty() {
            return Err(Error::Forbidden("empty document ID".to_string()));
        }
        if draft.doc_id != self.doc_id {
            return Err(Error::Forbidden(format!(
                "revision for '{}' put into tree of '{}'",
                draft.doc_id, self.doc_id
            )));
        }

        let parent = match expected_parent {
            Some(parent) => {
                if !self.contains(parent) {
                    return Err(Error::NotFound(format!(
                        "revision {parent} of {}",
                        self.doc_id
                    )));
                }
                if !allow_conflict && !self.is_leaf(parent) {
                    return Err(Error::Conflict(format!(
                        "revision {parent} of {} is not a leaf",
                        self.doc_id
                    )));
                }
                Some(parent.clone())
            }
            None => match self.winner() {
                Some(winner) if !winner.deleted => {
                    if !allow_conflict {
                        return Err(Error::Conflict(format!(
                            "document {} already exists at {}",
                            self.doc_id, winner.rev_id
                        )));
                    }
                    None
                }
                // Writing without a parent over a tombstone resurrects the document.
                Some(winner) => Some(winner.rev_id),
                None => {
                    if draft.deleted {
                        return Err(Error::NotFound(format!(
                            "cannot delete missing document {}",
                            self.doc_id
                        )));
                    }
                    None
                }
            },
        };

        let hash = revision_hash(parent.as_ref(), draft.deleted, &draft.body)?;
        let rev_id = match parent.as_ref() {
            Some(parent) => parent.next(hash)?,
            None => RevisionId::root(hash)?,
        };

        Ok(RevisionRecord {
            doc_id: self.doc_id.clone(),
            rev_id,
            parent_id: parent,
            deleted: draft.deleted,
            body: Some(draft.body.clone()),
        })
    }

    /// Add a prepared record. Re-inserting an existing revision is a no-op.
    pub fn insert(&mut self, record: &RevisionRecord) {
        if self.nodes.contains_key(&record.rev_id) {
            return;
        }
        if let Some(parent) = record.parent_id.as_ref() {
            if let Some(node) = self.nodes.get_mut(parent) {
                node.children += 1;
            }
        }
        self.nodes.insert(
            record.rev_id.clone(),
            Node {
                parent: record.parent_id.clone(),
                deleted: record.deleted,
                body: record.body.clone().unwrap_or_default(),
                children: 0,
            },
        );
    }

    /// Validate and commit a draft.
    ///
    /// # Errors
    ///
    /// See [`Self::prepare`].
    pub fn put(
        &mut self,
        draft: &RevisionDraft,
        expected_parent: Option<&RevisionId>,
        allow_conflict: bool,
    ) -> Result<RevisionRecord> {
        let record = self.prepare(draft, expected_parent, allow_conflict)?;
        if let Some(existing) = self.get(&record.rev_id, ContentOptions::default()) {
            return Ok(existing);
        }
        self.insert(&record);
        Ok(record)
    }

    /// Erase the given leaves and every ancestor left without children.
    ///
    /// Non-leaf and unknown IDs are ignored. Returns the erased IDs.
    pub fn purge(&mut self, rev_ids: &[RevisionId]) -> Vec<RevisionId> {
        let mut purged = Vec::new();
        for rev_id in rev_ids {
            if !self.is_leaf(rev_id) {
                continue;
            }
            let mut cursor = Some(rev_id.clone());
            while let Some(id) = cursor.take() {
                let Some(node) = self.nodes.remove(&id) else {
                    break;
                };
                purged.push(id);
                if let Some(parent_id) = node.parent {
                    if let Some(parent) = self.nodes.get_mut(&parent_id) {
                        parent.children = parent.children.saturating_sub(1);
                        if parent.children == 0 {
                            cursor = Some(parent_id);
                        }
                    }
                }
            }
        }
        purged
    }

    fn record(&self, rev_id: &RevisionId, node: &Node, options: ContentOptions) -> RevisionRecord {
        RevisionRecord {
            doc_id: self.doc_id.clone(),
            rev_id: rev_id.clone(),
            parent_id: node.parent.clone(),
            deleted: node.deleted,
            body: (!options.no_body).then(|| node.body.clone()),
        }
    }
}

/// Content-derived hash for a new revision.
///
/// # Errors
///
/// Returns `Unknown` if the body cannot be serialized.
pub fn revision_hash(
    parent: Option<&RevisionId>,
    deleted: bool,
    body: &Properties,
) -> Result<String> {
    let mut hasher = blake3::Hasher::new();
    if let Some(parent) = parent {
        hasher.update(parent.to_string().as_bytes());
    }
    hasher.update(&[u8::from(deleted)]);
    hasher.update(&serde_json::to_vec(body)?);
    let hex = hasher.finalize().to_hex();
    Ok(hex.as_str()[..HASH_LEN].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn draft(doc_id: &str, body: Value, deleted: bool) -> RevisionDraft {
        let Value::Object(body) = body else {
            panic!("expected object")
        };
        RevisionDraft {
            doc_id: doc_id.to_string(),
            deleted,
            body,
        }
    }

    #[test]
    fn first_put_creates_generation_one() {
        let mut tree = RevisionTree::new("doc");
        let rec = tree.put(&draft("doc", json!({"a": 1}), false), None, false).unwrap();
        assert_eq!(rec.rev_id.generation(), 1);
        assert_eq!(rec.rev_id.hash().len(), HASH_LEN);
        assert!(tree.is_leaf(&rec.rev_id));
        assert_eq!(tree.winner().unwrap().rev_id, rec.rev_id);
    }

    #[test]
    fn stale_parent_conflicts() {
        let mut tree = RevisionTree::new("doc");
        let r1 = tree.put(&draft("doc", json!({"a": 1}), false), None, false).unwrap();
        let _r2 = tree
            .put(&draft("doc", json!({"a": 2}), false), Some(&r1.rev_id), false)
            .unwrap();
        let err = tree
            .put(&draft("doc", json!({"a": 3}), false), Some(&r1.rev_id), false)
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn put_without_parent_over_live_doc_conflicts() {
        let mut tree = RevisionTree::new("doc");
        tree.put(&draft("doc", json!({"a": 1}), false), None, false).unwrap();
        let err = tree
            .put(&draft("doc", json!({"a": 2}), false), None, false)
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn unknown_parent_is_not_found() {
        let mut tree = RevisionTree::new("doc");
        let missing: RevisionId = "1-missing".parse().unwrap();
        let err = tree
            .put(&draft("doc", json!({}), false), Some(&missing), false)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn deleting_missing_document_is_not_found() {
        let mut tree = RevisionTree::new("doc");
        let err = tree.put(&draft("doc", json!({}), true), None, false).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn allow_conflict_creates_branch() {
        let mut tree = RevisionTree::new("doc");
        let root = tree.put(&draft("doc", json!({"a": 1}), false), None, false).unwrap();
        let left = tree
            .put(&draft("doc", json!({"a": 2}), false), Some(&root.rev_id), false)
            .unwrap();
        let right = tree
            .put(&draft("doc", json!({"a": 3}), false), Some(&root.rev_id), true)
            .unwrap();

        let leaves = tree.leaves();
        assert_eq!(leaves.len(), 2);
        let expected_winner = left.rev_id.clone().max(right.rev_id.clone());
        assert_eq!(leaves[0].rev_id, expected_winner);
        assert_eq!(tree.winner().unwrap().rev_id, expected_winner);
    }

    #[test]
    fn live_leaf_beats_deleted_leaf() {
        let mut tree = RevisionTree::new("doc");
        let root = tree.put(&draft("doc", json!({"a": 1}), false), None, false).unwrap();
        let live = tree
            .put(&draft("doc", json!({"a": 2}), false), Some(&root.rev_id), false)
            .unwrap();
        let mut deleted = tree
            .put(&draft("doc", json!({}), true), Some(&root.rev_id), true)
            .unwrap();
        // Extend the deleted branch so it has the higher generation.
        deleted = tree
            .put(&draft("doc", json!({}), true), Some(&deleted.rev_id), true)
            .unwrap();
        assert!(deleted.rev_id > live.rev_id);

        assert_eq!(tree.winner().unwrap().rev_id, live.rev_id);
        assert_eq!(tree.leaves()[0].rev_id, live.rev_id);
    }

    #[test]
    fn put_over_tombstone_resurrects() {
        let mut tree = RevisionTree::new("doc");
        let r1 = tree.put(&draft("doc", json!({"a": 1}), false), None, false).unwrap();
        let tomb = tree
            .put(&draft("doc", json!({}), true), Some(&r1.rev_id), false)
            .unwrap();
        let back = tree.put(&draft("doc", json!({"a": 2}), false), None, false).unwrap();
        assert_eq!(back.parent_id, Some(tomb.rev_id));
        assert_eq!(back.rev_id.generation(), 3);
    }

    #[test]
    fn history_is_newest_first() {
        let mut tree = RevisionTree::new("doc");
        let r1 = tree.put(&draft("doc", json!({"v": 1}), false), None, false).unwrap();
        let r2 = tree
            .put(&draft("doc", json!({"v": 2}), false), Some(&r1.rev_id), false)
            .unwrap();
        let r3 = tree
            .put(&draft("doc", json!({"v": 3}), false), Some(&r2.rev_id), false)
            .unwrap();
        let ids: Vec<_> = tree
            .history(&r3.rev_id)
            .unwrap()
            .into_iter()
            .map(|r| r.rev_id)
            .collect();
        assert_eq!(ids, vec![r3.rev_id, r2.rev_id, r1.rev_id]);
    }

    #[test]
    fn purge_leaf_prunes_unshared_ancestors() {
        let mut tree = RevisionTree::new("doc");
        let root = tree.put(&draft("doc", json!({"a": 1}), false), None, false).unwrap();
        let left = tree
            .put(&draft("doc", json!({"a": 2}), false), Some(&root.rev_id), false)
            .unwrap();
        let right1 = tree
            .put(&draft("doc", json!({"a": 3}), false), Some(&root.rev_id), true)
            .unwrap();
        let right2 = tree
            .put(&draft("doc", json!({"a": 4}), false), Some(&right1.rev_id), false)
            .unwrap();

        let purged = tree.purge(&[right2.rev_id.clone()]);
        assert_eq!(purged, vec![right2.rev_id, right1.rev_id]);
        assert!(tree.contains(&root.rev_id));
        assert_eq!(tree.leaves().len(), 1);
        assert_eq!(tree.leaves()[0].rev_id, left.rev_id);

        let purged = tree.purge(&[left.rev_id.clone()]);
        assert_eq!(purged, vec![left.rev_id, root.rev_id]);
        assert!(tree.is_empty());
    }

    #[test]
    fn purge_ignores_interior_revisions() {
        let mut tree = RevisionTree::new("doc");
        let r1 = tree.put(&draft("doc", json!({"a": 1}), false), None, false).unwrap();
        tree.put(&draft("doc", json!({"a": 2}), false), Some(&r1.rev_id), false)
            .unwrap();
        assert!(tree.purge(&[r1.rev_id]).is_empty());
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn from_records_rebuilds_leaf_state() {
        let mut tree = RevisionTree::new("doc");
        let r1 = tree.put(&draft("doc", json!({"a": 1}), false), None, false).unwrap();
        let r2 = tree
            .put(&draft("doc", json!({"a": 2}), false), Some(&r1.rev_id), false)
            .unwrap();
        let records = tree.history(&r2.rev_id).unwrap();
        let rebuilt = RevisionTree::from_records("doc", records);
        assert_eq!(rebuilt, tree);
        assert!(!rebuilt.is_leaf(&r1.rev_id));
        assert!(rebuilt.is_leaf(&r2.rev_id));
    }

    #[test]
    fn identical_edits_share_an_id() {
        let body = draft("doc", json!({"a": 1}), false);
        let a = revision_hash(None, false, &body.body).unwrap();
        let b = revision_hash(None, false, &body.body).unwrap();
        let c = revision_hash(None, true, &body.body).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
