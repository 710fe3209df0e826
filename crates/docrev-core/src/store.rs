//! Collaborator interfaces consumed by documents.
//!
//! The revision tree itself (persistence, winner selection, revision ID
//! generation) and the attachment body store live behind these traits.

use crate::error::{Error, Result};
use crate::properties::Properties;
use crate::rev_id::RevisionId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A revision as the store sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionRecord {
    /// Owning document
    pub doc_id: String,
    /// This revision's ID
    pub rev_id: RevisionId,
    /// Parent revision, `None` for a tree root
    pub parent_id: Option<RevisionId>,
    /// Tombstone marker
    pub deleted: bool,
    /// Stored body, `None` when loaded without content
    pub body: Option<Properties>,
}

/// An uncommitted revision handed to [`RevisionStore::put_revision`].
///
/// The store assigns the revision ID.
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionDraft {
    /// Owning document
    pub doc_id: String,
    /// Tombstone marker
    pub deleted: bool,
    /// Body with derived metadata (`_id`, `_rev`, `_deleted`) stripped
    pub body: Properties,
}

/// Content options for revision lookups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentOptions {
    /// Skip loading the body
    pub no_body: bool,
}

impl ContentOptions {
    /// Load metadata only.
    pub const METADATA_ONLY: Self = Self { no_body: true };
}

/// Which revisions of a document to purge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgeSelector {
    /// Every revision (`"*"`)
    All,
    /// Specific leaf revisions; ancestors left without descendants go too
    Revisions(Vec<RevisionId>),
}

impl PurgeSelector {
    /// Parse the wire form: `["*"]` or a list of revision IDs.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` if an entry is not a valid revision ID.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        if entries.iter().any(|e| e.as_ref() == "*") {
            return Ok(Self::All);
        }
        let revs = entries
            .iter()
            .map(|e| e.as_ref().parse::<RevisionId>().map_err(Error::from))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::Revisions(revs))
    }
}

/// A purge request: document ID to selector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeRequest {
    docs: BTreeMap<String, PurgeSelector>,
}

impl PurgeRequest {
    /// Create an empty request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request purging every revision of one document.
    #[must_use]
    pub fn all(doc_id: impl Into<String>) -> Self {
        let mut request = Self::new();
        request.insert(doc_id, PurgeSelector::All);
        request
    }

    /// Add or replace a document's selector.
    pub fn insert(&mut self, doc_id: impl Into<String>, selector: PurgeSelector) {
        self.docs.insert(doc_id.into(), selector);
    }

    /// Iterate over the requested documents.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &PurgeSelector)> {
        self.docs.iter()
    }

    /// Check if the request is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

/// Revisions actually erased by a purge, per document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Erased revision IDs by document
    pub purged: BTreeMap<String, Vec<RevisionId>>,
}

/// Notified by a store about documents a purge changed.
///
/// Called without any store lock held.
pub trait EvictionListener {
    /// The document's whole tree was erased.
    fn document_purged(&self, doc_id: &str);

    /// Some revisions were erased but the document still has others. The
    /// winning leaf may have changed.
    fn revisions_purged(&self, doc_id: &str);
}

/// The persisted revision tree.
pub trait RevisionStore: Send + Sync {
    /// Look up a revision. `rev_id = None` asks for the winning leaf.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the document or revision does not exist.
    fn revision(
        &self,
        doc_id: &str,
        rev_id: Option<&RevisionId>,
        options: ContentOptions,
    ) -> Result<RevisionRecord>;

    /// All leaves of a document, deleted ones included.
    ///
    /// Ordered winner first, then by descending revision ID. Empty if the
    /// document has no revisions.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read.
    fn leaf_revisions(&self, doc_id: &str) -> Result<Vec<RevisionRecord>>;

    /// Ancestor chain of a revision, the revision itself first.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the revision does not exist.
    fn revision_history(&self, doc_id: &str, rev_id: &RevisionId)
        -> Result<Vec<RevisionRecord>>;

    /// Commit a new revision as a child of `expected_parent`.
    ///
    /// # Errors
    ///
    /// - `Conflict` if `expected_parent` is not a leaf (unless
    ///   `allow_conflict`), or if no parent is given while the document
    ///   has a live winning revision
    /// - `NotFound` if `expected_parent` does not exist
    /// - `Forbidden` for a malformed document ID
    fn put_revision(
        &self,
        draft: RevisionDraft,
        expected_parent: Option<&RevisionId>,
        allow_conflict: bool,
    ) -> Result<RevisionRecord>;

    /// Erase revisions locally. Nothing is written to the tree and nothing
    /// replicates. `listener` hears [`EvictionListener::document_purged`]
    /// for every document left empty and
    /// [`EvictionListener::revisions_purged`] for every other document that
    /// lost revisions.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be written.
    fn purge_revisions(
        &self,
        request: &PurgeRequest,
        listener: &dyn EvictionListener,
    ) -> Result<PurgeReport>;
}

/// Storage for attachment bodies.
pub trait AttachmentStore: Send + Sync {
    /// Persist inline attachment bodies and return the map in stub form.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` for malformed entries.
    fn install_attachment_bodies(&self, attachments: &Properties) -> Result<Properties>;

    /// Load a stored body by digest.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no body has that digest.
    fn attachment_body(&self, digest: &str) -> Result<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purge_selector_star_means_all() {
        assert_eq!(PurgeSelector::parse(&["*"]).unwrap(), PurgeSelector::All);
    }

    #[test]
    fn purge_selector_explicit() {
        let selector = PurgeSelector::parse(&["1-a", "2-b"]).unwrap();
        assert_eq!(
            selector,
            PurgeSelector::Revisions(vec!["1-a".parse().unwrap(), "2-b".parse().unwrap()])
        );
        assert!(matches!(
            PurgeSelector::parse(&["bogus"]),
            Err(Error::Forbidden(_))
        ));
    }
}
