//! The document entity.
//!
//! A [`Document`] is a stable ID over a revision tree. It caches the current
//! (winning) revision and routes every read and write through the store.
//!
//! Cache discipline: one mutex guards the cached revision. A cache miss
//! fetches from the store while holding it, and a commit recomputes the
//! cached value under it, so an invalidation can never be lost between a
//! read and a write. The mutex is never held while calling into a purge.

use crate::database::Database;
use crate::error::{Error, Result};
use crate::properties::{self, Properties, ATTACHMENTS_KEY};
use crate::rev_id::RevisionId;
use crate::revision::{NewRevision, Revision};
use crate::store::{ContentOptions, PurgeRequest, RevisionDraft, RevisionRecord, RevisionStore};
use crate::update::{self, RetryPolicy, UpdateDecision};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// How to remove a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deletion {
    /// Add a deleted leaf. Stays in the tree and replicates.
    Tombstone,
    /// Erase every revision locally. Never replicates.
    Purge,
}

/// Result of [`Document::remove`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    /// The tombstone revision that was committed
    Tombstoned(Arc<Revision>),
    /// The tree was erased
    Purged,
}

/// A document: identity plus cached current revision.
pub struct Document {
    id: String,
    database: Database,
    current: Mutex<Option<Arc<Revision>>>,
}

impl Document {
    pub(crate) fn new(database: Database, id: String) -> Self {
        Self {
            id,
            database,
            current: Mutex::new(None),
        }
    }

    /// The document ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The ID shortened to `"abcd..wxyz"` when longer than 10 characters.
    #[must_use]
    pub fn abbreviated_id(&self) -> String {
        abbreviate(&self.id)
    }

    /// The owning database.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.database
    }

    fn store(&self) -> &dyn RevisionStore {
        self.database.store()
    }

    fn cache(&self) -> MutexGuard<'_, Option<Arc<Revision>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The current revision, fetched and cached on first use.
    ///
    /// Returns `None` if the document has no revisions.
    ///
    /// # Errors
    ///
    /// Returns any store error other than `NotFound`.
    pub fn current_revision(&self) -> Result<Option<Arc<Revision>>> {
        let mut cached = self.cache();
        if let Some(rev) = cached.as_ref() {
            return Ok(Some(Arc::clone(rev)));
        }
        let record = match self.store().revision(&self.id, None, ContentOptions::default()) {
            Ok(record) => record,
            Err(Error::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let rev = Arc::new(Revision::from_record(record));
        tracing::debug!(doc_id = %self.id, rev_id = %rev.id(), "Cached current revision");
        *cached = Some(Arc::clone(&rev));
        Ok(Some(rev))
    }

    /// ID of the current revision.
    ///
    /// # Errors
    ///
    /// Returns any store error other than `NotFound`.
    pub fn current_revision_id(&self) -> Result<Option<RevisionId>> {
        Ok(self.current_revision()?.map(|rev| rev.id().clone()))
    }

    /// Whether the current revision is a tombstone.
    ///
    /// A document with no revisions is not deleted.
    ///
    /// # Errors
    ///
    /// Returns any store error other than `NotFound`.
    pub fn is_deleted(&self) -> Result<bool> {
        Ok(self
            .current_revision()?
            .is_some_and(|rev| rev.is_deleted()))
    }

    /// Properties of the current revision.
    ///
    /// # Errors
    ///
    /// Returns any store error other than `NotFound`.
    pub fn properties(&self) -> Result<Option<Properties>> {
        Ok(self.current_revision()?.map(|rev| rev.properties()))
    }

    /// User properties of the current revision.
    ///
    /// # Errors
    ///
    /// Returns any store error other than `NotFound`.
    pub fn user_properties(&self) -> Result<Option<Properties>> {
        Ok(self.current_revision()?.map(|rev| rev.user_properties()))
    }

    /// One property of the current revision.
    ///
    /// # Errors
    ///
    /// Returns any store error other than `NotFound`.
    pub fn property(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.current_revision()?.and_then(|rev| rev.property(key)))
    }

    /// Drop the cached current revision. The next read refetches.
    pub fn invalidate_current_revision(&self) {
        if self.cache().take().is_some() {
            tracing::debug!(doc_id = %self.id, "Invalidated cached revision");
        }
    }

    /// A specific revision. Reuses the cached instance when IDs match.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the revision does not exist.
    pub fn revision(&self, rev_id: &RevisionId) -> Result<Arc<Revision>> {
        if let Some(current) = self.cache().as_ref() {
            if current.id() == rev_id {
                return Ok(Arc::clone(current));
            }
        }
        let record = self
            .store()
            .revision(&self.id, Some(rev_id), ContentOptions::default())?;
        Ok(self.wrap(record))
    }

    /// A specific revision by its string form.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` if `rev_id` is malformed, `NotFound` if it does
    /// not exist.
    pub fn revision_str(&self, rev_id: &str) -> Result<Arc<Revision>> {
        let rev_id: RevisionId = rev_id.parse()?;
        self.revision(&rev_id)
    }

    /// Canonicalize a store record into a revision.
    ///
    /// Returns the cached current instance when the IDs match, so callers
    /// comparing with [`Arc::ptr_eq`] see the same object.
    #[must_use]
    pub fn revision_from_record(&self, record: Option<RevisionRecord>) -> Option<Arc<Revision>> {
        record.map(|record| self.wrap(record))
    }

    fn wrap(&self, record: RevisionRecord) -> Arc<Revision> {
        if let Some(current) = self.cache().as_ref() {
            if *current.id() == record.rev_id {
                return Arc::clone(current);
            }
        }
        Arc::new(Revision::from_record(record))
    }

    /// Ancestry of the current revision, root first.
    ///
    /// Returns `None` if the document has no current revision.
    ///
    /// # Errors
    ///
    /// Returns any store error.
    pub fn revision_history(&self) -> Result<Option<Vec<Arc<Revision>>>> {
        let Some(current) = self.current_revision()? else {
            tracing::warn!(doc_id = %self.id, "Revision history requested without a current revision");
            return Ok(None);
        };
        let chain = self.store().revision_history(&self.id, current.id())?;
        Ok(Some(
            chain.into_iter().rev().map(|record| self.wrap(record)).collect(),
        ))
    }

    /// Leaf revisions, optionally without tombstones.
    ///
    /// # Errors
    ///
    /// Returns any store error.
    pub fn leaf_revisions_filtered(&self, include_deleted: bool) -> Result<Arc<[Arc<Revision>]>> {
        let leaves = self.store().leaf_revisions(&self.id)?;
        Ok(leaves
            .into_iter()
            .filter(|record| include_deleted || !record.deleted)
            .map(|record| self.wrap(record))
            .collect())
    }

    /// All leaves, tombstones included.
    ///
    /// # Errors
    ///
    /// Returns any store error.
    pub fn leaf_revisions(&self) -> Result<Arc<[Arc<Revision>]>> {
        self.leaf_revisions_filtered(true)
    }

    /// Live leaves. More than one means the document is in conflict.
    ///
    /// # Errors
    ///
    /// Returns any store error.
    pub fn conflicting_revisions(&self) -> Result<Arc<[Arc<Revision>]>> {
        self.leaf_revisions_filtered(false)
    }

    /// A draft parented on the current revision, or parentless for a new
    /// document.
    ///
    /// # Errors
    ///
    /// Returns any store error other than `NotFound`.
    pub fn new_revision(&self) -> Result<NewRevision<'_>> {
        Ok(NewRevision::new(self, self.current_revision()?))
    }

    /// Save a property map as a new revision.
    ///
    /// `_rev` names the expected parent. `None` or `_deleted: true` writes a
    /// tombstone.
    ///
    /// The map is consumed. Inline `_attachments` entries are stored as
    /// digest stubs, and that installed form is what the returned revision
    /// carries (see [`Revision::attachments`]).
    ///
    /// # Errors
    ///
    /// - `Conflict` if `_rev` is not the current leaf
    /// - `Forbidden` if `_rev` is malformed or a reserved key is misused
    /// - `NotFound` if `_rev` names an unknown revision
    pub fn put_properties(&self, properties: Option<Properties>) -> Result<Arc<Revision>> {
        let parent = properties
            .as_ref()
            .map(properties::expected_parent)
            .transpose()?
            .flatten();
        self.put_against(properties, parent.as_ref(), false)
    }

    pub(crate) fn put_against(
        &self,
        properties: Option<Properties>,
        parent: Option<&RevisionId>,
        allow_conflict: bool,
    ) -> Result<Arc<Revision>> {
        let deleted = properties::is_deletion(properties.as_ref());
        let mut properties = properties.unwrap_or_default();

        if let Some(claimed) = properties::claimed_id(&properties) {
            if claimed != self.id {
                tracing::warn!(
                    doc_id = %self.id,
                    claimed_id = %claimed,
                    "Properties carry a different _id; writing to this document"
                );
            }
        }

        self.install_attachments(&mut properties)?;
        let draft = RevisionDraft {
            doc_id: self.id.clone(),
            deleted,
            body: properties::storage_body(&properties)?,
        };

        let record = match self.store().put_revision(draft, parent, allow_conflict) {
            Ok(record) => record,
            Err(err) => {
                if err.is_conflict() {
                    self.invalidate_current_revision();
                }
                return Err(err);
            }
        };
        tracing::debug!(
            doc_id = %self.id,
            rev_id = %record.rev_id,
            parent = ?parent.map(ToString::to_string),
            deleted,
            "Committed revision"
        );

        let saved = Arc::new(Revision::from_record(record));
        self.refresh_after_commit(&saved);
        Ok(saved)
    }

    fn install_attachments(&self, properties: &mut Properties) -> Result<()> {
        let installed = match properties.get(ATTACHMENTS_KEY) {
            None | Some(Value::Null) => return Ok(()),
            Some(Value::Object(raw)) if raw.is_empty() => return Ok(()),
            Some(Value::Object(raw)) => self.database.attachments().install_attachment_bodies(raw)?,
            Some(other) => {
                return Err(Error::Forbidden(format!(
                    "{ATTACHMENTS_KEY} must be an object, got {other}"
                )))
            }
        };
        properties.insert(ATTACHMENTS_KEY.to_string(), Value::Object(installed));
        Ok(())
    }

    /// Recompute the cache after a commit: the saved revision is cached
    /// only if it is now the winning leaf. The commit already happened, so a
    /// failed read only clears the cache.
    fn refresh_after_commit(&self, saved: &Arc<Revision>) {
        let mut cached = self.cache();
        let winner = match self.store().revision(&self.id, None, ContentOptions::default()) {
            Ok(winner) => winner,
            Err(Error::NotFound(_)) => {
                *cached = None;
                return;
            }
            Err(err) => {
                *cached = None;
                tracing::warn!(
                    doc_id = %self.id,
                    rev_id = %saved.id(),
                    error = %err,
                    "Committed, but could not reload the current revision"
                );
                return;
            }
        };
        let next = if winner.rev_id == *saved.id() {
            Arc::clone(saved)
        } else {
            match cached.take() {
                Some(current) if *current.id() == winner.rev_id => current,
                _ => Arc::new(Revision::from_record(winner)),
            }
        };
        *cached = Some(next);
    }

    /// Save a new revision computed by `updater`, retrying on conflict.
    ///
    /// Uses the database's retry policy. `updater` may be called several
    /// times; each call gets a draft parented on the then-current winner.
    /// Returns `None` if `updater` cancels.
    ///
    /// # Errors
    ///
    /// Returns any non-conflict error immediately, and `Conflict` once the
    /// retry policy is exhausted.
    pub fn update<F>(&self, updater: F) -> Result<Option<Arc<Revision>>>
    where
        F: FnMut(&mut NewRevision<'_>) -> UpdateDecision,
    {
        self.update_with_policy(self.database.options().retry, updater)
    }

    /// [`Self::update`] with an explicit retry policy.
    ///
    /// # Errors
    ///
    /// See [`Self::update`].
    pub fn update_with_policy<F>(
        &self,
        policy: RetryPolicy,
        updater: F,
    ) -> Result<Option<Arc<Revision>>>
    where
        F: FnMut(&mut NewRevision<'_>) -> UpdateDecision,
    {
        update::run(self, policy, updater)
    }

    /// Remove the document as a tombstone or by purging.
    ///
    /// # Errors
    ///
    /// `Tombstone` returns `NotFound` if there is no current revision and
    /// `Conflict` if another writer got there first. Store failures
    /// propagate unchanged.
    pub fn remove(&self, deletion: Deletion) -> Result<Removal> {
        match deletion {
            Deletion::Tombstone => {
                let current = self
                    .current_revision()?
                    .ok_or_else(|| Error::NotFound(format!("document {}", self.id)))?;
                let tombstone = self.put_against(None, Some(current.id()), false)?;
                Ok(Removal::Tombstoned(tombstone))
            }
            Deletion::Purge => {
                let report = self
                    .database
                    .purge_revisions(&PurgeRequest::all(self.id.clone()))?;
                self.invalidate_current_revision();
                tracing::info!(
                    doc_id = %self.id,
                    revisions = report.purged.get(&self.id).map_or(0, Vec::len),
                    "Purged document"
                );
                Ok(Removal::Purged)
            }
        }
    }

    /// Add a tombstone revision. It replicates like any other revision.
    ///
    /// # Errors
    ///
    /// See [`Self::remove`].
    pub fn delete(&self) -> Result<bool> {
        Ok(matches!(
            self.remove(Deletion::Tombstone)?,
            Removal::Tombstoned(_)
        ))
    }

    /// Erase every revision and evict this document from the identity cache.
    /// Nothing replicates.
    ///
    /// # Errors
    ///
    /// See [`Self::remove`].
    pub fn purge(&self) -> Result<()> {
        self.remove(Deletion::Purge).map(|_| ())
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cached = self.cache().as_ref().map(|rev| rev.id().to_string());
        f.debug_struct("Document")
            .field("id", &self.id)
            .field("current", &cached)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Document[{}]", self.abbreviated_id())
    }
}

/// Shorten an ID to its first and last four characters when longer than 10.
#[must_use]
pub fn abbreviate(id: &str) -> String {
    let len = id.chars().count();
    if len <= 10 {
        return id.to_string();
    }
    let head: String = id.chars().take(4).collect();
    let tail: String = id.chars().skip(len - 4).collect();
    format!("{head}..{tail}")
}
