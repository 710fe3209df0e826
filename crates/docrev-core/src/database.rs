//! The owning database handle and its document identity cache.

use crate::attachments::MemoryAttachmentStore;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::memory::MemoryStore;
use crate::store::{AttachmentStore, EvictionListener, PurgeReport, PurgeRequest, RevisionStore};
use crate::update::RetryPolicy;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use uuid::Uuid;

/// Database-wide options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatabaseOptions {
    /// Retry policy used by [`Document::update`]
    pub retry: RetryPolicy,
}

/// A cheaply clonable handle shared by every document of a database.
///
/// Hands out one [`Document`] instance per ID for as long as any caller
/// holds it.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    store: Arc<dyn RevisionStore>,
    attachments: Arc<dyn AttachmentStore>,
    options: DatabaseOptions,
    documents: Mutex<HashMap<String, Weak<Document>>>,
}

impl DatabaseInner {
    fn documents(&self) -> MutexGuard<'_, HashMap<String, Weak<Document>>> {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Purge listener that knows which instances were live before the purge.
///
/// Only those instances (or dead entries) are evicted. An instance created
/// while the purge ran stays cached, with its revision cache cleared.
struct PurgeScope<'a> {
    inner: &'a DatabaseInner,
    before: HashMap<String, Weak<Document>>,
}

impl<'a> PurgeScope<'a> {
    fn new(inner: &'a DatabaseInner, request: &PurgeRequest) -> Self {
        let documents = inner.documents();
        let before = request
            .iter()
            .filter_map(|(doc_id, _)| {
                documents
                    .get(doc_id)
                    .map(|weak| (doc_id.clone(), weak.clone()))
            })
            .collect();
        Self { inner, before }
    }

    /// Every live instance for this ID, old and new.
    fn instances(&self, doc_id: &str) -> Vec<Arc<Document>> {
        let mut instances: Vec<Arc<Document>> = self
            .before
            .get(doc_id)
            .and_then(Weak::upgrade)
            .into_iter()
            .collect();
        if let Some(current) = self.inner.documents().get(doc_id).and_then(Weak::upgrade) {
            if !instances.iter().any(|known| Arc::ptr_eq(known, &current)) {
                instances.push(current);
            }
        }
        instances
    }
}

impl EvictionListener for PurgeScope<'_> {
    fn document_purged(&self, doc_id: &str) {
        let instances = self.instances(doc_id);
        let evicted = {
            let mut documents = self.inner.documents();
            let stale = documents.get(doc_id).is_some_and(|entry| {
                entry.strong_count() == 0
                    || self
                        .before
                        .get(doc_id)
                        .is_some_and(|before| entry.ptr_eq(before))
            });
            if stale {
                documents.remove(doc_id);
            }
            stale
        };
        for document in instances {
            document.invalidate_current_revision();
        }
        tracing::debug!(doc_id, evicted, "Purged document tree");
    }

    fn revisions_purged(&self, doc_id: &str) {
        for document in self.instances(doc_id) {
            document.invalidate_current_revision();
        }
        tracing::debug!(doc_id, "Purged some revisions");
    }
}

impl Database {
    /// Create a database over the given collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn RevisionStore>,
        attachments: Arc<dyn AttachmentStore>,
        options: DatabaseOptions,
    ) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                store,
                attachments,
                options,
                documents: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create a database backed by in-memory stores.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::in_memory_with(DatabaseOptions::default())
    }

    /// Create an in-memory database with explicit options.
    #[must_use]
    pub fn in_memory_with(options: DatabaseOptions) -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryAttachmentStore::new()),
            options,
        )
    }

    /// The revision store.
    #[must_use]
    pub fn store(&self) -> &dyn RevisionStore {
        self.inner.store.as_ref()
    }

    /// The attachment store.
    #[must_use]
    pub fn attachments(&self) -> &dyn AttachmentStore {
        self.inner.attachments.as_ref()
    }

    /// Database options.
    #[must_use]
    pub fn options(&self) -> DatabaseOptions {
        self.inner.options
    }

    /// The document with this ID, created if not already live.
    ///
    /// The document need not exist in the store yet.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` for an empty ID.
    pub fn document(&self, id: impl Into<String>) -> Result<Arc<Document>> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::Forbidden("empty document ID".to_string()));
        }
        let mut documents = self.inner.documents();
        if let Some(document) = documents.get(&id).and_then(Weak::upgrade) {
            return Ok(document);
        }
        documents.retain(|_, weak| weak.strong_count() > 0);
        let document = Arc::new(Document::new(self.clone(), id.clone()));
        documents.insert(id, Arc::downgrade(&document));
        Ok(document)
    }

    /// The document with this ID, only if it has a current revision.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` for an empty ID, or any store error.
    pub fn existing_document(&self, id: impl Into<String>) -> Result<Option<Arc<Document>>> {
        let document = self.document(id)?;
        Ok(document.current_revision()?.map(|_| document))
    }

    /// A new document with a random ID.
    #[must_use]
    pub fn create_document(&self) -> Arc<Document> {
        let id = Uuid::new_v4().simple().to_string();
        let document = Arc::new(Document::new(self.clone(), id.clone()));
        self.inner.documents().insert(id, Arc::downgrade(&document));
        document
    }

    /// Whether a live document instance is cached for this ID.
    #[must_use]
    pub fn is_document_cached(&self, id: &str) -> bool {
        self.inner
            .documents()
            .get(id)
            .is_some_and(|weak| weak.strong_count() > 0)
    }

    /// Erase revisions locally. Documents left empty are evicted, and every
    /// live document that lost revisions refetches its current revision.
    ///
    /// # Errors
    ///
    /// Returns any store error.
    pub fn purge_revisions(&self, request: &PurgeRequest) -> Result<PurgeReport> {
        let scope = PurgeScope::new(&self.inner, request);
        self.inner.store.purge_revisions(request, &scope)
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("options", &self.inner.options)
            .field("cached_documents", &self.inner.documents().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PurgeSelector;
    use crate::update::UpdateDecision;

    #[test]
    fn same_id_same_instance() {
        let db = Database::in_memory();
        let a = db.document("doc").unwrap();
        let b = db.document("doc").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(db.is_document_cached("doc"));
    }

    #[test]
    fn dropped_documents_are_not_kept_alive() {
        let db = Database::in_memory();
        drop(db.document("doc").unwrap());
        assert!(!db.is_document_cached("doc"));
    }

    #[test]
    fn empty_id_is_forbidden() {
        let db = Database::in_memory();
        assert!(matches!(db.document(""), Err(Error::Forbidden(_))));
    }

    #[test]
    fn existing_document_requires_revisions() {
        let db = Database::in_memory();
        assert!(db.existing_document("doc").unwrap().is_none());
        db.document("doc")
            .unwrap()
            .update(|draft| {
                draft.set_property("x", 1);
                UpdateDecision::Save
            })
            .unwrap();
        assert!(db.existing_document("doc").unwrap().is_some());
    }

    #[test]
    fn created_documents_get_unique_ids() {
        let db = Database::in_memory();
        let a = db.create_document();
        let b = db.create_document();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().len(), 32);
        assert!(Arc::ptr_eq(&a, &db.document(a.id()).unwrap()));
    }

    #[test]
    fn explicit_purge_evicts_only_emptied_documents() {
        let db = Database::in_memory();
        let doc = db.document("doc").unwrap();
        let mut draft = doc.new_revision().unwrap();
        draft.set_property("n", 1);
        let root = draft.save().unwrap();
        let mut draft = doc.new_revision().unwrap();
        draft.set_property("n", 2);
        let leaf = draft.save().unwrap();

        let mut request = PurgeRequest::new();
        request.insert("doc", PurgeSelector::Revisions(vec![root.id().clone()]));
        let report = db.purge_revisions(&request).unwrap();
        assert!(report.purged["doc"].is_empty());
        assert!(db.is_document_cached("doc"));

        let mut request = PurgeRequest::new();
        request.insert("doc", PurgeSelector::Revisions(vec![leaf.id().clone()]));
        let report = db.purge_revisions(&request).unwrap();
        assert_eq!(report.purged["doc"].len(), 2);
        assert!(!db.is_document_cached("doc"));
        assert!(doc.current_revision().unwrap().is_none());
    }

    #[test]
    fn purging_the_winner_refreshes_the_cache() {
        let db = Database::in_memory();
        let doc = db.document("doc").unwrap();
        let mut draft = doc.new_revision().unwrap();
        draft.set_property("n", 0);
        draft.save().unwrap();
        let mut left = doc.new_revision().unwrap();
        left.set_property("n", 1);
        let mut right = doc.new_revision().unwrap();
        right.set_property("n", 2);
        left.save().unwrap();
        right.save_allowing_conflict().unwrap();

        let winner = doc.current_revision().unwrap().unwrap();
        let mut request = PurgeRequest::new();
        request.insert("doc", PurgeSelector::Revisions(vec![winner.id().clone()]));
        db.purge_revisions(&request).unwrap();

        let current = doc.current_revision().unwrap().unwrap();
        assert_ne!(current.id(), winner.id());
        assert_eq!(doc.conflicting_revisions().unwrap().len(), 1);
        assert!(db.is_document_cached("doc"));
    }

    #[test]
    fn eviction_keeps_instances_created_during_the_purge() {
        let db = Database::in_memory();
        let fresh = db.document("doc").unwrap();
        let mut draft = fresh.new_revision().unwrap();
        draft.set_property("n", 1);
        draft.save().unwrap();
        assert!(fresh.current_revision().unwrap().is_some());

        // No instance was live when this purge started.
        let scope = PurgeScope {
            inner: &db.inner,
            before: HashMap::new(),
        };
        scope.document_purged("doc");
        assert!(db.is_document_cached("doc"));
        assert!(Arc::ptr_eq(&fresh, &db.document("doc").unwrap()));

        let scope = PurgeScope::new(&db.inner, &PurgeRequest::all("doc"));
        scope.document_purged("doc");
        assert!(!db.is_document_cached("doc"));
    }
}
