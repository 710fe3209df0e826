//! Committed revisions and the builder for new ones.

use crate::attachments::inline_attachment;
use crate::document::Document;
use crate::error::Result;
use crate::properties::{
    self, Properties, ATTACHMENTS_KEY, DELETED_KEY, ID_KEY, REV_KEY,
};
use crate::rev_id::RevisionId;
use crate::store::RevisionRecord;
use serde_json::Value;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// An immutable snapshot of a document at one tree node.
///
/// Two revisions are equal when they belong to the same document and carry
/// the same revision ID.
#[derive(Debug, Clone)]
pub struct Revision {
    doc_id: String,
    rev_id: RevisionId,
    parent_id: Option<RevisionId>,
    deleted: bool,
    body: Option<Properties>,
}

impl Revision {
    /// Wrap a store record.
    #[must_use]
    pub fn from_record(record: RevisionRecord) -> Self {
        Self {
            doc_id: record.doc_id,
            rev_id: record.rev_id,
            parent_id: record.parent_id,
            deleted: record.deleted,
            body: record.body,
        }
    }

    /// Owning document ID.
    #[must_use]
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// This revision's ID.
    #[must_use]
    pub fn id(&self) -> &RevisionId {
        &self.rev_id
    }

    /// Parent revision ID, `None` for a root.
    #[must_use]
    pub fn parent_id(&self) -> Option<&RevisionId> {
        self.parent_id.as_ref()
    }

    /// Whether this revision is a tombstone.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Whether the body was loaded.
    #[must_use]
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    /// Stored body, without derived metadata.
    #[must_use]
    pub fn body(&self) -> Option<&Properties> {
        self.body.as_ref()
    }

    /// Full property map including `_id`, `_rev` and `_deleted`.
    #[must_use]
    pub fn properties(&self) -> Properties {
        properties::with_metadata(&self.doc_id, &self.rev_id, self.deleted, self.body.as_ref())
    }

    /// Properties without any reserved key.
    #[must_use]
    pub fn user_properties(&self) -> Properties {
        self.body
            .as_ref()
            .map(properties::user_properties)
            .unwrap_or_default()
    }

    /// Look up a single property, reserved keys included.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<Value> {
        match key {
            ID_KEY => Some(Value::String(self.doc_id.clone())),
            REV_KEY => Some(Value::String(self.rev_id.to_string())),
            DELETED_KEY => self.deleted.then_some(Value::Bool(true)),
            _ => self.body.as_ref().and_then(|b| b.get(key)).cloned(),
        }
    }

    /// The `_attachments` map, if any.
    #[must_use]
    pub fn attachments(&self) -> Option<&Properties> {
        self.body
            .as_ref()
            .and_then(|b| b.get(ATTACHMENTS_KEY))
            .and_then(Value::as_object)
    }

    /// Names of this revision's attachments.
    #[must_use]
    pub fn attachment_names(&self) -> Vec<String> {
        self.attachments()
            .map(|a| a.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl PartialEq for Revision {
    fn eq(&self, other: &Self) -> bool {
        self.doc_id == other.doc_id && self.rev_id == other.rev_id
    }
}

impl Eq for Revision {}

impl Hash for Revision {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.doc_id.hash(state);
        Hash::hash(&self.rev_id, state);
    }
}

/// A revision under construction.
///
/// Starts as a copy of its parent's properties. Nothing reaches the store
/// until [`NewRevision::save`].
#[derive(Debug)]
pub struct NewRevision<'a> {
    document: &'a Document,
    parent: Option<Arc<Revision>>,
    properties: Properties,
}

impl<'a> NewRevision<'a> {
    pub(crate) fn new(document: &'a Document, parent: Option<Arc<Revision>>) -> Self {
        let properties = match parent.as_ref() {
            Some(parent) => parent.properties(),
            None => {
                let mut props = Properties::new();
                props.insert(ID_KEY.to_string(), Value::String(document.id().to_string()));
                props
            }
        };
        Self {
            document,
            parent,
            properties,
        }
    }

    /// The document this revision will be saved to.
    #[must_use]
    pub fn document(&self) -> &'a Document {
        self.document
    }

    /// The revision this one will be a child of.
    #[must_use]
    pub fn parent(&self) -> Option<&Arc<Revision>> {
        self.parent.as_ref()
    }

    /// ID of the parent revision.
    #[must_use]
    pub fn parent_id(&self) -> Option<&RevisionId> {
        self.parent.as_deref().map(Revision::id)
    }

    /// Current property map.
    #[must_use]
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Mutable access to the property map.
    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    /// Look up a single property.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Set a property.
    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Remove a property, returning its previous value.
    pub fn remove_property(&mut self, key: &str) -> Option<Value> {
        self.properties.remove(key)
    }

    /// Replace all user properties, keeping reserved keys.
    pub fn set_user_properties(&mut self, user: Properties) {
        self.properties.retain(|key, _| properties::is_reserved(key));
        for (key, value) in user {
            if !properties::is_reserved(&key) {
                self.properties.insert(key, value);
            }
        }
    }

    /// Whether this revision will be a tombstone.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        properties::is_deletion(Some(&self.properties))
    }

    /// Mark or unmark this revision as a tombstone.
    pub fn set_deleted(&mut self, deleted: bool) {
        if deleted {
            self.properties
                .insert(DELETED_KEY.to_string(), Value::Bool(true));
        } else {
            self.properties.remove(DELETED_KEY);
        }
    }

    /// Attach a body inline. It is installed into the attachment store on save.
    pub fn set_attachment(&mut self, name: impl Into<String>, content_type: Option<&str>, bytes: &[u8]) {
        let attachments = self
            .properties
            .entry(ATTACHMENTS_KEY)
            .or_insert_with(|| Value::Object(Properties::new()));
        if !attachments.is_object() {
            *attachments = Value::Object(Properties::new());
        }
        if let Value::Object(map) = attachments {
            map.insert(name.into(), inline_attachment(content_type, bytes));
        }
    }

    /// Drop an attachment. Returns whether it existed.
    pub fn remove_attachment(&mut self, name: &str) -> bool {
        let removed = self
            .properties
            .get_mut(ATTACHMENTS_KEY)
            .and_then(Value::as_object_mut)
            .is_some_and(|map| map.remove(name).is_some());
        let now_empty = self
            .properties
            .get(ATTACHMENTS_KEY)
            .and_then(Value::as_object)
            .is_some_and(Properties::is_empty);
        if now_empty {
            self.properties.remove(ATTACHMENTS_KEY);
        }
        removed
    }

    /// Commit against the captured parent.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the parent is no longer a leaf, or any other
    /// store error.
    pub fn save(self) -> Result<Arc<Revision>> {
        self.commit(false)
    }

    /// Commit even if the parent is no longer a leaf, creating a branch.
    ///
    /// # Errors
    ///
    /// Returns any store error.
    pub fn save_allowing_conflict(self) -> Result<Arc<Revision>> {
        self.commit(true)
    }

    fn commit(self, allow_conflict: bool) -> Result<Arc<Revision>> {
        let parent_id = self.parent.as_deref().map(|p| p.id().clone());
        self.document
            .put_against(Some(self.properties), parent_id.as_ref(), allow_conflict)
    }
}
