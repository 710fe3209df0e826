//! Attachment body installation.
//!
//! An attachment entry under `_attachments` is either inline:
//!
//! ```json
//! {"content_type": "text/plain", "data": "aGVsbG8="}
//! ```
//!
//! or a stub referencing a stored body:
//!
//! ```json
//! {"stub": true, "digest": "blake3-…", "length": 5, "content_type": "text/plain"}
//! ```
//!
//! Installing converts inline entries into stubs after handing the decoded
//! body to a blob sink. Stubs pass through unchanged.

use crate::error::{Error, Result};
use crate::properties::Properties;
use crate::store::AttachmentStore;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Digest of an attachment body.
#[must_use]
pub fn attachment_digest(bytes: &[u8]) -> String {
    format!("blake3-{}", blake3::hash(bytes).to_hex())
}

/// Build an inline attachment entry.
#[must_use]
pub fn inline_attachment(content_type: Option<&str>, bytes: &[u8]) -> Value {
    let mut entry = Properties::new();
    if let Some(content_type) = content_type {
        entry.insert("content_type".to_string(), json!(content_type));
    }
    entry.insert("data".to_string(), json!(STANDARD.encode(bytes)));
    Value::Object(entry)
}

/// Convert inline entries to stubs, storing each body through `put_blob`.
///
/// # Errors
///
/// Returns `Forbidden` for entries that are neither inline nor stubs, or
/// whose `data` is not valid base64. Errors from `put_blob` propagate.
pub fn install_attachment_bodies<F>(raw: &Properties, mut put_blob: F) -> Result<Properties>
where
    F: FnMut(&str, Vec<u8>) -> Result<()>,
{
    let mut installed = Properties::new();
    for (name, entry) in raw {
        let Value::Object(meta) = entry else {
            return Err(Error::Forbidden(format!(
                "attachment '{name}' must be an object"
            )));
        };

        if is_stub(meta) {
            installed.insert(name.clone(), entry.clone());
            continue;
        }

        let data = meta.get("data").and_then(Value::as_str).ok_or_else(|| {
            Error::Forbidden(format!("attachment '{name}' has neither data nor digest"))
        })?;
        let bytes = STANDARD
            .decode(data)
            .map_err(|e| Error::Forbidden(format!("attachment '{name}': {e}")))?;

        let digest = attachment_digest(&bytes);
        let length = bytes.len();
        put_blob(&digest, bytes)?;

        let mut stub = Properties::new();
        stub.insert("stub".to_string(), Value::Bool(true));
        stub.insert("digest".to_string(), json!(digest));
        stub.insert("length".to_string(), json!(length));
        for key in ["content_type", "revpos"] {
            if let Some(value) = meta.get(key) {
                stub.insert(key.to_string(), value.clone());
            }
        }
        tracing::debug!(attachment = %name, %digest, length, "Installed attachment body");
        installed.insert(name.clone(), Value::Object(stub));
    }
    Ok(installed)
}

fn is_stub(meta: &Properties) -> bool {
    let stub_flag = meta.get("stub").and_then(Value::as_bool) == Some(true);
    stub_flag || (meta.contains_key("digest") && !meta.contains_key("data"))
}

/// Attachment bodies kept in memory, keyed by digest.
#[derive(Debug, Default)]
pub struct MemoryAttachmentStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryAttachmentStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct stored bodies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if no bodies are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AttachmentStore for MemoryAttachmentStore {
    fn install_attachment_bodies(&self, attachments: &Properties) -> Result<Properties> {
        install_attachment_bodies(attachments, |digest, bytes| {
            self.blobs
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(digest.to_string(), bytes);
            Ok(())
        })
    }

    fn attachment_body(&self, digest: &str) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(digest)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("attachment {digest}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(value: Value) -> Properties {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn inline_entry_becomes_stub() {
        let store = MemoryAttachmentStore::new();
        let raw = map(json!({
            "note.txt": inline_attachment(Some("text/plain"), b"hello")
        }));

        let installed = store.install_attachment_bodies(&raw).unwrap();
        let stub = installed["note.txt"].as_object().unwrap();
        let digest = attachment_digest(b"hello");

        assert_eq!(stub["stub"], json!(true));
        assert_eq!(stub["digest"], json!(digest));
        assert_eq!(stub["length"], json!(5));
        assert_eq!(stub["content_type"], json!("text/plain"));
        assert!(!stub.contains_key("data"));
        assert_eq!(store.attachment_body(&digest).unwrap(), b"hello");
    }

    #[test]
    fn stubs_pass_through() {
        let store = MemoryAttachmentStore::new();
        let raw = map(json!({
            "a.bin": {"stub": true, "digest": "blake3-00", "length": 1}
        }));
        let installed = store.install_attachment_bodies(&raw).unwrap();
        assert_eq!(installed, raw);
        assert!(store.is_empty());
    }

    #[test]
    fn malformed_entries_are_forbidden() {
        let store = MemoryAttachmentStore::new();
        let not_object = map(json!({"a": 1}));
        assert!(matches!(
            store.install_attachment_bodies(&not_object),
            Err(Error::Forbidden(_))
        ));

        let bad_base64 = map(json!({"a": {"data": "@@@"}}));
        assert!(matches!(
            store.install_attachment_bodies(&bad_base64),
            Err(Error::Forbidden(_))
        ));

        let empty = map(json!({"a": {"content_type": "text/plain"}}));
        assert!(matches!(
            store.install_attachment_bodies(&empty),
            Err(Error::Forbidden(_))
        ));
    }

    #[test]
    fn missing_body_is_not_found() {
        let store = MemoryAttachmentStore::new();
        assert!(store.attachment_body("blake3-nope").unwrap_err().is_not_found());
    }
}
