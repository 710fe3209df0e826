//! Property maps and reserved-key conventions.
//!
//! Keys starting with `_` carry metadata. Only four are recognized:
//!
//! | Key | Meaning |
//! |-----|---------|
//! | `_id` | document ID (derived on read) |
//! | `_rev` | revision ID (derived on read, expected parent on write) |
//! | `_deleted` | tombstone marker |
//! | `_attachments` | attachment metadata, stored with the body |

use crate::error::{Error, Result};
use crate::rev_id::RevisionId;
use serde_json::Value;

/// Ordered mapping of property names to JSON values.
pub type Properties = serde_json::Map<String, Value>;

/// Document ID key.
pub const ID_KEY: &str = "_id";
/// Revision ID key.
pub const REV_KEY: &str = "_rev";
/// Deletion marker key.
pub const DELETED_KEY: &str = "_deleted";
/// Attachments key.
pub const ATTACHMENTS_KEY: &str = "_attachments";

/// Check whether a key is reserved for metadata.
#[must_use]
pub fn is_reserved(key: &str) -> bool {
    key.starts_with('_')
}

/// Read `_rev` as the expected parent revision.
///
/// # Errors
///
/// Returns `Forbidden` if `_rev` is not a string or does not parse.
pub fn expected_parent(properties: &Properties) -> Result<Option<RevisionId>> {
    match properties.get(REV_KEY) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(rev)) => Ok(Some(rev.parse()?)),
        Some(other) => Err(Error::Forbidden(format!(
            "{REV_KEY} must be a string, got {other}"
        ))),
    }
}

/// Read the `_id` a caller put into a property map, if any.
#[must_use]
pub fn claimed_id(properties: &Properties) -> Option<&str> {
    properties.get(ID_KEY).and_then(Value::as_str)
}

/// Whether a write of these properties is a deletion.
///
/// Absent properties and `_deleted: true` both mean deletion.
#[must_use]
pub fn is_deletion(properties: Option<&Properties>) -> bool {
    properties.map_or(true, |props| {
        props.get(DELETED_KEY).and_then(Value::as_bool) == Some(true)
    })
}

/// Strip derived metadata from a property map before it is stored.
///
/// `_id`, `_rev` and `_deleted` are dropped; `_attachments` is kept.
///
/// # Errors
///
/// Returns `Forbidden` for any other `_`-prefixed key.
pub fn storage_body(properties: &Properties) -> Result<Properties> {
    let mut body = Properties::new();
    for (key, value) in properties {
        match key.as_str() {
            ID_KEY | REV_KEY | DELETED_KEY => {}
            ATTACHMENTS_KEY => {
                body.insert(key.clone(), value.clone());
            }
            k if is_reserved(k) => {
                return Err(Error::Forbidden(format!("reserved property '{k}'")));
            }
            _ => {
                body.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(body)
}

/// Build the full property map of a revision from its stored body.
#[must_use]
pub fn with_metadata(
    doc_id: &str,
    rev_id: &RevisionId,
    deleted: bool,
    body: Option<&Properties>,
) -> Properties {
    let mut properties = body.cloned().unwrap_or_default();
    properties.insert(ID_KEY.to_string(), Value::String(doc_id.to_string()));
    properties.insert(REV_KEY.to_string(), Value::String(rev_id.to_string()));
    if deleted {
        properties.insert(DELETED_KEY.to_string(), Value::Bool(true));
    } else {
        properties.remove(DELETED_KEY);
    }
    properties
}

/// Drop every reserved key.
#[must_use]
pub fn user_properties(properties: &Properties) -> Properties {
    properties
        .iter()
        .filter(|(key, _)| !is_reserved(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}
