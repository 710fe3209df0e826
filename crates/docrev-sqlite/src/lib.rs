//! # docrev SQLite
//!
//! `SQLite` persistence for docrev: one row per revision, one row per
//! attachment body.
//!
//! Each call loads the document's rows into a [`RevisionTree`] and lets the
//! tree decide winners, conflicts and revision IDs, so this store and the
//! in-memory one agree on every rule. Writes run inside a transaction.

#![warn(missing_docs)]
#![warn(clippy::all)]

use docrev_core::attachments::install_attachment_bodies;
use docrev_core::{
    AttachmentStore, ContentOptions, Error, EvictionListener, Properties, PurgeReport,
    PurgeRequest, PurgeSelector, Result, RevisionDraft, RevisionId, RevisionRecord,
    RevisionStore, RevisionTree,
};
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// `SQLite`-backed revision and attachment store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> SqliteResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        tracing::debug!(path = %path.display(), "Opened revision store");
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    pub fn in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> SqliteResult<()> {
        self.lock().execute_batch(
            r"
            -- Revision tree rows
            CREATE TABLE IF NOT EXISTS revisions (
                doc_id TEXT NOT NULL,
                rev_id TEXT NOT NULL,
                generation INTEGER NOT NULL,
                parent_rev TEXT,
                deleted INTEGER NOT NULL,
                body TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (doc_id, rev_id)
            );

            CREATE INDEX IF NOT EXISTS idx_revisions_parent ON revisions(doc_id, parent_rev);

            -- Attachment bodies by content digest
            CREATE TABLE IF NOT EXISTS attachments (
                digest TEXT PRIMARY KEY,
                body BLOB NOT NULL,
                length INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
            ",
        )
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of stored revisions of a document.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub fn revision_count(&self, doc_id: &str) -> Result<usize> {
        let count: i64 = self
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM revisions WHERE doc_id = ?1",
                [doc_id],
                |row| row.get(0),
            )
            .map_err(sql_error)?;
        usize::try_from(count).map_err(|e| Error::Unknown(e.to_string()))
    }

    /// IDs of every document with at least one revision, sorted.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub fn document_ids(&self) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT DISTINCT doc_id FROM revisions ORDER BY doc_id ASC")
            .map_err(sql_error)?;
        let ids = stmt
            .query_map([], |row| row.get(0))
            .map_err(sql_error)?
            .collect::<SqliteResult<Vec<String>>>()
            .map_err(sql_error)?;
        Ok(ids)
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl RevisionStore for SqliteStore {
    fn revision(
        &self,
        doc_id: &str,
        rev_id: Option<&RevisionId>,
        options: ContentOptions,
    ) -> Result<RevisionRecord> {
        let conn = self.lock();
        let Some(rev_id) = rev_id else {
            let mut winner = load_tree(&conn, doc_id)?
                .and_then(|tree| tree.winner())
                .ok_or_else(|| Error::NotFound(format!("document {doc_id}")))?;
            if options.no_body {
                winner.body = None;
            }
            return Ok(winner);
        };

        let row = conn
            .query_row(
                r"
                SELECT rev_id, parent_rev, deleted, body FROM revisions
                WHERE doc_id = ?1 AND rev_id = ?2
                ",
                (doc_id, rev_id.to_string()),
                read_row,
            )
            .optional()
            .map_err(sql_error)?
            .ok_or_else(|| Error::NotFound(format!("revision {rev_id} of {doc_id}")))?;
        let mut record = decode_row(doc_id, row)?;
        if options.no_body {
            record.body = None;
        }
        Ok(record)
    }

    fn leaf_revisions(&self, doc_id: &str) -> Result<Vec<RevisionRecord>> {
        let conn = self.lock();
        Ok(load_tree(&conn, doc_id)?
            .map(|tree| tree.leaves())
            .unwrap_or_default())
    }

    fn revision_history(
        &self,
        doc_id: &str,
        rev_id: &RevisionId,
    ) -> Result<Vec<RevisionRecord>> {
        let conn = self.lock();
        load_tree(&conn, doc_id)?
            .ok_or_else(|| Error::NotFound(format!("document {doc_id}")))?
            .history(rev_id)
    }

    fn put_revision(
        &self,
        draft: RevisionDraft,
        expected_parent: Option<&RevisionId>,
        allow_conflict: bool,
    ) -> Result<RevisionRecord> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(sql_error)?;

        let tree = load_tree(&tx, &draft.doc_id)?
            .unwrap_or_else(|| RevisionTree::new(draft.doc_id.clone()));
        let record = tree.prepare(&draft, expected_parent, allow_conflict)?;
        if let Some(existing) = tree.get(&record.rev_id, ContentOptions::default()) {
            return Ok(existing);
        }

        let body = serde_json::to_string(&draft.body)?;
        tx.execute(
            r"
            INSERT INTO revisions (doc_id, rev_id, generation, parent_rev, deleted, body, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            (
                &record.doc_id,
                record.rev_id.to_string(),
                to_i64(record.rev_id.generation()).map_err(sql_error)?,
                record.parent_id.as_ref().map(ToString::to_string),
                record.deleted,
                body,
                chrono::Utc::now().timestamp(),
            ),
        )
        .map_err(sql_error)?;
        tx.commit().map_err(sql_error)?;

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
            let mut conn = self.lock();
            let tx = conn.transaction().map_err(sql_error)?;
            for (doc_id, selector) in request.iter() {
                let Some(mut tree) = load_tree(&tx, doc_id)? else {
                    if *selector == PurgeSelector::All {
                        emptied.push(doc_id.clone());
                    }
                    report.purged.insert(doc_id.clone(), Vec::new());
                    continue;
                };

                let purged: Vec<RevisionId> = match selector {
                    PurgeSelector::All => tree.revision_ids().cloned().collect(),
                    PurgeSelector::Revisions(revs) => tree.purge(revs),
                };
                for rev_id in &purged {
                    tx.execute(
                        "DELETE FROM revisions WHERE doc_id = ?1 AND rev_id = ?2",
                        (doc_id, rev_id.to_string()),
                    )
                    .map_err(sql_error)?;
                }
                if *selector == PurgeSelector::All || tree.is_empty() {
                    emptied.push(doc_id.clone());
                } else if !purged.is_empty() {
                    pruned.push(doc_id.clone());
                }
                report.purged.insert(doc_id.clone(), purged);
            }
            tx.commit().map_err(sql_error)?;
        }

        for doc_id in &emptied {
            listener.document_purged(doc_id);
        }
        for doc_id in &pruned {
            listener.revisions_purged(doc_id);
        }
        Ok(report)
    }
}

impl AttachmentStore for SqliteStore {
    fn install_attachment_bodies(&self, attachments: &Properties) -> Result<Properties> {
        let conn = self.lock();
        install_attachment_bodies(attachments, |digest, bytes| {
            let length = i64::try_from(bytes.len()).map_err(|e| Error::Unknown(e.to_string()))?;
            conn.execute(
                r"
                INSERT OR IGNORE INTO attachments (digest, body, length, created_at)
                VALUES (?1, ?2, ?3, ?4)
                ",
                (digest, bytes, length, chrono::Utc::now().timestamp()),
            )
            .map_err(sql_error)?;
            Ok(())
        })
    }

    fn attachment_body(&self, digest: &str) -> Result<Vec<u8>> {
        self.lock()
            .query_row(
                "SELECT body FROM attachments WHERE digest = ?1",
                [digest],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    Error::NotFound(format!("attachment {digest}"))
                }
                other => sql_error(other),
            })
    }
}

/// Raw column values of a revision row.
type Row = (String, Option<String>, bool, String);

fn read_row(row: &rusqlite::Row<'_>) -> SqliteResult<Row> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode_row(doc_id: &str, (rev_id, parent, deleted, body): Row) -> Result<RevisionRecord> {
    let rev_id = parse_stored_rev(doc_id, &rev_id)?;
    let parent_id = parent
        .map(|parent| parse_stored_rev(doc_id, &parent))
        .transpose()?;
    let body: Properties = serde_json::from_str(&body)?;
    Ok(RevisionRecord {
        doc_id: doc_id.to_string(),
        rev_id,
        parent_id,
        deleted,
        body: Some(body),
    })
}

fn parse_stored_rev(doc_id: &str, raw: &str) -> Result<RevisionId> {
    raw.parse()
        .map_err(|e| Error::Unknown(format!("corrupt revision ID '{raw}' in {doc_id}: {e}")))
}

/// Load every row of a document. `None` if it has no revisions.
fn load_tree(conn: &Connection, doc_id: &str) -> Result<Option<RevisionTree>> {
    let mut stmt = conn
        .prepare(
            r"
            SELECT rev_id, parent_rev, deleted, body FROM revisions
            WHERE doc_id = ?1
            ORDER BY generation ASC
            ",
        )
        .map_err(sql_error)?;
    let rows = stmt
        .query_map([doc_id], read_row)
        .map_err(sql_error)?
        .collect::<SqliteResult<Vec<Row>>>()
        .map_err(sql_error)?;
    if rows.is_empty() {
        return Ok(None);
    }
    let records = rows
        .into_iter()
        .map(|row| decode_row(doc_id, row))
        .collect::<Result<Vec<_>>>()?;
    Ok(Some(RevisionTree::from_records(doc_id, records)))
}

fn sql_error(err: rusqlite::Error) -> Error {
    match err {
        rusqlite::Error::QueryReturnedNoRows => Error::NotFound(err.to_string()),
        other => Error::Unknown(format!("sqlite: {other}")),
    }
}

fn to_i64(value: u64) -> SqliteResult<i64> {
    i64::try_from(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use docrev_core::attachments::inline_attachment;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder(StdMutex<Vec<String>>, StdMutex<Vec<String>>);

    impl EvictionListener for Recorder {
        fn document_purged(&self, doc_id: &str) {
            self.0.lock().unwrap().push(doc_id.to_string());
        }

        fn revisions_purged(&self, doc_id: &str) {
            self.1.lock().unwrap().push(doc_id.to_string());
        }
    }

    fn draft(doc_id: &str, n: i64) -> RevisionDraft {
        let mut body = Properties::new();
        body.insert("n".to_string(), json!(n));
        RevisionDraft {
            doc_id: doc_id.to_string(),
            deleted: false,
            body,
        }
    }

    #[test]
    fn put_and_read_back() {
        let store = SqliteStore::in_memory().unwrap();
        let root = store.put_revision(draft("doc", 1), None, false).unwrap();
        let child = store
            .put_revision(draft("doc", 2), Some(&root.rev_id), false)
            .unwrap();

        assert_eq!(child.parent_id.as_ref(), Some(&root.rev_id));
        let winner = store
            .revision("doc", None, ContentOptions::default())
            .unwrap();
        assert_eq!(winner, child);

        let meta = store
            .revision("doc", Some(&root.rev_id), ContentOptions::METADATA_ONLY)
            .unwrap();
        assert!(meta.body.is_none());
        assert_eq!(store.revision_count("doc").unwrap(), 2);

        let history = store.revision_history("doc", &child.rev_id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].rev_id, child.rev_id);
    }

    #[test]
    fn stale_parent_conflicts() {
        let store = SqliteStore::in_memory().unwrap();
        let root = store.put_revision(draft("doc", 1), None, false).unwrap();
        store
            .put_revision(draft("doc", 2), Some(&root.rev_id), false)
            .unwrap();

        let err = store
            .put_revision(draft("doc", 3), Some(&root.rev_id), false)
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.revision_count("doc").unwrap(), 2);

        store
            .put_revision(draft("doc", 3), Some(&root.rev_id), true)
            .unwrap();
        assert_eq!(store.leaf_revisions("doc").unwrap().len(), 2);
    }

    #[test]
    fn missing_lookups_are_not_found() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store
            .revision("doc", None, ContentOptions::default())
            .unwrap_err()
            .is_not_found());
        let rev: RevisionId = "1-abc".parse().unwrap();
        assert!(store
            .revision("doc", Some(&rev), ContentOptions::default())
            .unwrap_err()
            .is_not_found());
        assert!(store.leaf_revisions("doc").unwrap().is_empty());
        assert!(store.attachment_body("nope").unwrap_err().is_not_found());
    }

    #[test]
    fn purge_prunes_and_notifies() {
        let store = SqliteStore::in_memory().unwrap();
        let root = store.put_revision(draft("doc", 1), None, false).unwrap();
        let leaf = store
            .put_revision(draft("doc", 2), Some(&root.rev_id), false)
            .unwrap();
        store.put_revision(draft("other", 1), None, false).unwrap();

        let mut request = PurgeRequest::new();
        request.insert("doc", PurgeSelector::Revisions(vec![leaf.rev_id.clone()]));
        request.insert("other", PurgeSelector::Revisions(Vec::new()));
        let recorder = Recorder::default();
        let report = store.purge_revisions(&request, &recorder).unwrap();

        assert_eq!(report.purged["doc"].len(), 2);
        assert!(report.purged["other"].is_empty());
        assert_eq!(*recorder.0.lock().unwrap(), vec!["doc".to_string()]);
        assert!(recorder.1.lock().unwrap().is_empty());
        assert_eq!(store.document_ids().unwrap(), vec!["other".to_string()]);
    }

    #[test]
    fn purging_one_branch_reports_remaining_document() {
        let store = SqliteStore::in_memory().unwrap();
        let root = store.put_revision(draft("doc", 1), None, false).unwrap();
        let left = store
            .put_revision(draft("doc", 2), Some(&root.rev_id), false)
            .unwrap();
        let right = store
            .put_revision(draft("doc", 3), Some(&root.rev_id), true)
            .unwrap();
        let winner = store
            .revision("doc", None, ContentOptions::METADATA_ONLY)
            .unwrap();
        let loser = if winner.rev_id == left.rev_id { &right } else { &left };

        let mut request = PurgeRequest::new();
        request.insert("doc", PurgeSelector::Revisions(vec![winner.rev_id.clone()]));
        let recorder = Recorder::default();
        store.purge_revisions(&request, &recorder).unwrap();

        assert!(recorder.0.lock().unwrap().is_empty());
        assert_eq!(*recorder.1.lock().unwrap(), vec!["doc".to_string()]);
        let next = store
            .revision("doc", None, ContentOptions::METADATA_ONLY)
            .unwrap();
        assert_eq!(next.rev_id, loser.rev_id);
    }

    #[test]
    fn attachment_bodies_round_through_the_table() {
        let store = SqliteStore::in_memory().unwrap();
        let mut raw = Properties::new();
        raw.insert(
            "note.txt".to_string(),
            inline_attachment(Some("text/plain"), b"hello"),
        );

        let installed = store.install_attachment_bodies(&raw).unwrap();
        let digest = installed["note.txt"]["digest"].as_str().unwrap();
        assert_eq!(store.attachment_body(digest).unwrap(), b"hello");

        // Installing the same body twice keeps one row.
        store.install_attachment_bodies(&raw).unwrap();
        let rows: i64 = store
            .lock()
            .query_row("SELECT COUNT(*) FROM attachments", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }
}
