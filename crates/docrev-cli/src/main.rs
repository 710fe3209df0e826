//! # docrev CLI
//!
//! Inspect and edit the documents of a docrev database from the shell.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use docrev_core::document::abbreviate;
use docrev_core::{
    AttachmentStore, Database, Deletion, Properties, Removal, Revision, RevisionId, RevisionStore,
    UpdateDecision,
};
use docrev_sqlite::SqliteStore;
use serde_json::Value;
use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;

use config::{CliConfig, StoreKind};

#[derive(Parser, Debug)]
#[command(name = "docrev", version, about = "Inspect and edit docrev documents")]
struct Cli {
    /// Database path, overriding `DOCREV_DB_PATH`.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the abbreviated form of a document ID
    Abbrev { id: String },
    /// Compare two revision IDs
    Compare { a: String, b: String },
    /// Print a revision's properties
    Get {
        doc: String,
        /// Revision to read instead of the current one
        #[arg(long)]
        rev: Option<String>,
        /// Omit `_id`, `_rev` and `_deleted`
        #[arg(long)]
        user: bool,
    },
    /// Merge a JSON object into the current properties
    Put { doc: String, json: String },
    /// Add a tombstone revision
    Delete { doc: String },
    /// Erase every revision locally
    Purge { doc: String },
    /// Print the current revision's ancestry, root first
    History { doc: String },
    /// Print leaf revisions, winner first
    Leaves {
        doc: String,
        /// Skip tombstones
        #[arg(long)]
        live: bool,
    },
    /// Print live leaves
    Conflicts { doc: String },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = CliConfig::from_env()?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    match cli.command {
        Command::Abbrev { id } => println!("{}", abbreviate(&id)),
        Command::Compare { a, b } => {
            let a: RevisionId = a.parse().context("Invalid first revision ID")?;
            let b: RevisionId = b.parse().context("Invalid second revision ID")?;
            let symbol = match a.cmp(&b) {
                Ordering::Less => "<",
                Ordering::Equal => "=",
                Ordering::Greater => ">",
            };
            println!("{a} {symbol} {b}");
        }
        command => run(&open_database(&config)?, command)?,
    }

    Ok(())
}

fn open_database(config: &CliConfig) -> Result<Database> {
    let options = config.database_options();
    match config.store {
        StoreKind::Memory => Ok(Database::in_memory_with(options)),
        StoreKind::Sqlite => {
            let store = Arc::new(SqliteStore::open(&config.db_path).with_context(|| {
                format!("Failed to open database {}", config.db_path.display())
            })?);
            tracing::debug!(path = %config.db_path.display(), "Using SQLite store");
            Ok(Database::new(
                Arc::clone(&store) as Arc<dyn RevisionStore>,
                store as Arc<dyn AttachmentStore>,
                options,
            ))
        }
    }
}

fn run(db: &Database, command: Command) -> Result<()> {
    match command {
        Command::Get { doc, rev, user } => {
            let document = db.document(doc)?;
            let revision = match rev {
                Some(rev) => document
                    .revision_str(&rev)
                    .with_context(|| format!("No revision {rev} of {document}"))?,
                None => match document.current_revision()? {
                    Some(current) => current,
                    None => bail!("{document} not found"),
                },
            };
            let properties = if user {
                revision.user_properties()
            } else {
                revision.properties()
            };
            println!("{}", serde_json::to_string_pretty(&properties)?);
        }
        Command::Put { doc, json } => {
            let patch = match serde_json::from_str::<Value>(&json).context("Invalid JSON")? {
                Value::Object(patch) => patch,
                other => bail!("Expected a JSON object, got {other}"),
            };
            let document = db.document(doc)?;
            let saved = document
                .update(|draft| {
                    // Writing over a tombstone resurrects the document.
                    let resurrect = draft.is_deleted();
                    draft.set_deleted(false);
                    match merge(draft.properties_mut(), &patch) {
                        UpdateDecision::Cancel if resurrect => UpdateDecision::Save,
                        decision => decision,
                    }
                })
                .with_context(|| format!("Failed to update {document}"))?;
            match saved {
                Some(rev) => println!("{}", rev.id()),
                None => println!("unchanged"),
            }
        }
        Command::Delete { doc } => {
            let document = db.document(doc)?;
            match document
                .remove(Deletion::Tombstone)
                .with_context(|| format!("Failed to delete {document}"))?
            {
                Removal::Tombstoned(tombstone) => println!("{}", tombstone.id()),
                Removal::Purged => {}
            }
        }
        Command::Purge { doc } => {
            let document = db.document(doc)?;
            document
                .purge()
                .with_context(|| format!("Failed to purge {document}"))?;
            println!("purged {}", document.abbreviated_id());
        }
        Command::History { doc } => {
            let document = db.document(doc)?;
            match document.revision_history()? {
                Some(history) => print_revisions(&history),
                None => bail!("{document} not found"),
            }
        }
        Command::Leaves { doc, live } => {
            print_revisions(&db.document(doc)?.leaf_revisions_filtered(!live)?);
        }
        Command::Conflicts { doc } => {
            print_revisions(&db.document(doc)?.conflicting_revisions()?);
        }
        Command::Abbrev { .. } | Command::Compare { .. } => {}
    }
    Ok(())
}

/// Apply a patch to a draft. `null` removes a key. Cancels when nothing
/// would change.
fn merge(properties: &mut Properties, patch: &Properties) -> UpdateDecision {
    let mut changed = false;
    for (key, value) in patch {
        if value.is_null() {
            changed |= properties.remove(key).is_some();
        } else if properties.get(key) != Some(value) {
            properties.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    UpdateDecision::from(changed)
}

fn print_revisions(revisions: &[Arc<Revision>]) {
    for rev in revisions {
        if rev.is_deleted() {
            println!("{}\tdeleted", rev.id());
        } else {
            println!("{}", rev.id());
        }
    }
}
