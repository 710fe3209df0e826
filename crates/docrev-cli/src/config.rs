//! CLI configuration.

use anyhow::{bail, Context, Result};
use docrev_core::{DatabaseOptions, RetryPolicy};
use std::num::NonZeroU32;
use std::path::PathBuf;

/// Which revision store backs the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// `SQLite` file at [`CliConfig::db_path`]
    Sqlite,
    /// Process-local, discarded on exit
    Memory,
}

/// CLI configuration.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Store type
    pub store: StoreKind,

    /// Database path (for `SQLite`)
    pub db_path: PathBuf,

    /// Commit attempts per update, unbounded if `None`
    pub max_update_attempts: Option<NonZeroU32>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            store: StoreKind::Sqlite,
            db_path: PathBuf::from("./docrev.db"),
            max_update_attempts: None,
        }
    }
}

impl CliConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DOCREV_DB_PATH`: SQLite database path
    /// - `DOCREV_STORE`: "sqlite" or "memory"
    /// - `DOCREV_MAX_UPDATE_ATTEMPTS`: positive integer
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an invalid value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(db_path) = lookup("DOCREV_DB_PATH") {
            config.db_path = PathBuf::from(db_path);
        }

        if let Some(store) = lookup("DOCREV_STORE") {
            config.store = match store.to_ascii_lowercase().as_str() {
                "sqlite" => StoreKind::Sqlite,
                "memory" => StoreKind::Memory,
                other => bail!("Invalid DOCREV_STORE: {other} (expected sqlite or memory)"),
            };
        }

        if let Some(attempts) = lookup("DOCREV_MAX_UPDATE_ATTEMPTS") {
            let attempts: NonZeroU32 = attempts
                .trim()
                .parse()
                .context("Invalid DOCREV_MAX_UPDATE_ATTEMPTS")?;
            config.max_update_attempts = Some(attempts);
        }

        Ok(config)
    }

    /// Database options derived from this configuration.
    #[must_use]
    pub fn database_options(&self) -> DatabaseOptions {
        DatabaseOptions {
            retry: self
                .max_update_attempts
                .map_or(RetryPolicy::UNBOUNDED, RetryPolicy::bounded),
        }
    }
}
