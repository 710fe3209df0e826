//! Revision identifiers.
//!
//! A revision ID is a `(generation, hash)` pair serialized as
//! `"<generation>-<hash>"`. The generation counts the depth of the revision
//! in its tree (roots are generation 1); the hash is opaque.
//!
//! IDs are totally ordered: generation first, then hash lexicographically.
//! The greater ID is the one that wins when a store has to pick between
//! otherwise equivalent leaves.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A totally ordered revision identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RevisionId {
    generation: u64,
    hash: String,
}

impl RevisionId {
    /// Create a revision ID from its parts.
    ///
    /// # Errors
    ///
    /// Returns error if the generation is zero or the hash is empty.
    pub fn new(generation: u64, hash: impl Into<String>) -> Result<Self, RevisionIdError> {
        let hash = hash.into();
        if generation == 0 {
            return Err(RevisionIdError::ZeroGeneration);
        }
        if hash.is_empty() {
            return Err(RevisionIdError::EmptyHash);
        }
        Ok(Self { generation, hash })
    }

    /// Create a generation-1 ID for a tree root.
    ///
    /// # Errors
    ///
    /// Returns error if the hash is empty.
    pub fn root(hash: impl Into<String>) -> Result<Self, RevisionIdError> {
        Self::new(1, hash)
    }

    /// Create the ID of a child of this revision.
    ///
    /// # Errors
    ///
    /// Returns error if the hash is empty or the generation would overflow.
    pub fn next(&self, hash: impl Into<String>) -> Result<Self, RevisionIdError> {
        let generation = self
            .generation
            .checked_add(1)
            .ok_or(RevisionIdError::GenerationOverflow)?;
        Self::new(generation, hash)
    }

    /// Depth of the revision in its tree.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Opaque hash suffix.
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl Ord for RevisionId {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.generation.cmp(&other.generation) {
            Ordering::Equal => {}
            ord => return ord,
        }
        self.hash.cmp(&other.hash)
    }
}

impl PartialOrd for RevisionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.hash)
    }
}

impl FromStr for RevisionId {
    type Err = RevisionIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (generation, hash) = s
            .split_once('-')
            .ok_or_else(|| RevisionIdError::MissingSeparator(s.to_string()))?;
        let generation = generation
            .parse::<u64>()
            .map_err(|_| RevisionIdError::InvalidGeneration(s.to_string()))?;
        Self::new(generation, hash)
    }
}

impl Serialize for RevisionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RevisionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Errors produced when building or parsing a revision ID.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RevisionIdError {
    /// No `-` between generation and hash
    #[error("malformed revision ID '{0}': missing '-' separator")]
    MissingSeparator(String),
    /// Generation prefix is not a number
    #[error("malformed revision ID '{0}': invalid generation")]
    InvalidGeneration(String),
    /// Generation 0 is never valid
    #[error("revision generation must be at least 1")]
    ZeroGeneration,
    /// Hash suffix is empty
    #[error("revision hash must not be empty")]
    EmptyHash,
    /// Child generation does not fit in a u64
    #[error("revision generation overflow")]
    GenerationOverflow,
}
