//! Optimistic-concurrency update loop.
//!
//! ```text
//!   Drafting ──updater: Cancel──▶ Aborted
//!      │ Save
//!      ▼
//!   Committing ──ok──▶ Done
//!      │ Conflict           │ other error
//!      ▼                    ▼
//!   ConflictRetry ──bound hit──▶ Failed
//!      │ invalidate cached revision
//!      └──────────▶ Drafting
//! ```
//!
//! The updater may run several times and must only touch the draft it is
//! handed. There is no timeout; callers that need one either set a
//! [`RetryPolicy`] bound or return [`UpdateDecision::Cancel`] themselves.

use crate::document::Document;
use crate::error::{Error, Result};
use crate::revision::{NewRevision, Revision};
use std::num::NonZeroU32;
use std::sync::Arc;

/// What the updater wants done with the draft it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateDecision {
    /// Commit the draft
    Save,
    /// Stop without committing
    Cancel,
}

impl From<bool> for UpdateDecision {
    fn from(save: bool) -> Self {
        if save {
            UpdateDecision::Save
        } else {
            UpdateDecision::Cancel
        }
    }
}

/// Bound on commit attempts made by [`Document::update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: Option<NonZeroU32>,
}

impl RetryPolicy {
    /// Retry on conflict until a commit succeeds.
    pub const UNBOUNDED: Self = Self { max_attempts: None };

    /// Give up after `max_attempts` commit attempts.
    #[must_use]
    pub fn bounded(max_attempts: NonZeroU32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
        }
    }

    /// The configured bound, if any.
    #[must_use]
    pub fn max_attempts(&self) -> Option<NonZeroU32> {
        self.max_attempts
    }

    fn allows_another_after(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max.get())
    }
}

enum UpdateState<'a> {
    Drafting,
    Committing(NewRevision<'a>),
    Done(Arc<Revision>),
    ConflictRetry(Error),
    Aborted,
    Failed(Error),
}

/// Drive the update state machine to completion.
pub(crate) fn run<F>(
    document: &Document,
    policy: RetryPolicy,
    mut updater: F,
) -> Result<Option<Arc<Revision>>>
where
    F: FnMut(&mut NewRevision<'_>) -> UpdateDecision,
{
    let mut attempts: u32 = 0;
    let mut state = UpdateState::Drafting;
    loop {
        state = match state {
            UpdateState::Drafting => match document.new_revision() {
                Ok(mut draft) => match updater(&mut draft) {
                    UpdateDecision::Save => UpdateState::Committing(draft),
                    UpdateDecision::Cancel => UpdateState::Aborted,
                },
                Err(err) => UpdateState::Failed(err),
            },
            UpdateState::Committing(draft) => {
                attempts = attempts.saturating_add(1);
                match draft.save() {
                    Ok(saved) => UpdateState::Done(saved),
                    Err(err) if err.is_conflict() => UpdateState::ConflictRetry(err),
                    Err(err) => UpdateState::Failed(err),
                }
            }
            UpdateState::ConflictRetry(err) => {
                // The next draft must be parented on the fresh winner.
                document.invalidate_current_revision();
                if policy.allows_another_after(attempts) {
                    tracing::debug!(
                        doc_id = %document.id(),
                        attempts,
                        "Update conflicted, retrying"
                    );
                    UpdateState::Drafting
                } else {
                    tracing::warn!(
                        doc_id = %document.id(),
                        attempts,
                        "Update gave up after repeated conflicts"
                    );
                    UpdateState::Failed(err)
                }
            }
            UpdateState::Done(saved) => return Ok(Some(saved)),
            UpdateState::Aborted => return Ok(None),
            UpdateState::Failed(err) => return Err(err),
        };
    }
}
