//! # Error Taxonomy
//!
//! Typed failures shared by adapters, stage processors, the pipeline store
//! and the orchestrator.
//!
//! - `AdapterError` / `StageError`: transient (retried) vs permanent (run fails)
//! - `StoreError`: conflicts and stale writes detected by the pipeline store
//! - `WorkflowError`: what orchestrator callers see

use crate::state::ProjectId;
use crate::workflow::Stage;
use thiserror::Error;

/// Outcome classification reported by every capability adapter call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    /// Network, timeout or rate-limit failure. Safe to retry.
    #[error("transient adapter failure: {0}")]
    Transient(String),
    /// Malformed request, contract violation, or a non-idempotent call
    /// whose outcome is unknown. Never retried.
    #[error("permanent adapter failure: {0}")]
    Permanent(String),
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Transient(r) | Self::Permanent(r) => r,
        }
    }
}

/// Verdict of a failed stage invocation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageError {
    #[error("transient stage failure: {0}")]
    Transient(String),
    #[error("permanent stage failure: {0}")]
    Permanent(String),
}

impl StageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Transient(r) | Self::Permanent(r) => r,
        }
    }
}

impl From<AdapterError> for StageError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Transient(r) => StageError::Transient(r),
            AdapterError::Permanent(r) => StageError::Permanent(r),
        }
    }
}

/// Errors raised by the pipeline store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The project's active run is in the middle of committing a stage.
    #[error("project {0} has a run mid-stage-commit")]
    AlreadyActiveConflict(ProjectId),

    /// The attempt targets a stage the run is no longer on.
    #[error("stale attempt for run {run_id}: run is at {current}, attempt declared {declared}")]
    StaleRun {
        run_id: String,
        current: String,
        declared: Stage,
    },

    /// The (stage, attempt number) pair was already recorded.
    #[error("attempt {attempt} of stage {stage} already recorded for run {run_id}")]
    DuplicateAttempt {
        run_id: String,
        stage: Stage,
        attempt: u32,
    },

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("run {0} is archived and can no longer change")]
    RunTerminal(String),

    #[error("run {run_id} cannot be resumed: {reason}")]
    NotResumable { run_id: String, reason: String },

    #[error("action item not found: {0}")]
    ActionItemNotFound(String),

    #[error("action item {id} is already {status}")]
    ActionItemClosed { id: String, status: String },

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

impl StoreError {
    /// Conflicts are races between concurrent writers, not data problems.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::AlreadyActiveConflict(_) | Self::StaleRun { .. } | Self::DuplicateAttempt { .. }
        )
    }
}

/// Errors surfaced to orchestrator callers (API, CLI, scheduler).
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Create-or-resume kept conflicting with an in-flight commit.
    #[error("project {0} is busy; trigger could not be coalesced, retry later")]
    Conflict(ProjectId),

    #[error("no processor registered for stage {0}")]
    MissingProcessor(Stage),
}

impl WorkflowError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::RunNotFound(_)) | Self::Store(StoreError::ActionItemNotFound(_))
        )
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::Store(e) => {
                e.is_conflict()
                    || matches!(
                        e,
                        StoreError::NotResumable { .. }
                            | StoreError::RunTerminal(_)
                            | StoreError::ActionItemClosed { .. }
                    )
            }
            Self::MissingProcessor(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_error_maps_to_stage_error() {
        let transient: StageError = AdapterError::Transient("rate limited".into()).into();
        assert!(transient.is_transient());
        assert_eq!(transient.reason(), "rate limited");

        let permanent: StageError = AdapterError::Permanent("bad request".into()).into();
        assert!(!permanent.is_transient());
    }

    #[test]
    fn test_conflict_classification() {
        let err = WorkflowError::Store(StoreError::AlreadyActiveConflict(7));
        assert!(err.is_conflict());
        assert!(!err.is_not_found());

        let err = WorkflowError::Store(StoreError::RunNotFound("r1".into()));
        assert!(err.is_not_found());
        assert!(!err.is_conflict());
    }
}
