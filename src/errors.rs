//! Typed error hierarchy for Watchman.
//!
//! Two top-level enums cover the two failure domains:
//! - `StageError`: one externally-delegated stage failed (timeout, transient, fatal)
//! - `WatchmanError`: ledger, storage and API failures
//!
//! Guard rejections and scheduler backpressure are outcomes, not errors; see
//! `scan::models::RejectReason` and `scan::scheduler::SubmitOutcome`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a stage failure, persisted on failed runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    Timeout,
    TransientFailure,
    FatalFailure,
}

impl StageErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::TransientFailure => "transient_failure",
            Self::FatalFailure => "fatal_failure",
        }
    }
}

/// Failure of a single stage invocation.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    #[error("Stage timed out after {0:?}")]
    Timeout(Duration),

    /// Retryable: rate limiting, connection reset, 5xx.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Not retryable: authentication, validation, unparseable output.
    #[error("Fatal failure: {0}")]
    Fatal(String),
}

impl StageError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn kind(&self) -> StageErrorKind {
        match self {
            Self::Timeout(_) => StageErrorKind::Timeout,
            Self::Transient(_) => StageErrorKind::TransientFailure,
            Self::Fatal(_) => StageErrorKind::FatalFailure,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors from the ledger, storage and HTTP layers.
#[derive(Debug, Error)]
pub enum WatchmanError {
    #[error("Scan run {id} not found")]
    RunNotFound { id: i64 },

    #[error("Invalid transition for run {id}: {from} -> {to}")]
    InvalidTransition {
        id: i64,
        from: String,
        to: String,
    },

    #[error("Scan run {id} is already terminal ({state})")]
    RunTerminal { id: i64, state: String },

    #[error("Finding counts for run {id} were already written")]
    CountsAlreadyWritten { id: i64 },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for WatchmanError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.into())
    }
}
