//! Durable record of every scan run.
//!
//! `transition` is the only way a run's state changes. It validates the move
//! against the state table and persists the new state together with its patch
//! in a single transaction, so a reader never sees counts without findings or
//! a terminal state without its diagnostics.

use super::db::{DbHandle, now_unix};
use super::models::*;
use crate::errors::WatchmanError;

/// Failure diagnostics attached when a run moves to `failed`.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureInfo {
    /// `None` when the failure happened outside a stage (panic, crash recovery).
    pub stage: Option<StageName>,
    pub kind: String,
    pub message: String,
}

/// Data written alongside a state transition. Unset fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    /// Analyzer output. Inserting it also writes the severity counts, once.
    pub findings: Option<Vec<RawFinding>>,
    pub assessment: Option<Assessment>,
    pub enrichment_skipped: Option<bool>,
    pub failure: Option<FailureInfo>,
    pub skip_reason: Option<String>,
    pub issue: Option<FiledIssue>,
    pub stage_timing: Option<StageTiming>,
    pub duration_ms: Option<i64>,
}

impl RunPatch {
    pub fn timing(timing: StageTiming) -> Self {
        Self {
            stage_timing: Some(timing),
            ..Default::default()
        }
    }
}

#[derive(Clone)]
pub struct RunLedger {
    db: DbHandle,
}

impl RunLedger {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    /// Insert a pending run with no lease. Admission normally goes through
    /// `LoopGuard::admit`, which creates the run and lease together.
    pub async fn create(&self, trigger: Trigger) -> Result<Run, WatchmanError> {
        let run = self
            .db
            .call(move |db| db.create_run(&trigger))
            .await
            .map_err(WatchmanError::Database)?;
        Ok(run)
    }

    pub async fn transition(
        &self,
        run_id: i64,
        next: RunState,
        patch: RunPatch,
    ) -> Result<Run, WatchmanError> {
        let result = self
            .db
            .call(move |db| Ok(db.apply_transition(run_id, next, &patch)))
            .await
            .map_err(WatchmanError::Database)?;
        let run = result?;
        tracing::debug!(run_id, state = %run.state, "run transitioned");
        Ok(run)
    }

    /// Restart the lease clock for a run, e.g. when a worker picks it up.
    pub async fn renew_lease(&self, run_id: i64) -> Result<bool, WatchmanError> {
        self.db
            .call(move |db| db.renew_lease(run_id, now_unix()))
            .await
            .map_err(WatchmanError::Database)
    }

    /// `None` for an unknown id.
    pub async fn get(&self, run_id: i64) -> Result<Option<Run>, WatchmanError> {
        self.db
            .call(move |db| db.get_run(run_id))
            .await
            .map_err(WatchmanError::Database)
    }

    /// Like `get`, but an unknown id is `RunNotFound`.
    pub async fn require(&self, run_id: i64) -> Result<Run, WatchmanError> {
        self.get(run_id)
            .await?
            .ok_or(WatchmanError::RunNotFound { id: run_id })
    }

    /// Newest first.
    pub async fn list(&self, filter: RunFilter, limit: i64) -> Result<Vec<Run>, WatchmanError> {
        if limit < 1 {
            return Err(WatchmanError::BadRequest(format!(
                "limit must be positive, got {}",
                limit
            )));
        }
        self.db
            .call(move |db| db.list_runs(&filter, limit))
            .await
            .map_err(WatchmanError::Database)
    }

    pub async fn findings(&self, run_id: i64) -> Result<Vec<Finding>, WatchmanError> {
        self.db
            .call(move |db| db.get_findings(run_id))
            .await
            .map_err(WatchmanError::Database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::db::ScanDb;

    fn ledger() -> RunLedger {
        RunLedger::new(DbHandle::new(ScanDb::new_in_memory().unwrap()))
    }

    fn trigger() -> Trigger {
        Trigger {
            repo: "acme/api".into(),
            branch: "main".into(),
            commit_sha: "abc123".into(),
            label: "Add endpoint".into(),
            pusher: "octocat".into(),
            source: TriggerSource::Manual,
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let ledger = ledger();
        let run = ledger.create(trigger()).await.unwrap();
        let fetched = ledger.require(run.id).await.unwrap();
        assert_eq!(fetched.state, RunState::Pending);
        assert_eq!(fetched.source, TriggerSource::Manual);
        assert_eq!(fetched.commit_label, "Add endpoint");
    }

    #[tokio::test]
    async fn test_get_missing_run() {
        let ledger = ledger();
        assert!(ledger.get(404).await.unwrap().is_none());
        let err = ledger.require(404).await.unwrap_err();
        assert!(matches!(err, WatchmanError::RunNotFound { id: 404 }));
    }

    #[tokio::test]
    async fn test_transition_through_happy_path() {
        let ledger = ledger();
        let run = ledger.create(trigger()).await.unwrap();
        for state in [
            RunState::Cloning,
            RunState::Analyzing,
            RunState::Assessing,
            RunState::Filing,
            RunState::Notifying,
            RunState::Completed,
        ] {
            let updated = ledger
                .transition(run.id, state, RunPatch::default())
                .await
                .unwrap();
            assert_eq!(updated.state, state);
        }
        let done = ledger.require(run.id).await.unwrap();
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_transition_from_terminal_is_rejected() {
        let ledger = ledger();
        let run = ledger.create(trigger()).await.unwrap();
        ledger
            .transition(run.id, RunState::Skipped, RunPatch::default())
            .await
            .unwrap();
        let err = ledger
            .transition(run.id, RunState::Cloning, RunPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WatchmanError::RunTerminal { .. }));
    }

    #[tokio::test]
    async fn test_list_respects_limit() {
        let ledger = ledger();
        for _ in 0..3 {
            ledger.create(trigger()).await.unwrap();
        }
        let runs = ledger.list(RunFilter::default(), 2).await.unwrap();
        assert_eq!(runs.len(), 2);
    }

    #[tokio::test]
    async fn test_list_rejects_non_positive_limit() {
        let err = ledger().list(RunFilter::default(), 0).await.unwrap_err();
        assert!(matches!(err, WatchmanError::BadRequest(_)));
    }
}
