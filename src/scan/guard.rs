use std::time::Duration;

use anyhow::Result;

use super::db::{DbHandle, now_unix};
use super::models::{Admission, RejectReason, Trigger};

/// Prefixes reserved for this system's own remediation output.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub branch_prefix: String,
    /// Matched case-insensitively against the start of the commit label.
    pub commit_prefix: String,
    /// Ceiling after which an unreleased lease counts as absent. The clock
    /// restarts when a worker picks the run up and on every stage transition.
    pub lease_ttl: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            branch_prefix: "security-fixes-".to_string(),
            commit_prefix: "security:".to_string(),
            lease_ttl: Duration::from_secs(900),
        }
    }
}

/// Decides whether a trigger may start a run.
///
/// The two prefix rules only look at the trigger. The duplicate and
/// already-processed rules, the lease creation and the run insert happen in
/// one database transaction, so two racing triggers for the same commit
/// cannot both be accepted.
#[derive(Clone)]
pub struct LoopGuard {
    config: GuardConfig,
    db: DbHandle,
}

impl LoopGuard {
    pub fn new(config: GuardConfig, db: DbHandle) -> Self {
        Self { config, db }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Rules 1 and 2: rejections decidable from trigger metadata alone.
    pub fn check_self_generated(&self, trigger: &Trigger) -> Option<RejectReason> {
        if trigger.branch.starts_with(&self.config.branch_prefix) {
            return Some(RejectReason::SelfGeneratedBranch);
        }
        let label = trigger.label.trim_start().to_lowercase();
        if label.starts_with(&self.config.commit_prefix.to_lowercase()) {
            return Some(RejectReason::SelfGeneratedCommit);
        }
        None
    }

    pub async fn admit(&self, trigger: &Trigger) -> Result<Admission> {
        if let Some(reason) = self.check_self_generated(trigger) {
            let t = trigger.clone();
            self.db.call(move |db| db.record_rejection(&t, reason)).await?;
            log_rejection(trigger, reason);
            return Ok(Admission::Rejected(reason));
        }

        let t = trigger.clone();
        let ttl = self.config.lease_ttl.as_secs() as i64;
        let admission = self.db.call(move |db| db.admit(&t, now_unix(), ttl)).await?;

        match &admission {
            Admission::Accepted(run) => tracing::info!(
                run_id = run.id,
                repo = %trigger.repo,
                commit = %trigger.commit_sha,
                branch = %trigger.branch,
                "trigger admitted"
            ),
            Admission::Rejected(reason) => log_rejection(trigger, *reason),
        }
        Ok(admission)
    }

    /// Rules 3 and 4 for a trigger that cannot be queued. Never creates a run.
    pub async fn known_rejection(&self, trigger: &Trigger) -> Result<Option<RejectReason>> {
        let t = trigger.clone();
        let reason = self
            .db
            .call(move |db| db.known_rejection(&t, now_unix()))
            .await?;
        if let Some(reason) = reason {
            log_rejection(trigger, reason);
        }
        Ok(reason)
    }
}

fn log_rejection(trigger: &Trigger, reason: RejectReason) {
    tracing::info!(
        repo = %trigger.repo,
        commit = %trigger.commit_sha,
        branch = %trigger.branch,
        reason = %reason,
        "trigger rejected"
    );
}
