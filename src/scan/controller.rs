//! Pipeline controller: drives one admitted run through its stages.
//!
//! ```text
//! pending ─verify─▶ cloning ─clone─▶ analyzing ─analyze─▶ assessing ─assess─▶ filing ─file─▶ notifying ─notify─▶ completed
//!    │                                   │                     (degrades on error)
//!    └─▶ skipped (commit gone)           └─▶ completed (zero findings)
//! any non-terminal state ─stage error─▶ failed
//! ```
//!
//! Stages never touch the ledger. Each returns a typed outcome through the
//! executor and the controller applies it with a single `transition` call.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use super::executor::{self, RetryPolicy, StageOutcome};
use super::ledger::{FailureInfo, RunLedger, RunPatch};
use super::models::*;
use crate::errors::{StageError, WatchmanError};
use crate::integrations::{Collaborators, report};

pub const SKIP_COMMIT_NOT_FOUND: &str = "commit_not_found";

/// Wall-clock ceiling per stage, retries included.
#[derive(Debug, Clone, PartialEq)]
pub struct StageTimeouts {
    pub verify: Duration,
    pub clone: Duration,
    pub analyze: Duration,
    pub assess: Duration,
    pub file: Duration,
    pub notify: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            verify: Duration::from_secs(30),
            clone: Duration::from_secs(300),
            analyze: Duration::from_secs(600),
            assess: Duration::from_secs(180),
            file: Duration::from_secs(60),
            notify: Duration::from_secs(60),
        }
    }
}

impl StageTimeouts {
    pub fn longest(&self) -> Duration {
        [
            self.verify,
            self.clone,
            self.analyze,
            self.assess,
            self.file,
            self.notify,
        ]
        .into_iter()
        .max()
        .unwrap_or_default()
    }

    pub fn for_stage(&self, stage: StageName) -> Duration {
        match stage {
            StageName::Verify => self.verify,
            StageName::Clone => self.clone,
            StageName::Analyze => self.analyze,
            StageName::Assess => self.assess,
            StageName::File => self.file,
            StageName::Notify => self.notify,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub timeouts: StageTimeouts,
    /// Policy for source host, inference and relay calls.
    pub network_retry: RetryPolicy,
    pub issue_labels: Vec<String>,
    pub notify_recipients: Vec<String>,
    /// Parent directory for per-run clone directories; system temp when `None`.
    pub workdir_root: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            timeouts: StageTimeouts::default(),
            network_retry: RetryPolicy::network(),
            issue_labels: report::DEFAULT_ISSUE_LABELS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            notify_recipients: Vec::new(),
            workdir_root: None,
        }
    }
}

pub struct PipelineController {
    ledger: RunLedger,
    collaborators: Collaborators,
    config: ControllerConfig,
}

impl PipelineController {
    pub fn new(ledger: RunLedger, collaborators: Collaborators, config: ControllerConfig) -> Self {
        Self {
            ledger,
            collaborators,
            config,
        }
    }

    pub fn ledger(&self) -> &RunLedger {
        &self.ledger
    }

    /// Drive `run` from `pending` to a terminal state and return the final record.
    ///
    /// Stage failures end the run as `failed` and are not returned as errors.
    /// `Err` means the ledger itself could not be updated.
    pub async fn drive(&self, run: Run) -> Result<Run, WatchmanError> {
        let started = Instant::now();
        let run_id = run.id;
        tracing::info!(run_id, repo = %run.repo, commit = %run.commit_sha, "run started");

        // ── verify ──
        let source = &self.collaborators.source;
        let (repo, branch, sha) = (run.repo.as_str(), run.branch.as_str(), run.commit_sha.as_str());
        let outcome = self
            .stage(StageName::Verify, &self.config.network_retry, move |_| {
                source.commit_exists(repo, sha)
            })
            .await;
        match &outcome.result {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(run_id, "commit no longer exists, skipping");
                let patch = RunPatch {
                    skip_reason: Some(SKIP_COMMIT_NOT_FOUND.to_string()),
                    stage_timing: Some(outcome.timing_with("skipped")),
                    duration_ms: Some(elapsed_ms(started)),
                    ..Default::default()
                };
                return self.ledger.transition(run_id, RunState::Skipped, patch).await;
            }
            Err(e) => return self.fail(run_id, &outcome, e, started).await,
        }
        self.ledger
            .transition(run_id, RunState::Cloning, RunPatch::timing(outcome.timing()))
            .await?;

        // ── clone ──
        // The directory is worker-exclusive and removed when `workdir` drops,
        // on every exit path below.
        let workdir = match self.make_workdir() {
            Ok(dir) => dir,
            Err(e) => {
                let err = StageError::fatal(format!("Failed to create clone directory: {}", e));
                let outcome = StageOutcome::<()> {
                    stage: StageName::Clone,
                    result: Err(err.clone()),
                    attempts: 0,
                    started_at: super::db::now_rfc3339(),
                    elapsed: Duration::ZERO,
                };
                return self.fail(run_id, &outcome, &err, started).await;
            }
        };
        let checkout = workdir.path().join("checkout");
        let checkout_path = checkout.as_path();
        let outcome = self
            .stage(StageName::Clone, &self.config.network_retry, move |_| {
                source.clone_repo(repo, branch, sha, checkout_path)
            })
            .await;
        if let Err(e) = &outcome.result {
            return self.fail(run_id, &outcome, e, started).await;
        }
        self.ledger
            .transition(run_id, RunState::Analyzing, RunPatch::timing(outcome.timing()))
            .await?;

        // ── analyze ──
        let analyzer = &self.collaborators.analyzer;
        let outcome = self
            .stage(StageName::Analyze, &RetryPolicy::none(), move |_| {
                analyzer.analyze(checkout_path)
            })
            .await;
        drop(workdir);
        let raw = match &outcome.result {
            Ok(findings) => findings.clone(),
            Err(e) => return self.fail(run_id, &outcome, e, started).await,
        };

        if raw.is_empty() {
            tracing::info!(run_id, "no findings, completing");
            let patch = RunPatch {
                findings: Some(Vec::new()),
                stage_timing: Some(outcome.timing()),
                duration_ms: Some(elapsed_ms(started)),
                ..Default::default()
            };
            return self.ledger.transition(run_id, RunState::Completed, patch).await;
        }

        let counts = SeverityCounts::from_severities(raw.iter().map(|f| &f.severity));
        tracing::info!(
            run_id,
            critical = counts.critical,
            high = counts.high,
            medium = counts.medium,
            low = counts.low,
            "analysis complete"
        );
        let run = self
            .ledger
            .transition(
                run_id,
                RunState::Assessing,
                RunPatch {
                    findings: Some(raw),
                    stage_timing: Some(outcome.timing()),
                    ..Default::default()
                },
            )
            .await?;

        // ── assess (degrades, never fails the run) ──
        let findings = self.ledger.findings(run_id).await?;
        let assessment = self.assess(&run, &findings).await?;

        // ── file ──
        let findings = self.ledger.findings(run_id).await?;
        let draft = report::build_issue(
            &run,
            &findings,
            assessment.as_ref(),
            &self.config.issue_labels,
        );
        let draft = &draft;
        let outcome = self
            .stage(StageName::File, &self.config.network_retry, move |_| {
                source.create_issue(repo, draft)
            })
            .await;
        let issue = match &outcome.result {
            Ok(issue) => issue.clone(),
            Err(e) => return self.fail(run_id, &outcome, e, started).await,
        };
        tracing::info!(run_id, issue = issue.number, url = %issue.url, "issue filed");
        let run = self
            .ledger
            .transition(
                run_id,
                RunState::Notifying,
                RunPatch {
                    issue: Some(issue.clone()),
                    stage_timing: Some(outcome.timing()),
                    ..Default::default()
                },
            )
            .await?;

        // ── notify ──
        let notification = report::build_notification(
            &run,
            &counts,
            Some(&issue),
            assessment.as_ref(),
            &self.config.notify_recipients,
        );
        let notifier = &self.collaborators.notifier;
        let notification = &notification;
        let outcome = self
            .stage(StageName::Notify, &self.config.network_retry, move |_| {
                notifier.notify(notification)
            })
            .await;
        if let Err(e) = &outcome.result {
            return self.fail(run_id, &outcome, e, started).await;
        }

        let patch = RunPatch {
            stage_timing: Some(outcome.timing()),
            duration_ms: Some(elapsed_ms(started)),
            ..Default::default()
        };
        let run = self.ledger.transition(run_id, RunState::Completed, patch).await?;
        tracing::info!(
            run_id,
            duration_ms = run.duration_ms.unwrap_or(0),
            enrichment_skipped = run.enrichment_skipped,
            "run completed"
        );
        Ok(run)
    }

    /// Run the assessment stage and move to `filing` either way.
    async fn assess(
        &self,
        run: &Run,
        findings: &[Finding],
    ) -> Result<Option<Assessment>, WatchmanError> {
        let Some(assessor) = &self.collaborators.assessor else {
            tracing::info!(run_id = run.id, "no assessor configured, enrichment skipped");
            let patch = RunPatch {
                enrichment_skipped: Some(true),
                ..Default::default()
            };
            self.ledger.transition(run.id, RunState::Filing, patch).await?;
            return Ok(None);
        };

        let source = &self.collaborators.source;
        let outcome = self
            .stage(StageName::Assess, &self.config.network_retry, move |_| async move {
                let context = match source
                    .repo_context(&run.repo, &run.branch, &run.commit_sha)
                    .await
                {
                    Ok(ctx) => ctx,
                    Err(e) => {
                        tracing::debug!(error = %e, "repository context unavailable");
                        RepoContext {
                            repo: run.repo.clone(),
                            branch: run.branch.clone(),
                            commit_sha: run.commit_sha.clone(),
                            ..Default::default()
                        }
                    }
                };
                assessor.assess(findings, &context).await
            })
            .await;

        match outcome.result {
            Ok(ref assessment) => {
                let patch = RunPatch {
                    assessment: Some(assessment.clone()),
                    enrichment_skipped: Some(false),
                    stage_timing: Some(outcome.timing()),
                    ..Default::default()
                };
                self.ledger.transition(run.id, RunState::Filing, patch).await?;
                Ok(Some(assessment.clone()))
            }
            Err(ref e) => {
                tracing::warn!(
                    run_id = run.id,
                    kind = e.kind().as_str(),
                    error = %e,
                    "assessment failed, filing unenriched findings"
                );
                let patch = RunPatch {
                    enrichment_skipped: Some(true),
                    stage_timing: Some(outcome.timing_with(format!("degraded:{}", e.kind().as_str()))),
                    ..Default::default()
                };
                self.ledger.transition(run.id, RunState::Filing, patch).await?;
                Ok(None)
            }
        }
    }

    async fn stage<T, F, Fut>(
        &self,
        stage: StageName,
        policy: &RetryPolicy,
        op: F,
    ) -> StageOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T, StageError>>,
    {
        executor::execute(stage, self.config.timeouts.for_stage(stage), policy, op).await
    }

    async fn fail<T>(
        &self,
        run_id: i64,
        outcome: &StageOutcome<T>,
        err: &StageError,
        started: Instant,
    ) -> Result<Run, WatchmanError> {
        tracing::error!(
            run_id,
            stage = %outcome.stage,
            kind = err.kind().as_str(),
            attempts = outcome.attempts,
            error = %err,
            "run failed"
        );
        let patch = RunPatch {
            failure: Some(FailureInfo {
                stage: Some(outcome.stage),
                kind: err.kind().as_str().to_string(),
                message: err.to_string(),
            }),
            stage_timing: Some(outcome.timing()),
            duration_ms: Some(elapsed_ms(started)),
            ..Default::default()
        };
        self.ledger.transition(run_id, RunState::Failed, patch).await
    }

    fn make_workdir(&self) -> std::io::Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("watchman-scan-");
        match &self.config.workdir_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    started.elapsed().as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::fakes::*;
    use crate::scan::db::{DbHandle, ScanDb};
    use crate::scan::guard::{GuardConfig, LoopGuard};

    struct Harness {
        controller: PipelineController,
        guard: LoopGuard,
        fakes: FakeSet,
        _workroot: tempfile::TempDir,
    }

    fn harness(fakes: FakeSet) -> Harness {
        harness_with(fakes, StageTimeouts::default())
    }

    fn harness_with(fakes: FakeSet, timeouts: StageTimeouts) -> Harness {
        let db = DbHandle::new(ScanDb::new_in_memory().unwrap());
        let workroot = tempfile::tempdir().unwrap();
        let config = ControllerConfig {
            timeouts,
            network_retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            notify_recipients: vec!["security@acme.io".into()],
            workdir_root: Some(workroot.path().to_path_buf()),
            ..Default::default()
        };
        Harness {
            controller: PipelineController::new(
                RunLedger::new(db.clone()),
                fakes.collaborators(),
                config,
            ),
            guard: LoopGuard::new(GuardConfig::default(), db),
            fakes,
            _workroot: workroot,
        }
    }

    fn trigger() -> Trigger {
        Trigger {
            repo: "acme/api".into(),
            branch: "main".into(),
            commit_sha: "abc123".into(),
            label: "Add login endpoint".into(),
            pusher: "octocat".into(),
            source: TriggerSource::Webhook,
        }
    }

    async fn admit(h: &Harness) -> Run {
        match h.guard.admit(&trigger()).await.unwrap() {
            Admission::Accepted(run) => run,
            other => panic!("expected acceptance, got {:?}", other),
        }
    }

    fn three_findings() -> Vec<RawFinding> {
        vec![
            raw_finding(Severity::Critical, "sql-injection"),
            raw_finding(Severity::Medium, "weak-hash"),
            raw_finding(Severity::Medium, "insecure-cookie"),
        ]
    }

    #[tokio::test]
    async fn test_happy_path_completes_with_counts_and_one_issue() {
        let h = harness(FakeSet::new(three_findings()));
        let run = admit(&h).await;
        let done = h.controller.drive(run).await.unwrap();

        assert_eq!(done.state, RunState::Completed);
        let counts = done.counts.unwrap();
        assert_eq!(
            counts,
            SeverityCounts {
                critical: 1,
                high: 0,
                medium: 2,
                low: 0
            }
        );
        assert!(!done.enrichment_skipped);
        assert_eq!(h.fakes.source.issues().len(), 1);
        assert_eq!(done.issue_number, Some(1));
        assert_eq!(h.fakes.notifier.sent().len(), 1);

        let findings = h.controller.ledger().findings(done.id).await.unwrap();
        assert_eq!(findings.len() as i64, counts.total());
        assert!(findings.iter().all(|f| f.risk_annotation.is_some()));

        let stages: Vec<StageName> = done.stage_timings.iter().map(|t| t.stage).collect();
        assert_eq!(
            stages,
            vec![
                StageName::Verify,
                StageName::Clone,
                StageName::Analyze,
                StageName::Assess,
                StageName::File,
                StageName::Notify
            ]
        );
    }

    #[tokio::test]
    async fn test_lease_released_on_completion() {
        let h = harness(FakeSet::new(three_findings()));
        let run = admit(&h).await;
        h.controller.drive(run).await.unwrap();

        let lease = h
            .controller
            .ledger()
            .db()
            .call(|db| db.get_lease("acme/api", "abc123"))
            .await
            .unwrap();
        assert!(lease.is_none());
        assert!(matches!(
            h.guard.admit(&trigger()).await.unwrap(),
            Admission::Rejected(RejectReason::AlreadyProcessed)
        ));
    }

    #[tokio::test]
    async fn test_zero_findings_skip_filing() {
        let h = harness(FakeSet::new(vec![]));
        let run = admit(&h).await;
        let done = h.controller.drive(run).await.unwrap();

        assert_eq!(done.state, RunState::Completed);
        assert_eq!(done.counts, Some(SeverityCounts::default()));
        assert!(h.fakes.source.issues().is_empty());
        assert!(h.fakes.notifier.sent().is_empty());
        assert_eq!(h.fakes.assessor.as_ref().unwrap().calls(), 0);
        assert!(h.controller.ledger().findings(done.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_assessment_failure_degrades() {
        let fakes = FakeSet::new(three_findings()).with_assessor(Some(FakeAssessor::failing(
            "fake",
            StageError::transient("503 upstream"),
        )));
        let h = harness(fakes);
        let run = admit(&h).await;
        let done = h.controller.drive(run).await.unwrap();

        assert_eq!(done.state, RunState::Completed);
        assert!(done.enrichment_skipped);
        assert_eq!(h.fakes.assessor.as_ref().unwrap().calls(), 3);
        let issues = h.fakes.source.issues();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].1.body.contains("AI enrichment unavailable"));
        let assess = done
            .stage_timings
            .iter()
            .find(|t| t.stage == StageName::Assess)
            .unwrap();
        assert_eq!(assess.outcome, "degraded:transient_failure");
    }

    #[tokio::test]
    async fn test_fatal_assessment_error_also_degrades() {
        let fakes = FakeSet::new(three_findings()).with_assessor(Some(FakeAssessor::failing(
            "fake",
            StageError::fatal("invalid api key"),
        )));
        let h = harness(fakes);
        let done = h.controller.drive(admit(&h).await).await.unwrap();
        assert_eq!(done.state, RunState::Completed);
        assert!(done.enrichment_skipped);
        assert_eq!(h.fakes.assessor.as_ref().unwrap().calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_assessor_degrades() {
        let h = harness(FakeSet::new(three_findings()).with_assessor(None));
        let done = h.controller.drive(admit(&h).await).await.unwrap();
        assert_eq!(done.state, RunState::Completed);
        assert!(done.enrichment_skipped);
    }

    #[tokio::test]
    async fn test_missing_commit_skips_run() {
        let fakes = FakeSet::new(three_findings())
            .with_source(FakeSourceHost::new().with_missing_commit());
        let h = harness(fakes);
        let done = h.controller.drive(admit(&h).await).await.unwrap();

        assert_eq!(done.state, RunState::Skipped);
        assert_eq!(done.skip_reason.as_deref(), Some(SKIP_COMMIT_NOT_FOUND));
        assert!(done.counts.is_none());
        assert_eq!(h.fakes.analyzer.calls(), 0);
    }

    #[tokio::test]
    async fn test_clone_timeout_fails_run_and_cleans_up() {
        let fakes = FakeSet::new(three_findings())
            .with_source(FakeSourceHost::new().with_clone_delay(Duration::from_secs(30)));
        let timeouts = StageTimeouts {
            clone: Duration::from_millis(50),
            ..Default::default()
        };
        let h = harness_with(fakes, timeouts);
        let done = h.controller.drive(admit(&h).await).await.unwrap();

        assert_eq!(done.state, RunState::Failed);
        assert_eq!(done.failed_stage, Some(StageName::Clone));
        assert_eq!(done.error_kind.as_deref(), Some("timeout"));
        assert!(done.counts.is_none());
        for path in h.fakes.source.clone_paths() {
            assert!(!path.exists(), "{} should be removed", path.display());
        }
    }

    #[tokio::test]
    async fn test_clone_fatal_error_is_not_retried() {
        let fakes = FakeSet::new(three_findings()).with_source(
            FakeSourceHost::new().with_clone_error(StageError::fatal("repository not found")),
        );
        let h = harness(fakes);
        let done = h.controller.drive(admit(&h).await).await.unwrap();

        assert_eq!(done.state, RunState::Failed);
        assert_eq!(done.error_kind.as_deref(), Some("fatal_failure"));
        assert_eq!(h.fakes.source.clone_paths().len(), 1);
    }

    #[tokio::test]
    async fn test_analyzer_failure_fails_run() {
        let fakes = FakeSet::new(vec![])
            .with_analyzer(FakeAnalyzer::failing(StageError::fatal("unparseable output")));
        let h = harness(fakes);
        let done = h.controller.drive(admit(&h).await).await.unwrap();

        assert_eq!(done.state, RunState::Failed);
        assert_eq!(done.failed_stage, Some(StageName::Analyze));
        assert!(h.fakes.source.issues().is_empty());
    }

    #[tokio::test]
    async fn test_checkout_removed_after_success() {
        let h = harness(FakeSet::new(three_findings()));
        h.controller.drive(admit(&h).await).await.unwrap();
        let paths = h.fakes.source.clone_paths();
        assert_eq!(paths.len(), 1);
        assert!(!paths[0].exists());
    }

    #[tokio::test]
    async fn test_issue_filing_failure_fails_run() {
        let fakes = FakeSet::new(three_findings()).with_source(
            FakeSourceHost::new().with_issue_error(StageError::fatal("401 Bad credentials")),
        );
        let h = harness(fakes);
        let done = h.controller.drive(admit(&h).await).await.unwrap();

        assert_eq!(done.state, RunState::Failed);
        assert_eq!(done.failed_stage, Some(StageName::File));
        // Counts were written at analysis and survive the failure.
        assert_eq!(done.counts.map(|c| c.total()), Some(3));
        assert!(h.fakes.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_notify_failure_fails_run() {
        let fakes = FakeSet::new(three_findings())
            .with_notifier(FakeNotifier::failing(StageError::fatal("relay rejected sender")));
        let h = harness(fakes);
        let done = h.controller.drive(admit(&h).await).await.unwrap();

        assert_eq!(done.state, RunState::Failed);
        assert_eq!(done.failed_stage, Some(StageName::Notify));
        assert!(done.issue_url.is_some());
    }
}
