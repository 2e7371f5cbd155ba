//! Integration tests for watchman
//!
//! Binary-level checks through `assert_cmd`, and end-to-end scans through the
//! public library API with scripted collaborators.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

/// Helper to create a watchman Command with a scrubbed environment
fn watchman(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("watchman");
    cmd.current_dir(dir.path()).env_clear();
    cmd
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_watchman_help() {
        let dir = TempDir::new().unwrap();
        watchman(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("init"));
    }

    #[test]
    fn test_watchman_version() {
        let dir = TempDir::new().unwrap();
        watchman(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_database() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("state/scans.db");

        watchman(&dir)
            .arg("init")
            .arg("--db-path")
            .arg(&db_path)
            .assert()
            .success()
            .stdout(predicate::str::contains("Scan database initialized"));

        assert!(db_path.exists());
    }

    #[test]
    fn test_init_is_idempotent() {
        let dir = TempDir::new().unwrap();
        for _ in 0..2 {
            watchman(&dir)
                .args(["init", "--db-path", "scans.db"])
                .assert()
                .success();
        }
        assert!(dir.path().join("scans.db").exists());
    }

    #[test]
    fn test_init_uses_database_path_env() {
        let dir = TempDir::new().unwrap();
        watchman(&dir)
            .env("DATABASE_PATH", "from-env.db")
            .arg("init")
            .assert()
            .success();
        assert!(dir.path().join("from-env.db").exists());
    }
}

// =============================================================================
// Configuration Tests
// =============================================================================

mod config_command {
    use super::*;

    #[test]
    fn test_config_redacts_secrets() {
        let dir = TempDir::new().unwrap();
        watchman(&dir)
            .env("GITHUB_TOKEN", "ghp_do_not_print")
            .env("GITHUB_WEBHOOK_SECRET", "hook-secret")
            .arg("config")
            .assert()
            .success()
            .stdout(predicate::str::contains("GITHUB_TOKEN = \"<redacted>\""))
            .stdout(predicate::str::contains("ghp_do_not_print").not())
            .stdout(predicate::str::contains("hook-secret").not());
    }

    #[test]
    fn test_config_reads_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("watchman.toml"),
            "[scheduler]\nworkers = 7\n\n[server]\nport = 9123\n",
        )
        .unwrap();
        watchman(&dir)
            .arg("config")
            .assert()
            .success()
            .stdout(predicate::str::contains("workers = 7"))
            .stdout(predicate::str::contains("port = 9123"));
    }

    #[test]
    fn test_config_env_overrides_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("watchman.toml"), "[server]\nport = 9123\n").unwrap();
        watchman(&dir)
            .env("WATCHMAN_PORT", "9555")
            .arg("config")
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 9555"));
    }

    #[test]
    fn test_missing_explicit_config_fails() {
        let dir = TempDir::new().unwrap();
        watchman(&dir)
            .args(["--config", "nope.toml", "config"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("nope.toml"));
    }

    #[test]
    fn test_invalid_config_fails() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("watchman.toml"), "[server\n").unwrap();
        watchman(&dir).arg("config").assert().failure();
    }
}

// =============================================================================
// End-to-end Pipeline Tests
// =============================================================================

mod pipeline {
    use std::sync::Arc;
    use std::time::Duration;

    use watchman::errors::StageError;
    use watchman::integrations::fakes::*;
    use watchman::scan::controller::{ControllerConfig, PipelineController};
    use watchman::scan::db::{DbHandle, ScanDb};
    use watchman::scan::guard::{GuardConfig, LoopGuard};
    use watchman::scan::ledger::RunLedger;
    use watchman::scan::models::{
        RejectReason, Run, RunState, Severity, Trigger, TriggerSource,
    };
    use watchman::scan::scheduler::{Scheduler, SchedulerConfig, SubmitOutcome};

    struct Service {
        scheduler: Arc<Scheduler>,
        ledger: RunLedger,
        db: DbHandle,
        _workroot: tempfile::TempDir,
    }

    impl Service {
        fn start(fakes: &FakeSet) -> Self {
            let db = DbHandle::new(ScanDb::new_in_memory().unwrap());
            let ledger = RunLedger::new(db.clone());
            let workroot = tempfile::tempdir().unwrap();
            let controller = PipelineController::new(
                ledger.clone(),
                fakes.collaborators(),
                ControllerConfig {
                    workdir_root: Some(workroot.path().to_path_buf()),
                    ..Default::default()
                },
            );
            let scheduler = Scheduler::start(
                SchedulerConfig::default(),
                LoopGuard::new(GuardConfig::default(), db.clone()),
                Arc::new(controller),
            );
            Self {
                scheduler: Arc::new(scheduler),
                ledger,
                db,
                _workroot: workroot,
            }
        }

        async fn submit(&self, trigger: Trigger) -> SubmitOutcome {
            self.scheduler.submit(trigger).await.unwrap()
        }

        async fn wait_terminal(&self, run_id: i64) -> Run {
            for _ in 0..250 {
                let run = self.ledger.require(run_id).await.unwrap();
                if run.state.is_terminal() {
                    return run;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            panic!("run {} did not reach a terminal state", run_id);
        }

        async fn run_count(&self) -> usize {
            self.ledger.list(Default::default(), 100).await.unwrap().len()
        }
    }

    fn push(repo: &str, branch: &str, sha: &str, label: &str) -> Trigger {
        Trigger {
            repo: repo.into(),
            branch: branch.into(),
            commit_sha: sha.into(),
            label: label.into(),
            pusher: "octocat".into(),
            source: TriggerSource::Webhook,
        }
    }

    fn accepted(outcome: SubmitOutcome) -> i64 {
        match outcome {
            SubmitOutcome::Accepted { run_id } => run_id,
            other => panic!("expected acceptance, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_push_produces_completed_run_with_issue() {
        let fakes = FakeSet::new(vec![
            raw_finding(Severity::Critical, "sql-injection"),
            raw_finding(Severity::Medium, "weak-hash"),
            raw_finding(Severity::Medium, "open-redirect"),
        ]);
        let service = Service::start(&fakes);

        let run_id = accepted(service.submit(push("acme/api", "main", "abc123", "Add login")).await);
        let run = service.wait_terminal(run_id).await;

        assert_eq!(run.state, RunState::Completed);
        let counts = run.counts.unwrap();
        assert_eq!((counts.critical, counts.high, counts.medium, counts.low), (1, 0, 2, 0));
        assert!(!run.enrichment_skipped);
        assert!(run.issue_number.is_some());
        assert!(run.duration_ms.is_some());

        let issues = fakes.source.issues();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].0, "acme/api");
        assert!(issues[0].1.title.contains("1 critical"));
        assert_eq!(fakes.notifier.sent().len(), 1);

        let findings = service.ledger.findings(run_id).await.unwrap();
        assert_eq!(findings.len(), 3);
        assert!(findings.iter().all(|f| f.risk_annotation.is_some()));

        // The lease is gone once the run is terminal.
        let db = service.db.clone();
        let lease = db
            .call(|db| db.get_lease("acme/api", "abc123"))
            .await
            .unwrap();
        assert!(lease.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_yield_one_run() {
        let fakes = FakeSet::new(vec![raw_finding(Severity::High, "xss")])
            .with_source(FakeSourceHost::new().with_clone_delay(Duration::from_millis(150)));
        let service = Arc::new(Service::start(&fakes));

        let submissions = (0..6).map(|_| {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.submit(push("acme/api", "main", "abc123", "msg")).await })
        });
        let mut outcomes = Vec::new();
        for handle in submissions {
            outcomes.push(handle.await.unwrap());
        }

        let run_ids: Vec<i64> = outcomes
            .iter()
            .filter_map(|o| match o {
                SubmitOutcome::Accepted { run_id } => Some(*run_id),
                _ => None,
            })
            .collect();
        assert_eq!(run_ids.len(), 1);
        assert!(outcomes.iter().all(|o| matches!(
            o,
            SubmitOutcome::Accepted { .. }
                | SubmitOutcome::Rejected {
                    reason: RejectReason::DuplicateInFlight
                }
        )));

        service.wait_terminal(run_ids[0]).await;
        assert_eq!(service.run_count().await, 1);
        assert_eq!(fakes.source.issues().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_is_not_rescanned() {
        let fakes = FakeSet::new(vec![]);
        let service = Service::start(&fakes);

        let run_id = accepted(service.submit(push("acme/api", "main", "abc123", "msg")).await);
        service.wait_terminal(run_id).await;

        let again = service.submit(push("acme/api", "main", "abc123", "msg")).await;
        assert_eq!(
            again,
            SubmitOutcome::Rejected {
                reason: RejectReason::AlreadyProcessed
            }
        );
        assert_eq!(service.run_count().await, 1);
    }

    #[tokio::test]
    async fn test_self_generated_pushes_create_no_runs() {
        let fakes = FakeSet::new(vec![]);
        let service = Service::start(&fakes);

        let branch = service
            .submit(push("acme/api", "security-fixes-20240101", "f1", "Bump deps"))
            .await;
        assert_eq!(
            branch,
            SubmitOutcome::Rejected {
                reason: RejectReason::SelfGeneratedBranch
            }
        );
        let commit = service
            .submit(push("acme/api", "main", "f2", "SECURITY: patch sqli"))
            .await;
        assert_eq!(
            commit,
            SubmitOutcome::Rejected {
                reason: RejectReason::SelfGeneratedCommit
            }
        );
        assert_eq!(service.run_count().await, 0);

        let stats = service.db.call(|db| db.stats()).await.unwrap();
        assert_eq!(stats.rejected_triggers.get("self_generated_branch"), Some(&1));
        assert_eq!(stats.rejected_triggers.get("self_generated_commit"), Some(&1));
    }

    #[tokio::test]
    async fn test_assessment_outage_degrades_but_completes() {
        let fakes = FakeSet::new(vec![raw_finding(Severity::Critical, "rce")]).with_assessor(Some(
            FakeAssessor::failing("anthropic", StageError::transient("503 from provider")),
        ));
        let service = Service::start(&fakes);

        let run_id = accepted(service.submit(push("acme/api", "main", "abc123", "msg")).await);
        let run = service.wait_terminal(run_id).await;

        assert_eq!(run.state, RunState::Completed);
        assert!(run.enrichment_skipped);
        assert_eq!(run.counts.unwrap().critical, 1);
        let issues = fakes.source.issues();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].1.body.contains("AI enrichment unavailable"));
    }

    #[tokio::test]
    async fn test_clean_commit_completes_without_issue() {
        let fakes = FakeSet::new(vec![]);
        let service = Service::start(&fakes);

        let run_id = accepted(service.submit(push("acme/api", "main", "abc123", "msg")).await);
        let run = service.wait_terminal(run_id).await;

        assert_eq!(run.state, RunState::Completed);
        assert_eq!(run.total_findings(), 0);
        assert!(run.counts.is_some());
        assert!(run.issue_number.is_none());
        assert!(fakes.source.issues().is_empty());
        assert!(fakes.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_failed_clone_records_diagnostics() {
        let fakes = FakeSet::new(vec![])
            .with_source(FakeSourceHost::new().with_clone_error(StageError::fatal("repository not found")));
        let service = Service::start(&fakes);

        let run_id = accepted(service.submit(push("acme/gone", "main", "abc123", "msg")).await);
        let run = service.wait_terminal(run_id).await;

        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.failed_stage.map(|s| s.as_str()), Some("clone"));
        assert_eq!(run.error_kind.as_deref(), Some("fatal_failure"));
        assert!(run.counts.is_none());
    }
}
