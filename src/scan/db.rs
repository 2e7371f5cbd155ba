use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Transaction, params};

use super::ledger::RunPatch;
use super::models::*;
use crate::errors::WatchmanError;

/// `error_kind` values written when a run is aborted rather than processed.
/// Runs that ended this way do not count as "already processed".
pub const ABORT_LEASE_EXPIRED: &str = "lease_expired";
pub const ABORT_INTERRUPTED: &str = "interrupted";

const TERMINAL_STATES_SQL: &str = "('completed', 'failed', 'skipped')";

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Async-safe handle to the scan database.
///
/// Wraps `ScanDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, keeping synchronous SQLite
/// I/O off the async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<ScanDb>>,
}

impl DbHandle {
    pub fn new(db: ScanDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&ScanDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct ScanDb {
    conn: Connection,
}

impl ScanDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .context("Failed to configure connection")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS scan_runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    repo TEXT NOT NULL,
                    branch TEXT NOT NULL,
                    commit_sha TEXT NOT NULL,
                    commit_label TEXT NOT NULL DEFAULT '',
                    pusher TEXT NOT NULL DEFAULT '',
                    source TEXT NOT NULL DEFAULT 'webhook',
                    state TEXT NOT NULL DEFAULT 'pending',
                    critical_count INTEGER,
                    high_count INTEGER,
                    medium_count INTEGER,
                    low_count INTEGER,
                    enrichment_skipped INTEGER NOT NULL DEFAULT 0,
                    failed_stage TEXT,
                    error_kind TEXT,
                    error_message TEXT,
                    skip_reason TEXT,
                    issue_number INTEGER,
                    issue_url TEXT,
                    stage_timings TEXT NOT NULL DEFAULT '[]',
                    duration_ms INTEGER,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS idempotency_leases (
                    repo TEXT NOT NULL,
                    commit_sha TEXT NOT NULL,
                    run_id INTEGER NOT NULL REFERENCES scan_runs(id) ON DELETE CASCADE,
                    expires_at INTEGER NOT NULL,
                    ttl_secs INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (repo, commit_sha)
                );

                CREATE TABLE IF NOT EXISTS findings (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES scan_runs(id) ON DELETE CASCADE,
                    rule_id TEXT NOT NULL,
                    severity TEXT NOT NULL,
                    file_path TEXT NOT NULL,
                    line_number INTEGER NOT NULL DEFAULT 0,
                    message TEXT NOT NULL,
                    remediation TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS finding_annotations (
                    finding_id INTEGER PRIMARY KEY REFERENCES findings(id) ON DELETE CASCADE,
                    risk TEXT NOT NULL,
                    remediation TEXT
                );

                CREATE TABLE IF NOT EXISTS assessments (
                    run_id INTEGER PRIMARY KEY REFERENCES scan_runs(id) ON DELETE CASCADE,
                    provider TEXT NOT NULL,
                    executive_summary TEXT NOT NULL,
                    recommended_actions TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS trigger_rejections (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    repo TEXT NOT NULL,
                    branch TEXT NOT NULL,
                    commit_sha TEXT NOT NULL,
                    reason TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_scan_runs_key ON scan_runs(repo, commit_sha);
                CREATE INDEX IF NOT EXISTS idx_scan_runs_state ON scan_runs(state);
                CREATE INDEX IF NOT EXISTS idx_findings_run ON findings(run_id);
                CREATE INDEX IF NOT EXISTS idx_findings_severity ON findings(severity);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Admission ─────────────────────────────────────────────────────

    /// Evaluate the stateful guard rules and, on acceptance, create the run
    /// and its lease in one transaction.
    pub fn admit(&self, trigger: &Trigger, now: i64, lease_ttl_secs: i64) -> Result<Admission> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin admission transaction")?;

        let lease: Option<(i64, i64)> = tx
            .query_row(
                "SELECT run_id, expires_at FROM idempotency_leases WHERE repo = ?1 AND commit_sha = ?2",
                params![trigger.repo, trigger.commit_sha],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to read idempotency lease")?;

        if let Some((owner_id, expires_at)) = lease {
            let owner_state = run_state_tx(&tx, owner_id)?;
            let owner_live = owner_state.map(|s| !s.is_terminal()).unwrap_or(false);
            if owner_live && expires_at > now {
                insert_rejection_tx(&tx, trigger, RejectReason::DuplicateInFlight)?;
                tx.commit().context("Failed to commit rejection")?;
                return Ok(Admission::Rejected(RejectReason::DuplicateInFlight));
            }
            if owner_live {
                let ts = now_rfc3339();
                tx.execute(
                    &format!(
                        "UPDATE scan_runs SET state = 'failed', error_kind = ?1,
                            error_message = 'Idempotency lease expired before the run finished',
                            updated_at = ?2, completed_at = ?2
                         WHERE id = ?3 AND state NOT IN {}",
                        TERMINAL_STATES_SQL
                    ),
                    params![ABORT_LEASE_EXPIRED, ts, owner_id],
                )
                .context("Failed to expire stale run")?;
            }
            tx.execute(
                "DELETE FROM idempotency_leases WHERE repo = ?1 AND commit_sha = ?2",
                params![trigger.repo, trigger.commit_sha],
            )
            .context("Failed to drop stale lease")?;
        }

        let processed = is_processed_tx(&tx, trigger)?;
        if processed {
            insert_rejection_tx(&tx, trigger, RejectReason::AlreadyProcessed)?;
            tx.commit().context("Failed to commit rejection")?;
            return Ok(Admission::Rejected(RejectReason::AlreadyProcessed));
        }

        let run_id = insert_run_tx(&tx, trigger)?;
        tx.execute(
            "INSERT INTO idempotency_leases (repo, commit_sha, run_id, expires_at, ttl_secs, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                trigger.repo,
                trigger.commit_sha,
                run_id,
                now + lease_ttl_secs,
                lease_ttl_secs,
                now_rfc3339()
            ],
        )
        .context("Failed to create idempotency lease")?;
        let run = get_run_tx(&tx, run_id)?.context("Scan run not found after insert")?;
        tx.commit().context("Failed to commit admission")?;
        Ok(Admission::Accepted(run))
    }

    /// Evaluate the duplicate and already-processed rules without creating a
    /// run or expiring a stale one, for triggers that cannot be queued. A
    /// matching rule is recorded like any other rejection.
    pub fn known_rejection(&self, trigger: &Trigger, now: i64) -> Result<Option<RejectReason>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin rejection check")?;

        let lease: Option<(i64, i64)> = tx
            .query_row(
                "SELECT run_id, expires_at FROM idempotency_leases WHERE repo = ?1 AND commit_sha = ?2",
                params![trigger.repo, trigger.commit_sha],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to read idempotency lease")?;
        let live = match lease {
            Some((owner_id, expires_at)) if expires_at > now => run_state_tx(&tx, owner_id)?
                .map(|s| !s.is_terminal())
                .unwrap_or(false),
            _ => false,
        };

        let reason = if live {
            Some(RejectReason::DuplicateInFlight)
        } else if is_processed_tx(&tx, trigger)? {
            Some(RejectReason::AlreadyProcessed)
        } else {
            None
        };
        if let Some(reason) = reason {
            insert_rejection_tx(&tx, trigger, reason)?;
        }
        tx.commit().context("Failed to commit rejection check")?;
        Ok(reason)
    }

    /// Push a run's lease expiry to `now + ttl`. Returns false when the run
    /// no longer owns a lease.
    pub fn renew_lease(&self, run_id: i64, now: i64) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE idempotency_leases SET expires_at = ?1 + ttl_secs WHERE run_id = ?2",
                params![now, run_id],
            )
            .context("Failed to renew idempotency lease")?;
        Ok(updated > 0)
    }

    /// Record a rejection decided without touching run state (branch/commit prefix rules).
    pub fn record_rejection(&self, trigger: &Trigger, reason: RejectReason) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO trigger_rejections (repo, branch, commit_sha, reason, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    trigger.repo,
                    trigger.branch,
                    trigger.commit_sha,
                    reason.as_str(),
                    now_rfc3339()
                ],
            )
            .context("Failed to record trigger rejection")?;
        Ok(())
    }

    pub fn get_lease(&self, repo: &str, commit_sha: &str) -> Result<Option<IdempotencyRecord>> {
        self.conn
            .query_row(
                "SELECT repo, commit_sha, run_id, expires_at FROM idempotency_leases
                 WHERE repo = ?1 AND commit_sha = ?2",
                params![repo, commit_sha],
                |row| {
                    Ok(IdempotencyRecord {
                        repo: row.get(0)?,
                        commit_sha: row.get(1)?,
                        run_id: row.get(2)?,
                        expires_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to query idempotency lease")
    }

    // ── Runs ──────────────────────────────────────────────────────────

    /// Insert a pending run without a lease.
    pub fn create_run(&self, trigger: &Trigger) -> Result<Run> {
        let tx = self.conn.unchecked_transaction()?;
        let id = insert_run_tx(&tx, trigger)?;
        let run = get_run_tx(&tx, id)?.context("Scan run not found after insert")?;
        tx.commit()?;
        Ok(run)
    }

    pub fn get_run(&self, id: i64) -> Result<Option<Run>> {
        let tx = self.conn.unchecked_transaction()?;
        let run = get_run_tx(&tx, id)?;
        tx.commit()?;
        Ok(run)
    }

    /// Newest first. `limit` is applied as given; callers cap it.
    pub fn list_runs(&self, filter: &RunFilter, limit: i64) -> Result<Vec<Run>> {
        let state = filter.state.map(|s| s.as_str());
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM scan_runs
                 WHERE (?1 IS NULL OR state = ?1) AND (?2 IS NULL OR repo = ?2)
                 ORDER BY id DESC LIMIT ?3",
                RUN_COLUMNS
            ))
            .context("Failed to prepare list_runs")?;
        let rows = stmt
            .query_map(params![state, filter.repo, limit], RunRow::from_row)
            .context("Failed to query scan runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read scan_run row")?.into_run()?);
        }
        Ok(runs)
    }

    /// Apply a state transition and its associated data in one transaction.
    ///
    /// Findings, counts, assessment, failure diagnostics and the new state are
    /// written together; reaching a terminal state also drops the run's lease.
    pub fn apply_transition(
        &self,
        id: i64,
        next: RunState,
        patch: &RunPatch,
    ) -> std::result::Result<Run, WatchmanError> {
        let tx = self.conn.unchecked_transaction()?;
        let current = get_run_tx(&tx, id)?.ok_or(WatchmanError::RunNotFound { id })?;

        if current.state.is_terminal() {
            return Err(WatchmanError::RunTerminal {
                id,
                state: current.state.as_str().to_string(),
            });
        }
        if !current.state.can_transition_to(next) {
            return Err(WatchmanError::InvalidTransition {
                id,
                from: current.state.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }

        let ts = now_rfc3339();

        if let Some(findings) = &patch.findings {
            if current.counts.is_some() {
                return Err(WatchmanError::CountsAlreadyWritten { id });
            }
            let counts = SeverityCounts::from_severities(findings.iter().map(|f| &f.severity));
            {
                let mut insert = tx.prepare(
                    "INSERT INTO findings (run_id, rule_id, severity, file_path, line_number, message, remediation, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for f in findings {
                    insert.execute(params![
                        id,
                        f.rule_id,
                        f.severity.as_str(),
                        f.path,
                        f.line,
                        f.message,
                        f.remediation,
                        ts
                    ])?;
                }
            }
            tx.execute(
                "UPDATE scan_runs SET critical_count = ?1, high_count = ?2, medium_count = ?3, low_count = ?4
                 WHERE id = ?5",
                params![counts.critical, counts.high, counts.medium, counts.low, id],
            )?;
        }

        if let Some(assessment) = &patch.assessment {
            let actions = serde_json::to_string(&assessment.recommended_actions)
                .map_err(|e| WatchmanError::Other(e.into()))?;
            tx.execute(
                "INSERT OR REPLACE INTO assessments (run_id, provider, executive_summary, recommended_actions, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, assessment.provider, assessment.executive_summary, actions, ts],
            )?;
            let mut annotate = tx.prepare(
                "INSERT OR REPLACE INTO finding_annotations (finding_id, risk, remediation)
                 SELECT id, ?2, ?3 FROM findings WHERE id = ?1 AND run_id = ?4",
            )?;
            for a in &assessment.annotations {
                annotate.execute(params![a.finding_id, a.risk, a.remediation, id])?;
            }
        }

        if let Some(skipped) = patch.enrichment_skipped {
            tx.execute(
                "UPDATE scan_runs SET enrichment_skipped = ?1 WHERE id = ?2",
                params![skipped as i64, id],
            )?;
        }

        if let Some(failure) = &patch.failure {
            tx.execute(
                "UPDATE scan_runs SET failed_stage = ?1, error_kind = ?2, error_message = ?3 WHERE id = ?4",
                params![
                    failure.stage.map(|s| s.as_str()),
                    failure.kind,
                    failure.message,
                    id
                ],
            )?;
        }

        if let Some(reason) = &patch.skip_reason {
            tx.execute(
                "UPDATE scan_runs SET skip_reason = ?1 WHERE id = ?2",
                params![reason, id],
            )?;
        }

        if let Some(issue) = &patch.issue {
            tx.execute(
                "UPDATE scan_runs SET issue_number = ?1, issue_url = ?2 WHERE id = ?3",
                params![issue.number, issue.url, id],
            )?;
        }

        if let Some(timing) = &patch.stage_timing {
            let mut timings = current.stage_timings.clone();
            timings.push(timing.clone());
            let json =
                serde_json::to_string(&timings).map_err(|e| WatchmanError::Other(e.into()))?;
            tx.execute(
                "UPDATE scan_runs SET stage_timings = ?1 WHERE id = ?2",
                params![json, id],
            )?;
        }

        if let Some(duration_ms) = patch.duration_ms {
            tx.execute(
                "UPDATE scan_runs SET duration_ms = ?1 WHERE id = ?2",
                params![duration_ms, id],
            )?;
        }

        if next.is_terminal() {
            tx.execute(
                "UPDATE scan_runs SET state = ?1, updated_at = ?2, completed_at = ?2 WHERE id = ?3",
                params![next.as_str(), ts, id],
            )?;
            tx.execute(
                "DELETE FROM idempotency_leases WHERE run_id = ?1",
                params![id],
            )?;
        } else {
            tx.execute(
                "UPDATE scan_runs SET state = ?1, updated_at = ?2 WHERE id = ?3",
                params![next.as_str(), ts, id],
            )?;
            // A run that keeps making progress keeps its lease.
            tx.execute(
                "UPDATE idempotency_leases SET expires_at = ?1 + ttl_secs WHERE run_id = ?2",
                params![now_unix(), id],
            )?;
        }

        let run = get_run_tx(&tx, id)?.ok_or(WatchmanError::RunNotFound { id })?;
        tx.commit()?;
        Ok(run)
    }

    /// Fail every run a previous process left in flight and drop all leases.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let ts = now_rfc3339();
        let failed = tx
            .execute(
                &format!(
                    "UPDATE scan_runs SET state = 'failed', error_kind = ?1,
                        error_message = 'Run interrupted by process restart',
                        updated_at = ?2, completed_at = ?2
                     WHERE state NOT IN {}",
                    TERMINAL_STATES_SQL
                ),
                params![ABORT_INTERRUPTED, ts],
            )
            .context("Failed to recover interrupted runs")?;
        tx.execute("DELETE FROM idempotency_leases", [])
            .context("Failed to clear leases")?;
        tx.commit()?;
        Ok(failed)
    }

    // ── Findings and assessments ──────────────────────────────────────

    pub fn get_findings(&self, run_id: i64) -> Result<Vec<Finding>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT f.id, f.run_id, f.rule_id, f.severity, f.file_path, f.line_number, f.message,
                        f.remediation, a.risk, a.remediation, f.created_at
                 FROM findings f LEFT JOIN finding_annotations a ON a.finding_id = f.id
                 WHERE f.run_id = ?1 ORDER BY f.id",
            )
            .context("Failed to prepare get_findings")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    Finding {
                        id: row.get(0)?,
                        run_id: row.get(1)?,
                        rule_id: row.get(2)?,
                        severity: Severity::Low,
                        path: row.get(4)?,
                        line: row.get(5)?,
                        message: row.get(6)?,
                        remediation: row.get(7)?,
                        risk_annotation: row.get(8)?,
                        ai_remediation: row.get(9)?,
                        created_at: row.get(10)?,
                    },
                    row.get::<_, String>(3)?,
                ))
            })
            .context("Failed to query findings")?;
        let mut findings = Vec::new();
        for row in rows {
            let (mut finding, severity) = row.context("Failed to read finding row")?;
            finding.severity = Severity::from_str(&severity)
                .map_err(|e| anyhow::anyhow!(e))
                .context("Failed to parse finding severity")?;
            findings.push(finding);
        }
        Ok(findings)
    }

    pub fn count_findings(&self, run_id: i64) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM findings WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .context("Failed to count findings")
    }

    pub fn get_assessment(&self, run_id: i64) -> Result<Option<Assessment>> {
        let row: Option<(String, String, String)> = self
            .conn
            .query_row(
                "SELECT provider, executive_summary, recommended_actions FROM assessments WHERE run_id = ?1",
                params![run_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .context("Failed to query assessment")?;
        let Some((provider, executive_summary, actions)) = row else {
            return Ok(None);
        };
        let recommended_actions: Vec<String> =
            serde_json::from_str(&actions).context("Failed to parse recommended_actions")?;

        let mut stmt = self.conn.prepare(
            "SELECT a.finding_id, a.risk, a.remediation FROM finding_annotations a
             JOIN findings f ON f.id = a.finding_id WHERE f.run_id = ?1 ORDER BY a.finding_id",
        )?;
        let annotations = stmt
            .query_map(params![run_id], |row| {
                Ok(FindingAnnotation {
                    finding_id: row.get(0)?,
                    risk: row.get(1)?,
                    remediation: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read finding annotations")?;

        Ok(Some(Assessment {
            provider,
            executive_summary,
            recommended_actions,
            annotations,
        }))
    }

    pub fn get_run_detail(&self, id: i64) -> Result<Option<RunDetail>> {
        let Some(run) = self.get_run(id)? else {
            return Ok(None);
        };
        let findings_count = self.count_findings(id)?;
        let assessment = self.get_assessment(id)?;
        Ok(Some(RunDetail {
            run,
            findings_count,
            assessment,
        }))
    }

    // ── Statistics ────────────────────────────────────────────────────

    pub fn stats(&self) -> Result<ScanStats> {
        let mut by_state = BTreeMap::new();
        let mut total_scans = 0;
        {
            let mut stmt = self
                .conn
                .prepare("SELECT state, COUNT(*) FROM scan_runs GROUP BY state")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (state, count) = row.context("Failed to read state count")?;
                total_scans += count;
                by_state.insert(state, count);
            }
        }

        let findings = self
            .conn
            .query_row(
                "SELECT COALESCE(SUM(critical_count), 0), COALESCE(SUM(high_count), 0),
                        COALESCE(SUM(medium_count), 0), COALESCE(SUM(low_count), 0)
                 FROM scan_runs",
                [],
                |row| {
                    Ok(SeverityCounts {
                        critical: row.get(0)?,
                        high: row.get(1)?,
                        medium: row.get(2)?,
                        low: row.get(3)?,
                    })
                },
            )
            .context("Failed to sum finding counts")?;

        let mut rejected_triggers = BTreeMap::new();
        {
            let mut stmt = self
                .conn
                .prepare("SELECT reason, COUNT(*) FROM trigger_rejections GROUP BY reason")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (reason, count) = row.context("Failed to read rejection count")?;
                rejected_triggers.insert(reason, count);
            }
        }

        Ok(ScanStats {
            total_scans,
            by_state,
            findings,
            rejected_triggers,
        })
    }
}

// ── Transaction helpers ───────────────────────────────────────────────

const RUN_COLUMNS: &str = "id, repo, branch, commit_sha, commit_label, pusher, source, state,
    critical_count, high_count, medium_count, low_count, enrichment_skipped, failed_stage,
    error_kind, error_message, skip_reason, issue_number, issue_url, stage_timings, duration_ms,
    created_at, updated_at, completed_at";

fn insert_run_tx(tx: &Transaction<'_>, trigger: &Trigger) -> Result<i64> {
    let ts = now_rfc3339();
    tx.execute(
        "INSERT INTO scan_runs (repo, branch, commit_sha, commit_label, pusher, source, state, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?7)",
        params![
            trigger.repo,
            trigger.branch,
            trigger.commit_sha,
            trigger.label,
            trigger.pusher,
            trigger.source.as_str(),
            ts
        ],
    )
    .context("Failed to insert scan run")?;
    Ok(tx.last_insert_rowid())
}

fn get_run_tx(tx: &Transaction<'_>, id: i64) -> Result<Option<Run>> {
    let row = tx
        .query_row(
            &format!("SELECT {} FROM scan_runs WHERE id = ?1", RUN_COLUMNS),
            params![id],
            RunRow::from_row,
        )
        .optional()
        .context("Failed to query scan run")?;
    row.map(RunRow::into_run).transpose()
}

fn run_state_tx(tx: &Transaction<'_>, id: i64) -> Result<Option<RunState>> {
    let state: Option<String> = tx
        .query_row(
            "SELECT state FROM scan_runs WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to query run state")?;
    state
        .map(|s| RunState::from_str(&s).map_err(|e| anyhow::anyhow!(e)))
        .transpose()
}

/// A terminal run exists for the key that was not aborted by lease expiry
/// or restart.
fn is_processed_tx(tx: &Transaction<'_>, trigger: &Trigger) -> Result<bool> {
    tx.query_row(
        &format!(
            "SELECT EXISTS(
                SELECT 1 FROM scan_runs
                WHERE repo = ?1 AND commit_sha = ?2 AND state IN {}
                  AND COALESCE(error_kind, '') NOT IN (?3, ?4))",
            TERMINAL_STATES_SQL
        ),
        params![
            trigger.repo,
            trigger.commit_sha,
            ABORT_LEASE_EXPIRED,
            ABORT_INTERRUPTED
        ],
        |row| row.get(0),
    )
    .context("Failed to check for processed runs")
}

fn insert_rejection_tx(tx: &Transaction<'_>, trigger: &Trigger, reason: RejectReason) -> Result<()> {
    tx.execute(
        "INSERT INTO trigger_rejections (repo, branch, commit_sha, reason, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            trigger.repo,
            trigger.branch,
            trigger.commit_sha,
            reason.as_str(),
            now_rfc3339()
        ],
    )
    .context("Failed to record trigger rejection")?;
    Ok(())
}

/// Intermediate row struct for scan_runs.
struct RunRow {
    id: i64,
    repo: String,
    branch: String,
    commit_sha: String,
    commit_label: String,
    pusher: String,
    source: String,
    state: String,
    critical_count: Option<i64>,
    high_count: Option<i64>,
    medium_count: Option<i64>,
    low_count: Option<i64>,
    enrichment_skipped: i64,
    failed_stage: Option<String>,
    error_kind: Option<String>,
    error_message: Option<String>,
    skip_reason: Option<String>,
    issue_number: Option<i64>,
    issue_url: Option<String>,
    stage_timings: String,
    duration_ms: Option<i64>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            repo: row.get(1)?,
            branch: row.get(2)?,
            commit_sha: row.get(3)?,
            commit_label: row.get(4)?,
            pusher: row.get(5)?,
            source: row.get(6)?,
            state: row.get(7)?,
            critical_count: row.get(8)?,
            high_count: row.get(9)?,
            medium_count: row.get(10)?,
            low_count: row.get(11)?,
            enrichment_skipped: row.get(12)?,
            failed_stage: row.get(13)?,
            error_kind: row.get(14)?,
            error_message: row.get(15)?,
            skip_reason: row.get(16)?,
            issue_number: row.get(17)?,
            issue_url: row.get(18)?,
            stage_timings: row.get(19)?,
            duration_ms: row.get(20)?,
            created_at: row.get(21)?,
            updated_at: row.get(22)?,
            completed_at: row.get(23)?,
        })
    }

    fn into_run(self) -> Result<Run> {
        let state = RunState::from_str(&self.state)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse run state")?;
        let source = TriggerSource::from_str(&self.source)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse trigger source")?;
        let failed_stage = self
            .failed_stage
            .as_deref()
            .map(StageName::from_str)
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse failed stage")?;
        let counts = match (
            self.critical_count,
            self.high_count,
            self.medium_count,
            self.low_count,
        ) {
            (Some(critical), Some(high), Some(medium), Some(low)) => Some(SeverityCounts {
                critical,
                high,
                medium,
                low,
            }),
            _ => None,
        };
        let stage_timings: Vec<StageTiming> = serde_json::from_str(&self.stage_timings)
            .context("Failed to parse stage timings")?;
        Ok(Run {
            id: self.id,
            repo: self.repo,
            branch: self.branch,
            commit_sha: self.commit_sha,
            commit_label: self.commit_label,
            pusher: self.pusher,
            source,
            state,
            counts,
            enrichment_skipped: self.enrichment_skipped != 0,
            failed_stage,
            error_kind: self.error_kind,
            error_message: self.error_message,
            skip_reason: self.skip_reason,
            issue_number: self.issue_number,
            issue_url: self.issue_url,
            stage_timings,
            duration_ms: self.duration_ms,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
