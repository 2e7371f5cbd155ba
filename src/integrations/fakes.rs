//! Scripted in-memory collaborators.
//!
//! Used by the unit and integration tests to drive the pipeline
//! deterministically, including forced delays, failures and timeouts.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{Analyzer, Assessor, Collaborators, Notification, Notifier, SourceHost};
use crate::errors::StageError;
use crate::scan::models::{
    Assessment, FiledIssue, Finding, FindingAnnotation, IssueDraft, RawFinding, RepoContext,
    Severity,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn raw_finding(severity: Severity, rule: &str) -> RawFinding {
    RawFinding {
        rule_id: rule.to_string(),
        severity,
        path: "src/app.py".to_string(),
        line: 42,
        message: format!("{} matched", rule),
        remediation: None,
    }
}

// ── Source host ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeSourceHost {
    commit_missing: bool,
    head: Mutex<Option<String>>,
    clone_delay: Option<Duration>,
    clone_error: Option<StageError>,
    issue_error: Option<StageError>,
    clones: Mutex<Vec<PathBuf>>,
    issues: Mutex<Vec<(String, IssueDraft)>>,
}

impl FakeSourceHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_missing_commit(mut self) -> Self {
        self.commit_missing = true;
        self
    }

    pub fn with_head(self, sha: &str) -> Self {
        *lock(&self.head) = Some(sha.to_string());
        self
    }

    pub fn with_clone_delay(mut self, delay: Duration) -> Self {
        self.clone_delay = Some(delay);
        self
    }

    pub fn with_clone_error(mut self, err: StageError) -> Self {
        self.clone_error = Some(err);
        self
    }

    pub fn with_issue_error(mut self, err: StageError) -> Self {
        self.issue_error = Some(err);
        self
    }

    /// Directories the fake cloned into, in call order.
    pub fn clone_paths(&self) -> Vec<PathBuf> {
        lock(&self.clones).clone()
    }

    pub fn issues(&self) -> Vec<(String, IssueDraft)> {
        lock(&self.issues).clone()
    }
}

#[async_trait]
impl SourceHost for FakeSourceHost {
    async fn commit_exists(&self, _repo: &str, _commit_sha: &str) -> Result<bool, StageError> {
        Ok(!self.commit_missing)
    }

    async fn head_commit(&self, _repo: &str, branch: &str) -> Result<String, StageError> {
        lock(&self.head)
            .clone()
            .ok_or_else(|| StageError::fatal(format!("Branch {} not found", branch)))
    }

    async fn clone_repo(
        &self,
        _repo: &str,
        _branch: &str,
        commit_sha: &str,
        dest: &Path,
    ) -> Result<(), StageError> {
        lock(&self.clones).push(dest.to_path_buf());
        if let Some(delay) = self.clone_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = &self.clone_error {
            return Err(err.clone());
        }
        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|e| StageError::fatal(e.to_string()))?;
        tokio::fs::write(dest.join("HEAD"), commit_sha)
            .await
            .map_err(|e| StageError::fatal(e.to_string()))?;
        Ok(())
    }

    async fn repo_context(
        &self,
        repo: &str,
        branch: &str,
        commit_sha: &str,
    ) -> Result<RepoContext, StageError> {
        Ok(RepoContext {
            repo: repo.to_string(),
            branch: branch.to_string(),
            commit_sha: commit_sha.to_string(),
            description: Some("Test repository".to_string()),
            languages: vec!["Python".to_string()],
        })
    }

    async fn create_issue(&self, repo: &str, draft: &IssueDraft) -> Result<FiledIssue, StageError> {
        if let Some(err) = &self.issue_error {
            return Err(err.clone());
        }
        let mut issues = lock(&self.issues);
        issues.push((repo.to_string(), draft.clone()));
        let number = issues.len() as i64;
        Ok(FiledIssue {
            number,
            url: format!("https://github.com/{}/issues/{}", repo, number),
        })
    }
}

// ── Analyzer ──────────────────────────────────────────────────────────

pub struct FakeAnalyzer {
    result: Result<Vec<RawFinding>, StageError>,
    panics: bool,
    calls: AtomicUsize,
}

impl FakeAnalyzer {
    pub fn returning(findings: Vec<RawFinding>) -> Self {
        Self {
            result: Ok(findings),
            panics: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(err: StageError) -> Self {
        Self {
            result: Err(err),
            panics: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Panics inside `analyze`, to exercise worker isolation.
    pub fn panicking() -> Self {
        Self {
            result: Ok(Vec::new()),
            panics: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Analyzer for FakeAnalyzer {
    async fn analyze(&self, path: &Path) -> Result<Vec<RawFinding>, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panics {
            panic!("analyzer blew up on {}", path.display());
        }
        if !path.join("HEAD").exists() {
            return Err(StageError::fatal(format!(
                "No checkout at {}",
                path.display()
            )));
        }
        self.result.clone()
    }
}

// ── Assessor ──────────────────────────────────────────────────────────

pub struct FakeAssessor {
    name: String,
    result: Result<String, StageError>,
    calls: AtomicUsize,
}

impl FakeAssessor {
    /// Succeeds with `summary` and annotates every finding it is given.
    pub fn succeeding(name: &str, summary: &str) -> Self {
        Self {
            name: name.to_string(),
            result: Ok(summary.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(name: &str, err: StageError) -> Self {
        Self {
            name: name.to_string(),
            result: Err(err),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Assessor for FakeAssessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn assess(
        &self,
        findings: &[Finding],
        _context: &RepoContext,
    ) -> Result<Assessment, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let summary = self.result.clone()?;
        Ok(Assessment {
            provider: self.name.clone(),
            executive_summary: summary,
            recommended_actions: vec!["Patch the critical findings first".to_string()],
            annotations: findings
                .iter()
                .map(|f| FindingAnnotation {
                    finding_id: f.id,
                    risk: format!("{} risk in {}", f.severity.as_str(), f.path),
                    remediation: Some("Apply the vendor fix".to_string()),
                })
                .collect(),
        })
    }
}

// ── Notifier ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeNotifier {
    error: Option<StageError>,
    sent: Mutex<Vec<Notification>>,
}

impl FakeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(err: StageError) -> Self {
        Self {
            error: Some(err),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), StageError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        lock(&self.sent).push(notification.clone());
        Ok(())
    }
}

// ── Bundle ────────────────────────────────────────────────────────────

/// Concrete handles to the fakes behind a `Collaborators` bundle, so tests
/// can inspect what was called.
#[derive(Clone)]
pub struct FakeSet {
    pub source: Arc<FakeSourceHost>,
    pub analyzer: Arc<FakeAnalyzer>,
    pub assessor: Option<Arc<FakeAssessor>>,
    pub notifier: Arc<FakeNotifier>,
}

impl FakeSet {
    pub fn new(findings: Vec<RawFinding>) -> Self {
        Self {
            source: Arc::new(FakeSourceHost::new()),
            analyzer: Arc::new(FakeAnalyzer::returning(findings)),
            assessor: Some(Arc::new(FakeAssessor::succeeding(
                "fake",
                "Findings reviewed by the fake assessor.",
            ))),
            notifier: Arc::new(FakeNotifier::new()),
        }
    }

    pub fn with_source(mut self, source: FakeSourceHost) -> Self {
        self.source = Arc::new(source);
        self
    }

    pub fn with_analyzer(mut self, analyzer: FakeAnalyzer) -> Self {
        self.analyzer = Arc::new(analyzer);
        self
    }

    pub fn with_assessor(mut self, assessor: Option<FakeAssessor>) -> Self {
        self.assessor = assessor.map(Arc::new);
        self
    }

    pub fn with_notifier(mut self, notifier: FakeNotifier) -> Self {
        self.notifier = Arc::new(notifier);
        self
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            source: self.source.clone(),
            analyzer: self.analyzer.clone(),
            assessor: self
                .assessor
                .clone()
                .map(|a| a as Arc<dyn Assessor>),
            notifier: self.notifier.clone(),
        }
    }
}
