use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Severity ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub const ALL: [Severity; 4] = [Self::Critical, Self::High, Self::Medium, Self::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    /// Map an analyzer severity label onto the four tiers.
    ///
    /// Semgrep reports `ERROR`/`WARNING`/`INFO`; explicit tier names are
    /// accepted as-is. Anything unrecognised is treated as `Low`.
    pub fn from_analyzer_label(label: &str) -> Self {
        match label.trim().to_uppercase().as_str() {
            "ERROR" | "CRITICAL" => Self::Critical,
            "WARNING" | "HIGH" => Self::High,
            "MEDIUM" => Self::Medium,
            _ => Self::Low,
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            _ => Err(format!("Invalid severity: {}", s)),
        }
    }
}

/// Per-severity finding counts for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub critical: i64,
    pub high: i64,
    pub medium: i64,
    pub low: i64,
}

impl SeverityCounts {
    pub fn from_severities<'a>(severities: impl IntoIterator<Item = &'a Severity>) -> Self {
        let mut counts = Self::default();
        for severity in severities {
            match severity {
                Severity::Critical => counts.critical += 1,
                Severity::High => counts.high += 1,
                Severity::Medium => counts.medium += 1,
                Severity::Low => counts.low += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> i64 {
        self.critical + self.high + self.medium + self.low
    }

    pub fn get(&self, severity: Severity) -> i64 {
        match severity {
            Severity::Critical => self.critical,
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
        }
    }
}

// ── Run lifecycle ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Cloning,
    Analyzing,
    Assessing,
    Filing,
    Notifying,
    Completed,
    Failed,
    Skipped,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Cloning => "cloning",
            Self::Analyzing => "analyzing",
            Self::Assessing => "assessing",
            Self::Filing => "filing",
            Self::Notifying => "notifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Forward-only transition table. Terminal states accept nothing.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Pending, Cloning) | (Pending, Skipped) => true,
            (Cloning, Analyzing) => true,
            // Zero findings short-circuits straight to completion.
            (Analyzing, Assessing) | (Analyzing, Completed) => true,
            (Assessing, Filing) => true,
            (Filing, Notifying) => true,
            (Notifying, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "cloning" => Ok(Self::Cloning),
            "analyzing" => Ok(Self::Analyzing),
            "assessing" => Ok(Self::Assessing),
            "filing" => Ok(Self::Filing),
            "notifying" => Ok(Self::Notifying),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid run state: {}", s)),
        }
    }
}

/// The externally-delegated units of work a run passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Verify,
    Clone,
    Analyze,
    Assess,
    File,
    Notify,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verify => "verify",
            Self::Clone => "clone",
            Self::Analyze => "analyze",
            Self::Assess => "assess",
            Self::File => "file",
            Self::Notify => "notify",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "verify" => Ok(Self::Verify),
            "clone" => Ok(Self::Clone),
            "analyze" => Ok(Self::Analyze),
            "assess" => Ok(Self::Assess),
            "file" => Ok(Self::File),
            "notify" => Ok(Self::Notify),
            _ => Err(format!("Invalid stage: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: StageName,
    pub started_at: String,
    pub duration_ms: i64,
    /// `ok`, `degraded`, or a `StageErrorKind` string.
    pub outcome: String,
}

// ── Triggers and admission ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Webhook,
    Manual,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for TriggerSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webhook" => Ok(Self::Webhook),
            "manual" => Ok(Self::Manual),
            _ => Err(format!("Invalid trigger source: {}", s)),
        }
    }
}

/// An inbound request to scan one commit. Never persisted on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub repo: String,
    pub branch: String,
    pub commit_sha: String,
    /// Free-text label, normally the head commit message.
    pub label: String,
    pub pusher: String,
    pub source: TriggerSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    SelfGeneratedBranch,
    SelfGeneratedCommit,
    DuplicateInFlight,
    AlreadyProcessed,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SelfGeneratedBranch => "self_generated_branch",
            Self::SelfGeneratedCommit => "self_generated_commit",
            Self::DuplicateInFlight => "duplicate_in_flight",
            Self::AlreadyProcessed => "already_processed",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum Admission {
    Accepted(Run),
    Rejected(RejectReason),
}

/// Lease owning the (repository, commit) key while a run is in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub repo: String,
    pub commit_sha: String,
    pub run_id: i64,
    /// Unix seconds.
    pub expires_at: i64,
}

// ── Runs ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub repo: String,
    pub branch: String,
    pub commit_sha: String,
    pub commit_label: String,
    pub pusher: String,
    pub source: TriggerSource,
    pub state: RunState,
    /// `None` until the analysis stage completes.
    pub counts: Option<SeverityCounts>,
    pub enrichment_skipped: bool,
    pub failed_stage: Option<StageName>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub skip_reason: Option<String>,
    pub issue_number: Option<i64>,
    pub issue_url: Option<String>,
    pub stage_timings: Vec<StageTiming>,
    pub duration_ms: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl Run {
    pub fn total_findings(&self) -> i64 {
        self.counts.map(|c| c.total()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunFilter {
    pub state: Option<RunState>,
    pub repo: Option<String>,
}

// ── Findings ──────────────────────────────────────────────────────────

/// A finding as produced by the analyzer, before it belongs to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFinding {
    pub rule_id: String,
    pub severity: Severity,
    pub path: String,
    pub line: i64,
    pub message: String,
    pub remediation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: i64,
    pub run_id: i64,
    pub rule_id: String,
    pub severity: Severity,
    pub path: String,
    pub line: i64,
    pub message: String,
    pub remediation: Option<String>,
    /// AI-assigned risk commentary, joined from the annotation table.
    pub risk_annotation: Option<String>,
    pub ai_remediation: Option<String>,
    pub created_at: String,
}

// ── Collaborator payloads ─────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoContext {
    pub repo: String,
    pub branch: String,
    pub commit_sha: String,
    pub description: Option<String>,
    pub languages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindingAnnotation {
    pub finding_id: i64,
    pub risk: String,
    pub remediation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub provider: String,
    pub executive_summary: String,
    pub recommended_actions: Vec<String>,
    pub annotations: Vec<FindingAnnotation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueDraft {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiledIssue {
    pub number: i64,
    pub url: String,
}

// ── API view types ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: Run,
    pub findings_count: i64,
    pub assessment: Option<Assessment>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanStats {
    pub total_scans: i64,
    pub by_state: std::collections::BTreeMap<String, i64>,
    pub findings: SeverityCounts,
    pub rejected_triggers: std::collections::BTreeMap<String, i64>,
}
