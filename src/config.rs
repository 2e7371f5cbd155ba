//! Layered configuration for the watchman service.
//!
//! Values are resolved file → environment → CLI. The file is
//! `watchman.toml` (optional; every field has a default):
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8000
//! db_path = "data/watchman.db"
//!
//! [scheduler]
//! workers = 4
//! queue_depth = 100
//!
//! [guard]
//! branch_prefix = "security-fixes-"
//! commit_prefix = "security:"
//! lease_ttl_secs = 900
//!
//! [stages]
//! clone_secs = 300
//! analyze_secs = 600
//! retry_attempts = 3
//!
//! [github]
//! issue_labels = ["security", "watchman-scan", "needs-triage"]
//!
//! [analyzer]
//! rulesets = ["p/security-audit", "p/owasp-top-ten"]
//!
//! [assessor]
//! provider = "anthropic"
//! failover = true
//!
//! [notifier]
//! relay_url = "https://mail.internal/send"
//! recipients = ["security@example.com"]
//! ```
//!
//! Secrets are never read from the file and never serialized:
//! `GITHUB_TOKEN`, `GITHUB_WEBHOOK_SECRET`, `ANTHROPIC_API_KEY`,
//! `OPENAI_API_KEY`, `NOTIFY_RELAY_TOKEN`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::integrations::assessor::{
    AnthropicAssessor, DEFAULT_ANTHROPIC_MODEL, DEFAULT_MAX_TOKENS, DEFAULT_OPENAI_MODEL,
    FailoverAssessor, OpenAiAssessor,
};
use crate::integrations::github::GitHubClient;
use crate::integrations::notifier::{LogNotifier, RelayNotifier};
use crate::integrations::report::DEFAULT_ISSUE_LABELS;
use crate::integrations::semgrep::{DEFAULT_RULESETS, SemgrepAnalyzer};
use crate::integrations::{Assessor, Collaborators, Notifier};
use crate::scan::controller::{ControllerConfig, StageTimeouts};
use crate::scan::executor::RetryPolicy;
use crate::scan::guard::GuardConfig;
use crate::scan::scheduler::SchedulerConfig;

pub const DEFAULT_CONFIG_FILE: &str = "watchman.toml";

// ── Sections ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    /// Permissive CORS and bind on all interfaces.
    pub dev_mode: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            db_path: PathBuf::from("data/watchman.db"),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub workers: usize,
    pub queue_depth: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            workers: defaults.workers,
            queue_depth: defaults.queue_depth,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardSection {
    pub branch_prefix: String,
    pub commit_prefix: String,
    pub lease_ttl_secs: u64,
}

impl Default for GuardSection {
    fn default() -> Self {
        let defaults = GuardConfig::default();
        Self {
            branch_prefix: defaults.branch_prefix,
            commit_prefix: defaults.commit_prefix,
            lease_ttl_secs: defaults.lease_ttl.as_secs(),
        }
    }
}

/// Per-stage timeouts (seconds, retries included) and the network retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagesSection {
    pub verify_secs: u64,
    pub clone_secs: u64,
    pub analyze_secs: u64,
    pub assess_secs: u64,
    pub file_secs: u64,
    pub notify_secs: u64,
    pub retry_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for StagesSection {
    fn default() -> Self {
        let t = StageTimeouts::default();
        let retry = RetryPolicy::network();
        Self {
            verify_secs: t.verify.as_secs(),
            clone_secs: t.clone.as_secs(),
            analyze_secs: t.analyze.as_secs(),
            assess_secs: t.assess.as_secs(),
            file_secs: t.file.as_secs(),
            notify_secs: t.notify.as_secs(),
            retry_attempts: retry.max_attempts,
            retry_base_ms: retry.base_delay.as_millis() as u64,
            retry_max_ms: retry.max_delay.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubSection {
    pub api_url: String,
    pub web_url: String,
    pub issue_labels: Vec<String>,
    #[serde(skip)]
    pub token: Option<String>,
    #[serde(skip)]
    pub webhook_secret: Option<String>,
}

impl Default for GitHubSection {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            web_url: "https://github.com".to_string(),
            issue_labels: DEFAULT_ISSUE_LABELS.iter().map(|s| s.to_string()).collect(),
            token: None,
            webhook_secret: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerSection {
    pub binary: String,
    pub rulesets: Vec<String>,
    /// Per-rule timeout handed to the analyzer itself.
    pub rule_timeout_secs: u64,
}

impl Default for AnalyzerSection {
    fn default() -> Self {
        Self {
            binary: "semgrep".to_string(),
            rulesets: DEFAULT_RULESETS.iter().map(|s| s.to_string()).collect(),
            rule_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssessorProvider {
    #[default]
    Anthropic,
    OpenAi,
    /// Never call an inference service; every run completes degraded.
    None,
}

impl std::fmt::Display for AssessorProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssessorProvider::Anthropic => write!(f, "anthropic"),
            AssessorProvider::OpenAi => write!(f, "openai"),
            AssessorProvider::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssessorSection {
    pub provider: AssessorProvider,
    /// Fall back to the other provider when the preferred one fails.
    pub failover: bool,
    pub anthropic_model: String,
    pub openai_model: String,
    pub max_tokens: u32,
    #[serde(skip)]
    pub anthropic_api_key: Option<String>,
    #[serde(skip)]
    pub openai_api_key: Option<String>,
}

impl Default for AssessorSection {
    fn default() -> Self {
        Self {
            provider: AssessorProvider::default(),
            failover: true,
            anthropic_model: DEFAULT_ANTHROPIC_MODEL.to_string(),
            openai_model: DEFAULT_OPENAI_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            anthropic_api_key: None,
            openai_api_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierSection {
    /// HTTP mail relay endpoint; log-only delivery when unset.
    pub relay_url: Option<String>,
    pub from: String,
    pub recipients: Vec<String>,
    #[serde(skip)]
    pub relay_token: Option<String>,
}

impl Default for NotifierSection {
    fn default() -> Self {
        Self {
            relay_url: None,
            from: "watchman@localhost".to_string(),
            recipients: Vec::new(),
            relay_token: None,
        }
    }
}

// ── Root ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchmanConfig {
    pub server: ServerSection,
    pub scheduler: SchedulerSection,
    pub guard: GuardSection,
    pub stages: StagesSection,
    pub github: GitHubSection,
    pub analyzer: AnalyzerSection,
    pub assessor: AssessorSection,
    pub notifier: NotifierSection,
}

impl WatchmanConfig {
    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse watchman.toml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Resolve file and process environment.
    ///
    /// An explicit `path` must exist; without one, `./watchman.toml` is read
    /// when present and defaults are used otherwise.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay environment values. `lookup` is injectable for tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = get("DATABASE_PATH") {
            self.server.db_path = PathBuf::from(path);
        }
        if let Some(port) = get("WATCHMAN_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid WATCHMAN_PORT '{}'", port))?;
        }
        if let Some(url) = get("NOTIFY_RELAY_URL") {
            self.notifier.relay_url = Some(url);
        }
        if let Some(list) = get("NOTIFICATION_RECIPIENTS") {
            self.notifier.recipients = list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        self.github.token = get("GITHUB_TOKEN");
        self.github.webhook_secret = get("GITHUB_WEBHOOK_SECRET");
        self.assessor.anthropic_api_key = get("ANTHROPIC_API_KEY");
        self.assessor.openai_api_key = get("OPENAI_API_KEY");
        self.notifier.relay_token = get("NOTIFY_RELAY_TOKEN");
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.github.webhook_secret.is_none() {
            warnings.push(
                "GITHUB_WEBHOOK_SECRET is not set; webhook signatures will not be verified".into(),
            );
        }
        if self.github.token.is_none() {
            warnings.push("GITHUB_TOKEN is not set; private repositories cannot be cloned and issues cannot be filed".into());
        }
        if self.assessor.provider != AssessorProvider::None && self.assessor_chain().is_empty() {
            warnings.push(format!(
                "No API key for assessor provider '{}'; runs will complete without AI enrichment",
                self.assessor.provider
            ));
        }
        let longest_stage = self.controller_config().timeouts.longest();
        if self.guard.lease_ttl_secs <= longest_stage.as_secs() {
            warnings.push(format!(
                "guard.lease_ttl_secs ({}) does not exceed the longest stage timeout ({}s); \
                 a slow but healthy run can lose its lease and be scanned twice",
                self.guard.lease_ttl_secs,
                longest_stage.as_secs()
            ));
        }
        if self.scheduler.workers == 0 {
            warnings.push("scheduler.workers is 0; using 1".into());
        }
        if self.notifier.relay_url.is_some() && self.notifier.recipients.is_empty() {
            warnings.push("notifier.relay_url is set but no recipients are configured".into());
        }
        warnings
    }

    /// TOML dump with a trailing secrets table that only says which are set.
    pub fn render_redacted(&self) -> Result<String> {
        let mut out = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        let mark = |v: &Option<String>| if v.is_some() { "<redacted>" } else { "<unset>" };
        out.push_str("\n[secrets]\n");
        for (name, value) in [
            ("GITHUB_TOKEN", &self.github.token),
            ("GITHUB_WEBHOOK_SECRET", &self.github.webhook_secret),
            ("ANTHROPIC_API_KEY", &self.assessor.anthropic_api_key),
            ("OPENAI_API_KEY", &self.assessor.openai_api_key),
            ("NOTIFY_RELAY_TOKEN", &self.notifier.relay_token),
        ] {
            out.push_str(&format!("{} = \"{}\"\n", name, mark(value)));
        }
        Ok(out)
    }

    // ── Component configs ─────────────────────────────────────────────

    pub fn guard_config(&self) -> GuardConfig {
        GuardConfig {
            branch_prefix: self.guard.branch_prefix.clone(),
            commit_prefix: self.guard.commit_prefix.clone(),
            lease_ttl: Duration::from_secs(self.guard.lease_ttl_secs),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            workers: self.scheduler.workers.max(1),
            queue_depth: self.scheduler.queue_depth.max(1),
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        let s = &self.stages;
        ControllerConfig {
            timeouts: StageTimeouts {
                verify: Duration::from_secs(s.verify_secs),
                clone: Duration::from_secs(s.clone_secs),
                analyze: Duration::from_secs(s.analyze_secs),
                assess: Duration::from_secs(s.assess_secs),
                file: Duration::from_secs(s.file_secs),
                notify: Duration::from_secs(s.notify_secs),
            },
            network_retry: RetryPolicy {
                max_attempts: s.retry_attempts.max(1),
                base_delay: Duration::from_millis(s.retry_base_ms),
                max_delay: Duration::from_millis(s.retry_max_ms),
            },
            issue_labels: self.github.issue_labels.clone(),
            notify_recipients: self.notifier.recipients.clone(),
            workdir_root: None,
        }
    }

    /// Providers with a key, preferred first.
    fn assessor_chain(&self) -> Vec<Arc<dyn Assessor>> {
        let a = &self.assessor;
        let anthropic = a.anthropic_api_key.as_ref().map(|key| {
            Arc::new(AnthropicAssessor::new(key.clone(), a.anthropic_model.clone(), a.max_tokens))
                as Arc<dyn Assessor>
        });
        let openai = a.openai_api_key.as_ref().map(|key| {
            Arc::new(OpenAiAssessor::new(key.clone(), a.openai_model.clone(), a.max_tokens))
                as Arc<dyn Assessor>
        });
        let ordered = match a.provider {
            AssessorProvider::Anthropic => [anthropic, openai],
            AssessorProvider::OpenAi => [openai, anthropic],
            AssessorProvider::None => return Vec::new(),
        };
        ordered.into_iter().flatten().collect()
    }

    fn build_assessor(&self) -> Option<Arc<dyn Assessor>> {
        let mut chain = self.assessor_chain().into_iter();
        let primary = chain.next()?;
        match chain.next() {
            Some(secondary) if self.assessor.failover => {
                Some(Arc::new(FailoverAssessor::new(primary, secondary)))
            }
            _ => Some(primary),
        }
    }

    /// Production collaborators: GitHub, semgrep, the configured assessor
    /// and the mail relay (or log-only delivery).
    pub fn collaborators(&self) -> Collaborators {
        let github = GitHubClient::new(self.github.token.clone())
            .with_urls(self.github.api_url.clone(), self.github.web_url.clone());
        let analyzer = SemgrepAnalyzer::new(
            self.analyzer.binary.clone(),
            self.analyzer.rulesets.clone(),
            self.analyzer.rule_timeout_secs,
        );
        let notifier: Arc<dyn Notifier> = match &self.notifier.relay_url {
            Some(url) => Arc::new(RelayNotifier::new(
                url.clone(),
                self.notifier.relay_token.clone(),
                self.notifier.from.clone(),
            )),
            None => Arc::new(LogNotifier),
        };
        Collaborators {
            source: Arc::new(github),
            analyzer: Arc::new(analyzer),
            assessor: self.build_assessor(),
            notifier,
        }
    }
}
