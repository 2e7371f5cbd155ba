//! External collaborators the pipeline delegates to.
//!
//! Each collaborator is a trait object so the controller can be driven by the
//! real adapters in production and by scripted fakes in tests:
//!
//! - `SourceHost`: commit lookup, clone, repository context, issue filing (`github`)
//! - `Analyzer`: static analysis of a checked-out tree (`semgrep`)
//! - `Assessor`: AI risk commentary (`assessor`)
//! - `Notifier`: fire-and-forget email delivery (`notifier`)
//!
//! All methods report failures as `StageError` so the executor can apply
//! its retry policy uniformly.

pub mod assessor;
pub mod fakes;
pub mod github;
pub mod notifier;
pub mod report;
pub mod semgrep;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::StageError;
use crate::scan::models::{
    Assessment, FiledIssue, Finding, IssueDraft, RawFinding, RepoContext,
};

#[async_trait]
pub trait SourceHost: Send + Sync {
    /// `Ok(false)` when the host positively reports the commit as absent.
    async fn commit_exists(&self, repo: &str, commit_sha: &str) -> Result<bool, StageError>;

    async fn head_commit(&self, repo: &str, branch: &str) -> Result<String, StageError>;

    /// Check out exactly `commit_sha` into `dest`, replacing anything already there.
    async fn clone_repo(
        &self,
        repo: &str,
        branch: &str,
        commit_sha: &str,
        dest: &Path,
    ) -> Result<(), StageError>;

    async fn repo_context(
        &self,
        repo: &str,
        branch: &str,
        commit_sha: &str,
    ) -> Result<RepoContext, StageError>;

    async fn create_issue(&self, repo: &str, draft: &IssueDraft) -> Result<FiledIssue, StageError>;
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, path: &Path) -> Result<Vec<RawFinding>, StageError>;
}

#[async_trait]
pub trait Assessor: Send + Sync {
    fn name(&self) -> &str;

    async fn assess(
        &self,
        findings: &[Finding],
        context: &RepoContext,
    ) -> Result<Assessment, StageError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub subject: String,
    pub body: String,
    pub recipients: Vec<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), StageError>;
}

/// The set of collaborators one controller drives runs with.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn SourceHost>,
    pub analyzer: Arc<dyn Analyzer>,
    /// `None` when no inference provider is configured; runs then complete
    /// with enrichment skipped.
    pub assessor: Option<Arc<dyn Assessor>>,
    pub notifier: Arc<dyn Notifier>,
}

// ── HTTP error classification ─────────────────────────────────────────

/// Map a non-success HTTP status to a stage error.
///
/// 408, 429 and 5xx are transient. Everything else (auth, validation,
/// not found) is fatal and must not be retried.
pub fn classify_status(status: reqwest::StatusCode, context: &str, body: &str) -> StageError {
    let snippet: String = body.chars().take(200).collect();
    let msg = format!("{} returned {}: {}", context, status, snippet);
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        StageError::transient(msg)
    } else {
        StageError::fatal(msg)
    }
}

/// Connection-level failures are transient; anything else from the client
/// (bad URL, body encoding) is fatal.
pub fn classify_transport(err: &reqwest::Error, context: &str) -> StageError {
    let msg = format!("{}: {}", context, err);
    if err.is_timeout() || err.is_connect() || err.is_request() {
        StageError::transient(msg)
    } else {
        StageError::fatal(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_rate_limit_and_server_errors_are_transient() {
        for status in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::INTERNAL_SERVER_ERROR,
        ] {
            assert!(classify_status(status, "api", "").is_retryable(), "{}", status);
        }
    }

    #[test]
    fn test_auth_and_validation_errors_are_fatal() {
        for status in [
            StatusCode::UNAUTHORIZED,
            StatusCode::FORBIDDEN,
            StatusCode::NOT_FOUND,
            StatusCode::UNPROCESSABLE_ENTITY,
        ] {
            assert!(!classify_status(status, "api", "").is_retryable(), "{}", status);
        }
    }

    #[test]
    fn test_status_message_truncates_body() {
        let body = "x".repeat(1000);
        let err = classify_status(StatusCode::BAD_REQUEST, "GitHub issues API", &body);
        let msg = err.to_string();
        assert!(msg.contains("GitHub issues API"));
        assert!(msg.len() < 300);
    }
}
