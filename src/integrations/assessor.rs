use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;

use super::{Assessor, classify_status, classify_transport};
use crate::errors::StageError;
use crate::scan::models::{Assessment, Finding, FindingAnnotation, RepoContext};

/// Outermost `{...}` span in a model reply.
static JSON_OBJECT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("JSON object pattern should compile"));

pub const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-5-haiku-20241022";
pub const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_MAX_TOKENS: u32 = 4000;

/// Findings beyond this are summarised by count only, highest severity first.
const MAX_PROMPT_FINDINGS: usize = 50;

const SYSTEM_PROMPT: &str = "You are a senior application security analyst. \
You review static-analysis findings and explain their real-world risk and remediation \
in concise, developer-friendly language.";

// ── Prompt ────────────────────────────────────────────────────────────

pub fn build_prompt(findings: &[Finding], context: &RepoContext) -> String {
    let mut ordered: Vec<&Finding> = findings.iter().collect();
    ordered.sort_by_key(|f| (f.severity, f.id));

    let listed: Vec<serde_json::Value> = ordered
        .iter()
        .take(MAX_PROMPT_FINDINGS)
        .map(|f| {
            json!({
                "id": f.id,
                "rule": f.rule_id,
                "severity": f.severity.as_str(),
                "file": f.path,
                "line": f.line,
                "message": f.message,
            })
        })
        .collect();
    let omitted = findings.len().saturating_sub(MAX_PROMPT_FINDINGS);

    let languages = if context.languages.is_empty() {
        "unknown".to_string()
    } else {
        context.languages.join(", ")
    };
    let findings_json =
        serde_json::to_string_pretty(&listed).unwrap_or_else(|_| "[]".to_string());

    let mut prompt = format!(
        "Assess the following static-analysis findings.\n\n\
         Repository: {}\n\
         Branch: {}\n\
         Commit: {}\n\
         Description: {}\n\
         Primary languages: {}\n\n\
         Findings:\n{}\n",
        context.repo,
        context.branch,
        context.commit_sha,
        context.description.as_deref().unwrap_or("(none)"),
        languages,
        findings_json,
    );
    if omitted > 0 {
        prompt.push_str(&format!(
            "\n{} lower-priority findings were omitted from this list.\n",
            omitted
        ));
    }
    prompt.push_str(
        "\nRespond ONLY with JSON of this exact shape:\n\
         {\n\
         \x20 \"executive_summary\": \"2-3 sentence summary\",\n\
         \x20 \"recommended_actions\": [\"prioritised action\", \"...\"],\n\
         \x20 \"findings\": [{\"id\": <finding id>, \"risk\": \"real-world risk\", \"remediation\": \"specific fix\"}]\n\
         }\n",
    );
    prompt
}

// ── Response parsing ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawAssessment {
    executive_summary: String,
    #[serde(default)]
    recommended_actions: Vec<String>,
    #[serde(default)]
    findings: Vec<RawAnnotation>,
}

#[derive(Debug, Deserialize)]
struct RawAnnotation {
    id: i64,
    risk: String,
    #[serde(default)]
    remediation: Option<String>,
}

/// Parse model output into an assessment. Accepts bare JSON or JSON embedded
/// in surrounding prose or code fences. Annotations for unknown finding ids
/// are dropped.
pub fn parse_assessment(
    provider: &str,
    text: &str,
    findings: &[Finding],
) -> Result<Assessment, StageError> {
    let raw: RawAssessment = match serde_json::from_str(text.trim()) {
        Ok(raw) => raw,
        Err(_) => {
            let candidate = JSON_OBJECT_REGEX
                .find(text)
                .map(|m| m.as_str())
                .ok_or_else(|| {
                    StageError::fatal(format!("{} response contained no JSON object", provider))
                })?;
            serde_json::from_str(candidate).map_err(|e| {
                StageError::fatal(format!("Unparseable {} assessment: {}", provider, e))
            })?
        }
    };

    let known: HashSet<i64> = findings.iter().map(|f| f.id).collect();
    let annotations = raw
        .findings
        .into_iter()
        .filter(|a| known.contains(&a.id))
        .map(|a| FindingAnnotation {
            finding_id: a.id,
            risk: a.risk,
            remediation: a.remediation.filter(|r| !r.trim().is_empty()),
        })
        .collect();

    Ok(Assessment {
        provider: provider.to_string(),
        executive_summary: raw.executive_summary,
        recommended_actions: raw.recommended_actions,
        annotations,
    })
}

async fn post_json(
    req: reqwest::RequestBuilder,
    body: &serde_json::Value,
    context: &str,
) -> Result<serde_json::Value, StageError> {
    let resp = req
        .json(body)
        .send()
        .await
        .map_err(|e| classify_transport(&e, context))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(classify_status(status, context, &text));
    }
    resp.json::<serde_json::Value>()
        .await
        .map_err(|e| StageError::fatal(format!("Failed to parse {} response: {}", context, e)))
}

// ── Anthropic ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AnthropicAssessor {
    http: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    api_url: String,
}

impl AnthropicAssessor {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens,
            api_url: ANTHROPIC_API_URL.to_string(),
        }
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }
}

#[async_trait]
impl Assessor for AnthropicAssessor {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn assess(
        &self,
        findings: &[Finding],
        context: &RepoContext,
    ) -> Result<Assessment, StageError> {
        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": 0.1,
            "system": SYSTEM_PROMPT,
            "messages": [{"role": "user", "content": build_prompt(findings, context)}],
        });
        let req = self
            .http
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION);
        let resp = post_json(req, &body, "Anthropic messages API").await?;
        let text = resp["content"][0]["text"]
            .as_str()
            .ok_or_else(|| StageError::fatal("Anthropic response missing content text"))?;
        parse_assessment(self.name(), text, findings)
    }
}

// ── OpenAI ────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct OpenAiAssessor {
    http: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    api_url: String,
}

impl OpenAiAssessor {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens,
            api_url: OPENAI_API_URL.to_string(),
        }
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }
}

#[async_trait]
impl Assessor for OpenAiAssessor {
    fn name(&self) -> &str {
        "openai"
    }

    async fn assess(
        &self,
        findings: &[Finding],
        context: &RepoContext,
    ) -> Result<Assessment, StageError> {
        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": 0.1,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": build_prompt(findings, context)},
            ],
        });
        let req = self
            .http
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key));
        let resp = post_json(req, &body, "OpenAI chat completions API").await?;
        let text = resp["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| StageError::fatal("OpenAI response missing message content"))?;
        parse_assessment(self.name(), text, findings)
    }
}

// ── Failover ──────────────────────────────────────────────────────────

/// Tries `primary`, then `secondary` on any primary failure.
pub struct FailoverAssessor {
    primary: Arc<dyn Assessor>,
    secondary: Arc<dyn Assessor>,
}

impl FailoverAssessor {
    pub fn new(primary: Arc<dyn Assessor>, secondary: Arc<dyn Assessor>) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl Assessor for FailoverAssessor {
    fn name(&self) -> &str {
        self.primary.name()
    }

    async fn assess(
        &self,
        findings: &[Finding],
        context: &RepoContext,
    ) -> Result<Assessment, StageError> {
        match self.primary.assess(findings, context).await {
            Ok(assessment) => Ok(assessment),
            Err(e) => {
                tracing::warn!(
                    primary = self.primary.name(),
                    secondary = self.secondary.name(),
                    error = %e,
                    "primary assessor failed, failing over"
                );
                self.secondary.assess(findings, context).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::fakes::FakeAssessor;
    use crate::scan::models::Severity;

    fn finding(id: i64, severity: Severity) -> Finding {
        Finding {
            id,
            run_id: 1,
            rule_id: format!("rule.{}", id),
            severity,
            path: "app.py".into(),
            line: 1,
            message: "msg".into(),
            remediation: None,
            risk_annotation: None,
            ai_remediation: None,
            created_at: String::new(),
        }
    }

    fn context() -> RepoContext {
        RepoContext {
            repo: "acme/api".into(),
            branch: "main".into(),
            commit_sha: "abc123".into(),
            description: Some("Public REST API".into()),
            languages: vec!["Python".into(), "Go".into()],
        }
    }

    #[test]
    fn test_prompt_includes_context_and_findings() {
        let prompt = build_prompt(&[finding(3, Severity::High)], &context());
        assert!(prompt.contains("acme/api"));
        assert!(prompt.contains("Public REST API"));
        assert!(prompt.contains("Python, Go"));
        assert!(prompt.contains("\"rule.3\""));
        assert!(prompt.contains("executive_summary"));
    }

    #[test]
    fn test_prompt_truncates_long_finding_lists() {
        let findings: Vec<Finding> = (1..=60).map(|i| finding(i, Severity::Low)).collect();
        let prompt = build_prompt(&findings, &context());
        assert!(prompt.contains("10 lower-priority findings were omitted"));
        assert!(!prompt.contains("\"rule.60\""));
    }

    #[test]
    fn test_parse_bare_json() {
        let text = r#"{"executive_summary": "Two issues.", "recommended_actions": ["Fix"],
                      "findings": [{"id": 1, "risk": "RCE", "remediation": "Remove eval"}]}"#;
        let a = parse_assessment("anthropic", text, &[finding(1, Severity::Critical)]).unwrap();
        assert_eq!(a.provider, "anthropic");
        assert_eq!(a.executive_summary, "Two issues.");
        assert_eq!(a.annotations.len(), 1);
        assert_eq!(a.annotations[0].remediation.as_deref(), Some("Remove eval"));
    }

    #[test]
    fn test_parse_json_wrapped_in_prose() {
        let text = "Here is the analysis:\n```json\n{\"executive_summary\": \"ok\", \"findings\": []}\n```\nThanks";
        let a = parse_assessment("openai", text, &[]).unwrap();
        assert_eq!(a.executive_summary, "ok");
        assert!(a.recommended_actions.is_empty());
    }

    #[test]
    fn test_parse_drops_unknown_finding_ids() {
        let text = r#"{"executive_summary": "s", "findings": [{"id": 99, "risk": "x"}, {"id": 2, "risk": "y"}]}"#;
        let a = parse_assessment("openai", text, &[finding(2, Severity::Low)]).unwrap();
        assert_eq!(a.annotations.len(), 1);
        assert_eq!(a.annotations[0].finding_id, 2);
    }

    #[test]
    fn test_parse_garbage_is_fatal() {
        let err = parse_assessment("openai", "I cannot help with that.", &[]).unwrap_err();
        assert!(matches!(err, StageError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_failover_uses_secondary_when_primary_fails() {
        let primary = Arc::new(FakeAssessor::failing("anthropic", StageError::transient("529 overloaded")));
        let secondary = Arc::new(FakeAssessor::succeeding("openai", "From the fallback"));
        let failover = FailoverAssessor::new(primary.clone(), secondary.clone());

        let a = failover.assess(&[finding(1, Severity::High)], &context()).await.unwrap();
        assert_eq!(a.provider, "openai");
        assert_eq!(primary.calls(), 1);
        assert_eq!(secondary.calls(), 1);
    }

    #[tokio::test]
    async fn test_failover_skips_secondary_on_success() {
        let primary = Arc::new(FakeAssessor::succeeding("anthropic", "Primary answer"));
        let secondary = Arc::new(FakeAssessor::succeeding("openai", "unused"));
        let failover = FailoverAssessor::new(primary.clone(), secondary.clone());

        let a = failover.assess(&[], &context()).await.unwrap();
        assert_eq!(a.provider, "anthropic");
        assert_eq!(secondary.calls(), 0);
    }
}
