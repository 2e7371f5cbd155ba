use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use super::Analyzer;
use crate::errors::StageError;
use crate::scan::models::{RawFinding, Severity};

pub const DEFAULT_RULESETS: &[&str] = &["p/security-audit", "p/owasp-top-ten", "p/cwe-top-25"];

#[derive(Debug, Deserialize)]
struct SemgrepOutput {
    results: Vec<SemgrepResult>,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct SemgrepResult {
    check_id: String,
    path: String,
    start: SemgrepPosition,
    #[serde(default)]
    extra: SemgrepExtra,
}

#[derive(Debug, Deserialize)]
struct SemgrepPosition {
    line: i64,
}

#[derive(Debug, Default, Deserialize)]
struct SemgrepExtra {
    #[serde(default)]
    message: String,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    fix: Option<String>,
}

/// Parse semgrep `--json` output into findings, with paths made relative to `root`.
pub fn parse_output(stdout: &str, root: &Path) -> Result<Vec<RawFinding>, StageError> {
    let output: SemgrepOutput = serde_json::from_str(stdout)
        .map_err(|e| StageError::fatal(format!("Unparseable semgrep output: {}", e)))?;
    if !output.errors.is_empty() {
        tracing::debug!(errors = output.errors.len(), "semgrep reported non-fatal errors");
    }
    let prefix = format!("{}/", root.to_string_lossy().trim_end_matches('/'));
    Ok(output
        .results
        .into_iter()
        .map(|r| {
            let path = r
                .path
                .strip_prefix(prefix.as_str())
                .map(str::to_string)
                .unwrap_or(r.path);
            RawFinding {
                rule_id: r.check_id,
                severity: Severity::from_analyzer_label(
                    r.extra.severity.as_deref().unwrap_or("INFO"),
                ),
                path,
                line: r.start.line,
                message: r.extra.message,
                remediation: r.extra.fix.filter(|f| !f.trim().is_empty()),
            }
        })
        .collect())
}

/// Runs the `semgrep` CLI against a checked-out tree.
#[derive(Debug, Clone)]
pub struct SemgrepAnalyzer {
    binary: String,
    rulesets: Vec<String>,
    /// Per-rule timeout passed to semgrep itself.
    rule_timeout_secs: u64,
}

impl SemgrepAnalyzer {
    pub fn new(binary: impl Into<String>, rulesets: Vec<String>, rule_timeout_secs: u64) -> Self {
        Self {
            binary: binary.into(),
            rulesets,
            rule_timeout_secs,
        }
    }

    fn args(&self, path: &Path) -> Vec<String> {
        let mut args = Vec::new();
        for rule in &self.rulesets {
            args.push("--config".to_string());
            args.push(rule.clone());
        }
        args.extend([
            "--json".to_string(),
            "--metrics".to_string(),
            "off".to_string(),
            "--timeout".to_string(),
            self.rule_timeout_secs.to_string(),
            path.to_string_lossy().to_string(),
        ]);
        args
    }
}

impl Default for SemgrepAnalyzer {
    fn default() -> Self {
        Self::new(
            "semgrep",
            DEFAULT_RULESETS.iter().map(|s| s.to_string()).collect(),
            300,
        )
    }
}

#[async_trait]
impl Analyzer for SemgrepAnalyzer {
    async fn analyze(&self, path: &Path) -> Result<Vec<RawFinding>, StageError> {
        let output = Command::new(&self.binary)
            .args(self.args(path))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| StageError::fatal(format!("Failed to run {}: {}", self.binary, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        // Exit 1 means "findings present"; any exit is fine as long as the JSON parses.
        match parse_output(&stdout, path) {
            Ok(findings) => {
                tracing::debug!(
                    exit = output.status.code().unwrap_or(-1),
                    findings = findings.len(),
                    "semgrep finished"
                );
                Ok(findings)
            }
            Err(e) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let tail: String = stderr
                    .chars()
                    .rev()
                    .take(300)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect();
                Err(StageError::fatal(format!(
                    "semgrep exited with {}: {} ({})",
                    output.status.code().unwrap_or(-1),
                    e,
                    tail.trim()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "results": [
            {
                "check_id": "python.lang.security.audit.eval-detected",
                "path": "/tmp/scan/app/api.py",
                "start": {"line": 12, "col": 5},
                "end": {"line": 12, "col": 20},
                "extra": {
                    "message": "Detected use of eval()",
                    "severity": "ERROR",
                    "lines": "eval(request.args['q'])",
                    "metadata": {"cwe": ["CWE-95"]}
                }
            },
            {
                "check_id": "python.flask.security.debug-enabled",
                "path": "/tmp/scan/app/main.py",
                "start": {"line": 3},
                "extra": {
                    "message": "Flask debug mode enabled",
                    "severity": "WARNING",
                    "fix": "app.run(debug=False)"
                }
            },
            {
                "check_id": "generic.secrets.gitleaks",
                "path": "config.yml",
                "start": {"line": 1},
                "extra": {"message": "Possible secret", "severity": "INFO", "fix": "  "}
            }
        ],
        "errors": []
    }"#;

    #[test]
    fn test_parse_maps_fields_and_severities() {
        let findings = parse_output(SAMPLE, Path::new("/tmp/scan")).unwrap();
        assert_eq!(findings.len(), 3);

        assert_eq!(findings[0].rule_id, "python.lang.security.audit.eval-detected");
        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(findings[0].path, "app/api.py");
        assert_eq!(findings[0].line, 12);
        assert!(findings[0].remediation.is_none());

        assert_eq!(findings[1].severity, Severity::High);
        assert_eq!(findings[1].remediation.as_deref(), Some("app.run(debug=False)"));

        assert_eq!(findings[2].severity, Severity::Low);
        assert_eq!(findings[2].path, "config.yml");
        assert!(findings[2].remediation.is_none());
    }

    #[test]
    fn test_parse_empty_results() {
        let findings = parse_output(r#"{"results": [], "errors": []}"#, Path::new("/x")).unwrap();
        assert!(findings.is_empty());
    }

    #[test]
    fn test_unparseable_output_is_fatal() {
        let err = parse_output("Traceback (most recent call last):", Path::new("/x")).unwrap_err();
        assert!(matches!(err, StageError::Fatal(_)));
    }

    #[test]
    fn test_args_include_rulesets_and_flags() {
        let analyzer = SemgrepAnalyzer::default();
        let args = analyzer.args(Path::new("/tmp/repo"));
        assert_eq!(args.iter().filter(|a| *a == "--config").count(), 3);
        assert!(args.contains(&"p/owasp-top-ten".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "--metrics" && w[1] == "off"));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/repo"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_fatal() {
        let analyzer = SemgrepAnalyzer::new("definitely-not-semgrep-xyz", vec![], 10);
        let err = analyzer.analyze(Path::new("/tmp")).await.unwrap_err();
        assert!(matches!(err, StageError::Fatal(_)));
    }
}
