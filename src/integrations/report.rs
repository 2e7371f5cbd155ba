//! Rendering of the tracking issue and the notification email.

use std::fmt::Write as _;

use super::Notification;
use crate::scan::models::{
    Assessment, FiledIssue, Finding, IssueDraft, Run, Severity, SeverityCounts,
};

pub const DEFAULT_ISSUE_LABELS: &[&str] = &["security", "watchman-scan", "needs-triage"];

fn short_sha(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}

/// Markdown table cells cannot contain raw pipes or newlines.
fn cell(text: &str) -> String {
    text.replace('|', "\\|").replace(['\n', '\r'], " ")
}

pub fn issue_title(counts: &SeverityCounts) -> String {
    let total = counts.total();
    if counts.critical > 0 {
        format!(
            "Security Alert: {} critical issue{} found ({} total findings)",
            counts.critical,
            if counts.critical == 1 { "" } else { "s" },
            total
        )
    } else {
        format!(
            "Security Review: {} issue{} detected",
            total,
            if total == 1 { "" } else { "s" }
        )
    }
}

pub fn build_issue(
    run: &Run,
    findings: &[Finding],
    assessment: Option<&Assessment>,
    labels: &[String],
) -> IssueDraft {
    let counts = SeverityCounts::from_severities(findings.iter().map(|f| &f.severity));
    let mut body = String::new();

    let _ = writeln!(body, "## Watchman Security Scan Report\n");
    let _ = writeln!(body, "| | |\n|---|---|");
    let _ = writeln!(body, "| **Repository** | `{}` |", run.repo);
    let _ = writeln!(body, "| **Branch** | `{}` |", run.branch);
    let _ = writeln!(body, "| **Commit** | `{}` |", short_sha(&run.commit_sha));
    if !run.pusher.is_empty() {
        let _ = writeln!(body, "| **Pushed by** | {} |", cell(&run.pusher));
    }
    let _ = writeln!(body, "| **Scan run** | #{} |", run.id);
    let _ = writeln!(
        body,
        "| **Findings** | {} critical, {} high, {} medium, {} low |",
        counts.critical, counts.high, counts.medium, counts.low
    );

    let _ = writeln!(body, "\n## Executive Summary\n");
    match assessment {
        Some(a) => {
            let _ = writeln!(body, "{}\n", a.executive_summary.trim());
        }
        None => {
            let _ = writeln!(
                body,
                "_AI enrichment unavailable for this run. Findings below are the raw static-analysis results._\n"
            );
        }
    }

    for severity in Severity::ALL {
        let group: Vec<&Finding> = findings.iter().filter(|f| f.severity == severity).collect();
        if group.is_empty() {
            continue;
        }
        let _ = writeln!(
            body,
            "## {} ({})\n",
            match severity {
                Severity::Critical => "Critical",
                Severity::High => "High",
                Severity::Medium => "Medium",
                Severity::Low => "Low",
            },
            group.len()
        );
        let _ = writeln!(body, "| Location | Rule | Message | Risk | Remediation |");
        let _ = writeln!(body, "|---|---|---|---|---|");
        for f in group {
            let remediation = f
                .ai_remediation
                .as_deref()
                .or(f.remediation.as_deref())
                .unwrap_or("");
            let _ = writeln!(
                body,
                "| `{}:{}` | `{}` | {} | {} | {} |",
                cell(&f.path),
                f.line,
                cell(&f.rule_id),
                cell(&f.message),
                cell(f.risk_annotation.as_deref().unwrap_or("")),
                cell(remediation)
            );
        }
        body.push('\n');
    }

    if let Some(a) = assessment {
        if !a.recommended_actions.is_empty() {
            let _ = writeln!(body, "## Recommended Actions\n");
            for (i, action) in a.recommended_actions.iter().enumerate() {
                let _ = writeln!(body, "{}. {}", i + 1, action);
            }
            body.push('\n');
        }
    }

    let _ = writeln!(body, "---");
    let _ = write!(
        body,
        "_Generated automatically by Watchman{}._",
        match assessment {
            Some(a) => format!(" (static analysis + {} assessment)", a.provider),
            None => " (static analysis)".to_string(),
        }
    );

    IssueDraft {
        title: issue_title(&counts),
        body,
        labels: labels.to_vec(),
    }
}

pub fn build_notification(
    run: &Run,
    counts: &SeverityCounts,
    issue: Option<&FiledIssue>,
    assessment: Option<&Assessment>,
    recipients: &[String],
) -> Notification {
    let subject = format!(
        "[Watchman] {}: {} finding{} ({} critical) on {}",
        run.repo,
        counts.total(),
        if counts.total() == 1 { "" } else { "s" },
        counts.critical,
        run.branch
    );
    let mut body = String::new();
    let _ = writeln!(body, "Security scan completed for {}", run.repo);
    let _ = writeln!(body);
    let _ = writeln!(body, "Branch:  {}", run.branch);
    let _ = writeln!(body, "Commit:  {}", short_sha(&run.commit_sha));
    if !run.pusher.is_empty() {
        let _ = writeln!(body, "Pusher:  {}", run.pusher);
    }
    let _ = writeln!(body);
    for severity in Severity::ALL {
        let _ = writeln!(body, "{:<9}{}", format!("{}:", severity.as_str()), counts.get(severity));
    }
    if let Some(a) = assessment {
        let _ = writeln!(body);
        let _ = writeln!(body, "{}", a.executive_summary.trim());
    }
    if let Some(issue) = issue {
        let _ = writeln!(body);
        let _ = writeln!(body, "Tracking issue: {}", issue.url);
    }
    Notification {
        subject,
        body,
        recipients: recipients.to_vec(),
    }
}
