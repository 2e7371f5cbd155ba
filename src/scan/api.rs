use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;

use super::ledger::RunLedger;
use super::models::{RunFilter, RunState, Trigger, TriggerSource};
use super::scheduler::{Scheduler, SubmitOutcome};
use crate::errors::{StageError, WatchmanError};
use crate::integrations::SourceHost;
use crate::integrations::github::{branch_from_ref, verify_signature};

const DEFAULT_LIST_LIMIT: i64 = 10;
const MAX_LIST_LIMIT: i64 = 100;
const MANUAL_SCAN_LABEL: &str = "Manual security scan";
const MANUAL_PUSHER: &str = "manual";
const ZERO_SHA: &str = "0000000000000000000000000000000000000000";

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub ledger: RunLedger,
    pub scheduler: Arc<Scheduler>,
    pub source: Arc<dyn SourceHost>,
    /// When set, webhook deliveries must carry a valid `X-Hub-Signature-256`.
    pub webhook_secret: Option<String>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

/// The subset of a GitHub push event the intake path reads.
#[derive(Debug, Default, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "ref")]
    pub git_ref: Option<String>,
    pub after: Option<String>,
    pub commits: Option<Vec<serde_json::Value>>,
    pub head_commit: Option<PushCommit>,
    pub repository: Option<PushRepository>,
    pub pusher: Option<PushPusher>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PushCommit {
    pub id: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PushRepository {
    pub full_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PushPusher {
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ManualScanRequest {
    pub repo_name: String,
    #[serde(default = "default_branch")]
    pub branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub repo: Option<String>,
    pub limit: Option<i64>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<WatchmanError> for ApiError {
    fn from(err: WatchmanError) -> Self {
        match err {
            WatchmanError::RunNotFound { .. } => ApiError::NotFound(err.to_string()),
            WatchmanError::BadRequest(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::Internal(err.to_string())
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/webhook/github", post(github_webhook))
        .route("/scan/manual", post(manual_scan))
        .route("/scan/{id}", get(get_scan))
        .route("/scan/{id}/findings", get(get_scan_findings))
        .route("/scans", get(list_scans))
        .route("/repos/{owner}/{repo}/scans", get(list_repo_scans))
        .route("/stats", get(get_stats))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Translate a scheduler outcome into the HTTP acknowledgement.
fn outcome_response(outcome: SubmitOutcome) -> Response {
    let status = match &outcome {
        SubmitOutcome::Accepted { .. } => StatusCode::ACCEPTED,
        SubmitOutcome::Rejected { .. } => StatusCode::OK,
        SubmitOutcome::Backpressure => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(outcome)).into_response()
}

fn ignored(reason: &str) -> Response {
    (
        StatusCode::OK,
        Json(json!({"outcome": "ignored", "message": reason})),
    )
        .into_response()
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

/// Build a trigger from a push event, or explain why it is not one.
fn trigger_from_push(event: PushEvent) -> Result<Option<Trigger>, ApiError> {
    let (Some(git_ref), Some(_)) = (event.git_ref.as_deref(), event.commits.as_ref()) else {
        return Ok(None);
    };
    if event.after.as_deref() == Some(ZERO_SHA) {
        return Ok(None);
    }

    let repo = event
        .repository
        .and_then(|r| r.full_name)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing repository name".into()))?;
    let branch = branch_from_ref(git_ref);
    if branch.is_empty() {
        return Err(ApiError::BadRequest("Missing branch".into()));
    }

    let head = event.head_commit.unwrap_or_default();
    let commit_sha = head
        .id
        .or(event.after)
        .filter(|sha| !sha.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing head commit".into()))?;

    Ok(Some(Trigger {
        repo,
        branch: branch.to_string(),
        commit_sha,
        label: head.message.unwrap_or_default(),
        pusher: event
            .pusher
            .and_then(|p| p.name)
            .unwrap_or_else(|| "unknown".to_string()),
        source: TriggerSource::Webhook,
    }))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.ledger.db().call(|db| db.stats()).await.map_err(internal)?;
    Ok(Json(json!({"status": "healthy", "total_scans": stats.total_scans})))
}

async fn github_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    if let Some(secret) = &state.webhook_secret {
        let signature = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok());
        if !verify_signature(secret, &body, signature) {
            tracing::warn!("rejected webhook with invalid signature");
            return Err(ApiError::Unauthorized("Invalid signature".into()));
        }
    }

    let event_kind = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("push");
    if event_kind == "ping" {
        return Ok((StatusCode::OK, Json(json!({"message": "pong"}))).into_response());
    }

    let event: PushEvent = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON payload: {}", e)))?;
    let Some(trigger) = trigger_from_push(event)? else {
        tracing::debug!(event = event_kind, "ignoring non-push webhook");
        return Ok(ignored("Not a push event"));
    };

    tracing::info!(
        repo = %trigger.repo,
        branch = %trigger.branch,
        commit = %trigger.commit_sha,
        pusher = %trigger.pusher,
        "push received"
    );
    let outcome = state.scheduler.submit(trigger).await?;
    Ok(outcome_response(outcome))
}

async fn manual_scan(
    State(state): State<SharedState>,
    Json(req): Json<ManualScanRequest>,
) -> Result<Response, ApiError> {
    if req.repo_name.trim().is_empty() || req.branch.trim().is_empty() {
        return Err(ApiError::BadRequest("repo_name and branch are required".into()));
    }
    let commit_sha = state
        .source
        .head_commit(&req.repo_name, &req.branch)
        .await
        .map_err(|e| match e {
            StageError::Fatal(msg) => ApiError::BadRequest(msg),
            other => ApiError::Unavailable(other.to_string()),
        })?;

    let trigger = Trigger {
        repo: req.repo_name,
        branch: req.branch,
        commit_sha,
        label: MANUAL_SCAN_LABEL.to_string(),
        pusher: MANUAL_PUSHER.to_string(),
        source: TriggerSource::Manual,
    };
    let outcome = state.scheduler.submit(trigger).await?;
    Ok(outcome_response(outcome))
}

async fn get_scan(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state
        .ledger
        .db()
        .call(move |db| db.get_run_detail(id))
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::NotFound(format!("Scan {} not found", id)))?;
    Ok(Json(detail))
}

async fn get_scan_findings(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    // 404 for unknown runs rather than an empty list.
    state.ledger.require(id).await?;
    let findings = state.ledger.findings(id).await?;
    Ok(Json(json!({"scan_id": id, "findings": findings})))
}

async fn list_scans(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let run_state = query
        .status
        .as_deref()
        .map(RunState::from_str)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let filter = RunFilter {
        state: run_state,
        repo: query.repo,
    };
    let runs = state.ledger.list(filter, clamp_limit(query.limit)).await?;
    Ok(Json(runs))
}

async fn list_repo_scans(
    State(state): State<SharedState>,
    Path((owner, repo)): Path<(String, String)>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = RunFilter {
        state: None,
        repo: Some(format!("{}/{}", owner, repo)),
    };
    let runs = state.ledger.list(filter, clamp_limit(query.limit)).await?;
    Ok(Json(runs))
}

async fn get_stats(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.ledger.db().call(|db| db.stats()).await.map_err(internal)?;
    Ok(Json(stats))
}
