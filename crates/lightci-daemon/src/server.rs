//! HTTP Control-Plane Adapter (Section 4.8): a thin, local-only REST
//! surface fronting the Runner, Scheduler, Artifact Collector and Webhook
//! Adapter.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use chrono::Utc;
use lightci_core::{Id, Pipeline, RunStatus};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::artifacts::{artifact_id, ArtifactCollector};
use crate::scheduler::Scheduler;
use crate::storage::{Storage, StorageError};
use crate::webhook::{WebhookAdapter, WebhookOutcome};
use crate::webhook::RunTrigger;

/// Shared state for HTTP handlers.
pub struct AppState {
    pub storage: Arc<Storage>,
    pub runner: Arc<dyn RunTrigger>,
    pub scheduler: Arc<Scheduler>,
    pub artifacts_root: PathBuf,
    pub webhook: Arc<WebhookAdapter>,
    pub auth_token: Option<String>,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/pipelines", post(create_pipeline).get(list_pipelines))
        .route(
            "/pipelines/{id}",
            get(get_pipeline).put(update_pipeline).delete(delete_pipeline),
        )
        .route("/pipelines/{id}/runs", post(trigger_run))
        .route("/runs", get(list_runs))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/runs/{id}/artifacts", get(list_artifacts))
        .route("/runs/{id}/artifacts/{artifact_id}/download", get(download_artifact))
        .route("/runs/{id}/artifacts/upload", post(upload_artifact))
        .route("/webhooks/{host}", post(handle_webhook))
        .route("/health", get(health_check))
        .with_state(state)
}

pub async fn start_server(
    state: Arc<AppState>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let scheduler = Arc::clone(&state.scheduler);
    let router = create_router(state);

    // Section 4.8: "bound to 127.0.0.1".
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("HTTP server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            while !scheduler.is_shutdown() {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
            info!("HTTP server stopping: shutdown requested");
        })
        .await?;

    Ok(())
}

fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    if let Some(expected) = &state.auth_token {
        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

        match provided {
            Some(token) if token == expected => Ok(()),
            Some(_) => Err(err(StatusCode::UNAUTHORIZED, "invalid auth token")),
            None => Err(err(StatusCode::UNAUTHORIZED, "missing auth token")),
        }
    } else {
        Ok(())
    }
}

fn err(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (status, Json(ErrorResponse { error: message.into() }))
}

/// Section 4.8: `NotFound`→404, `Validation`→400, everything else→500.
fn map_storage_error(e: StorageError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &e {
        StorageError::PipelineNotFound(_)
        | StorageError::RunNotFound(_)
        | StorageError::ArtifactNotFound(_)
        | StorageError::DeploymentNotFound(_)
        | StorageError::SshKeyNotFound(_) => StatusCode::NOT_FOUND,
        StorageError::Serialization(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    err(status, e.to_string())
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct PipelineRequest {
    pub name: String,
    pub repository_url: String,
    pub default_branch: String,
    #[serde(default)]
    pub steps: Vec<lightci_core::Step>,
    #[serde(default)]
    pub trigger: lightci_core::TriggerConfig,
    #[serde(default)]
    pub artifact_policy: lightci_core::ArtifactPolicy,
    #[serde(default)]
    pub deployment_policy: lightci_core::DeploymentPolicy,
    pub owner_id: Id,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListRunsQuery {
    #[serde(rename = "pipelineId")]
    pub pipeline_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TriggerRunRequest {
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TriggerRunResponse {
    pub run_id: Id,
}

#[derive(Debug, Deserialize)]
pub struct UploadArtifactRequest {
    pub relative_path: String,
    pub content_base64: String,
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn create_pipeline(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<PipelineRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;

    let now = Utc::now();
    let pipeline = Pipeline {
        id: Id::new(),
        name: req.name,
        repository_url: req.repository_url,
        default_branch: req.default_branch,
        steps: req.steps,
        trigger: req.trigger,
        artifact_policy: req.artifact_policy,
        deployment_policy: req.deployment_policy,
        owner_id: req.owner_id,
        created_at: now,
        updated_at: now,
    };

    state.storage.insert_pipeline(&pipeline).await.map_err(map_storage_error)?;
    if let Err(e) = state.scheduler.reconcile(&pipeline).await {
        warn!(pipeline_id = %pipeline.id, error = %e, "pipeline created with an unregistrable schedule");
    }

    info!(pipeline_id = %pipeline.id, "created pipeline");
    Ok((StatusCode::CREATED, Json(pipeline)))
}

async fn list_pipelines(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let pipelines = state.storage.list_pipelines().await.map_err(map_storage_error)?;
    Ok(Json(pipelines))
}

async fn get_pipeline(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let pipeline = state
        .storage
        .get_pipeline(&Id::from_string(id))
        .await
        .map_err(map_storage_error)?;
    Ok(Json(pipeline))
}

async fn update_pipeline(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<PipelineRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let id = Id::from_string(id);
    let existing = state.storage.get_pipeline(&id).await.map_err(map_storage_error)?;

    let pipeline = Pipeline {
        id,
        name: req.name,
        repository_url: req.repository_url,
        default_branch: req.default_branch,
        steps: req.steps,
        trigger: req.trigger,
        artifact_policy: req.artifact_policy,
        deployment_policy: req.deployment_policy,
        owner_id: req.owner_id,
        created_at: existing.created_at,
        updated_at: Utc::now(),
    };

    state.storage.update_pipeline(&pipeline).await.map_err(map_storage_error)?;
    if let Err(e) = state.scheduler.reconcile(&pipeline).await {
        warn!(pipeline_id = %pipeline.id, error = %e, "pipeline updated with an unregistrable schedule");
    }

    Ok(Json(pipeline))
}

async fn delete_pipeline(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let id = Id::from_string(id);
    state.storage.delete_pipeline(&id).await.map_err(map_storage_error)?;
    state.scheduler.remove(&id).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn trigger_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<TriggerRunRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let pipeline_id = Id::from_string(id);
    let pipeline = state.storage.get_pipeline(&pipeline_id).await.map_err(map_storage_error)?;

    let branch = req.branch.unwrap_or_else(|| pipeline.default_branch.clone());
    let run_id = state
        .runner
        .trigger_run(&pipeline, branch, req.commit, "manual".to_string())
        .await
        .map_err(|e| {
            if e.contains("already has an active run") {
                err(StatusCode::CONFLICT, e)
            } else {
                err(StatusCode::INTERNAL_SERVER_ERROR, e)
            }
        })?;

    Ok((StatusCode::ACCEPTED, Json(TriggerRunResponse { run_id })))
}

async fn list_runs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListRunsQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;

    let runs = match query.pipeline_id {
        Some(pipeline_id) => state
            .storage
            .list_runs_for_pipeline(&Id::from_string(pipeline_id))
            .await
            .map_err(map_storage_error)?,
        None => state.storage.list_all_runs().await.map_err(map_storage_error)?,
    };

    Ok(Json(runs))
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let run = state.storage.get_run(&Id::from_string(id)).await.map_err(map_storage_error)?;
    Ok(Json(run))
}

async fn cancel_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let run_id = Id::from_string(id);
    let mut run = state.storage.get_run(&run_id).await.map_err(map_storage_error)?;

    if run.status != RunStatus::Running {
        return Err(err(StatusCode::BAD_REQUEST, "run is not running"));
    }

    run.status = RunStatus::Cancelled;
    state.storage.update_run(&run).await.map_err(map_storage_error)?;
    info!(run_id = %run_id, "run cancellation requested");
    Ok(StatusCode::NO_CONTENT)
}

async fn list_artifacts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let run_id = Id::from_string(id);
    let run = state.storage.get_run(&run_id).await.map_err(map_storage_error)?;
    if !run.artifact_summary.collected {
        return Ok(Json(Vec::<lightci_core::ArtifactRecord>::new()));
    }
    let records = state
        .storage
        .list_artifact_records_for_run(&run_id)
        .await
        .map_err(map_storage_error)?;
    Ok(Json(records))
}

async fn download_artifact(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((run_id, artifact_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let run_id = Id::from_string(run_id);
    let run = state.storage.get_run(&run_id).await.map_err(map_storage_error)?;
    if !run.artifact_summary.collected {
        return Err(err(StatusCode::NOT_FOUND, "artifacts not yet collected for this run"));
    }

    let record = state.storage.get_artifact_record(&artifact_id).await.map_err(map_storage_error)?;
    if record.run_id != run_id {
        return Err(err(StatusCode::NOT_FOUND, "artifact not found"));
    }

    let path = state.artifacts_root.join(run_id.to_string()).join(&record.relative_path);
    let bytes = tokio::fs::read(&path).await.map_err(|e| {
        error!(path = %path.display(), error = %e, "failed to read artifact file");
        err(StatusCode::INTERNAL_SERVER_ERROR, "failed to read artifact")
    })?;

    Ok(([(header::CONTENT_TYPE, record.content_type.clone())], bytes))
}

async fn upload_artifact(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<UploadArtifactRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let run_id = Id::from_string(id);
    let mut run = state.storage.get_run(&run_id).await.map_err(map_storage_error)?;
    let pipeline = state.storage.get_pipeline(&run.pipeline_id).await.map_err(map_storage_error)?;

    let allowed = ArtifactCollector::validate_upload_path(&pipeline, &req.relative_path)
        .map_err(|e| err(StatusCode::BAD_REQUEST, e.to_string()))?;
    if !allowed {
        return Err(err(StatusCode::BAD_REQUEST, "relative_path does not match the artifact policy's patterns"));
    }

    let content = base64::engine::general_purpose::STANDARD
        .decode(&req.content_base64)
        .map_err(|e| err(StatusCode::BAD_REQUEST, format!("invalid base64 content: {e}")))?;

    let dest = state.artifacts_root.join(run_id.to_string()).join(&req.relative_path);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            err(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to create artifact directory: {e}"))
        })?;
    }
    tokio::fs::write(&dest, &content).await.map_err(|e| {
        err(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to write artifact: {e}"))
    })?;

    let record = lightci_core::ArtifactRecord {
        id: artifact_id(&run_id.to_string(), &req.relative_path),
        run_id: run_id.clone(),
        name: PathBuf::from(&req.relative_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| req.relative_path.clone()),
        relative_path: req.relative_path,
        size: content.len() as u64,
        content_type: "application/octet-stream".to_string(),
        created_at: Utc::now(),
    };
    state.storage.insert_artifact_record(&record).await.map_err(map_storage_error)?;

    run.artifact_summary.count += 1;
    run.artifact_summary.total_bytes += record.size;
    state.storage.update_run(&run).await.map_err(map_storage_error)?;

    Ok((StatusCode::CREATED, Json(record)))
}

#[derive(Debug, Serialize)]
#[serde(tag = "result")]
enum WebhookResponse {
    #[serde(rename = "triggered")]
    Triggered { run_id: Id },
    #[serde(rename = "not_supported")]
    NotSupported,
}

async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    Path(host): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let event_header = event_header_for_host(&host).and_then(|name| headers.get(name)).and_then(|v| v.to_str().ok());

    // Section 4.7: "unmatched events are acknowledged with 200 and 'not
    // supported'"; header validation errors surface as 4xx.
    match state.webhook.handle(event_header, &body).await {
        Ok(WebhookOutcome::Triggered { run_id }) => Ok((StatusCode::OK, Json(WebhookResponse::Triggered { run_id }))),
        Ok(WebhookOutcome::NotSupported) => Ok((StatusCode::OK, Json(WebhookResponse::NotSupported))),
        Err(e) => Err(err(StatusCode::BAD_REQUEST, e.to_string())),
    }
}

fn event_header_for_host(host: &str) -> Option<&'static str> {
    match host.to_lowercase().as_str() {
        "github" => Some("x-github-event"),
        "gitlab" => Some("x-gitlab-event"),
        "bitbucket" => Some("x-event-key"),
        _ => None,
    }
}
