//! HTTP control plane for the daemon.
//!
//! Task lifecycle actions, workspace/runner/quota/settings CRUD, full log
//! snapshots, and SSE log streaming. Transport rules: 400 for precondition
//! violations, 404 for missing rows, 422 for invalid inputs.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post, put},
    Json, Router,
};
use futures_util::{
    stream::{self, Stream},
    StreamExt,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use aitask_core::{
    fuzzy, BackendKind, QuotaState, Runner, Task, TaskStatus, Workspace, WorkspaceKind,
};

use crate::config::Settings;
use crate::executor::{cleanup_task_worktree, Executor};
use crate::merge;
use crate::settings as settings_service;
use crate::ssh;
use crate::storage::{NewTask, NewWorkspace, Storage, StorageError};

/// Poll cadence for the SSE log stream.
const LOG_STREAM_POLL: Duration = Duration::from_secs(1);

/// Timeout for workspace health and resource probes.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state for HTTP handlers.
#[derive(Debug)]
pub struct AppState {
    pub storage: Arc<Storage>,
    pub executor: Arc<Executor>,
    pub settings: Settings,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = std::result::Result<T, ApiError>;

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub detail: String,
}

fn api_error(status: StatusCode, detail: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            detail: detail.into(),
        }),
    )
}

fn internal_error(err: impl std::fmt::Display) -> ApiError {
    error!("internal error: {err}");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

fn storage_error(err: StorageError) -> ApiError {
    match err {
        StorageError::TaskNotFound(_) => api_error(StatusCode::NOT_FOUND, "Task not found"),
        StorageError::WorkspaceNotFound(_) => {
            api_error(StatusCode::NOT_FOUND, "Workspace not found")
        }
        StorageError::RunnerNotFound(_) => api_error(StatusCode::NOT_FOUND, "Runner not found"),
        StorageError::RunNotFound(_) => api_error(StatusCode::NOT_FOUND, "Run not found"),
        other => internal_error(other),
    }
}

/// Create the router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/tasks", post(create_task).get(list_tasks))
        .route("/api/tasks/next-number", get(next_task_number))
        .route(
            "/api/tasks/{id}",
            get(get_task).patch(rename_task).delete(delete_task),
        )
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/retry", post(retry_task))
        .route("/api/tasks/{id}/continue", post(continue_task))
        .route("/api/tasks/{id}/merge", post(merge_task))
        .route("/api/tasks/{id}/mark-done", post(mark_task_done))
        .route("/api/logs/{run_id}", get(get_logs))
        .route("/api/logs/{run_id}/stream", get(stream_logs))
        .route(
            "/api/workspaces",
            post(create_workspace).get(list_workspaces),
        )
        .route(
            "/api/workspaces/{id}",
            get(get_workspace).delete(delete_workspace),
        )
        .route("/api/workspaces/{id}/health", get(workspace_health))
        .route("/api/workspaces/{id}/resources", get(workspace_resources))
        .route("/api/workspaces/{id}/files", get(workspace_files))
        .route("/api/runners", get(list_runners))
        .route("/api/quota", get(list_quota_states))
        .route("/api/settings", get(get_settings).put(put_settings))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process shuts down.
pub async fn start_server(
    state: Arc<AppState>,
    host: &str,
    port: u16,
    cors_origins: &[String],
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let origins: Vec<HeaderValue> = cors_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any);

    let router = create_router(state).layer(cors);
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    info!("HTTP server listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

// --- Tasks ---

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    pub prompt: String,
    pub workspace_id: i64,
    pub backend: BackendKind,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub permission_mode: Option<String>,
}

fn validate_prompt(settings: &Settings, prompt: &str) -> ApiResult<()> {
    if prompt.trim().is_empty() {
        return Err(api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Prompt must not be empty",
        ));
    }
    if prompt.chars().count() > settings.prompt_max_chars {
        return Err(api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!(
                "Prompt exceeds the {} character limit",
                settings.prompt_max_chars
            ),
        ));
    }
    Ok(())
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTaskRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.title.trim().is_empty() {
        return Err(api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Title must not be empty",
        ));
    }
    validate_prompt(&state.settings, &req.prompt)?;

    let workspace = state
        .storage
        .get_workspace(req.workspace_id)
        .await
        .map_err(|_| api_error(StatusCode::BAD_REQUEST, "Workspace not found"))?;
    if workspace.kind == WorkspaceKind::Local
        && !crate::git::has_git_marker(FsPath::new(&workspace.path))
    {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Workspace is not a git repository",
        ));
    }

    let task = state
        .storage
        .insert_task(NewTask {
            title: req.title,
            prompt: req.prompt,
            workspace_id: req.workspace_id,
            backend: req.backend,
            branch_name: req.branch_name,
            model: req.model,
            permission_mode: req.permission_mode,
        })
        .await
        .map_err(storage_error)?;

    info!(task_id = task.id, "created task");
    Ok((StatusCode::CREATED, Json(task)))
}

#[derive(Debug, Deserialize, Default)]
pub struct ListTasksQuery {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub workspace_id: Option<i64>,
}

async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTasksQuery>,
) -> ApiResult<Json<Vec<Task>>> {
    let tasks = state
        .storage
        .list_tasks(query.status, query.workspace_id)
        .await
        .map_err(storage_error)?;
    Ok(Json(tasks))
}

#[derive(Debug, Deserialize)]
pub struct NextTaskNumberQuery {
    pub workspace_id: i64,
}

#[derive(Debug, Serialize)]
pub struct NextTaskNumberResponse {
    pub next_number: i64,
    pub suggested_title: String,
}

async fn next_task_number(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NextTaskNumberQuery>,
) -> ApiResult<Json<NextTaskNumberResponse>> {
    let workspace = state
        .storage
        .get_workspace(query.workspace_id)
        .await
        .map_err(|_| api_error(StatusCode::BAD_REQUEST, "Workspace not found"))?;
    let next_number = state
        .storage
        .max_task_id_in_workspace(query.workspace_id)
        .await
        .map_err(storage_error)?
        + 1;
    Ok(Json(NextTaskNumberResponse {
        next_number,
        suggested_title: format!("{}-{}", workspace.display_name, next_number),
    }))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Task>> {
    let task = state.storage.get_task(id).await.map_err(storage_error)?;
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
pub struct RenameTaskRequest {
    pub title: String,
}

async fn rename_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<RenameTaskRequest>,
) -> ApiResult<Json<Task>> {
    if req.title.trim().is_empty() {
        return Err(api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Title must not be empty",
        ));
    }
    state
        .storage
        .set_task_title(id, &req.title)
        .await
        .map_err(storage_error)?;
    let task = state.storage.get_task(id).await.map_err(storage_error)?;
    Ok(Json(task))
}

async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let task = state.storage.get_task(id).await.map_err(storage_error)?;
    if task.status == TaskStatus::Running {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Cannot delete a running task. Cancel it first.",
        ));
    }

    // Capture cleanup inputs before the rows disappear.
    let worktree = task.worktree_path.clone();
    let workspace = state.storage.get_workspace(task.workspace_id).await.ok();

    state.storage.delete_task(id).await.map_err(storage_error)?;

    // Best-effort worktree cleanup after the DB commit.
    if let (Some(worktree), Some(workspace)) = (worktree, workspace) {
        tokio::spawn(async move {
            cleanup_task_worktree(id, &worktree, &workspace).await;
        });
    }

    info!(task_id = id, "deleted task");
    Ok(Json(serde_json::json!({ "message": "Task deleted successfully" })))
}

async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    state.storage.get_task(id).await.map_err(storage_error)?;
    if !state.executor.cancel(id).await {
        return Err(api_error(StatusCode::BAD_REQUEST, "Cannot cancel task"));
    }
    Ok(Json(serde_json::json!({ "message": "Task cancelled successfully" })))
}

async fn retry_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Task>> {
    let task = state.storage.get_task(id).await.map_err(storage_error)?;
    if task.status != TaskStatus::Failed {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Only failed tasks can be retried",
        ));
    }
    let task = state.storage.requeue_task(id).await.map_err(storage_error)?;
    info!(task_id = id, "task re-queued for retry");
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
pub struct ContinueTaskRequest {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
}

async fn continue_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<ContinueTaskRequest>,
) -> ApiResult<Json<Task>> {
    validate_prompt(&state.settings, &req.prompt)?;
    let task = state.storage.get_task(id).await.map_err(storage_error)?;
    if !matches!(
        task.status,
        TaskStatus::ToBeReview | TaskStatus::Done | TaskStatus::Failed
    ) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Only reviewable, done, or failed tasks can be continued",
        ));
    }
    let task = state
        .storage
        .continue_task(id, &req.prompt, req.model.as_deref())
        .await
        .map_err(storage_error)?;
    info!(task_id = id, "task re-queued with new instructions");
    Ok(Json(task))
}

async fn merge_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Task>> {
    let task = state.storage.get_task(id).await.map_err(storage_error)?;
    if task.status != TaskStatus::ToBeReview {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Only tasks awaiting review can be merged",
        ));
    }
    let workspace = state
        .storage
        .get_workspace(task.workspace_id)
        .await
        .map_err(storage_error)?;

    let merge_result = if workspace.kind.is_remote() {
        let Some(host) = workspace.host.as_deref().filter(|h| !h.is_empty()) else {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "SSH workspace has no host configured",
            ));
        };
        let ssh_args = ssh::connection_args(host, workspace.port, workspace.ssh_user.as_deref());
        let remote_repo = ssh::extract_remote_path(&workspace.path, workspace.kind);
        merge::merge_remote(
            &task,
            &ssh_args,
            &remote_repo,
            workspace.container_name.as_deref(),
        )
        .await
    } else {
        merge::merge_local(&task, FsPath::new(&workspace.path), true).await
    };

    if let Err(err) = merge_result {
        warn!(task_id = id, error = %err, "merge failed");
        return Err(api_error(StatusCode::BAD_REQUEST, err.to_string()));
    }

    if let Some(worktree) = task.worktree_path.as_deref() {
        cleanup_task_worktree(id, worktree, &workspace).await;
    }
    state
        .storage
        .set_task_worktree(id, None)
        .await
        .map_err(storage_error)?;
    state
        .storage
        .update_task_status(id, TaskStatus::Done)
        .await
        .map_err(storage_error)?;

    info!(task_id = id, "task merged and done");
    let task = state.storage.get_task(id).await.map_err(storage_error)?;
    Ok(Json(task))
}

async fn mark_task_done(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Task>> {
    let task = state.storage.get_task(id).await.map_err(storage_error)?;
    if task.status != TaskStatus::ToBeReview {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Only tasks awaiting review can be marked done",
        ));
    }

    if let Some(worktree) = task.worktree_path.as_deref() {
        if let Ok(workspace) = state.storage.get_workspace(task.workspace_id).await {
            cleanup_task_worktree(id, worktree, &workspace).await;
        }
        state
            .storage
            .set_task_worktree(id, None)
            .await
            .map_err(storage_error)?;
    }
    state
        .storage
        .update_task_status(id, TaskStatus::Done)
        .await
        .map_err(storage_error)?;

    info!(task_id = id, "task marked done without merge");
    let task = state.storage.get_task(id).await.map_err(storage_error)?;
    Ok(Json(task))
}

// --- Logs ---

async fn get_logs(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let run = state.storage.get_run(run_id).await.map_err(storage_error)?;
    Ok(Json(serde_json::json!({
        "run_id": run.run_id,
        "task_id": run.task_id,
        "started_at": run.started_at,
        "ended_at": run.ended_at,
        "exit_code": run.exit_code,
        "log_blob": run.log_blob.unwrap_or_default(),
    })))
}

/// SSE log stream: the already-present bytes as one initial `log` event,
/// then delta suffixes as the blob grows, then one `complete` event once
/// the run ends. Bytes are delivered once, in order.
async fn stream_logs(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<i64>,
) -> ApiResult<Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>>> {
    state.storage.get_run(run_id).await.map_err(storage_error)?;

    let storage = Arc::clone(&state.storage);
    let stream = stream::unfold(
        (storage, 0usize, false, true),
        move |(storage, cursor, done, first)| async move {
            if done {
                return None;
            }
            if !first {
                tokio::time::sleep(LOG_STREAM_POLL).await;
            }

            let Ok(run) = storage.get_run(run_id).await else {
                return None;
            };
            let blob = run.log_blob.unwrap_or_default();

            let mut events: Vec<std::result::Result<SseEvent, Infallible>> = Vec::new();
            let mut cursor = cursor;
            if blob.len() > cursor {
                let delta = blob.get(cursor..).unwrap_or(blob.as_str()).to_string();
                cursor = blob.len();
                let payload = serde_json::json!({
                    "run_id": run_id,
                    "content": delta,
                });
                events.push(Ok(SseEvent::default()
                    .event("log")
                    .data(payload.to_string())));
            }

            let mut finished = false;
            if let Some(ended_at) = run.ended_at {
                let payload = serde_json::json!({
                    "run_id": run_id,
                    "exit_code": run.exit_code,
                    "ended_at": ended_at,
                });
                events.push(Ok(SseEvent::default()
                    .event("complete")
                    .data(payload.to_string())));
                finished = true;
            } else if let Ok(task) = storage.get_task_for_run(run_id).await {
                // Defensive: the task left the active states without its
                // run being ended; close after this final delta.
                if !matches!(task.status, TaskStatus::Todo | TaskStatus::Running) {
                    finished = true;
                }
            }

            Some((stream::iter(events), (storage, cursor, finished, false)))
        },
    )
    .flatten();

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// --- Workspaces ---

#[derive(Debug, Deserialize)]
pub struct CreateWorkspaceRequest {
    pub path: String,
    pub display_name: String,
    #[serde(default = "default_workspace_kind")]
    pub kind: WorkspaceKind,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub login_shell: Option<String>,
    #[serde(default)]
    pub runner_id: Option<i64>,
}

fn default_workspace_kind() -> WorkspaceKind {
    WorkspaceKind::Local
}

/// Canonical path: absolute filesystem path for Local, URL-shaped
/// identifier for the SSH kinds.
fn build_canonical_path(req: &CreateWorkspaceRequest) -> String {
    match req.kind {
        WorkspaceKind::Local => {
            let path = PathBuf::from(&req.path);
            std::fs::canonicalize(&path)
                .unwrap_or(path)
                .to_string_lossy()
                .into_owned()
        }
        WorkspaceKind::Ssh => {
            let user = req
                .ssh_user
                .as_deref()
                .map(|u| format!("{u}@"))
                .unwrap_or_default();
            let port = req.port.unwrap_or(22);
            format!("ssh://{user}{}:{port}{}", req.host.as_deref().unwrap_or(""), req.path)
        }
        WorkspaceKind::SshContainer => {
            let user = req
                .ssh_user
                .as_deref()
                .map(|u| format!("{u}@"))
                .unwrap_or_default();
            let port = req.port.unwrap_or(22);
            format!(
                "ssh://{user}{}:{port}/container/{}:{}",
                req.host.as_deref().unwrap_or(""),
                req.container_name.as_deref().unwrap_or(""),
                req.path
            )
        }
    }
}

async fn create_workspace(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateWorkspaceRequest>,
) -> ApiResult<impl IntoResponse> {
    match req.kind {
        WorkspaceKind::Local => {
            if !FsPath::new(&req.path).exists() {
                return Err(api_error(
                    StatusCode::BAD_REQUEST,
                    "Local workspace path does not exist",
                ));
            }
        }
        WorkspaceKind::Ssh | WorkspaceKind::SshContainer => {
            if req.host.as_deref().map_or(true, str::is_empty) {
                return Err(api_error(
                    StatusCode::BAD_REQUEST,
                    "Host is required for SSH workspace",
                ));
            }
            if req.kind == WorkspaceKind::SshContainer
                && req.container_name.as_deref().map_or(true, str::is_empty)
            {
                return Err(api_error(
                    StatusCode::BAD_REQUEST,
                    "Container name is required for SSH container workspace",
                ));
            }
        }
    }

    let canonical_path = build_canonical_path(&req);
    if state
        .storage
        .get_workspace_by_path(&canonical_path)
        .await
        .map_err(storage_error)?
        .is_some()
    {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Workspace with this path already exists",
        ));
    }

    let runner_id = match req.runner_id {
        Some(id) => state
            .storage
            .get_runner(id)
            .await
            .map_err(|_| api_error(StatusCode::BAD_REQUEST, "Runner not found"))?
            .runner_id,
        None => state
            .storage
            .list_runners()
            .await
            .map_err(storage_error)?
            .first()
            .map(|r| r.runner_id)
            .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "No runner available"))?,
    };

    let concurrency_limit = settings_service::get_workspace_max_parallel(&state.storage)
        .await
        .map_err(storage_error)?;

    let workspace = state
        .storage
        .insert_workspace(NewWorkspace {
            path: canonical_path,
            display_name: req.display_name,
            kind: req.kind,
            host: req.host,
            port: req.port,
            ssh_user: req.ssh_user,
            container_name: req.container_name,
            login_shell: req.login_shell,
            runner_id,
            concurrency_limit,
        })
        .await
        .map_err(storage_error)?;

    info!(workspace_id = workspace.workspace_id, "created workspace");
    Ok((StatusCode::CREATED, Json(workspace)))
}

async fn list_workspaces(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<Workspace>>> {
    let workspaces = state.storage.list_workspaces().await.map_err(storage_error)?;
    Ok(Json(workspaces))
}

async fn get_workspace(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Workspace>> {
    let workspace = state.storage.get_workspace(id).await.map_err(storage_error)?;
    Ok(Json(workspace))
}

async fn delete_workspace(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    state.storage.get_workspace(id).await.map_err(storage_error)?;
    let running = state
        .storage
        .count_running_in_workspace(id)
        .await
        .map_err(storage_error)?;
    if running > 0 {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Cannot delete workspace with running tasks. Cancel them first.",
        ));
    }
    state.storage.delete_workspace(id).await.map_err(storage_error)?;
    info!(workspace_id = id, "deleted workspace");
    Ok(StatusCode::NO_CONTENT)
}

// --- Workspace health ---

#[derive(Debug, Serialize)]
pub struct WorkspaceHealthResponse {
    pub reachable: bool,
    pub is_git: bool,
    pub message: String,
}

async fn workspace_health(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<WorkspaceHealthResponse>> {
    let workspace = state.storage.get_workspace(id).await.map_err(storage_error)?;

    if workspace.kind == WorkspaceKind::Local {
        let path = FsPath::new(&workspace.path);
        if !path.exists() {
            return Ok(Json(WorkspaceHealthResponse {
                reachable: false,
                is_git: false,
                message: "Path not found".to_string(),
            }));
        }
        let is_git = crate::git::has_git_marker(path);
        return Ok(Json(WorkspaceHealthResponse {
            reachable: true,
            is_git,
            message: if is_git { "OK" } else { "Not a git repository" }.to_string(),
        }));
    }

    let Some(host) = workspace.host.as_deref().filter(|h| !h.is_empty()) else {
        return Ok(Json(WorkspaceHealthResponse {
            reachable: false,
            is_git: false,
            message: "No host configured".to_string(),
        }));
    };
    let ssh_args = ssh::connection_args(host, workspace.port, workspace.ssh_user.as_deref());
    let remote_path = ssh::extract_remote_path(&workspace.path, workspace.kind);

    if ssh::probe(&ssh_args, "echo ok", PROBE_TIMEOUT).await.is_none() {
        return Ok(Json(WorkspaceHealthResponse {
            reachable: false,
            is_git: false,
            message: "SSH connection failed".to_string(),
        }));
    }

    if workspace.kind == WorkspaceKind::SshContainer {
        let container = workspace.container_name.as_deref().unwrap_or("");
        let check = format!(
            "docker inspect --format={{{{.State.Running}}}} {} 2>/dev/null",
            ssh::shell_quote(container)
        );
        let running = ssh::probe(&ssh_args, &check, PROBE_TIMEOUT).await;
        if running.as_deref() != Some("true") {
            return Ok(Json(WorkspaceHealthResponse {
                reachable: true,
                is_git: false,
                message: format!("Container '{container}' is not running"),
            }));
        }
    }

    let git_check = format!(
        "git -C {} rev-parse --git-dir 2>/dev/null && echo GIT_OK || echo NOT_GIT",
        ssh::shell_quote(&remote_path)
    );
    let git_check = match (workspace.kind, workspace.container_name.as_deref()) {
        (WorkspaceKind::SshContainer, Some(container)) => {
            ssh::wrap_container(&git_check, container, None)
        }
        _ => git_check,
    };
    let result = ssh::probe(&ssh_args, &git_check, PROBE_TIMEOUT).await;
    let is_git = result.map(|out| out.contains("GIT_OK")).unwrap_or(false);

    Ok(Json(WorkspaceHealthResponse {
        reachable: true,
        is_git,
        message: if is_git { "OK" } else { "Not a git repository" }.to_string(),
    }))
}

// --- Workspace resources ---

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuInfo {
    pub name: String,
    pub memory_used_mb: i64,
    pub memory_total_mb: i64,
    pub utilization_pct: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryInfo {
    pub total_mb: i64,
    pub used_mb: i64,
    pub free_mb: i64,
    pub used_pct: f64,
}

#[derive(Debug, Serialize)]
pub struct WorkspaceResourcesResponse {
    pub gpu: Option<Vec<GpuInfo>>,
    pub gpu_available: bool,
    pub memory: Option<MemoryInfo>,
}

const NVIDIA_SMI_CMD: &str = "nvidia-smi \
    --query-gpu=name,memory.used,memory.total,utilization.gpu \
    --format=csv,noheader,nounits";

/// Parse nvidia-smi CSV output.
fn parse_gpu_output(raw: &str) -> Option<Vec<GpuInfo>> {
    let gpus: Vec<GpuInfo> = raw
        .trim()
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').map(str::trim).collect();
            if parts.len() < 4 {
                return None;
            }
            Some(GpuInfo {
                name: parts[0].to_string(),
                memory_used_mb: parts[1].parse().ok()?,
                memory_total_mb: parts[2].parse().ok()?,
                utilization_pct: parts[3].parse().ok()?,
            })
        })
        .collect();
    (!gpus.is_empty()).then_some(gpus)
}

/// Parse `free -m` output (Linux).
fn parse_memory_linux(raw: &str) -> Option<MemoryInfo> {
    let line = raw.lines().find(|l| l.starts_with("Mem:"))?;
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 4 {
        return None;
    }
    let total: i64 = parts[1].parse().ok()?;
    let used: i64 = parts[2].parse().ok()?;
    let free: i64 = parts[3].parse().ok()?;
    let used_pct = if total > 0 {
        (used as f64 / total as f64 * 1000.0).round() / 10.0
    } else {
        0.0
    };
    Some(MemoryInfo {
        total_mb: total,
        used_mb: used,
        free_mb: free,
        used_pct,
    })
}

async fn run_local_probe(argv: &[&str]) -> Option<String> {
    let output = tokio::time::timeout(
        PROBE_TIMEOUT,
        tokio::process::Command::new(argv[0])
            .args(&argv[1..])
            .output(),
    )
    .await
    .ok()?
    .ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn workspace_resources(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<WorkspaceResourcesResponse>> {
    let workspace = state.storage.get_workspace(id).await.map_err(storage_error)?;

    if !workspace.kind.is_remote() {
        let gpu = match run_local_probe(&[
            "nvidia-smi",
            "--query-gpu=name,memory.used,memory.total,utilization.gpu",
            "--format=csv,noheader,nounits",
        ])
        .await
        {
            Some(raw) => parse_gpu_output(&raw),
            None => None,
        };
        let memory = match run_local_probe(&["free", "-m"]).await {
            Some(raw) => parse_memory_linux(&raw),
            None => None,
        };
        let gpu_available = gpu.is_some();
        return Ok(Json(WorkspaceResourcesResponse {
            gpu,
            gpu_available,
            memory,
        }));
    }

    let Some(host) = workspace.host.as_deref().filter(|h| !h.is_empty()) else {
        return Ok(Json(WorkspaceResourcesResponse {
            gpu: None,
            gpu_available: false,
            memory: None,
        }));
    };
    let ssh_args = ssh::connection_args(host, workspace.port, workspace.ssh_user.as_deref());

    let gpu = match ssh::probe(&ssh_args, NVIDIA_SMI_CMD, PROBE_TIMEOUT).await {
        Some(raw) => parse_gpu_output(&raw),
        None => None,
    };
    // Remote hosts are assumed Linux.
    let memory = match ssh::probe(&ssh_args, "free -m", PROBE_TIMEOUT).await {
        Some(raw) => parse_memory_linux(&raw),
        None => None,
    };
    let gpu_available = gpu.is_some();
    Ok(Json(WorkspaceResourcesResponse {
        gpu,
        gpu_available,
        memory,
    }))
}

// --- Workspace files (fuzzy suggestion) ---

#[derive(Debug, Deserialize)]
pub struct WorkspaceFilesQuery {
    #[serde(default)]
    pub query: String,
    #[serde(default = "default_files_limit")]
    pub limit: usize,
    #[serde(default)]
    pub task_id: Option<i64>,
}

fn default_files_limit() -> usize {
    8
}

async fn workspace_files(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<WorkspaceFilesQuery>,
) -> ApiResult<Json<Vec<String>>> {
    let workspace = state.storage.get_workspace(id).await.map_err(storage_error)?;

    // Search the task worktree instead of the workspace when requested.
    let mut search_path = workspace.path.clone();
    if let Some(task_id) = query.task_id {
        if let Ok(task) = state.storage.get_task(task_id).await {
            if task.workspace_id == id {
                if let Some(worktree) = task.worktree_path {
                    search_path = worktree;
                }
            }
        }
    }

    if workspace.kind == WorkspaceKind::Local {
        let q = query.query.clone();
        let limit = query.limit;
        let files = tokio::task::spawn_blocking(move || {
            fuzzy::list_files(FsPath::new(&search_path), &q, limit)
        })
        .await
        .map_err(internal_error)?;
        return Ok(Json(files));
    }

    let Some(host) = workspace.host.as_deref().filter(|h| !h.is_empty()) else {
        return Ok(Json(Vec::new()));
    };
    let ssh_args = ssh::connection_args(host, workspace.port, workspace.ssh_user.as_deref());
    let remote_path = ssh::extract_remote_path(&search_path, workspace.kind);
    let find_root = remote_path.trim_end_matches('/').to_string();
    if find_root.is_empty() {
        return Ok(Json(Vec::new()));
    }

    let find_cmd = format!(
        "find {root} -maxdepth 10 \
         \\( -name '.git' -o -name 'node_modules' -o -name '__pycache__' \
         -o -name '.next' -o -name 'venv' -o -name '.venv' \
         -o -name 'dist' -o -name 'build' -o -name 'target' \\) -prune \
         -o -type f -not -name '.*' -print 2>/dev/null | head -2000",
        root = ssh::shell_quote(&find_root)
    );
    let Some(raw) = ssh::probe(&ssh_args, &find_cmd, Duration::from_secs(15)).await else {
        return Ok(Json(Vec::new()));
    };

    let rels = raw.lines().filter_map(|line| {
        let full = line.trim();
        if full.is_empty() {
            return None;
        }
        Some(
            full.strip_prefix(&find_root)
                .map(|r| r.trim_start_matches('/').to_string())
                .unwrap_or_else(|| full.to_string()),
        )
    });
    Ok(Json(fuzzy::rank_paths(rels, &query.query, query.limit)))
}

// --- Runners / quota / settings ---

async fn list_runners(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Runner>>> {
    let runners = state.storage.list_runners().await.map_err(storage_error)?;
    Ok(Json(runners))
}

async fn list_quota_states(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<QuotaState>>> {
    let states = state.storage.list_quota_states().await.map_err(storage_error)?;
    Ok(Json(states))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SettingsBody {
    pub workspace_max_parallel: u32,
}

async fn get_settings(State(state): State<Arc<AppState>>) -> ApiResult<Json<SettingsBody>> {
    let value = settings_service::get_workspace_max_parallel(&state.storage)
        .await
        .map_err(storage_error)?;
    Ok(Json(SettingsBody {
        workspace_max_parallel: value,
    }))
}

/// PUT clamps the value and re-applies it to all workspaces and runners.
async fn put_settings(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SettingsBody>,
) -> ApiResult<Json<SettingsBody>> {
    let applied =
        settings_service::set_workspace_max_parallel(&state.storage, body.workspace_max_parallel)
            .await
            .map_err(storage_error)?;
    info!(workspace_max_parallel = applied, "settings updated");
    Ok(Json(SettingsBody {
        workspace_max_parallel: applied,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_csv_parses() {
        let raw = "NVIDIA GeForce RTX 4090, 1024, 24564, 37\n";
        let gpus = parse_gpu_output(raw).unwrap();
        assert_eq!(gpus.len(), 1);
        assert_eq!(gpus[0].name, "NVIDIA GeForce RTX 4090");
        assert_eq!(gpus[0].memory_used_mb, 1024);
        assert_eq!(gpus[0].utilization_pct, 37);
    }

    #[test]
    fn gpu_parse_rejects_garbage() {
        assert!(parse_gpu_output("no gpus here").is_none());
        assert!(parse_gpu_output("").is_none());
    }

    #[test]
    fn memory_free_output_parses() {
        let raw = "              total        used        free\nMem:          64205       12011       43987\nSwap:          8191           0        8191\n";
        let memory = parse_memory_linux(raw).unwrap();
        assert_eq!(memory.total_mb, 64205);
        assert_eq!(memory.used_mb, 12011);
        assert_eq!(memory.free_mb, 43987);
        assert!((memory.used_pct - 18.7).abs() < 0.1);
    }

    #[test]
    fn canonical_path_shapes() {
        let ssh_req = CreateWorkspaceRequest {
            path: "/srv/repo".to_string(),
            display_name: "r".to_string(),
            kind: WorkspaceKind::Ssh,
            host: Some("host".to_string()),
            port: Some(2222),
            ssh_user: Some("alice".to_string()),
            container_name: None,
            login_shell: None,
            runner_id: None,
        };
        assert_eq!(build_canonical_path(&ssh_req), "ssh://alice@host:2222/srv/repo");

        let container_req = CreateWorkspaceRequest {
            container_name: Some("dev".to_string()),
            kind: WorkspaceKind::SshContainer,
            port: None,
            ..ssh_req
        };
        assert_eq!(
            build_canonical_path(&container_req),
            "ssh://alice@host:22/container/dev:/srv/repo"
        );
    }
}
