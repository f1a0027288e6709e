//! HTTP surface ("HTTP front end"): a thin
//! background-task + poll facade over [`crate::healing_loop::HealingLoop`].
//!
//! `POST /api/run` kicks off a run in a spawned task and returns a task id
//! immediately; `GET /api/result/{task_id}` polls it. This is the same
//! accept-then-poll shape as a typical CI remediation server, just
//! without a webhook body to parse: the caller already knows what it wants
//! healed.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::healing_loop::{HealingLoop, RunRequest};
use crate::providers::{HttpProvider, LlmProvider, ProviderRegistry};
use crate::report::RunReport;
use crate::runner::ShellRunner;
use crate::vcs::GitVcs;

/// Status of a task tracked by the server. `Done`/`Error` are terminal.
#[derive(Debug, Clone)]
enum TaskStatus {
    Running,
    Done(Box<RunReport>),
    Error(String),
}

/// Shared server state: configuration and the in-memory task table.
pub struct ServerState {
    config: Config,
    tasks: RwLock<HashMap<Uuid, TaskStatus>>,
}

impl ServerState {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            tasks: RwLock::new(HashMap::new()),
        }
    }
}

/// Build the HTTP router (`/api/run`, `/api/result/{task_id}`,
/// `/api/health`).
#[must_use]
pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/run", post(run_handler))
        .route("/api/result/{task_id}", get(result_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve the HTTP surface until the process is killed.
///
/// # Errors
///
/// Returns an error if the listener cannot bind `addr`.
pub async fn run_server(state: Arc<ServerState>, addr: &str) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr, "healer HTTP surface listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    providers_configured: usize,
    workspace_writable: bool,
}

/// Deepened beyond a bare `{"status": "ok"}`, which remains a
/// subset of this response.
async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let workspace_writable = std::fs::create_dir_all(&state.config.workspace).is_ok();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        providers_configured: state.config.providers.len(),
        workspace_writable,
    })
}

#[derive(Debug, Deserialize)]
struct RunRequestBody {
    repo_url: String,
    team_name: String,
    team_leader: String,
    #[serde(default)]
    upstream_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct RunAcceptedResponse {
    task_id: Uuid,
}

async fn run_handler(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<RunRequestBody>,
) -> impl IntoResponse {
    let task_id = Uuid::new_v4();
    state.tasks.write().await.insert(task_id, TaskStatus::Running);

    let request = RunRequest {
        repo_url: body.repo_url,
        team_name: body.team_name,
        team_leader: body.team_leader,
        upstream_token: body.upstream_token,
    };

    tokio::spawn(execute_run(Arc::clone(&state), task_id, request));

    (StatusCode::OK, Json(RunAcceptedResponse { task_id }))
}

async fn execute_run(state: Arc<ServerState>, task_id: Uuid, request: RunRequest) {
    let config = state.config.clone();
    let providers: Vec<Box<dyn LlmProvider>> = config
        .providers
        .iter()
        .cloned()
        .map(|p| Box::new(HttpProvider::new(p)) as Box<dyn LlmProvider>)
        .collect();

    let mut core = HealingLoop {
        vcs: GitVcs::new(config.workspace.clone()),
        runner: ShellRunner,
        providers: ProviderRegistry::new(providers),
        history: crate::history::HistoryLog::new(config.history_log_path.clone()),
        ci_poller: config
            .github_token
            .as_ref()
            .map(|_| Box::new(crate::ci_poll::GithubCiPoller) as Box<dyn crate::ci_poll::CiPoller>),
        retry_limit: config.retry_limit,
        wall_clock_limit: config.wall_clock_limit,
        ensemble_deadline: config.api_timeout,
        workspace_root: config.workspace.clone().into(),
        github_ci_timeout: config.github_ci_timeout,
    };

    let report = core.run(request).await;
    info!(%task_id, ci_status = ?report.ci_status, "run finished");
    state
        .tasks
        .write()
        .await
        .insert(task_id, TaskStatus::Done(Box::new(report)));
}

/// `{"status":"running"}`, `{"status":"error","error":msg}`,
/// or the full [`RunReport`] with no wrapping `status` field. `Done` is an
/// untagged newtype variant so it serializes as the report's own fields.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ResultResponse {
    Running { status: &'static str },
    Error { status: &'static str, error: String },
    Done(Box<RunReport>),
}

async fn result_handler(
    State(state): State<Arc<ServerState>>,
    AxumPath(task_id): AxumPath<Uuid>,
) -> impl IntoResponse {
    let tasks = state.tasks.read().await;
    match tasks.get(&task_id) {
        Some(TaskStatus::Running) => (
            StatusCode::OK,
            Json(ResultResponse::Running { status: "running" }),
        ),
        Some(TaskStatus::Done(report)) => {
            (StatusCode::OK, Json(ResultResponse::Done(report.clone())))
        }
        Some(TaskStatus::Error(message)) => (
            StatusCode::OK,
            Json(ResultResponse::Error {
                status: "error",
                error: message.clone(),
            }),
        ),
        None => {
            error!(%task_id, "unknown task id requested");
            (
                StatusCode::NOT_FOUND,
                Json(ResultResponse::Error {
                    status: "error",
                    error: format!("no task with id {task_id}"),
                }),
            )
        }
    }
}
