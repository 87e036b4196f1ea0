//! HTTP surfaces: the Supervisor's control API and the Desired-State
//! Store's CRUD + SSE API, both built on `axum` over the shared `tokio`
//! runtime.
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config;
use crate::constants::SHUTDOWN_DEADLINE;
use crate::error::{ComposeUnavailable, StoreError, SupervisorError};
use crate::model::{ProcessState, Service};
use crate::store::{ChangeReason, Store, StateChange, UpdateOutcome};
use crate::supervisor::{SimpleOutcome, StartOutcome, Supervisor};

/// Normalizes every handler failure onto the status codes the control APIs
/// are specified to return: validation errors 400, unknown ids 404, dropped
/// connections to a downstream collaborator 503 as `ComposeUnavailable`, and
/// anything else a generic 500.
#[derive(Debug)]
pub enum HttpError {
    /// A lower-level Supervisor failure (registry/io), not an ordinary
    /// outcome like `NotFound`/`AlreadyRunning`.
    Supervisor(SupervisorError),
    /// A Desired-State Store failure.
    Store(StoreError),
    /// A config document failed to parse or validate.
    Config(config::ConfigError),
    /// A downstream collaborator could not be reached at all.
    Unavailable(String),
}

impl From<SupervisorError> for HttpError {
    fn from(err: SupervisorError) -> Self {
        HttpError::Supervisor(err)
    }
}

impl From<StoreError> for HttpError {
    fn from(err: StoreError) -> Self {
        HttpError::Store(err)
    }
}

impl From<config::ConfigError> for HttpError {
    fn from(err: config::ConfigError) -> Self {
        HttpError::Config(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        match self {
            HttpError::Supervisor(SupervisorError::NotFound(name)) => (
                StatusCode::NOT_FOUND,
                Json(ErrorBody {
                    error: format!("no such process: {name}"),
                }),
            )
                .into_response(),
            HttpError::Supervisor(err @ SupervisorError::AlreadyRunning(_)) => (
                StatusCode::CONFLICT,
                Json(ErrorBody {
                    error: err.to_string(),
                }),
            )
                .into_response(),
            HttpError::Supervisor(err @ SupervisorError::DependencyUnsatisfied { .. }) => (
                StatusCode::CONFLICT,
                Json(ErrorBody {
                    error: err.to_string(),
                }),
            )
                .into_response(),
            HttpError::Supervisor(err @ SupervisorError::Registry(_)) => (
                StatusCode::CONFLICT,
                Json(ErrorBody {
                    error: err.to_string(),
                }),
            )
                .into_response(),
            HttpError::Supervisor(err @ SupervisorError::Io(_)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: err.to_string(),
                }),
            )
                .into_response(),
            HttpError::Store(StoreError::Validation(detail)) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody { error: detail }),
            )
                .into_response(),
            HttpError::Store(StoreError::NotFound(id)) => (
                StatusCode::NOT_FOUND,
                Json(ErrorBody {
                    error: format!("no such service: {id}"),
                }),
            )
                .into_response(),
            HttpError::Store(err @ StoreError::Serde(_)) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: err.to_string(),
                }),
            )
                .into_response(),
            HttpError::Store(err @ StoreError::Io(_)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: err.to_string(),
                }),
            )
                .into_response(),
            HttpError::Config(err) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: err.to_string(),
                }),
            )
                .into_response(),
            HttpError::Unavailable(detail) => {
                (StatusCode::SERVICE_UNAVAILABLE, Json(ComposeUnavailable::new(detail))).into_response()
            }
        }
    }
}

// ---------------------------------------------------------------------
// Supervisor control API
// ---------------------------------------------------------------------

#[derive(Serialize)]
struct ProcessesResponse {
    data: Vec<ProcessState>,
}

#[derive(Serialize)]
struct LogsResponse {
    logs: Vec<String>,
}

#[derive(Deserialize)]
struct ProjectStateQuery {
    #[serde(default, rename = "withMemory")]
    with_memory: bool,
}

#[derive(Serialize)]
struct ProjectStateResponse {
    processes: Vec<ProcessState>,
    with_memory: bool,
    logs: Option<HashMap<String, Vec<String>>>,
}

/// Builds the Supervisor's control API router (§6), mounted standalone on
/// the Supervisor's own port.
pub fn supervisor_router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/processes", get(list_processes))
        .route("/process/logs/:name/:end_offset/:limit", get(process_logs))
        .route("/process/logs/:name", delete(truncate_logs))
        .route("/process/start/:name", post(start_process))
        .route("/process/stop/:name", patch(stop_process))
        .route("/processes/stop", patch(stop_many))
        .route("/process/restart/:name", post(restart_process))
        .route("/process/scale/:name/:count", patch(scale_process))
        .route("/project/state/", get(project_state))
        .route("/project/configuration", post(reload_configuration))
        .route("/project", post(apply_overrides))
        .route("/project/stop/", post(stop_project))
        .with_state(supervisor)
}

async fn list_processes(State(supervisor): State<Arc<Supervisor>>) -> impl IntoResponse {
    Json(ProcessesResponse {
        data: supervisor.list().await,
    })
}

async fn process_logs(
    State(supervisor): State<Arc<Supervisor>>,
    Path((name, end_offset, limit)): Path<(String, i64, usize)>,
) -> impl IntoResponse {
    Json(LogsResponse {
        logs: supervisor.logs(&name, end_offset, limit).await,
    })
}

async fn truncate_logs(
    State(supervisor): State<Arc<Supervisor>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    supervisor.truncate_logs(&name).await;
    StatusCode::OK
}

async fn start_process(
    State(supervisor): State<Arc<Supervisor>>,
    Path(name): Path<String>,
) -> Result<Response, HttpError> {
    match supervisor.start(&name).await? {
        StartOutcome::Ok => Ok(StatusCode::OK.into_response()),
        StartOutcome::NotFound => Ok((
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("no such process: {name}"),
            }),
        )
            .into_response()),
        StartOutcome::AlreadyRunning => Ok((
            StatusCode::CONFLICT,
            Json(ErrorBody {
                error: format!("process '{name}' is already running"),
            }),
        )
            .into_response()),
        StartOutcome::DependencyUnsatisfied { dependency } => Ok((
            StatusCode::CONFLICT,
            Json(ErrorBody {
                error: format!("process '{name}' is waiting on dependency '{dependency}'"),
            }),
        )
            .into_response()),
    }
}

fn simple_outcome_response(name: &str, outcome: SimpleOutcome) -> Response {
    match outcome {
        SimpleOutcome::Ok => StatusCode::OK.into_response(),
        SimpleOutcome::NotFound => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("no such process: {name}"),
            }),
        )
            .into_response(),
    }
}

async fn stop_process(
    State(supervisor): State<Arc<Supervisor>>,
    Path(name): Path<String>,
) -> Result<Response, HttpError> {
    let outcome = supervisor.stop(&name).await?;
    Ok(simple_outcome_response(&name, outcome))
}

async fn stop_many(
    State(supervisor): State<Arc<Supervisor>>,
    Json(names): Json<Vec<String>>,
) -> impl IntoResponse {
    let results = supervisor.stop_many(&names).await;
    let partial = results.values().any(|status| status.starts_with("error"));
    let status = if partial { StatusCode::MULTI_STATUS } else { StatusCode::OK };
    (status, Json(results))
}

async fn restart_process(
    State(supervisor): State<Arc<Supervisor>>,
    Path(name): Path<String>,
) -> Result<Response, HttpError> {
    let outcome = supervisor.restart(&name).await?;
    Ok(simple_outcome_response(&name, outcome))
}

async fn scale_process(
    State(supervisor): State<Arc<Supervisor>>,
    Path((name, count)): Path<(String, u32)>,
) -> Result<Response, HttpError> {
    let outcome = supervisor.scale(&name, count).await?;
    Ok(simple_outcome_response(&name, outcome))
}

async fn project_state(
    State(supervisor): State<Arc<Supervisor>>,
    Query(query): Query<ProjectStateQuery>,
) -> impl IntoResponse {
    let processes = supervisor.list().await;
    let logs = if query.with_memory {
        let mut map = HashMap::new();
        for process in &processes {
            map.insert(process.name.clone(), supervisor.logs(&process.name, 0, 0).await);
        }
        Some(map)
    } else {
        None
    };
    Json(ProjectStateResponse {
        processes,
        with_memory: query.with_memory,
        logs,
    })
}

async fn reload_configuration(State(supervisor): State<Arc<Supervisor>>) -> Result<Response, HttpError> {
    let path = config::resolve_path(None);
    let registry = config::load(&path)?;
    let statuses: HashMap<String, String> = registry
        .list()
        .into_iter()
        .map(|spec| (spec.name, "reloaded".to_string()))
        .collect();
    supervisor.reload(registry).await?;
    Ok(Json(statuses).into_response())
}

async fn apply_overrides(
    State(supervisor): State<Arc<Supervisor>>,
    body: String,
) -> Result<Response, HttpError> {
    let registry = config::load_from_str(&body)?;
    let statuses: HashMap<String, String> = registry
        .list()
        .into_iter()
        .map(|spec| (spec.name, "applied".to_string()))
        .collect();
    supervisor.reload(registry).await?;
    Ok(Json(statuses).into_response())
}

async fn stop_project(State(supervisor): State<Arc<Supervisor>>) -> impl IntoResponse {
    if let Err(err) = supervisor.shutdown(SHUTDOWN_DEADLINE).await {
        warn!(error = %err, "project shutdown did not complete cleanly");
    }
    StatusCode::OK
}

// ---------------------------------------------------------------------
// Desired-State Store API
// ---------------------------------------------------------------------

#[derive(Serialize)]
struct ServicesResponse {
    services: Vec<Service>,
}

#[derive(Deserialize)]
struct UpdateRequest {
    service: Service,
}

/// Builds the Desired-State Store's HTTP + SSE router (§6), mounted
/// standalone on the store's own port.
pub fn store_router(store: Arc<Store>) -> Router {
    Router::new()
        .route("/v1/services", get(list_services))
        .route("/v1/services/update", patch(update_service))
        .route("/v1/events", get(stream_events))
        .with_state(store)
}

async fn list_services(State(store): State<Arc<Store>>) -> impl IntoResponse {
    let state = store.state().await;
    Json(ServicesResponse {
        services: state.services,
    })
}

async fn update_service(
    State(store): State<Arc<Store>>,
    Json(request): Json<UpdateRequest>,
) -> Result<Response, HttpError> {
    match store.update(request.service).await? {
        UpdateOutcome::Created => Ok(StatusCode::CREATED.into_response()),
        UpdateOutcome::Replaced => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn stream_events(
    State(store): State<Arc<Store>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let mut changes = store.subscribe();
    let initial = StateChange {
        reason: ChangeReason::Initial,
        time: chrono::Utc::now(),
        state: store.state().await,
    };

    let stream = async_stream::stream! {
        yield Ok(to_sse_event(&initial));
        loop {
            match changes.changed().await {
                Ok(()) => {
                    let change = changes.borrow().clone();
                    yield Ok(to_sse_event(&change));
                }
                Err(_) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

fn to_sse_event(change: &StateChange) -> SseEvent {
    let payload = serde_json::to_string(change).unwrap_or_default();
    SseEvent::default().event("state").data(payload)
}
