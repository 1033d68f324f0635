//! Venture Server
//!
//! Axum surface over the job pipeline: submission, polling, live progress
//! over Server-Sent Events or WebSocket, and the OpenAPI document.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures::{
    stream::{self, Stream},
    SinkExt, StreamExt,
};
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, sync::Arc, time::Duration};
use utoipa::{OpenApi, ToSchema};

use venture_core::inference::{CannedClient, HttpInferenceClient, InferenceClient};
use venture_core::pipeline::{EventBroadcaster, EventStream, JobEvent, JobSnapshot, PipelineController};
use venture_core::state::{
    IdeaStorage, JobRegistry, JobStore, SqliteIdeaStorage, SqliteJobStore, VentureDb,
};
use venture_core::{RegistryError, SubmitError, VentureConfig};

/// Interval between SSE heartbeat comments
const HEARTBEAT: Duration = Duration::from_secs(15);

/// Application state
pub struct AppState {
    pub controller: PipelineController,
    pub config: VentureConfig,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(config: VentureConfig, controller: PipelineController) -> SharedState {
        Arc::new(Self { controller, config })
    }
}

/// How the server wires its collaborators
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Use the canned inference backend instead of a provider
    pub offline: bool,
    /// Keep jobs and reports in an in-memory database
    pub ephemeral: bool,
}

/// Open storage, recover interrupted jobs and build the controller
pub async fn bootstrap(config: VentureConfig, options: &ServerOptions) -> anyhow::Result<SharedState> {
    let db = if options.ephemeral {
        VentureDb::open_in_memory()?
    } else {
        VentureDb::open_at(&config.database_path)?
    };

    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(&db));
    let storage: Arc<dyn IdeaStorage> = Arc::new(SqliteIdeaStorage::new(&db));
    let registry = Arc::new(JobRegistry::new(store));

    let recovered = registry.recover_interrupted().await?;
    if recovered > 0 {
        tracing::warn!(recovered, "marked jobs from a previous run as interrupted");
    }

    let client: Arc<dyn InferenceClient> = if options.offline {
        tracing::info!("using canned inference backend");
        Arc::new(CannedClient::new())
    } else {
        Arc::new(HttpInferenceClient::new(config.model_config())?)
    };

    let broadcaster = Arc::new(EventBroadcaster::new(registry.clone(), config.event_buffer));
    let controller = PipelineController::new(&config, registry, broadcaster, client, storage)?;
    Ok(AppState::new(config, controller))
}

// === API Types ===

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    /// Free-form description of the business idea
    pub idea_text: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    /// Jobs in the hot set
    pub active_jobs: usize,
    /// Jobs with an open live event channel
    pub open_channels: usize,
}

/// Error mapped to a status code and a JSON `{error}` body
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        let status = match e {
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::AlreadyExists(_) => StatusCode::CONFLICT,
            _ => {
                tracing::error!(error = %e, "registry error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::Registry(e) => e.into(),
            other => Self {
                status: StatusCode::BAD_REQUEST,
                message: other.to_string(),
            },
        }
    }
}

// === OpenAPI Definition ===

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Venture API",
        version = "1.0.0",
        description = "Job orchestration API for AI business-idea validation"
    ),
    paths(
        submit_job,
        get_job,
        job_events,
        job_socket,
        job_history,
        get_analysis,
        health
    ),
    components(schemas(SubmitRequest, SubmitResponse, ErrorResponse, HealthResponse)),
    tags(
        (name = "jobs", description = "Validation job submission and progress"),
        (name = "system", description = "Service health and discovery")
    )
)]
pub struct ApiDoc;

// === API Handlers ===

/// Submit an idea for validation
#[utoipa::path(
    post,
    path = "/jobs",
    tag = "jobs",
    request_body = SubmitRequest,
    responses(
        (status = 202, description = "Job accepted", body = SubmitResponse),
        (status = 400, description = "Blank or oversized idea text", body = ErrorResponse)
    )
)]
async fn submit_job(
    State(state): State<SharedState>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let job_id = state.controller.submit(&req.idea_text).await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { job_id })))
}

/// Poll a job's current snapshot
#[utoipa::path(
    get,
    path = "/jobs/{job_id}",
    tag = "jobs",
    params(("job_id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Status, progress, current stage and report sections", content_type = "application/json"),
        (status = 404, description = "Unknown job", body = ErrorResponse)
    )
)]
async fn get_job(
    State(state): State<SharedState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobSnapshot>, ApiError> {
    let job = state.controller.registry().get(&job_id).await?;
    Ok(Json(JobSnapshot::of(&job)))
}

/// Alternate polling path; same snapshot as `/jobs/{job_id}`
#[utoipa::path(
    get,
    path = "/analysis/{job_id}",
    tag = "jobs",
    params(("job_id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Job snapshot", content_type = "application/json"),
        (status = 404, description = "Unknown job", body = ErrorResponse)
    )
)]
async fn get_analysis(
    state: State<SharedState>,
    job_id: Path<String>,
) -> Result<Json<JobSnapshot>, ApiError> {
    get_job(state, job_id).await
}

/// Recorded event log of a job
#[utoipa::path(
    get,
    path = "/jobs/{job_id}/history",
    tag = "jobs",
    params(("job_id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Events in sequence order", content_type = "application/json"),
        (status = 404, description = "Unknown job", body = ErrorResponse)
    )
)]
async fn job_history(
    State(state): State<SharedState>,
    Path(job_id): Path<String>,
) -> Result<Json<Vec<JobEvent>>, ApiError> {
    Ok(Json(state.controller.registry().events(&job_id).await?))
}

fn sse_event(event: &JobEvent) -> Event {
    let json = serde_json::to_string(event).unwrap_or_default();
    Event::default().id(event.sequence.to_string()).data(json)
}

/// SSE stream of a job's events with heartbeat
#[utoipa::path(
    get,
    path = "/jobs/{job_id}/events",
    tag = "jobs",
    params(("job_id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Server-sent event stream, closed after the terminal event", content_type = "text/event-stream"),
        (status = 404, description = "Unknown job", body = ErrorResponse)
    )
)]
async fn job_events(
    State(state): State<SharedState>,
    Path(job_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let events = state.controller.broadcaster().subscribe(&job_id).await?;

    // Heartbeat comment whenever the job is quiet for a while
    let stream = stream::unfold(events, |mut events| async move {
        match tokio::time::timeout(HEARTBEAT, events.next()).await {
            Ok(Some(event)) => Some((Ok(sse_event(&event)), events)),
            Ok(None) => None,
            Err(_) => Some((Ok(Event::default().comment("heartbeat")), events)),
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// WebSocket feed of a job's events
#[utoipa::path(
    get,
    path = "/jobs/{job_id}/ws",
    tag = "jobs",
    params(("job_id" = String, Path, description = "Job id")),
    responses(
        (status = 101, description = "Upgraded; one JSON text message per event, closed after the terminal event"),
        (status = 404, description = "Unknown job", body = ErrorResponse)
    )
)]
async fn job_socket(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let events = state.controller.broadcaster().subscribe(&job_id).await?;
    Ok(ws.on_upgrade(move |socket| forward_events(socket, events)))
}

/// Pump events into the socket until the terminal event or a disconnect.
/// Disconnecting never cancels the job.
async fn forward_events(socket: WebSocket, mut events: EventStream) {
    let (mut sender, mut receiver) = socket.split();

    let send_task = async move {
        while let Some(event) = events.next().await {
            let json = serde_json::to_string(&event).unwrap_or_default();
            if sender.send(Message::Text(json)).await.is_err() {
                return;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    };

    let recv_task = async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    };

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }
}

/// Liveness and load
#[utoipa::path(
    get,
    path = "/health",
    tag = "system",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    )
)]
async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_jobs: state.controller.registry().active_count().await,
        open_channels: state.controller.broadcaster().open_channels(),
    })
}

async fn serve_openapi() -> impl IntoResponse {
    let spec = ApiDoc::openapi().to_json().unwrap_or_default();
    ([(header::CONTENT_TYPE, "application/json")], spec)
}

/// Build the HTTP router
pub fn build_router(state: SharedState) -> Router {
    let job_routes = Router::new()
        .route("/", post(submit_job))
        .route("/:job_id", get(get_job))
        .route("/:job_id/events", get(job_events))
        .route("/:job_id/ws", get(job_socket))
        .route("/:job_id/history", get(job_history));

    Router::new()
        .nest("/jobs", job_routes)
        .route("/analysis/:job_id", get(get_analysis))
        .route("/health", get(health))
        .route("/openapi.json", get(serve_openapi))
        .with_state(state)
}
