//! Thin HTTP adapter over the session engine, preloader and cache.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use http::{Method, StatusCode, header};
use serde::{Deserialize, Serialize};
use tokio::{fs, net::TcpListener};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::{
    cache::{Cache, CacheStats, PlayerProgress},
    config::Config,
    error::{ApiError, ApiResult},
    geofence::GeofenceStore,
    preload::{PreloadProgress, PreloadRegistry, PreloadSettings},
    preload::source::{HttpMetadataSource, HttpTileSource, MetadataSource, TileSource},
    session::{
        Action, DoneReason, Mode, Observation, SessionInfo, SessionStatus, Sessions,
        log::{self, SessionSummary},
    },
    task::{Task, TaskStore},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: Arc<Cache>,
    pub geofences: Arc<GeofenceStore>,
    pub tasks: Arc<TaskStore>,
    pub sessions: Arc<Sessions>,
    pub preloads: Arc<PreloadRegistry>,
    pub tile_source: Arc<dyn TileSource>,
    pub metadata_source: Arc<dyn MetadataSource>,
}

impl AppState {
    pub fn new(config: Config) -> eyre::Result<Self> {
        let config = Arc::new(config);
        let cache = Arc::new(Cache::open(config.db_path(), config.panoramas_dir())?);
        let geofences = Arc::new(GeofenceStore::load(config.geofence_config_path.clone()));
        let tasks = Arc::new(TaskStore::new(config.tasks_dir.clone()));
        let sessions = Arc::new(Sessions::new(
            cache.clone(),
            geofences.clone(),
            tasks.clone(),
            config.clone(),
        ));

        Ok(Self {
            cache,
            geofences,
            tasks,
            sessions,
            preloads: Arc::new(PreloadRegistry::new()),
            tile_source: Arc::new(HttpTileSource::new(config.tile_base_url.clone())),
            metadata_source: Arc::new(HttpMetadataSource::new(config.metadata_base_url.clone())),
            config,
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorBody {
            error_kind: &'static str,
            detail: String,
        }

        (
            self.status(),
            Json(ErrorBody {
                error_kind: self.kind(),
                detail: self.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(tower_http::cors::Any);

    Router::new()
        .route("/api/session/create", post(create_session))
        .route("/api/session/{id}/state", get(get_session_state))
        .route("/api/session/{id}/action", post(post_action))
        .route("/api/session/{id}/end", post(end_session))
        .route("/api/session/{id}/pause", post(pause_session))
        .route("/api/session/{id}/resume", post(resume_session))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}/log", get(get_session_log))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/preload", post(start_preload))
        .route("/api/tasks/{id}/preload/status", get(preload_status))
        .route("/api/players/{id}/progress", get(player_progress))
        .route("/api/stats", get(get_stats))
        .route("/api/geofences/refresh", post(refresh_geofences))
        .route("/images/{session_id}/{file}", get(serve_rendered_image))
        .route("/panoramas/{pano_id}", get(serve_panorama))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(state: AppState) -> eyre::Result<()> {
    let port = state.config.port;
    let app = router(state);

    let bind_to = format!("[::]:{port}");
    info!("binding to {bind_to}");
    let listener = TcpListener::bind(&bind_to).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// --- sessions ---

#[derive(Deserialize)]
struct CreateSessionRequest {
    agent_id: String,
    task_id: String,
    mode: Mode,
}

#[derive(Serialize)]
struct CreateSessionResponse {
    session_id: String,
    observation: Observation,
}

async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<Json<CreateSessionResponse>> {
    let (session, observation) = state
        .sessions
        .create(&req.agent_id, &req.task_id, req.mode)?;
    Ok(Json(CreateSessionResponse {
        session_id: session.id.clone(),
        observation,
    }))
}

#[derive(Serialize)]
struct SessionStateResponse {
    status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    observation: Option<Observation>,
}

async fn get_session_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionStateResponse>> {
    let session = state.sessions.get(&id)?;
    let (status, observation) = state.sessions.observation(&session);
    Ok(Json(SessionStateResponse {
        status,
        observation,
    }))
}

/// Loosely-typed on purpose: an unknown action type must surface as
/// `action_invalid`, not as a deserialization failure.
#[derive(Deserialize)]
struct ActionRequest {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    move_id: Option<u32>,
    #[serde(default)]
    heading: Option<f64>,
    #[serde(default)]
    pitch: Option<f64>,
    #[serde(default)]
    fov: Option<f64>,
    #[serde(default)]
    answer: Option<String>,
}

fn parse_action(req: ActionRequest) -> ApiResult<Action> {
    match req.kind.as_str() {
        "move" => {
            let move_id = req
                .move_id
                .ok_or_else(|| ApiError::ActionInvalid("move requires move_id".to_string()))?;
            Ok(Action::Move { move_id })
        }
        "rotation" => match (req.heading, req.pitch, req.fov) {
            (Some(heading), Some(pitch), Some(fov)) => {
                Ok(Action::Rotation { heading, pitch, fov })
            }
            _ => Err(ApiError::ActionInvalid(
                "rotation requires heading, pitch and fov".to_string(),
            )),
        },
        "stop" => Ok(Action::Stop { answer: req.answer }),
        other => Err(ApiError::ActionInvalid(format!(
            "unknown action type: {other}"
        ))),
    }
}

#[derive(Serialize)]
struct ActionResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    observation: Option<Observation>,
    done: bool,
    done_reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

async fn post_action(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ActionRequest>,
) -> Response {
    let result = state
        .sessions
        .get(&id)
        .and_then(|session| state.sessions.action(&session, parse_action(req)?));

    match result {
        Ok(outcome) => Json(ActionResponse {
            success: true,
            observation: outcome.observation,
            done: outcome.done,
            done_reason: outcome.done_reason.map(DoneReason::as_str),
            error_kind: None,
            detail: None,
        })
        .into_response(),
        Err(e) => (
            e.status(),
            Json(ActionResponse {
                success: false,
                observation: None,
                done: false,
                done_reason: None,
                error_kind: Some(e.kind()),
                detail: Some(e.to_string()),
            }),
        )
            .into_response(),
    }
}

async fn end_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionSummary>> {
    let session = state.sessions.get(&id)?;
    Ok(Json(state.sessions.end(&session)?))
}

#[derive(Serialize)]
struct StatusResponse {
    status: SessionStatus,
}

async fn pause_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    let session = state.sessions.get(&id)?;
    let status = state.sessions.pause(&session)?;
    Ok(Json(StatusResponse { status }))
}

async fn resume_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    let session = state.sessions.get(&id)?;
    let status = state.sessions.resume(&session)?;
    Ok(Json(StatusResponse { status }))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.list())
}

async fn get_session_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<simd_json::OwnedValue>>> {
    Ok(Json(log::read_log(&state.config.logs_dir, &id)?))
}

// --- tasks & preload ---

async fn list_tasks(State(state): State<AppState>) -> Json<Vec<Task>> {
    let tasks = state
        .tasks
        .list()
        .iter()
        .filter_map(|id| state.tasks.get(id).ok())
        .collect();
    Json(tasks)
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Task>> {
    Ok(Json(state.tasks.get(&id)?))
}

#[derive(Deserialize, Default)]
struct PreloadRequest {
    #[serde(default)]
    zoom_level: Option<u8>,
}

async fn start_preload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: axum::body::Bytes,
) -> ApiResult<Json<PreloadProgress>> {
    let task = state.tasks.get(&id)?;
    let fence = state.geofences.get(&task.geofence)?;

    // the body is optional; an empty POST preloads at the configured zoom
    let mut raw = body.to_vec();
    let requested = if raw.is_empty() {
        None
    } else {
        simd_json::from_slice::<PreloadRequest>(&mut raw)
            .ok()
            .and_then(|req| req.zoom_level)
    };
    let zoom = requested.unwrap_or(state.config.zoom_level);

    let job = state.preloads.start(
        &task.geofence,
        &fence,
        zoom,
        state.cache.clone(),
        state.tile_source.clone(),
        state.metadata_source.clone(),
        PreloadSettings::from_config(&state.config),
    );
    Ok(Json(job.progress()))
}

async fn preload_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<PreloadProgress>> {
    let task = state.tasks.get(&id)?;
    let job = state.preloads.get(&task.geofence).ok_or_else(|| {
        ApiError::NotFound(format!("no preload job for geofence {}", task.geofence))
    })?;
    Ok(Json(job.progress()))
}

// --- players, stats, geofences ---

async fn player_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<PlayerProgress>>> {
    Ok(Json(state.cache.progress_for(&id)?))
}

#[derive(Serialize)]
struct StatsResponse {
    cache: CacheStats,
    sessions: usize,
    geofences: Vec<String>,
}

async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        cache: state.cache.stats(),
        sessions: state.sessions.list().len(),
        geofences: state.geofences.names(),
    })
}

#[derive(Serialize)]
struct RefreshResponse {
    geofences: Vec<String>,
}

async fn refresh_geofences(
    State(state): State<AppState>,
) -> ApiResult<Json<RefreshResponse>> {
    state.geofences.refresh().map_err(ApiError::Internal)?;
    Ok(Json(RefreshResponse {
        geofences: state.geofences.names(),
    }))
}

// --- image serving ---

async fn serve_rendered_image(
    State(state): State<AppState>,
    Path((session_id, file)): Path<(String, String)>,
) -> Response {
    if session_id.contains(['/', '\\', '.']) || file.contains(['/', '\\']) || file.contains("..") {
        return StatusCode::NOT_FOUND.into_response();
    }

    let path = state.config.temp_images_dir.join(session_id).join(file);
    match fs::read(&path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "image/jpeg")],
            bytes,
        )
            .into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn serve_panorama(
    State(state): State<AppState>,
    Path(pano_id): Path<String>,
) -> Response {
    if pano_id.contains(['/', '\\']) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let path = state
        .cache
        .image_path(&pano_id.as_str().into(), state.config.zoom_level);
    match fs::read(&path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "image/jpeg")],
            bytes,
        )
            .into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}
