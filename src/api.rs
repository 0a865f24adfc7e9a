use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use regex::Regex;
use serde_json::json;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::archive::{read_archive, ArchiveError};
use crate::config::ServiceConfig;
use crate::mesh::{MeshError, MeshGenerator, MeshPreviewer};
use crate::models::{
    validate_scale, LogChunkResponse, LogQuery, MeshRequest, SessionResponse,
    SimulationParameters, SolveStatusResponse, StepResponse,
};
use crate::params::ParamsError;
use crate::session::{Session, SessionError, SessionStore, SolveJob};
use crate::solver::SolverRunner;
use crate::task::{TaskOutcome, TaskState};
use crate::workspace::ARCHIVE_FILE;

const GEOMETRY_FIELD: &str = "geometry";
const GEOMETRY_EXTENSION: &str = "geo";

/// Application state
pub struct AppState {
    config: ServiceConfig,
    sessions: SessionStore,
    mesher: MeshGenerator,
    previewer: MeshPreviewer,
    solver: Arc<SolverRunner>,
}

impl AppState {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            sessions: SessionStore::new(config.work_root.clone(), config.session_ttl),
            mesher: MeshGenerator::new(vec![config.gmsh_path.clone()], config.mesh_timeout),
            previewer: MeshPreviewer::new(config.preview_command.clone(), config.preview_timeout),
            solver: Arc::new(SolverRunner::new(
                config.solver_command.clone(),
                config.solver_timeout,
            )),
            config,
        }
    }
}

/// Build the API router
pub fn create_router(config: ServiceConfig) -> Router {
    let state = AppState::new(config);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_check))
        .route("/api/v1/version", get(version_handler))
        .route("/api/v1/sessions", post(create_session))
        .route(
            "/api/v1/sessions/:id",
            get(get_session).delete(delete_session),
        )
        .route("/api/v1/sessions/:id/geometry", post(upload_geometry))
        .route(
            "/api/v1/sessions/:id/parameters",
            get(get_parameters).put(put_parameters),
        )
        .route("/api/v1/sessions/:id/mesh", post(generate_mesh))
        .route("/api/v1/sessions/:id/mesh/cancel", post(cancel_mesh_step))
        .route(
            "/api/v1/sessions/:id/mesh/preview",
            get(get_mesh_preview).post(preview_mesh),
        )
        .route("/api/v1/sessions/:id/solve", get(get_solve).post(start_solve))
        .route("/api/v1/sessions/:id/solve/log", get(get_solve_log))
        .route("/api/v1/sessions/:id/solve/cancel", post(cancel_solve))
        .route("/api/v1/sessions/:id/solve/plot", get(get_solve_plot))
        .route("/api/v1/sessions/:id/result", get(download_result))
        .layer(cors)
        .with_state(Arc::new(state))
}

/// Root endpoint
async fn root_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "service": "TurgoLab Service",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "description": "Inflate 2D cell networks from .geo files: gmsh meshing plus a hyperelastic BVP solve",
        "boundary_conditions": ["fix", "outer"],
        "anatomeshr_url": state.config.anatomeshr_url,
    }))
}

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let gmsh_available = tokio::process::Command::new(&state.config.gmsh_path)
        .arg("-version")
        .output()
        .await
        .is_ok();

    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "gmsh_available": gmsh_available,
        "gmsh_command": state.config.gmsh_path,
        "solver_command": state.config.solver_command.join(" "),
        "active_sessions": state.sessions.len().await,
    }))
}

/// Version endpoint
async fn version_handler() -> Json<serde_json::Value> {
    Json(json!({
        "service": "TurgoLab Service",
        "version": env!("CARGO_PKG_VERSION"),
        "api_version": "v1",
        "mesher": "gmsh (msh2)",
        "solver": "external BVP solver (Saint Venant-Kirchhoff, plane stress)"
    }))
}

async fn create_session(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    let handle = state.sessions.create().await?;
    let session = handle.lock().await;
    tracing::info!("Created session {}", session.id());
    Ok((StatusCode::CREATED, Json(session_response(&session)?)))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionResponse>, ApiError> {
    let handle = state.sessions.get(id).await?;
    let mut session = handle.lock().await;
    session.sync_view();
    Ok(Json(session_response(&session)?))
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.sessions.remove(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Accepts one `.geo` file in the `geometry` field. A form without a file
/// selects the bundled default geometry.
async fn upload_geometry(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    let handle = state.sessions.get(id).await?;
    let mut session = handle.lock().await;
    session.ensure_inputs_writable()?;

    let mut saved: Option<PathBuf> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::ValidationError(format!("Invalid upload: {}", e)))?
    {
        if field.name() != Some(GEOMETRY_FIELD) {
            continue;
        }
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        if file_name.is_empty() {
            continue;
        }
        if saved.is_some() {
            return Err(ApiError::ValidationError(
                "Only one geometry file can be uploaded".to_string(),
            ));
        }

        let stored_name = upload_file_name(&file_name)?;
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::ValidationError(format!("Failed to read upload: {}", e)))?;
        let path = session.workspace().file(&stored_name);
        tokio::fs::write(&path, &data).await.map_err(|e| {
            ApiError::InternalError(format!("Failed to save {}: {}", stored_name, e))
        })?;
        tracing::info!("Session {} uploaded {} ({} bytes)", id, stored_name, data.len());
        saved = Some(path);
    }

    let uses_default = saved.is_none();
    session.set_geometry(saved);
    let geometry = session
        .geometry_or(&state.config.default_geometry)
        .to_string_lossy()
        .to_string();
    if uses_default {
        tracing::info!("Session {} uses default geometry {}", id, geometry);
    }

    Ok(Json(json!({
        "geometry": session.view.geometry,
        "default": uses_default,
        "path": geometry,
    })))
}

/// Stored name for an uploaded geometry: `uploaded_<name>` with any
/// directory part dropped and unusual characters replaced.
fn upload_file_name(original: &str) -> Result<String, ApiError> {
    static UNSAFE: OnceLock<Regex> = OnceLock::new();
    let unsafe_chars = UNSAFE.get_or_init(|| Regex::new(r"[^A-Za-z0-9._-]").expect("valid regex"));

    let base = original
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(original);
    let has_geo_extension = std::path::Path::new(base)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(GEOMETRY_EXTENSION));
    if !has_geo_extension {
        return Err(ApiError::ValidationError(format!(
            "Geometry must be a .{} file, got {:?}",
            GEOMETRY_EXTENSION, original
        )));
    }

    Ok(format!("uploaded_{}", unsafe_chars.replace_all(base, "_")))
}

async fn put_parameters(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(params): Json<SimulationParameters>,
) -> Result<Json<SimulationParameters>, ApiError> {
    let handle = state.sessions.get(id).await?;
    let session = handle.lock().await;
    session.ensure_inputs_writable()?;
    session.parameter_store().save(&params)?;
    Ok(Json(params))
}

async fn get_parameters(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SimulationParameters>, ApiError> {
    let handle = state.sessions.get(id).await?;
    let session = handle.lock().await;
    session
        .parameter_store()
        .load()?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("No parameters saved for this session".to_string()))
}

/// Runs gmsh without holding the session lock, so the session stays
/// observable and the step can be cancelled while it runs.
async fn generate_mesh(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    payload: Option<Json<MeshRequest>>,
) -> Result<(StatusCode, Json<StepResponse>), ApiError> {
    let request = payload.map(|Json(r)| r).unwrap_or_default();
    validate_scale(request.scale).map_err(ApiError::ValidationError)?;
    let handle = state.sessions.get(id).await?;

    let (step, workspace, geometry) = {
        let mut session = handle.lock().await;
        let step = session.begin_step("mesh")?;
        session.view.mesh_ready = false;
        session.view.preview_available = false;
        let geometry = session
            .geometry_or(&state.config.default_geometry)
            .to_path_buf();
        (step, session.workspace().clone(), geometry)
    };

    let result = state
        .mesher
        .generate(&workspace, &geometry, request.scale, step.cancel_handle())
        .await;

    let mut session = handle.lock().await;
    drop(step);
    let outcome = result?;

    if outcome.succeeded() {
        session.view.mesh_ready = true;
        session.view.mesh_scale = Some(request.scale);
        Ok((
            StatusCode::OK,
            Json(StepResponse::from_outcome(&outcome, "Mesh generated successfully!")),
        ))
    } else {
        let message = failure_message("Mesh generation", &outcome);
        Ok((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(StepResponse::from_outcome(&outcome, message)),
        ))
    }
}

async fn preview_mesh(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<StepResponse>), ApiError> {
    let handle = state.sessions.get(id).await?;

    let (step, workspace) = {
        let mut session = handle.lock().await;
        let step = session.begin_step("preview")?;
        session.view.preview_available = false;
        (step, session.workspace().clone())
    };

    let result = state
        .previewer
        .render(&workspace, step.cancel_handle())
        .await;

    let mut session = handle.lock().await;
    drop(step);
    let (outcome, image) = result?;

    if image.is_some() {
        session.view.preview_available = true;
        session.view.plot_displayed = true;
        Ok((
            StatusCode::OK,
            Json(StepResponse::from_outcome(&outcome, "mesh preview")),
        ))
    } else {
        let message = failure_message("Mesh visualization", &outcome);
        Ok((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(StepResponse::from_outcome(&outcome, message)),
        ))
    }
}

fn failure_message(step: &str, outcome: &TaskOutcome) -> String {
    match outcome.state {
        TaskState::Cancelled => format!("{} cancelled", step),
        _ => format!("{} failed:\n{}", step, outcome.output_text()),
    }
}

/// Cancels a running mesh generation or preview.
async fn cancel_mesh_step(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let handle = state.sessions.get(id).await?;
    let session = handle.lock().await;
    let step = session.active_step();
    if !session.cancel_step() {
        return Err(ApiError::Conflict("No mesh step is running".to_string()));
    }
    tracing::info!("Cancelling {:?} step in session {}", step, id);
    Ok((StatusCode::ACCEPTED, Json(json!({ "cancelled": step }))))
}

async fn get_mesh_preview(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let handle = state.sessions.get(id).await?;
    let path = {
        let session = handle.lock().await;
        if !session.view.preview_available {
            return Err(ApiError::NotFound("No mesh preview available".to_string()));
        }
        session.workspace().mesh_preview_path()
    };
    png_response(&path).await
}

/// Starts the solver. An optional JSON body replaces the stored parameters
/// first; without one, defaults are persisted if nothing was saved yet.
async fn start_solve(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    payload: Option<Json<SimulationParameters>>,
) -> Result<(StatusCode, Json<SolveStatusResponse>), ApiError> {
    let handle = state.sessions.get(id).await?;
    let mut session = handle.lock().await;

    session.ensure_inputs_writable()?;
    if let Some(running) = session.active_step() {
        return Err(SessionError::StepInProgress(id, running).into());
    }

    let store = session.parameter_store();
    match payload {
        Some(Json(params)) => store.save(&params)?,
        None => {
            if store.load()?.is_none() {
                store.save(&SimulationParameters::default())?;
            }
        }
    }

    let job = session.start_solve(state.solver.clone())?;
    Ok((StatusCode::ACCEPTED, Json(solve_status(job))))
}

async fn get_solve(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SolveStatusResponse>, ApiError> {
    let handle = state.sessions.get(id).await?;
    let mut session = handle.lock().await;
    session.sync_view();
    let job = current_job(&session)?;
    Ok(Json(solve_status(job)))
}

async fn get_solve_log(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<LogQuery>,
) -> Result<Json<LogChunkResponse>, ApiError> {
    let handle = state.sessions.get(id).await?;
    let session = handle.lock().await;
    let job = current_job(&session)?;

    // state first: a finished state guarantees the lines read next are complete
    let status = job.status().state;
    let lines = job.log().since(query.from);
    Ok(Json(LogChunkResponse {
        status,
        from: query.from,
        next: query.from + lines.len(),
        lines,
    }))
}

async fn cancel_solve(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<SolveStatusResponse>), ApiError> {
    let handle = state.sessions.get(id).await?;
    let session = handle.lock().await;
    let job = current_job(&session)?;
    if !job.is_active() {
        return Err(ApiError::Conflict("No simulation is running".to_string()));
    }
    tracing::info!("Cancelling solve job {} in session {}", job.id(), id);
    job.cancel();
    Ok((StatusCode::ACCEPTED, Json(solve_status(job))))
}

async fn get_solve_plot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let handle = state.sessions.get(id).await?;
    let plot = {
        let session = handle.lock().await;
        current_job(&session)?.status().plot
    };
    match plot {
        Some(path) => png_response(&path).await,
        None => Err(ApiError::NotFound("No simulation plot available".to_string())),
    }
}

async fn download_result(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let handle = state.sessions.get(id).await?;
    let archive = {
        let session = handle.lock().await;
        current_job(&session)?.status().archive
    };
    let archive = archive.ok_or_else(|| {
        ApiError::NotFound("No results available; run a successful simulation first".to_string())
    })?;

    let bytes = read_archive(&archive).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", ARCHIVE_FILE),
            ),
        ],
        bytes,
    )
        .into_response())
}

fn current_job(session: &Session) -> Result<&SolveJob, ApiError> {
    session
        .solve()
        .ok_or_else(|| ApiError::NotFound("No simulation has been started".to_string()))
}

fn solve_status(job: &SolveJob) -> SolveStatusResponse {
    let status = job.status();
    SolveStatusResponse {
        job_id: job.id().to_string(),
        status: status.state,
        exit_code: status.exit_code,
        error_message: status.error_message,
        plot_available: status.plot.is_some(),
        archive_available: status.archive.is_some(),
        log: job.log().snapshot(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    }
}

fn session_response(session: &Session) -> Result<SessionResponse, ApiError> {
    Ok(SessionResponse {
        session_id: session.id().to_string(),
        created_at: session.created_at().to_rfc3339(),
        view: session.view.clone(),
        parameters: session.parameter_store().load()?,
        solve_state: session.solve().map(|job| job.status().state),
        active_step: session.active_step().map(str::to_string),
    })
}

async fn png_response(path: &std::path::Path) -> Result<Response, ApiError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ApiError::NotFound(format!("Image not found: {}", path.display()))
        } else {
            ApiError::InternalError(format!("Failed to read {}: {}", path.display(), e))
        }
    })?;
    Ok(([(header::CONTENT_TYPE, "image/png")], bytes).into_response())
}

/// API Errors
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(_) => ApiError::NotFound(err.to_string()),
            SessionError::SolveInProgress(_) | SessionError::StepInProgress(..) => {
                ApiError::Conflict(err.to_string())
            }
            SessionError::Workspace(_) => ApiError::InternalError(err.to_string()),
        }
    }
}

impl From<ParamsError> for ApiError {
    fn from(err: ParamsError) -> Self {
        match err {
            ParamsError::ValidationError(msg) => ApiError::ValidationError(msg),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

impl From<MeshError> for ApiError {
    fn from(err: MeshError) -> Self {
        match err {
            MeshError::ValidationError(msg) => ApiError::ValidationError(msg),
            MeshError::GeometryNotFound(_) => {
                ApiError::NotFound(format!("Mesh generation failed: {}", err))
            }
            MeshError::MeshNotReady => ApiError::Conflict(err.to_string()),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

impl From<ArchiveError> for ApiError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::MissingField(_) | ArchiveError::MissingArchive(_) => {
                ApiError::NotFound(err.to_string())
            }
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::ValidationError(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}
