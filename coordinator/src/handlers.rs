use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use common::results::output_object;
use common::{
    ArtifactInfo, JobInfo, JobRequest, JobResults, ReportAck, TaskInfo, TaskKind, TaskReport,
    TaskState, WorkerHeartbeatRequest, WorkerHeartbeatResponse, WorkerMetrics,
    WorkerRegisterRequest, WorkerRegisterResponse,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::CoordinatorError;
use crate::scheduler::{handle_report, job_view, submit_job};
use crate::state::AppState;

/// Tope de tamaño de un ejecutable subido.
const MAX_ARTIFACT_BYTES: usize = 512 * 1024 * 1024;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/jobs", post(create_job).get(list_jobs))
        .route("/api/v1/jobs/:id", get(get_job))
        .route("/api/v1/jobs/:id/tasks", get(get_job_tasks))
        .route("/api/v1/jobs/:id/results", get(get_job_results))
        .route(
            "/api/v1/artifacts",
            post(upload_artifact)
                .get(list_artifacts)
                .layer(DefaultBodyLimit::max(MAX_ARTIFACT_BYTES)),
        )
        .route(
            "/api/v1/artifacts/:name",
            get(get_artifact).delete(delete_artifact),
        )
        .route("/api/v1/artifacts/:name/content", get(download_artifact))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers/heartbeat", post(worker_heartbeat))
        .route("/api/v1/tasks/report", post(report_task))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

type ApiResult<T> = Result<T, CoordinatorError>;

/* ---------------- jobs ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Crea un job: valida, fija artefactos, planifica splits y crea las tareas map
async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<JobRequest>,
) -> ApiResult<(StatusCode, Json<JobInfo>)> {
    let info = submit_job(&state, req, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobInfo>> {
    let jobs = state
        .jobs
        .list()
        .into_iter()
        .filter_map(|j| job_view(&state, &j.id))
        .collect();
    Json(jobs)
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobInfo>> {
    job_view(&state, &id)
        .map(Json)
        .ok_or(CoordinatorError::JobNotFound(id))
}

async fn get_job_tasks(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<TaskInfo>>> {
    if state.jobs.phase(&id).is_none() {
        return Err(CoordinatorError::JobNotFound(id));
    }
    Ok(Json(state.tasks.tasks_for_job(&id)))
}

// Objetos de salida de las particiones reduce completadas
async fn get_job_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobResults>> {
    let job = state
        .jobs
        .info(&id)
        .ok_or_else(|| CoordinatorError::JobNotFound(id.clone()))?;

    let files = state
        .tasks
        .tasks_for_job(&id)
        .into_iter()
        .filter(|t| t.state == TaskState::Completed)
        .filter_map(|t| match t.kind {
            TaskKind::Reduce { partition } => Some(output_object(&job.output_path, &id, partition)),
            TaskKind::Map { .. } => None,
        })
        .collect();

    Ok(Json(JobResults {
        job_id: job.id,
        phase: job.phase,
        output_path: job.output_path,
        files,
    }))
}

/* ---------------- artefactos ---------------- */

// multipart: campo "program" (el ejecutable) y opcionalmente "name"
async fn upload_artifact(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<ArtifactInfo>> {
    let mut name: Option<String> = None;
    let mut program: Option<(Option<String>, Bytes)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| CoordinatorError::BadRequest(e.to_string()))?
    {
        match field.name() {
            Some("name") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| CoordinatorError::BadRequest(e.to_string()))?;
                name = Some(text.trim().to_string());
            }
            Some("program") => {
                let file_name = field.file_name().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| CoordinatorError::BadRequest(e.to_string()))?;
                program = Some((file_name, bytes));
            }
            _ => {}
        }
    }

    let (file_name, bytes) =
        program.ok_or_else(|| CoordinatorError::BadRequest("falta el campo 'program'".into()))?;
    let name = name
        .filter(|n| !n.is_empty())
        .or(file_name)
        .ok_or_else(|| CoordinatorError::BadRequest("falta el nombre del artefacto".into()))?;
    if bytes.is_empty() {
        return Err(CoordinatorError::BadRequest("el artefacto está vacío".into()));
    }

    let info = state.artifacts.save(&name, &bytes).await?;
    Ok(Json(info))
}

async fn list_artifacts(State(state): State<AppState>) -> ApiResult<Json<Vec<ArtifactInfo>>> {
    Ok(Json(state.artifacts.list().await?))
}

async fn get_artifact(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ArtifactInfo>> {
    state
        .artifacts
        .info(&name)
        .await?
        .map(Json)
        .ok_or(CoordinatorError::ArtifactMissing(name))
}

#[derive(Debug, Deserialize)]
struct ContentQuery {
    /// Revisión fijada por el job; si ya no es la actual se responde 409
    revision: Option<i64>,
}

async fn download_artifact(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<ContentQuery>,
) -> ApiResult<impl IntoResponse> {
    let bytes = match query.revision {
        Some(rev) => state.artifacts.read_revision(&name, rev).await?,
        None => state.artifacts.read(&name).await?,
    };
    let bytes = bytes.ok_or(CoordinatorError::ArtifactMissing(name))?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], bytes))
}

async fn delete_artifact(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    if state.artifacts.delete(&name).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(CoordinatorError::ArtifactMissing(name))
    }
}

/* ---------------- workers ---------------- */

// Registra un worker nuevo (mismo pool y token de cluster)
async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<WorkerRegisterRequest>,
) -> ApiResult<Json<WorkerRegisterResponse>> {
    if req.pool != state.config.worker_pool {
        warn!("registro rechazado: {} es del pool {}", req.hostname, req.pool);
        return Err(CoordinatorError::Forbidden(format!(
            "pool {} no es el de este coordinator",
            req.pool
        )));
    }
    if let Some(expected) = &state.cluster_token {
        if req.token.as_deref() != Some(expected.as_str()) {
            warn!("registro rechazado: token inválido desde {}", req.hostname);
            return Err(CoordinatorError::Forbidden("token de cluster inválido".into()));
        }
    }
    let worker_id = state.workers.register(&req, Utc::now());
    Ok(Json(WorkerRegisterResponse { worker_id }))
}

// Heartbeat de worker
async fn worker_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<WorkerHeartbeatRequest>,
) -> ApiResult<Json<WorkerHeartbeatResponse>> {
    if state.workers.heartbeat(&req, Utc::now()) {
        Ok(Json(WorkerHeartbeatResponse { ok: true }))
    } else {
        Err(CoordinatorError::WorkerNotFound(req.worker_id))
    }
}

async fn list_workers(State(state): State<AppState>) -> Json<Vec<WorkerMetrics>> {
    Json(state.workers.metrics(Utc::now()))
}

/* ---------------- reportes ---------------- */

// Los reportes obsoletos devuelven accepted=false, nunca error
async fn report_task(
    State(state): State<AppState>,
    Json(report): Json<TaskReport>,
) -> Json<ReportAck> {
    let ack = handle_report(&state, &report, Utc::now());
    if !ack.accepted {
        info!(
            "reporte de {} para {} ignorado (obsoleto)",
            report.worker_id, report.task_id
        );
    }
    Json(ack)
}
