use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use common::artifact::is_safe_name;
use common::{AssignResponse, TaskDescriptor};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::agent::Agent;

pub fn build_router(agent: Arc<Agent>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/tasks/assign", post(assign_task))
        .route("/api/v1/partitions/:job_id", delete(release_partitions))
        .route(
            "/api/v1/partitions/:job_id/:task_id/:partition",
            get(get_partition),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(agent)
}

async fn health() -> &'static str {
    "ok"
}

async fn assign_task(
    State(agent): State<Arc<Agent>>,
    Json(task): Json<TaskDescriptor>,
) -> Json<AssignResponse> {
    Json(agent.assign(task))
}

// Sirve una partición intermedia a un reducer de otro worker
async fn get_partition(
    State(agent): State<Arc<Agent>>,
    Path((job_id, task_id, partition)): Path<(String, String, u32)>,
) -> Response {
    match agent
        .engine()
        .partitions()
        .read_local(&job_id, &task_id, partition)
        .await
    {
        Ok(Some(bytes)) => ([(header::CONTENT_TYPE, "application/json")], bytes).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "partición inexistente").into_response(),
        Err(e) => {
            warn!("leyendo partición {}/{}/{}: {}", job_id, task_id, partition, e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

// El coordinator avisa que el job terminó: sus particiones ya no se piden
async fn release_partitions(
    State(agent): State<Arc<Agent>>,
    Path(job_id): Path<String>,
) -> Response {
    if !is_safe_name(&job_id) {
        return (StatusCode::BAD_REQUEST, "job inválido").into_response();
    }
    match agent.engine().partitions().remove_job(&job_id).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            warn!("borrando particiones de {}: {}", job_id, e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
