use serde::{Deserialize, Serialize};

use crate::task::TaskId;

pub type WorkerId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerLiveness {
    Idle,
    Busy,
    Unreachable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterRequest {
    pub hostname: String,
    /// URL base donde el worker expone AssignTask y las particiones
    pub address: String,
    /// Pool / namespace de workers al que pertenece
    pub pool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterResponse {
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeatRequest {
    pub worker_id: WorkerId,
    /// El agente está ejecutando una tarea
    #[serde(default)]
    pub busy: bool,
    #[serde(default)]
    pub cpu_percent: Option<f32>,
    #[serde(default)]
    pub mem_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeatResponse {
    pub ok: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerMetrics {
    pub worker_id: WorkerId,
    pub hostname: String,
    pub address: String,
    pub liveness: WorkerLiveness,
    pub current_task: Option<TaskId>,
    pub last_contact_secs_ago: u64,
    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub avg_task_ms: Option<f64>,
    pub cpu_percent: Option<f32>,
    pub mem_bytes: Option<u64>,
}
