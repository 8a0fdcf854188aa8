use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{Credentials, JobId, ProgramRef};
use crate::split::Split;
use crate::worker::WorkerId;

pub type TaskId = String;

/// Id estable de la tarea map del split `index`.
pub fn map_task_id(job_id: &str, index: u64) -> TaskId {
    format!("{}-m-{}", job_id, index)
}

/// Id estable de la tarea reduce de la partición `partition`.
pub fn reduce_task_id(job_id: &str, partition: u32) -> TaskId {
    format!("{}-r-{}", job_id, partition)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    Map { split: Split },
    Reduce { partition: u32 },
}

impl TaskKind {
    pub fn is_map(&self) -> bool {
        matches!(self, TaskKind::Map { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::Map { .. } => "map",
            TaskKind::Reduce { .. } => "reduce",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Idle,
    Assigned,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    /// Asignada a un worker y sin reporte final todavía.
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskState::Assigned | TaskState::Running)
    }
}

/// Registro de una tarea tal como lo guarda el Task Store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub job_id: JobId,
    pub kind: TaskKind,
    pub state: TaskState,
    pub worker_id: Option<WorkerId>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Worker que guarda las particiones intermedias de una tarea map completada
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_holder: Option<WorkerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskInfo {
    pub fn new(id: TaskId, job_id: JobId, kind: TaskKind) -> Self {
        Self {
            id,
            job_id,
            kind,
            state: TaskState::Idle,
            worker_id: None,
            assigned_at: None,
            deadline: None,
            retry_count: 0,
            last_error: None,
            output_holder: None,
            completed_at: None,
        }
    }
}

/* --------- Protocolo coordinator <-> worker --------- */

/// Dónde leer (map) o escribir (reduce) en el object storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageBinding {
    pub location: String,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub credentials: Credentials,
}

/// Worker que tiene las particiones de una tarea map completada.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSource {
    pub map_task_id: TaskId,
    pub worker_address: String,
}

/// Lo que recibe un worker en AssignTask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub id: TaskId,
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub kind: TaskKind,
    pub attempt: u32,
    pub program: ProgramRef,
    pub n_reducers: u32,
    pub storage: StorageBinding,
    /// Sólo reduce: una fuente por cada tarea map del job
    #[serde(default)]
    pub sources: Vec<PartitionSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignResponse {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AssignResponse {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOutcome {
    Running,
    Completed,
    Failed { cause: String },
}

/// ReportOutcome del worker al coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub outcome: TaskOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportAck {
    /// false si el reporte era obsoleto (la tarea ya no es de ese worker)
    pub accepted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_de_tareas_son_estables() {
        assert_eq!(map_task_id("j-1", 3), "j-1-m-3");
        assert_eq!(reduce_task_id("j-1", 0), "j-1-r-0");
    }

    #[test]
    fn task_kind_se_serializa_con_tag() {
        let kind = TaskKind::Reduce { partition: 2 };
        let json = serde_json::to_value(kind).unwrap();
        assert_eq!(json, serde_json::json!({"type": "reduce", "partition": 2}));

        let map: TaskKind = serde_json::from_value(serde_json::json!({
            "type": "map",
            "split": {"index": 1, "offset": 10, "length": 5}
        }))
        .unwrap();
        assert!(map.is_map());
    }

    #[test]
    fn outcome_failed_lleva_causa() {
        let json = serde_json::to_value(TaskOutcome::Failed {
            cause: "mapper salió con código 1".to_string(),
        })
        .unwrap();
        assert_eq!(json["status"], "FAILED");
        assert_eq!(json["cause"], "mapper salió con código 1");
    }
}
