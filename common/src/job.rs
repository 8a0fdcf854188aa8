use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type JobId = String;

/// Tipos de entrada aceptados por el coordinator.
pub const SUPPORTED_INPUT_TYPES: &[&str] = &["file/txt"];

/// Genera un id de job nuevo, ej: "j-6f1c...".
pub fn new_job_id() -> JobId {
    format!("j-{}", uuid::Uuid::new_v4())
}

/// Credenciales del object storage. El core no las interpreta,
/// sólo las reenvía al cliente de storage.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }
}

// nunca imprimir el password en logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    /// Cantidad de reducers (particiones de salida), > 0
    pub n_reducers: u32,

    /// Ubicación de la entrada: file:///..., /ruta/absoluta o http(s)://host/bucket/objeto
    pub input_path: String,
    pub input_type: String,

    /// Ubicación base de la salida
    pub output_path: String,
    #[serde(default)]
    pub use_tls: bool,

    /// Nombres de artefactos subidos previamente
    pub mapper_name: String,
    pub reducer_name: String,

    #[serde(default)]
    pub input_storage_credentials: Credentials,
    #[serde(default)]
    pub output_storage_credentials: Credentials,

    /// Tamaño de split para este job (si no, el del coordinator)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_size: Option<u64>,
}

impl JobRequest {
    /// Validación sintáctica del body; no toca artefactos ni storage.
    pub fn validate(&self) -> Result<(), String> {
        if self.n_reducers == 0 {
            return Err("n_reducers tiene que ser un entero positivo".to_string());
        }
        if !SUPPORTED_INPUT_TYPES.contains(&self.input_type.as_str()) {
            return Err(format!(
                "{} no está en la lista de tipos de entrada permitidos {:?}",
                self.input_type, SUPPORTED_INPUT_TYPES
            ));
        }
        if self.input_path.trim().is_empty() {
            return Err("input_path vacío".to_string());
        }
        if self.output_path.trim().is_empty() {
            return Err("output_path vacío".to_string());
        }
        if self.mapper_name.trim().is_empty() || self.reducer_name.trim().is_empty() {
            return Err("mapper_name y reducer_name son obligatorios".to_string());
        }
        if self.split_size == Some(0) {
            return Err("split_size tiene que ser > 0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPhase {
    Queued,
    Mapping,
    Reducing,
    Completed,
    Failed,
}

impl JobPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobPhase::Completed | JobPhase::Failed)
    }

    /// Fases en las que el scheduler asigna tareas.
    pub fn is_active(self) -> bool {
        matches!(self, JobPhase::Mapping | JobPhase::Reducing)
    }

    /// Queued -> Mapping -> Reducing -> Completed, y Failed desde
    /// Queued (entrada irresoluble), Mapping o Reducing.
    pub fn can_transition_to(self, next: JobPhase) -> bool {
        use JobPhase::*;
        matches!(
            (self, next),
            (Queued, Mapping)
                | (Mapping, Reducing)
                | (Reducing, Completed)
                | (Queued, Failed)
                | (Mapping, Failed)
                | (Reducing, Failed)
        )
    }
}

/// Referencia a un artefacto fijada en el momento del submit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramRef {
    pub name: String,
    /// Timestamp (ms) de la subida; cambia al re-subir el artefacto
    pub revision: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub phase: JobPhase,

    pub n_reducers: u32,
    pub input_path: String,
    pub input_type: String,
    pub output_path: String,
    pub use_tls: bool,
    pub mapper: ProgramRef,
    pub reducer: ProgramRef,
    pub split_size: u64,

    /// -------- Métricas del job --------
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_map_tasks: u32,
    #[serde(default)]
    pub completed_map_tasks: u32,
    #[serde(default)]
    pub total_reduce_tasks: u32,
    #[serde(default)]
    pub completed_reduce_tasks: u32,
    #[serde(default)]
    pub retries: u32,

    /// Causa terminal si el job quedó en FAILED
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_cause: Option<String>,
}
