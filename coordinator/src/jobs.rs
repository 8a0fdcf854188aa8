use chrono::{DateTime, Utc};
use common::{Credentials, JobId, JobInfo, JobPhase};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{info, warn};

use crate::persist::JsonMirror;
use crate::state::lock;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job {0} no existe")]
    NotFound(JobId),
    #[error("job {id}: transición inválida {from:?} -> {to:?}")]
    IllegalTransition {
        id: JobId,
        from: JobPhase,
        to: JobPhase,
    },
}

/// Lo que el coordinator guarda de un job: la vista pública más las
/// credenciales, que sólo se reenvían a los workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub info: JobInfo,
    #[serde(default)]
    pub input_credentials: Credentials,
    #[serde(default)]
    pub output_credentials: Credentials,
    /// Ya se pidió a los workers que borren sus particiones intermedias
    #[serde(default)]
    pub partitions_released: bool,
}

/// Tabla de jobs. La fase sólo cambia por `transition` / `fail`.
#[derive(Clone)]
pub struct JobTable {
    jobs: Arc<Mutex<HashMap<JobId, JobRecord>>>,
    mirror: Option<JsonMirror>,
}

impl JobTable {
    pub fn in_memory() -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            mirror: None,
        }
    }

    pub fn open(mirror: JsonMirror) -> anyhow::Result<Self> {
        let jobs: HashMap<JobId, JobRecord> = mirror.load()?.unwrap_or_default();
        info!("{} jobs recargados de {}", jobs.len(), mirror.path().display());
        Ok(Self {
            jobs: Arc::new(Mutex::new(jobs)),
            mirror: Some(mirror),
        })
    }

    fn persist(&self, jobs: &HashMap<JobId, JobRecord>) {
        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.save(jobs) {
                warn!("no se pudo espejar la tabla de jobs: {:#}", e);
            }
        }
    }

    pub fn insert(&self, record: JobRecord) {
        let mut jobs = lock(&self.jobs);
        jobs.insert(record.info.id.clone(), record);
        self.persist(&jobs);
    }

    pub fn get(&self, id: &str) -> Option<JobRecord> {
        lock(&self.jobs).get(id).cloned()
    }

    pub fn info(&self, id: &str) -> Option<JobInfo> {
        lock(&self.jobs).get(id).map(|r| r.info.clone())
    }

    pub fn phase(&self, id: &str) -> Option<JobPhase> {
        lock(&self.jobs).get(id).map(|r| r.info.phase)
    }

    /// Todos los jobs, del más viejo al más nuevo.
    pub fn list(&self) -> Vec<JobInfo> {
        let jobs = lock(&self.jobs);
        let mut out: Vec<JobInfo> = jobs.values().map(|r| r.info.clone()).collect();
        out.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id)));
        out
    }

    /// Jobs en la fase dada, en orden de llegada (FCFS).
    pub fn ids_in(&self, pred: impl Fn(JobPhase) -> bool) -> Vec<JobId> {
        self.list()
            .into_iter()
            .filter(|j| pred(j.phase))
            .map(|j| j.id)
            .collect()
    }

    /// Jobs en MAPPING o REDUCING, en orden de llegada.
    pub fn active_ids(&self) -> Vec<JobId> {
        self.ids_in(JobPhase::is_active)
    }

    pub fn transition(
        &self,
        id: &str,
        next: JobPhase,
        now: DateTime<Utc>,
    ) -> Result<JobInfo, JobError> {
        let mut jobs = lock(&self.jobs);
        let record = jobs
            .get_mut(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        let info = &mut record.info;
        if !info.phase.can_transition_to(next) {
            return Err(JobError::IllegalTransition {
                id: id.to_string(),
                from: info.phase,
                to: next,
            });
        }
        info!("job {}: {:?} -> {:?}", id, info.phase, next);
        info.phase = next;
        if next == JobPhase::Mapping {
            info.started_at = Some(now);
        }
        if next.is_terminal() {
            info.finished_at = Some(now);
        }
        let out = info.clone();
        self.persist(&jobs);
        Ok(out)
    }

    /// Jobs terminados cuyas particiones todavía no se liberaron. Quedan
    /// marcados: cada job sale una sola vez.
    pub fn take_unreleased_finished(&self) -> Vec<JobId> {
        let mut jobs = lock(&self.jobs);
        let mut out: Vec<JobId> = jobs
            .values_mut()
            .filter(|r| r.info.phase.is_terminal() && !r.partitions_released)
            .map(|r| {
                r.partitions_released = true;
                r.info.id.clone()
            })
            .collect();
        if !out.is_empty() {
            out.sort();
            self.persist(&jobs);
        }
        out
    }

    /// Pasa el job a FAILED guardando la causa terminal.
    pub fn fail(&self, id: &str, cause: &str, now: DateTime<Utc>) -> Result<JobInfo, JobError> {
        let mut jobs = lock(&self.jobs);
        let record = jobs
            .get_mut(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        let info = &mut record.info;
        if !info.phase.can_transition_to(JobPhase::Failed) {
            return Err(JobError::IllegalTransition {
                id: id.to_string(),
                from: info.phase,
                to: JobPhase::Failed,
            });
        }
        warn!("job {} FAILED: {}", id, cause);
        info.phase = JobPhase::Failed;
        info.finished_at = Some(now);
        info.failure_cause = Some(cause.to_string());
        let out = info.clone();
        self.persist(&jobs);
        Ok(out)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use common::ProgramRef;

    pub(crate) fn job_info(id: &str, n_reducers: u32) -> JobInfo {
        JobInfo {
            id: id.to_string(),
            phase: JobPhase::Queued,
            n_reducers,
            input_path: "/data/input.txt".to_string(),
            input_type: "file/txt".to_string(),
            output_path: "/data/output".to_string(),
            use_tls: false,
            mapper: ProgramRef { name: "wc-mapper".to_string(), revision: 1 },
            reducer: ProgramRef { name: "wc-reducer".to_string(), revision: 1 },
            split_size: 1024,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            total_map_tasks: 0,
            completed_map_tasks: 0,
            total_reduce_tasks: 0,
            completed_reduce_tasks: 0,
            retries: 0,
            failure_cause: None,
        }
    }

    pub(crate) fn record(id: &str, n_reducers: u32) -> JobRecord {
        JobRecord {
            info: job_info(id, n_reducers),
            input_credentials: Credentials::default(),
            output_credentials: Credentials::default(),
            partitions_released: false,
        }
    }

    #[test]
    fn terminados_se_liberan_una_sola_vez() {
        let table = JobTable::in_memory();
        table.insert(record("j-1", 1));
        table.insert(record("j-2", 1));
        let now = Utc::now();
        table.transition("j-1", JobPhase::Mapping, now).unwrap();
        assert!(table.take_unreleased_finished().is_empty());

        table.fail("j-1", "boom", now).unwrap();
        assert_eq!(table.take_unreleased_finished(), vec!["j-1".to_string()]);
        assert!(table.take_unreleased_finished().is_empty());
        assert!(table.get("j-1").unwrap().partitions_released);
    }

    #[test]
    fn transiciones_validas_actualizan_timestamps() {
        let table = JobTable::in_memory();
        table.insert(record("j-1", 1));
        let now = Utc::now();

        let info = table.transition("j-1", JobPhase::Mapping, now).unwrap();
        assert_eq!(info.started_at, Some(now));
        table.transition("j-1", JobPhase::Reducing, now).unwrap();
        let info = table.transition("j-1", JobPhase::Completed, now).unwrap();
        assert_eq!(info.finished_at, Some(now));
        assert!(table.active_ids().is_empty());
    }

    #[test]
    fn transicion_invalida_es_error_y_no_cambia_la_fase() {
        let table = JobTable::in_memory();
        table.insert(record("j-1", 1));
        let err = table
            .transition("j-1", JobPhase::Completed, Utc::now())
            .unwrap_err();
        assert!(matches!(err, JobError::IllegalTransition { .. }));
        assert_eq!(table.phase("j-1"), Some(JobPhase::Queued));
    }

    #[test]
    fn fail_es_terminal() {
        let table = JobTable::in_memory();
        table.insert(record("j-1", 1));
        table.transition("j-1", JobPhase::Mapping, Utc::now()).unwrap();
        let info = table.fail("j-1", "reintentos agotados", Utc::now()).unwrap();
        assert_eq!(info.phase, JobPhase::Failed);
        assert_eq!(info.failure_cause.as_deref(), Some("reintentos agotados"));

        assert!(table.fail("j-1", "otra vez", Utc::now()).is_err());
        assert!(table.transition("j-1", JobPhase::Reducing, Utc::now()).is_err());
    }

    #[test]
    fn active_ids_en_orden_de_llegada() {
        let table = JobTable::in_memory();
        let mut a = record("j-a", 1);
        let mut b = record("j-b", 1);
        b.info.submitted_at = Utc::now() - chrono::Duration::seconds(10);
        a.info.submitted_at = Utc::now();
        table.insert(a);
        table.insert(b);
        table.transition("j-a", JobPhase::Mapping, Utc::now()).unwrap();
        table.transition("j-b", JobPhase::Mapping, Utc::now()).unwrap();
        assert_eq!(table.active_ids(), vec!["j-b", "j-a"]);
    }

    #[test]
    fn job_desconocido() {
        let table = JobTable::in_memory();
        assert_eq!(
            table.transition("nope", JobPhase::Mapping, Utc::now()).unwrap_err(),
            JobError::NotFound("nope".into())
        );
    }
}
