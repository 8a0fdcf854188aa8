use chrono::{DateTime, Utc};
use common::{
    TaskId, WorkerHeartbeatRequest, WorkerId, WorkerLiveness, WorkerMetrics,
    WorkerRegisterRequest,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::state::lock;

#[derive(Debug, Clone)]
pub struct WorkerEntry {
    pub id: WorkerId,
    pub hostname: String,
    pub address: String,
    pub liveness: WorkerLiveness,
    /// A lo sumo una tarea por worker
    pub current_task: Option<TaskId>,
    pub last_contact: DateTime<Utc>,
    pub last_assigned: Option<DateTime<Utc>>,
    task_started_at: Option<DateTime<Utc>>,

    // Métricas
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub total_task_time_ms: u64,
    pub last_cpu_percent: Option<f32>,
    pub last_mem_bytes: Option<u64>,
}

/// Pool de workers. Reclamar y liberar es atómico: un worker reclamado para
/// una tarea de un job no puede reclamarse a la vez para otra.
#[derive(Clone, Default)]
pub struct WorkerPool {
    workers: Arc<Mutex<HashMap<WorkerId, WorkerEntry>>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra un worker. Si ya había uno con la misma dirección (se
    /// reinició), el registro viejo se descarta.
    pub fn register(&self, req: &WorkerRegisterRequest, now: DateTime<Utc>) -> WorkerId {
        let worker_id = uuid::Uuid::new_v4().to_string();
        let mut workers = lock(&self.workers);

        workers.retain(|id, w| {
            let same = w.address == req.address;
            if same {
                info!("worker {} reemplazado por re-registro en {}", id, w.address);
            }
            !same
        });

        workers.insert(
            worker_id.clone(),
            WorkerEntry {
                id: worker_id.clone(),
                hostname: req.hostname.clone(),
                address: req.address.clone(),
                liveness: WorkerLiveness::Idle,
                current_task: None,
                last_contact: now,
                last_assigned: None,
                task_started_at: None,
                tasks_succeeded: 0,
                tasks_failed: 0,
                total_task_time_ms: 0,
                last_cpu_percent: None,
                last_mem_bytes: None,
            },
        );
        info!("worker registrado: {} ({}, {})", worker_id, req.hostname, req.address);
        worker_id
    }

    /// Actualiza último contacto y métricas; false si el worker no existe.
    pub fn heartbeat(&self, req: &WorkerHeartbeatRequest, now: DateTime<Utc>) -> bool {
        let mut workers = lock(&self.workers);
        let Some(w) = workers.get_mut(&req.worker_id) else {
            return false;
        };
        w.last_contact = now;
        w.last_cpu_percent = req.cpu_percent;
        w.last_mem_bytes = req.mem_bytes;

        match w.liveness {
            WorkerLiveness::Unreachable => {
                info!("worker {} vuelve a estar alcanzable", w.id);
                w.liveness = if req.busy {
                    WorkerLiveness::Busy
                } else {
                    WorkerLiveness::Idle
                };
            }
            // ocupado sin tarea conocida: se libera cuando el agente dice que terminó
            WorkerLiveness::Busy if w.current_task.is_none() && !req.busy => {
                w.liveness = WorkerLiveness::Idle;
            }
            _ => {}
        }
        true
    }

    /// Reclama atómicamente un worker IDLE (el que hace más tiempo no recibe
    /// tarea) y lo deja BUSY. Devuelve (id, dirección).
    pub fn claim_idle(&self, now: DateTime<Utc>) -> Option<(WorkerId, String)> {
        let mut workers = lock(&self.workers);
        let w = workers
            .values_mut()
            .filter(|w| w.liveness == WorkerLiveness::Idle)
            .min_by(|a, b| {
                a.last_assigned
                    .cmp(&b.last_assigned)
                    .then_with(|| a.id.cmp(&b.id))
            })?;
        w.liveness = WorkerLiveness::Busy;
        w.current_task = None;
        w.last_assigned = Some(now);
        Some((w.id.clone(), w.address.clone()))
    }

    /// Asocia la tarea al worker reclamado.
    pub fn bind_task(&self, worker_id: &str, task_id: &str, now: DateTime<Utc>) {
        let mut workers = lock(&self.workers);
        if let Some(w) = workers.get_mut(worker_id) {
            w.current_task = Some(task_id.to_string());
            w.task_started_at = Some(now);
        }
    }

    /// Deshace un claim que no terminó en asignación.
    pub fn release(&self, worker_id: &str) {
        let mut workers = lock(&self.workers);
        if let Some(w) = workers.get_mut(worker_id) {
            if w.liveness == WorkerLiveness::Busy {
                w.liveness = WorkerLiveness::Idle;
            }
            w.current_task = None;
            w.task_started_at = None;
        }
    }

    /// Desvincula la tarea pero deja el worker BUSY: el agente sigue ocupado
    /// (rechazó una asignación, o su job falló). Un heartbeat con busy=false
    /// o un reporte lo vuelve a IDLE.
    pub fn detach(&self, worker_id: &str, task_id: &str) {
        let mut workers = lock(&self.workers);
        if let Some(w) = workers.get_mut(worker_id) {
            if w.current_task.as_deref() == Some(task_id) {
                w.current_task = None;
                w.task_started_at = None;
            }
        }
    }

    /// El worker reportó el final de `task_id`.
    pub fn finish(&self, worker_id: &str, task_id: &str, success: bool, now: DateTime<Utc>) {
        let mut workers = lock(&self.workers);
        let Some(w) = workers.get_mut(worker_id) else {
            return;
        };
        w.last_contact = now;

        if w.current_task.as_deref() == Some(task_id) {
            if let Some(started) = w.task_started_at.take() {
                let ms = (now - started).num_milliseconds().max(0);
                w.total_task_time_ms += u64::try_from(ms).unwrap_or(0);
            }
            if success {
                w.tasks_succeeded += 1;
            } else {
                w.tasks_failed += 1;
            }
            w.current_task = None;
            w.liveness = WorkerLiveness::Idle;
        } else if w.current_task.is_none() && w.liveness == WorkerLiveness::Busy {
            w.liveness = WorkerLiveness::Idle;
        }
    }

    /// Marca el worker como inalcanzable y suelta su tarea (si tenía).
    pub fn mark_unreachable(&self, worker_id: &str) -> Option<TaskId> {
        let mut workers = lock(&self.workers);
        let w = workers.get_mut(worker_id)?;
        if w.liveness != WorkerLiveness::Unreachable {
            warn!("marcando worker {} como UNREACHABLE", worker_id);
        }
        w.liveness = WorkerLiveness::Unreachable;
        w.task_started_at = None;
        w.current_task.take()
    }

    /// Workers sin contacto hace más de `timeout`: pasan a UNREACHABLE.
    pub fn sweep_silent(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> Vec<WorkerId> {
        let mut workers = lock(&self.workers);
        let mut silent = Vec::new();
        for w in workers.values_mut() {
            if w.liveness == WorkerLiveness::Unreachable {
                continue;
            }
            let elapsed = now - w.last_contact;
            if elapsed > timeout {
                warn!(
                    "marcando worker {} como UNREACHABLE (sin contacto hace {}s)",
                    w.id,
                    elapsed.num_seconds()
                );
                w.liveness = WorkerLiveness::Unreachable;
                w.current_task = None;
                w.task_started_at = None;
                silent.push(w.id.clone());
            }
        }
        silent
    }

    /// Direcciones de los workers que no están UNREACHABLE.
    pub fn reachable_addresses(&self) -> Vec<String> {
        let workers = lock(&self.workers);
        let mut out: Vec<String> = workers
            .values()
            .filter(|w| w.liveness != WorkerLiveness::Unreachable)
            .map(|w| w.address.clone())
            .collect();
        out.sort();
        out
    }

    pub fn address(&self, worker_id: &str) -> Option<String> {
        lock(&self.workers).get(worker_id).map(|w| w.address.clone())
    }

    pub fn get(&self, worker_id: &str) -> Option<WorkerEntry> {
        lock(&self.workers).get(worker_id).cloned()
    }

    pub fn metrics(&self, now: DateTime<Utc>) -> Vec<WorkerMetrics> {
        let workers = lock(&self.workers);
        let mut out: Vec<WorkerMetrics> = workers
            .values()
            .map(|w| {
                let finished = w.tasks_succeeded + w.tasks_failed;
                WorkerMetrics {
                    worker_id: w.id.clone(),
                    hostname: w.hostname.clone(),
                    address: w.address.clone(),
                    liveness: w.liveness,
                    current_task: w.current_task.clone(),
                    last_contact_secs_ago: u64::try_from((now - w.last_contact).num_seconds())
                        .unwrap_or(0),
                    tasks_started: finished + u64::from(w.current_task.is_some()),
                    tasks_succeeded: w.tasks_succeeded,
                    tasks_failed: w.tasks_failed,
                    avg_task_ms: (finished > 0)
                        .then(|| w.total_task_time_ms as f64 / finished as f64),
                    cpu_percent: w.last_cpu_percent,
                    mem_bytes: w.last_mem_bytes,
                }
            })
            .collect();
        out.sort_by(|a, b| a.hostname.cmp(&b.hostname).then(a.worker_id.cmp(&b.worker_id)));
        out
    }
}
