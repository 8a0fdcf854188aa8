use chrono::{DateTime, Utc};
use common::split::Split;
use common::task::{map_task_id, reduce_task_id};
use common::{TaskId, TaskInfo, TaskKind, TaskState, WorkerId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

use crate::persist::JsonMirror;
use crate::state::lock;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("tarea {0} no existe")]
    NotFound(TaskId),
    #[error("tarea {0} no está IDLE")]
    NotIdle(TaskId),
    /// La tarea ya no está en vuelo para ese worker (reasignada, terminada o abandonada)
    #[error("tarea {task} ya no pertenece al worker {worker}")]
    Stale { task: TaskId, worker: WorkerId },
}

/// Qué pasó con una tarea al registrar un fallo o un timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Volvió a IDLE con retry_count + 1
    Requeued,
    /// Se pasó del máximo de reintentos: quedó FAILED
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReducePlan {
    /// Hay tareas map sin completar
    NotReady,
    Created(u32),
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    pub maps_total: u32,
    pub maps_completed: u32,
    pub reduces_total: u32,
    pub reduces_completed: u32,
    pub failed: u32,
    pub retries: u32,
}

/// Tabla de tareas. Todas las transiciones pasan por un único mutex, así que
/// son linealizables respecto de llamadas concurrentes.
#[derive(Clone)]
pub struct TaskStore {
    tasks: Arc<Mutex<HashMap<TaskId, TaskInfo>>>,
    mirror: Option<JsonMirror>,
}

impl TaskStore {
    pub fn in_memory() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            mirror: None,
        }
    }

    /// Store espejado en disco; recarga lo que haya.
    pub fn open(mirror: JsonMirror) -> anyhow::Result<Self> {
        let tasks: HashMap<TaskId, TaskInfo> = mirror.load()?.unwrap_or_default();
        debug!("task store: {} tareas recargadas de {}", tasks.len(), mirror.path().display());
        Ok(Self {
            tasks: Arc::new(Mutex::new(tasks)),
            mirror: Some(mirror),
        })
    }

    fn persist(&self, tasks: &HashMap<TaskId, TaskInfo>) {
        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.save(tasks) {
                warn!("no se pudo espejar el task store: {:#}", e);
            }
        }
    }

    /* --------- creación --------- */

    /// Crea una tarea map IDLE por split. Idempotente: los ids salen del índice.
    pub fn create_map_tasks<I>(&self, job_id: &str, splits: I) -> u32
    where
        I: IntoIterator<Item = Split>,
    {
        let mut tasks = lock(&self.tasks);
        let mut created = 0;
        for split in splits {
            let id = map_task_id(job_id, split.index);
            if tasks.contains_key(&id) {
                continue;
            }
            let info = TaskInfo::new(id.clone(), job_id.to_string(), TaskKind::Map { split });
            tasks.insert(id, info);
            created += 1;
        }
        self.persist(&tasks);
        created
    }

    /// Crea las N tareas reduce sólo si todas las map del job están COMPLETED.
    /// El chequeo y la creación ocurren bajo el mismo lock.
    pub fn create_reduce_tasks_if_ready(&self, job_id: &str, n_reducers: u32) -> ReducePlan {
        let mut tasks = lock(&self.tasks);

        let mut maps_pending = false;
        for t in tasks.values().filter(|t| t.job_id == job_id) {
            match t.kind {
                TaskKind::Reduce { .. } => return ReducePlan::AlreadyExists,
                TaskKind::Map { .. } => {
                    if t.state != TaskState::Completed {
                        maps_pending = true;
                    }
                }
            }
        }
        if maps_pending {
            return ReducePlan::NotReady;
        }

        for partition in 0..n_reducers {
            let id = reduce_task_id(job_id, partition);
            let info = TaskInfo::new(id.clone(), job_id.to_string(), TaskKind::Reduce { partition });
            tasks.insert(id, info);
        }
        self.persist(&tasks);
        ReducePlan::Created(n_reducers)
    }

    /* --------- lectura --------- */

    pub fn get(&self, task_id: &str) -> Option<TaskInfo> {
        lock(&self.tasks).get(task_id).cloned()
    }

    /// Tareas del job: primero las map por índice de split, después las reduce por partición.
    pub fn tasks_for_job(&self, job_id: &str) -> Vec<TaskInfo> {
        let tasks = lock(&self.tasks);
        let mut out: Vec<TaskInfo> = tasks.values().filter(|t| t.job_id == job_id).cloned().collect();
        out.sort_by_key(|t| task_order(&t.kind));
        out
    }

    /// Tareas IDLE listas para asignar. Las reduce quedan afuera mientras
    /// alguna map del job no esté COMPLETED (por ejemplo, una reabierta
    /// porque se perdieron sus particiones).
    pub fn idle_tasks(&self, job_id: &str) -> Vec<TaskId> {
        let tasks = lock(&self.tasks);
        let maps_done = all_maps_completed(&tasks, job_id);
        let mut idle: Vec<&TaskInfo> = tasks
            .values()
            .filter(|t| t.job_id == job_id && t.state == TaskState::Idle)
            .filter(|t| maps_done || t.kind.is_map())
            .collect();
        idle.sort_by_key(|t| task_order(&t.kind));
        idle.into_iter().map(|t| t.id.clone()).collect()
    }

    pub fn in_flight_for_worker(&self, worker_id: &str) -> Vec<TaskInfo> {
        lock(&self.tasks)
            .values()
            .filter(|t| t.state.is_in_flight() && t.worker_id.as_deref() == Some(worker_id))
            .cloned()
            .collect()
    }

    /// Tareas en vuelo con el deadline vencido.
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<TaskInfo> {
        lock(&self.tasks)
            .values()
            .filter(|t| t.state.is_in_flight() && t.deadline.is_some_and(|d| now > d))
            .cloned()
            .collect()
    }

    pub fn summary(&self, job_id: &str) -> TaskSummary {
        let tasks = lock(&self.tasks);
        let mut s = TaskSummary::default();
        for t in tasks.values().filter(|t| t.job_id == job_id) {
            let done = t.state == TaskState::Completed;
            match t.kind {
                TaskKind::Map { .. } => {
                    s.maps_total += 1;
                    s.maps_completed += u32::from(done);
                }
                TaskKind::Reduce { .. } => {
                    s.reduces_total += 1;
                    s.reduces_completed += u32::from(done);
                }
            }
            s.failed += u32::from(t.state == TaskState::Failed);
            s.retries += t.retry_count;
        }
        s
    }

    /* --------- transiciones --------- */

    /// IDLE -> ASSIGNED(worker). Falla si la tarea no está IDLE: es la
    /// primitiva de exclusión mutua del scheduler.
    pub fn try_assign(
        &self,
        task_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Result<TaskInfo, StoreError> {
        let mut tasks = lock(&self.tasks);
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        if task.state != TaskState::Idle {
            return Err(StoreError::NotIdle(task_id.to_string()));
        }
        task.state = TaskState::Assigned;
        task.worker_id = Some(worker_id.to_string());
        task.assigned_at = Some(now);
        task.deadline = Some(deadline);
        let out = task.clone();
        self.persist(&tasks);
        Ok(out)
    }

    /// ASSIGNED -> RUNNING (idempotente si ya está RUNNING).
    pub fn mark_running(&self, task_id: &str, worker_id: &str) -> Result<TaskInfo, StoreError> {
        let mut tasks = lock(&self.tasks);
        let task = owned_in_flight(&mut tasks, task_id, worker_id)?;
        if task.state == TaskState::Running {
            return Ok(task.clone());
        }
        task.state = TaskState::Running;
        let out = task.clone();
        self.persist(&tasks);
        Ok(out)
    }

    /// ASSIGNED/RUNNING -> COMPLETED. El worker queda como dueño de la salida
    /// (las particiones intermedias de una map viven en él).
    pub fn complete(
        &self,
        task_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TaskInfo, StoreError> {
        let mut tasks = lock(&self.tasks);
        let task = owned_in_flight(&mut tasks, task_id, worker_id)?;
        task.state = TaskState::Completed;
        task.deadline = None;
        task.completed_at = Some(now);
        task.output_holder = Some(worker_id.to_string());
        let out = task.clone();
        self.persist(&tasks);
        Ok(out)
    }

    /// Fallo reportado o timeout de un intento. Vuelve a IDLE con
    /// retry_count + 1 mientras retry_count < max_retries; si no, FAILED.
    pub fn fail(
        &self,
        task_id: &str,
        worker_id: &str,
        cause: &str,
        max_retries: u32,
    ) -> Result<(TaskInfo, RetryDecision), StoreError> {
        let mut tasks = lock(&self.tasks);
        let task = owned_in_flight(&mut tasks, task_id, worker_id)?;
        task.last_error = Some(cause.to_string());
        task.deadline = None;

        let decision = if task.retry_count < max_retries {
            task.retry_count += 1;
            task.state = TaskState::Idle;
            task.worker_id = None;
            task.assigned_at = None;
            RetryDecision::Requeued
        } else {
            task.state = TaskState::Failed;
            RetryDecision::Exhausted
        };
        let out = task.clone();
        self.persist(&tasks);
        Ok((out, decision))
    }

    /// ASSIGNED -> IDLE sin contar reintento: el worker rechazó la
    /// asignación o no se le pudo entregar.
    pub fn release(&self, task_id: &str, worker_id: &str) -> Result<TaskInfo, StoreError> {
        let mut tasks = lock(&self.tasks);
        let task = owned_in_flight(&mut tasks, task_id, worker_id)?;
        task.state = TaskState::Idle;
        task.worker_id = None;
        task.assigned_at = None;
        task.deadline = None;
        let out = task.clone();
        self.persist(&tasks);
        Ok(out)
    }

    /// Reabre las map COMPLETED del job cuyas particiones vivían en `worker_id`.
    /// No hace nada si el job ya no las necesita: todas sus reduce están
    /// COMPLETED o alguna tarea quedó FAILED (job abandonado).
    pub fn reopen_lost_map_outputs(&self, job_id: &str, worker_id: &str) -> Vec<TaskId> {
        let mut tasks = lock(&self.tasks);
        let mut reopened = Vec::new();

        let (mut abandoned, mut reduces, mut reduces_done) = (false, 0, 0);
        for t in tasks.values().filter(|t| t.job_id == job_id) {
            abandoned |= t.state == TaskState::Failed;
            if !t.kind.is_map() {
                reduces += 1;
                reduces_done += u32::from(t.state == TaskState::Completed);
            }
        }
        if abandoned || (reduces > 0 && reduces_done == reduces) {
            return reopened;
        }

        for t in tasks.values_mut().filter(|t| {
            t.job_id == job_id
                && t.kind.is_map()
                && t.state == TaskState::Completed
                && t.output_holder.as_deref() == Some(worker_id)
        }) {
            t.state = TaskState::Idle;
            t.worker_id = None;
            t.assigned_at = None;
            t.completed_at = None;
            t.output_holder = None;
            t.last_error = Some(format!("particiones perdidas con el worker {}", worker_id));
            reopened.push(t.id.clone());
        }
        if !reopened.is_empty() {
            self.persist(&tasks);
        }
        reopened
    }

    /// Job terminado en FAILED: lo que no está COMPLETED pasa a FAILED para que
    /// no se vuelva a planificar ni a reclamar. Devuelve (tarea, worker) de las
    /// que estaban en vuelo.
    pub fn abandon_job(&self, job_id: &str, cause: &str) -> Vec<(TaskId, WorkerId)> {
        let mut tasks = lock(&self.tasks);
        let mut detached = Vec::new();
        for t in tasks
            .values_mut()
            .filter(|t| t.job_id == job_id && t.state != TaskState::Completed)
        {
            if t.state.is_in_flight() {
                if let Some(w) = &t.worker_id {
                    detached.push((t.id.clone(), w.clone()));
                }
            }
            if t.state != TaskState::Failed {
                t.state = TaskState::Failed;
                t.deadline = None;
                if t.last_error.is_none() {
                    t.last_error = Some(cause.to_string());
                }
            }
        }
        self.persist(&tasks);
        detached
    }
}

fn all_maps_completed(tasks: &HashMap<TaskId, TaskInfo>, job_id: &str) -> bool {
    tasks
        .values()
        .filter(|t| t.job_id == job_id && t.kind.is_map())
        .all(|t| t.state == TaskState::Completed)
}

fn task_order(kind: &TaskKind) -> (u8, u64) {
    match kind {
        TaskKind::Map { split } => (0, split.index),
        TaskKind::Reduce { partition } => (1, u64::from(*partition)),
    }
}

/// La tarea tiene que estar ASSIGNED/RUNNING y asignada a `worker_id`.
fn owned_in_flight<'a>(
    tasks: &'a mut HashMap<TaskId, TaskInfo>,
    task_id: &str,
    worker_id: &str,
) -> Result<&'a mut TaskInfo, StoreError> {
    let task = tasks
        .get_mut(task_id)
        .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
    if !task.state.is_in_flight() || task.worker_id.as_deref() != Some(worker_id) {
        return Err(StoreError::Stale {
            task: task_id.to_string(),
            worker: worker_id.to_string(),
        });
    }
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use common::SplitPlanner;

    fn store_with_maps(job: &str, n: u64) -> TaskStore {
        let store = TaskStore::in_memory();
        let planner = SplitPlanner::with_size(10).unwrap();
        store.create_map_tasks(job, planner.plan(n * 10));
        store
    }

    fn assign(store: &TaskStore, task: &str, worker: &str) -> Result<TaskInfo, StoreError> {
        let now = Utc::now();
        store.try_assign(task, worker, now, now + Duration::seconds(60))
    }

    #[test]
    fn create_map_tasks_es_idempotente() {
        let store = store_with_maps("j-1", 3);
        let again = store.create_map_tasks("j-1", SplitPlanner::with_size(10).unwrap().plan(30));
        assert_eq!(again, 0);
        let ids: Vec<TaskId> = store.tasks_for_job("j-1").into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["j-1-m-0", "j-1-m-1", "j-1-m-2"]);
    }

    #[test]
    fn una_tarea_idle_se_asigna_una_sola_vez() {
        let store = store_with_maps("j-1", 1);
        assert!(assign(&store, "j-1-m-0", "w1").is_ok());
        assert_eq!(
            assign(&store, "j-1-m-0", "w2").unwrap_err(),
            StoreError::NotIdle("j-1-m-0".into())
        );
        assert_eq!(store.get("j-1-m-0").unwrap().worker_id.as_deref(), Some("w1"));
    }

    #[test]
    fn asignaciones_concurrentes_tienen_un_solo_ganador() {
        let store = store_with_maps("j-1", 1);
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || assign(&store, "j-1-m-0", &format!("w{}", i)).is_ok())
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        let assigned = store
            .tasks_for_job("j-1")
            .iter()
            .filter(|t| t.state == TaskState::Assigned)
            .count();
        assert_eq!(assigned, 1);
    }

    #[test]
    fn reporte_de_otro_worker_es_obsoleto_y_no_cambia_nada() {
        let store = store_with_maps("j-1", 1);
        assign(&store, "j-1-m-0", "w1").unwrap();

        let err = store.complete("j-1-m-0", "w2", Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::Stale { .. }));
        assert_eq!(store.get("j-1-m-0").unwrap().state, TaskState::Assigned);

        store.complete("j-1-m-0", "w1", Utc::now()).unwrap();
        // completar dos veces: el segundo reporte ya es obsoleto
        assert!(store.complete("j-1-m-0", "w1", Utc::now()).is_err());
    }

    #[test]
    fn fail_reencola_hasta_el_maximo_y_despues_agota() {
        let store = store_with_maps("j-1", 1);
        for attempt in 1..=2 {
            assign(&store, "j-1-m-0", "w1").unwrap();
            let (t, d) = store.fail("j-1-m-0", "w1", "boom", 2).unwrap();
            assert_eq!(d, RetryDecision::Requeued);
            assert_eq!(t.state, TaskState::Idle);
            assert_eq!(t.retry_count, attempt);
            assert!(t.worker_id.is_none());
        }
        assign(&store, "j-1-m-0", "w1").unwrap();
        let (t, d) = store.fail("j-1-m-0", "w1", "boom", 2).unwrap();
        assert_eq!(d, RetryDecision::Exhausted);
        assert_eq!(t.state, TaskState::Failed);
        assert_eq!(t.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn release_no_cuenta_reintento() {
        let store = store_with_maps("j-1", 1);
        assign(&store, "j-1-m-0", "w1").unwrap();
        let t = store.release("j-1-m-0", "w1").unwrap();
        assert_eq!(t.state, TaskState::Idle);
        assert_eq!(t.retry_count, 0);
    }

    #[test]
    fn reduce_se_crea_solo_con_todas_las_map_completas() {
        let store = store_with_maps("j-1", 2);
        assert_eq!(store.create_reduce_tasks_if_ready("j-1", 3), ReducePlan::NotReady);

        assign(&store, "j-1-m-0", "w1").unwrap();
        store.complete("j-1-m-0", "w1", Utc::now()).unwrap();
        assert_eq!(store.create_reduce_tasks_if_ready("j-1", 3), ReducePlan::NotReady);
        assert_eq!(store.summary("j-1").reduces_total, 0);

        assign(&store, "j-1-m-1", "w2").unwrap();
        store.complete("j-1-m-1", "w2", Utc::now()).unwrap();
        assert_eq!(store.create_reduce_tasks_if_ready("j-1", 3), ReducePlan::Created(3));
        assert_eq!(store.create_reduce_tasks_if_ready("j-1", 3), ReducePlan::AlreadyExists);

        let s = store.summary("j-1");
        assert_eq!((s.maps_total, s.maps_completed, s.reduces_total), (2, 2, 3));
        assert_eq!(store.idle_tasks("j-1"), vec!["j-1-r-0", "j-1-r-1", "j-1-r-2"]);
    }

    #[test]
    fn expired_detecta_deadlines_vencidos() {
        let store = store_with_maps("j-1", 2);
        let now = Utc::now();
        store.try_assign("j-1-m-0", "w1", now, now + Duration::seconds(5)).unwrap();
        store.try_assign("j-1-m-1", "w2", now, now + Duration::seconds(60)).unwrap();

        let expired = store.expired(now + Duration::seconds(10));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "j-1-m-0");
    }

    #[test]
    fn reopen_lost_map_outputs_reabre_solo_las_del_worker() {
        let store = store_with_maps("j-1", 2);
        assign(&store, "j-1-m-0", "w1").unwrap();
        store.complete("j-1-m-0", "w1", Utc::now()).unwrap();
        assign(&store, "j-1-m-1", "w2").unwrap();
        store.complete("j-1-m-1", "w2", Utc::now()).unwrap();

        assert_eq!(store.reopen_lost_map_outputs("j-1", "w1"), vec!["j-1-m-0"]);
        let t = store.get("j-1-m-0").unwrap();
        assert_eq!(t.state, TaskState::Idle);
        assert!(t.output_holder.is_none());
        assert_eq!(store.get("j-1-m-1").unwrap().state, TaskState::Completed);
    }

    #[test]
    fn reduce_idle_espera_a_que_se_rehagan_las_map() {
        let store = store_with_maps("j-1", 2);
        for (task, worker) in [("j-1-m-0", "w1"), ("j-1-m-1", "w2")] {
            assign(&store, task, worker).unwrap();
            store.complete(task, worker, Utc::now()).unwrap();
        }
        store.create_reduce_tasks_if_ready("j-1", 1);
        assert_eq!(store.idle_tasks("j-1"), vec!["j-1-r-0"]);

        // se pierden las particiones de w1 con la reduce ya creada
        assert_eq!(store.reopen_lost_map_outputs("j-1", "w1"), vec!["j-1-m-0"]);
        assert_eq!(store.idle_tasks("j-1"), vec!["j-1-m-0"]);

        assign(&store, "j-1-m-0", "w3").unwrap();
        store.complete("j-1-m-0", "w3", Utc::now()).unwrap();
        assert_eq!(store.idle_tasks("j-1"), vec!["j-1-r-0"]);
    }

    #[test]
    fn reopen_no_toca_jobs_con_las_reduce_terminadas() {
        let store = store_with_maps("j-1", 1);
        assign(&store, "j-1-m-0", "w1").unwrap();
        store.complete("j-1-m-0", "w1", Utc::now()).unwrap();
        store.create_reduce_tasks_if_ready("j-1", 1);
        assign(&store, "j-1-r-0", "w2").unwrap();
        store.complete("j-1-r-0", "w2", Utc::now()).unwrap();

        assert!(store.reopen_lost_map_outputs("j-1", "w1").is_empty());
        assert_eq!(store.get("j-1-m-0").unwrap().state, TaskState::Completed);
    }

    #[test]
    fn abandon_job_deja_todo_fallido_y_devuelve_los_workers() {
        let store = store_with_maps("j-1", 3);
        assign(&store, "j-1-m-0", "w1").unwrap();
        assign(&store, "j-1-m-1", "w2").unwrap();
        store.complete("j-1-m-1", "w2", Utc::now()).unwrap();

        let detached = store.abandon_job("j-1", "job fallido");
        assert_eq!(detached, vec![("j-1-m-0".to_string(), "w1".to_string())]);
        assert!(store.idle_tasks("j-1").is_empty());
        assert!(store.expired(Utc::now() + Duration::days(1)).is_empty());
        // reporte tardío del worker 1: obsoleto
        assert!(store.complete("j-1-m-0", "w1", Utc::now()).is_err());
    }

    #[test]
    fn store_espejado_se_recarga() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        {
            let mirror = JsonMirror::new(&path).unwrap();
            let store = TaskStore::open(mirror.clone()).unwrap();
            store.create_map_tasks("j-1", SplitPlanner::with_size(5).unwrap().plan(12));
            assign(&store, "j-1-m-1", "w1").unwrap();
            mirror.flush().unwrap();
        }
        let store = TaskStore::open(JsonMirror::new(&path).unwrap()).unwrap();
        let tasks = store.tasks_for_job("j-1");
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[1].state, TaskState::Assigned);
        assert_eq!(tasks[1].worker_id.as_deref(), Some("w1"));
    }
}
