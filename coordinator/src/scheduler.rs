use chrono::{DateTime, Utc};
use common::storage::ObjectLocation;
use common::{
    JobInfo, JobPhase, JobRequest, PartitionSource, ProgramRef, ReportAck, SplitPlanner,
    StorageBinding, TaskDescriptor, TaskInfo, TaskKind, TaskOutcome, TaskReport,
};
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::error::CoordinatorError;
use crate::jobs::JobRecord;
use crate::state::AppState;
use crate::store::{ReducePlan, RetryDecision};

/* --------- submit --------- */

/// Valida el request, fija la revisión de los artefactos, registra el job
/// en QUEUED y lo arranca.
pub async fn submit_job(
    state: &AppState,
    req: JobRequest,
    now: DateTime<Utc>,
) -> Result<JobInfo, CoordinatorError> {
    req.validate().map_err(CoordinatorError::BadRequest)?;

    let mapper = pin_artifact(state, &req.mapper_name).await?;
    let reducer = pin_artifact(state, &req.reducer_name).await?;

    let info = JobInfo {
        id: common::job::new_job_id(),
        phase: JobPhase::Queued,
        n_reducers: req.n_reducers,
        input_path: req.input_path,
        input_type: req.input_type,
        output_path: req.output_path,
        use_tls: req.use_tls,
        mapper,
        reducer,
        split_size: req.split_size.unwrap_or(state.config.split_size),
        submitted_at: now,
        started_at: None,
        finished_at: None,
        total_map_tasks: 0,
        completed_map_tasks: 0,
        total_reduce_tasks: 0,
        completed_reduce_tasks: 0,
        retries: 0,
        failure_cause: None,
    };
    let job_id = info.id.clone();
    info!(
        "job {} recibido: entrada={} reducers={} mapper={} reducer={}",
        job_id, info.input_path, info.n_reducers, info.mapper.name, info.reducer.name
    );
    state.jobs.insert(JobRecord {
        info,
        input_credentials: req.input_storage_credentials,
        output_credentials: req.output_storage_credentials,
        partitions_released: false,
    });

    start_job(state, &job_id, now).await
}

async fn pin_artifact(state: &AppState, name: &str) -> Result<ProgramRef, CoordinatorError> {
    let info = state
        .artifacts
        .info(name)
        .await?
        .ok_or_else(|| CoordinatorError::ArtifactMissing(name.to_string()))?;
    Ok(ProgramRef {
        name: info.name,
        revision: info.revision,
    })
}

/// QUEUED -> MAPPING: resuelve el tamaño de la entrada, planifica los splits
/// y crea las tareas map. Si la entrada no se puede resolver el job falla
/// sin reintentos.
#[instrument(skip(state, now))]
pub async fn start_job(
    state: &AppState,
    job_id: &str,
    now: DateTime<Utc>,
) -> Result<JobInfo, CoordinatorError> {
    let record = state
        .jobs
        .get(job_id)
        .ok_or_else(|| CoordinatorError::JobNotFound(job_id.to_string()))?;
    let info = &record.info;

    let input_len = match resolve_input_len(state, &record).await {
        Ok(len) => len,
        Err(cause) => {
            fail_job(state, job_id, &cause, now);
            return Err(CoordinatorError::InputResolution(cause));
        }
    };

    let planner = SplitPlanner::with_size(info.split_size)
        .ok_or_else(|| CoordinatorError::BadRequest("split_size tiene que ser > 0".into()))?;
    let created = state.tasks.create_map_tasks(job_id, planner.plan(input_len));
    info!(
        "job {}: entrada de {} bytes, {} tareas map (split {} bytes)",
        job_id,
        input_len,
        created,
        planner.split_size()
    );

    state.jobs.transition(job_id, JobPhase::Mapping, now)?;
    // entrada vacía: no hay map que esperar
    advance_job(state, job_id, now);

    job_view(state, job_id).ok_or_else(|| CoordinatorError::JobNotFound(job_id.to_string()))
}

async fn resolve_input_len(state: &AppState, record: &JobRecord) -> Result<u64, String> {
    let loc = ObjectLocation::parse(&record.info.input_path, record.info.use_tls)
        .map_err(|e| e.to_string())?;
    state
        .objects
        .size(&loc, &record.input_credentials)
        .await
        .map_err(|e| e.to_string())
}

/// Al arrancar: retoma jobs QUEUED (quedaron a medio crear) y avanza los activos.
pub async fn resume_jobs(state: &AppState, now: DateTime<Utc>) {
    for job_id in state.jobs.ids_in(|p| p == JobPhase::Queued) {
        if let Err(e) = start_job(state, &job_id, now).await {
            warn!("no se pudo retomar el job {}: {}", job_id, e);
        }
    }
    for job_id in state.jobs.active_ids() {
        advance_job(state, &job_id, now);
    }
}

/// Vista pública del job con los contadores de progreso al día.
pub fn job_view(state: &AppState, job_id: &str) -> Option<JobInfo> {
    let mut info = state.jobs.info(job_id)?;
    let s = state.tasks.summary(job_id);
    info.total_map_tasks = s.maps_total;
    info.completed_map_tasks = s.maps_completed;
    info.total_reduce_tasks = s.reduces_total;
    info.completed_reduce_tasks = s.reduces_completed;
    info.retries = s.retries;
    Some(info)
}

/* --------- máquina de estados del job --------- */

/// Barrera entre fases: MAPPING -> REDUCING cuando todas las map están
/// completas (y recién ahí se crean las reduce), REDUCING -> COMPLETED
/// cuando lo están las N reduce.
pub fn advance_job(state: &AppState, job_id: &str, now: DateTime<Utc>) {
    let Some(record) = state.jobs.get(job_id) else {
        return;
    };
    let n = record.info.n_reducers;

    let next = match record.info.phase {
        JobPhase::Mapping => match state.tasks.create_reduce_tasks_if_ready(job_id, n) {
            ReducePlan::NotReady => None,
            ReducePlan::Created(count) => {
                info!("job {}: todas las map completas, {} tareas reduce creadas", job_id, count);
                Some(JobPhase::Reducing)
            }
            ReducePlan::AlreadyExists => Some(JobPhase::Reducing),
        },
        JobPhase::Reducing => {
            // una map reabierta (particiones perdidas) frena el cierre
            let s = state.tasks.summary(job_id);
            let maps_done = s.maps_completed == s.maps_total;
            (maps_done && s.reduces_total == n && s.reduces_completed == n)
                .then_some(JobPhase::Completed)
        }
        _ => None,
    };

    if let Some(next) = next {
        // dos llamadas concurrentes pueden intentar la misma transición
        if let Err(e) = state.jobs.transition(job_id, next, now) {
            debug!("{}", e);
        }
    }
}

/// FAILED terminal: no se planifica nada más del job.
pub fn fail_job(state: &AppState, job_id: &str, cause: &str, now: DateTime<Utc>) {
    match state.jobs.fail(job_id, cause, now) {
        Ok(_) => {
            for (task_id, worker_id) in state.tasks.abandon_job(job_id, cause) {
                state.workers.detach(&worker_id, &task_id);
            }
        }
        Err(e) => debug!("{}", e),
    }
}

/* --------- asignación --------- */

enum Assignment {
    Assigned,
    /// No quedan workers IDLE en esta pasada
    NoWorkers,
    /// Otra pasada ganó la tarea
    Taken,
    /// El worker rechazó o no respondió: probar otro worker
    Retry,
}

/// Una pasada del scheduler: avanza los jobs activos y asigna sus tareas
/// IDLE a workers IDLE, en orden de llegada de los jobs. Devuelve cuántas
/// tareas se asignaron.
pub async fn schedule_pass(state: &AppState, now: DateTime<Utc>) -> usize {
    let mut assigned = 0;

    for job_id in state.jobs.active_ids() {
        advance_job(state, &job_id, now);
        let Some(record) = state.jobs.get(&job_id) else {
            continue;
        };
        if !record.info.phase.is_active() {
            continue;
        }

        for task_id in state.tasks.idle_tasks(&job_id) {
            loop {
                match assign_one(state, &record, &task_id, now).await {
                    Assignment::Assigned => {
                        assigned += 1;
                        break;
                    }
                    Assignment::Taken => break,
                    Assignment::Retry => continue,
                    Assignment::NoWorkers => return assigned,
                }
            }
        }
    }
    assigned
}

/// Claim del worker (pool) -> claim de la tarea (store, IDLE -> ASSIGNED) -> AssignTask.
#[instrument(skip(state, record, now), fields(job = %record.info.id))]
async fn assign_one(
    state: &AppState,
    record: &JobRecord,
    task_id: &str,
    now: DateTime<Utc>,
) -> Assignment {
    let Some((worker_id, address)) = state.workers.claim_idle(now) else {
        return Assignment::NoWorkers;
    };

    let deadline = now + state.config.task_timeout();
    let task = match state.tasks.try_assign(task_id, &worker_id, now, deadline) {
        Ok(task) => task,
        Err(e) => {
            debug!("{}; se libera el worker {}", e, worker_id);
            state.workers.release(&worker_id);
            return Assignment::Taken;
        }
    };
    state.workers.bind_task(&worker_id, task_id, now);

    let descriptor = build_descriptor(state, record, &task, &worker_id);
    match state.dispatcher.assign_task(&address, &descriptor).await {
        Ok(resp) if resp.accepted => {
            info!(
                "tarea {} ({}, intento {}) asignada al worker {}",
                task_id,
                task.kind.label(),
                descriptor.attempt,
                worker_id
            );
            Assignment::Assigned
        }
        Ok(resp) => {
            warn!(
                "worker {} rechazó la tarea {} ({}): desincronizado, se prueba otro",
                worker_id,
                task_id,
                resp.reason.as_deref().unwrap_or("sin motivo")
            );
            if let Err(e) = state.tasks.release(task_id, &worker_id) {
                debug!("{}", e);
            }
            state.workers.detach(&worker_id, task_id);
            Assignment::Retry
        }
        Err(e) => {
            warn!("no se pudo entregar la tarea {}: {}", task_id, e);
            if let Err(e) = state.tasks.release(task_id, &worker_id) {
                debug!("{}", e);
            }
            state.workers.mark_unreachable(&worker_id);
            Assignment::Retry
        }
    }
}

/// Descriptor que recibe el worker. Las reduce llevan una fuente por cada
/// map del job: el worker que guarda sus particiones.
pub fn build_descriptor(
    state: &AppState,
    record: &JobRecord,
    task: &TaskInfo,
    worker_id: &str,
) -> TaskDescriptor {
    let info = &record.info;
    let (program, storage, sources) = match task.kind {
        TaskKind::Map { .. } => (
            info.mapper.clone(),
            StorageBinding {
                location: info.input_path.clone(),
                use_tls: info.use_tls,
                credentials: record.input_credentials.clone(),
            },
            Vec::new(),
        ),
        TaskKind::Reduce { .. } => {
            let sources = state
                .tasks
                .tasks_for_job(&info.id)
                .into_iter()
                .filter(|t| t.kind.is_map())
                .map(|t| PartitionSource {
                    worker_address: t
                        .output_holder
                        .as_deref()
                        .and_then(|w| state.workers.address(w))
                        .unwrap_or_default(),
                    map_task_id: t.id,
                })
                .collect();
            (
                info.reducer.clone(),
                StorageBinding {
                    location: info.output_path.clone(),
                    use_tls: info.use_tls,
                    credentials: record.output_credentials.clone(),
                },
                sources,
            )
        }
    };

    TaskDescriptor {
        id: task.id.clone(),
        job_id: info.id.clone(),
        worker_id: worker_id.to_string(),
        kind: task.kind,
        attempt: task.retry_count + 1,
        program,
        n_reducers: info.n_reducers,
        storage,
        sources,
    }
}

/// Pide a los workers alcanzables que borren las particiones intermedias de
/// los jobs terminados. Un worker que no responde se saltea.
pub async fn release_finished_partitions(state: &AppState) -> usize {
    let jobs = state.jobs.take_unreleased_finished();
    if jobs.is_empty() {
        return 0;
    }
    let addresses = state.workers.reachable_addresses();
    let mut released = 0;
    for job_id in &jobs {
        for address in &addresses {
            match state.dispatcher.release_partitions(address, job_id).await {
                Ok(()) => released += 1,
                Err(e) => debug!("particiones de {} sin liberar: {}", job_id, e),
            }
        }
        info!("job {}: particiones intermedias liberadas", job_id);
    }
    released
}

/// Loop del scheduler: una pasada por tick.
pub async fn run_scheduler_loop(state: AppState) {
    let tick = state.config.scheduler_tick();
    info!("scheduler corriendo cada {:?}", tick);
    loop {
        sleep(tick).await;
        schedule_pass(&state, Utc::now()).await;
        release_finished_partitions(&state).await;
    }
}

/* --------- reportes de los workers --------- */

/// ReportOutcome. Un reporte de una tarea que ya no está en vuelo para ese
/// worker se ignora (ack false) sin tocar tareas ni jobs.
#[instrument(skip(state, report, now), fields(task = %report.task_id, worker = %report.worker_id))]
pub fn handle_report(state: &AppState, report: &TaskReport, now: DateTime<Utc>) -> ReportAck {
    let task_id = report.task_id.as_str();
    let worker_id = report.worker_id.as_str();
    let max_retries = state.config.max_task_retries;

    let accepted = match &report.outcome {
        TaskOutcome::Running => match state.tasks.mark_running(task_id, worker_id) {
            Ok(_) => true,
            Err(e) => {
                debug!("reporte RUNNING ignorado: {}", e);
                false
            }
        },
        TaskOutcome::Completed => {
            match state.tasks.complete(task_id, worker_id, now) {
                Ok(task) => {
                    state.workers.finish(worker_id, task_id, true, now);
                    info!("tarea {} completada por {}", task_id, worker_id);
                    advance_job(state, &task.job_id, now);
                    true
                }
                Err(e) => {
                    info!("reporte COMPLETED obsoleto ignorado: {}", e);
                    false
                }
            }
        }
        TaskOutcome::Failed { cause } => {
            let res = state.tasks.fail(task_id, worker_id, cause, max_retries);
            // un reporte obsoleto no toca al worker: puede estar reservado para otra tarea
            if res.is_ok() {
                state.workers.finish(worker_id, task_id, false, now);
            }
            match res {
                Ok((task, RetryDecision::Requeued)) => {
                    warn!(
                        "tarea {} falló en {} ({}); reencolada (reintento {}/{})",
                        task_id, worker_id, cause, task.retry_count, max_retries
                    );
                    true
                }
                Ok((task, RetryDecision::Exhausted)) => {
                    let cause = format!(
                        "tarea {} agotó {} reintentos: {}",
                        task_id, max_retries, cause
                    );
                    fail_job(state, &task.job_id, &cause, now);
                    true
                }
                Err(e) => {
                    info!("reporte FAILED obsoleto ignorado: {}", e);
                    false
                }
            }
        }
    };
    ReportAck { accepted }
}
