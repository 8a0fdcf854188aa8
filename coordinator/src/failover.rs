use chrono::{DateTime, Utc};
use common::TaskInfo;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::scheduler::fail_job;
use crate::state::AppState;
use crate::store::RetryDecision;

/// Loop principal de tolerancia a fallos:
/// - detecta workers sin contacto
/// - reclama tareas con el deadline vencido
pub async fn run_failover_loop(state: AppState) {
    let interval = state.config.failover_sweep_interval();
    loop {
        sleep(interval).await;
        sweep_once(&state, Utc::now());
    }
}

/// Una pasada de chequeo:
/// 1. marca UNREACHABLE a los workers sin contacto y reclama sus tareas
///    (y reabre las map cuya salida vivía en ellos, en MAPPING o REDUCING)
/// 2. reclama las tareas con el deadline vencido y marca a su worker
pub fn sweep_once(state: &AppState, now: DateTime<Utc>) {
    // 1) Workers silenciosos
    let silent = state
        .workers
        .sweep_silent(now, state.config.worker_dead_timeout());

    for worker_id in &silent {
        for task in state.tasks.in_flight_for_worker(worker_id) {
            reclaim(state, &task, worker_id, "worker sin contacto", now);
        }
        for job_id in state.jobs.active_ids() {
            let reopened = state.tasks.reopen_lost_map_outputs(&job_id, worker_id);
            if !reopened.is_empty() {
                info!(
                    "job {}: {} tareas map reabiertas (particiones perdidas con {})",
                    job_id,
                    reopened.len(),
                    worker_id
                );
            }
        }
    }

    // 2) Deadlines vencidos
    for task in state.tasks.expired(now) {
        let Some(worker_id) = task.worker_id.clone() else {
            continue;
        };
        reclaim(state, &task, &worker_id, "timeout de la tarea", now);
        state.workers.mark_unreachable(&worker_id);
    }
}

/// Devuelve la tarea a IDLE con retry + 1; si agotó los reintentos, falla el job.
fn reclaim(state: &AppState, task: &TaskInfo, worker_id: &str, cause: &str, now: DateTime<Utc>) {
    let max = state.config.max_task_retries;
    match state.tasks.fail(&task.id, worker_id, cause, max) {
        Ok((t, RetryDecision::Requeued)) => {
            info!(
                "tarea {} del job {} reencolada ({} en {}, reintento {}/{})",
                t.id, t.job_id, cause, worker_id, t.retry_count, max
            );
        }
        Ok((t, RetryDecision::Exhausted)) => {
            let cause = format!("tarea {} agotó {} reintentos: {}", t.id, max, cause);
            fail_job(state, &t.job_id, &cause, now);
        }
        // la tarea cambió entre la lectura y el reclamo (llegó un reporte)
        Err(e) => warn!("no se reclamó {}: {}", task.id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{handle_report, job_view, schedule_pass};
    use crate::testing::{report, TestCluster};
    use chrono::Duration;
    use common::{JobPhase, TaskOutcome, TaskState, WorkerLiveness};

    #[tokio::test]
    async fn worker_silencioso_pierde_tarea_y_particiones() {
        let c = TestCluster::new(2).await;
        let job = c.submit("a b c d", 4, 1).await;
        let now = Utc::now();

        assert_eq!(schedule_pass(&c.state, now).await, 2);
        let sent = c.client.take();
        // el primer worker termina su map, el segundo sigue trabajando
        handle_report(&c.state, &report(&sent[0], TaskOutcome::Completed), now);

        let later = now + Duration::seconds(30);
        c.heartbeat_all_except(&sent[0].worker_id, later);
        sweep_once(&c.state, later);

        let silent = c.state.workers.get(&sent[0].worker_id).unwrap();
        assert_eq!(silent.liveness, WorkerLiveness::Unreachable);
        // su map completada vuelve a IDLE porque el job sigue en MAPPING
        let reopened = c.state.tasks.get(&sent[0].id).unwrap();
        assert_eq!(reopened.state, TaskState::Idle);
        assert_eq!(reopened.retry_count, 0);
        assert_eq!(
            c.state.tasks.get(&sent[1].id).unwrap().state,
            TaskState::Assigned
        );
        assert_eq!(job_view(&c.state, &job.id).unwrap().completed_map_tasks, 0);
    }

    #[tokio::test]
    async fn holder_caido_en_reducing_rehace_su_map_antes_del_reduce() {
        let c = TestCluster::new(3).await;
        let job = c.submit("a b c d", 4, 1).await;
        let now = Utc::now();

        assert_eq!(schedule_pass(&c.state, now).await, 2);
        let maps = c.client.take();
        for d in &maps {
            handle_report(&c.state, &report(d, TaskOutcome::Completed), now);
        }
        assert_eq!(c.state.jobs.phase(&job.id), Some(JobPhase::Reducing));

        let dead = maps[0].worker_id.clone();
        let dead_addr = c.address_of(&dead);
        let later = now + Duration::seconds(30);
        c.heartbeat_all_except(&dead, later);
        sweep_once(&c.state, later);

        let lost = c.state.tasks.get(&maps[0].id).unwrap();
        assert_eq!(lost.state, TaskState::Idle);
        assert!(lost.output_holder.is_none());
        assert_eq!(c.state.jobs.phase(&job.id), Some(JobPhase::Reducing));

        // primero se rehace la map; la reduce espera
        assert_eq!(schedule_pass(&c.state, later).await, 1);
        let redo = c.client.take().remove(0);
        assert_eq!(redo.id, maps[0].id);
        assert_ne!(redo.worker_id, dead);
        handle_report(&c.state, &report(&redo, TaskOutcome::Completed), later);

        assert_eq!(schedule_pass(&c.state, later).await, 1);
        let reduce = c.client.take().remove(0);
        assert!(!reduce.kind.is_map());
        assert_eq!(reduce.sources.len(), 2);
        assert!(reduce
            .sources
            .iter()
            .all(|s| !s.worker_address.is_empty() && s.worker_address != dead_addr));

        handle_report(&c.state, &report(&reduce, TaskOutcome::Completed), later);
        assert_eq!(c.state.jobs.phase(&job.id), Some(JobPhase::Completed));
    }

    #[tokio::test]
    async fn worker_silencioso_con_tarea_en_vuelo_la_devuelve() {
        let c = TestCluster::new(1).await;
        c.submit("a", 10, 1).await;
        let now = Utc::now();
        schedule_pass(&c.state, now).await;
        let d = c.client.take().remove(0);

        sweep_once(&c.state, now + Duration::seconds(30));
        let t = c.state.tasks.get(&d.id).unwrap();
        assert_eq!(t.state, TaskState::Idle);
        assert_eq!(t.retry_count, 1);
        assert_eq!(t.last_error.as_deref(), Some("worker sin contacto"));
    }

    #[tokio::test]
    async fn timeouts_repetidos_fallan_el_job() {
        let c = TestCluster::with_retries(1, 0).await;
        let job = c.submit("a", 10, 1).await;
        let now = Utc::now();
        schedule_pass(&c.state, now).await;

        let later = now + c.state.config.task_timeout() + Duration::seconds(1);
        c.heartbeat_all_except("", later);
        sweep_once(&c.state, later);

        let view = job_view(&c.state, &job.id).unwrap();
        assert_eq!(view.phase, JobPhase::Failed);
        assert!(view.failure_cause.unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn pasada_sin_novedades_no_toca_nada() {
        let c = TestCluster::new(1).await;
        c.submit("a", 10, 1).await;
        let now = Utc::now();
        schedule_pass(&c.state, now).await;
        let d = c.client.take().remove(0);

        sweep_once(&c.state, now + Duration::seconds(1));
        assert_eq!(c.state.tasks.get(&d.id).unwrap().state, TaskState::Assigned);
    }
}
