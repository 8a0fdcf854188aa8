use common::{AssignResponse, TaskDescriptor, TaskId, TaskOutcome, TaskReport};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

use crate::coordinator_client::CoordinatorApi;
use crate::engine::Engine;

/// Agente de ejecución: una tarea a la vez.
pub struct Agent {
    current: Mutex<Option<TaskId>>,
    engine: Engine,
    coordinator: Arc<dyn CoordinatorApi>,
}

impl Agent {
    pub fn new(engine: Engine, coordinator: Arc<dyn CoordinatorApi>) -> Arc<Self> {
        Arc::new(Self {
            current: Mutex::new(None),
            engine,
            coordinator,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn is_busy(&self) -> bool {
        self.current().is_some()
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.current().clone()
    }

    /// Acepta la tarea si está libre y la corre en background.
    /// Responde enseguida: el resultado llega después por ReportOutcome.
    pub fn assign(self: &Arc<Self>, task: TaskDescriptor) -> AssignResponse {
        {
            let mut current = self.current();
            if let Some(running) = current.as_ref() {
                warn!("rechazada {}: ocupado con {}", task.id, running);
                return AssignResponse::rejected(format!("ocupado con {}", running));
            }
            *current = Some(task.id.clone());
        }

        info!(
            "tarea {} ({}, intento {}) aceptada",
            task.id,
            task.kind.label(),
            task.attempt
        );
        let agent = Arc::clone(self);
        tokio::spawn(async move { agent.run(task).await });
        AssignResponse::accepted()
    }

    async fn run(&self, task: TaskDescriptor) {
        self.send_report(&task, TaskOutcome::Running).await;

        let outcome = match self.engine.execute(&task).await {
            Ok(()) => TaskOutcome::Completed,
            Err(e) => {
                warn!("tarea {} falló: {:#}", task.id, e);
                TaskOutcome::Failed {
                    cause: format!("{:#}", e),
                }
            }
        };

        // libre antes de reportar: el coordinator puede reasignar al instante
        *self.current() = None;
        self.send_report(&task, outcome).await;
    }

    async fn send_report(&self, task: &TaskDescriptor, outcome: TaskOutcome) {
        let report = TaskReport {
            task_id: task.id.clone(),
            worker_id: task.worker_id.clone(),
            outcome,
        };
        match self.coordinator.report(&report).await {
            Ok(ack) if !ack.accepted => {
                warn!("el coordinator descartó el reporte de {} (obsoleto)", task.id)
            }
            Ok(_) => {}
            Err(e) => warn!("no se pudo reportar {}: {:#}", task.id, e),
        }
    }

    fn current(&self) -> MutexGuard<'_, Option<TaskId>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{map_task, test_engine, FakeCoordinator};
    use std::time::Duration;

    #[tokio::test]
    async fn ocupado_rechaza_la_segunda_tarea() {
        let dir = tempfile::tempdir().unwrap();
        // termina bien pero nunca manda salida
        let coordinator = Arc::new(FakeCoordinator::with_artifact(
            "mudo",
            b"#!/bin/sh\nsleep 1\n",
        ));
        let agent = Agent::new(test_engine(dir.path(), coordinator.clone()), coordinator.clone());

        let first = map_task(dir.path(), "t-1", "mudo", "a b");
        let second = map_task(dir.path(), "t-2", "mudo", "c");
        assert!(agent.assign(first).accepted);
        let rejected = agent.assign(second);
        assert!(!rejected.accepted);
        assert!(rejected.reason.unwrap().contains("t-1"));
        assert_eq!(agent.current_task().as_deref(), Some("t-1"));

        let last = coordinator
            .wait_final_report("t-1", Duration::from_secs(15))
            .await
            .expect("sin reporte final");
        assert!(matches!(last.outcome, TaskOutcome::Failed { .. }));
        assert!(!agent.is_busy());

        let reports = coordinator.reports();
        assert_eq!(reports[0].outcome, TaskOutcome::Running);
        assert_eq!(reports[0].worker_id, "w-test");
    }

    #[tokio::test]
    async fn programa_que_falla_reporta_la_causa() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Arc::new(FakeCoordinator::with_artifact("roto", b"#!/bin/sh\nexit 7\n"));
        let agent = Agent::new(test_engine(dir.path(), coordinator.clone()), coordinator.clone());

        assert!(agent.assign(map_task(dir.path(), "t-9", "roto", "x")).accepted);
        let last = coordinator
            .wait_final_report("t-9", Duration::from_secs(15))
            .await
            .expect("sin reporte final");
        match last.outcome {
            TaskOutcome::Failed { cause } => assert!(cause.contains("mapper de t-9")),
            other => panic!("esperaba FAILED, llegó {:?}", other),
        }
    }
}
