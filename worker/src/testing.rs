//! Coordinator falso y armado de tareas para los tests del worker.

use anyhow::bail;
use async_trait::async_trait;
use common::{
    Credentials, ProgramRef, ReportAck, Split, StorageBinding, TaskDescriptor, TaskKind,
    TaskOutcome, TaskReport, WorkerHeartbeatRequest, WorkerRegisterRequest,
    WorkerRegisterResponse,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::WorkerConfig;
use crate::coordinator_client::{CoordinatorApi, HeartbeatStatus};
use crate::engine::Engine;

#[derive(Default)]
pub(crate) struct FakeCoordinator {
    // revisión None: sirve cualquier revisión pedida
    artifacts: Mutex<HashMap<String, (Option<i64>, Vec<u8>)>>,
    fetches: AtomicUsize,
    reports: Mutex<Vec<TaskReport>>,
}

impl FakeCoordinator {
    pub(crate) fn with_artifact(name: &str, bytes: &[u8]) -> Self {
        let fake = Self::default();
        fake.artifacts
            .lock()
            .unwrap()
            .insert(name.to_string(), (None, bytes.to_vec()));
        fake
    }

    /// Sólo sirve `revision`; otra revisión se trata como re-subida.
    pub(crate) fn with_revision(name: &str, revision: i64, bytes: &[u8]) -> Self {
        let fake = Self::default();
        fake.artifacts
            .lock()
            .unwrap()
            .insert(name.to_string(), (Some(revision), bytes.to_vec()));
        fake
    }

    pub(crate) fn artifact_fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub(crate) fn reports(&self) -> Vec<TaskReport> {
        self.reports.lock().unwrap().clone()
    }

    /// Espera el reporte COMPLETED o FAILED de la tarea.
    pub(crate) async fn wait_final_report(&self, task_id: &str, limit: Duration) -> Option<TaskReport> {
        let start = Instant::now();
        while start.elapsed() < limit {
            let last = self
                .reports()
                .into_iter()
                .find(|r| r.task_id == task_id && r.outcome != TaskOutcome::Running);
            if last.is_some() {
                return last;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        None
    }
}

#[async_trait]
impl CoordinatorApi for FakeCoordinator {
    async fn register(&self, _req: &WorkerRegisterRequest) -> anyhow::Result<WorkerRegisterResponse> {
        Ok(WorkerRegisterResponse {
            worker_id: "w-test".to_string(),
        })
    }

    async fn heartbeat(&self, _req: &WorkerHeartbeatRequest) -> anyhow::Result<HeartbeatStatus> {
        Ok(HeartbeatStatus::Ok)
    }

    async fn report(&self, report: &TaskReport) -> anyhow::Result<ReportAck> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(ReportAck { accepted: true })
    }

    async fn fetch_artifact(&self, program: &ProgramRef) -> anyhow::Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        match self.artifacts.lock().unwrap().get(&program.name) {
            Some((Some(rev), _)) if *rev != program.revision => {
                bail!("revisión {} de {} no disponible", program.revision, program.name)
            }
            Some((_, bytes)) => Ok(bytes.clone()),
            None => bail!("artefacto {} inexistente", program.name),
        }
    }
}

pub(crate) fn test_engine(root: &Path, coordinator: std::sync::Arc<FakeCoordinator>) -> Engine {
    let config = WorkerConfig {
        int_files_loc: root.join("int"),
        artifact_cache: root.join("cache"),
        socket_dir: root.join("s"),
        channel_retry_delay_ms: 50,
        channel_timeout_secs: 5,
        process_timeout_secs: 10,
        ..WorkerConfig::default()
    };
    Engine::new(&config, coordinator, reqwest::Client::new())
}

/// Tarea map sobre un archivo local con `content` entero como único split.
pub(crate) fn map_task(root: &Path, id: &str, program: &str, content: &str) -> TaskDescriptor {
    let input = root.join(format!("{}.txt", id));
    std::fs::write(&input, content).unwrap();
    TaskDescriptor {
        id: id.to_string(),
        job_id: "j-test".to_string(),
        worker_id: "w-test".to_string(),
        kind: TaskKind::Map {
            split: Split {
                index: 0,
                offset: 0,
                length: content.len() as u64,
            },
        },
        attempt: 0,
        program: ProgramRef {
            name: program.to_string(),
            revision: 1,
        },
        n_reducers: 1,
        storage: StorageBinding {
            location: input.display().to_string(),
            use_tls: false,
            credentials: Credentials::default(),
        },
        sources: Vec::new(),
    }
}
