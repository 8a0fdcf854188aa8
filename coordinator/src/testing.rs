//! Armado de un coordinator en memoria para los tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    AssignResponse, Credentials, JobInfo, JobRequest, TaskDescriptor, TaskOutcome, TaskReport,
    WorkerHeartbeatRequest, WorkerId, WorkerRegisterRequest,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use crate::config::CoordinatorConfig;
use crate::dispatch::{DispatchError, WorkerClient};
use crate::scheduler::submit_job;
use crate::state::AppState;

/// Cliente de workers falso: registra cada AssignTask y acepta salvo que la
/// dirección esté marcada para rechazar o para fallar.
#[derive(Default)]
pub(crate) struct FakeWorkerClient {
    sent: Mutex<Vec<TaskDescriptor>>,
    released: Mutex<Vec<(String, String)>>,
    rejecting: Mutex<HashSet<String>>,
    broken: Mutex<HashSet<String>>,
}

impl FakeWorkerClient {
    pub(crate) fn take(&self) -> Vec<TaskDescriptor> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    /// (dirección, job) de cada liberación de particiones pedida.
    pub(crate) fn released(&self) -> Vec<(String, String)> {
        self.released.lock().unwrap().clone()
    }

    pub(crate) fn reject(&self, address: &str) {
        self.rejecting.lock().unwrap().insert(address.to_string());
    }

    pub(crate) fn fail_transport(&self, address: &str) {
        self.broken.lock().unwrap().insert(address.to_string());
    }
}

#[async_trait]
impl WorkerClient for FakeWorkerClient {
    async fn assign_task(
        &self,
        address: &str,
        task: &TaskDescriptor,
    ) -> Result<AssignResponse, DispatchError> {
        // da lugar a que otras pasadas se intercalen
        tokio::task::yield_now().await;

        if self.broken.lock().unwrap().contains(address) {
            return Err(DispatchError::Status {
                address: address.to_string(),
                status: 503,
            });
        }
        self.sent.lock().unwrap().push(task.clone());
        if self.rejecting.lock().unwrap().contains(address) {
            return Ok(AssignResponse::rejected("worker ocupado"));
        }
        Ok(AssignResponse::accepted())
    }

    async fn release_partitions(&self, address: &str, job_id: &str) -> Result<(), DispatchError> {
        self.released
            .lock()
            .unwrap()
            .push((address.to_string(), job_id.to_string()));
        Ok(())
    }
}

pub(crate) struct TestCluster {
    pub dir: TempDir,
    pub state: AppState,
    pub client: Arc<FakeWorkerClient>,
    pub workers: Vec<WorkerId>,
}

impl TestCluster {
    pub(crate) async fn new(n_workers: usize) -> Self {
        Self::with_retries(n_workers, 3).await
    }

    pub(crate) async fn with_retries(n_workers: usize, max_task_retries: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = CoordinatorConfig {
            artifacts_path: dir.path().join("artifacts"),
            max_task_retries,
            ..CoordinatorConfig::default()
        };
        let client = Arc::new(FakeWorkerClient::default());
        let state = AppState::with_dispatcher(config, client.clone());

        state.artifacts.save("wc-mapper", b"#!/bin/sh\n").await.unwrap();
        state.artifacts.save("wc-reducer", b"#!/bin/sh\n").await.unwrap();

        let workers = (0..n_workers)
            .map(|i| {
                state.workers.register(
                    &WorkerRegisterRequest {
                        hostname: format!("w{}", i),
                        address: format!("http://w{}:8090", i),
                        pool: "mr-workers".to_string(),
                        token: None,
                    },
                    Utc::now(),
                )
            })
            .collect();

        Self {
            dir,
            state,
            client,
            workers,
        }
    }

    /// Request de wordcount sobre un archivo local con `content`.
    pub(crate) fn request(&self, content: &str, split_size: u64, n_reducers: u32) -> JobRequest {
        let input = self
            .dir
            .path()
            .join(format!("input-{}.txt", uuid::Uuid::new_v4()));
        std::fs::write(&input, content).unwrap();
        JobRequest {
            n_reducers,
            input_path: input.display().to_string(),
            input_type: "file/txt".to_string(),
            output_path: self.dir.path().join("output").display().to_string(),
            use_tls: false,
            mapper_name: "wc-mapper".to_string(),
            reducer_name: "wc-reducer".to_string(),
            input_storage_credentials: Credentials::default(),
            output_storage_credentials: Credentials::default(),
            split_size: Some(split_size),
        }
    }

    pub(crate) async fn submit(&self, content: &str, split_size: u64, n_reducers: u32) -> JobInfo {
        let req = self.request(content, split_size, n_reducers);
        submit_job(&self.state, req, Utc::now()).await.unwrap()
    }

    pub(crate) fn heartbeat_all_except(&self, skip: &str, now: DateTime<Utc>) {
        for w in self.workers.iter().filter(|w| w.as_str() != skip) {
            let busy = self
                .state
                .workers
                .get(w)
                .is_some_and(|e| e.current_task.is_some());
            self.state.workers.heartbeat(
                &WorkerHeartbeatRequest {
                    worker_id: w.clone(),
                    busy,
                    cpu_percent: None,
                    mem_bytes: None,
                },
                now,
            );
        }
    }

    pub(crate) fn address_of(&self, worker_id: &str) -> String {
        self.state.workers.address(worker_id).unwrap()
    }

    pub(crate) fn address_of_first_worker(&self) -> String {
        self.address_of(&self.workers[0])
    }
}

pub(crate) fn report(task: &TaskDescriptor, outcome: TaskOutcome) -> TaskReport {
    TaskReport {
        task_id: task.id.clone(),
        worker_id: task.worker_id.clone(),
        outcome,
    }
}
