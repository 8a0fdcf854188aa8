use common::storage::ObjectStore;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::artifacts::ArtifactStore;
use crate::config::CoordinatorConfig;
use crate::dispatch::{HttpWorkerClient, WorkerClient};
use crate::jobs::JobTable;
use crate::persist::JsonMirror;
use crate::pool::WorkerPool;
use crate::store::TaskStore;

/// Estado compartido del coordinator. Cada tabla sincroniza internamente;
/// ningún lock se mantiene a través de un `.await`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<CoordinatorConfig>,
    pub jobs: JobTable,
    pub tasks: TaskStore,
    pub workers: WorkerPool,
    pub artifacts: ArtifactStore,
    pub objects: ObjectStore,
    pub dispatcher: Arc<dyn WorkerClient>,
    /// Token que los workers presentan al registrarse
    pub cluster_token: Option<String>,
}

impl AppState {
    /// Estado de producción: espejo en disco si hay STATE_DIR, RPC por HTTP.
    pub fn from_config(config: CoordinatorConfig) -> anyhow::Result<Self> {
        let (jobs, tasks) = match &config.state_dir {
            Some(dir) => (
                JobTable::open(JsonMirror::new(dir.join("jobs.json"))?)?,
                TaskStore::open(JsonMirror::new(dir.join("tasks.json"))?)?,
            ),
            None => (JobTable::in_memory(), TaskStore::in_memory()),
        };
        let dispatcher = Arc::new(HttpWorkerClient::new(Duration::from_secs(10))?);
        let cluster_token = config.load_cluster_token()?;
        Ok(Self {
            artifacts: ArtifactStore::new(&config.artifacts_path),
            config: Arc::new(config),
            jobs,
            tasks,
            workers: WorkerPool::new(),
            objects: ObjectStore::default(),
            dispatcher,
            cluster_token,
        })
    }

    /// Estado en memoria con el cliente de workers dado (tests y embebido).
    pub fn with_dispatcher(config: CoordinatorConfig, dispatcher: Arc<dyn WorkerClient>) -> Self {
        Self {
            artifacts: ArtifactStore::new(&config.artifacts_path),
            config: Arc::new(config),
            jobs: JobTable::in_memory(),
            tasks: TaskStore::in_memory(),
            workers: WorkerPool::new(),
            objects: ObjectStore::default(),
            dispatcher,
            cluster_token: None,
        }
    }
}

/// Lock que ignora el envenenamiento del mutex.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
