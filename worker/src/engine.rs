use anyhow::{anyhow, Context, Result};
use common::channel::{
    send_message, ChannelSettings, MessageListener, INPUT_SOCKET_ENV, OUTPUT_SOCKET_ENV,
};
use common::results::output_object;
use common::shuffle::{group_by_key, partition_pairs};
use common::storage::{ObjectLocation, ObjectStore};
use common::{GroupedPair, KvPair, KvPairArray, Split, TaskDescriptor, TaskKind};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

use crate::artifacts::ArtifactCache;
use crate::config::WorkerConfig;
use crate::coordinator_client::CoordinatorApi;
use crate::partitions::PartitionStore;
use crate::process::{check_status, spawn_program, wait_success};

/// Espera máxima de la salida de un mapper que ya terminó con éxito.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Ejecuta tareas map y reduce sobre programas de usuario.
pub struct Engine {
    objects: ObjectStore,
    partitions: PartitionStore,
    artifacts: ArtifactCache,
    socket_dir: PathBuf,
    channel: ChannelSettings,
    process_timeout: Duration,
}

impl Engine {
    pub fn new(config: &WorkerConfig, coordinator: Arc<dyn CoordinatorApi>, http: Client) -> Self {
        Self {
            objects: ObjectStore::new(http.clone()),
            partitions: PartitionStore::new(&config.int_files_loc, http),
            artifacts: ArtifactCache::new(&config.artifact_cache, coordinator),
            socket_dir: config.socket_dir.clone(),
            channel: config.channel_settings(),
            process_timeout: config.process_timeout(),
        }
    }

    pub fn partitions(&self) -> &PartitionStore {
        &self.partitions
    }

    #[instrument(skip_all, fields(task = %task.id, attempt = task.attempt))]
    pub async fn execute(&self, task: &TaskDescriptor) -> Result<()> {
        let started = Instant::now();
        let program = self.artifacts.resolve(&task.program).await?;
        let work_dir = self
            .socket_dir
            .join(format!("{}-{}", task.id, task.attempt));

        let result = match &task.kind {
            TaskKind::Map { split } => self.run_map(task, split, &program, &work_dir).await,
            TaskKind::Reduce { partition } => {
                self.run_reduce(task, *partition, &program, &work_dir).await
            }
        };

        // los sockets ya se borraron; queda el directorio
        let _ = tokio::fs::remove_dir_all(&work_dir).await;
        if result.is_ok() {
            info!(
                "tarea {} ({}) terminada en {} ms",
                task.id,
                task.kind.label(),
                started.elapsed().as_millis()
            );
        }
        result
    }

    /* --------- Map --------- */

    async fn run_map(
        &self,
        task: &TaskDescriptor,
        split: &Split,
        program: &Path,
        work_dir: &Path,
    ) -> Result<()> {
        let input = ObjectLocation::parse(&task.storage.location, task.storage.use_tls)?;
        let bytes = self
            .objects
            .read_range(&input, &task.storage.credentials, split.offset, split.length)
            .await
            .with_context(|| format!("leyendo el split {} de {}", split.index, input.describe()))?;
        let content = String::from_utf8_lossy(&bytes).into_owned();
        debug!("split {}: {} bytes", split.index, bytes.len());

        let listener = MessageListener::bind(work_dir.join("out.sock"))?;
        let mut child = spawn_program(
            program,
            [split.index.to_string(), content],
            &[(OUTPUT_SOCKET_ENV, listener.path())],
        )
        .await?;
        let what = format!("mapper de {}", task.id);

        let receive = listener.receive::<KvPairArray>(self.process_timeout);
        tokio::pin!(receive);
        let output = tokio::select! {
            biased;
            received = &mut receive => received?,
            status = child.wait() => {
                check_status(status?, &what)?;
                tokio::time::timeout(EXIT_GRACE, &mut receive)
                    .await
                    .map_err(|_| anyhow!("{} terminó sin enviar su salida", what))??
            }
        };
        wait_success(&mut child, self.process_timeout, &what).await?;

        let buckets = partition_pairs(output.pairs, task.n_reducers);
        for (p, bucket) in buckets.into_iter().enumerate() {
            self.partitions
                .write(&task.job_id, &task.id, p as u32, bucket)
                .await?;
        }
        Ok(())
    }

    /* --------- Reduce --------- */

    async fn run_reduce(
        &self,
        task: &TaskDescriptor,
        partition: u32,
        program: &Path,
        work_dir: &Path,
    ) -> Result<()> {
        let mut pairs = Vec::new();
        for source in &task.sources {
            let fetched = self
                .partitions
                .fetch(source, &task.job_id, partition)
                .await
                .with_context(|| format!("partición {} de {}", partition, source.map_task_id))?;
            pairs.extend(fetched);
        }

        let groups = group_by_key(pairs);
        debug!("partición {}: {} claves", partition, groups.len());
        let mut results = Vec::with_capacity(groups.len());
        for (order, group) in groups.into_iter().enumerate() {
            results.push(self.reduce_group(task, program, work_dir, order, group).await?);
        }

        let target = output_object(&task.storage.location, &task.job_id, partition);
        let out = ObjectLocation::parse(&target, task.storage.use_tls)?;
        let bytes = serde_json::to_vec(&KvPairArray { pairs: results })?;
        self.objects
            .write(&out, &task.storage.credentials, bytes)
            .await
            .with_context(|| format!("escribiendo {}", out.describe()))?;
        Ok(())
    }

    /// Un subproceso reducer por clave: recibe el grupo en su socket de
    /// entrada y devuelve el par reducido por el de salida.
    async fn reduce_group(
        &self,
        task: &TaskDescriptor,
        program: &Path,
        work_dir: &Path,
        order: usize,
        group: GroupedPair,
    ) -> Result<KvPair> {
        let listener = MessageListener::bind(work_dir.join(format!("out-{}.sock", order)))?;
        let input = work_dir.join(format!("in-{}.sock", order));
        let mut child = spawn_program(
            program,
            [order.to_string()],
            &[
                (INPUT_SOCKET_ENV, input.as_path()),
                (OUTPUT_SOCKET_ENV, listener.path()),
            ],
        )
        .await?;
        let what = format!("reducer {} de {}", order, task.id);

        send_message(&input, &group, &self.channel)
            .await
            .with_context(|| format!("enviando la clave {} a {}", group.key, what))?;
        let result: KvPair = listener.receive(self.process_timeout).await?;
        wait_success(&mut child, self.process_timeout, &what).await?;
        Ok(result)
    }
}
