//! Particiones intermedias que produce cada tarea map.
//!
//! Se guardan en `<INT_FILES_LOC>/<job>/<tarea map>/<partición>.json` y las
//! sirve el propio worker por HTTP a los reducers de otros nodos.

use common::{KvPair, KvPairArray, PartitionSource};
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("E/S sobre {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("partición {0} con formato inválido: {1}")]
    Malformed(String, serde_json::Error),
    #[error("la tarea {0} no tiene worker que guarde su salida")]
    NoHolder(String),
    #[error("pidiendo {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} respondió {status}")]
    Status { url: String, status: StatusCode },
}

#[derive(Clone)]
pub struct PartitionStore {
    root: PathBuf,
    http: Client,
}

impl PartitionStore {
    pub fn new(root: impl Into<PathBuf>, http: Client) -> Self {
        Self {
            root: root.into(),
            http,
        }
    }

    pub fn path(&self, job_id: &str, task_id: &str, partition: u32) -> PathBuf {
        self.root
            .join(job_id)
            .join(task_id)
            .join(format!("{}.json", partition))
    }

    /// Escribe una partición (temporal + rename: un lector nunca ve medio archivo).
    pub async fn write(
        &self,
        job_id: &str,
        task_id: &str,
        partition: u32,
        pairs: Vec<KvPair>,
    ) -> Result<(), PartitionError> {
        let path = self.path(job_id, task_id, partition);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(parent, e))?;
        }
        let bytes = serde_json::to_vec(&KvPairArray { pairs })
            .map_err(|e| PartitionError::Malformed(path.display().to_string(), e))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| io_err(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_err(&path, e))?;
        Ok(())
    }

    /// Bytes crudos de una partición local; None si no existe.
    pub async fn read_local(
        &self,
        job_id: &str,
        task_id: &str,
        partition: u32,
    ) -> Result<Option<Vec<u8>>, PartitionError> {
        let path = self.path(job_id, task_id, partition);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    /// Borra todas las particiones del job. true si había algo.
    pub async fn remove_job(&self, job_id: &str) -> Result<bool, PartitionError> {
        let dir = self.root.join(job_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!("particiones del job {} borradas", job_id);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&dir, e)),
        }
    }

    /// Pares de la partición `partition` que produjo `source`: del disco si la
    /// tarea corrió acá, si no del worker que la guarda.
    pub async fn fetch(
        &self,
        source: &PartitionSource,
        job_id: &str,
        partition: u32,
    ) -> Result<Vec<KvPair>, PartitionError> {
        let origin = source.map_task_id.clone();
        let bytes = match self.read_local(job_id, &source.map_task_id, partition).await? {
            Some(bytes) => bytes,
            None => self.fetch_remote(source, job_id, partition).await?,
        };
        let array: KvPairArray =
            serde_json::from_slice(&bytes).map_err(|e| PartitionError::Malformed(origin, e))?;
        Ok(array.pairs)
    }

    async fn fetch_remote(
        &self,
        source: &PartitionSource,
        job_id: &str,
        partition: u32,
    ) -> Result<Vec<u8>, PartitionError> {
        if source.worker_address.is_empty() {
            return Err(PartitionError::NoHolder(source.map_task_id.clone()));
        }
        let url = format!(
            "{}/api/v1/partitions/{}/{}/{}",
            source.worker_address.trim_end_matches('/'),
            job_id,
            source.map_task_id,
            partition
        );
        debug!("pidiendo partición remota {}", url);
        let http_err = |e| PartitionError::Http {
            url: url.clone(),
            source: e,
        };
        let resp = self.http.get(&url).send().await.map_err(http_err)?;
        if !resp.status().is_success() {
            return Err(PartitionError::Status {
                url: url.clone(),
                status: resp.status(),
            });
        }
        let bytes = resp.bytes().await.map_err(http_err)?;
        Ok(bytes.to_vec())
    }
}

fn io_err(path: &Path, source: std::io::Error) -> PartitionError {
    PartitionError::Io {
        path: path.to_path_buf(),
        source,
    }
}
