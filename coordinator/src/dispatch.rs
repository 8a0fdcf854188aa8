use async_trait::async_trait;
use common::{AssignResponse, TaskDescriptor};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no se pudo contactar al worker {address}: {source}")]
    Transport {
        address: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("el worker {address} respondió {status}")]
    Status { address: String, status: u16 },
}

/// RPC coordinator -> worker (AssignTask y liberación de particiones).
#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn assign_task(
        &self,
        address: &str,
        task: &TaskDescriptor,
    ) -> Result<AssignResponse, DispatchError>;

    async fn release_partitions(&self, address: &str, job_id: &str) -> Result<(), DispatchError>;
}

pub struct HttpWorkerClient {
    http: reqwest::Client,
}

impl HttpWorkerClient {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn assign_task(
        &self,
        address: &str,
        task: &TaskDescriptor,
    ) -> Result<AssignResponse, DispatchError> {
        let url = format!("{}/api/v1/tasks/assign", address.trim_end_matches('/'));
        let transport = |source| DispatchError::Transport {
            address: address.to_string(),
            source,
        };

        let resp = self.http.post(&url).json(task).send().await.map_err(transport)?;
        if !resp.status().is_success() {
            return Err(DispatchError::Status {
                address: address.to_string(),
                status: resp.status().as_u16(),
            });
        }
        resp.json::<AssignResponse>().await.map_err(transport)
    }

    async fn release_partitions(&self, address: &str, job_id: &str) -> Result<(), DispatchError> {
        let url = format!(
            "{}/api/v1/partitions/{}",
            address.trim_end_matches('/'),
            job_id
        );
        let resp = self
            .http
            .delete(&url)
            .send()
            .await
            .map_err(|source| DispatchError::Transport {
                address: address.to_string(),
                source,
            })?;
        if !resp.status().is_success() {
            return Err(DispatchError::Status {
                address: address.to_string(),
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }
}
