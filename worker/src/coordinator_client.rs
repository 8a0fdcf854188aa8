use anyhow::{bail, Context};
use async_trait::async_trait;
use common::retry::{retry, RetryPolicy};
use common::{
    ProgramRef, ReportAck, TaskReport, WorkerHeartbeatRequest, WorkerRegisterRequest,
    WorkerRegisterResponse,
};
use reqwest::{Client, StatusCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    Ok,
    /// El coordinator no conoce este worker (se reinició): hay que re-registrarse
    UnknownWorker,
}

/// Llamadas worker -> coordinator.
#[async_trait]
pub trait CoordinatorApi: Send + Sync {
    async fn register(&self, req: &WorkerRegisterRequest) -> anyhow::Result<WorkerRegisterResponse>;
    async fn heartbeat(&self, req: &WorkerHeartbeatRequest) -> anyhow::Result<HeartbeatStatus>;
    async fn report(&self, report: &TaskReport) -> anyhow::Result<ReportAck>;
    /// Contenido del programa en la revisión fijada por el job.
    async fn fetch_artifact(&self, program: &ProgramRef) -> anyhow::Result<Vec<u8>>;
}

pub struct HttpCoordinator {
    base_url: String,
    http: Client,
    report_retry: RetryPolicy,
}

impl HttpCoordinator {
    pub fn new(base_url: &str, http: Client, report_retry: RetryPolicy) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            report_retry,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl CoordinatorApi for HttpCoordinator {
    async fn register(&self, req: &WorkerRegisterRequest) -> anyhow::Result<WorkerRegisterResponse> {
        let resp = self
            .http
            .post(self.url("/api/v1/workers/register"))
            .json(req)
            .send()
            .await
            .context("registrando el worker")?;
        if resp.status() == StatusCode::FORBIDDEN {
            bail!("el coordinator rechazó el registro (pool o token de cluster)");
        }
        let resp = resp.error_for_status()?;
        Ok(resp.json().await?)
    }

    async fn heartbeat(&self, req: &WorkerHeartbeatRequest) -> anyhow::Result<HeartbeatStatus> {
        let resp = self
            .http
            .post(self.url("/api/v1/workers/heartbeat"))
            .json(req)
            .send()
            .await
            .context("enviando heartbeat")?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(HeartbeatStatus::UnknownWorker);
        }
        resp.error_for_status()?;
        Ok(HeartbeatStatus::Ok)
    }

    /// Con reintentos: un reporte perdido deja la tarea esperando el timeout.
    async fn report(&self, report: &TaskReport) -> anyhow::Result<ReportAck> {
        let url = self.url("/api/v1/tasks/report");
        let what = format!("reportar la tarea {}", report.task_id);
        let (http, url) = (&self.http, url.as_str());
        let ack = retry(self.report_retry, &what, |_| async move {
            let resp = http.post(url).json(report).send().await?;
            resp.error_for_status()?.json::<ReportAck>().await
        })
        .await?;
        Ok(ack)
    }

    async fn fetch_artifact(&self, program: &ProgramRef) -> anyhow::Result<Vec<u8>> {
        let name = &program.name;
        let path = format!(
            "/api/v1/artifacts/{}/content?revision={}",
            name, program.revision
        );
        let resp = self
            .http
            .get(self.url(&path))
            .send()
            .await
            .with_context(|| format!("descargando el artefacto {}", name))?;
        match resp.status() {
            StatusCode::NOT_FOUND => bail!("el artefacto {} ya no existe en el coordinator", name),
            StatusCode::CONFLICT => bail!(
                "el artefacto {} se re-subió: la revisión {} ya no está disponible",
                name,
                program.revision
            ),
            _ => {}
        }
        let bytes = resp.error_for_status()?.bytes().await?;
        Ok(bytes.to_vec())
    }
}
