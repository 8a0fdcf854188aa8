use anyhow::{Context, Result};
use common::retry::{retry, RetryPolicy};
use common::{WorkerHeartbeatRequest, WorkerId, WorkerRegisterRequest};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{CpuExt, System, SystemExt};
use tokio::net::TcpListener;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::agent::Agent;
use crate::config::WorkerConfig;
use crate::coordinator_client::{CoordinatorApi, HeartbeatStatus, HttpCoordinator};
use crate::engine::Engine;
use crate::handlers::build_router;

/// Arranque completo del worker:
/// - levanta el servidor HTTP (AssignTask + particiones)
/// - se registra en el coordinator
/// - manda heartbeats periódicos con CPU/MEM y si está ocupado
pub async fn run(config: WorkerConfig) -> Result<()> {
    let http = Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .context("armando el cliente HTTP")?;
    let coordinator: Arc<dyn CoordinatorApi> = Arc::new(HttpCoordinator::new(
        &config.coordinator_url,
        http.clone(),
        RetryPolicy::new(5, Duration::from_secs(1)),
    ));

    let engine = Engine::new(&config, coordinator.clone(), http);
    let agent = Agent::new(engine, coordinator.clone());

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("escuchando en {}", config.listen_addr))?;
    info!("worker escuchando en {}", config.listen_addr);
    let app = build_router(agent.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("el servidor HTTP del worker terminó: {}", e);
        }
    });

    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let register = WorkerRegisterRequest {
        address: config.advertise_address(&hostname),
        hostname,
        pool: config.worker_pool.clone(),
        token: config.load_cluster_token()?,
    };

    run_membership(&config, coordinator.as_ref(), &agent, &register).await
}

/// Registro + heartbeats. Si el coordinator dejó de conocer a este worker
/// (se reinició) se vuelve a registrar y sigue.
pub async fn run_membership(
    config: &WorkerConfig,
    coordinator: &dyn CoordinatorApi,
    agent: &Agent,
    register: &WorkerRegisterRequest,
) -> Result<()> {
    let mut worker_id = register_with_retry(coordinator, register).await?;

    // System para leer CPU y memoria
    let mut sys = System::new_all();

    loop {
        sleep(config.heartbeat_interval()).await;

        sys.refresh_cpu();
        sys.refresh_memory();
        let req = WorkerHeartbeatRequest {
            worker_id: worker_id.clone(),
            busy: agent.is_busy(),
            cpu_percent: Some(sys.global_cpu_info().cpu_usage()),
            mem_bytes: Some(sys.used_memory()),
        };

        match coordinator.heartbeat(&req).await {
            Ok(HeartbeatStatus::Ok) => {}
            Ok(HeartbeatStatus::UnknownWorker) => {
                warn!("el coordinator no conoce a {}; re-registrando", worker_id);
                worker_id = register_with_retry(coordinator, register).await?;
            }
            Err(e) => warn!("heartbeat fallido: {:#}", e),
        }
    }
}

async fn register_with_retry(
    coordinator: &dyn CoordinatorApi,
    register: &WorkerRegisterRequest,
) -> Result<WorkerId> {
    // el coordinator puede tardar en levantar
    let policy = RetryPolicy::new(30, Duration::from_secs(2));
    let resp = retry(policy, "registrar el worker", move |_| coordinator.register(register)).await?;
    info!(
        "worker {} registrado como {} (pool {})",
        register.address, resp.worker_id, register.pool
    );
    Ok(resp.worker_id)
}
