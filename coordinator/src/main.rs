use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use coordinator::{build_router, failover, scheduler, AppState, CoordinatorConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("coordinator=debug,tower_http=info")),
        )
        .init();

    let config = CoordinatorConfig::parse();
    info!(
        "coordinator: artefactos en {}, split {} bytes, pool {}",
        config.artifacts_path.display(),
        config.split_size,
        config.worker_pool
    );
    let listen_addr = config.listen_addr.clone();
    let state = AppState::from_config(config)?;

    // jobs que quedaron a medio camino en el espejo
    scheduler::resume_jobs(&state, Utc::now()).await;

    // router HTTP
    let app = build_router(state.clone());

    // scheduler y failover en segundo plano
    tokio::spawn(scheduler::run_scheduler_loop(state.clone()));
    tokio::spawn(failover::run_failover_loop(state.clone()));

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", listen_addr))?;
    info!("coordinator escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
