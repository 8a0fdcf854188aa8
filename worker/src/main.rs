use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use worker::WorkerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("worker=debug,reqwest=info")),
        )
        .init();

    let config = WorkerConfig::parse();
    worker::worker::run(config).await
}
