use anyhow::Context;
use clap::Parser;
use common::channel::ChannelSettings;
use common::retry::RetryPolicy;
use std::path::PathBuf;
use std::time::Duration;

/// Configuración del worker: cada opción es flag y variable de entorno.
#[derive(Debug, Clone, Parser)]
#[command(name = "worker", about = "Agente worker del motor map/reduce")]
pub struct WorkerConfig {
    #[arg(long, env = "COORDINATOR_URL", default_value = "http://localhost:8080")]
    pub coordinator_url: String,

    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8090")]
    pub listen_addr: String,

    /// URL con la que el coordinator y los otros workers llegan a este worker
    /// (default: http://<hostname>:<puerto>)
    #[arg(long, env = "ADVERTISE_ADDR")]
    pub advertise_addr: Option<String>,

    /// Dónde se guardan las particiones intermedias
    #[arg(long, env = "INT_FILES_LOC", default_value = "/data/intermediate")]
    pub int_files_loc: PathBuf,

    #[arg(long, env = "ARTIFACT_CACHE", default_value = "/data/artifacts")]
    pub artifact_cache: PathBuf,

    /// Directorio de los sockets Unix de cada tarea
    #[arg(long, env = "SOCKET_DIR", default_value = "/tmp/mr")]
    pub socket_dir: PathBuf,

    #[arg(long, env = "WORKER_POOL", default_value = "mr-workers")]
    pub worker_pool: String,

    #[arg(long, env = "CLUSTER_CREDENTIALS_PATH")]
    pub cluster_credentials_path: Option<PathBuf>,

    #[arg(long, env = "HEARTBEAT_INTERVAL_SECS", default_value_t = 5)]
    pub heartbeat_interval_secs: u64,

    /// Intentos de conexión/escritura en el canal con el subproceso
    #[arg(long, env = "CHANNEL_RETRIES", default_value_t = 3)]
    pub channel_retries: u32,

    #[arg(long, env = "CHANNEL_RETRY_DELAY_MS", default_value_t = 500)]
    pub channel_retry_delay_ms: u64,

    #[arg(long, env = "CHANNEL_TIMEOUT_SECS", default_value_t = 30)]
    pub channel_timeout_secs: u64,

    #[arg(long, env = "PROCESS_TIMEOUT_SECS", default_value_t = 300)]
    pub process_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            coordinator_url: "http://localhost:8080".to_string(),
            listen_addr: "0.0.0.0:8090".to_string(),
            advertise_addr: None,
            int_files_loc: PathBuf::from("/data/intermediate"),
            artifact_cache: PathBuf::from("/data/artifacts"),
            socket_dir: PathBuf::from("/tmp/mr"),
            worker_pool: "mr-workers".to_string(),
            cluster_credentials_path: None,
            heartbeat_interval_secs: 5,
            channel_retries: 3,
            channel_retry_delay_ms: 500,
            channel_timeout_secs: 30,
            process_timeout_secs: 300,
        }
    }
}

impl WorkerConfig {
    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            retry: RetryPolicy::new(
                self.channel_retries,
                Duration::from_millis(self.channel_retry_delay_ms),
            ),
            io_timeout: Duration::from_secs(self.channel_timeout_secs),
        }
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// ADVERTISE_ADDR o http://<hostname>:<puerto de LISTEN_ADDR>.
    pub fn advertise_address(&self, hostname: &str) -> String {
        if let Some(addr) = &self.advertise_addr {
            return addr.trim_end_matches('/').to_string();
        }
        let port = self
            .listen_addr
            .rsplit_once(':')
            .map(|(_, p)| p)
            .unwrap_or("8090");
        format!("http://{}:{}", hostname, port)
    }

    pub fn load_cluster_token(&self) -> anyhow::Result<Option<String>> {
        let Some(path) = &self.cluster_credentials_path else {
            return Ok(None);
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("leyendo credenciales de cluster en {}", path.display()))?;
        Ok(Some(raw.trim().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertise_por_defecto_usa_hostname_y_puerto() {
        let config = WorkerConfig {
            listen_addr: "0.0.0.0:9001".to_string(),
            ..WorkerConfig::default()
        };
        assert_eq!(config.advertise_address("nodo-3"), "http://nodo-3:9001");

        let config = WorkerConfig {
            advertise_addr: Some("http://10.0.0.7:8090/".to_string()),
            ..WorkerConfig::default()
        };
        assert_eq!(config.advertise_address("nodo-3"), "http://10.0.0.7:8090");
    }

    #[test]
    fn settings_del_canal_salen_de_la_config() {
        let settings = WorkerConfig::default().channel_settings();
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.retry.delay, Duration::from_millis(500));
        assert_eq!(settings.io_timeout, Duration::from_secs(30));
    }
}
