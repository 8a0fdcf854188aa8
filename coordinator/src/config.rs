use anyhow::Context;
use clap::Parser;
use common::split::DEFAULT_SPLIT_SIZE;
use std::path::PathBuf;
use std::time::Duration;

/// Configuración del coordinator: cada opción es flag y variable de entorno.
#[derive(Debug, Clone, Parser)]
#[command(name = "coordinator", about = "Coordinator del motor map/reduce")]
pub struct CoordinatorConfig {
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Directorio donde se guardan los ejecutables subidos
    #[arg(long, env = "ARTIFACTS_PATH", default_value = "/coordinator/artifacts")]
    pub artifacts_path: PathBuf,

    /// Tamaño de split en bytes
    #[arg(long, env = "SPLIT_SIZE", default_value_t = DEFAULT_SPLIT_SIZE)]
    pub split_size: u64,

    /// Archivo con el token que los workers presentan al registrarse
    #[arg(long, env = "CLUSTER_CREDENTIALS_PATH")]
    pub cluster_credentials_path: Option<PathBuf>,

    #[arg(long, env = "WORKER_POOL", default_value = "mr-workers")]
    pub worker_pool: String,

    /// Si está, jobs y tareas se espejan en <dir>/jobs.json y <dir>/tasks.json
    #[arg(long, env = "STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    #[arg(long, env = "TASK_TIMEOUT_SECS", default_value_t = 120)]
    pub task_timeout_secs: u64,

    /// Reintentos por tarea antes de dar el job por FAILED
    #[arg(long, env = "MAX_TASK_RETRIES", default_value_t = 3)]
    pub max_task_retries: u32,

    #[arg(long, env = "WORKER_DEAD_TIMEOUT_SECS", default_value_t = 20)]
    pub worker_dead_timeout_secs: u64,

    #[arg(long, env = "SCHEDULER_TICK_MS", default_value_t = 500)]
    pub scheduler_tick_ms: u64,

    #[arg(long, env = "FAILOVER_SWEEP_INTERVAL_SECS", default_value_t = 5)]
    pub failover_sweep_interval_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            artifacts_path: PathBuf::from("/coordinator/artifacts"),
            split_size: DEFAULT_SPLIT_SIZE,
            cluster_credentials_path: None,
            worker_pool: "mr-workers".to_string(),
            state_dir: None,
            task_timeout_secs: 120,
            max_task_retries: 3,
            worker_dead_timeout_secs: 20,
            scheduler_tick_ms: 500,
            failover_sweep_interval_secs: 5,
        }
    }
}

impl CoordinatorConfig {
    pub fn task_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.task_timeout_secs).unwrap_or(i64::MAX / 1000))
    }

    pub fn worker_dead_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            i64::try_from(self.worker_dead_timeout_secs).unwrap_or(i64::MAX / 1000),
        )
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms.max(1))
    }

    pub fn failover_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.failover_sweep_interval_secs.max(1))
    }

    /// Lee el token de cluster (si se configuró un archivo).
    pub fn load_cluster_token(&self) -> anyhow::Result<Option<String>> {
        let Some(path) = &self.cluster_credentials_path else {
            return Ok(None);
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("leyendo credenciales de cluster en {}", path.display()))?;
        let token = raw.trim().to_string();
        anyhow::ensure!(!token.is_empty(), "{} está vacío", path.display());
        Ok(Some(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_de_clap_coinciden_con_default() {
        let parsed = CoordinatorConfig::try_parse_from(["coordinator"]).unwrap();
        let def = CoordinatorConfig::default();
        assert_eq!(parsed.split_size, def.split_size);
        assert_eq!(parsed.max_task_retries, def.max_task_retries);
        assert_eq!(parsed.worker_pool, def.worker_pool);
        assert_eq!(parsed.task_timeout_secs, def.task_timeout_secs);
    }

    #[test]
    fn token_de_cluster_se_lee_recortado() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "  secreto\n").unwrap();

        let config = CoordinatorConfig {
            cluster_credentials_path: Some(path),
            ..CoordinatorConfig::default()
        };
        assert_eq!(config.load_cluster_token().unwrap().as_deref(), Some("secreto"));
        assert_eq!(CoordinatorConfig::default().load_cluster_token().unwrap(), None);
    }
}
