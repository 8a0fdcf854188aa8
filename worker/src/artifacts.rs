use anyhow::Context;
use common::ProgramRef;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::coordinator_client::CoordinatorApi;

/// Cache local de ejecutables: `<cache>/<nombre>-<revisión>`.
/// Una revisión nueva del artefacto nunca reutiliza el binario anterior.
pub struct ArtifactCache {
    root: PathBuf,
    coordinator: Arc<dyn CoordinatorApi>,
    // serializa las descargas para no bajar dos veces el mismo binario
    fetching: Mutex<()>,
}

impl ArtifactCache {
    pub fn new(root: impl Into<PathBuf>, coordinator: Arc<dyn CoordinatorApi>) -> Self {
        Self {
            root: root.into(),
            coordinator,
            fetching: Mutex::new(()),
        }
    }

    pub fn path_for(&self, program: &ProgramRef) -> PathBuf {
        self.root
            .join(format!("{}-{}", program.name, program.revision))
    }

    /// Path ejecutable del programa, descargándolo si no está en cache.
    pub async fn resolve(&self, program: &ProgramRef) -> anyhow::Result<PathBuf> {
        let path = self.path_for(program);
        if is_file(&path).await {
            return Ok(path);
        }

        let _guard = self.fetching.lock().await;
        if is_file(&path).await {
            return Ok(path);
        }

        let bytes = self
            .coordinator
            .fetch_artifact(program)
            .await
            .with_context(|| {
                format!("obteniendo el programa {} (rev {})", program.name, program.revision)
            })?;

        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creando {}", self.root.display()))?;
        let tmp = self.root.join(format!(".{}-{}.part", program.name, program.revision));
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("escribiendo {}", tmp.display()))?;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o755)).await?;
        tokio::fs::rename(&tmp, &path).await?;

        info!(
            "programa {} (rev {}) en cache: {} bytes",
            program.name,
            program.revision,
            bytes.len()
        );
        Ok(path)
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCoordinator;

    #[tokio::test]
    async fn descarga_una_vez_por_revision() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Arc::new(FakeCoordinator::with_artifact("prog", b"#!/bin/sh\n"));
        let cache = ArtifactCache::new(dir.path(), coordinator.clone());

        let rev1 = ProgramRef {
            name: "prog".to_string(),
            revision: 1,
        };
        let path = cache.resolve(&rev1).await.unwrap();
        assert_eq!(path, dir.path().join("prog-1"));
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);

        cache.resolve(&rev1).await.unwrap();
        assert_eq!(coordinator.artifact_fetches(), 1);

        let rev2 = ProgramRef {
            name: "prog".to_string(),
            revision: 2,
        };
        cache.resolve(&rev2).await.unwrap();
        assert_eq!(coordinator.artifact_fetches(), 2);
    }

    #[tokio::test]
    async fn revision_re_subida_no_se_cachea() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Arc::new(FakeCoordinator::with_revision("wc", 2, b"REV2"));
        let cache = ArtifactCache::new(dir.path(), coordinator);

        let pinned = ProgramRef {
            name: "wc".to_string(),
            revision: 1,
        };
        let err = cache.resolve(&pinned).await.unwrap_err();
        assert!(format!("{:#}", err).contains("rev 1"));
        assert!(!dir.path().join("wc-1").exists());

        let current = ProgramRef {
            name: "wc".to_string(),
            revision: 2,
        };
        let path = cache.resolve(&current).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"REV2");
    }

    #[tokio::test]
    async fn artefacto_inexistente_es_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path(), Arc::new(FakeCoordinator::default()));
        let missing = ProgramRef {
            name: "nada".to_string(),
            revision: 1,
        };
        assert!(cache.resolve(&missing).await.is_err());
    }
}
