use chrono::{DateTime, Utc};
use common::artifact::is_safe_name;
use common::ArtifactInfo;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("nombre de artefacto inválido: {0:?}")]
    InvalidName(String),
    #[error("el artefacto {name} ya no está en la revisión {pinned} (actual {current})")]
    RevisionGone {
        name: String,
        pinned: i64,
        current: i64,
    },
    #[error("error de E/S en el store de artefactos: {0}")]
    Io(#[from] io::Error),
}

/// Ejecutables subidos, guardados como <root>/<nombre>.
/// La revisión es el mtime del archivo en ms: cambia al re-subir.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, ArtifactError> {
        if !is_safe_name(name) {
            return Err(ArtifactError::InvalidName(name.to_string()));
        }
        Ok(self.root.join(name))
    }

    /// Guarda (o sobrescribe) el artefacto.
    pub async fn save(&self, name: &str, bytes: &[u8]) -> Result<ArtifactInfo, ArtifactError> {
        let path = self.path_for(name)?;
        tokio::fs::create_dir_all(&self.root).await?;
        // los nombres válidos no empiezan con '.', así que el temporal no choca
        let tmp = self.root.join(format!(".{}.upload", name));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        let info = self
            .info(name)
            .await?
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, name.to_string()))?;
        info!("artefacto {} guardado ({} bytes, rev {})", name, info.size, info.revision);
        Ok(info)
    }

    pub async fn info(&self, name: &str) -> Result<Option<ArtifactInfo>, ArtifactError> {
        let path = self.path_for(name)?;
        let meta = match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let uploaded_at: DateTime<Utc> = meta.modified()?.into();
        Ok(Some(ArtifactInfo {
            name: name.to_string(),
            size: meta.len(),
            uploaded_at,
            revision: uploaded_at.timestamp_millis(),
        }))
    }

    pub async fn list(&self) -> Result<Vec<ArtifactInfo>, ArtifactError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !is_safe_name(&name) {
                continue;
            }
            if let Some(info) = self.info(&name).await? {
                out.push(info);
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    pub async fn read(&self, name: &str) -> Result<Option<Vec<u8>>, ArtifactError> {
        let path = self.path_for(name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Contenido del artefacto sólo si sigue en `revision`. Si se re-subió
    /// mientras se leía, también es `RevisionGone`.
    pub async fn read_revision(
        &self,
        name: &str,
        revision: i64,
    ) -> Result<Option<Vec<u8>>, ArtifactError> {
        let gone = |current: i64| ArtifactError::RevisionGone {
            name: name.to_string(),
            pinned: revision,
            current,
        };
        match self.info(name).await? {
            None => return Ok(None),
            Some(info) if info.revision != revision => return Err(gone(info.revision)),
            Some(_) => {}
        }
        let Some(bytes) = self.read(name).await? else {
            return Ok(None);
        };
        match self.info(name).await? {
            Some(info) if info.revision != revision => Err(gone(info.revision)),
            Some(_) => Ok(Some(bytes)),
            None => Ok(None),
        }
    }

    /// true si existía.
    pub async fn delete(&self, name: &str) -> Result<bool, ArtifactError> {
        let path = self.path_for(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!("artefacto {} borrado", name);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
