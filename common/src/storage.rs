use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::StatusCode;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use crate::job::Credentials;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("ubicación inválida: {0:?}")]
    InvalidLocation(String),
    #[error("error de E/S en {location}: {source}")]
    Io {
        location: String,
        #[source]
        source: std::io::Error,
    },
    #[error("error HTTP en {location}: {source}")]
    Http {
        location: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{location} respondió {status}")]
    Status { location: String, status: u16 },
    #[error("{0} no informó Content-Length")]
    MissingLength(String),
}

/// Dónde vive un objeto de entrada o salida.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectLocation {
    /// file:///ruta o /ruta
    Local(PathBuf),
    /// URL http(s) completa
    Remote(String),
}

impl ObjectLocation {
    /// Una ubicación sin esquema ("minio:9000/bucket/obj") es remota y usa
    /// https o http según `use_tls`.
    pub fn parse(raw: &str, use_tls: bool) -> Result<Self, StorageError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(StorageError::InvalidLocation(raw.to_string()));
        }
        if let Some(path) = raw.strip_prefix("file://") {
            if path.is_empty() {
                return Err(StorageError::InvalidLocation(raw.to_string()));
            }
            return Ok(Self::Local(PathBuf::from(path)));
        }
        if raw.starts_with('/') {
            return Ok(Self::Local(PathBuf::from(raw)));
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Ok(Self::Remote(raw.to_string()));
        }
        if raw.contains("://") {
            return Err(StorageError::InvalidLocation(raw.to_string()));
        }
        let scheme = if use_tls { "https" } else { "http" };
        Ok(Self::Remote(format!("{}://{}", scheme, raw)))
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Local(p) => p.display().to_string(),
            Self::Remote(url) => url.clone(),
        }
    }
}

/// Cliente del object storage: archivos locales o HTTP (HEAD / GET con Range / PUT).
#[derive(Debug, Clone, Default)]
pub struct ObjectStore {
    http: reqwest::Client,
}

impl ObjectStore {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        creds: &Credentials,
    ) -> reqwest::RequestBuilder {
        let req = self.http.request(method, url);
        if creds.is_empty() {
            req
        } else {
            req.basic_auth(&creds.username, Some(&creds.password))
        }
    }

    /// Tamaño en bytes del objeto.
    pub async fn size(&self, loc: &ObjectLocation, creds: &Credentials) -> Result<u64, StorageError> {
        match loc {
            ObjectLocation::Local(path) => {
                let meta = tokio::fs::metadata(path).await.map_err(|e| io_err(path, e))?;
                if !meta.is_file() {
                    return Err(StorageError::InvalidLocation(path.display().to_string()));
                }
                Ok(meta.len())
            }
            ObjectLocation::Remote(url) => {
                let resp = self
                    .request(reqwest::Method::HEAD, url, creds)
                    .send()
                    .await
                    .map_err(|e| http_err(url, e))?;
                check_status(url, resp.status())?;
                // se lee el header directo: en HEAD el body no trae size hint
                resp.headers()
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .ok_or_else(|| StorageError::MissingLength(url.clone()))
            }
        }
    }

    /// Lee [offset, offset + length) del objeto.
    pub async fn read_range(
        &self,
        loc: &ObjectLocation,
        creds: &Credentials,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, StorageError> {
        if length == 0 {
            return Ok(Vec::new());
        }
        match loc {
            ObjectLocation::Local(path) => {
                let mut file = tokio::fs::File::open(path).await.map_err(|e| io_err(path, e))?;
                file.seek(SeekFrom::Start(offset))
                    .await
                    .map_err(|e| io_err(path, e))?;
                let mut buf = Vec::with_capacity(usize::try_from(length).unwrap_or(0));
                file.take(length)
                    .read_to_end(&mut buf)
                    .await
                    .map_err(|e| io_err(path, e))?;
                Ok(buf)
            }
            ObjectLocation::Remote(url) => {
                let range = format!("bytes={}-{}", offset, offset + length - 1);
                let resp = self
                    .request(reqwest::Method::GET, url, creds)
                    .header(RANGE, range)
                    .send()
                    .await
                    .map_err(|e| http_err(url, e))?;
                let status = resp.status();
                check_status(url, status)?;
                let body = resp.bytes().await.map_err(|e| http_err(url, e))?;

                if status == StatusCode::PARTIAL_CONTENT {
                    return Ok(body.to_vec());
                }
                // el servidor ignoró el Range: recortar a mano
                let start = usize::try_from(offset).unwrap_or(usize::MAX).min(body.len());
                let end = usize::try_from(offset + length)
                    .unwrap_or(usize::MAX)
                    .min(body.len());
                Ok(body[start..end].to_vec())
            }
        }
    }

    /// Escribe el objeto completo. En local se escribe a un temporal y se renombra.
    pub async fn write(
        &self,
        loc: &ObjectLocation,
        creds: &Credentials,
        bytes: Vec<u8>,
    ) -> Result<(), StorageError> {
        match loc {
            ObjectLocation::Local(path) => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| io_err(parent, e))?;
                }
                let tmp = path.with_extension("tmp");
                tokio::fs::write(&tmp, &bytes).await.map_err(|e| io_err(&tmp, e))?;
                tokio::fs::rename(&tmp, path).await.map_err(|e| io_err(path, e))?;
                debug!("objeto escrito en {}", path.display());
                Ok(())
            }
            ObjectLocation::Remote(url) => {
                let resp = self
                    .request(reqwest::Method::PUT, url, creds)
                    .body(bytes)
                    .send()
                    .await
                    .map_err(|e| http_err(url, e))?;
                check_status(url, resp.status())?;
                debug!("objeto subido a {}", url);
                Ok(())
            }
        }
    }
}

fn io_err(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        location: path.display().to_string(),
        source,
    }
}

fn http_err(url: &str, source: reqwest::Error) -> StorageError {
    StorageError::Http {
        location: url.to_string(),
        source,
    }
}

fn check_status(url: &str, status: StatusCode) -> Result<(), StorageError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(StorageError::Status {
            location: url.to_string(),
            status: status.as_u16(),
        })
    }
}
