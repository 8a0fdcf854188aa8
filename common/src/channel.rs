//! Canal local agente <-> subproceso sobre sockets Unix.
//!
//! Cada mensaje es un documento JSON completo: el emisor escribe y cierra su
//! mitad de escritura, el receptor lee hasta EOF y recién ahí decodifica.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use crate::retry::{retry, RetryPolicy};
use crate::shuffle::{decode_message, encode_message, ShuffleError};

/// Socket donde el programa escribe su salida (el agente escucha).
pub const OUTPUT_SOCKET_ENV: &str = "MR_OUTPUT_SOCKET";
/// Socket donde el reducer escucha su entrada (el agente se conecta).
pub const INPUT_SOCKET_ENV: &str = "MR_INPUT_SOCKET";

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("no se pudo escuchar en {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no se pudo conectar a {path} después de {attempts} intentos: {source}")]
    Connect {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("timeout de {0:?} esperando el canal")]
    Timeout(Duration),
    #[error("error de E/S en el canal: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Payload(#[from] ShuffleError),
    #[error("variable de entorno {0} no definida")]
    MissingEnv(&'static str),
}

/// Parámetros de reintento y timeout de las operaciones del canal.
#[derive(Debug, Clone, Copy)]
pub struct ChannelSettings {
    pub retry: RetryPolicy,
    pub io_timeout: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            io_timeout: Duration::from_secs(30),
        }
    }
}

/// Lado servidor: escucha en un path y recibe un mensaje por conexión.
/// El archivo del socket se borra al soltar el listener.
pub struct MessageListener {
    path: PathBuf,
    listener: UnixListener,
}

impl MessageListener {
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self, ChannelError> {
        let path = path.into();
        let bind_err = |source| ChannelError::Bind {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(bind_err)?;
        }
        // socket viejo de un intento anterior
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(bind_err(e)),
        }

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        debug!("escuchando en {}", path.display());
        Ok(Self { path, listener })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acepta una conexión, lee hasta EOF y decodifica.
    pub async fn receive<T: DeserializeOwned>(&self, timeout: Duration) -> Result<T, ChannelError> {
        let exchange = async {
            let (mut stream, _) = self.listener.accept().await?;
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await?;
            Ok::<_, ChannelError>(buf)
        };
        let buf = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| ChannelError::Timeout(timeout))??;
        Ok(decode_message(&buf)?)
    }
}

impl Drop for MessageListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Lado cliente: conecta (con reintentos), escribe el mensaje y cierra.
pub async fn send_message<T: Serialize>(
    path: &Path,
    msg: &T,
    settings: &ChannelSettings,
) -> Result<(), ChannelError> {
    let payload = encode_message(msg)?;
    let what = format!("enviar mensaje a {}", path.display());

    let io_timeout = settings.io_timeout;
    let mut stream = retry(settings.retry, &what, |_| async move {
        tokio::time::timeout(io_timeout, UnixStream::connect(path))
            .await
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")))
    })
    .await
    .map_err(|source| ChannelError::Connect {
        path: path.to_path_buf(),
        attempts: settings.retry.max_attempts.max(1),
        source,
    })?;

    let write = async {
        stream.write_all(&payload).await?;
        stream.shutdown().await?;
        Ok::<_, io::Error>(())
    };
    tokio::time::timeout(settings.io_timeout, write)
        .await
        .map_err(|_| ChannelError::Timeout(settings.io_timeout))??;
    Ok(())
}

/// Path de un socket tomado de una variable de entorno.
pub fn socket_from_env(var: &'static str) -> Result<PathBuf, ChannelError> {
    std::env::var_os(var)
        .map(PathBuf::from)
        .ok_or(ChannelError::MissingEnv(var))
}
