use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use tracing::warn;

enum Command {
    Snapshot(Vec<u8>),
    Flush(SyncSender<()>),
}

/// Espejo JSON de una tabla en disco. `save` serializa la tabla y la pasa a
/// un hilo escritor propio (temporal + rename), así el lock de la tabla no
/// espera al disco. Si llegan varias fotos juntas sólo se escribe la última.
#[derive(Debug, Clone)]
pub struct JsonMirror {
    path: PathBuf,
    writer: Sender<Command>,
}

impl JsonMirror {
    /// El hilo escritor termina cuando se suelta el último clon.
    pub fn new(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let (writer, rx) = mpsc::channel();
        let target = path.clone();
        std::thread::Builder::new()
            .name("espejo-json".to_string())
            .spawn(move || writer_loop(&target, rx))
            .context("lanzando el hilo del espejo JSON")?;
        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Contenido guardado, o None si todavía no existe el archivo.
    pub fn load<T: DeserializeOwned>(&self) -> anyhow::Result<Option<T>> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("leyendo {}", self.path.display()));
            }
        };
        let value = serde_json::from_slice(&raw)
            .with_context(|| format!("parseando {}", self.path.display()))?;
        Ok(Some(value))
    }

    /// Encola una foto de `value`; la escritura es asíncrona.
    pub fn save<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        let raw = serde_json::to_vec_pretty(value)?;
        self.writer
            .send(Command::Snapshot(raw))
            .map_err(|_| anyhow::anyhow!("el escritor de {} terminó", self.path.display()))
    }

    /// Bloquea hasta que todo lo encolado antes esté en disco.
    pub fn flush(&self) -> anyhow::Result<()> {
        let (ack, done) = mpsc::sync_channel(1);
        self.writer
            .send(Command::Flush(ack))
            .map_err(|_| anyhow::anyhow!("el escritor de {} terminó", self.path.display()))?;
        done.recv()
            .with_context(|| format!("esperando la escritura de {}", self.path.display()))
    }
}

fn writer_loop(path: &Path, rx: Receiver<Command>) {
    while let Ok(first) = rx.recv() {
        let mut latest = None;
        let mut waiting = Vec::new();
        for cmd in std::iter::once(first).chain(rx.try_iter()) {
            match cmd {
                Command::Snapshot(raw) => latest = Some(raw),
                Command::Flush(ack) => waiting.push(ack),
            }
        }
        if let Some(raw) = latest {
            if let Err(e) = write_atomic(path, &raw) {
                warn!("no se pudo espejar {}: {:#}", path.display(), e);
            }
        }
        for ack in waiting {
            let _ = ack.send(());
        }
    }
}

fn write_atomic(path: &Path, raw: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creando {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, raw).with_context(|| format!("escribiendo {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("renombrando a {}", path.display()))?;
    Ok(())
}
