use anyhow::{bail, Context};
use std::ffi::OsStr;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::debug;

/// errno de Linux cuando el ejecutable todavía está abierto para escritura
const ETXTBSY: i32 = 26;

/// Lanza un programa de usuario. El hijo muere si se suelta el handle.
pub async fn spawn_program<I, S>(
    path: &Path,
    args: I,
    envs: &[(&str, &Path)],
) -> anyhow::Result<Child>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(path);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    for (key, value) in envs {
        cmd.env(key, value);
    }
    // un binario recién bajado a la cache puede dar ETXTBSY si otro hilo
    // hizo fork mientras estaba abierto
    let mut attempt = 0;
    let child = loop {
        match cmd.spawn() {
            Err(e) if e.raw_os_error() == Some(ETXTBSY) && attempt < 5 => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            other => {
                break other.with_context(|| format!("no se pudo lanzar {}", path.display()))?
            }
        }
    };
    debug!("lanzado {} (pid {:?})", path.display(), child.id());
    Ok(child)
}

/// Espera la salida del hijo con timeout; un código distinto de 0 es error.
pub async fn wait_success(child: &mut Child, timeout: Duration, what: &str) -> anyhow::Result<()> {
    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status.with_context(|| format!("esperando a {}", what))?,
        Err(_) => {
            let _ = child.kill().await;
            bail!("{} no terminó en {:?}", what, timeout);
        }
    };
    check_status(status, what)
}

pub fn check_status(status: ExitStatus, what: &str) -> anyhow::Result<()> {
    if status.success() {
        Ok(())
    } else {
        bail!("{} terminó con {}", what, status)
    }
}
