use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Reintento acotado con espera fija entre intentos.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Intentos totales (el primero incluido); 0 se trata como 1
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Un solo intento, sin esperas.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}

/// Ejecuta `op` hasta que devuelva Ok o se agoten los intentos.
/// Se reintenta mientras attempt < max_attempts; el error devuelto es el del
/// último intento. `op` recibe el número de intento (desde 1).
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max = policy.attempts();
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max => {
                warn!(
                    "{} falló (intento {}/{}): {}; reintentando en {:?}",
                    what, attempt, max, e, policy.delay
                );
                if !policy.delay.is_zero() {
                    tokio::time::sleep(policy.delay).await;
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn primer_fallo_se_reintenta() {
        let calls = AtomicU32::new(0);
        let res: Result<u32, String> = retry(
            RetryPolicy::new(2, Duration::ZERO),
            "prueba",
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 1 {
                        Err("falla".to_string())
                    } else {
                        Ok(attempt)
                    }
                }
            },
        )
        .await;

        assert_eq!(res, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn se_agotan_los_intentos_y_devuelve_ultimo_error() {
        let calls = AtomicU32::new(0);
        let res: Result<(), String> = retry(
            RetryPolicy::new(3, Duration::from_millis(1)),
            "prueba",
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(format!("error {}", attempt)) }
            },
        )
        .await;

        assert_eq!(res, Err("error 3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cero_intentos_equivale_a_uno() {
        let calls = AtomicU32::new(0);
        let _: Result<(), &str> = retry(RetryPolicy::new(0, Duration::ZERO), "prueba", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("no") }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
