use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadatos de un ejecutable subido (mapper o reducer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub name: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
    /// Revisión = uploaded_at en ms
    pub revision: i64,
}

/// Nombres que se pueden usar como segmento de ruta sin escaparse del directorio:
/// letras, dígitos, '-', '_' y '.', sin empezar con '.'.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::is_safe_name;

    #[test]
    fn nombres_seguros() {
        assert!(is_safe_name("wc-mapper"));
        assert!(is_safe_name("j-1234-m-0"));
        assert!(is_safe_name("reducer_v2.bin"));

        assert!(!is_safe_name(""));
        assert!(!is_safe_name("../etc/passwd"));
        assert!(!is_safe_name("a/b"));
        assert!(!is_safe_name(".oculto"));
    }
}
