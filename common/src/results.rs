use serde::{Deserialize, Serialize};

use crate::job::{JobId, JobPhase};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResults {
    pub job_id: JobId,
    pub phase: JobPhase,
    /// Ubicación base de salida del job
    pub output_path: String,
    /// Objetos de salida de las particiones reduce completadas
    pub files: Vec<String>,
}

/// Objeto de salida de una partición reduce:
///   <output>/<job_id>/part-<partition>.json
/// El índice de partición evita colisiones entre reducers.
pub fn output_object(output_path: &str, job_id: &str, partition: u32) -> String {
    format!(
        "{}/{}/part-{}.json",
        output_path.trim_end_matches('/'),
        job_id,
        partition
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_object_etiqueta_por_particion() {
        assert_eq!(
            output_object("/data/output/", "j-1", 3),
            "/data/output/j-1/part-3.json"
        );
        assert_eq!(
            output_object("http://minio:9000/out", "j-1", 0),
            "http://minio:9000/out/j-1/part-0.json"
        );
    }
}
