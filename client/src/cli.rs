use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::{
    ArtifactInfo, Credentials, JobInfo, JobRequest, JobResults, TaskInfo, TaskKind,
    WorkerMetrics,
};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI para hablar con el coordinator map/reduce")]
struct Cli {
    /// En Docker: http://coordinator:8080
    #[arg(long, env = "COORDINATOR_URL", default_value = "http://localhost:8080")]
    coordinator: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sube un ejecutable (mapper o reducer)
    Upload {
        #[arg(value_name = "BINARIO")]
        path: PathBuf,
        /// Nombre del artefacto (default: nombre del archivo)
        #[arg(long)]
        name: Option<String>,
    },
    /// Lista los artefactos subidos
    Artifacts,
    /// Envía un job nuevo
    Submit {
        #[arg(long)]
        input: String,
        #[arg(long)]
        output: String,
        #[arg(long)]
        mapper: String,
        #[arg(long)]
        reducer: String,
        #[arg(long, default_value_t = 1)]
        reducers: u32,
        #[arg(long, default_value = "file/txt")]
        input_type: String,
        /// Tamaño de split en bytes (default: el del coordinator)
        #[arg(long)]
        split_size: Option<u64>,
        #[arg(long)]
        tls: bool,
        #[arg(long, env = "INPUT_STORAGE_USER", default_value = "")]
        input_user: String,
        #[arg(long, env = "INPUT_STORAGE_PASSWORD", default_value = "", hide_env_values = true)]
        input_password: String,
        #[arg(long, env = "OUTPUT_STORAGE_USER", default_value = "")]
        output_user: String,
        #[arg(long, env = "OUTPUT_STORAGE_PASSWORD", default_value = "", hide_env_values = true)]
        output_password: String,
    },
    /// Consulta el estado de un job
    Status {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Lista las tareas de un job
    Tasks {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Lista los archivos de salida de un job
    Results {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    Workers,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = cli.coordinator.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Upload { path, name } => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("leyendo {}", path.display()))?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "programa".to_string());
            let name = name.unwrap_or_else(|| file_name.clone());

            let form = Form::new()
                .text("name", name)
                .part("program", Part::bytes(bytes).file_name(file_name));
            let url = format!("{}/api/v1/artifacts", base_url);
            let resp = client.post(&url).multipart(form).send().await?;
            if !resp.status().is_success() {
                println!("Error subiendo artefacto: {}", error_message(resp).await);
                return Ok(());
            }
            let info: ArtifactInfo = resp.json().await?;
            println!("Artefacto subido:");
            print_artifact(&info);
        }

        Commands::Artifacts => {
            let url = format!("{}/api/v1/artifacts", base_url);
            let artifacts: Vec<ArtifactInfo> = client.get(&url).send().await?.json().await?;
            if artifacts.is_empty() {
                println!("No hay artefactos subidos.");
            }
            for a in &artifacts {
                print_artifact(a);
            }
        }

        Commands::Submit {
            input,
            output,
            mapper,
            reducer,
            reducers,
            input_type,
            split_size,
            tls,
            input_user,
            input_password,
            output_user,
            output_password,
        } => {
            let req = JobRequest {
                n_reducers: reducers,
                input_path: input,
                input_type,
                output_path: output,
                use_tls: tls,
                mapper_name: mapper,
                reducer_name: reducer,
                input_storage_credentials: Credentials {
                    username: input_user,
                    password: input_password,
                },
                output_storage_credentials: Credentials {
                    username: output_user,
                    password: output_password,
                },
                split_size,
            };

            let url = format!("{}/api/v1/jobs", base_url);
            let resp = client.post(&url).json(&req).send().await?;
            if !resp.status().is_success() {
                println!("Job rechazado: {}", error_message(resp).await);
                return Ok(());
            }
            let job: JobInfo = resp.json().await?;
            println!("Job creado:");
            print_job(&job);
        }

        Commands::Status { id } => {
            let url = format!("{}/api/v1/jobs/{}", base_url, id);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let job: JobInfo = resp.json().await?;
                println!("Job:");
                print_job(&job);
            } else {
                println!("Error: job no encontrado (status {})", resp.status());
            }
        }

        Commands::Tasks { id } => {
            let url = format!("{}/api/v1/jobs/{}/tasks", base_url, id);
            let resp = client.get(&url).send().await?;
            if !resp.status().is_success() {
                println!("Error: job no encontrado (status {})", resp.status());
                return Ok(());
            }
            let tasks: Vec<TaskInfo> = resp.json().await?;
            for t in tasks {
                println!(
                    "  {:<48} {:<7} {:<10} worker={} reintentos={}",
                    t.id,
                    describe_kind(&t.kind),
                    format!("{:?}", t.state),
                    t.worker_id.as_deref().unwrap_or("-"),
                    t.retry_count
                );
                if let Some(err) = &t.last_error {
                    println!("      último error: {}", err);
                }
            }
        }

        Commands::Results { id } => {
            let url = format!("{}/api/v1/jobs/{id}/results", base_url);
            let resp = client.get(&url).send().await?;

            if resp.status().is_success() {
                let results: JobResults = resp.json().await?;
                println!("Resultados para job {} ({:?}):", results.job_id, results.phase);
                println!("  salida: {}", results.output_path);
                if results.files.is_empty() {
                    println!("  (sin archivos de salida)");
                } else {
                    println!("  archivos:");
                    for f in results.files {
                        println!("    - {}", f);
                    }
                }
            } else {
                println!("No se encontraron resultados para job {id}");
            }
        }

        Commands::Workers => {
            let url = format!("{}/api/v1/workers", base_url);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let workers: Vec<WorkerMetrics> = resp.json().await?;
                if workers.is_empty() {
                    println!("No hay workers registrados.");
                }
                for w in workers {
                    print_worker(&w);
                }
            } else {
                println!(
                    "Error consultando /api/v1/workers (status {})",
                    resp.status()
                );
            }
        }
    }

    Ok(())
}

async fn error_message(resp: Response) -> String {
    let status = resp.status();
    match resp.json::<serde_json::Value>().await {
        Ok(body) => match body.get("error").and_then(|e| e.as_str()) {
            Some(msg) => format!("{} ({})", msg, status),
            None => format!("status {}", status),
        },
        Err(_) => format!("status {}", status),
    }
}

fn describe_kind(kind: &TaskKind) -> String {
    match kind {
        TaskKind::Map { split } => format!("map#{}", split.index),
        TaskKind::Reduce { partition } => format!("reduce#{}", partition),
    }
}

/// Porcentaje de tareas terminadas (map + reduce).
fn progress(job: &JobInfo) -> Option<f64> {
    let total = job.total_map_tasks + job.total_reduce_tasks;
    if total == 0 {
        return None;
    }
    let done = job.completed_map_tasks + job.completed_reduce_tasks;
    Some(done as f64 / total as f64 * 100.0)
}

fn print_artifact(a: &ArtifactInfo) {
    println!("  {} ({} bytes, rev {}, subido {})", a.name, a.size, a.revision, a.uploaded_at);
}

fn print_job(job: &JobInfo) {
    println!("  id: {}", job.id);
    println!("  estado: {:?}", job.phase);
    println!(
        "  map: {}/{}  reduce: {}/{}  reintentos: {}",
        job.completed_map_tasks,
        job.total_map_tasks,
        job.completed_reduce_tasks,
        job.total_reduce_tasks,
        job.retries
    );
    match progress(job) {
        Some(pct) => println!("  progreso: {:.1}%", pct),
        None => println!("  progreso: (sin tareas)"),
    }
    println!(
        "  mapper: {} (rev {})  reducer: {} (rev {})",
        job.mapper.name, job.mapper.revision, job.reducer.name, job.reducer.revision
    );
    println!("  entrada: {} ({})", job.input_path, job.input_type);
    println!("  salida: {}", job.output_path);
    println!("  submitted_at: {}", job.submitted_at);
    if let Some(started) = &job.started_at {
        println!("  iniciado: {}", started);
    }
    if let Some(done) = &job.finished_at {
        println!("  finalizado: {}", done);
    }
    if let Some(cause) = &job.failure_cause {
        println!("  causa de falla: {}", cause);
    }
}

fn print_worker(w: &WorkerMetrics) {
    println!("Worker {}", w.worker_id);
    println!("  host           : {} ({})", w.hostname, w.address);
    println!("  estado         : {:?}", w.liveness);
    println!(
        "  tarea actual   : {}",
        w.current_task.as_deref().unwrap_or("(ninguna)")
    );
    println!("  último contacto: {} s", w.last_contact_secs_ago);
    println!(
        "  tareas         : started={}, ok={}, failed={}",
        w.tasks_started, w.tasks_succeeded, w.tasks_failed
    );
    match w.avg_task_ms {
        Some(avg) => println!("  avg_task_ms    : {:.1}", avg),
        None => println!("  avg_task_ms    : (sin datos)"),
    }
    match w.cpu_percent {
        Some(cpu) => println!("  cpu_percent    : {:.1}%", cpu),
        None => println!("  cpu_percent    : (sin datos)"),
    }
    match w.mem_bytes {
        Some(mem) => println!("  mem_bytes      : {}", mem),
        None => println!("  mem_bytes      : (sin datos)"),
    }
    println!();
}
