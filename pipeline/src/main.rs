//! Pipeline CLI: create projects, run and observe jobs, resume after
//! restarts.
//!
//! All state lives under a data directory (`config.toml` plus the project
//! and job stores), so a run can be driven, killed, and resumed across
//! invocations.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value, json};

use pipeline::core::gate::GateValidator;
use pipeline::exit_codes;
use pipeline::io::config::{PipelineConfig, load_config, write_config};
use pipeline::io::store::JsonStore;
use pipeline::jobs::{JobLimits, JobManager, JobStatus};
use pipeline::logging;
use pipeline::orchestrator::Orchestrator;
use pipeline::registry::Registry;

#[derive(Parser)]
#[command(
    name = "pipeline",
    version,
    about = "Layered agent pipeline runner for book manuscripts"
)]
struct Cli {
    /// Directory holding config.toml and the project/job stores.
    #[arg(long, default_value = ".", global = true)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config.toml if missing.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Create a new project and persist its initial snapshot.
    Create {
        #[arg(long)]
        title: String,
        /// JSON file of user constraints.
        #[arg(long)]
        constraints: Option<PathBuf>,
    },
    /// Run a project's pipeline job to completion in the foreground.
    Run {
        #[arg(long)]
        project_id: String,
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Print a project's layer and agent status summary.
    Status {
        #[arg(long)]
        project_id: String,
    },
    /// List persisted jobs, newest first.
    Jobs {
        #[arg(long)]
        project_id: Option<String>,
    },
    /// Resume an interrupted, failed, blocked, or cancelled job.
    Resume {
        #[arg(long)]
        job_id: String,
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Request cooperative cancellation of a job.
    Cancel {
        #[arg(long)]
        job_id: String,
    },
}

struct Env {
    orchestrator: Arc<Orchestrator>,
    manager: Arc<JobManager>,
    project_store: Arc<JsonStore>,
}

#[tokio::main]
async fn main() {
    logging::init();
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::ERROR);
        }
    }
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.data_dir, force),
        Command::Create { title, constraints } => {
            cmd_create(&cli.data_dir, &title, constraints.as_deref()).await
        }
        Command::Run {
            project_id,
            max_iterations,
        } => cmd_run(&cli.data_dir, &project_id, max_iterations).await,
        Command::Status { project_id } => cmd_status(&cli.data_dir, &project_id).await,
        Command::Jobs { project_id } => cmd_jobs(&cli.data_dir, project_id.as_deref()).await,
        Command::Resume {
            job_id,
            max_iterations,
        } => cmd_resume(&cli.data_dir, &job_id, max_iterations).await,
        Command::Cancel { job_id } => cmd_cancel(&cli.data_dir, &job_id).await,
    }
}

fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.toml")
}

fn build_env(data_dir: &Path) -> Result<Env> {
    let config = load_config(&config_path(data_dir))?;
    let project_store = Arc::new(JsonStore::new(data_dir.join(&config.projects_dir)));
    let job_store = Arc::new(JsonStore::new(data_dir.join(&config.jobs_dir)));
    let registry = Arc::new(Registry::book_pipeline()?);
    let orchestrator = Arc::new(Orchestrator::new(
        registry,
        GateValidator::new()?,
        config.agent_timeout(),
    ));
    let manager = Arc::new(JobManager::new(
        job_store,
        Arc::clone(&project_store),
        JobLimits::from_config(&config),
    ));
    Ok(Env {
        orchestrator,
        manager,
        project_store,
    })
}

/// Load a persisted project snapshot into the orchestrator's table.
async fn restore_project(env: &Env, project_id: &str) -> Result<()> {
    let snapshot = env
        .project_store
        .load_raw(project_id)?
        .ok_or_else(|| anyhow!("no persisted project '{project_id}'"))?;
    env.orchestrator.import_project(snapshot).await?;
    Ok(())
}

fn cmd_init(data_dir: &Path, force: bool) -> Result<i32> {
    let path = config_path(data_dir);
    if path.exists() && !force {
        println!("config already present at {}", path.display());
        return Ok(exit_codes::OK);
    }
    write_config(&path, &PipelineConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

async fn cmd_create(data_dir: &Path, title: &str, constraints: Option<&Path>) -> Result<i32> {
    let env = build_env(data_dir)?;
    let constraints = match constraints {
        Some(path) => {
            let contents =
                fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
            let value: Value = serde_json::from_str(&contents)
                .with_context(|| format!("parse {}", path.display()))?;
            value
                .as_object()
                .cloned()
                .ok_or_else(|| anyhow!("constraints must be a JSON object"))?
        }
        None => Map::new(),
    };
    let project = env.orchestrator.create_project(title, constraints).await;
    let snapshot = env.orchestrator.export_project(&project)?;
    env.project_store.save_raw(&project.project_id, &snapshot)?;
    println!("{}", project.project_id);
    Ok(exit_codes::OK)
}

async fn cmd_run(data_dir: &Path, project_id: &str, max_iterations: Option<u32>) -> Result<i32> {
    let env = build_env(data_dir)?;
    env.manager.load_persisted_jobs().await?;
    restore_project(&env, project_id).await?;

    let job = env
        .manager
        .create_run_pipeline_job(Arc::clone(&env.orchestrator), project_id, max_iterations)
        .await?;
    println!("job {}", job.job_id);
    env.manager.wait(&job.job_id).await?;

    let finished = env
        .manager
        .get(&job.job_id)
        .await?
        .ok_or_else(|| anyhow!("job record vanished"))?;
    for event in &finished.events {
        println!("[{}] {}", event.kind, event.message);
    }
    println!("job finished: {}", job_status_text(finished.status));
    if let Some(error) = &finished.error {
        eprintln!("{error}");
    }
    Ok(match finished.status {
        JobStatus::Succeeded => exit_codes::OK,
        JobStatus::Blocked => exit_codes::BLOCKED,
        JobStatus::Cancelled => exit_codes::CANCELLED,
        _ => exit_codes::ERROR,
    })
}

async fn cmd_status(data_dir: &Path, project_id: &str) -> Result<i32> {
    let env = build_env(data_dir)?;
    restore_project(&env, project_id).await?;
    let project = env
        .orchestrator
        .get_project(project_id)
        .await
        .ok_or_else(|| anyhow!("project '{project_id}' missing after import"))?;

    let layers: Map<String, Value> = project
        .layers
        .values()
        .map(|layer| {
            let agents: Map<String, Value> = layer
                .agents
                .values()
                .map(|agent| {
                    (
                        agent.agent_id.clone(),
                        json!({
                            "status": agent.status,
                            "attempts": agent.attempts,
                            "has_output": agent.current_output.is_some(),
                        }),
                    )
                })
                .collect();
            (
                layer.layer_id.to_string(),
                json!({"status": layer.status, "agents": agents}),
            )
        })
        .collect();
    let summary = json!({
        "project_id": project.project_id,
        "title": project.title,
        "status": project.status,
        "current_layer": project.current_layer,
        "current_agent": project.current_agent,
        "available_agents": env.orchestrator.get_available_agents(&project),
        "layers": layers,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(exit_codes::OK)
}

async fn cmd_jobs(data_dir: &Path, project_id: Option<&str>) -> Result<i32> {
    let env = build_env(data_dir)?;
    env.manager.load_persisted_jobs().await?;
    for job in env.manager.list(project_id).await {
        println!(
            "{}  {}  project={}  updated={}",
            job.job_id,
            job_status_text(job.status),
            job.project_id,
            job.updated_at.to_rfc3339(),
        );
    }
    Ok(exit_codes::OK)
}

async fn cmd_resume(data_dir: &Path, job_id: &str, max_iterations: Option<u32>) -> Result<i32> {
    let env = build_env(data_dir)?;
    env.manager.load_persisted_jobs().await?;
    let prior = env
        .manager
        .get(job_id)
        .await?
        .ok_or_else(|| anyhow!("unknown job '{job_id}'"))?;
    restore_project(&env, &prior.project_id).await?;

    let job = env
        .manager
        .resume_job(Arc::clone(&env.orchestrator), job_id, max_iterations)
        .await?;
    println!("job {} (resumed from {job_id})", job.job_id);
    env.manager.wait(&job.job_id).await?;

    let finished = env
        .manager
        .get(&job.job_id)
        .await?
        .ok_or_else(|| anyhow!("job record vanished"))?;
    println!("job finished: {}", job_status_text(finished.status));
    Ok(match finished.status {
        JobStatus::Succeeded => exit_codes::OK,
        JobStatus::Blocked => exit_codes::BLOCKED,
        JobStatus::Cancelled => exit_codes::CANCELLED,
        _ => exit_codes::ERROR,
    })
}

async fn cmd_cancel(data_dir: &Path, job_id: &str) -> Result<i32> {
    let env = build_env(data_dir)?;
    env.manager.load_persisted_jobs().await?;
    let job = env.manager.cancel(job_id).await?;
    println!(
        "cancellation requested for {} (status: {})",
        job.job_id,
        job_status_text(job.status)
    );
    Ok(exit_codes::OK)
}

fn job_status_text(status: JobStatus) -> String {
    match serde_json::to_value(status) {
        Ok(Value::String(text)) => text,
        _ => "unknown".to_string(),
    }
}
