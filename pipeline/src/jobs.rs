//! Background job manager: cancellable, observable, crash-recoverable
//! pipeline runs.
//!
//! A single run may take far longer than any interactive request, and the
//! process may restart mid-run, so every state change is persisted through
//! the job store. This is an in-process manager, not a distributed queue:
//! jobs live on the instance that started them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::state::{AgentOutput, Project, ProjectStatus};
use crate::io::config::PipelineConfig;
use crate::io::store::JsonStore;
use crate::orchestrator::{Orchestrator, StepTimedOut};

/// Persisted event log entries are capped to the most recent of these.
const EVENT_LOG_CAP: usize = 200;
/// Listings return at most this many records.
const JOB_LIST_CAP: usize = 200;
/// How long a job waits for a concurrency slot before giving up.
const SLOT_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Interrupted,
    Blocked,
}

impl JobStatus {
    /// Queued or running: the job owns its project and no second job may
    /// start for it.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    /// Statuses a new job may be resumed from.
    pub fn is_resumable(self) -> bool {
        matches!(
            self,
            Self::Interrupted | Self::Failed | Self::Blocked | Self::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub ts: DateTime<Utc>,
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// One pipeline run. Identity is immutable; status, progress, and events
/// change and are persisted after every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub project_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(default)]
    pub progress: Map<String, Value>,
    #[serde(default)]
    pub events: Vec<JobEvent>,
    #[serde(default)]
    pub cancel_requested: bool,
    pub resumed_from_job_id: Option<String>,
}

impl JobRecord {
    fn new(project_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            error: None,
            progress: Map::new(),
            events: Vec::new(),
            cancel_requested: false,
            resumed_from_job_id: None,
        }
    }

    fn push_event(
        &mut self,
        kind: impl Into<String>,
        message: impl Into<String>,
        agent_id: Option<String>,
    ) {
        self.events.push(JobEvent {
            ts: Utc::now(),
            kind: kind.into(),
            message: message.into(),
            agent_id,
        });
        if self.events.len() > EVENT_LOG_CAP {
            let excess = self.events.len() - EVENT_LOG_CAP;
            self.events.drain(..excess);
        }
    }
}

/// Tunables for the job manager, usually derived from [`PipelineConfig`].
#[derive(Debug, Clone)]
pub struct JobLimits {
    pub max_concurrent_jobs: usize,
    pub heartbeat_interval: Duration,
    pub max_iterations: u32,
}

impl Default for JobLimits {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 1,
            heartbeat_interval: Duration::from_secs(15),
            max_iterations: 200,
        }
    }
}

impl JobLimits {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_concurrent_jobs: config.max_concurrent_jobs.max(1),
            heartbeat_interval: config.heartbeat_interval(),
            max_iterations: config.max_iterations,
        }
    }
}

/// In-process manager of pipeline jobs.
pub struct JobManager {
    jobs: Mutex<HashMap<String, JobRecord>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    semaphore: Arc<Semaphore>,
    job_store: Arc<JsonStore>,
    project_store: Arc<JsonStore>,
    limits: JobLimits,
}

impl JobManager {
    pub fn new(job_store: Arc<JsonStore>, project_store: Arc<JsonStore>, limits: JobLimits) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(limits.max_concurrent_jobs.max(1))),
            job_store,
            project_store,
            limits,
        }
    }

    /// Load persisted job records on process start. A record still marked
    /// `running` cannot truthfully be running (its task died with the old
    /// process), so it is reclassified `interrupted`.
    pub async fn load_persisted_jobs(&self) -> Result<()> {
        let ids = self.job_store.list_ids()?;
        let mut jobs = self.jobs.lock().await;
        for id in ids {
            let Some(raw) = self.job_store.load_raw(&id)? else {
                continue;
            };
            let mut job: JobRecord = match serde_json::from_value(raw) {
                Ok(job) => job,
                Err(err) => {
                    warn!(id = %id, "skipping unreadable job record: {err}");
                    continue;
                }
            };
            if job.status == JobStatus::Running {
                job.status = JobStatus::Interrupted;
                job.error =
                    Some("job was interrupted by a process restart; resume to continue".to_string());
                job.finished_at = Some(Utc::now());
                job.updated_at = Utc::now();
                job.push_event("error", "job interrupted by process restart", None);
                self.persist_job(&job)?;
            }
            jobs.insert(job.job_id.clone(), job);
        }
        Ok(())
    }

    /// Start a background job stepping a project through its available
    /// agents. At most one active job per project is allowed; concurrent jobs
    /// would mutate the same project state.
    pub async fn create_run_pipeline_job(
        self: &Arc<Self>,
        orchestrator: Arc<Orchestrator>,
        project_id: &str,
        max_iterations: Option<u32>,
    ) -> Result<JobRecord> {
        if let Some(active) = self.find_active_job_for_project(project_id).await {
            bail!("project already has an active job: {}", active.job_id);
        }
        if orchestrator.get_project(project_id).await.is_none() {
            bail!("unknown project '{project_id}'");
        }
        let mut job = JobRecord::new(project_id);
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        job.push_event("start", "job started", None);
        self.persist_job(&job)?;
        self.jobs.lock().await.insert(job.job_id.clone(), job.clone());
        info!(job_id = %job.job_id, project_id, "pipeline job started");
        self.spawn(
            orchestrator,
            job.job_id.clone(),
            project_id.to_string(),
            max_iterations.unwrap_or(self.limits.max_iterations),
        )
        .await;
        Ok(job)
    }

    /// Start a new job continuing an interrupted/failed/blocked/cancelled
    /// one. The project state is already persisted; completed agents are not
    /// replayed.
    pub async fn resume_job(
        self: &Arc<Self>,
        orchestrator: Arc<Orchestrator>,
        job_id: &str,
        max_iterations: Option<u32>,
    ) -> Result<JobRecord> {
        let prior = self
            .get(job_id)
            .await?
            .ok_or_else(|| anyhow!("unknown job '{job_id}'"))?;
        if !prior.status.is_resumable() {
            bail!(
                "job {job_id} is not resumable (status: {})",
                status_label(&prior.status)
            );
        }
        let project_id = prior.project_id.clone();
        if orchestrator.get_project(&project_id).await.is_none() {
            bail!("project '{project_id}' not found in orchestrator");
        }
        if let Some(active) = self.find_active_job_for_project(&project_id).await {
            bail!("project already has an active job: {}", active.job_id);
        }
        let mut job = JobRecord::new(&project_id);
        job.resumed_from_job_id = Some(prior.job_id.clone());
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        job.push_event(
            "start",
            format!("job started (resumed from {})", prior.job_id),
            None,
        );
        self.persist_job(&job)?;
        self.jobs.lock().await.insert(job.job_id.clone(), job.clone());
        info!(job_id = %job.job_id, resumed_from = %prior.job_id, "pipeline job resumed");
        self.spawn(
            orchestrator,
            job.job_id.clone(),
            project_id,
            max_iterations.unwrap_or(self.limits.max_iterations),
        )
        .await;
        Ok(job)
    }

    /// Request cooperative cancellation. The flag is persisted so a job
    /// executing in another process of the same deployment honors it too; the
    /// loop stops before starting its next agent.
    pub async fn cancel(&self, job_id: &str) -> Result<JobRecord> {
        let known = self.jobs.lock().await.contains_key(job_id);
        if !known {
            let raw = self
                .job_store
                .load_raw(job_id)?
                .ok_or_else(|| anyhow!("unknown job '{job_id}'"))?;
            let job: JobRecord =
                serde_json::from_value(raw).context("parse persisted job record")?;
            self.jobs.lock().await.insert(job.job_id.clone(), job);
        }
        self.with_job(job_id, |job| {
            job.cancel_requested = true;
            job.push_event("cancel", "cancellation requested", None);
        })
        .await
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<JobRecord>> {
        if let Some(job) = self.jobs.lock().await.get(job_id) {
            return Ok(Some(job.clone()));
        }
        let Some(raw) = self.job_store.load_raw(job_id)? else {
            return Ok(None);
        };
        let job: JobRecord = serde_json::from_value(raw).context("parse persisted job record")?;
        self.jobs.lock().await.insert(job.job_id.clone(), job.clone());
        Ok(Some(job))
    }

    /// Known jobs, newest first, optionally filtered by project.
    pub async fn list(&self, project_id: Option<&str>) -> Vec<JobRecord> {
        let jobs = self.jobs.lock().await;
        let mut listed: Vec<JobRecord> = jobs
            .values()
            .filter(|job| project_id.is_none_or(|id| job.project_id == id))
            .cloned()
            .collect();
        listed.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        listed.truncate(JOB_LIST_CAP);
        listed
    }

    pub async fn find_active_job_for_project(&self, project_id: &str) -> Option<JobRecord> {
        self.jobs
            .lock()
            .await
            .values()
            .find(|job| job.project_id == project_id && job.status.is_active())
            .cloned()
    }

    /// Block until a job's task finishes. Intended for the CLI and tests; the
    /// job records its own terminal state regardless.
    pub async fn wait(&self, job_id: &str) -> Result<()> {
        let handle = self.tasks.lock().await.remove(job_id);
        if let Some(handle) = handle {
            handle.await.context("join job task")?;
        }
        Ok(())
    }

    async fn spawn(
        self: &Arc<Self>,
        orchestrator: Arc<Orchestrator>,
        job_id: String,
        project_id: String,
        max_iterations: u32,
    ) {
        let manager = Arc::clone(self);
        let task_id = job_id.clone();
        let handle = tokio::spawn(async move {
            let result = manager
                .run_pipeline(&orchestrator, &job_id, &project_id, max_iterations)
                .await;
            if let Err(err) = result {
                // The loop itself failed (e.g. a store write). The record
                // must still reflect it; a silently dead task is the one
                // unacceptable outcome.
                error!(job_id = %job_id, "job loop errored: {err:#}");
                let _ = manager
                    .with_job(&job_id, |job| {
                        if job.status.is_active() {
                            job.status = JobStatus::Failed;
                            job.finished_at = Some(Utc::now());
                        }
                        job.error = Some(format!("{err:#}"));
                        job.push_event("exception", format!("job failed: {err:#}"), None);
                    })
                    .await;
            }
        });
        self.tasks.lock().await.insert(task_id, handle);
    }

    async fn run_pipeline(
        &self,
        orchestrator: &Arc<Orchestrator>,
        job_id: &str,
        project_id: &str,
        max_iterations: u32,
    ) -> Result<()> {
        let permit = match tokio::time::timeout(
            SLOT_WAIT,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            _ => {
                self.finish(
                    job_id,
                    JobStatus::Failed,
                    Some("could not acquire a job slot; raise max_concurrent_jobs or retry".to_string()),
                    "error",
                )
                .await?;
                return Ok(());
            }
        };
        let _permit = permit;

        let mut iterations: u32 = 0;
        loop {
            if self.cancel_pending(job_id).await? {
                self.finish(
                    job_id,
                    JobStatus::Cancelled,
                    Some("cancellation requested; stopping".to_string()),
                    "cancel",
                )
                .await?;
                return Ok(());
            }

            // Re-read the project each iteration; something outside the job
            // (a reset, an import) may have changed it.
            let Some(mut project) = orchestrator.get_project(project_id).await else {
                self.finish(
                    job_id,
                    JobStatus::Failed,
                    Some(format!("project '{project_id}' not found in orchestrator")),
                    "error",
                )
                .await?;
                return Ok(());
            };

            let available = orchestrator.get_available_agents(&project);
            let Some(agent_id) = available.first().cloned() else {
                self.classify_finished(orchestrator, job_id, &mut project, iterations)
                    .await?;
                return Ok(());
            };

            if iterations >= max_iterations {
                self.finish(
                    job_id,
                    JobStatus::Failed,
                    Some(format!("max iterations reached ({max_iterations})")),
                    "error",
                )
                .await?;
                return Ok(());
            }

            self.with_job(job_id, |job| {
                job.push_event(
                    "step",
                    format!("executing agent {agent_id}"),
                    Some(agent_id.clone()),
                );
            })
            .await?;

            let step_result = self
                .step_with_heartbeat(orchestrator, job_id, &mut project, &agent_id)
                .await;
            iterations += 1;

            orchestrator.commit_project(&project).await;
            self.persist_project(orchestrator, &project)?;

            let available_count = orchestrator.get_available_agents(&project).len();
            let progress = progress_snapshot(
                &project,
                iterations,
                &agent_id,
                step_result.as_ref().ok(),
                available_count,
            );

            match step_result {
                Ok(_) => {
                    self.with_job(job_id, |job| job.progress = progress).await?;
                }
                Err(err) if err.downcast_ref::<StepTimedOut>().is_some() => {
                    // One timed-out unit of work; the agent is already marked
                    // failed, the loop keeps going.
                    self.with_job(job_id, |job| {
                        job.progress = progress;
                        job.push_event(
                            "error",
                            format!("agent {agent_id} timed out; recorded as failed"),
                            Some(agent_id.clone()),
                        );
                    })
                    .await?;
                }
                Err(err) => {
                    self.with_job(job_id, |job| job.progress = progress).await?;
                    self.finish(job_id, JobStatus::Failed, Some(format!("{err:#}")), "exception")
                        .await?;
                    return Ok(());
                }
            }
        }
    }

    /// Drive one agent execution while emitting heartbeat events on the
    /// configured interval, so an observer can tell a long generation call
    /// from a stalled job.
    async fn step_with_heartbeat(
        &self,
        orchestrator: &Arc<Orchestrator>,
        job_id: &str,
        project: &mut Project,
        agent_id: &str,
    ) -> Result<AgentOutput> {
        let step = orchestrator.execute_agent(project, agent_id, None);
        tokio::pin!(step);
        let mut beat = tokio::time::interval(self.limits.heartbeat_interval);
        beat.tick().await;
        let started = Instant::now();
        loop {
            tokio::select! {
                result = &mut step => return result,
                _ = beat.tick() => {
                    let elapsed = started.elapsed().as_secs();
                    let _ = self
                        .with_job(job_id, |job| {
                            job.push_event(
                                "heartbeat",
                                format!("agent {agent_id} still running ({elapsed}s elapsed)"),
                                Some(agent_id.to_string()),
                            );
                        })
                        .await;
                }
            }
        }
    }

    /// No agents remain: the project either completed (all layers terminal)
    /// or is blocked, and the job record mirrors that.
    async fn classify_finished(
        &self,
        orchestrator: &Arc<Orchestrator>,
        job_id: &str,
        project: &mut Project,
        iterations: u32,
    ) -> Result<()> {
        let completed = project.all_layers_completed();
        project.status = if completed {
            ProjectStatus::Completed
        } else {
            ProjectStatus::Blocked
        };
        project.touch();
        orchestrator.commit_project(project).await;
        self.persist_project(orchestrator, project)?;

        let progress = progress_snapshot(project, iterations, "", None, 0);
        if completed {
            let failed = project.failed_agent_ids();
            let message = if failed.is_empty() {
                "project completed".to_string()
            } else {
                format!(
                    "project completed with {} terminally failed agents ({})",
                    failed.len(),
                    failed.join(", ")
                )
            };
            self.with_job(job_id, |job| {
                job.progress = progress;
                job.status = JobStatus::Succeeded;
                job.finished_at = Some(Utc::now());
                job.push_event("complete", message, None);
            })
            .await?;
        } else {
            let diagnostics = orchestrator.blocked_diagnostics(project);
            let blocked_count = diagnostics.blocked.len();
            let diagnostics = serde_json::to_value(&diagnostics).unwrap_or(Value::Null);
            self.with_job(job_id, |job| {
                job.progress = progress;
                job.progress
                    .insert("blocked_diagnostics".to_string(), diagnostics);
                job.status = JobStatus::Blocked;
                job.error = Some(format!(
                    "project blocked: no available agents, {blocked_count} stuck on unmet dependencies"
                ));
                job.finished_at = Some(Utc::now());
                job.push_event("blocked", "project blocked: no available agents", None);
            })
            .await?;
        }
        Ok(())
    }

    async fn cancel_pending(&self, job_id: &str) -> Result<bool> {
        let from_store = self
            .job_store
            .load_raw(job_id)?
            .and_then(|raw| raw.get("cancel_requested").and_then(Value::as_bool))
            .unwrap_or(false);
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(job_id) else {
            return Ok(from_store);
        };
        if from_store {
            job.cancel_requested = true;
        }
        Ok(job.cancel_requested)
    }

    async fn finish(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<String>,
        kind: &str,
    ) -> Result<()> {
        self.with_job(job_id, |job| {
            job.status = status;
            job.finished_at = Some(Utc::now());
            let message = error
                .clone()
                .unwrap_or_else(|| status_label(&status));
            job.error = error;
            job.push_event(kind, message, None);
        })
        .await?;
        Ok(())
    }

    /// Mutate a job under the table lock, then persist the new snapshot.
    async fn with_job<F>(&self, job_id: &str, mutate: F) -> Result<JobRecord>
    where
        F: FnOnce(&mut JobRecord),
    {
        let snapshot = {
            let mut jobs = self.jobs.lock().await;
            let job = jobs
                .get_mut(job_id)
                .ok_or_else(|| anyhow!("unknown job '{job_id}'"))?;
            mutate(job);
            job.updated_at = Utc::now();
            job.clone()
        };
        self.persist_job(&snapshot)?;
        Ok(snapshot)
    }

    fn persist_job(&self, job: &JobRecord) -> Result<()> {
        let value = serde_json::to_value(job).context("serialize job record")?;
        self.job_store.save_raw(&job.job_id, &value)
    }

    fn persist_project(&self, orchestrator: &Arc<Orchestrator>, project: &Project) -> Result<()> {
        let snapshot = orchestrator.export_project(project)?;
        self.project_store.save_raw(&project.project_id, &snapshot)
    }
}

fn progress_snapshot(
    project: &Project,
    iterations: u32,
    last_agent: &str,
    output: Option<&AgentOutput>,
    available_count: usize,
) -> Map<String, Value> {
    let mut progress = Map::new();
    progress.insert("iterations".to_string(), json!(iterations));
    if !last_agent.is_empty() {
        progress.insert("last_agent".to_string(), json!(last_agent));
    }
    if let Some(gate) = output.and_then(|output| output.gate_result.as_ref()) {
        progress.insert("last_gate_passed".to_string(), json!(gate.passed));
        progress.insert("last_gate_message".to_string(), json!(gate.message));
    }
    progress.insert("project_status".to_string(), json!(project.status));
    progress.insert("current_layer".to_string(), json!(project.current_layer));
    progress.insert("current_agent".to_string(), json!(project.current_agent));
    progress.insert(
        "available_agents_count".to_string(),
        json!(available_count),
    );
    progress
}

fn status_label<T: Serialize>(status: &T) -> String {
    match serde_json::to_value(status) {
        Ok(Value::String(label)) => label,
        _ => "unknown".to_string(),
    }
}
