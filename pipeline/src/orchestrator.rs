//! Orchestration of single agent executions against project state.
//!
//! The orchestrator owns the in-memory project table and drives one agent at
//! a time through input gathering, execution, gate validation, and the
//! retry/terminal-failure bookkeeping. Projects are handed out as owned
//! snapshots and committed back, so no lock is held across a (potentially
//! very long) generation call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::gate::GateValidator;
use crate::core::inputs::{gather_inputs, index_produced_keys, rebuild_output_index};
use crate::core::schedule::{
    BlockedDiagnostics, available_agents, blocked_diagnostics, recompute_cascade,
};
use crate::core::state::{
    AgentOutput, AgentState, AgentStatus, LayerState, LayerStatus, Project, ProjectStatus,
};
use crate::executor::{AgentExecutor, ExecutionContext, placeholder_content};
use crate::io::backend::GenerationBackend;
use crate::registry::Registry;

/// A single agent execution exceeded the configured step timeout.
///
/// Kept concrete so the job loop can downcast it and keep stepping: the unit
/// of work is recorded as failed without aborting the whole job.
#[derive(Debug, Clone, Error)]
#[error("agent '{agent_id}' timed out after {timeout:?}")]
pub struct StepTimedOut {
    pub agent_id: String,
    pub timeout: Duration,
}

/// Build a fresh project from the registry: every layer present, every agent
/// pending, the lowest layer available and the rest locked.
pub fn build_project(
    registry: &Registry,
    title: impl Into<String>,
    user_constraints: Map<String, Value>,
) -> Project {
    let mut project = Project::new(title, user_constraints);
    let layer_ids = registry.layer_ids();
    for (position, layer_id) in layer_ids.iter().enumerate() {
        let status = if position == 0 {
            LayerStatus::Available
        } else {
            LayerStatus::Locked
        };
        let mut layer = LayerState::new(*layer_id, status);
        for def in registry.agents_in_layer(*layer_id) {
            layer
                .agents
                .insert(def.agent_id.clone(), AgentState::new(&def.agent_id));
        }
        project.layers.insert(*layer_id, layer);
    }
    project.current_layer = layer_ids.first().copied().unwrap_or_default();
    project
}

/// The scheduler over a registry of agents and a table of projects.
pub struct Orchestrator {
    registry: Arc<Registry>,
    gate: GateValidator,
    backend: Option<Arc<dyn GenerationBackend>>,
    executors: HashMap<String, Arc<dyn AgentExecutor>>,
    step_timeout: Duration,
    projects: Mutex<HashMap<String, Project>>,
}

impl Orchestrator {
    pub fn new(registry: Arc<Registry>, gate: GateValidator, step_timeout: Duration) -> Self {
        Self {
            registry,
            gate,
            backend: None,
            executors: HashMap::new(),
            step_timeout,
            projects: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn GenerationBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Register an executor for one agent id. Overrides passed to
    /// [`Orchestrator::execute_agent`] still win.
    pub fn register_executor(
        &mut self,
        agent_id: impl Into<String>,
        executor: Arc<dyn AgentExecutor>,
    ) {
        self.executors.insert(agent_id.into(), executor);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Create and register a new project.
    pub async fn create_project(
        &self,
        title: impl Into<String>,
        user_constraints: Map<String, Value>,
    ) -> Project {
        let project = build_project(&self.registry, title, user_constraints);
        info!(project_id = %project.project_id, "created project");
        self.projects
            .lock()
            .await
            .insert(project.project_id.clone(), project.clone());
        project
    }

    /// Snapshot of a project by id.
    pub async fn get_project(&self, project_id: &str) -> Option<Project> {
        self.projects.lock().await.get(project_id).cloned()
    }

    /// Store a (mutated) project snapshot back into the table.
    pub async fn commit_project(&self, project: &Project) {
        self.projects
            .lock()
            .await
            .insert(project.project_id.clone(), project.clone());
    }

    pub fn get_available_agents(&self, project: &Project) -> Vec<String> {
        available_agents(&self.registry, project)
    }

    pub fn gather_inputs(&self, project: &Project, agent_id: &str) -> Map<String, Value> {
        gather_inputs(&self.registry, project, agent_id)
    }

    pub fn blocked_diagnostics(&self, project: &Project) -> BlockedDiagnostics {
        blocked_diagnostics(&self.registry, project)
    }

    /// Execute one agent: gather inputs, run the executor under the step
    /// timeout, validate through the gate, and apply retry / terminal-failure
    /// / cascade rules.
    ///
    /// Executor errors (including timeouts) mark the agent terminally failed
    /// and propagate to the caller.
    pub async fn execute_agent(
        &self,
        project: &mut Project,
        agent_id: &str,
        executor: Option<Arc<dyn AgentExecutor>>,
    ) -> Result<AgentOutput> {
        let def = self
            .registry
            .get(agent_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown agent '{agent_id}'"))?;
        let state = project
            .agent_state_mut(agent_id)
            .ok_or_else(|| anyhow!("agent '{agent_id}' not found in project"))?;

        state.status = AgentStatus::Running;
        state.attempts += 1;
        let attempt = state.attempts;
        project.current_agent = Some(agent_id.to_string());
        if let Some(layer) = project.layers.get_mut(&def.layer) {
            if layer.status == LayerStatus::Available {
                layer.status = LayerStatus::InProgress;
                layer.started_at = Some(Utc::now());
            }
        }

        let inputs = self.gather_inputs(project, agent_id);
        let context = ExecutionContext {
            agent: def.clone(),
            inputs: inputs.clone(),
            user_constraints: project.user_constraints.clone(),
            title: project.title.clone(),
            backend: self.backend.clone(),
        };

        let chosen = executor.or_else(|| self.executors.get(agent_id).cloned());
        let produced: Result<Map<String, Value>> = match chosen {
            Some(exec) => match tokio::time::timeout(self.step_timeout, exec.execute(&context)).await
            {
                Ok(result) => result,
                Err(_) => Err(StepTimedOut {
                    agent_id: agent_id.to_string(),
                    timeout: self.step_timeout,
                }
                .into()),
            },
            None => Ok(placeholder_content(&def)),
        };

        let content = match produced {
            Ok(content) => content,
            Err(err) => {
                warn!(agent_id, error = %err, "agent execution errored");
                if let Some(state) = project.agent_state_mut(agent_id) {
                    state.status = AgentStatus::Failed;
                    state.last_error = Some(format!("{err:#}"));
                }
                recompute_cascade(&self.registry, project);
                project.touch();
                return Err(err).with_context(|| format!("execute agent '{agent_id}'"));
            }
        };

        let validated = self.gate.validate(agent_id, &content, &def.outputs);
        let output = AgentOutput {
            agent_id: agent_id.to_string(),
            content: validated.content,
            gate_result: Some(validated.gate.clone()),
            metadata: execution_metadata(attempt, &inputs),
            created_at: Utc::now(),
            version: attempt,
        };

        let state = project
            .agent_state_mut(agent_id)
            .ok_or_else(|| anyhow!("agent '{agent_id}' not found in project"))?;
        state.outputs.push(output.clone());
        if validated.gate.passed {
            state.status = AgentStatus::Passed;
            state.last_error = None;
            state.current_output = Some(output.clone());
            info!(agent_id, attempt, "agent passed gate");
            index_produced_keys(project, &self.registry, agent_id);
            fold_manuscript(project, agent_id, &output.content);
        } else if attempt >= def.retry_limit {
            state.status = AgentStatus::Failed;
            state.last_error = Some(validated.gate.message.clone());
            warn!(agent_id, attempt, "agent failed terminally: {}", validated.gate.message);
        } else {
            state.status = AgentStatus::Pending;
            info!(agent_id, attempt, "agent failed gate, will retry");
        }

        recompute_cascade(&self.registry, project);
        project.touch();
        Ok(output)
    }

    /// Reset a terminally failed agent back to pending, reopening its layer
    /// and reversing the cascade applied to its dependents. Returns the
    /// agent's new state.
    pub fn reset_agent(&self, project: &mut Project, agent_id: &str) -> Result<AgentState> {
        if !self.registry.contains(agent_id) {
            bail!("unknown agent '{agent_id}'");
        }
        let state = project
            .agent_state_mut(agent_id)
            .ok_or_else(|| anyhow!("agent '{agent_id}' not found in project"))?;
        if state.status != AgentStatus::Failed {
            bail!(
                "agent '{agent_id}' is not failed (current status: {})",
                status_text(state.status)
            );
        }
        state.status = AgentStatus::Pending;
        state.attempts = 0;
        state.last_error = None;
        state.cascaded_from = None;
        state.current_output = None;

        rebuild_output_index(project, &self.registry);
        recompute_cascade(&self.registry, project);
        project.touch();
        info!(agent_id, "agent reset to pending");
        project
            .agent_state(agent_id)
            .cloned()
            .ok_or_else(|| anyhow!("agent '{agent_id}' not found in project"))
    }

    /// Execute the first available agent until none remain. Convenience
    /// wrapper; the job manager is the primary execution path.
    pub async fn run_to_completion(
        &self,
        project: &mut Project,
        max_iterations: u32,
    ) -> Result<()> {
        let mut iterations = 0;
        while iterations < max_iterations {
            let available = self.get_available_agents(project);
            let Some(agent_id) = available.first().cloned() else {
                project.status = if project.all_layers_completed() {
                    ProjectStatus::Completed
                } else {
                    ProjectStatus::Blocked
                };
                return Ok(());
            };
            self.execute_agent(project, &agent_id, None).await?;
            iterations += 1;
        }
        Ok(())
    }

    /// Export a project as a plain nested mapping (the persistence format).
    pub fn export_project(&self, project: &Project) -> Result<Value> {
        serde_json::to_value(project).context("serialize project")
    }

    /// Import a previously exported project. Rebuilds the produced-key index
    /// and recomputes cascade state, then registers the project. Without the
    /// recompute, a reloaded project could show dependents of a dead agent
    /// stuck pending with no way to ever become available.
    pub async fn import_project(&self, data: Value) -> Result<Project> {
        let mut project: Project =
            serde_json::from_value(data).context("deserialize project")?;
        rebuild_output_index(&mut project, &self.registry);
        recompute_cascade(&self.registry, &mut project);
        self.commit_project(&project).await;
        Ok(project)
    }

    /// Assemble the manuscript and publishing metadata from the most edited
    /// chapters available.
    pub fn export_manuscript(&self, project: &Project) -> Map<String, Value> {
        let mut manuscript = Map::new();
        manuscript.insert("title".to_string(), Value::String(project.title.clone()));
        manuscript.insert("generated_at".to_string(), json!(Utc::now()));

        let mut chapters = project
            .manuscript
            .get("chapters")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if chapters.is_empty() {
            for (agent_id, key) in [
                ("line_edit", "edited_chapters"),
                ("structural_rewrite", "revised_chapters"),
                ("draft_generation", "chapters"),
            ] {
                if let Some(found) = output_array(project, agent_id, key) {
                    chapters = found;
                    break;
                }
            }
        }
        manuscript.insert("chapters".to_string(), Value::Array(chapters));

        let mut metadata = Map::new();
        if let Some(output) = project
            .agent_state("publishing_package")
            .and_then(|state| state.current_output.as_ref())
        {
            for key in ["blurb", "synopsis", "keywords"] {
                if let Some(value) = output.content.get(key) {
                    metadata.insert(key.to_string(), value.clone());
                }
            }
        }
        manuscript.insert("metadata".to_string(), Value::Object(metadata));
        manuscript
    }
}

fn execution_metadata(attempt: u32, inputs: &Map<String, Value>) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("attempt".to_string(), json!(attempt));
    let keys: Vec<&String> = inputs.keys().collect();
    metadata.insert("inputs_used".to_string(), json!(keys));
    metadata
}

/// Only manuscript-producing agents may write the project manuscript; later
/// editing stages replace earlier drafts.
fn fold_manuscript(project: &mut Project, agent_id: &str, content: &Map<String, Value>) {
    let key = match agent_id {
        "draft_generation" => "chapters",
        "structural_rewrite" => "revised_chapters",
        "line_edit" => "edited_chapters",
        _ => return,
    };
    if let Some(Value::Array(chapters)) = content.get(key) {
        if !chapters.is_empty() {
            project
                .manuscript
                .insert("chapters".to_string(), Value::Array(chapters.clone()));
        }
    }
}

fn output_array(project: &Project, agent_id: &str, key: &str) -> Option<Vec<Value>> {
    let chapters = project
        .agent_state(agent_id)?
        .current_output
        .as_ref()?
        .content
        .get(key)?
        .as_array()?;
    if chapters.is_empty() {
        None
    } else {
        Some(chapters.clone())
    }
}

fn status_text(status: AgentStatus) -> String {
    match serde_json::to_value(status) {
        Ok(Value::String(text)) => text,
        _ => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::core::state::LayerStatus;
    use crate::test_support::{
        FailingExecutor, ScriptedExecutor, SlowExecutor, chain_registry, content,
        independent_registry, test_orchestrator, test_orchestrator_with_timeout,
    };

    #[tokio::test]
    async fn create_project_initializes_all_layers() {
        let orchestrator = test_orchestrator(chain_registry());
        let project = orchestrator.create_project("Book", Map::new()).await;

        assert_eq!(project.layers.len(), 3);
        assert_eq!(
            project.layers.get(&0).map(|layer| layer.status),
            Some(LayerStatus::Available)
        );
        assert_eq!(
            project.layers.get(&1).map(|layer| layer.status),
            Some(LayerStatus::Locked)
        );
        assert_eq!(project.status, ProjectStatus::Initialized);
        assert!(orchestrator.get_project(&project.project_id).await.is_some());
    }

    #[tokio::test]
    async fn placeholder_run_completes_three_independent_agents() {
        let orchestrator = test_orchestrator(independent_registry());
        let mut project = orchestrator.create_project("Offline", Map::new()).await;

        orchestrator
            .run_to_completion(&mut project, 20)
            .await
            .expect("run");

        assert_eq!(project.status, ProjectStatus::Completed);
        for agent_id in ["alpha", "beta", "gamma"] {
            let state = project.agent_state(agent_id).expect("state");
            assert_eq!(state.status, AgentStatus::Passed, "{agent_id}");
            let output = state.current_output.as_ref().expect("output");
            assert_eq!(output.content.get("_status"), Some(&json!("placeholder")));
        }
    }

    #[tokio::test]
    async fn failing_gate_retries_until_limit_then_fails_terminally() {
        // Executor always omits the required output key.
        let mut registry = chain_registry();
        registry = Registry::new(
            registry
                .agents()
                .cloned()
                .map(|mut def| {
                    if def.agent_id == "first" {
                        def.retry_limit = 2;
                    }
                    def
                })
                .collect(),
        )
        .expect("registry");
        let orchestrator = test_orchestrator(registry);
        let mut project = orchestrator.create_project("Retry", Map::new()).await;
        let executor = Arc::new(ScriptedExecutor::repeating(content(&[("wrong", json!(1))])));

        let output = orchestrator
            .execute_agent(&mut project, "first", Some(executor.clone()))
            .await
            .expect("first attempt");
        assert!(!output.gate_result.as_ref().expect("gate").passed);
        assert_eq!(project.agent_status("first"), Some(AgentStatus::Pending));
        assert_eq!(project.agent_state("first").expect("state").attempts, 1);

        orchestrator
            .execute_agent(&mut project, "first", Some(executor))
            .await
            .expect("second attempt");
        let state = project.agent_state("first").expect("state");
        assert_eq!(state.status, AgentStatus::Failed);
        assert_eq!(state.attempts, 2);
        assert!(state.last_error.as_deref().expect("error").contains("missing"));
        // History keeps both attempts even though neither passed.
        assert_eq!(state.outputs.len(), 2);
    }

    #[tokio::test]
    async fn executor_error_is_terminal_and_propagates() {
        let orchestrator = test_orchestrator(chain_registry());
        let mut project = orchestrator.create_project("Crash", Map::new()).await;

        let err = orchestrator
            .execute_agent(&mut project, "first", Some(Arc::new(FailingExecutor)))
            .await
            .expect_err("should propagate");
        assert!(err.to_string().contains("execute agent 'first'"));

        let state = project.agent_state("first").expect("state");
        assert_eq!(state.status, AgentStatus::Failed);
        assert!(state.last_error.is_some());
        // Dependents are cascade-failed, not stuck pending.
        assert_eq!(project.agent_status("second"), Some(AgentStatus::Failed));
        assert_eq!(
            project
                .agent_state("second")
                .and_then(|state| state.cascaded_from.clone())
                .as_deref(),
            Some("first")
        );
    }

    #[tokio::test]
    async fn step_timeout_is_downcastable_and_terminal() {
        let orchestrator =
            test_orchestrator_with_timeout(chain_registry(), Duration::from_millis(50));
        let mut project = orchestrator.create_project("Slow", Map::new()).await;

        let err = orchestrator
            .execute_agent(
                &mut project,
                "first",
                Some(Arc::new(SlowExecutor::new(Duration::from_millis(250)))),
            )
            .await
            .expect_err("should time out");
        let timeout = err.downcast_ref::<StepTimedOut>().expect("timeout kind");
        assert_eq!(timeout.agent_id, "first");
        assert_eq!(project.agent_status("first"), Some(AgentStatus::Failed));
    }

    #[tokio::test]
    async fn reset_restores_failed_agent_and_cascaded_dependents() {
        let orchestrator = test_orchestrator(chain_registry());
        let mut project = orchestrator.create_project("Reset", Map::new()).await;
        let _ = orchestrator
            .execute_agent(&mut project, "first", Some(Arc::new(FailingExecutor)))
            .await;
        assert_eq!(project.agent_status("third"), Some(AgentStatus::Failed));
        assert!(project.all_layers_completed());

        orchestrator
            .reset_agent(&mut project, "first")
            .expect("reset");

        for agent_id in ["first", "second", "third"] {
            assert_eq!(
                project.agent_status(agent_id),
                Some(AgentStatus::Pending),
                "{agent_id}"
            );
        }
        assert!(!project.all_layers_completed());
        assert_eq!(orchestrator.get_available_agents(&project), ["first"]);
    }

    #[tokio::test]
    async fn reset_rejects_non_failed_agents() {
        let orchestrator = test_orchestrator(chain_registry());
        let mut project = orchestrator.create_project("Reset", Map::new()).await;
        let err = orchestrator
            .reset_agent(&mut project, "first")
            .expect_err("pending agent cannot be reset");
        assert!(err.to_string().contains("not failed"));
    }

    #[tokio::test]
    async fn export_import_round_trips_state_and_outputs() {
        let orchestrator = test_orchestrator(independent_registry());
        let mut project = orchestrator.create_project("Round", Map::new()).await;
        orchestrator
            .run_to_completion(&mut project, 20)
            .await
            .expect("run");
        orchestrator.commit_project(&project).await;

        let exported = orchestrator.export_project(&project).expect("export");
        let imported = orchestrator.import_project(exported).await.expect("import");

        assert_eq!(imported.project_id, project.project_id);
        assert_eq!(imported.status, ProjectStatus::Completed);
        for agent_id in ["alpha", "beta", "gamma"] {
            let before = project.agent_state(agent_id).expect("before");
            let after = imported.agent_state(agent_id).expect("after");
            assert_eq!(before, after, "{agent_id}");
        }
    }

    #[tokio::test]
    async fn import_recomputes_cascade_for_stuck_dependents() {
        let orchestrator = test_orchestrator(chain_registry());
        let project = orchestrator.create_project("Import", Map::new()).await;
        let mut exported = orchestrator.export_project(&project).expect("export");

        // Hand-edit the snapshot: the root agent failed terminally but its
        // dependents were persisted before any cascade ran.
        let first = exported
            .pointer_mut("/layers/0/agents/first")
            .expect("first agent");
        first["status"] = json!("failed");
        first["attempts"] = json!(3);
        first["last_error"] = json!("gate failed");

        let imported = orchestrator.import_project(exported).await.expect("import");
        assert_eq!(imported.agent_status("second"), Some(AgentStatus::Failed));
        assert_eq!(imported.agent_status("third"), Some(AgentStatus::Failed));
        assert!(
            imported
                .agent_state("third")
                .and_then(|state| state.last_error.clone())
                .expect("error")
                .contains("first")
        );
    }

    #[tokio::test]
    async fn manuscript_folds_from_draft_chapters() {
        let orchestrator = test_orchestrator(independent_registry());
        let mut project = orchestrator.create_project("Draft", Map::new()).await;
        // "alpha" is not a manuscript agent; nothing should fold.
        orchestrator
            .run_to_completion(&mut project, 20)
            .await
            .expect("run");
        assert!(project.manuscript.is_empty());

        fold_manuscript(
            &mut project,
            "draft_generation",
            &content(&[("chapters", json!([{"number": 1, "text": "Rain."}]))]),
        );
        let exported = orchestrator.export_manuscript(&project);
        let chapters = exported
            .get("chapters")
            .and_then(Value::as_array)
            .expect("chapters");
        assert_eq!(chapters.len(), 1);
    }
}
