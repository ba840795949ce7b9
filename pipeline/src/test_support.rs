//! Test-only helpers: deterministic registries, scripted executors, and
//! store fixtures.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::core::gate::GateValidator;
use crate::core::state::Project;
use crate::executor::{AgentExecutor, ExecutionContext, placeholder_content};
use crate::io::store::JsonStore;
use crate::orchestrator::{Orchestrator, build_project};
use crate::registry::{AgentDefinition, Registry};

/// Build a definition with deterministic defaults.
pub fn agent_def(
    agent_id: &str,
    layer: i64,
    dependencies: &[&str],
    inputs: &[&str],
    outputs: &[&str],
) -> AgentDefinition {
    AgentDefinition {
        agent_id: agent_id.to_string(),
        layer,
        inputs: inputs.iter().map(|s| s.to_string()).collect(),
        outputs: outputs.iter().map(|s| s.to_string()).collect(),
        dependencies: dependencies.iter().map(|s| s.to_string()).collect(),
        retry_limit: 3,
    }
}

/// Three independent agents in a single layer.
pub fn independent_registry() -> Registry {
    Registry::new(vec![
        agent_def("alpha", 0, &[], &[], &["alpha_out"]),
        agent_def("beta", 0, &[], &[], &["beta_out"]),
        agent_def("gamma", 0, &[], &[], &["gamma_out"]),
    ])
    .expect("independent registry")
}

/// A three-layer chain: first -> second -> third. "third" additionally
/// declares "first_key" as a named input without depending on "first".
pub fn chain_registry() -> Registry {
    Registry::new(vec![
        agent_def("first", 0, &[], &[], &["first_key"]),
        agent_def("second", 1, &["first"], &["first"], &["second_key"]),
        agent_def("third", 2, &["second"], &["first_key"], &["third_key"]),
    ])
    .expect("chain registry")
}

/// A fresh project for a registry, outside any orchestrator.
pub fn project_for(registry: &Registry) -> Project {
    build_project(registry, "Test Project", Map::new())
}

/// Build a JSON object map from key/value pairs.
pub fn content(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

pub fn test_orchestrator(registry: Registry) -> Orchestrator {
    test_orchestrator_with_timeout(registry, Duration::from_secs(5))
}

pub fn test_orchestrator_with_timeout(registry: Registry, step_timeout: Duration) -> Orchestrator {
    Orchestrator::new(
        Arc::new(registry),
        GateValidator::new().expect("gate validator"),
        step_timeout,
    )
}

/// Orchestrator with a [`SlowExecutor`] registered per (agent id, delay)
/// pair. Agents without an entry fall back to placeholder content.
pub fn test_orchestrator_with_executors(
    registry: Registry,
    delays: &[(&str, Duration)],
) -> Orchestrator {
    let mut orchestrator = test_orchestrator(registry);
    for (agent_id, delay) in delays {
        orchestrator.register_executor(*agent_id, Arc::new(SlowExecutor::new(*delay)));
    }
    orchestrator
}

/// Job and project stores rooted in one temp directory. Keep the `TempDir`
/// alive for the duration of the test.
pub fn test_stores() -> (Arc<JsonStore>, Arc<JsonStore>, tempfile::TempDir) {
    let temp = tempfile::tempdir().expect("tempdir");
    let job_store = Arc::new(JsonStore::new(temp.path().join("jobs")));
    let project_store = Arc::new(JsonStore::new(temp.path().join("projects")));
    (job_store, project_store, temp)
}

/// Returns queued content maps in order, or one map forever.
pub struct ScriptedExecutor {
    queued: Mutex<VecDeque<Map<String, Value>>>,
    repeated: Option<Map<String, Value>>,
}

impl ScriptedExecutor {
    pub fn new(outputs: Vec<Map<String, Value>>) -> Self {
        Self {
            queued: Mutex::new(outputs.into()),
            repeated: None,
        }
    }

    pub fn repeating(output: Map<String, Value>) -> Self {
        Self {
            queued: Mutex::new(VecDeque::new()),
            repeated: Some(output),
        }
    }
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    async fn execute(&self, _context: &ExecutionContext) -> Result<Map<String, Value>> {
        if let Some(output) = &self.repeated {
            return Ok(output.clone());
        }
        self.queued
            .lock()
            .expect("scripted executor lock")
            .pop_front()
            .ok_or_else(|| anyhow!("scripted executor exhausted"))
    }
}

/// Always errors, for terminal-failure paths.
pub struct FailingExecutor;

#[async_trait]
impl AgentExecutor for FailingExecutor {
    async fn execute(&self, _context: &ExecutionContext) -> Result<Map<String, Value>> {
        Err(anyhow!("executor exploded"))
    }
}

/// Sleeps for a fixed delay, then returns passing placeholder content. Used
/// to exercise heartbeats and step timeouts.
pub struct SlowExecutor {
    delay: Duration,
}

impl SlowExecutor {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl AgentExecutor for SlowExecutor {
    async fn execute(&self, context: &ExecutionContext) -> Result<Map<String, Value>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(placeholder_content(&context.agent))
    }
}
