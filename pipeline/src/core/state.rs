//! Project state model: the DAG instance a pipeline run mutates.
//!
//! A [`Project`] owns layers, each layer owns agent states, each agent state
//! owns its output history. These types double as the persistence format:
//! a project serializes to a plain JSON mapping and back without loss.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Execution status of a single agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Skipped,
}

/// Status of a pipeline layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerStatus {
    Locked,
    Available,
    InProgress,
    Completed,
    Failed,
}

/// Derived top-level project status, recomputed on each scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Initialized,
    Blocked,
    Completed,
    Failed,
}

/// Result of a gate check, produced fresh per validation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub passed: bool,
    pub message: String,
    #[serde(default)]
    pub details: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl GateResult {
    pub fn pass(message: impl Into<String>, details: Map<String, Value>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details,
            created_at: Utc::now(),
        }
    }

    pub fn fail(message: impl Into<String>, details: Map<String, Value>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details,
            created_at: Utc::now(),
        }
    }
}

/// Output of one agent execution attempt. Never mutated after creation; a new
/// attempt produces a new output with the next `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub agent_id: String,
    pub content: Map<String, Value>,
    pub gate_result: Option<GateResult>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub version: u32,
}

/// Mutable per-agent state owned by a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: String,
    pub status: AgentStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Root terminally-failed upstream agent when this failure was applied by
    /// cascade rather than earned by execution. Resetting that root reverses
    /// exactly the failures that name it.
    pub cascaded_from: Option<String>,
    pub current_output: Option<AgentOutput>,
    /// Append-only history of every execution attempt.
    #[serde(default)]
    pub outputs: Vec<AgentOutput>,
}

impl AgentState {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            status: AgentStatus::Pending,
            attempts: 0,
            last_error: None,
            cascaded_from: None,
            current_output: None,
            outputs: Vec::new(),
        }
    }

    /// True once the agent can no longer run: it passed, or failed terminally.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, AgentStatus::Passed | AgentStatus::Failed)
    }
}

/// State of one pipeline layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerState {
    pub layer_id: i64,
    pub status: LayerStatus,
    pub agents: BTreeMap<String, AgentState>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl LayerState {
    pub fn new(layer_id: i64, status: LayerStatus) -> Self {
        Self {
            layer_id,
            status,
            agents: BTreeMap::new(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn all_terminal(&self) -> bool {
        self.agents.values().all(AgentState::is_terminal)
    }
}

/// Complete state of one manuscript project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub project_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Inputs supplied at creation; never mutated by the pipeline.
    pub user_constraints: Map<String, Value>,
    pub layers: BTreeMap<i64, LayerState>,
    pub current_layer: i64,
    pub current_agent: Option<String>,
    pub status: ProjectStatus,
    /// Accumulated generation output, written only by manuscript-producing
    /// agents.
    #[serde(default)]
    pub manuscript: Map<String, Value>,
    /// Produced-key index: output key name to the agent id of its first
    /// (lowest-layer) producer. Rebuilt on import, maintained incrementally
    /// during execution.
    #[serde(skip)]
    pub(crate) output_index: HashMap<String, String>,
}

impl Project {
    pub fn new(title: impl Into<String>, user_constraints: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            project_id: Uuid::new_v4().to_string(),
            title: title.into(),
            created_at: now,
            updated_at: now,
            user_constraints,
            layers: BTreeMap::new(),
            current_layer: 0,
            current_agent: None,
            status: ProjectStatus::Initialized,
            manuscript: Map::new(),
            output_index: HashMap::new(),
        }
    }

    /// Find an agent's state across all layers.
    pub fn agent_state(&self, agent_id: &str) -> Option<&AgentState> {
        self.layers
            .values()
            .find_map(|layer| layer.agents.get(agent_id))
    }

    pub fn agent_state_mut(&mut self, agent_id: &str) -> Option<&mut AgentState> {
        self.layers
            .values_mut()
            .find_map(|layer| layer.agents.get_mut(agent_id))
    }

    pub fn agent_status(&self, agent_id: &str) -> Option<AgentStatus> {
        self.agent_state(agent_id).map(|state| state.status)
    }

    /// Ids of agents that failed terminally, in layer order.
    pub fn failed_agent_ids(&self) -> Vec<String> {
        self.layers
            .values()
            .flat_map(|layer| layer.agents.values())
            .filter(|state| state.status == AgentStatus::Failed)
            .map(|state| state.agent_id.clone())
            .collect()
    }

    pub fn all_layers_completed(&self) -> bool {
        self.layers
            .values()
            .all(|layer| layer.status == LayerStatus::Completed)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
