//! Pure scheduling logic: agent availability, layer progression, and
//! cascading failure recomputation.
//!
//! `recompute_cascade` is the single code path for failure propagation. It is
//! applied after every terminal failure, after a reset, and after importing a
//! persisted project, so dependents of a dead agent are never left `pending`
//! forever regardless of how the state was reached.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::state::{AgentStatus, LayerStatus, Project, ProjectStatus};
use crate::registry::Registry;

/// Agents ready to execute, in registry declaration order.
///
/// An agent qualifies iff its layer is reachable (`available` or
/// `in_progress`), it is itself `pending`, and every dependency has `passed`.
/// Deterministic and idempotent: repeated calls with no intervening mutation
/// return the same ordered list.
pub fn available_agents(registry: &Registry, project: &Project) -> Vec<String> {
    registry
        .agents()
        .filter(|def| {
            let Some(layer) = project.layers.get(&def.layer) else {
                return false;
            };
            if !matches!(layer.status, LayerStatus::Available | LayerStatus::InProgress) {
                return false;
            }
            if layer.agents.get(&def.agent_id).map(|state| state.status)
                != Some(AgentStatus::Pending)
            {
                return false;
            }
            def.dependencies
                .iter()
                .all(|dep| project.agent_status(dep) == Some(AgentStatus::Passed))
        })
        .map(|def| def.agent_id.clone())
        .collect()
}

/// Re-derive cascade failures and layer statuses from the agent states.
///
/// Runs three passes: reverse cascades whose root failure is gone, propagate
/// terminal failures onto pending dependents (recording the root failed
/// agent, so transitive dependents all name the true origin), then re-derive
/// layer statuses and the scheduling cursor.
pub fn recompute_cascade(registry: &Registry, project: &mut Project) {
    // Reverse first: an agent failed only by cascade returns to pending once
    // the root it names is no longer failed.
    let stale: Vec<String> = project
        .layers
        .values()
        .flat_map(|layer| layer.agents.values())
        .filter(|state| state.status == AgentStatus::Failed)
        .filter_map(|state| {
            let root = state.cascaded_from.as_ref()?;
            (project.agent_status(root) != Some(AgentStatus::Failed))
                .then(|| state.agent_id.clone())
        })
        .collect();
    for agent_id in stale {
        if let Some(state) = project.agent_state_mut(&agent_id) {
            debug!(agent_id = %agent_id, "reversing cascade failure");
            state.status = AgentStatus::Pending;
            state.attempts = 0;
            state.last_error = None;
            state.cascaded_from = None;
        }
    }

    // Forward propagation to fixpoint.
    let mut changed = true;
    while changed {
        changed = false;
        for def in registry.agents() {
            if project.agent_status(&def.agent_id) != Some(AgentStatus::Pending) {
                continue;
            }
            let failed_dep = def.dependencies.iter().find_map(|dep| {
                (project.agent_status(dep) == Some(AgentStatus::Failed)).then_some(dep)
            });
            let Some(dep) = failed_dep else {
                continue;
            };
            let root = project
                .agent_state(dep)
                .and_then(|state| state.cascaded_from.clone())
                .unwrap_or_else(|| dep.clone());
            if let Some(state) = project.agent_state_mut(&def.agent_id) {
                warn!(agent_id = %def.agent_id, root = %root, "cascading upstream failure");
                state.status = AgentStatus::Failed;
                state.last_error = Some(format!(
                    "dependency '{dep}' failed: upstream agent '{root}' failed terminally"
                ));
                state.cascaded_from = Some(root);
                changed = true;
            }
        }
    }

    recompute_layers(project);

    if project.all_layers_completed() {
        project.status = ProjectStatus::Completed;
    } else if matches!(project.status, ProjectStatus::Completed | ProjectStatus::Blocked) {
        // A stale terminal status after a reset: downgrade to blocked only if
        // nothing can run.
        project.status = if available_agents(registry, project).is_empty() {
            ProjectStatus::Blocked
        } else {
            ProjectStatus::Initialized
        };
    }
}

/// Derive every layer's status from its agents. Layers complete in order; a
/// completed layer unlocks the next, and chains of all-terminal layers
/// (e.g. fully cascade-failed ones) complete in a single sweep.
fn recompute_layers(project: &mut Project) {
    let layer_ids: Vec<i64> = project.layers.keys().copied().collect();
    let mut prev_completed = true;
    let mut cursor = None;
    for layer_id in &layer_ids {
        let Some(layer) = project.layers.get_mut(layer_id) else {
            continue;
        };
        let all_terminal = layer.all_terminal();
        let any_started = layer
            .agents
            .values()
            .any(|state| state.attempts > 0 || state.status != AgentStatus::Pending);

        if prev_completed {
            if all_terminal {
                if layer.status != LayerStatus::Completed {
                    layer.status = LayerStatus::Completed;
                    layer.completed_at = Some(Utc::now());
                }
            } else {
                layer.completed_at = None;
                if any_started {
                    layer.status = LayerStatus::InProgress;
                    if layer.started_at.is_none() {
                        layer.started_at = Some(Utc::now());
                    }
                } else {
                    layer.status = LayerStatus::Available;
                }
                if cursor.is_none() {
                    cursor = Some(*layer_id);
                }
            }
        } else {
            layer.status = LayerStatus::Locked;
            layer.completed_at = None;
            if cursor.is_none() {
                cursor = Some(*layer_id);
            }
        }
        prev_completed = prev_completed && all_terminal;
    }

    project.current_layer = cursor
        .or_else(|| layer_ids.last().copied())
        .unwrap_or_default();
}

/// One pending agent that cannot run, and why.
#[derive(Debug, Clone, Serialize)]
pub struct BlockedAgent {
    pub agent_id: String,
    pub layer: i64,
    pub layer_status: LayerStatus,
    pub unmet_dependencies: Vec<UnmetDependency>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnmetDependency {
    pub dep_id: String,
    /// The dependency's current status, or "missing" when it is not part of
    /// the project at all.
    pub dep_status: String,
}

/// Structured explanation of why a project cannot make progress.
#[derive(Debug, Clone, Serialize)]
pub struct BlockedDiagnostics {
    pub project_id: String,
    pub project_status: ProjectStatus,
    pub blocked: Vec<BlockedAgent>,
    pub agent_status_counts: BTreeMap<String, usize>,
    pub layer_status_counts: BTreeMap<String, usize>,
}

/// Report every pending agent with unmet dependencies, plus status
/// histograms. Attached to blocked job failures so a stuck pipeline is never
/// a silent hang.
pub fn blocked_diagnostics(registry: &Registry, project: &Project) -> BlockedDiagnostics {
    let mut blocked = Vec::new();
    let mut agent_status_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut layer_status_counts: BTreeMap<String, usize> = BTreeMap::new();

    for layer in project.layers.values() {
        *layer_status_counts
            .entry(status_label(&layer.status))
            .or_default() += 1;
        for state in layer.agents.values() {
            *agent_status_counts
                .entry(status_label(&state.status))
                .or_default() += 1;
            if state.status != AgentStatus::Pending {
                continue;
            }
            let Some(def) = registry.get(&state.agent_id) else {
                continue;
            };
            let unmet: Vec<UnmetDependency> = def
                .dependencies
                .iter()
                .filter_map(|dep| match project.agent_status(dep) {
                    Some(AgentStatus::Passed) => None,
                    Some(status) => Some(UnmetDependency {
                        dep_id: dep.clone(),
                        dep_status: status_label(&status),
                    }),
                    None => Some(UnmetDependency {
                        dep_id: dep.clone(),
                        dep_status: "missing".to_string(),
                    }),
                })
                .collect();
            if !unmet.is_empty() {
                blocked.push(BlockedAgent {
                    agent_id: state.agent_id.clone(),
                    layer: layer.layer_id,
                    layer_status: layer.status,
                    unmet_dependencies: unmet,
                });
            }
        }
    }

    BlockedDiagnostics {
        project_id: project.project_id.clone(),
        project_status: project.status,
        blocked,
        agent_status_counts,
        layer_status_counts,
    }
}

fn status_label<T: Serialize>(status: &T) -> String {
    match serde_json::to_value(status) {
        Ok(Value::String(label)) => label,
        _ => "unknown".to_string(),
    }
}
