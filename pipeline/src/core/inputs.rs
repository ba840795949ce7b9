//! Input gathering for agent execution.
//!
//! Resolution order per declared input name: user constraints, then the
//! output of the agent with that exact id, then the project-wide produced-key
//! index. Dependency outputs are always included keyed by the dependency id.
//! Earlier tiers are never overwritten by later ones.

use serde_json::{Map, Value};

use crate::core::state::Project;
use crate::registry::Registry;

/// Gather the inputs an agent execution will receive.
pub fn gather_inputs(
    registry: &Registry,
    project: &Project,
    agent_id: &str,
) -> Map<String, Value> {
    let Some(def) = registry.get(agent_id) else {
        return Map::new();
    };

    let mut inputs = Map::new();
    inputs.insert(
        "user_constraints".to_string(),
        Value::Object(project.user_constraints.clone()),
    );
    inputs.insert("title".to_string(), Value::String(project.title.clone()));

    // Dependency outputs keyed by the dependency's agent id take precedence
    // over generic key search.
    for dep in &def.dependencies {
        if let Some(output) = project
            .agent_state(dep)
            .and_then(|state| state.current_output.as_ref())
        {
            inputs.insert(dep.clone(), Value::Object(output.content.clone()));
        }
    }

    for name in &def.inputs {
        if inputs.contains_key(name) {
            continue;
        }
        if let Some(value) = project.user_constraints.get(name) {
            inputs.insert(name.clone(), value.clone());
            continue;
        }
        // An input named after an agent resolves to that agent's full output.
        if registry.contains(name) {
            if let Some(output) = project
                .agent_state(name)
                .and_then(|state| state.current_output.as_ref())
            {
                inputs.insert(name.clone(), Value::Object(output.content.clone()));
                continue;
            }
        }
        if let Some(value) = lookup_produced_key(project, name) {
            inputs.insert(name.clone(), value);
        }
    }

    inputs
}

fn lookup_produced_key(project: &Project, key: &str) -> Option<Value> {
    let producer = project.output_index.get(key)?;
    project
        .agent_state(producer)
        .and_then(|state| state.current_output.as_ref())
        .and_then(|output| output.content.get(key))
        .cloned()
}

/// Record the keys an agent just produced. The index keeps the first
/// producer in the lowest layer, so lookups are O(1) without re-scanning the
/// whole project on every `gather_inputs` call.
pub fn index_produced_keys(project: &mut Project, registry: &Registry, agent_id: &str) {
    let Some(layer) = registry.get(agent_id).map(|def| def.layer) else {
        return;
    };
    let keys: Vec<String> = project
        .agent_state(agent_id)
        .and_then(|state| state.current_output.as_ref())
        .map(|output| output.content.keys().cloned().collect())
        .unwrap_or_default();
    for key in keys {
        let replace = match project.output_index.get(&key) {
            None => true,
            Some(existing) => {
                let existing_layer = registry
                    .get(existing)
                    .map(|def| def.layer)
                    .unwrap_or(i64::MAX);
                layer < existing_layer
            }
        };
        if replace {
            project.output_index.insert(key, agent_id.to_string());
        }
    }
}

/// Rebuild the produced-key index from scratch (after import or reset).
pub fn rebuild_output_index(project: &mut Project, registry: &Registry) {
    project.output_index.clear();
    let mut producers: Vec<String> = registry
        .agents()
        .map(|def| def.agent_id.clone())
        .collect();
    // Stable sort keeps declaration order within a layer, so the first
    // producer in the lowest layer wins.
    producers.sort_by_key(|id| registry.get(id).map(|def| def.layer).unwrap_or(i64::MAX));
    for agent_id in producers {
        let has_output = project
            .agent_state(&agent_id)
            .is_some_and(|state| state.current_output.is_some());
        if !has_output {
            continue;
        }
        let keys: Vec<String> = project
            .agent_state(&agent_id)
            .and_then(|state| state.current_output.as_ref())
            .map(|output| output.content.keys().cloned().collect())
            .unwrap_or_default();
        for key in keys {
            project
                .output_index
                .entry(key)
                .or_insert_with(|| agent_id.clone());
        }
    }
}
