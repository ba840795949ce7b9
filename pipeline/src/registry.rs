//! Static agent definitions and their dependency ordering.
//!
//! A [`Registry`] is pure data validated once at construction: unknown or
//! cyclic dependencies are programming errors and fail fast, not at runtime.
//! It is built in `main` (or a test) and passed by reference into the
//! orchestrator and job manager.

use std::collections::{HashMap, HashSet};

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};

/// Immutable definition of one agent in the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub agent_id: String,
    /// Topological tier; must be >= the layer of every dependency.
    pub layer: i64,
    /// Named upstream keys this agent wants resolved into its inputs.
    pub inputs: Vec<String>,
    /// Named keys this agent must produce.
    pub outputs: Vec<String>,
    /// Agent ids that must reach `passed` before this agent may run.
    pub dependencies: Vec<String>,
    pub retry_limit: u32,
}

/// Validated collection of agent definitions.
#[derive(Debug, Clone)]
pub struct Registry {
    agents: Vec<AgentDefinition>,
    by_id: HashMap<String, usize>,
    order: Vec<String>,
}

impl Registry {
    /// Build a registry, validating the dependency graph.
    ///
    /// Fails on duplicate ids, unknown dependency ids, zero retry limits,
    /// layer inversions (an agent below one of its dependencies), and cycles.
    pub fn new(agents: Vec<AgentDefinition>) -> Result<Self> {
        let mut by_id = HashMap::new();
        for (index, agent) in agents.iter().enumerate() {
            if by_id.insert(agent.agent_id.clone(), index).is_some() {
                bail!("duplicate agent id '{}'", agent.agent_id);
            }
            if agent.retry_limit == 0 {
                bail!("agent '{}' has retry_limit 0", agent.agent_id);
            }
        }
        for agent in &agents {
            for dep in &agent.dependencies {
                let dep_index = by_id
                    .get(dep)
                    .ok_or_else(|| anyhow!("agent '{}' depends on unknown '{dep}'", agent.agent_id))?;
                let dep_layer = agents[*dep_index].layer;
                if dep_layer > agent.layer {
                    bail!(
                        "agent '{}' (layer {}) depends on '{dep}' in later layer {dep_layer}",
                        agent.agent_id,
                        agent.layer
                    );
                }
            }
        }
        let order = execution_order(&agents)?;
        Ok(Self {
            agents,
            by_id,
            order,
        })
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentDefinition> {
        self.by_id.get(agent_id).map(|index| &self.agents[*index])
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.by_id.contains_key(agent_id)
    }

    /// Definitions in declaration order.
    pub fn agents(&self) -> impl Iterator<Item = &AgentDefinition> {
        self.agents.iter()
    }

    /// Agent ids in dependency order: every dependency precedes its
    /// dependents, ties broken by declaration order.
    pub fn execution_order(&self) -> &[String] {
        &self.order
    }

    /// Distinct layer ids, ascending.
    pub fn layer_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .agents
            .iter()
            .map(|agent| agent.layer)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn agents_in_layer(&self, layer: i64) -> impl Iterator<Item = &AgentDefinition> {
        self.agents.iter().filter(move |agent| agent.layer == layer)
    }

    /// The built-in manuscript development pipeline.
    pub fn book_pipeline() -> Result<Self> {
        Self::new(book_pipeline_definitions())
    }
}

/// Topological sort over declaration order; errors on cycles.
fn execution_order(agents: &[AgentDefinition]) -> Result<Vec<String>> {
    let mut placed: HashSet<&str> = HashSet::new();
    let mut order = Vec::with_capacity(agents.len());
    while order.len() < agents.len() {
        let next = agents.iter().find(|agent| {
            !placed.contains(agent.agent_id.as_str())
                && agent
                    .dependencies
                    .iter()
                    .all(|dep| placed.contains(dep.as_str()))
        });
        match next {
            Some(agent) => {
                placed.insert(agent.agent_id.as_str());
                order.push(agent.agent_id.clone());
            }
            None => {
                let mut stuck: Vec<&str> = agents
                    .iter()
                    .map(|agent| agent.agent_id.as_str())
                    .filter(|id| !placed.contains(id))
                    .collect();
                stuck.sort_unstable();
                bail!("dependency cycle among agents: {}", stuck.join(", "));
            }
        }
    }
    Ok(order)
}

fn def(
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

fn book_pipeline_definitions() -> Vec<AgentDefinition> {
    vec![
        def(
            "market_intelligence",
            0,
            &[],
            &["user_constraints", "genre", "comparable_titles"],
            &["reader_avatar", "market_gap", "positioning_angle", "comp_analysis"],
        ),
        def(
            "concept_definition",
            1,
            &["market_intelligence"],
            &["market_gap", "positioning_angle"],
            &["one_line_hook", "core_promise", "unique_engine", "elevator_pitch"],
        ),
        def(
            "thematic_architecture",
            2,
            &["concept_definition"],
            &["core_promise", "unique_engine"],
            &["primary_theme", "counter_theme", "value_conflict", "thematic_question"],
        ),
        def(
            "story_question",
            3,
            &["thematic_architecture"],
            &["primary_theme", "value_conflict", "core_promise"],
            &["central_dramatic_question", "stakes_ladder", "binary_outcome"],
        ),
        def(
            "world_rules",
            4,
            &["story_question"],
            &["central_dramatic_question", "genre", "user_constraints"],
            &["physical_rules", "social_rules", "power_rules", "world_bible", "constraint_list"],
        ),
        def(
            "character_architecture",
            5,
            &["world_rules"],
            &["primary_theme", "central_dramatic_question", "world_rules"],
            &[
                "protagonist_profile",
                "protagonist_arc",
                "antagonist_profile",
                "supporting_cast",
            ],
        ),
        def(
            "relationship_dynamics",
            6,
            &["character_architecture"],
            &["character_architecture", "primary_theme", "value_conflict"],
            &["conflict_web", "power_shifts", "relationship_matrix"],
        ),
        def(
            "story_bible",
            6,
            &["relationship_dynamics"],
            &["character_architecture", "world_rules", "relationship_dynamics"],
            &[
                "character_registry",
                "location_registry",
                "timeline",
                "terminology",
                "consistency_rules",
            ],
        ),
        def(
            "plot_structure",
            7,
            &["relationship_dynamics"],
            &["central_dramatic_question", "protagonist_arc", "relationship_dynamics"],
            &["act_structure", "major_beats", "reversals", "climax_design", "resolution"],
        ),
        def(
            "pacing_design",
            8,
            &["plot_structure"],
            &["plot_structure", "act_structure", "genre"],
            &["tension_curve", "scene_density_map", "breather_points"],
        ),
        def(
            "chapter_blueprint",
            9,
            &["pacing_design"],
            &["plot_structure", "pacing_design", "character_architecture"],
            &["chapter_outline", "chapter_goals", "scene_list", "hooks", "pov_assignments"],
        ),
        def(
            "voice_specification",
            10,
            &["chapter_blueprint"],
            &["genre", "reader_avatar", "protagonist_profile", "user_constraints"],
            &["narrative_voice", "pov_rules", "tense_rules", "dialogue_style", "style_guide"],
        ),
        def(
            "draft_generation",
            11,
            &["voice_specification"],
            &[
                "chapter_blueprint",
                "voice_specification",
                "character_architecture",
                "world_rules",
                "style_guide",
            ],
            &["chapters", "chapter_metadata", "outline_adherence", "deviations", "fix_plan"],
        ),
        def(
            "continuity_audit",
            12,
            &["draft_generation"],
            &["chapters", "world_rules", "character_architecture", "chapter_blueprint"],
            &["timeline_check", "character_logic_check", "world_rule_check", "continuity_report"],
        ),
        def(
            "emotional_validation",
            12,
            &["continuity_audit"],
            &["chapters", "protagonist_arc", "stakes_ladder", "tension_curve"],
            &["scene_resonance_scores", "arc_fulfillment_check", "emotional_peaks_map"],
        ),
        def(
            "structural_rewrite",
            13,
            &["emotional_validation"],
            &["chapters", "continuity_audit", "emotional_validation"],
            &["revised_chapters", "revision_log", "resolved_flags"],
        ),
        def(
            "line_edit",
            14,
            &["structural_rewrite"],
            &["revised_chapters", "style_guide"],
            &["edited_chapters", "grammar_fixes", "edit_report"],
        ),
        def(
            "human_editor_review",
            15,
            &["line_edit"],
            &["edited_chapters", "voice_specification", "chapter_blueprint", "user_constraints"],
            &["approved", "confidence", "editorial_letter", "required_changes"],
        ),
        def(
            "production_readiness",
            15,
            &["human_editor_review"],
            &["edited_chapters", "user_constraints"],
            &["quality_score", "release_blockers", "major_issues", "minor_issues", "recommended_actions"],
        ),
        def(
            "publishing_package",
            16,
            &["production_readiness"],
            &["edited_chapters", "core_promise", "reader_avatar", "positioning_angle"],
            &["blurb", "synopsis", "metadata", "keywords", "author_bio"],
        ),
    ]
}
