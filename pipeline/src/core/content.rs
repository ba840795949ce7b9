//! Typed views over agent output content.
//!
//! Agent outputs travel as untyped JSON mappings; agents with registered
//! schemas get a strongly-typed variant here, everything else falls back to
//! [`AgentContent::Untyped`]. Typed variants flatten unknown keys into
//! `extra` so normalization never drops declared-but-untyped fields.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenePlan {
    #[serde(default)]
    pub word_target: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterPlan {
    pub number: i64,
    #[serde(default)]
    pub word_target: i64,
    #[serde(default)]
    pub scenes: Vec<ScenePlan>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChapterBlueprint {
    #[serde(default)]
    pub chapter_outline: Vec<ChapterPlan>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StyleGuide {
    #[serde(default)]
    pub example_passages: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VoiceSpecification {
    #[serde(default)]
    pub style_guide: StyleGuide,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutlineAdherence {
    #[serde(default)]
    pub overall_score: i64,
    #[serde(default)]
    pub chapter_scores: BTreeMap<String, i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Deviation {
    #[serde(default)]
    pub chapter: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub suggested_fix: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DraftGeneration {
    #[serde(default)]
    pub chapters: Vec<Value>,
    #[serde(default)]
    pub outline_adherence: OutlineAdherence,
    #[serde(default)]
    pub deviations: Vec<Deviation>,
    #[serde(default)]
    pub fix_plan: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HumanEditorReview {
    #[serde(default)]
    pub approved: bool,
    #[serde(default)]
    pub required_changes: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductionReadiness {
    #[serde(default)]
    pub quality_score: i64,
    #[serde(default)]
    pub release_blockers: Vec<String>,
    #[serde(default)]
    pub recommended_actions: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Tagged union of agent content, keyed by agent id.
#[derive(Debug, Clone)]
pub enum AgentContent {
    ChapterBlueprint(ChapterBlueprint),
    VoiceSpecification(VoiceSpecification),
    DraftGeneration(DraftGeneration),
    HumanEditorReview(HumanEditorReview),
    ProductionReadiness(ProductionReadiness),
    Untyped(Map<String, Value>),
}

impl AgentContent {
    /// Parse raw content into the typed variant registered for `agent_id`,
    /// or the untyped fallback.
    pub fn parse(agent_id: &str, content: &Map<String, Value>) -> Result<Self, serde_json::Error> {
        let value = Value::Object(content.clone());
        Ok(match agent_id {
            "chapter_blueprint" => Self::ChapterBlueprint(serde_json::from_value(value)?),
            "voice_specification" => Self::VoiceSpecification(serde_json::from_value(value)?),
            "draft_generation" => Self::DraftGeneration(serde_json::from_value(value)?),
            "human_editor_review" => Self::HumanEditorReview(serde_json::from_value(value)?),
            "production_readiness" => Self::ProductionReadiness(serde_json::from_value(value)?),
            _ => Self::Untyped(content.clone()),
        })
    }

    /// Serialize back to the normalized mapping form.
    pub fn into_map(self) -> Map<String, Value> {
        let value = match self {
            Self::ChapterBlueprint(inner) => serde_json::to_value(inner),
            Self::VoiceSpecification(inner) => serde_json::to_value(inner),
            Self::DraftGeneration(inner) => serde_json::to_value(inner),
            Self::HumanEditorReview(inner) => serde_json::to_value(inner),
            Self::ProductionReadiness(inner) => serde_json::to_value(inner),
            Self::Untyped(map) => return map,
        };
        match value {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}
