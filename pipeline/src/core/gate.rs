//! Quality gate for agent outputs.
//!
//! Validation runs in a fixed order, short-circuiting on the first failure:
//! placeholder bypass, required output keys, JSON Schema shape check, then
//! per-agent semantic rules over the typed content. Structural (schema) and
//! semantic (domain invariant) checks stay separate so new agents can gain
//! schema coverage independently of bespoke sanity rules.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use jsonschema::{Draft, Validator};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::core::content::{
    AgentContent, ChapterBlueprint, DraftGeneration, HumanEditorReview, ProductionReadiness,
    VoiceSpecification,
};
use crate::core::state::GateResult;

/// Scene word-target sums may drift from the chapter target by this fraction.
const SCENE_SUM_TOLERANCE_PCT: i64 = 35;
/// Adherence scores below this require explicit deviations.
const LOW_ADHERENCE_SCORE: i64 = 80;
/// Release readiness scores below this require substantiating detail.
const RELEASE_SCORE_FLOOR: i64 = 85;

const CHAPTER_BLUEPRINT_SCHEMA: &str = include_str!("../../schemas/chapter_blueprint.schema.json");
const VOICE_SPECIFICATION_SCHEMA: &str =
    include_str!("../../schemas/voice_specification.schema.json");
const DRAFT_GENERATION_SCHEMA: &str = include_str!("../../schemas/draft_generation.schema.json");
const HUMAN_EDITOR_REVIEW_SCHEMA: &str =
    include_str!("../../schemas/human_editor_review.schema.json");
const PRODUCTION_READINESS_SCHEMA: &str =
    include_str!("../../schemas/production_readiness.schema.json");

/// Gate outcome plus the normalized (schema-coerced) content to store.
#[derive(Debug, Clone)]
pub struct Validated {
    pub gate: GateResult,
    pub content: Map<String, Value>,
}

/// Compiled schema validators for every agent with a registered shape.
pub struct GateValidator {
    validators: HashMap<&'static str, Validator>,
}

impl GateValidator {
    /// Compile the embedded schemas. Failure is a build defect, caught at
    /// process start.
    pub fn new() -> Result<Self> {
        let mut validators = HashMap::new();
        for (agent_id, raw) in [
            ("chapter_blueprint", CHAPTER_BLUEPRINT_SCHEMA),
            ("voice_specification", VOICE_SPECIFICATION_SCHEMA),
            ("draft_generation", DRAFT_GENERATION_SCHEMA),
            ("human_editor_review", HUMAN_EDITOR_REVIEW_SCHEMA),
            ("production_readiness", PRODUCTION_READINESS_SCHEMA),
        ] {
            let schema: Value = serde_json::from_str(raw)
                .with_context(|| format!("parse schema for {agent_id}"))?;
            let validator = jsonschema::options()
                .with_draft(Draft::Draft202012)
                .build(&schema)
                .with_context(|| format!("compile schema for {agent_id}"))?;
            validators.insert(agent_id, validator);
        }
        Ok(Self { validators })
    }

    /// Validate one agent's output against its declared outputs, registered
    /// schema, and semantic rules.
    pub fn validate(
        &self,
        agent_id: &str,
        content: &Map<String, Value>,
        expected_outputs: &[String],
    ) -> Validated {
        // Placeholder outputs come from runs with no generation backend
        // attached; the scheduler must still be able to advance through them.
        if content.get("_status").and_then(Value::as_str) == Some("placeholder") {
            let mut details = Map::new();
            details.insert("placeholder".to_string(), Value::Bool(true));
            return Validated {
                gate: GateResult::pass("gate bypassed: placeholder output", details),
                content: content.clone(),
            };
        }

        let missing: Vec<String> = expected_outputs
            .iter()
            .filter(|key| !content.contains_key(*key))
            .cloned()
            .collect();
        if !missing.is_empty() {
            let mut details = Map::new();
            details.insert("missing".to_string(), json!(missing));
            return Validated {
                gate: GateResult::fail(
                    format!("missing required outputs: {}", missing.join(", ")),
                    details,
                ),
                content: content.clone(),
            };
        }

        let mut details = Map::new();
        if let Some(validator) = self.validators.get(agent_id) {
            let instance = Value::Object(content.clone());
            let violations: Vec<Value> = validator
                .iter_errors(&instance)
                .map(|err| {
                    json!({
                        "path": err.instance_path.to_string(),
                        "message": err.to_string(),
                        "kind": violation_kind(&format!("{:?}", err.kind)),
                    })
                })
                .collect();
            if !violations.is_empty() {
                debug!(agent_id, violations = violations.len(), "schema validation failed");
                let mut details = Map::new();
                details.insert("schema_errors".to_string(), Value::Array(violations));
                return Validated {
                    gate: GateResult::fail("output failed schema validation", details),
                    content: content.clone(),
                };
            }
            details.insert("schema".to_string(), json!("jsonschema"));
        }

        let parsed = match AgentContent::parse(agent_id, content) {
            Ok(parsed) => parsed,
            Err(err) => {
                let mut details = Map::new();
                details.insert("errors".to_string(), json!([{"msg": err.to_string()}]));
                return Validated {
                    gate: GateResult::fail("output does not match the expected structure", details),
                    content: content.clone(),
                };
            }
        };

        let normalized = match parsed {
            AgentContent::ChapterBlueprint(blueprint) => {
                if let Some(gate) = check_chapter_blueprint(&blueprint) {
                    return Validated {
                        gate,
                        content: content.clone(),
                    };
                }
                AgentContent::ChapterBlueprint(blueprint).into_map()
            }
            AgentContent::VoiceSpecification(voice) => {
                if let Some(gate) = check_voice_specification(&voice) {
                    return Validated {
                        gate,
                        content: content.clone(),
                    };
                }
                AgentContent::VoiceSpecification(voice).into_map()
            }
            AgentContent::DraftGeneration(mut draft) => {
                if let Some(gate) = check_and_repair_draft(&mut draft) {
                    return Validated {
                        gate,
                        content: content.clone(),
                    };
                }
                AgentContent::DraftGeneration(draft).into_map()
            }
            AgentContent::HumanEditorReview(review) => {
                if let Some(gate) = check_editor_review(&review) {
                    return Validated {
                        gate,
                        content: content.clone(),
                    };
                }
                AgentContent::HumanEditorReview(review).into_map()
            }
            AgentContent::ProductionReadiness(readiness) => {
                if let Some(gate) = check_production_readiness(&readiness) {
                    return Validated {
                        gate,
                        content: content.clone(),
                    };
                }
                AgentContent::ProductionReadiness(readiness).into_map()
            }
            AgentContent::Untyped(map) => map,
        };

        let keys: Vec<&String> = normalized.keys().collect();
        details.insert("validated_keys".to_string(), json!(keys));
        Validated {
            gate: GateResult::pass("gate passed", details),
            content: normalized,
        }
    }
}

/// Short label for a violation: the variant name of the error kind.
fn violation_kind(kind_debug: &str) -> String {
    kind_debug
        .split(|c: char| c == ' ' || c == '(' || c == '{')
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or("schema")
        .to_string()
}

fn fail_with_errors(message: impl Into<String>, errors: Value) -> GateResult {
    let mut details = Map::new();
    details.insert("errors".to_string(), errors);
    GateResult::fail(message, details)
}

/// Chapter numbers must be unique and contiguous from their minimum, and
/// scene word targets must roughly sum to the chapter target.
fn check_chapter_blueprint(blueprint: &ChapterBlueprint) -> Option<GateResult> {
    let numbers: Vec<i64> = blueprint
        .chapter_outline
        .iter()
        .map(|chapter| chapter.number)
        .collect();
    if numbers.is_empty() {
        return Some(fail_with_errors(
            "chapter outline is empty",
            json!([{"msg": "empty_chapter_outline"}]),
        ));
    }

    let distinct: HashSet<i64> = numbers.iter().copied().collect();
    if distinct.len() != numbers.len() {
        return Some(fail_with_errors(
            "duplicate chapter numbers found",
            json!([{"msg": "duplicate_chapter_numbers", "numbers": numbers}]),
        ));
    }

    let mut sorted = numbers.clone();
    sorted.sort_unstable();
    let start = sorted[0];
    let expected: Vec<i64> = (start..start + sorted.len() as i64).collect();
    if sorted != expected {
        return Some(fail_with_errors(
            "chapter numbers must be contiguous and increasing",
            json!([{"msg": "non_contiguous_chapter_numbers", "found": sorted, "expected": expected}]),
        ));
    }

    let mut offending = Vec::new();
    for chapter in &blueprint.chapter_outline {
        let target = chapter.word_target;
        let scene_sum: i64 = chapter.scenes.iter().map(|scene| scene.word_target).sum();
        if target > 0 && scene_sum > 0 {
            let low = target * (100 - SCENE_SUM_TOLERANCE_PCT) / 100;
            let high = target * (100 + SCENE_SUM_TOLERANCE_PCT) / 100;
            if scene_sum < low || scene_sum > high {
                offending.push(json!({
                    "chapter": chapter.number,
                    "chapter_word_target": target,
                    "scenes_sum": scene_sum,
                }));
            }
        }
    }
    if !offending.is_empty() {
        return Some(fail_with_errors(
            "scene word targets do not match their chapter targets",
            json!([{"msg": "scene_word_targets_mismatch", "chapters": offending}]),
        ));
    }
    None
}

fn check_voice_specification(voice: &VoiceSpecification) -> Option<GateResult> {
    let has_example = voice
        .style_guide
        .example_passages
        .iter()
        .any(|passage| !passage.trim().is_empty());
    if !has_example {
        return Some(fail_with_errors(
            "voice specification must include at least one non-empty example passage",
            json!([{"msg": "missing_example_passages"}]),
        ));
    }
    None
}

/// A draft that rates its own adherence low but reports no deviations is
/// under-reporting, not failing: synthesize the deviation list (and a fix
/// plan) from the per-chapter scores instead of rejecting it.
fn check_and_repair_draft(draft: &mut DraftGeneration) -> Option<GateResult> {
    if draft.chapters.is_empty() {
        return Some(fail_with_errors(
            "draft must include at least one chapter",
            json!([{"msg": "empty_chapters"}]),
        ));
    }

    let score = draft.outline_adherence.overall_score;
    if !(0..=100).contains(&score) {
        return Some(fail_with_errors(
            "outline_adherence.overall_score must be between 0 and 100",
            json!([{"msg": "bad_overall_score", "value": score}]),
        ));
    }

    if score < LOW_ADHERENCE_SCORE && draft.deviations.is_empty() {
        for (chapter, chapter_score) in &draft.outline_adherence.chapter_scores {
            if *chapter_score < LOW_ADHERENCE_SCORE {
                draft.deviations.push(crate::core::content::Deviation {
                    chapter: chapter.clone(),
                    severity: if *chapter_score < 60 { "major" } else { "minor" }.to_string(),
                    description: format!(
                        "chapter {chapter} scored {chapter_score}/100 on outline adherence"
                    ),
                    suggested_fix: format!(
                        "review chapter {chapter} against its blueprint and revise deviating scenes"
                    ),
                    extra: Map::new(),
                });
            }
        }
    }

    if !draft.deviations.is_empty() && draft.fix_plan.is_empty() {
        draft.fix_plan = draft
            .deviations
            .iter()
            .take(12)
            .map(|deviation| {
                let action = if deviation.suggested_fix.is_empty() {
                    &deviation.description
                } else {
                    &deviation.suggested_fix
                };
                format!("chapter {}: {action}", deviation.chapter)
            })
            .collect();
    }
    None
}

/// An approval with outstanding required changes, or a rejection without any,
/// is itself invalid: sign-off must be substantiated either way.
fn check_editor_review(review: &HumanEditorReview) -> Option<GateResult> {
    if !review.approved && review.required_changes.is_empty() {
        return Some(fail_with_errors(
            "a rejection must list at least one required change",
            json!([{"msg": "not_approved_without_required_changes"}]),
        ));
    }
    if review.approved && !review.required_changes.is_empty() {
        return Some(fail_with_errors(
            "an approval must not carry outstanding required changes",
            json!([{"msg": "approved_with_required_changes"}]),
        ));
    }
    None
}

fn check_production_readiness(readiness: &ProductionReadiness) -> Option<GateResult> {
    if readiness.quality_score < RELEASE_SCORE_FLOOR
        && readiness.release_blockers.is_empty()
        && readiness.recommended_actions.is_empty()
    {
        return Some(fail_with_errors(
            "quality score below threshold without release blockers or recommended actions",
            json!([{"msg": "low_score_without_blockers", "quality_score": readiness.quality_score}]),
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator() -> GateValidator {
        GateValidator::new().expect("compile gate schemas")
    }

    fn as_map(value: Value) -> Map<String, Value> {
        value.as_object().expect("object").clone()
    }

    fn outputs(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn blueprint_content(numbers: &[i64]) -> Map<String, Value> {
        let outline: Vec<Value> = numbers
            .iter()
            .map(|number| {
                json!({
                    "number": number,
                    "word_target": 3000,
                    "scenes": [{"word_target": 1500}, {"word_target": 1500}],
                })
            })
            .collect();
        as_map(json!({"chapter_outline": outline}))
    }

    #[test]
    fn placeholder_output_bypasses_validation() {
        let content = as_map(json!({"_status": "placeholder", "_agent": "world_rules"}));
        let validated = validator().validate("world_rules", &content, &outputs(&["world_bible"]));
        assert!(validated.gate.passed);
        assert_eq!(validated.gate.details.get("placeholder"), Some(&json!(true)));
    }

    #[test]
    fn missing_required_outputs_are_listed() {
        let content = as_map(json!({"reader_avatar": {}}));
        let validated = validator().validate(
            "market_intelligence",
            &content,
            &outputs(&["reader_avatar", "market_gap"]),
        );
        assert!(!validated.gate.passed);
        assert!(validated.gate.message.contains("market_gap"));
        assert_eq!(validated.gate.details.get("missing"), Some(&json!(["market_gap"])));
    }

    #[test]
    fn schema_violations_carry_instance_paths() {
        let content = as_map(json!({"chapter_outline": [{"number": "one"}]}));
        let validated =
            validator().validate("chapter_blueprint", &content, &outputs(&["chapter_outline"]));
        assert!(!validated.gate.passed);
        let errors = validated
            .gate
            .details
            .get("schema_errors")
            .and_then(Value::as_array)
            .expect("schema_errors");
        assert!(!errors.is_empty());
        let path = errors[0].get("path").and_then(Value::as_str).expect("path");
        assert!(path.contains("chapter_outline"), "path was {path}");
    }

    #[test]
    fn contiguous_chapter_numbers_pass() {
        let content = blueprint_content(&[1, 2, 3]);
        let validated =
            validator().validate("chapter_blueprint", &content, &outputs(&["chapter_outline"]));
        assert!(validated.gate.passed, "{}", validated.gate.message);
    }

    #[test]
    fn gapped_chapter_numbers_fail_as_non_contiguous() {
        let content = blueprint_content(&[1, 2, 4]);
        let validated =
            validator().validate("chapter_blueprint", &content, &outputs(&["chapter_outline"]));
        assert!(!validated.gate.passed);
        assert!(validated.gate.message.contains("contiguous"));
    }

    #[test]
    fn duplicate_chapter_numbers_fail_as_duplicates() {
        let content = blueprint_content(&[1, 1, 2]);
        let validated =
            validator().validate("chapter_blueprint", &content, &outputs(&["chapter_outline"]));
        assert!(!validated.gate.passed);
        assert!(validated.gate.message.contains("duplicate"));
    }

    #[test]
    fn scene_sums_outside_tolerance_fail() {
        let content = as_map(json!({
            "chapter_outline": [{
                "number": 1,
                "word_target": 3000,
                "scenes": [{"word_target": 500}],
            }]
        }));
        let validated =
            validator().validate("chapter_blueprint", &content, &outputs(&["chapter_outline"]));
        assert!(!validated.gate.passed);
        assert!(validated.gate.message.contains("scene word targets"));
    }

    #[test]
    fn voice_requires_a_non_empty_example_passage() {
        let content = as_map(json!({"style_guide": {"example_passages": ["  "]}}));
        let validated =
            validator().validate("voice_specification", &content, &outputs(&["style_guide"]));
        assert!(!validated.gate.passed);

        let content = as_map(json!({"style_guide": {"example_passages": ["The rain came sideways."]}}));
        let validated =
            validator().validate("voice_specification", &content, &outputs(&["style_guide"]));
        assert!(validated.gate.passed, "{}", validated.gate.message);
    }

    #[test]
    fn low_scoring_draft_without_deviations_gets_them_synthesized() {
        let content = as_map(json!({
            "chapters": [{"number": 1, "text": "Chapter one.", "word_count": 3}],
            "outline_adherence": {
                "overall_score": 70,
                "chapter_scores": {"1": 55, "2": 90},
            },
            "deviations": [],
            "fix_plan": [],
        }));
        let validated = validator().validate(
            "draft_generation",
            &content,
            &outputs(&["chapters", "outline_adherence", "deviations", "fix_plan"]),
        );
        assert!(validated.gate.passed, "{}", validated.gate.message);

        let deviations = validated
            .content
            .get("deviations")
            .and_then(Value::as_array)
            .expect("deviations");
        assert_eq!(deviations.len(), 1);
        assert_eq!(deviations[0].get("severity"), Some(&json!("major")));

        let fix_plan = validated
            .content
            .get("fix_plan")
            .and_then(Value::as_array)
            .expect("fix_plan");
        assert_eq!(fix_plan.len(), 1);
    }

    #[test]
    fn draft_with_out_of_range_score_fails() {
        let content = as_map(json!({
            "chapters": [{"number": 1, "text": "x"}],
            "outline_adherence": {"overall_score": 140},
            "deviations": [],
            "fix_plan": [],
        }));
        let validated = validator().validate(
            "draft_generation",
            &content,
            &outputs(&["chapters", "outline_adherence", "deviations", "fix_plan"]),
        );
        assert!(!validated.gate.passed);
        assert!(validated.gate.message.contains("overall_score"));
    }

    #[test]
    fn rejection_without_required_changes_fails() {
        let content = as_map(json!({
            "approved": false,
            "editorial_letter": "The middle sags badly.",
            "required_changes": [],
        }));
        let validated = validator().validate(
            "human_editor_review",
            &content,
            &outputs(&["approved", "editorial_letter", "required_changes"]),
        );
        assert!(!validated.gate.passed);
        assert!(validated.gate.message.contains("required change"));
    }

    #[test]
    fn approval_with_outstanding_changes_fails() {
        let content = as_map(json!({
            "approved": true,
            "editorial_letter": "Ready.",
            "required_changes": ["rewrite chapter 3"],
        }));
        let validated = validator().validate(
            "human_editor_review",
            &content,
            &outputs(&["approved", "editorial_letter", "required_changes"]),
        );
        assert!(!validated.gate.passed);
    }

    #[test]
    fn low_readiness_score_needs_substantiation() {
        let content = as_map(json!({
            "quality_score": 60,
            "release_blockers": [],
            "recommended_actions": [],
        }));
        let validated = validator().validate(
            "production_readiness",
            &content,
            &outputs(&["quality_score", "release_blockers", "recommended_actions"]),
        );
        assert!(!validated.gate.passed);

        let content = as_map(json!({
            "quality_score": 60,
            "release_blockers": ["manuscript incomplete"],
            "recommended_actions": [],
        }));
        let validated = validator().validate(
            "production_readiness",
            &content,
            &outputs(&["quality_score", "release_blockers", "recommended_actions"]),
        );
        assert!(validated.gate.passed, "{}", validated.gate.message);
    }

    #[test]
    fn untyped_agents_pass_with_key_summary() {
        let content = as_map(json!({"world_bible": {"culture": "river clans"}}));
        let validated = validator().validate("world_rules", &content, &outputs(&["world_bible"]));
        assert!(validated.gate.passed);
        assert_eq!(
            validated.gate.details.get("validated_keys"),
            Some(&json!(["world_bible"]))
        );
    }
}
