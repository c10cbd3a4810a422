use crate::domain::{ChangeType, Correction, Draft, DraftStatus, PromptMetrics};
use crate::store::{Store, StoreError};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

pub const RECENT_CORRECTIONS: usize = 200;
pub const RECENT_DRAFTS: usize = 500;
const PATTERN_EXAMPLE_CAP: usize = 5;
const SUGGESTION_MIN_CORRECTION_RATE: u64 = 10;
const HIGH_CONFIDENCE_COUNT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternExample {
    pub draft_id: String,
    #[serde(default)]
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrectionPattern {
    pub change_type: ChangeType,
    pub count: usize,
    /// Share of this agent's corrections, rounded percent.
    pub percentage: u64,
    pub examples: Vec<PatternExample>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub agent_type: String,
    pub kind: String,
    pub text: String,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInsight {
    pub agent_type: String,
    pub corrections: usize,
    pub drafts: usize,
    /// round(100 * corrections / drafts).
    pub correction_rate: u64,
    pub patterns: Vec<CorrectionPattern>,
    pub suggestions: Vec<Suggestion>,
}

/// Pattern extraction over the recent correction and draft windows, grouped
/// by the agent type recorded in each draft's metadata.
pub fn analyse(store: &Store) -> Result<Vec<AgentInsight>, StoreError> {
    let corrections = store.recent_corrections(RECENT_CORRECTIONS)?;
    let drafts = store.recent_drafts(RECENT_DRAFTS)?;
    Ok(analyse_records(&corrections, &drafts))
}

pub fn analyse_records(corrections: &[Correction], drafts: &[Draft]) -> Vec<AgentInsight> {
    let draft_agent: BTreeMap<&str, &str> = drafts
        .iter()
        .map(|draft| (draft.id.as_str(), agent_type_of(draft)))
        .collect();

    let mut drafts_per_agent: BTreeMap<&str, usize> = BTreeMap::new();
    for draft in drafts {
        *drafts_per_agent.entry(agent_type_of(draft)).or_default() += 1;
    }

    let mut corrections_per_agent: BTreeMap<&str, Vec<&Correction>> = BTreeMap::new();
    for correction in corrections {
        let Some(agent_type) = draft_agent.get(correction.draft_id.as_str()).copied() else {
            continue;
        };
        corrections_per_agent
            .entry(agent_type)
            .or_default()
            .push(correction);
    }

    let mut insights = Vec::new();
    for (agent_type, agent_corrections) in corrections_per_agent {
        let draft_count = drafts_per_agent.get(agent_type).copied().unwrap_or(0);
        if draft_count == 0 {
            continue;
        }
        let correction_rate = rounded_percent(agent_corrections.len(), draft_count);
        let patterns = build_patterns(&agent_corrections);
        let suggestions = build_suggestions(agent_type, correction_rate, &patterns);
        insights.push(AgentInsight {
            agent_type: agent_type.to_string(),
            corrections: agent_corrections.len(),
            drafts: draft_count,
            correction_rate,
            patterns,
            suggestions,
        });
    }
    insights
}

fn build_patterns(corrections: &[&Correction]) -> Vec<CorrectionPattern> {
    let mut grouped: BTreeMap<&'static str, (ChangeType, Vec<&Correction>)> = BTreeMap::new();
    for correction in corrections {
        grouped
            .entry(correction.change_type.as_str())
            .or_insert_with(|| (correction.change_type, Vec::new()))
            .1
            .push(correction);
    }

    grouped
        .into_values()
        .map(|(change_type, members)| CorrectionPattern {
            change_type,
            count: members.len(),
            percentage: rounded_percent(members.len(), corrections.len()),
            examples: members
                .iter()
                .take(PATTERN_EXAMPLE_CAP)
                .map(|correction| PatternExample {
                    draft_id: correction.draft_id.clone(),
                    feedback: correction.feedback.clone(),
                })
                .collect(),
        })
        .collect()
}

fn build_suggestions(
    agent_type: &str,
    correction_rate: u64,
    patterns: &[CorrectionPattern],
) -> Vec<Suggestion> {
    if correction_rate < SUGGESTION_MIN_CORRECTION_RATE {
        return Vec::new();
    }

    let mut suggestions = Vec::new();
    let count_of = |change_type: ChangeType| {
        patterns
            .iter()
            .find(|pattern| pattern.change_type == change_type)
            .map(|pattern| pattern.count)
            .unwrap_or(0)
    };
    let confidence_for = |count: usize| {
        if count >= HIGH_CONFIDENCE_COUNT {
            Confidence::High
        } else {
            Confidence::Medium
        }
    };

    let tone = count_of(ChangeType::ToneChange);
    if tone >= 2 {
        suggestions.push(Suggestion {
            agent_type: agent_type.to_string(),
            kind: "tone-guidance".to_string(),
            text: format!(
                "Reviewers adjusted tone on {tone} recent drafts; add explicit tone guidance to the {agent_type} prompt."
            ),
            confidence: confidence_for(tone),
        });
    }

    let rewrites = count_of(ChangeType::MajorRewrite);
    if rewrites >= 2 {
        suggestions.push(Suggestion {
            agent_type: agent_type.to_string(),
            kind: "structural-review".to_string(),
            text: format!(
                "{rewrites} recent drafts were rewritten wholesale; review the response structure the {agent_type} prompt asks for."
            ),
            confidence: confidence_for(rewrites),
        });
    }

    let rejection_pct = patterns
        .iter()
        .find(|pattern| pattern.change_type == ChangeType::Rejection)
        .map(|pattern| pattern.percentage)
        .unwrap_or(0);
    if rejection_pct >= 20 {
        suggestions.push(Suggestion {
            agent_type: agent_type.to_string(),
            kind: "fundamental-rewrite".to_string(),
            text: format!(
                "{rejection_pct}% of corrections are outright rejections; the {agent_type} prompt likely needs a fundamental rewrite."
            ),
            confidence: Confidence::High,
        });
    }

    if correction_rate >= 50 && suggestions.is_empty() {
        suggestions.push(Suggestion {
            agent_type: agent_type.to_string(),
            kind: "general-clarity".to_string(),
            text: format!(
                "Over half of {agent_type} drafts need correction; tighten the prompt's instructions and examples."
            ),
            confidence: Confidence::Medium,
        });
    }

    suggestions
}

/// Recompute the active prompt's rolling metrics from the recent draft window.
pub fn update_prompt_metrics(
    store: &Store,
    agent_type: &str,
) -> Result<Option<PromptMetrics>, StoreError> {
    let prompt_name = format!("{agent_type}-system-prompt");
    let Some(active) = store.active_prompt_version(&prompt_name)? else {
        return Ok(None);
    };

    let drafts = store.recent_drafts(RECENT_DRAFTS)?;
    let agent_drafts: Vec<&Draft> = drafts
        .iter()
        .filter(|draft| agent_type_of(draft) == agent_type)
        .collect();

    let usage_count = agent_drafts.len() as u64;
    let positive_rating = agent_drafts
        .iter()
        .filter(|draft| matches!(draft.status, DraftStatus::Approved | DraftStatus::Sent))
        .count() as u64;
    let negative_rating = agent_drafts
        .iter()
        .filter(|draft| draft.status == DraftStatus::Rejected)
        .count() as u64;
    let corrected = agent_drafts
        .iter()
        .filter(|draft| {
            matches!(
                draft.status,
                DraftStatus::EditedAndSent | DraftStatus::Rejected
            )
        })
        .count();

    let metrics = PromptMetrics {
        usage_count,
        positive_rating,
        negative_rating,
        avg_duration_ms: active.metrics.as_ref().and_then(|m| m.avg_duration_ms),
        correction_rate: Some(rounded_percent(corrected, agent_drafts.len().max(1))),
    };
    store.update_prompt_metrics(&active.id, &metrics)?;
    Ok(Some(metrics))
}

fn agent_type_of(draft: &Draft) -> &str {
    draft
        .metadata
        .get("agentType")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
}

fn rounded_percent(part: usize, whole: usize) -> u64 {
    if whole == 0 {
        return 0;
    }
    ((100.0 * part as f64 / whole as f64).round()) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::open_temp_store;
    use crate::store::{NewCorrection, NewDraft, NewPromptVersion};
    use crate::domain::TaskPriority;
    use serde_json::Map;

    fn draft_for(store: &Store, agent_type: &str) -> Draft {
        let mut metadata = Map::new();
        metadata.insert("agentType".to_string(), Value::from(agent_type));
        store
            .insert_draft(&NewDraft {
                task_id: "task-1".to_string(),
                source_message_id: None,
                channel: "email".to_string(),
                to: vec!["someone@example.com".to_string()],
                cc: Vec::new(),
                subject: "Re: question".to_string(),
                body: "a perfectly reasonable draft body".to_string(),
                priority: TaskPriority::Normal,
                conductor_notes: None,
                metadata,
            })
            .expect("draft")
    }

    fn correction_for(store: &Store, draft: &Draft, change_type: ChangeType) {
        store
            .insert_correction(&NewCorrection {
                draft_id: draft.id.clone(),
                task_id: draft.task_id.clone(),
                original_body: draft.original_body.clone(),
                edited_body: if change_type == ChangeType::Rejection {
                    String::new()
                } else {
                    "edited".to_string()
                },
                edited_subject: None,
                change_type,
                feedback: Some("softer wording please".to_string()),
            })
            .expect("correction");
    }

    #[test]
    fn patterns_group_by_change_type_with_capped_examples() {
        let (_tmp, store) = open_temp_store();
        let drafts: Vec<Draft> = (0..8).map(|_| draft_for(&store, "billing-email")).collect();
        for draft in &drafts[..7] {
            correction_for(&store, draft, ChangeType::ToneChange);
        }
        correction_for(&store, &drafts[7], ChangeType::MinorEdit);

        let insights = analyse(&store).expect("analyse");
        assert_eq!(insights.len(), 1);
        let insight = &insights[0];
        assert_eq!(insight.agent_type, "billing-email");
        assert_eq!(insight.correction_rate, 100);

        let tone = insight
            .patterns
            .iter()
            .find(|p| p.change_type == ChangeType::ToneChange)
            .expect("tone pattern");
        assert_eq!(tone.count, 7);
        assert_eq!(tone.percentage, 88);
        assert_eq!(tone.examples.len(), 5);
    }

    #[test]
    fn suggestions_follow_the_threshold_ladder() {
        let (_tmp, store) = open_temp_store();
        let drafts: Vec<Draft> = (0..10).map(|_| draft_for(&store, "billing-email")).collect();
        for draft in &drafts[..5] {
            correction_for(&store, draft, ChangeType::ToneChange);
        }
        correction_for(&store, &drafts[5], ChangeType::Rejection);
        correction_for(&store, &drafts[6], ChangeType::Rejection);

        let insights = analyse(&store).expect("analyse");
        let suggestions = &insights[0].suggestions;

        let tone = suggestions
            .iter()
            .find(|s| s.kind == "tone-guidance")
            .expect("tone suggestion");
        assert_eq!(tone.confidence, Confidence::High);

        // 2 of 7 corrections are rejections: 29% >= 20.
        assert!(suggestions.iter().any(|s| s.kind == "fundamental-rewrite"));
    }

    #[test]
    fn low_correction_rate_produces_no_suggestions() {
        let (_tmp, store) = open_temp_store();
        let drafts: Vec<Draft> = (0..30).map(|_| draft_for(&store, "billing-email")).collect();
        correction_for(&store, &drafts[0], ChangeType::ToneChange);
        correction_for(&store, &drafts[1], ChangeType::ToneChange);

        let insights = analyse(&store).expect("analyse");
        // 2 of 30 is a 7% correction rate, below the suggestion floor.
        assert_eq!(insights[0].correction_rate, 7);
        assert!(insights[0].suggestions.is_empty());
    }

    #[test]
    fn general_clarity_fires_only_without_earlier_suggestions() {
        let (_tmp, store) = open_temp_store();
        let drafts: Vec<Draft> = (0..4).map(|_| draft_for(&store, "billing-email")).collect();
        correction_for(&store, &drafts[0], ChangeType::MinorEdit);
        correction_for(&store, &drafts[1], ChangeType::MinorEdit);
        correction_for(&store, &drafts[2], ChangeType::FactualFix);

        let insights = analyse(&store).expect("analyse");
        let suggestions = &insights[0].suggestions;
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].kind, "general-clarity");
        assert_eq!(suggestions[0].confidence, Confidence::Medium);
    }

    #[test]
    fn prompt_metrics_recompute_from_draft_statuses() {
        let (_tmp, store) = open_temp_store();
        let version = store
            .insert_prompt_version(&NewPromptVersion {
                name: "billing-email-system-prompt".to_string(),
                content: "be precise".to_string(),
            })
            .expect("prompt");
        store
            .activate_prompt_version(&version.id)
            .expect("activate");

        let approved = draft_for(&store, "billing-email");
        store
            .update_draft_status(&approved.id, DraftStatus::Approved, Some("ops"))
            .expect("approve");
        let rejected = draft_for(&store, "billing-email");
        store
            .update_draft_status(&rejected.id, DraftStatus::Rejected, Some("ops"))
            .expect("reject");
        let edited = draft_for(&store, "billing-email");
        store
            .update_draft_status(&edited.id, DraftStatus::EditedAndSent, Some("ops"))
            .expect("edit");
        let _pending = draft_for(&store, "billing-email");

        let metrics = update_prompt_metrics(&store, "billing-email")
            .expect("update")
            .expect("metrics");
        assert_eq!(metrics.usage_count, 4);
        assert_eq!(metrics.positive_rating, 1);
        assert_eq!(metrics.negative_rating, 1);
        assert_eq!(metrics.correction_rate, Some(50));
    }

    #[test]
    fn missing_active_prompt_is_not_an_error() {
        let (_tmp, store) = open_temp_store();
        let metrics = update_prompt_metrics(&store, "urgent-email").expect("update");
        assert!(metrics.is_none());
    }
}
