//! # Epic Generation
//!
//! Clusters ranked requirements into epics. With a language model the
//! grouping is the model's, repaired so every requirement lands in exactly
//! one epic; without one, requirements are grouped by category.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};

use super::{prompts, PriorOutputs, RunContext, StageProcessor};
use crate::adapters::{complete_json, Capability, ScopedCapabilities};
use crate::error::StageError;
use crate::state::{
    Epic, EpicPlan, EpicStatus, PrioritizedRequirement, Priority, RequirementCategory,
    StagePayload,
};
use crate::workflow::Stage;

#[derive(Debug, Deserialize)]
struct ProposedEpics {
    #[serde(default)]
    epics: Vec<ProposedEpic>,
}

#[derive(Debug, Deserialize)]
struct ProposedEpic {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    requirement_ids: Vec<String>,
    #[serde(default)]
    acceptance_criteria: Vec<String>,
}

/// Epic before its id is assigned
struct Draft {
    title: String,
    description: String,
    acceptance_criteria: Vec<String>,
    requirement_ids: Vec<String>,
}

pub struct EpicGenerationProcessor;

#[async_trait]
impl StageProcessor for EpicGenerationProcessor {
    fn stage(&self) -> Stage {
        Stage::EpicGeneration
    }

    fn inputs(&self) -> &'static [Stage] {
        &[Stage::Prioritization]
    }

    #[tracing::instrument(skip_all, fields(run_id = %ctx.run_id, attempt = ctx.attempt))]
    async fn process(
        &self,
        ctx: &RunContext,
        prior: &PriorOutputs,
        caps: &ScopedCapabilities,
    ) -> Result<StagePayload, StageError> {
        let ranked = &prior.prioritization()?.ranked;
        if ranked.is_empty() {
            return Err(StageError::Permanent("no ranked requirements to plan".to_string()));
        }

        let (mut drafts, assigned) = if caps.has(Capability::LanguageModel) {
            let proposed: ProposedEpics = complete_json(
                caps,
                prompts::EPIC_PLANNER,
                &planning_prompt(ranked),
                ctx.key("llm"),
            )
            .await?;
            repair(proposed, ranked)
        } else {
            (Vec::new(), HashSet::new())
        };

        let leftovers: Vec<&PrioritizedRequirement> = ranked
            .iter()
            .filter(|r| !assigned.contains(&r.requirement.id))
            .collect();
        let fallback = group_by_category(&leftovers);
        let fallback_epics = if drafts.is_empty() { 0 } else { fallback.len() };
        drafts.extend(fallback);

        let epics = finalize(drafts, ranked);

        if caps.has(Capability::Documentation) {
            publish_outline(ctx, caps, &epics).await?;
        }

        tracing::info!(epics = epics.len(), fallback_epics, "Generated epics");
        Ok(StagePayload::EpicGeneration(EpicPlan {
            epics,
            fallback_epics,
        }))
    }
}

fn planning_prompt(ranked: &[PrioritizedRequirement]) -> String {
    let lines = ranked
        .iter()
        .map(|r| {
            format!(
                "{} [{}, {}] {}",
                r.requirement.id, r.requirement.category, r.priority.as_str(), r.requirement.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!("Ranked requirements:\n{}", lines)
}

/// Keep known ids, each in its first epic only, and drop epics left empty.
fn repair(proposed: ProposedEpics, ranked: &[PrioritizedRequirement]) -> (Vec<Draft>, HashSet<String>) {
    let known: HashSet<&str> = ranked.iter().map(|r| r.requirement.id.as_str()).collect();
    let mut assigned = HashSet::new();
    let mut drafts = Vec::new();

    for epic in proposed.epics {
        let ids: Vec<String> = epic
            .requirement_ids
            .into_iter()
            .filter(|id| known.contains(id.as_str()))
            .filter(|id| assigned.insert(id.clone()))
            .collect();
        if ids.is_empty() || epic.title.trim().is_empty() {
            continue;
        }
        drafts.push(Draft {
            title: epic.title.trim().to_string(),
            description: epic.description,
            acceptance_criteria: epic.acceptance_criteria,
            requirement_ids: ids,
        });
    }
    (drafts, assigned)
}

/// One epic per category, in order of each category's best-ranked requirement.
fn group_by_category(requirements: &[&PrioritizedRequirement]) -> Vec<Draft> {
    let mut order: Vec<RequirementCategory> = Vec::new();
    let mut groups: HashMap<RequirementCategory, Vec<&PrioritizedRequirement>> = HashMap::new();
    for r in requirements {
        let category = r.requirement.category;
        if !groups.contains_key(&category) {
            order.push(category);
        }
        groups.entry(category).or_default().push(r);
    }

    order
        .into_iter()
        .map(|category| {
            let members = groups.remove(&category).unwrap_or_default();
            Draft {
                title: format!("{} requirements", category.title()),
                description: format!(
                    "Delivers the {} {} requirement(s) gathered from the conversations.",
                    members.len(),
                    category.title().to_lowercase()
                ),
                acceptance_criteria: members
                    .iter()
                    .map(|r| format!("{} is delivered: {}", r.requirement.id, r.requirement.text))
                    .collect(),
                requirement_ids: members.iter().map(|r| r.requirement.id.clone()).collect(),
            }
        })
        .collect()
}

/// Assign ids, order member ids by rank and take the highest member priority.
fn finalize(drafts: Vec<Draft>, ranked: &[PrioritizedRequirement]) -> Vec<Epic> {
    let by_id: HashMap<&str, &PrioritizedRequirement> =
        ranked.iter().map(|r| (r.requirement.id.as_str(), r)).collect();

    drafts
        .into_iter()
        .enumerate()
        .map(|(i, draft)| {
            let mut ids = draft.requirement_ids;
            ids.sort_by_key(|id| by_id.get(id.as_str()).map(|r| r.rank).unwrap_or(u32::MAX));
            let priority = ids
                .iter()
                .filter_map(|id| by_id.get(id.as_str()).map(|r| r.priority))
                .max()
                .unwrap_or(Priority::Medium);
            Epic {
                id: format!("EPIC-{:02}", i + 1),
                title: draft.title,
                description: draft.description,
                status: EpicStatus::Backlog,
                priority,
                estimated_hours: 0,
                acceptance_criteria: draft.acceptance_criteria,
                requirement_ids: ids,
            }
        })
        .collect()
}

/// Publish the epic outline once per run. The documentation service does
/// not deduplicate, so an earlier attempt's page is looked up first.
async fn publish_outline(
    ctx: &RunContext,
    caps: &ScopedCapabilities,
    epics: &[Epic],
) -> Result<(), StageError> {
    let key = ctx.key("outline");
    let found = caps
        .invoke(
            Capability::Documentation,
            "find_page",
            json!({ "idempotency_key": key.as_str() }),
            key.clone(),
        )
        .await?;
    if !found["page"].is_null() {
        tracing::debug!(key = %key.as_str(), "Outline already published");
        return Ok(());
    }

    let content = epics
        .iter()
        .map(|e| format!("{} {} ({}): {}", e.id, e.title, e.priority.as_str(), e.requirement_ids.join(", ")))
        .collect::<Vec<_>>()
        .join("\n");
    caps.invoke(
        Capability::Documentation,
        "create_page",
        json!({
            "title": format!("Epic plan for project {}", ctx.project_id),
            "content": content,
            "idempotency_key": key.as_str(),
        }),
        key,
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AdapterError, InMemoryDocumentation, ScriptedLanguageModel};
    use crate::stages::prioritization::rank;
    use crate::stages::testing::{context, requirement, scoped};
    use crate::state::{PrioritizationOutput, ProjectSettings};
    use std::sync::Arc;

    fn prior() -> PriorOutputs {
        let ranked = rank(
            vec![
                requirement("REQ-001", "Users can reset passwords", RequirementCategory::Functional, 0.9, 1),
                requirement("REQ-002", "Single sign-on with Okta", RequirementCategory::Technical, 0.8, 2),
                requirement("REQ-003", "Export reports as PDF", RequirementCategory::Functional, 0.6, 3),
            ],
            &ProjectSettings::default(),
        );
        PriorOutputs::default().with(
            "prioritization#1",
            StagePayload::Prioritization(PrioritizationOutput { ranked }),
        )
    }

    fn plan(payload: StagePayload) -> EpicPlan {
        match payload {
            StagePayload::EpicGeneration(plan) => plan,
            other => panic!("wrong payload {:?}", other.stage()),
        }
    }

    #[tokio::test]
    async fn test_category_grouping_without_model() {
        let ctx = context(Stage::EpicGeneration);
        let out = plan(
            EpicGenerationProcessor
                .process(&ctx, &prior(), &scoped(vec![], &[Capability::LanguageModel]))
                .await
                .unwrap(),
        );

        assert_eq!(out.epics.len(), 2);
        assert_eq!(out.fallback_epics, 0);
        assert_eq!(out.epics[0].id, "EPIC-01");
        assert_eq!(out.epics[0].title, "Functional requirements");
        assert_eq!(out.epics[0].requirement_ids, vec!["REQ-001", "REQ-003"]);
        assert_eq!(out.epics[0].priority, Priority::Critical);
        assert_eq!(out.epics[1].requirement_ids, vec!["REQ-002"]);
    }

    #[tokio::test]
    async fn test_model_grouping_is_repaired() {
        let ctx = context(Stage::EpicGeneration);
        let model = ScriptedLanguageModel::new();
        model.push_json(json!({"epics": [
            {"title": "Account access", "description": "Login things", "requirement_ids": ["REQ-001", "REQ-002", "REQ-404"]},
            {"title": "Duplicate", "requirement_ids": ["REQ-001"]}
        ]}));
        let docs = Arc::new(InMemoryDocumentation::new());
        let caps = scoped(
            vec![Arc::new(model), docs.clone()],
            &[Capability::LanguageModel, Capability::Documentation],
        );

        let out = plan(EpicGenerationProcessor.process(&ctx, &prior(), &caps).await.unwrap());

        assert_eq!(out.epics.len(), 2);
        assert_eq!(out.epics[0].title, "Account access");
        assert_eq!(out.epics[0].requirement_ids, vec!["REQ-001", "REQ-002"]);
        assert_eq!(out.fallback_epics, 1);
        assert_eq!(out.epics[1].requirement_ids, vec!["REQ-003"]);

        assert_eq!(docs.pages_created(), 1);
    }

    #[tokio::test]
    async fn test_outline_not_published_twice_after_lost_response() {
        let ctx = context(Stage::EpicGeneration);
        let docs = Arc::new(InMemoryDocumentation::new());
        docs.lose_next_response();
        let caps = scoped(vec![docs.clone()], &[Capability::LanguageModel, Capability::Documentation]);

        let err = EpicGenerationProcessor.process(&ctx, &prior(), &caps).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(docs.pages_created(), 1);

        let mut retry = ctx.clone();
        retry.attempt = 2;
        let out = plan(EpicGenerationProcessor.process(&retry, &prior(), &caps).await.unwrap());
        assert_eq!(out.epics.len(), 2);
        assert_eq!(docs.pages_created(), 1);

        let found = caps
            .invoke(
                Capability::Documentation,
                "find_page",
                json!({ "idempotency_key": ctx.key("outline").as_str() }),
                ctx.key("outline"),
            )
            .await
            .unwrap();
        assert!(found["page"]["content"].as_str().unwrap().contains("EPIC-02"));
    }

    #[tokio::test]
    async fn test_model_failure_propagates() {
        let ctx = context(Stage::EpicGeneration);
        let model = ScriptedLanguageModel::new();
        model.push_error(AdapterError::Transient("overloaded".into()));
        let caps = scoped(vec![Arc::new(model)], &[Capability::LanguageModel]);

        let err = EpicGenerationProcessor.process(&ctx, &prior(), &caps).await.unwrap_err();
        assert!(err.is_transient());
    }
}
