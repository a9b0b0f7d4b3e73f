//! # Story Generation
//!
//! Breaks each epic into user stories with acceptance criteria and
//! estimates, checks that every accepted requirement is covered, and
//! publishes the stories to the issue tracker when one is registered.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};

use super::{prompts, PriorOutputs, RunContext, StageProcessor};
use crate::adapters::{complete_json, Capability, ScopedCapabilities};
use crate::config::PlanningConfig;
use crate::error::StageError;
use crate::state::{
    Epic, PrioritizedRequirement, Priority, StagePayload, StoryPlan, StoryStatus, UserStory,
};
use crate::workflow::Stage;

#[derive(Debug, Deserialize)]
struct ProposedStories {
    #[serde(default)]
    stories: Vec<ProposedStory>,
}

#[derive(Debug, Deserialize)]
struct ProposedStory {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    acceptance_criteria: Vec<String>,
    #[serde(default)]
    story_points: Option<u32>,
    #[serde(default)]
    requirement_ids: Vec<String>,
}

pub struct StoryGenerationProcessor;

#[async_trait]
impl StageProcessor for StoryGenerationProcessor {
    fn stage(&self) -> Stage {
        Stage::StoryGeneration
    }

    fn inputs(&self) -> &'static [Stage] {
        &[Stage::Validation, Stage::Prioritization, Stage::EpicGeneration]
    }

    #[tracing::instrument(skip_all, fields(run_id = %ctx.run_id, attempt = ctx.attempt))]
    async fn process(
        &self,
        ctx: &RunContext,
        prior: &PriorOutputs,
        caps: &ScopedCapabilities,
    ) -> Result<StagePayload, StageError> {
        let accepted: Vec<String> = prior.validation()?.accepted().map(|r| r.id.clone()).collect();
        let ranked: HashMap<&str, &PrioritizedRequirement> = prior
            .prioritization()?
            .ranked
            .iter()
            .map(|r| (r.requirement.id.as_str(), r))
            .collect();
        let mut epics = prior.epics()?.epics.clone();

        let use_model = caps.has(Capability::LanguageModel);
        let mut stories: Vec<UserStory> = Vec::new();

        for epic in &epics {
            let drafts = if use_model {
                let proposed: ProposedStories = complete_json(
                    caps,
                    prompts::STORY_WRITER,
                    &epic_prompt(epic, &ranked),
                    ctx.key(&format!("llm:{}", epic.id)),
                )
                .await?;
                proposed.stories
            } else {
                template_stories(epic, &ranked)
            };

            let epic_ids: HashSet<&str> = epic.requirement_ids.iter().map(String::as_str).collect();
            for draft in drafts {
                if draft.title.trim().is_empty() {
                    continue;
                }
                let requirement_ids: Vec<String> = draft
                    .requirement_ids
                    .into_iter()
                    .filter(|id| epic_ids.contains(id.as_str()))
                    .collect();
                let story_points = clamp_points(draft.story_points, &ctx.planning);
                let priority = requirement_ids
                    .iter()
                    .filter_map(|id| ranked.get(id.as_str()).map(|r| r.priority))
                    .max()
                    .unwrap_or(epic.priority);

                stories.push(UserStory {
                    id: format!("STORY-{:03}", stories.len() + 1),
                    epic_id: epic.id.clone(),
                    title: draft.title.trim().to_string(),
                    description: draft.description,
                    status: StoryStatus::Todo,
                    priority,
                    story_points,
                    estimated_hours: story_points * ctx.planning.hours_per_point,
                    acceptance_criteria: draft.acceptance_criteria,
                    requirement_ids,
                    external_issue_id: None,
                });
            }
        }

        let missing = uncovered(&accepted, &stories);
        if !missing.is_empty() {
            return Err(StageError::Transient(format!(
                "stories do not cover requirements: {}",
                missing.join(", ")
            )));
        }

        for epic in &mut epics {
            epic.estimated_hours = stories
                .iter()
                .filter(|s| s.epic_id == epic.id)
                .map(|s| s.estimated_hours)
                .sum();
        }

        if caps.has(Capability::IssueTracker) {
            for story in &mut stories {
                story.external_issue_id = Some(publish_issue(ctx, caps, story).await?);
            }
        }

        tracing::info!(epics = epics.len(), stories = stories.len(), "Generated user stories");
        Ok(StagePayload::StoryGeneration(StoryPlan { epics, stories }))
    }
}

fn clamp_points(points: Option<u32>, planning: &PlanningConfig) -> u32 {
    match points {
        Some(p) if p > 0 => p.min(planning.max_story_points.max(1)),
        _ => planning.default_story_points.max(1),
    }
}

/// Accepted requirement ids no story references, in input order.
pub fn uncovered(accepted: &[String], stories: &[UserStory]) -> Vec<String> {
    let covered: HashSet<&str> = stories
        .iter()
        .flat_map(|s| s.requirement_ids.iter().map(String::as_str))
        .collect();
    accepted
        .iter()
        .filter(|id| !covered.contains(id.as_str()))
        .cloned()
        .collect()
}

fn epic_prompt(epic: &Epic, ranked: &HashMap<&str, &PrioritizedRequirement>) -> String {
    let mut prompt = format!("Epic {}: {}\n{}\n\nRequirements:\n", epic.id, epic.title, epic.description);
    for id in &epic.requirement_ids {
        if let Some(r) = ranked.get(id.as_str()) {
            prompt.push_str(&format!("{} [{}] {}\n", id, r.priority.as_str(), r.requirement.text));
        }
    }
    prompt
}

/// One story per requirement, used when no model is available.
fn template_stories(epic: &Epic, ranked: &HashMap<&str, &PrioritizedRequirement>) -> Vec<ProposedStory> {
    epic.requirement_ids
        .iter()
        .filter_map(|id| ranked.get(id.as_str()).map(|r| (id, r)))
        .map(|(id, r)| {
            let text = r.requirement.text.trim_end_matches('.');
            ProposedStory {
                title: truncate(text, 80),
                description: format!("As a user, I want the product to meet this need: {}", text),
                acceptance_criteria: vec![format!(
                    "Given the change is released, when it is used, then: {}",
                    text
                )],
                story_points: None,
                requirement_ids: vec![id.clone()],
            }
        })
        .collect()
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", cut.trim_end())
}

/// Find-then-create so a re-invoked stage does not open a second issue.
async fn publish_issue(
    ctx: &RunContext,
    caps: &ScopedCapabilities,
    story: &UserStory,
) -> Result<String, StageError> {
    let key = ctx.key(&format!("issue:{}", story.id));

    let found = caps
        .invoke(
            Capability::IssueTracker,
            "find_issue",
            json!({ "idempotency_key": key.as_str() }),
            key.clone(),
        )
        .await?;
    if let Some(id) = issue_id(&found["issue"]) {
        return Ok(id);
    }

    let created = caps
        .invoke(
            Capability::IssueTracker,
            "create_issue",
            json!({
                "idempotency_key": key.as_str(),
                "title": story.title,
                "body": format!("{}\n\n{}", story.description, story.acceptance_criteria.join("\n")),
                "labels": [story.epic_id, story.priority.as_str()],
            }),
            key,
        )
        .await?;
    issue_id(&created).ok_or_else(|| {
        StageError::Permanent(format!("issue tracker returned no id for {}", story.id))
    })
}

fn issue_id(value: &Value) -> Option<String> {
    match &value["issue_id"] {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryIssueTracker, ScriptedLanguageModel};
    use crate::stages::prioritization::rank;
    use crate::stages::testing::{context, requirement, scoped};
    use crate::state::{
        EpicPlan, EpicStatus, PrioritizationOutput, ProjectSettings, RequirementCategory,
        ValidationOutput,
    };
    use std::sync::Arc;

    fn prior() -> PriorOutputs {
        let requirements = vec![
            requirement("REQ-001", "Users can reset passwords.", RequirementCategory::Functional, 0.9, 1),
            requirement("REQ-002", "Export reports as PDF", RequirementCategory::Functional, 0.7, 2),
        ];
        let ranked = rank(requirements.clone(), &ProjectSettings::default());
        let epic = Epic {
            id: "EPIC-01".into(),
            title: "Functional requirements".into(),
            description: "Core features".into(),
            status: EpicStatus::Backlog,
            priority: Priority::Critical,
            estimated_hours: 0,
            acceptance_criteria: vec![],
            requirement_ids: vec!["REQ-001".into(), "REQ-002".into()],
        };
        PriorOutputs::default()
            .with(
                "validation#1",
                StagePayload::Validation(ValidationOutput {
                    requirements,
                    merged: 0,
                    category_counts: Default::default(),
                    summary: String::new(),
                }),
            )
            .with("prioritization#1", StagePayload::Prioritization(PrioritizationOutput { ranked }))
            .with(
                "epic_generation#1",
                StagePayload::EpicGeneration(EpicPlan {
                    epics: vec![epic],
                    fallback_epics: 0,
                }),
            )
    }

    fn plan(payload: StagePayload) -> StoryPlan {
        match payload {
            StagePayload::StoryGeneration(plan) => plan,
            other => panic!("wrong payload {:?}", other.stage()),
        }
    }

    #[tokio::test]
    async fn test_template_stories_cover_everything() {
        let ctx = context(Stage::StoryGeneration);
        let out = plan(
            StoryGenerationProcessor
                .process(&ctx, &prior(), &scoped(vec![], &[]))
                .await
                .unwrap(),
        );

        assert_eq!(out.stories.len(), 2);
        assert_eq!(out.stories[0].id, "STORY-001");
        assert_eq!(out.stories[0].title, "Users can reset passwords");
        assert_eq!(out.stories[0].story_points, 3);
        assert_eq!(out.stories[0].estimated_hours, 12);
        assert_eq!(out.epics[0].estimated_hours, 24);
        assert!(out.stories.iter().all(|s| s.external_issue_id.is_none()));
    }

    #[tokio::test]
    async fn test_coverage_gap_is_transient() {
        let ctx = context(Stage::StoryGeneration);
        let model = ScriptedLanguageModel::new();
        model.push_json(json!({"stories": [
            {"title": "Password reset", "description": "As a user...", "story_points": 21, "requirement_ids": ["REQ-001", "REQ-999"]}
        ]}));
        let caps = scoped(vec![Arc::new(model)], &[Capability::LanguageModel]);

        let err = StoryGenerationProcessor.process(&ctx, &prior(), &caps).await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.reason().contains("REQ-002"));
        assert!(!err.reason().contains("REQ-001"));
    }

    #[tokio::test]
    async fn test_model_stories_are_clamped_and_published_once() {
        let ctx = context(Stage::StoryGeneration);
        let model = ScriptedLanguageModel::new().responding_with(|_| {
            Ok(json!({"text": json!({"stories": [
                {"title": "Password reset", "story_points": 21, "requirement_ids": ["REQ-001"]},
                {"title": "PDF export", "requirement_ids": ["REQ-002"]}
            ]}).to_string()}))
        });
        let tracker = Arc::new(InMemoryIssueTracker::new());
        let caps = scoped(
            vec![Arc::new(model), tracker.clone()],
            &[Capability::LanguageModel, Capability::IssueTracker],
        );

        let first = plan(StoryGenerationProcessor.process(&ctx, &prior(), &caps).await.unwrap());
        assert_eq!(first.stories[0].story_points, 13);
        assert_eq!(first.stories[1].story_points, 3);
        assert_eq!(first.stories[0].external_issue_id.as_deref(), Some("ISSUE-1"));

        let again = plan(StoryGenerationProcessor.process(&ctx, &prior(), &caps).await.unwrap());
        assert_eq!(again.stories[1].external_issue_id.as_deref(), Some("ISSUE-2"));
        assert_eq!(tracker.issues_created(), 2);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a very long story title", 10), "a very...");
    }
}
