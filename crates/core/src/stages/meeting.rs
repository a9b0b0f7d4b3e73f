//! # Meeting Coordination
//!
//! Schedules the planning meeting, announces it and assigns one action item
//! per epic. The calendar cannot deduplicate, so an existing meeting under
//! the run's key is looked up before a new one is created.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};

use super::{PriorOutputs, RunContext, StageProcessor};
use crate::adapters::{Capability, ScopedCapabilities};
use crate::error::StageError;
use crate::state::{ActionItem, ActionItemStatus, Meeting, MeetingOutput, StagePayload, StoryPlan};
use crate::workflow::Stage;

pub struct MeetingCoordinationProcessor;

#[async_trait]
impl StageProcessor for MeetingCoordinationProcessor {
    fn stage(&self) -> Stage {
        Stage::MeetingCoordination
    }

    fn inputs(&self) -> &'static [Stage] {
        &[Stage::StoryGeneration]
    }

    #[tracing::instrument(skip_all, fields(run_id = %ctx.run_id, attempt = ctx.attempt))]
    async fn process(
        &self,
        ctx: &RunContext,
        prior: &PriorOutputs,
        caps: &ScopedCapabilities,
    ) -> Result<StagePayload, StageError> {
        let plan = prior.stories()?;
        let key = ctx.key("meeting");

        let mut meeting = Meeting {
            id: format!("{}:meeting", ctx.run_id),
            title: format!("Sprint planning: project {}", ctx.project_id),
            agenda: agenda(plan),
            scheduled_at: ctx.now + Duration::hours(ctx.meeting.lead_time_hours),
            duration_minutes: ctx.meeting.duration_minutes,
            participants: participants(ctx),
            external_id: String::new(),
            idempotency_key: key.to_string(),
        };

        let found = caps
            .invoke(
                Capability::Calendar,
                "find_meeting",
                json!({ "idempotency_key": key.as_str() }),
                key.clone(),
            )
            .await?;

        let reused_existing = match &found["meeting"] {
            Value::Null => false,
            existing => {
                adopt(&mut meeting, existing)?;
                true
            }
        };

        if !reused_existing {
            let created = caps
                .invoke(
                    Capability::Calendar,
                    "schedule_meeting",
                    json!({
                        "idempotency_key": key.as_str(),
                        "title": meeting.title,
                        "agenda": meeting.agenda,
                        "scheduled_at": meeting.scheduled_at.to_rfc3339(),
                        "duration_minutes": meeting.duration_minutes,
                        "participants": meeting.participants,
                    }),
                    key,
                )
                .await?;
            adopt(&mut meeting, &created)?;
        }

        if caps.has(Capability::Messaging) {
            caps.invoke(
                Capability::Messaging,
                "send_message",
                json!({
                    "channel": ctx.channel(),
                    "text": format!(
                        "{} scheduled for {} ({} min). Agenda:\n{}",
                        meeting.title,
                        meeting.scheduled_at.format("%Y-%m-%d %H:%M UTC"),
                        meeting.duration_minutes,
                        meeting.agenda.join("\n")
                    ),
                }),
                ctx.key("announce"),
            )
            .await?;
        }

        let action_items = assign_action_items(ctx, plan, &meeting);

        tracing::info!(
            meeting = %meeting.external_id,
            reused_existing,
            action_items = action_items.len(),
            "Coordinated planning meeting"
        );

        Ok(StagePayload::MeetingCoordination(MeetingOutput {
            meeting,
            action_items,
            reused_existing,
        }))
    }
}

fn agenda(plan: &StoryPlan) -> Vec<String> {
    plan.epics
        .iter()
        .map(|epic| {
            format!(
                "{} {} ({} stories, {}h, {})",
                epic.id,
                epic.title,
                plan.stories_for_epic(&epic.id).count(),
                epic.estimated_hours,
                epic.priority.as_str()
            )
        })
        .collect()
}

fn participants(ctx: &RunContext) -> Vec<String> {
    if ctx.settings.stakeholders.is_empty() {
        return vec![ctx.meeting.default_owner.clone()];
    }
    ctx.settings
        .stakeholders
        .iter()
        .map(|s| s.handle.clone().unwrap_or_else(|| s.name.clone()))
        .collect()
}

/// Take the calendar's id and time from a found or created entry.
fn adopt(meeting: &mut Meeting, entry: &Value) -> Result<(), StageError> {
    let id = match &entry["meeting_id"] {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => {
            return Err(StageError::Permanent(
                "calendar entry carries no meeting_id".to_string(),
            ))
        }
    };
    meeting.external_id = id;

    if let Some(at) = entry["scheduled_at"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    {
        meeting.scheduled_at = at.with_timezone(&Utc);
    }
    Ok(())
}

/// One item per epic; owners rotate through the project's stakeholders.
fn assign_action_items(ctx: &RunContext, plan: &StoryPlan, meeting: &Meeting) -> Vec<ActionItem> {
    let due_at = meeting.scheduled_at + Duration::days(ctx.meeting.action_item_due_days);
    let stakeholders = &ctx.settings.stakeholders;

    plan.epics
        .iter()
        .enumerate()
        .map(|(i, epic)| {
            let owner = if stakeholders.is_empty() {
                ctx.meeting.default_owner.clone()
            } else {
                stakeholders[i % stakeholders.len()].name.clone()
            };
            ActionItem {
                id: format!("{}:ai-{:02}", ctx.run_id, i + 1),
                run_id: ctx.run_id.clone(),
                project_id: ctx.project_id,
                meeting_id: Some(meeting.id.clone()),
                description: format!(
                    "Break down and schedule {} \"{}\" ({} stories)",
                    epic.id,
                    epic.title,
                    plan.stories_for_epic(&epic.id).count()
                ),
                owner,
                due_at,
                status: ActionItemStatus::Open,
                followup_count: 0,
                last_followed_up_at: None,
                last_error: None,
                created_at: ctx.now,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AdapterError, InMemoryCalendar, InMemoryMessaging};
    use crate::stages::testing::{context, scoped};
    use crate::state::{Epic, EpicStatus, Priority, Stakeholder, StoryStatus, UserStory};
    use std::sync::Arc;

    fn prior() -> PriorOutputs {
        let epic = |id: &str, title: &str| Epic {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: EpicStatus::Backlog,
            priority: Priority::High,
            estimated_hours: 12,
            acceptance_criteria: vec![],
            requirement_ids: vec![],
        };
        let story = UserStory {
            id: "STORY-001".into(),
            epic_id: "EPIC-01".into(),
            title: "Password reset".into(),
            description: String::new(),
            status: StoryStatus::Todo,
            priority: Priority::High,
            story_points: 3,
            estimated_hours: 12,
            acceptance_criteria: vec![],
            requirement_ids: vec!["REQ-001".into()],
            external_issue_id: None,
        };
        PriorOutputs::default().with(
            "story_generation#1",
            StagePayload::StoryGeneration(StoryPlan {
                epics: vec![epic("EPIC-01", "Accounts"), epic("EPIC-02", "Reporting")],
                stories: vec![story],
            }),
        )
    }

    fn output(payload: StagePayload) -> MeetingOutput {
        match payload {
            StagePayload::MeetingCoordination(out) => out,
            other => panic!("wrong payload {:?}", other.stage()),
        }
    }

    #[tokio::test]
    async fn test_schedules_announces_and_assigns() {
        let mut ctx = context(Stage::MeetingCoordination);
        ctx.settings.stakeholders = vec![
            Stakeholder { name: "alice".into(), handle: Some("@alice".into()), preferred_channel: None, role: None },
            Stakeholder { name: "bob".into(), handle: None, preferred_channel: None, role: None },
        ];
        let calendar = Arc::new(InMemoryCalendar::new());
        let messaging = Arc::new(InMemoryMessaging::new());
        let caps = scoped(
            vec![calendar.clone(), messaging.clone()],
            &[Capability::Messaging, Capability::Calendar],
        );

        let out = output(MeetingCoordinationProcessor.process(&ctx, &prior(), &caps).await.unwrap());

        assert!(!out.reused_existing);
        assert_eq!(out.meeting.external_id, "cal-1");
        assert_eq!(out.meeting.participants, vec!["@alice", "bob"]);
        assert_eq!(out.meeting.scheduled_at, ctx.now + Duration::hours(24));
        assert_eq!(out.meeting.agenda[0], "EPIC-01 Accounts (1 stories, 12h, high)");
        assert_eq!(out.action_items.len(), 2);
        assert_eq!(out.action_items[0].id, "run-42:ai-01");
        assert_eq!(out.action_items[1].owner, "bob");
        assert_eq!(out.action_items[0].due_at, out.meeting.scheduled_at + Duration::days(7));

        let sent = messaging.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel, "general");
    }

    #[tokio::test]
    async fn test_reinvocation_never_creates_a_second_meeting() {
        let ctx = context(Stage::MeetingCoordination);
        let calendar = Arc::new(InMemoryCalendar::new());
        calendar.lose_next_response();
        let caps = scoped(vec![calendar.clone()], &[Capability::Calendar]);

        let err = MeetingCoordinationProcessor.process(&ctx, &prior(), &caps).await.unwrap_err();
        assert!(err.is_transient());

        let out = output(MeetingCoordinationProcessor.process(&ctx, &prior(), &caps).await.unwrap());
        assert!(out.reused_existing);
        assert_eq!(out.meeting.external_id, "cal-1");
        assert_eq!(out.action_items[0].owner, "product-owner");

        let again = output(MeetingCoordinationProcessor.process(&ctx, &prior(), &caps).await.unwrap());
        assert_eq!(again.meeting, out.meeting);
        assert_eq!(calendar.meetings_created(), 1);
    }

    #[tokio::test]
    async fn test_calendar_rejection_is_permanent() {
        let ctx = context(Stage::MeetingCoordination);
        let calendar = InMemoryCalendar::new();
        calendar.fail_next(AdapterError::Permanent("HTTP 403: forbidden".into()));
        let caps = scoped(vec![Arc::new(calendar)], &[Capability::Calendar]);

        let err = MeetingCoordinationProcessor.process(&ctx, &prior(), &caps).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_missing_calendar_is_permanent() {
        let ctx = context(Stage::MeetingCoordination);
        let err = MeetingCoordinationProcessor
            .process(&ctx, &prior(), &scoped(vec![], &[Capability::Calendar]))
            .await
            .unwrap_err();
        assert!(err.reason().contains("no adapter registered"));
    }
}
