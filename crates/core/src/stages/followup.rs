//! # Action-Item Follow-up
//!
//! Reminds owners of open action items and expires items past their due
//! date. The pipeline's last stage sends the first round; the recurring
//! scheduler calls [`follow_up`] for completed runs afterwards. Reminder
//! failures never fail the stage: they stay on the items for the scheduler.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use tokio::sync::Mutex;

use super::{PriorOutputs, RunContext, StageProcessor};
use crate::adapters::{with_retry, Capability, IdempotencyKey, RetryPolicy, ScopedCapabilities};
use crate::config::MeetingConfig;
use crate::error::{AdapterError, StageError};
use crate::state::{ActionItem, ActionItemStatus, FollowupReport, ProjectSettings, StagePayload};
use crate::workflow::Stage;

/// Where a reminder for `item` goes: (channel, recipient)
fn route(item: &ActionItem, settings: &ProjectSettings, meeting: &MeetingConfig) -> (String, String) {
    let stakeholder = settings.stakeholder(&item.owner);
    let channel = stakeholder
        .and_then(|s| s.preferred_channel.clone())
        .or_else(|| settings.channel.clone())
        .unwrap_or_else(|| meeting.announcement_channel.clone());
    let recipient = stakeholder
        .and_then(|s| s.handle.clone())
        .unwrap_or_else(|| item.owner.clone());
    (channel, recipient)
}

enum Step {
    Unchanged,
    Expired,
    Reminded,
}

/// Advance one item a single follow-up step at `now`.
///
/// Closed items pass through untouched. Items past due expire without a
/// notification. Others get a reminder unless one went out within the
/// reminder interval. A failed send leaves the item as it was.
async fn advance(
    item: &mut ActionItem,
    settings: &ProjectSettings,
    meeting: &MeetingConfig,
    now: DateTime<Utc>,
    caps: &ScopedCapabilities,
) -> Result<Step, AdapterError> {
    if item.status.is_closed() {
        return Ok(Step::Unchanged);
    }

    if now > item.due_at {
        tracing::info!(action_item = %item.id, owner = %item.owner, "Action item expired");
        item.status = ActionItemStatus::Expired;
        return Ok(Step::Expired);
    }

    let interval = Duration::hours(meeting.reminder_interval_hours.max(0));
    let recently_reminded = item
        .last_followed_up_at
        .map(|at| now - at < interval)
        .unwrap_or(false);
    if recently_reminded {
        return Ok(Step::Unchanged);
    }

    let (channel, recipient) = route(item, settings, meeting);
    let key = IdempotencyKey::new(
        &item.run_id,
        Stage::Followup,
        &format!("followup:{}:{}", item.id, now.format("%Y%m%d")),
    );
    caps.invoke(
        Capability::Messaging,
        "send_message",
        json!({
            "channel": channel,
            "recipient": recipient,
            "text": format!(
                "Reminder for {}: {} (due {})",
                recipient,
                item.description,
                item.due_at.format("%Y-%m-%d")
            ),
        }),
        key,
    )
    .await?;

    item.status = ActionItemStatus::FollowedUp;
    item.followup_count += 1;
    item.last_followed_up_at = Some(now);
    item.last_error = None;
    Ok(Step::Reminded)
}

struct Progress {
    report: FollowupReport,
    /// Indexes into `report.action_items` still to be processed
    pending: Vec<usize>,
}

/// Advance every item one follow-up step at `now`.
///
/// Each item stands alone: an expiry or a delivered reminder is kept even
/// when another item's send fails. Transiently failed sends are retried
/// under `retry`; whatever is still undelivered afterwards carries its
/// `last_error` and counts as `failed`. Reminder keys include the date, so
/// a repeated sweep on the same day does not message twice.
pub async fn follow_up(
    items: &[ActionItem],
    settings: &ProjectSettings,
    meeting: &MeetingConfig,
    retry: &RetryPolicy,
    now: DateTime<Utc>,
    caps: &ScopedCapabilities,
) -> FollowupReport {
    let progress = Mutex::new(Progress {
        report: FollowupReport {
            action_items: items.to_vec(),
            reminded: 0,
            expired: 0,
            failed: 0,
        },
        pending: (0..items.len()).collect(),
    });

    let shared = &progress;
    let outcome = with_retry(retry.ceiling_for(Stage::Followup), &retry.backoff, move |_| async move {
        let mut guard = shared.lock().await;
        let Progress { report, pending } = &mut *guard;
        let mut retry_later = Vec::new();
        let mut last_transient = None;

        for idx in std::mem::take(pending) {
            let item = &mut report.action_items[idx];
            match advance(item, settings, meeting, now, caps).await {
                Ok(Step::Unchanged) => {}
                Ok(Step::Expired) => report.expired += 1,
                Ok(Step::Reminded) => report.reminded += 1,
                Err(AdapterError::Transient(reason)) => {
                    item.last_error = Some(reason.clone());
                    last_transient = Some(reason);
                    retry_later.push(idx);
                }
                Err(AdapterError::Permanent(reason)) => {
                    tracing::warn!(action_item = %item.id, %reason, "Reminder rejected");
                    item.last_error = Some(reason);
                    report.failed += 1;
                }
            }
        }

        *pending = retry_later;
        match last_transient {
            Some(reason) => Err(AdapterError::Transient(reason)),
            None => Ok(()),
        }
    })
    .await;

    let Progress { mut report, pending } = progress.into_inner();
    if let Err(e) = outcome {
        tracing::warn!(undelivered = pending.len(), error = %e, "Reminders still failing after retries");
        report.failed += pending.len();
    }
    report
}

pub struct FollowupProcessor;

#[async_trait]
impl StageProcessor for FollowupProcessor {
    fn stage(&self) -> Stage {
        Stage::Followup
    }

    fn inputs(&self) -> &'static [Stage] {
        &[Stage::MeetingCoordination]
    }

    #[tracing::instrument(skip_all, fields(run_id = %ctx.run_id, attempt = ctx.attempt))]
    async fn process(
        &self,
        ctx: &RunContext,
        prior: &PriorOutputs,
        caps: &ScopedCapabilities,
    ) -> Result<StagePayload, StageError> {
        let items = &prior.meeting()?.action_items;

        if !caps.has(Capability::Messaging) {
            tracing::warn!("No messaging adapter; reminders left to the scheduler");
            return Ok(StagePayload::Followup(FollowupReport {
                action_items: items.clone(),
                reminded: 0,
                expired: 0,
                failed: 0,
            }));
        }

        let report = follow_up(items, &ctx.settings, &ctx.meeting, &ctx.followup_retry, ctx.now, caps).await;
        if report.failed > 0 {
            tracing::warn!(failed = report.failed, "Undelivered reminders left to the scheduler");
        }
        tracing::info!(reminded = report.reminded, expired = report.expired, "Sent follow-ups");
        Ok(StagePayload::Followup(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{BackoffPolicy, InMemoryMessaging};
    use crate::stages::testing::{context, scoped};
    use crate::state::{Meeting, MeetingOutput, Stakeholder};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn item(id: &str, owner: &str, due_in_days: i64) -> ActionItem {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        ActionItem {
            id: format!("run-42:{}", id),
            run_id: "run-42".into(),
            project_id: 42,
            meeting_id: Some("run-42:meeting".into()),
            description: format!("Plan {}", id),
            owner: owner.into(),
            due_at: now + Duration::days(due_in_days),
            status: ActionItemStatus::Open,
            followup_count: 0,
            last_followed_up_at: None,
            last_error: None,
            created_at: now,
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            backoff: BackoffPolicy {
                base_delay_ms: 1,
                max_delay_ms: 2,
                jitter: 0.0,
            },
            ..RetryPolicy::default()
        }
    }

    fn settings() -> ProjectSettings {
        ProjectSettings {
            stakeholders: vec![Stakeholder {
                name: "alice".into(),
                handle: Some("@alice".into()),
                preferred_channel: Some("alice-dm".into()),
                role: Some("PM".into()),
            }],
            channel: Some("proj-42".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_reminds_open_and_expires_overdue() {
        let ctx = context(Stage::Followup);
        let messaging = Arc::new(InMemoryMessaging::new());
        let caps = scoped(vec![messaging.clone()], &[Capability::Messaging]);

        let mut resolved = item("ai-03", "bob", 3);
        resolved.status = ActionItemStatus::Resolved;
        let items = vec![item("ai-01", "alice", 3), item("ai-02", "bob", -1), resolved];

        let report = follow_up(&items, &settings(), &ctx.meeting, &fast_retry(), ctx.now, &caps).await;

        assert_eq!(report.reminded, 1);
        assert_eq!(report.expired, 1);
        assert_eq!(report.action_items[0].status, ActionItemStatus::FollowedUp);
        assert_eq!(report.action_items[0].followup_count, 1);
        assert_eq!(report.action_items[1].status, ActionItemStatus::Expired);
        assert_eq!(report.action_items[2].status, ActionItemStatus::Resolved);

        let sent = messaging.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel, "alice-dm");
        assert_eq!(sent[0].recipient.as_deref(), Some("@alice"));
    }

    #[tokio::test]
    async fn test_interval_and_same_day_dedup() {
        let ctx = context(Stage::Followup);
        let messaging = Arc::new(InMemoryMessaging::new());
        let caps = scoped(vec![messaging.clone()], &[Capability::Messaging]);
        let items = vec![item("ai-01", "bob", 5)];

        let first = follow_up(&items, &settings(), &ctx.meeting, &fast_retry(), ctx.now, &caps).await;
        let later = ctx.now + Duration::hours(2);
        let second = follow_up(&first.action_items, &settings(), &ctx.meeting, &fast_retry(), later, &caps).await;
        assert_eq!(second.reminded, 0);

        let next_day = ctx.now + Duration::hours(25);
        let third = follow_up(&second.action_items, &settings(), &ctx.meeting, &fast_retry(), next_day, &caps).await;
        assert_eq!(third.reminded, 1);
        assert_eq!(third.action_items[0].followup_count, 2);

        let sent = messaging.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].channel, "proj-42");
        assert_eq!(sent[0].recipient.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_failed_send_keeps_other_progress() {
        let ctx = context(Stage::Followup);
        let messaging = Arc::new(InMemoryMessaging::new());
        messaging.reject_sends_starting_with(
            "Reminder for bob",
            AdapterError::Transient("HTTP 503: unavailable".into()),
        );
        let caps = scoped(vec![messaging.clone()], &[Capability::Messaging]);
        let items = vec![item("ai-01", "bob", -1), item("ai-02", "bob", 5), item("ai-03", "alice", 5)];

        let report = follow_up(&items, &settings(), &ctx.meeting, &fast_retry(), ctx.now, &caps).await;

        assert_eq!(report.expired, 1);
        assert_eq!(report.reminded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.action_items[0].status, ActionItemStatus::Expired);
        assert_eq!(report.action_items[1].status, ActionItemStatus::Open);
        assert_eq!(report.action_items[1].followup_count, 0);
        assert_eq!(report.action_items[1].last_error.as_deref(), Some("HTTP 503: unavailable"));
        assert_eq!(report.action_items[2].status, ActionItemStatus::FollowedUp);
        assert_eq!(messaging.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_send_retried_under_followup_policy() {
        let ctx = context(Stage::Followup);
        let messaging = Arc::new(InMemoryMessaging::new());
        messaging.fail_next(AdapterError::Transient("HTTP 503: unavailable".into()));
        messaging.fail_next(AdapterError::Transient("HTTP 503: unavailable".into()));
        let caps = scoped(vec![messaging.clone()], &[Capability::Messaging]);

        let report = follow_up(&[item("ai-01", "bob", 5)], &settings(), &ctx.meeting, &fast_retry(), ctx.now, &caps).await;

        assert_eq!(report.reminded, 1);
        assert_eq!(report.failed, 0);
        assert!(report.action_items[0].last_error.is_none());
    }

    #[tokio::test]
    async fn test_rejected_send_is_not_retried() {
        let ctx = context(Stage::Followup);
        let messaging = Arc::new(InMemoryMessaging::new());
        messaging.fail_next(AdapterError::Permanent("HTTP 400: unknown channel".into()));
        let caps = scoped(vec![messaging.clone()], &[Capability::Messaging]);

        let report = follow_up(&[item("ai-01", "bob", 5)], &settings(), &ctx.meeting, &fast_retry(), ctx.now, &caps).await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.reminded, 0);
        assert!(messaging.sent().is_empty());
    }

    #[tokio::test]
    async fn test_processor_reads_meeting_items() {
        let ctx = context(Stage::Followup);
        let now = ctx.now;
        let prior = PriorOutputs::default().with(
            "meeting_coordination#1",
            StagePayload::MeetingCoordination(MeetingOutput {
                meeting: Meeting {
                    id: "run-42:meeting".into(),
                    title: "Sprint planning".into(),
                    agenda: vec![],
                    scheduled_at: now + Duration::hours(24),
                    duration_minutes: 60,
                    participants: vec![],
                    external_id: "cal-1".into(),
                    idempotency_key: "run-42:meeting_coordination:meeting".into(),
                },
                action_items: vec![item("ai-01", "alice", 8)],
                reused_existing: false,
            }),
        );

        let without = FollowupProcessor
            .process(&ctx, &prior, &scoped(vec![], &[Capability::Messaging]))
            .await
            .unwrap();
        let StagePayload::Followup(report) = without else {
            panic!("wrong payload");
        };
        assert_eq!(report.reminded, 0);

        let caps = scoped(vec![Arc::new(InMemoryMessaging::new())], &[Capability::Messaging]);
        let StagePayload::Followup(report) = FollowupProcessor.process(&ctx, &prior, &caps).await.unwrap() else {
            panic!("wrong payload");
        };
        assert_eq!(report.reminded, 1);
        assert_eq!(report.action_items[0].status, ActionItemStatus::FollowedUp);
    }
}
