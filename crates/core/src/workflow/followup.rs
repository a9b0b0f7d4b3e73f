//! # Follow-up Scheduler
//!
//! Recurring sweep over open action items of completed runs. Runs beside
//! the pipeline and never changes a run's status. Failed notifications are
//! retried under the follow-up retry policy and otherwise stay recorded on
//! their items until the next sweep.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::events::{WorkflowEvent, WorkflowEventKind};
use super::registry::AgentRole;
use super::pipeline::Stage;
use crate::adapters::AdapterRegistry;
use crate::config::WorkflowConfig;
use crate::error::WorkflowError;
use crate::stages::followup::follow_up;
use crate::state::{ActionItem, PlanManager, SettingsManager, SupermonDb};

/// Outcome of one sweep
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    pub items_checked: usize,
    pub reminded: usize,
    pub expired: usize,
    /// Runs whose reminders could not be delivered within the retry budget
    pub failed_runs: Vec<String>,
}

pub struct FollowupScheduler {
    plans: PlanManager,
    settings: SettingsManager,
    adapters: Arc<AdapterRegistry>,
    config: WorkflowConfig,
    event_tx: Option<mpsc::Sender<WorkflowEvent>>,
}

impl FollowupScheduler {
    pub fn new(db: &SupermonDb, adapters: Arc<AdapterRegistry>, config: WorkflowConfig) -> Self {
        Self {
            plans: PlanManager::new(db),
            settings: SettingsManager::new(db),
            adapters,
            config,
            event_tx: None,
        }
    }

    pub fn with_event_channel(mut self, tx: mpsc::Sender<WorkflowEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Follow up every open item of every completed run, one run at a time.
    #[tracing::instrument(skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, WorkflowError> {
        let mut by_run: BTreeMap<String, Vec<ActionItem>> = BTreeMap::new();
        for item in self.plans.open_items_of_completed_runs()? {
            by_run.entry(item.run_id.clone()).or_default().push(item);
        }

        let mut report = SweepReport::default();
        let role = AgentRole::for_stage(Stage::Followup);

        for (run_id, items) in by_run {
            report.items_checked += items.len();
            let project_id = items[0].project_id;
            let settings = self.settings.load(project_id)?;
            let caps = self.adapters.scoped(
                role.capabilities(),
                Instant::now() + self.config.timeouts.stage_timeout(),
            );

            let outcome = follow_up(
                &items,
                &settings,
                &self.config.meeting,
                &self.config.followup_retry,
                now,
                &caps,
            )
            .await;

            self.plans.update_action_items(&outcome.action_items)?;
            report.reminded += outcome.reminded;
            report.expired += outcome.expired;
            if outcome.failed > 0 {
                tracing::warn!(run_id = %run_id, project_id, failed = outcome.failed, "Reminders undelivered");
                report.failed_runs.push(run_id);
            }
        }

        tracing::info!(
            checked = report.items_checked,
            reminded = report.reminded,
            expired = report.expired,
            failed = report.failed_runs.len(),
            "Follow-up sweep finished"
        );
        if let Some(tx) = &self.event_tx {
            let _ = tx
                .send(WorkflowEvent::new(WorkflowEventKind::FollowupSwept).with_data(json!(report)))
                .await;
        }
        Ok(report)
    }

    /// Sweep every `followup_interval` until the task is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let period = self.config.followup_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = self.sweep(Utc::now()).await {
                    tracing::error!(error = %e, "Follow-up sweep aborted");
                }
            }
        })
    }
}
