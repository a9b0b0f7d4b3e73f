//! # Orchestrator
//!
//! Drives runs through the pipeline: invokes the stage processor for the
//! run's current stage, classifies the outcome, commits the attempt and
//! applies backoff. Status always comes from the committed history.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::events::{WorkflowEvent, WorkflowEventKind};
use super::pipeline::{RunStatus, Stage, StageOutcome};
use super::registry::AgentRegistry;
use crate::adapters::AdapterRegistry;
use crate::config::WorkflowConfig;
use crate::error::{StageError, StoreError, WorkflowError};
use crate::stages::{PriorOutputs, RunContext};
use crate::state::{
    PipelineStore, ProjectId, RunStatusReport, SettingsManager, StageAttempt, SupermonDb,
    WorkflowRun,
};

/// Attempts at create-or-resume before a trigger reports a conflict
const TRIGGER_ATTEMPTS: u32 = 5;

/// Result of `trigger_workflow`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerOutcome {
    pub run_id: String,
    /// The trigger joined an already active run
    pub coalesced: bool,
    /// A stalled run was reopened
    pub resumed: bool,
    pub status: RunStatus,
}

/// What `request_cancel` did
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub run_id: String,
    /// The run is mid-stage; cancellation applies once that stage commits
    pub deferred: bool,
    pub status: RunStatus,
}

/// Runs currently being driven, with any cancellation waiting on them
#[derive(Default)]
struct Flights {
    runs: HashMap<String, Option<String>>,
}

/// The workflow state machine
pub struct Orchestrator {
    store: Arc<PipelineStore>,
    settings: SettingsManager,
    adapters: Arc<AdapterRegistry>,
    agents: AgentRegistry,
    config: WorkflowConfig,
    event_tx: Option<mpsc::Sender<WorkflowEvent>>,
    flights: Mutex<Flights>,
}

/// Marks a run as being driven; drops the mark on exit.
struct FlightGuard<'a> {
    flights: &'a Mutex<Flights>,
    run_id: String,
    released: bool,
}

impl FlightGuard<'_> {
    /// Leave flight and hand back a cancellation requested meanwhile.
    fn land(mut self) -> Option<String> {
        self.released = true;
        self.flights
            .lock()
            .ok()
            .and_then(|mut f| f.runs.remove(&self.run_id))
            .flatten()
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Ok(mut f) = self.flights.lock() {
                f.runs.remove(&self.run_id);
            }
        }
    }
}

impl Orchestrator {
    pub fn new(db: &SupermonDb, adapters: AdapterRegistry, config: WorkflowConfig) -> Self {
        Self {
            store: Arc::new(PipelineStore::new(db)),
            settings: SettingsManager::new(db),
            adapters: Arc::new(adapters),
            agents: AgentRegistry::standard(),
            config,
            event_tx: None,
            flights: Mutex::new(Flights::default()),
        }
    }

    /// Set event channel for streaming events
    pub fn with_event_channel(mut self, tx: mpsc::Sender<WorkflowEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Replace the stage processors
    pub fn with_agents(mut self, agents: AgentRegistry) -> Self {
        self.agents = agents;
        self
    }

    pub fn store(&self) -> &PipelineStore {
        &self.store
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    /// Shared handle, for the follow-up scheduler
    pub fn shared_adapters(&self) -> Arc<AdapterRegistry> {
        Arc::clone(&self.adapters)
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    async fn emit(&self, event: WorkflowEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event).await;
        }
    }

    /// Start a run for `project_id`, or fold the trigger into its active run.
    #[tracing::instrument(skip(self))]
    pub async fn trigger_workflow(
        &self,
        project_id: ProjectId,
        conversation_ref: &str,
    ) -> Result<TriggerOutcome, WorkflowError> {
        let mut attempt = 0;
        let outcome = loop {
            match self.store.create_or_resume_run(project_id, Some(conversation_ref)) {
                Ok(outcome) => break outcome,
                Err(StoreError::AlreadyActiveConflict(_)) if attempt + 1 < TRIGGER_ATTEMPTS => {
                    attempt += 1;
                    tracing::debug!(project_id, attempt, "Active run is committing, retrying trigger");
                    tokio::time::sleep(std::time::Duration::from_millis(10 * attempt as u64)).await;
                }
                Err(StoreError::AlreadyActiveConflict(_)) => {
                    return Err(WorkflowError::Conflict(project_id))
                }
                Err(e) => return Err(e.into()),
            }
        };

        let run = &outcome.run;
        let kind = if outcome.created {
            WorkflowEventKind::RunCreated
        } else {
            WorkflowEventKind::RunCoalesced
        };
        self.emit(
            WorkflowEvent::for_run(kind, &run.id).with_data(json!({
                "project_id": project_id,
                "conversation_ref": conversation_ref,
            })),
        )
        .await;
        if outcome.resumed {
            self.emit(WorkflowEvent::for_run(WorkflowEventKind::RunResumed, &run.id).with_stage(run.current_stage))
                .await;
        }

        Ok(TriggerOutcome {
            run_id: run.id.clone(),
            coalesced: !outcome.created,
            resumed: outcome.resumed,
            status: run.status,
        })
    }

    /// Status, current stage and attempt summary of a run.
    pub fn get_run_status(&self, run_id: &str) -> Result<RunStatusReport, WorkflowError> {
        Ok(self.store.load_run(run_id)?.report())
    }

    /// Reopen a stalled run. The caller drives it afterwards.
    #[tracing::instrument(skip(self))]
    pub async fn resume(&self, run_id: &str, note: Option<&str>) -> Result<RunStatusReport, WorkflowError> {
        let run = self.store.resume_run(run_id, note)?;
        self.emit(WorkflowEvent::for_run(WorkflowEventKind::RunResumed, run_id).with_stage(run.current_stage))
            .await;
        Ok(run.report())
    }

    /// Cancel a run. A run being driven finishes its current stage first.
    #[tracing::instrument(skip(self))]
    pub async fn request_cancel(&self, run_id: &str, reason: Option<&str>) -> Result<CancelOutcome, WorkflowError> {
        let deferred = {
            let mut flights = self
                .flights
                .lock()
                .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
            match flights.runs.get_mut(run_id) {
                Some(pending) => {
                    *pending = Some(reason.unwrap_or("operator request").to_string());
                    true
                }
                None => false,
            }
        };

        if deferred {
            let run = self.store.load_run(run_id)?;
            tracing::info!(run_id, "Cancellation deferred until the in-flight stage commits");
            return Ok(CancelOutcome {
                run_id: run_id.to_string(),
                deferred: true,
                status: run.status,
            });
        }

        let run = self.store.cancel_run(run_id, reason)?;
        self.emit(WorkflowEvent::for_run(WorkflowEventKind::RunCancelled, run_id).with_stage(run.current_stage))
            .await;
        Ok(CancelOutcome {
            run_id: run_id.to_string(),
            deferred: false,
            status: run.status,
        })
    }

    /// Runs left pending or running, e.g. by a restart. Stalled runs wait
    /// for an operator.
    pub fn recoverable_runs(&self) -> Result<Vec<String>, WorkflowError> {
        Ok(self
            .store
            .list_active_runs()?
            .into_iter()
            .filter(|r| matches!(r.status, RunStatus::Pending | RunStatus::Running))
            .map(|r| r.id)
            .collect())
    }

    /// Trigger and drive to a resting state.
    pub async fn run_workflow(
        &self,
        project_id: ProjectId,
        conversation_ref: &str,
    ) -> Result<RunStatusReport, WorkflowError> {
        let trigger = self.trigger_workflow(project_id, conversation_ref).await?;
        self.drive(&trigger.run_id).await
    }

    /// Drive a run until it completes, fails or stalls.
    ///
    /// Single-flight per run: a second concurrent call returns the current
    /// status without invoking any stage.
    #[tracing::instrument(skip(self))]
    pub async fn drive(&self, run_id: &str) -> Result<RunStatusReport, WorkflowError> {
        let guard = {
            let mut flights = self
                .flights
                .lock()
                .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
            if flights.runs.contains_key(run_id) {
                drop(flights);
                tracing::debug!(run_id, "Run already being driven");
                return self.get_run_status(run_id);
            }
            flights.runs.insert(run_id.to_string(), None);
            FlightGuard {
                flights: &self.flights,
                run_id: run_id.to_string(),
                released: false,
            }
        };

        let result = self.drive_loop(run_id).await;

        if let Some(reason) = guard.land() {
            match self.store.cancel_run(run_id, Some(&reason)) {
                Ok(run) => {
                    self.emit(
                        WorkflowEvent::for_run(WorkflowEventKind::RunCancelled, run_id)
                            .with_stage(run.current_stage),
                    )
                    .await;
                }
                Err(StoreError::RunTerminal(_)) => {
                    tracing::info!(run_id, "Run finished before the deferred cancellation applied");
                }
                Err(e) => return Err(e.into()),
            }
        }

        result?;
        self.get_run_status(run_id)
    }

    fn take_cancel(&self, run_id: &str) -> Option<String> {
        let mut flights = self.flights.lock().ok()?;
        flights.runs.get_mut(run_id).and_then(|pending| pending.take())
    }

    async fn drive_loop(&self, run_id: &str) -> Result<(), WorkflowError> {
        loop {
            let run = self.store.load_run(run_id)?;
            if run.archived || run.status == RunStatus::Stalled {
                return Ok(());
            }

            if let Some(reason) = self.take_cancel(run_id) {
                let run = self.store.cancel_run(run_id, Some(&reason))?;
                self.emit(
                    WorkflowEvent::for_run(WorkflowEventKind::RunCancelled, run_id).with_stage(run.current_stage),
                )
                .await;
                return Ok(());
            }

            let attempt = self.invoke_stage(&run).await?;
            let stage = attempt.stage;
            let outcome = attempt.outcome;
            let retry_count = attempt.retry_count;
            let error = attempt.error.clone();

            let run = match self.store.record_attempt(run_id, attempt) {
                Ok(run) => run,
                Err(e @ (StoreError::StaleRun { .. }
                | StoreError::DuplicateAttempt { .. }
                | StoreError::RunTerminal(_))) => {
                    tracing::warn!(run_id, %stage, error = %e, "Attempt lost a race, stopping");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            self.after_commit(&run, stage, outcome, retry_count, error).await;
        }
    }

    /// Invoke the current stage once and package the verdict.
    async fn invoke_stage(&self, run: &WorkflowRun) -> Result<StageAttempt, WorkflowError> {
        let stage = run.current_stage;
        let processor = self
            .agents
            .processor(stage)
            .ok_or(WorkflowError::MissingProcessor(stage))?;
        let attempt_number = run.next_attempt_number(stage);
        let ceiling = self.config.retry.ceiling_for(stage);

        let settings = self.settings.load(run.project_id)?;
        let ctx = RunContext::new(run, stage, attempt_number, settings, &self.config);
        let prior = PriorOutputs::from_run(run);
        let input_snapshot = prior.snapshot(processor.inputs());

        let stage_timeout = self.config.timeouts.stage_timeout();
        let role = self.agents.role_for(stage);
        let caps = self
            .adapters
            .scoped(role.capabilities(), Instant::now() + stage_timeout);

        self.emit(
            WorkflowEvent::for_run(WorkflowEventKind::StageStarted, &run.id)
                .with_stage(stage)
                .with_data(json!({ "attempt": attempt_number, "role": role.as_str() })),
        )
        .await;
        tracing::info!(run_id = %run.id, project_id = run.project_id, %stage, attempt = attempt_number, "Invoking stage");

        let started_at = Utc::now();
        let result = match tokio::time::timeout(stage_timeout, processor.process(&ctx, &prior, &caps)).await {
            Ok(result) => result,
            Err(_) => Err(StageError::Transient(format!(
                "stage {} timed out after {:?}",
                stage, stage_timeout
            ))),
        };

        let (outcome, payload, error) = match result {
            Ok(payload) if payload.stage() == stage => (StageOutcome::Success, Some(payload), None),
            Ok(payload) => (
                StageOutcome::PermanentFailure,
                None,
                Some(format!("processor for {} returned a {} payload", stage, payload.stage())),
            ),
            Err(StageError::Transient(reason)) => (StageOutcome::TransientFailure, None, Some(reason)),
            Err(StageError::Permanent(reason)) => (StageOutcome::PermanentFailure, None, Some(reason)),
        };

        let retry_count = if outcome == StageOutcome::TransientFailure {
            run.transient_streak(stage) + 1
        } else {
            0
        };

        Ok(StageAttempt {
            stage,
            attempt: attempt_number,
            input_snapshot,
            outcome,
            retry_count,
            retry_ceiling: ceiling,
            payload,
            error,
            started_at,
            finished_at: Utc::now(),
            seq: 0,
        })
    }

    async fn after_commit(
        &self,
        run: &WorkflowRun,
        stage: Stage,
        outcome: StageOutcome,
        retry_count: u32,
        error: Option<String>,
    ) {
        match outcome {
            StageOutcome::Success => {
                tracing::info!(run_id = %run.id, %stage, "Stage succeeded");
                self.emit(WorkflowEvent::for_run(WorkflowEventKind::StageSucceeded, &run.id).with_stage(stage))
                    .await;
            }
            StageOutcome::TransientFailure if run.status == RunStatus::Running => {
                let delay = self
                    .config
                    .retry
                    .backoff
                    .delay_for(retry_count.saturating_sub(1));
                tracing::warn!(
                    run_id = %run.id,
                    %stage,
                    retry_count,
                    ?delay,
                    error = error.as_deref().unwrap_or_default(),
                    "Transient stage failure, retrying"
                );
                self.emit(
                    WorkflowEvent::for_run(WorkflowEventKind::StageRetrying, &run.id)
                        .with_stage(stage)
                        .with_data(json!({
                            "retry_count": retry_count,
                            "delay_ms": delay.as_millis() as u64,
                            "error": error,
                        })),
                )
                .await;
                tokio::time::sleep(delay).await;
            }
            _ => {}
        }

        let kind = match run.status {
            RunStatus::Completed => Some(WorkflowEventKind::RunCompleted),
            RunStatus::Failed => Some(WorkflowEventKind::RunFailed),
            RunStatus::Stalled => Some(WorkflowEventKind::RunStalled),
            RunStatus::Pending | RunStatus::Running => None,
        };
        if let Some(kind) = kind {
            let report = run.report();
            match kind {
                WorkflowEventKind::RunCompleted => tracing::info!(run_id = %run.id, "Run completed"),
                _ => tracing::warn!(
                    run_id = %run.id,
                    status = %run.status,
                    %stage,
                    error = report.last_error.as_deref().unwrap_or_default(),
                    "Run stopped"
                ),
            }
            self.emit(
                WorkflowEvent::for_run(kind, &run.id)
                    .with_stage(run.current_stage)
                    .with_data(json!({
                        "retry_count": report.retry_count,
                        "last_error": report.last_error,
                    })),
            )
            .await;
        }
    }
}
