//! # Workflow Runs
//!
//! A run is one pass of the pipeline for one project. Its status and current
//! stage are always derived from the append-only attempt history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::artifacts::StagePayload;
use crate::workflow::{derive_state, RunStatus, Stage, StageOutcome};

/// External project identifier.
pub type ProjectId = i64;

/// One invocation of a stage processor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageAttempt {
    pub stage: Stage,
    /// Strictly increasing per (run, stage), starting at 1
    pub attempt: u32,
    /// References to the prior outputs this attempt consumed (`stage#attempt`)
    pub input_snapshot: Vec<String>,
    pub outcome: StageOutcome,
    /// Consecutive transient failures of this stage, this attempt included
    pub retry_count: u32,
    /// Ceiling in force when the attempt ran
    pub retry_ceiling: u32,
    #[serde(default)]
    pub payload: Option<StagePayload>,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Commit order within the run, assigned by the store
    #[serde(default)]
    pub seq: i64,
}

impl StageAttempt {
    /// Reference other attempts use in their input snapshot.
    pub fn reference(&self) -> String {
        format!("{}#{}", self.stage, self.attempt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionKind {
    Resumed,
    Cancelled,
}

impl InterventionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resumed => "resumed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "resumed" => Some(Self::Resumed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Resume or cancel marker appended to a run's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intervention {
    pub kind: InterventionKind,
    pub stage: Stage,
    #[serde(default)]
    pub note: Option<String>,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub seq: i64,
}

/// A workflow run with its full history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub project_id: ProjectId,
    pub conversation_refs: Vec<String>,
    pub status: RunStatus,
    pub current_stage: Stage,
    pub history: Vec<StageAttempt>,
    #[serde(default)]
    pub interventions: Vec<Intervention>,
    /// Set once the run is terminal
    #[serde(default)]
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(project_id: ProjectId, conversation_ref: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id,
            conversation_refs: conversation_ref.map(|r| vec![r.to_string()]).unwrap_or_default(),
            status: RunStatus::Pending,
            current_stage: Stage::first(),
            history: Vec::new(),
            interventions: Vec::new(),
            archived: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Recompute status and current stage from history.
    pub fn refresh(&mut self) {
        let state = derive_state(&self.history, &self.interventions);
        self.status = state.status;
        self.current_stage = state.stage;
        self.archived = state.status.is_terminal();
    }

    /// Next attempt number for a stage.
    pub fn next_attempt_number(&self, stage: Stage) -> u32 {
        self.history
            .iter()
            .filter(|a| a.stage == stage)
            .map(|a| a.attempt)
            .max()
            .unwrap_or(0)
            + 1
    }

    /// Highest commit sequence number in the run.
    pub fn last_seq(&self) -> i64 {
        self.history
            .iter()
            .map(|a| a.seq)
            .chain(self.interventions.iter().map(|i| i.seq))
            .max()
            .unwrap_or(0)
    }

    /// Trailing run of transient failures on `stage`, reset by a resume.
    pub fn transient_streak(&self, stage: Stage) -> u32 {
        let last_resume = self
            .interventions
            .iter()
            .filter(|i| i.kind == InterventionKind::Resumed)
            .map(|i| i.seq)
            .max()
            .unwrap_or(0);

        let mut attempts: Vec<&StageAttempt> = self
            .history
            .iter()
            .filter(|a| a.stage == stage && a.seq > last_resume)
            .collect();
        attempts.sort_by_key(|a| a.seq);

        attempts
            .iter()
            .rev()
            .take_while(|a| a.outcome == StageOutcome::TransientFailure)
            .count() as u32
    }

    /// The successful attempt of a stage, if it has one.
    pub fn success_for(&self, stage: Stage) -> Option<&StageAttempt> {
        self.history
            .iter()
            .find(|a| a.stage == stage && a.outcome == StageOutcome::Success)
    }

    /// Most recent attempt in commit order.
    pub fn last_attempt(&self) -> Option<&StageAttempt> {
        self.history.iter().max_by_key(|a| a.seq)
    }

    /// Status report for operators and the API.
    pub fn report(&self) -> RunStatusReport {
        let mut history: Vec<&StageAttempt> = self.history.iter().collect();
        history.sort_by_key(|a| a.seq);

        let last = self.last_attempt();
        let last_error = match self.status {
            RunStatus::Failed => self
                .interventions
                .iter()
                .filter(|i| i.kind == InterventionKind::Cancelled)
                .max_by_key(|i| i.seq)
                .map(|i| {
                    format!(
                        "cancelled: {}",
                        i.note.as_deref().unwrap_or("operator request")
                    )
                })
                .or_else(|| last.and_then(|a| a.error.clone())),
            RunStatus::Stalled | RunStatus::Running => last.and_then(|a| a.error.clone()),
            _ => None,
        };

        RunStatusReport {
            run_id: self.id.clone(),
            project_id: self.project_id,
            status: self.status,
            current_stage: self.current_stage,
            retry_count: self.transient_streak(self.current_stage),
            last_error,
            conversation_refs: self.conversation_refs.clone(),
            history: history
                .into_iter()
                .map(|a| AttemptSummary {
                    stage: a.stage,
                    attempt: a.attempt,
                    outcome: a.outcome,
                    retry_count: a.retry_count,
                    error: a.error.clone(),
                    finished_at: a.finished_at,
                })
                .collect(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Condensed view of one attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub stage: Stage,
    pub attempt: u32,
    pub outcome: StageOutcome,
    pub retry_count: u32,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// What `get_run_status` returns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatusReport {
    pub run_id: String,
    pub project_id: ProjectId,
    pub status: RunStatus,
    pub current_stage: Stage,
    /// Current transient streak on the current stage
    pub retry_count: u32,
    /// Last transient error when stalled, the permanent cause when failed
    pub last_error: Option<String>,
    pub conversation_refs: Vec<String>,
    pub history: Vec<AttemptSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
