//! # Workflow Events
//!
//! Progress notifications emitted by the orchestrator and the follow-up
//! scheduler. The server re-broadcasts them as Server-Sent Events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::pipeline::Stage;

/// Kind of workflow event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowEventKind {
    /// A trigger created a new run
    RunCreated,
    /// A trigger joined a run that was already active
    RunCoalesced,
    StageStarted,
    StageSucceeded,
    /// Transient failure, the stage will be re-invoked after backoff
    StageRetrying,
    /// Retry budget exhausted; waits for resume
    RunStalled,
    RunCompleted,
    RunFailed,
    RunResumed,
    RunCancelled,
    /// The recurring follow-up sweep finished
    FollowupSwept,
}

/// An event in a run's life
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: WorkflowEventKind,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub stage: Option<Stage>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl WorkflowEvent {
    pub fn new(kind: WorkflowEventKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            run_id: None,
            stage: None,
            data: None,
        }
    }

    pub fn for_run(kind: WorkflowEventKind, run_id: &str) -> Self {
        Self::new(kind).with_run(run_id)
    }

    pub fn with_run(mut self, run_id: &str) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}
