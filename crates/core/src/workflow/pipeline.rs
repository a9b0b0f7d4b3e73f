//! # Pipeline Stages
//!
//! The fixed seven-stage topology and the state machine that derives a run's
//! status and current stage from its attempt history.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::state::{Intervention, InterventionKind, StageAttempt};

/// Stage of the SDLC pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Pull candidate requirements out of conversations
    Extraction,
    /// Deduplicate, merge and flag weak candidates
    Validation,
    /// Rank accepted requirements by business weight
    Prioritization,
    /// Cluster ranked requirements into epics
    EpicGeneration,
    /// Decompose epics into user stories
    StoryGeneration,
    /// Schedule the planning meeting and assign action items
    MeetingCoordination,
    /// Chase open action items
    Followup,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 7] = [
        Stage::Extraction,
        Stage::Validation,
        Stage::Prioritization,
        Stage::EpicGeneration,
        Stage::StoryGeneration,
        Stage::MeetingCoordination,
        Stage::Followup,
    ];

    pub fn first() -> Self {
        Stage::Extraction
    }

    /// The stage that follows this one, `None` after Followup.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Extraction => Some(Stage::Validation),
            Stage::Validation => Some(Stage::Prioritization),
            Stage::Prioritization => Some(Stage::EpicGeneration),
            Stage::EpicGeneration => Some(Stage::StoryGeneration),
            Stage::StoryGeneration => Some(Stage::MeetingCoordination),
            Stage::MeetingCoordination => Some(Stage::Followup),
            Stage::Followup => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Extraction => "extraction",
            Stage::Validation => "validation",
            Stage::Prioritization => "prioritization",
            Stage::EpicGeneration => "epic_generation",
            Stage::StoryGeneration => "story_generation",
            Stage::MeetingCoordination => "meeting_coordination",
            Stage::Followup => "followup",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Stage::ALL.into_iter().find(|stage| stage.as_str() == s)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a workflow run. Never stored independently of the
/// attempt history; see [`derive_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Stalled,
    Completed,
    Failed,
}

impl RunStatus {
    /// Completed and Failed runs are archived and never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Stalled => "stalled",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "stalled" => Some(RunStatus::Stalled),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result classification of one stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
}

impl StageOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            StageOutcome::Success => "success",
            StageOutcome::TransientFailure => "transient_failure",
            StageOutcome::PermanentFailure => "permanent_failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(StageOutcome::Success),
            "transient_failure" => Some(StageOutcome::TransientFailure),
            "permanent_failure" => Some(StageOutcome::PermanentFailure),
            _ => None,
        }
    }
}

/// The pipeline state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pipeline {
    /// Stage the run is on (the last stage for terminal runs)
    pub stage: Stage,
    pub status: RunStatus,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            stage: Stage::first(),
            status: RunStatus::Pending,
        }
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance to the next stage, completing after Followup.
    pub fn advance(&mut self) {
        match self.stage.next() {
            Some(next) => {
                self.stage = next;
                self.status = RunStatus::Running;
            }
            None => self.status = RunStatus::Completed,
        }
    }

    /// Apply one recorded attempt.
    pub fn record(&mut self, attempt: &StageAttempt) {
        if self.status.is_terminal() || attempt.stage != self.stage {
            return;
        }
        match attempt.outcome {
            StageOutcome::Success => self.advance(),
            StageOutcome::PermanentFailure => self.fail(),
            StageOutcome::TransientFailure => {
                if attempt.retry_count >= attempt.retry_ceiling {
                    self.status = RunStatus::Stalled;
                } else {
                    self.status = RunStatus::Running;
                }
            }
        }
    }

    /// Apply an operator or trigger intervention.
    pub fn intervene(&mut self, intervention: &Intervention) {
        if self.status.is_terminal() {
            return;
        }
        match intervention.kind {
            InterventionKind::Resumed => {
                if self.status == RunStatus::Stalled {
                    self.status = RunStatus::Running;
                }
            }
            InterventionKind::Cancelled => self.fail(),
        }
    }

    /// Fail the pipeline
    pub fn fail(&mut self) {
        self.status = RunStatus::Failed;
    }

    pub fn is_complete(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Replay attempts and interventions in commit order.
pub fn derive_state(history: &[StageAttempt], interventions: &[Intervention]) -> Pipeline {
    enum Entry<'a> {
        Attempt(&'a StageAttempt),
        Intervention(&'a Intervention),
    }

    let mut entries: Vec<(i64, Entry<'_>)> = history
        .iter()
        .map(|a| (a.seq, Entry::Attempt(a)))
        .chain(interventions.iter().map(|i| (i.seq, Entry::Intervention(i))))
        .collect();
    entries.sort_by_key(|(seq, _)| *seq);

    let mut pipeline = Pipeline::new();
    for (_, entry) in entries {
        match entry {
            Entry::Attempt(attempt) => pipeline.record(attempt),
            Entry::Intervention(intervention) => pipeline.intervene(intervention),
        }
    }
    pipeline
}
