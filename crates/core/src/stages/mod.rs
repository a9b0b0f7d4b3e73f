//! # Stage Processors
//!
//! One processor per pipeline stage. A processor reads the prior stages'
//! committed outputs and the external world through its scoped
//! capabilities, and returns a payload or a classified failure. It never
//! writes run state itself; the orchestrator records the attempt.

pub mod epic_generation;
pub mod extraction;
pub mod followup;
pub mod meeting;
pub mod prioritization;
pub mod prompts;
pub mod story_generation;
pub mod validation;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::adapters::{IdempotencyKey, RetryPolicy, ScopedCapabilities};
use crate::config::{MeetingConfig, PlanningConfig, Thresholds, WorkflowConfig};
use crate::error::StageError;
use crate::state::{
    EpicPlan, ExtractionOutput, MeetingOutput, PrioritizationOutput, ProjectId, ProjectSettings,
    StagePayload, StoryPlan, ValidationOutput, WorkflowRun,
};
use crate::workflow::Stage;

pub use epic_generation::EpicGenerationProcessor;
pub use extraction::ExtractionProcessor;
pub use followup::FollowupProcessor;
pub use meeting::MeetingCoordinationProcessor;
pub use prioritization::PrioritizationProcessor;
pub use story_generation::StoryGenerationProcessor;
pub use validation::ValidationProcessor;

/// Everything a processor knows about the attempt it is serving
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub project_id: ProjectId,
    pub stage: Stage,
    pub attempt: u32,
    pub conversation_refs: Vec<String>,
    pub settings: ProjectSettings,
    pub thresholds: Thresholds,
    pub meeting: MeetingConfig,
    pub planning: PlanningConfig,
    pub followup_retry: RetryPolicy,
    /// Clock reading taken when the attempt started
    pub now: DateTime<Utc>,
}

impl RunContext {
    pub fn new(
        run: &WorkflowRun,
        stage: Stage,
        attempt: u32,
        settings: ProjectSettings,
        config: &WorkflowConfig,
    ) -> Self {
        Self {
            run_id: run.id.clone(),
            project_id: run.project_id,
            stage,
            attempt,
            conversation_refs: run.conversation_refs.clone(),
            settings,
            thresholds: config.thresholds.clone(),
            meeting: config.meeting.clone(),
            planning: config.planning.clone(),
            followup_retry: config.followup_retry.clone(),
            now: Utc::now(),
        }
    }

    /// Idempotency key for an external effect of this stage.
    pub fn key(&self, scope: &str) -> IdempotencyKey {
        IdempotencyKey::new(&self.run_id, self.stage, scope)
    }

    /// Project channel, else the configured announcement channel
    pub fn channel(&self) -> String {
        self.settings
            .channel
            .clone()
            .unwrap_or_else(|| self.meeting.announcement_channel.clone())
    }
}

/// Committed outputs of earlier stages, keyed by stage
#[derive(Debug, Clone, Default)]
pub struct PriorOutputs {
    outputs: BTreeMap<Stage, (String, StagePayload)>,
}

fn missing(stage: Stage) -> StageError {
    StageError::Permanent(format!("output of stage {} is not available", stage))
}

impl PriorOutputs {
    /// Successful payloads of the run, by stage.
    pub fn from_run(run: &WorkflowRun) -> Self {
        let mut outputs = Self::default();
        for attempt in &run.history {
            if let Some(payload) = &attempt.payload {
                outputs.insert(attempt.reference(), payload.clone());
            }
        }
        outputs
    }

    pub fn insert(&mut self, reference: String, payload: StagePayload) {
        self.outputs.insert(payload.stage(), (reference, payload));
    }

    pub fn with(mut self, reference: &str, payload: StagePayload) -> Self {
        self.insert(reference.to_string(), payload);
        self
    }

    /// References to the outputs of `stages` that are present.
    pub fn snapshot(&self, stages: &[Stage]) -> Vec<String> {
        stages
            .iter()
            .filter_map(|s| self.outputs.get(s).map(|(r, _)| r.clone()))
            .collect()
    }

    fn get(&self, stage: Stage) -> Option<&StagePayload> {
        self.outputs.get(&stage).map(|(_, p)| p)
    }

    pub fn extraction(&self) -> Result<&ExtractionOutput, StageError> {
        match self.get(Stage::Extraction) {
            Some(StagePayload::Extraction(out)) => Ok(out),
            _ => Err(missing(Stage::Extraction)),
        }
    }

    pub fn validation(&self) -> Result<&ValidationOutput, StageError> {
        match self.get(Stage::Validation) {
            Some(StagePayload::Validation(out)) => Ok(out),
            _ => Err(missing(Stage::Validation)),
        }
    }

    pub fn prioritization(&self) -> Result<&PrioritizationOutput, StageError> {
        match self.get(Stage::Prioritization) {
            Some(StagePayload::Prioritization(out)) => Ok(out),
            _ => Err(missing(Stage::Prioritization)),
        }
    }

    pub fn epics(&self) -> Result<&EpicPlan, StageError> {
        match self.get(Stage::EpicGeneration) {
            Some(StagePayload::EpicGeneration(out)) => Ok(out),
            _ => Err(missing(Stage::EpicGeneration)),
        }
    }

    pub fn stories(&self) -> Result<&StoryPlan, StageError> {
        match self.get(Stage::StoryGeneration) {
            Some(StagePayload::StoryGeneration(out)) => Ok(out),
            _ => Err(missing(Stage::StoryGeneration)),
        }
    }

    pub fn meeting(&self) -> Result<&MeetingOutput, StageError> {
        match self.get(Stage::MeetingCoordination) {
            Some(StagePayload::MeetingCoordination(out)) => Ok(out),
            _ => Err(missing(Stage::MeetingCoordination)),
        }
    }
}

/// A pipeline stage's unit of work
#[async_trait]
pub trait StageProcessor: Send + Sync {
    fn stage(&self) -> Stage;

    /// Stages whose outputs this processor reads
    fn inputs(&self) -> &'static [Stage] {
        &[]
    }

    async fn process(
        &self,
        ctx: &RunContext,
        prior: &PriorOutputs,
        caps: &ScopedCapabilities,
    ) -> Result<StagePayload, StageError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for processor tests.

    use super::*;
    use crate::adapters::{AdapterRegistry, Capability, CapabilityAdapter};
    use crate::state::{Requirement, RequirementCategory, SourceRef};
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    pub fn context(stage: Stage) -> RunContext {
        let run = WorkflowRun::new(42, Some("slack:C42"));
        let mut ctx = RunContext::new(&run, stage, 1, ProjectSettings::default(), &WorkflowConfig::default());
        ctx.run_id = "run-42".to_string();
        ctx.now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        ctx
    }

    pub fn scoped(adapters: Vec<Arc<dyn CapabilityAdapter>>, allowed: &[Capability]) -> ScopedCapabilities {
        let mut registry = AdapterRegistry::new(Duration::from_secs(5));
        for adapter in adapters {
            registry.register(adapter);
        }
        registry.scoped(allowed, Instant::now() + Duration::from_secs(30))
    }

    pub fn requirement(id: &str, text: &str, category: RequirementCategory, confidence: f64, minute: u32) -> Requirement {
        Requirement {
            id: id.to_string(),
            text: text.to_string(),
            category,
            confidence,
            sources: vec![SourceRef {
                timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 10, minute, 0).unwrap(),
                conversation_ref: "slack:C42".to_string(),
                message_id: format!("m{}", minute),
            }],
            dedup_key: String::new(),
            needs_review: false,
            review_reason: None,
        }
    }
}
