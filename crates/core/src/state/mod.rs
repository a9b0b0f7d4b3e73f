pub mod artifacts;
pub mod db;
pub mod plan;
pub mod run_state;
pub mod settings;
pub mod store;

pub use db::SupermonDb;

pub use artifacts::{
    ActionItem, ActionItemStatus, Conversation, ConversationMessage, Epic, EpicPlan, EpicStatus,
    ExtractionOutput, FollowupReport, Meeting, MeetingOutput, PrioritizationOutput,
    PrioritizedRequirement, Priority, Requirement, RequirementCategory, SourceRef, StagePayload,
    Stakeholder, StoryPlan, StoryStatus, UserStory, ValidationOutput,
};
pub use plan::{PlanManager, ProjectPlan};
pub use run_state::{
    AttemptSummary, Intervention, InterventionKind, ProjectId, RunStatusReport, StageAttempt,
    WorkflowRun,
};
pub use settings::{ProjectSettings, SettingsManager};
pub use store::{CreateOrResume, PipelineStore};
