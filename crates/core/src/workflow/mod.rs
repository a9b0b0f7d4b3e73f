//! # Workflow Orchestration
//!
//! Drives a run through the fixed stage sequence and follows up on the
//! action items it leaves behind.
//!
//! ## Pipeline Flow
//!
//! ```text
//! Extraction → Validation → Prioritization → EpicGeneration → StoryGeneration → MeetingCoordination → Followup
//! ```

pub mod events;
pub mod followup;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;

pub use events::{WorkflowEvent, WorkflowEventKind};
pub use followup::{FollowupScheduler, SweepReport};
pub use orchestrator::{CancelOutcome, Orchestrator, TriggerOutcome};
pub use pipeline::{derive_state, Pipeline, RunStatus, Stage, StageOutcome};
pub use registry::{AgentDescriptor, AgentRegistry, AgentRole};
