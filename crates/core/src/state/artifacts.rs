//! # Planning Artifacts
//!
//! Requirements, epics, stories, meetings and action items produced by the
//! stage processors, plus the per-stage payloads stored on each successful
//! attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::workflow::Stage;

/// Requirement category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequirementCategory {
    #[default]
    Functional,
    NonFunctional,
    Technical,
    Business,
}

impl RequirementCategory {
    pub const ALL: [RequirementCategory; 4] = [
        RequirementCategory::Functional,
        RequirementCategory::NonFunctional,
        RequirementCategory::Technical,
        RequirementCategory::Business,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Functional => "functional",
            Self::NonFunctional => "non_functional",
            Self::Technical => "technical",
            Self::Business => "business",
        }
    }

    /// Lenient parse used on model output; unknown labels fall back to functional.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().replace(&['-', ' '][..], "_").as_str() {
            "non_functional" | "nonfunctional" | "quality" | "performance" | "security" => {
                Self::NonFunctional
            }
            "technical" | "tech" | "infrastructure" => Self::Technical,
            "business" | "commercial" => Self::Business,
            _ => Self::Functional,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::Functional => "Functional",
            Self::NonFunctional => "Non-functional",
            Self::Technical => "Technical",
            Self::Business => "Business",
        }
    }
}

impl fmt::Display for RequirementCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority level derived from the prioritization score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.85 {
            Self::Critical
        } else if score >= 0.65 {
            Self::High
        } else if score >= 0.4 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "low" => Self::Low,
            "high" => Self::High,
            "critical" => Self::Critical,
            _ => Self::Medium,
        }
    }
}

/// Pointer back to the conversation message a requirement came from.
///
/// Field order gives the ordering: earliest timestamp first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub timestamp: DateTime<Utc>,
    pub conversation_ref: String,
    pub message_id: String,
}

/// A requirement extracted from conversations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    /// Run-scoped identifier, e.g. `REQ-003`
    pub id: String,
    pub text: String,
    pub category: RequirementCategory,
    /// Extraction confidence in `[0, 1]`
    pub confidence: f64,
    /// Never empty
    pub sources: Vec<SourceRef>,
    /// Normalized fingerprint, set by validation
    #[serde(default)]
    pub dedup_key: String,
    #[serde(default)]
    pub needs_review: bool,
    #[serde(default)]
    pub review_reason: Option<String>,
}

impl Requirement {
    pub fn earliest_source(&self) -> Option<DateTime<Utc>> {
        self.sources.iter().map(|s| s.timestamp).min()
    }
}

/// A requirement with its computed rank
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrioritizedRequirement {
    pub requirement: Requirement,
    pub business_weight: f64,
    pub score: f64,
    pub priority: Priority,
    /// 1-based position in the ranking
    pub rank: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EpicStatus {
    #[default]
    Backlog,
    InProgress,
    Done,
}

impl EpicStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::InProgress => "in_progress",
            Self::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "in_progress" => Self::InProgress,
            "done" => Self::Done,
            _ => Self::Backlog,
        }
    }
}

/// A cluster of related requirements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Epic {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub status: EpicStatus,
    #[serde(default)]
    pub priority: Priority,
    /// Sum of the estimates of the epic's stories
    #[serde(default)]
    pub estimated_hours: u32,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub requirement_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    #[default]
    Todo,
    InProgress,
    Done,
}

impl StoryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "in_progress" => Self::InProgress,
            "done" => Self::Done,
            _ => Self::Todo,
        }
    }
}

/// A unit of deliverable work belonging to exactly one epic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserStory {
    pub id: String,
    pub epic_id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub status: StoryStatus,
    #[serde(default)]
    pub priority: Priority,
    pub story_points: u32,
    pub estimated_hours: u32,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub requirement_ids: Vec<String>,
    /// Issue-tracker id once published
    #[serde(default)]
    pub external_issue_id: Option<String>,
}

/// The planning meeting scheduled for a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meeting {
    pub id: String,
    pub title: String,
    pub agenda: Vec<String>,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: u32,
    pub participants: Vec<String>,
    /// Calendar-side identifier
    pub external_id: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActionItemStatus {
    #[default]
    Open,
    FollowedUp,
    Resolved,
    Expired,
}

impl ActionItemStatus {
    /// Resolved and Expired items are never reminded again.
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Resolved | Self::Expired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::FollowedUp => "followed_up",
            Self::Resolved => "resolved",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "followed_up" => Self::FollowedUp,
            "resolved" => Self::Resolved,
            "expired" => Self::Expired,
            _ => Self::Open,
        }
    }
}

impl fmt::Display for ActionItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Follow-up task assigned in the planning meeting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionItem {
    pub id: String,
    pub run_id: String,
    pub project_id: i64,
    #[serde(default)]
    pub meeting_id: Option<String>,
    pub description: String,
    pub owner: String,
    pub due_at: DateTime<Utc>,
    #[serde(default)]
    pub status: ActionItemStatus,
    #[serde(default)]
    pub followup_count: u32,
    #[serde(default)]
    pub last_followed_up_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A project participant who can own action items
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stakeholder {
    pub name: String,
    /// Handle on the messaging platform
    #[serde(default)]
    pub handle: Option<String>,
    /// Channel reminders go to; the project channel when absent
    #[serde(default)]
    pub preferred_channel: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// One message in a conversation fetched from a messaging adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: String,
    #[serde(default)]
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// A conversation referenced by a trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(default)]
    pub reference: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub messages: Vec<ConversationMessage>,
}

// ============================================================================
// Stage payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionOutput {
    pub candidates: Vec<Requirement>,
    /// Candidates dropped below the confidence floor
    pub discarded: usize,
    pub conversations: Vec<String>,
    #[serde(default)]
    pub used_heuristics: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutput {
    /// Merged requirements, review-flagged ones included
    pub requirements: Vec<Requirement>,
    /// Candidates folded into another requirement
    pub merged: usize,
    pub category_counts: BTreeMap<String, usize>,
    pub summary: String,
}

impl ValidationOutput {
    pub fn accepted(&self) -> impl Iterator<Item = &Requirement> {
        self.requirements.iter().filter(|r| !r.needs_review)
    }

    pub fn needs_review(&self) -> impl Iterator<Item = &Requirement> {
        self.requirements.iter().filter(|r| r.needs_review)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrioritizationOutput {
    pub ranked: Vec<PrioritizedRequirement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpicPlan {
    pub epics: Vec<Epic>,
    /// Epics created because clustering left requirements unassigned
    #[serde(default)]
    pub fallback_epics: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryPlan {
    pub epics: Vec<Epic>,
    pub stories: Vec<UserStory>,
}

impl StoryPlan {
    pub fn stories_for_epic<'a>(&'a self, epic_id: &'a str) -> impl Iterator<Item = &'a UserStory> {
        self.stories.iter().filter(move |s| s.epic_id == epic_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeetingOutput {
    pub meeting: Meeting,
    pub action_items: Vec<ActionItem>,
    /// True when an existing calendar entry was found and reused
    #[serde(default)]
    pub reused_existing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowupReport {
    pub action_items: Vec<ActionItem>,
    pub reminded: usize,
    pub expired: usize,
    /// Reminders still undelivered after the follow-up retry budget
    #[serde(default)]
    pub failed: usize,
}

/// Output committed with a successful stage attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StagePayload {
    Extraction(ExtractionOutput),
    Validation(ValidationOutput),
    Prioritization(PrioritizationOutput),
    EpicGeneration(EpicPlan),
    StoryGeneration(StoryPlan),
    MeetingCoordination(MeetingOutput),
    Followup(FollowupReport),
}

impl StagePayload {
    /// Stage that produces this payload.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Extraction(_) => Stage::Extraction,
            Self::Validation(_) => Stage::Validation,
            Self::Prioritization(_) => Stage::Prioritization,
            Self::EpicGeneration(_) => Stage::EpicGeneration,
            Self::StoryGeneration(_) => Stage::StoryGeneration,
            Self::MeetingCoordination(_) => Stage::MeetingCoordination,
            Self::Followup(_) => Stage::Followup,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_bands() {
        assert_eq!(Priority::from_score(0.9), Priority::Critical);
        assert_eq!(Priority::from_score(0.7), Priority::High);
        assert_eq!(Priority::from_score(0.4), Priority::Medium);
        assert_eq!(Priority::from_score(0.1), Priority::Low);
    }

    #[test]
    fn test_category_from_label() {
        assert_eq!(
            RequirementCategory::from_label("Non-Functional"),
            RequirementCategory::NonFunctional
        );
        assert_eq!(RequirementCategory::from_label("business"), RequirementCategory::Business);
        assert_eq!(RequirementCategory::from_label("???"), RequirementCategory::Functional);
    }

    #[test]
    fn test_payload_is_tagged() {
        let payload = StagePayload::Prioritization(PrioritizationOutput { ranked: vec![] });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "prioritization");
        assert_eq!(payload.stage(), Stage::Prioritization);

        let back: StagePayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }
}
