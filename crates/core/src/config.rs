//! # Workflow Configuration
//!
//! Tunables for retries, thresholds, timeouts and meeting defaults. Every
//! field has a default, so a partial `.supermon/config.json` is valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::adapters::{BackoffPolicy, RetryPolicy};

/// Default config file location
pub const DEFAULT_CONFIG_PATH: &str = ".supermon/config.json";

/// Confidence thresholds used by extraction and validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Candidates below this are discarded during extraction
    pub confidence_floor: f64,
    /// Requirements below this are flagged for review, not accepted
    pub acceptance_threshold: f64,
    /// Confidence assigned to keyword-extracted candidates
    pub heuristic_confidence: f64,
    /// Requirements with fewer meaningful words are flagged for review
    pub min_meaningful_words: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            confidence_floor: 0.3,
            acceptance_threshold: 0.5,
            heuristic_confidence: 0.5,
            min_meaningful_words: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Upper bound for one stage invocation
    pub stage_timeout_ms: u64,
    /// Upper bound for one adapter call
    pub adapter_call_timeout_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            stage_timeout_ms: 300_000,
            adapter_call_timeout_ms: 60_000,
        }
    }
}

impl Timeouts {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms.max(1))
    }

    pub fn adapter_call_timeout(&self) -> Duration {
        Duration::from_millis(self.adapter_call_timeout_ms.max(1))
    }
}

/// Planning meeting and action-item defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeetingConfig {
    pub duration_minutes: u32,
    /// How far ahead of the coordination stage the meeting is placed
    pub lead_time_hours: i64,
    /// Action items fall due this many days after the meeting
    pub action_item_due_days: i64,
    /// Owner when the project has no stakeholders
    pub default_owner: String,
    pub announcement_channel: String,
    /// Minimum gap between two reminders for the same item
    pub reminder_interval_hours: i64,
}

impl Default for MeetingConfig {
    fn default() -> Self {
        Self {
            duration_minutes: 60,
            lead_time_hours: 24,
            action_item_due_days: 7,
            default_owner: "product-owner".to_string(),
            announcement_channel: "general".to_string(),
            reminder_interval_hours: 24,
        }
    }
}

/// Story estimation defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanningConfig {
    pub hours_per_point: u32,
    pub default_story_points: u32,
    pub max_story_points: u32,
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            hours_per_point: 4,
            default_story_points: 3,
            max_story_points: 13,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Retry ceilings and backoff for pipeline stages
    pub retry: RetryPolicy,
    /// Retry ceiling and backoff for the recurring follow-up sweep
    pub followup_retry: RetryPolicy,
    pub thresholds: Thresholds,
    pub timeouts: Timeouts,
    pub meeting: MeetingConfig,
    pub planning: PlanningConfig,
    /// Period of the recurring follow-up sweep
    pub followup_interval_secs: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            followup_retry: RetryPolicy {
                default_ceiling: 3,
                per_stage: Default::default(),
                backoff: BackoffPolicy {
                    base_delay_ms: 1_000,
                    max_delay_ms: 60_000,
                    jitter: 0.25,
                },
            },
            thresholds: Thresholds::default(),
            timeouts: Timeouts::default(),
            meeting: MeetingConfig::default(),
            planning: PlanningConfig::default(),
            followup_interval_secs: 3_600,
        }
    }
}

impl WorkflowConfig {
    pub fn default_path() -> PathBuf {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path`, defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Save as pretty JSON, creating the parent directory.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config {}", path.display()))
    }

    /// Apply a partial update. Objects merge key by key; other values replace.
    pub fn merge(&mut self, patch: &Value) -> Result<()> {
        let mut current = serde_json::to_value(&*self)?;
        merge_values(&mut current, patch);
        *self = serde_json::from_value(current).context("Config patch does not fit the schema")?;
        Ok(())
    }

    pub fn followup_interval(&self) -> Duration {
        Duration::from_secs(self.followup_interval_secs.max(1))
    }

    /// Override selected fields from `SUPERMON_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            let raw = lookup(key)?;
            match raw.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "Ignoring unparseable config override");
                    None
                }
            }
        }

        if let Some(ceiling) = parsed(&lookup, "SUPERMON_RETRY_CEILING") {
            self.retry.default_ceiling = ceiling;
        }
        if let Some(ms) = parsed(&lookup, "SUPERMON_STAGE_TIMEOUT_MS") {
            self.timeouts.stage_timeout_ms = ms;
        }
        if let Some(ms) = parsed(&lookup, "SUPERMON_ADAPTER_TIMEOUT_MS") {
            self.timeouts.adapter_call_timeout_ms = ms;
        }
        if let Some(secs) = parsed(&lookup, "SUPERMON_FOLLOWUP_INTERVAL_SECS") {
            self.followup_interval_secs = secs;
        }
        if let Some(channel) = lookup("SUPERMON_ANNOUNCEMENT_CHANNEL") {
            self.meeting.announcement_channel = channel;
        }
    }
}

fn merge_values(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_values(existing, value)
                    }
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}
