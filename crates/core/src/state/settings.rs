//! # Project Settings
//!
//! Per-project business weights, stakeholders and channel, stored as one
//! JSON document per project.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::artifacts::{RequirementCategory, Stakeholder};
use super::db::SupermonDb;
use super::run_state::ProjectId;
use crate::error::StoreError;

/// Settings the stage processors read for one project
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectSettings {
    /// Multiplier per requirement category (keyed by `functional`,
    /// `non_functional`, `technical`, `business`); missing keys weigh 1.0
    #[serde(default)]
    pub business_weights: BTreeMap<String, f64>,
    #[serde(default)]
    pub stakeholders: Vec<Stakeholder>,
    /// Channel for announcements and reminders without a preferred channel
    #[serde(default)]
    pub channel: Option<String>,
}

impl ProjectSettings {
    pub fn weight_for(&self, category: RequirementCategory) -> f64 {
        self.business_weights
            .get(category.as_str())
            .copied()
            .filter(|w| w.is_finite() && *w >= 0.0)
            .unwrap_or(1.0)
    }

    pub fn stakeholder(&self, name: &str) -> Option<&Stakeholder> {
        self.stakeholders.iter().find(|s| s.name == name)
    }
}

/// Manager for project settings
pub struct SettingsManager {
    conn: Arc<Mutex<Connection>>,
}

impl SettingsManager {
    pub fn new(db: &SupermonDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Load settings, defaults when never saved
    pub fn load(&self, project_id: ProjectId) -> Result<ProjectSettings, StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;

        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM project_settings WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )
            .optional()?;

        match data {
            Some(data) => Ok(serde_json::from_str(&data)?),
            None => Ok(ProjectSettings::default()),
        }
    }

    pub fn save(&self, project_id: ProjectId, settings: &ProjectSettings) -> Result<(), StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;

        conn.execute(
            "INSERT OR REPLACE INTO project_settings (project_id, data, updated_at) VALUES (?1, ?2, ?3)",
            params![project_id, serde_json::to_string(settings)?, Utc::now().to_rfc3339()],
        )?;

        tracing::info!(project_id, stakeholders = settings.stakeholders.len(), "Saved project settings");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_roundtrip_and_defaults() {
        let db = SupermonDb::open_in_memory().unwrap();
        let manager = SettingsManager::new(&db);

        let empty = manager.load(42).unwrap();
        assert_eq!(empty, ProjectSettings::default());
        assert_eq!(empty.weight_for(RequirementCategory::Business), 1.0);

        let mut settings = ProjectSettings::default();
        settings.business_weights.insert("business".into(), 1.5);
        settings.stakeholders.push(Stakeholder {
            name: "alice".into(),
            handle: Some("@alice".into()),
            preferred_channel: Some("D-alice".into()),
            role: Some("product".into()),
        });
        manager.save(42, &settings).unwrap();

        let loaded = manager.load(42).unwrap();
        assert_eq!(loaded.weight_for(RequirementCategory::Business), 1.5);
        assert_eq!(loaded.weight_for(RequirementCategory::Technical), 1.0);
        assert!(loaded.stakeholder("alice").is_some());
    }

    #[test]
    fn test_negative_weight_ignored() {
        let mut settings = ProjectSettings::default();
        settings.business_weights.insert("technical".into(), -2.0);
        assert_eq!(settings.weight_for(RequirementCategory::Technical), 1.0);
    }
}
