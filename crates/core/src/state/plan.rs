//! # Plan Manager
//!
//! Relational view of what runs produced: requirements, epics, stories,
//! meetings and action items. Writes happen inside the store's attempt
//! transaction; reads back the API and the follow-up scheduler.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

use super::artifacts::{
    ActionItem, ActionItemStatus, Epic, EpicStatus, Meeting, Priority, Requirement,
    RequirementCategory, StagePayload, StoryStatus, UserStory,
};
use super::db::SupermonDb;
use super::run_state::{ProjectId, WorkflowRun};
use super::store::parse_timestamp;
use crate::error::StoreError;

/// Epics and stories of one run, with the requirements they cover
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectPlan {
    pub project_id: ProjectId,
    pub run_id: String,
    pub requirements: Vec<Requirement>,
    pub epics: Vec<Epic>,
    pub stories: Vec<UserStory>,
    #[serde(default)]
    pub meeting: Option<Meeting>,
}

/// Write the relational artifacts a successful attempt produced.
pub(crate) fn persist_payload(
    conn: &Connection,
    run: &WorkflowRun,
    payload: &StagePayload,
) -> Result<(), StoreError> {
    match payload {
        StagePayload::Validation(output) => {
            for req in &output.requirements {
                conn.execute(
                    r#"
                    INSERT OR REPLACE INTO requirements
                        (run_id, id, project_id, text, category, confidence, dedup_key,
                         needs_review, review_reason, sources_json)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                    "#,
                    params![
                        run.id,
                        req.id,
                        run.project_id,
                        req.text,
                        req.category.as_str(),
                        req.confidence,
                        req.dedup_key,
                        req.needs_review,
                        req.review_reason,
                        serde_json::to_string(&req.sources)?,
                    ],
                )?;
            }
        }
        StagePayload::StoryGeneration(plan) => {
            for (position, epic) in plan.epics.iter().enumerate() {
                conn.execute(
                    r#"
                    INSERT OR REPLACE INTO epics
                        (run_id, id, project_id, title, description, status, priority,
                         estimated_hours, acceptance_criteria_json, position)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                    "#,
                    params![
                        run.id,
                        epic.id,
                        run.project_id,
                        epic.title,
                        epic.description,
                        epic.status.as_str(),
                        epic.priority.as_str(),
                        epic.estimated_hours,
                        serde_json::to_string(&epic.acceptance_criteria)?,
                        position as i64,
                    ],
                )?;
                for req_id in &epic.requirement_ids {
                    conn.execute(
                        "INSERT OR IGNORE INTO epic_requirements (run_id, epic_id, requirement_id) VALUES (?1, ?2, ?3)",
                        params![run.id, epic.id, req_id],
                    )?;
                }
            }
            for (position, story) in plan.stories.iter().enumerate() {
                conn.execute(
                    r#"
                    INSERT OR REPLACE INTO user_stories
                        (run_id, id, epic_id, project_id, title, description, status, priority,
                         story_points, estimated_hours, acceptance_criteria_json, external_issue_id, position)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                    "#,
                    params![
                        run.id,
                        story.id,
                        story.epic_id,
                        run.project_id,
                        story.title,
                        story.description,
                        story.status.as_str(),
                        story.priority.as_str(),
                        story.story_points,
                        story.estimated_hours,
                        serde_json::to_string(&story.acceptance_criteria)?,
                        story.external_issue_id,
                        position as i64,
                    ],
                )?;
                for req_id in &story.requirement_ids {
                    conn.execute(
                        "INSERT OR IGNORE INTO story_requirements (run_id, story_id, requirement_id) VALUES (?1, ?2, ?3)",
                        params![run.id, story.id, req_id],
                    )?;
                }
            }
        }
        StagePayload::MeetingCoordination(output) => {
            let meeting = &output.meeting;
            conn.execute(
                r#"
                INSERT OR REPLACE INTO meetings
                    (id, run_id, project_id, title, agenda_json, scheduled_at, duration_minutes,
                     participants_json, external_id, idempotency_key)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    meeting.id,
                    run.id,
                    run.project_id,
                    meeting.title,
                    serde_json::to_string(&meeting.agenda)?,
                    meeting.scheduled_at.to_rfc3339(),
                    meeting.duration_minutes,
                    serde_json::to_string(&meeting.participants)?,
                    meeting.external_id,
                    meeting.idempotency_key,
                ],
            )?;
            for item in &output.action_items {
                upsert_action_item(conn, item)?;
            }
        }
        StagePayload::Followup(report) => {
            for item in &report.action_items {
                upsert_action_item(conn, item)?;
            }
        }
        StagePayload::Extraction(_)
        | StagePayload::Prioritization(_)
        | StagePayload::EpicGeneration(_) => {}
    }
    Ok(())
}

fn upsert_action_item(conn: &Connection, item: &ActionItem) -> Result<(), StoreError> {
    conn.execute(
        r#"
        INSERT INTO action_items
            (id, run_id, project_id, meeting_id, description, owner, due_at, status,
             followup_count, last_followed_up_at, last_error, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ON CONFLICT(id) DO UPDATE SET
            status = excluded.status,
            followup_count = excluded.followup_count,
            last_followed_up_at = excluded.last_followed_up_at,
            last_error = excluded.last_error
        "#,
        params![
            item.id,
            item.run_id,
            item.project_id,
            item.meeting_id,
            item.description,
            item.owner,
            item.due_at.to_rfc3339(),
            item.status.as_str(),
            item.followup_count,
            item.last_followed_up_at.map(|t| t.to_rfc3339()),
            item.last_error,
            item.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

const ACTION_ITEM_COLUMNS: &str = "id, run_id, project_id, meeting_id, description, owner, due_at, status, \
     followup_count, last_followed_up_at, last_error, created_at";

fn row_to_action_item(row: &rusqlite::Row) -> rusqlite::Result<ActionItem> {
    let due_at: String = row.get(6)?;
    let status: String = row.get(7)?;
    let last_followed_up_at: Option<String> = row.get(9)?;
    let created_at: String = row.get(11)?;

    Ok(ActionItem {
        id: row.get(0)?,
        run_id: row.get(1)?,
        project_id: row.get(2)?,
        meeting_id: row.get(3)?,
        description: row.get(4)?,
        owner: row.get(5)?,
        due_at: parse_timestamp(&due_at),
        status: ActionItemStatus::parse(&status),
        followup_count: row.get(8)?,
        last_followed_up_at: last_followed_up_at.as_deref().map(parse_timestamp),
        last_error: row.get(10)?,
        created_at: parse_timestamp(&created_at),
    })
}

/// Read side of the planning artifacts
pub struct PlanManager {
    conn: Arc<Mutex<Connection>>,
}

impl PlanManager {
    pub fn new(db: &SupermonDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }

    /// Plan of the project's most recent run that produced stories
    pub fn plan_for_project(&self, project_id: ProjectId) -> Result<Option<ProjectPlan>, StoreError> {
        let run_id: Option<String> = {
            let conn = self.lock()?;
            conn.query_row(
                r#"
                SELECT r.id FROM workflow_runs r
                WHERE r.project_id = ?1 AND EXISTS (SELECT 1 FROM epics e WHERE e.run_id = r.id)
                ORDER BY r.created_at DESC, r.rowid DESC LIMIT 1
                "#,
                params![project_id],
                |row| row.get(0),
            )
            .optional()?
        };

        match run_id {
            Some(run_id) => Ok(Some(ProjectPlan {
                project_id,
                requirements: self.requirements_for_run(&run_id)?,
                epics: self.epics_for_run(&run_id)?,
                stories: self.stories_for_run(&run_id)?,
                meeting: self.meeting_for_run(&run_id)?,
                run_id,
            })),
            None => Ok(None),
        }
    }

    pub fn requirements_for_run(&self, run_id: &str) -> Result<Vec<Requirement>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, text, category, confidence, dedup_key, needs_review, review_reason, sources_json
            FROM requirements WHERE run_id = ?1 ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, bool>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;

        let mut requirements = Vec::new();
        for row in rows {
            let (id, text, category, confidence, dedup_key, needs_review, review_reason, sources) = row?;
            requirements.push(Requirement {
                id,
                text,
                category: RequirementCategory::from_label(&category),
                confidence,
                sources: serde_json::from_str(&sources)?,
                dedup_key,
                needs_review,
                review_reason,
            });
        }
        Ok(requirements)
    }

    pub fn epics_for_run(&self, run_id: &str) -> Result<Vec<Epic>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, title, description, status, priority, estimated_hours, acceptance_criteria_json
            FROM epics WHERE run_id = ?1 ORDER BY position
            "#,
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, u32>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut epics = Vec::new();
        for row in rows {
            let (id, title, description, status, priority, estimated_hours, criteria) = row?;
            let requirement_ids = linked_requirements(&conn, "epic_requirements", "epic_id", run_id, &id)?;
            epics.push(Epic {
                id,
                title,
                description,
                status: EpicStatus::parse(&status),
                priority: Priority::parse(&priority),
                estimated_hours,
                acceptance_criteria: serde_json::from_str(&criteria)?,
                requirement_ids,
            });
        }
        Ok(epics)
    }

    pub fn stories_for_run(&self, run_id: &str) -> Result<Vec<UserStory>, StoreError> {
        let conn = self.lock()?;
        let ids: Vec<String> = {
            let mut stmt = conn.prepare("SELECT id FROM user_stories WHERE run_id = ?1 ORDER BY position")?;
            let rows = stmt.query_map(params![run_id], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        ids.iter().map(|id| load_story(&conn, run_id, id)).collect()
    }

    /// Coverage query: stories of a run that reference the requirement
    pub fn stories_for_requirement(
        &self,
        run_id: &str,
        requirement_id: &str,
    ) -> Result<Vec<UserStory>, StoreError> {
        let conn = self.lock()?;
        let ids: Vec<String> = {
            let mut stmt = conn.prepare(
                r#"
                SELECT s.id FROM user_stories s
                JOIN story_requirements sr ON sr.run_id = s.run_id AND sr.story_id = s.id
                WHERE s.run_id = ?1 AND sr.requirement_id = ?2
                ORDER BY s.position
                "#,
            )?;
            let rows = stmt.query_map(params![run_id, requirement_id], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        ids.iter().map(|id| load_story(&conn, run_id, id)).collect()
    }

    /// Accepted requirements of a run that no story references
    pub fn uncovered_requirements(&self, run_id: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT r.id FROM requirements r
            WHERE r.run_id = ?1 AND r.needs_review = 0
              AND NOT EXISTS (
                SELECT 1 FROM story_requirements sr
                WHERE sr.run_id = r.run_id AND sr.requirement_id = r.id
              )
            ORDER BY r.id
            "#,
        )?;
        let rows = stmt.query_map(params![run_id], |row| row.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn meeting_for_run(&self, run_id: &str) -> Result<Option<Meeting>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                r#"
                SELECT id, title, agenda_json, scheduled_at, duration_minutes, participants_json,
                       external_id, idempotency_key
                FROM meetings WHERE run_id = ?1
                "#,
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, u32>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((id, title, agenda, scheduled_at, duration_minutes, participants, external_id, key)) => {
                Ok(Some(Meeting {
                    id,
                    title,
                    agenda: serde_json::from_str(&agenda)?,
                    scheduled_at: parse_timestamp(&scheduled_at),
                    duration_minutes,
                    participants: serde_json::from_str(&participants)?,
                    external_id,
                    idempotency_key: key,
                }))
            }
            None => Ok(None),
        }
    }

    /// Action items, optionally restricted to one project
    pub fn action_items(&self, project_id: Option<ProjectId>) -> Result<Vec<ActionItem>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM action_items WHERE (?1 IS NULL OR project_id = ?1) ORDER BY due_at, id",
            ACTION_ITEM_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![project_id], row_to_action_item)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Open or followed-up items whose run already completed
    pub fn open_items_of_completed_runs(&self) -> Result<Vec<ActionItem>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            r#"
            SELECT {} FROM action_items a
            WHERE a.status IN ('open', 'followed_up')
              AND EXISTS (SELECT 1 FROM workflow_runs r WHERE r.id = a.run_id AND r.status = 'completed')
            ORDER BY a.run_id, a.due_at, a.id
            "#,
            ACTION_ITEM_COLUMNS
                .split(", ")
                .map(|c| format!("a.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_action_item)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Persist follow-up progress made outside a stage attempt.
    ///
    /// Items resolved in the meantime keep their resolution.
    pub fn update_action_items(&self, items: &[ActionItem]) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for item in items {
            tx.execute(
                r#"
                UPDATE action_items
                SET status = ?1, followup_count = ?2, last_followed_up_at = ?3, last_error = ?4
                WHERE id = ?5 AND status != 'resolved'
                "#,
                params![
                    item.status.as_str(),
                    item.followup_count,
                    item.last_followed_up_at.map(|t| t.to_rfc3339()),
                    item.last_error,
                    item.id,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Mark an open item resolved.
    pub fn resolve_action_item(&self, id: &str) -> Result<ActionItem, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM action_items WHERE id = ?1", ACTION_ITEM_COLUMNS);
        let mut item = conn
            .query_row(&sql, params![id], row_to_action_item)
            .optional()?
            .ok_or_else(|| StoreError::ActionItemNotFound(id.to_string()))?;

        if item.status.is_closed() {
            return Err(StoreError::ActionItemClosed {
                id: id.to_string(),
                status: item.status.to_string(),
            });
        }

        conn.execute(
            "UPDATE action_items SET status = 'resolved', last_error = NULL WHERE id = ?1",
            params![id],
        )?;
        item.status = ActionItemStatus::Resolved;
        item.last_error = None;

        tracing::info!(action_item = %id, resolved_at = %Utc::now(), "Action item resolved");
        Ok(item)
    }
}

fn linked_requirements(
    conn: &Connection,
    table: &str,
    owner_column: &str,
    run_id: &str,
    owner_id: &str,
) -> Result<Vec<String>, StoreError> {
    let sql = format!(
        "SELECT requirement_id FROM {} WHERE run_id = ?1 AND {} = ?2 ORDER BY requirement_id",
        table, owner_column
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![run_id, owner_id], |row| row.get(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
}

fn load_story(conn: &Connection, run_id: &str, id: &str) -> Result<UserStory, StoreError> {
    let (epic_id, title, description, status, priority, story_points, estimated_hours, criteria, external) =
        conn.query_row(
            r#"
            SELECT epic_id, title, description, status, priority, story_points, estimated_hours,
                   acceptance_criteria_json, external_issue_id
            FROM user_stories WHERE run_id = ?1 AND id = ?2
            "#,
            params![run_id, id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, u32>(5)?,
                    row.get::<_, u32>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, Option<String>>(8)?,
                ))
            },
        )?;

    Ok(UserStory {
        id: id.to_string(),
        epic_id,
        title,
        description,
        status: StoryStatus::parse(&status),
        priority: Priority::parse(&priority),
        story_points,
        estimated_hours,
        acceptance_criteria: serde_json::from_str(&criteria)?,
        requirement_ids: linked_requirements(conn, "story_requirements", "story_id", run_id, id)?,
        external_issue_id: external,
    })
}
