//! # Pipeline Store
//!
//! Durable record of workflow runs and their append-only attempt history.
//! Every mutation happens in one SQLite transaction; a successful attempt and
//! the artifacts it produced commit together.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use super::artifacts::StagePayload;
use super::db::SupermonDb;
use super::plan;
use super::run_state::{Intervention, InterventionKind, ProjectId, StageAttempt, WorkflowRun};
use crate::error::StoreError;
use crate::workflow::{RunStatus, Stage, StageOutcome};

/// Result of `create_or_resume_run`
#[derive(Debug, Clone)]
pub struct CreateOrResume {
    pub run: WorkflowRun,
    /// A fresh run was created
    pub created: bool,
    /// The trigger's conversation ref was added to a pending run
    pub ref_added: bool,
    /// A stalled run was reopened by the trigger
    pub resumed: bool,
}

/// Store for runs, attempts and interventions
pub struct PipelineStore {
    conn: Arc<Mutex<Connection>>,
    /// Projects whose active run is committing an attempt right now
    committing: Mutex<HashSet<ProjectId>>,
}

/// Removes the project from the committing set when dropped.
struct CommitGuard<'a> {
    committing: &'a Mutex<HashSet<ProjectId>>,
    project_id: ProjectId,
}

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.committing.lock() {
            set.remove(&self.project_id);
        }
    }
}

impl PipelineStore {
    pub fn new(db: &SupermonDb) -> Self {
        Self {
            conn: db.connection(),
            committing: Mutex::new(HashSet::new()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }

    fn is_committing(&self, project_id: ProjectId) -> Result<bool, StoreError> {
        let set = self
            .committing
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
        Ok(set.contains(&project_id))
    }

    fn begin_commit(&self, project_id: ProjectId) -> Result<CommitGuard<'_>, StoreError> {
        let mut set = self
            .committing
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
        set.insert(project_id);
        Ok(CommitGuard {
            committing: &self.committing,
            project_id,
        })
    }

    /// Return the project's active run or create one.
    ///
    /// A pending run absorbs the new conversation ref, a stalled run is
    /// reopened, a running run is returned unchanged. Fails with
    /// `AlreadyActiveConflict` while the active run is mid-commit.
    pub fn create_or_resume_run(
        &self,
        project_id: ProjectId,
        conversation_ref: Option<&str>,
    ) -> Result<CreateOrResume, StoreError> {
        if self.is_committing(project_id)? {
            return Err(StoreError::AlreadyActiveConflict(project_id));
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let active_id: Option<String> = tx
            .query_row(
                "SELECT id FROM workflow_runs WHERE project_id = ?1 AND archived = 0",
                params![project_id],
                |row| row.get(0),
            )
            .optional()?;

        let outcome = match active_id {
            Some(run_id) => {
                let mut run = load_run_conn(&tx, &run_id)?;
                let mut ref_added = false;
                let mut resumed = false;

                match run.status {
                    RunStatus::Pending => {
                        if let Some(r) = conversation_ref {
                            if !run.conversation_refs.iter().any(|existing| existing == r) {
                                run.conversation_refs.push(r.to_string());
                                ref_added = true;
                            }
                        }
                    }
                    RunStatus::Stalled => {
                        let intervention = Intervention {
                            kind: InterventionKind::Resumed,
                            stage: run.current_stage,
                            note: Some("new trigger".to_string()),
                            at: Utc::now(),
                            seq: run.last_seq() + 1,
                        };
                        insert_intervention(&tx, &run.id, &intervention)?;
                        run.interventions.push(intervention);
                        run.refresh();
                        resumed = true;
                    }
                    _ => {}
                }

                if ref_added || resumed {
                    run.updated_at = Utc::now();
                    update_projection(&tx, &run)?;
                }

                tracing::info!(
                    run_id = %run.id,
                    project_id,
                    status = %run.status,
                    ref_added,
                    resumed,
                    "Trigger coalesced into active run"
                );

                CreateOrResume {
                    run,
                    created: false,
                    ref_added,
                    resumed,
                }
            }
            None => {
                let run = WorkflowRun::new(project_id, conversation_ref);
                tx.execute(
                    r#"
                    INSERT INTO workflow_runs
                        (id, project_id, conversation_refs_json, status, current_stage, archived, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7)
                    "#,
                    params![
                        run.id,
                        run.project_id,
                        serde_json::to_string(&run.conversation_refs)?,
                        run.status.as_str(),
                        run.current_stage.as_str(),
                        run.created_at.to_rfc3339(),
                        run.updated_at.to_rfc3339(),
                    ],
                )
                .map_err(|e| match e {
                    rusqlite::Error::SqliteFailure(err, _)
                        if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        StoreError::AlreadyActiveConflict(project_id)
                    }
                    other => StoreError::Sqlite(other),
                })?;

                tracing::info!(run_id = %run.id, project_id, "Created workflow run");

                CreateOrResume {
                    run,
                    created: true,
                    ref_added: conversation_ref.is_some(),
                    resumed: false,
                }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// Append an attempt to a run's history.
    ///
    /// Rejects attempts for a stage the run has moved past (`StaleRun`) and
    /// reused attempt numbers (`DuplicateAttempt`). On success the stage's
    /// artifacts are written in the same transaction.
    pub fn record_attempt(
        &self,
        run_id: &str,
        mut attempt: StageAttempt,
    ) -> Result<WorkflowRun, StoreError> {
        let mut conn = self.lock()?;

        let project_id: ProjectId = conn
            .query_row(
                "SELECT project_id FROM workflow_runs WHERE id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;

        let _guard = self.begin_commit(project_id)?;
        let tx = conn.transaction()?;

        let mut run = load_run_conn(&tx, run_id)?;
        if run.archived {
            return Err(StoreError::RunTerminal(run_id.to_string()));
        }

        let accepting = matches!(run.status, RunStatus::Pending | RunStatus::Running);
        if !accepting || run.current_stage != attempt.stage {
            return Err(StoreError::StaleRun {
                run_id: run_id.to_string(),
                current: format!("{} ({})", run.current_stage, run.status),
                declared: attempt.stage,
            });
        }

        if attempt.attempt < run.next_attempt_number(attempt.stage) {
            return Err(StoreError::DuplicateAttempt {
                run_id: run_id.to_string(),
                stage: attempt.stage,
                attempt: attempt.attempt,
            });
        }

        if attempt.outcome == StageOutcome::Success && attempt.payload.is_none() {
            return Err(StoreError::Serialization(serde::de::Error::custom(
                "successful attempt carries no payload",
            )));
        }

        attempt.seq = run.last_seq() + 1;
        insert_attempt(&tx, run_id, &attempt)?;

        if let (StageOutcome::Success, Some(payload)) = (attempt.outcome, &attempt.payload) {
            plan::persist_payload(&tx, &run, payload)?;
        }

        run.history.push(attempt);
        run.refresh();
        run.updated_at = Utc::now();
        update_projection(&tx, &run)?;

        tx.commit()?;

        tracing::debug!(
            run_id = %run.id,
            project_id,
            status = %run.status,
            stage = %run.current_stage,
            "Recorded stage attempt"
        );

        Ok(run)
    }

    /// Load a run with its full history
    pub fn load_run(&self, run_id: &str) -> Result<WorkflowRun, StoreError> {
        let conn = self.lock()?;
        load_run_conn(&conn, run_id)
    }

    /// The project's non-archived run, if any
    pub fn active_run(&self, project_id: ProjectId) -> Result<Option<WorkflowRun>, StoreError> {
        let conn = self.lock()?;
        let id: Option<String> = conn
            .query_row(
                "SELECT id FROM workflow_runs WHERE project_id = ?1 AND archived = 0",
                params![project_id],
                |row| row.get(0),
            )
            .optional()?;
        id.map(|id| load_run_conn(&conn, &id)).transpose()
    }

    /// All runs of a project, newest first
    pub fn list_runs(&self, project_id: ProjectId) -> Result<Vec<WorkflowRun>, StoreError> {
        let conn = self.lock()?;
        let ids = query_ids(
            &conn,
            "SELECT id FROM workflow_runs WHERE project_id = ?1 ORDER BY created_at DESC, rowid DESC",
            params![project_id],
        )?;
        ids.iter().map(|id| load_run_conn(&conn, id)).collect()
    }

    /// Every non-archived run across projects
    pub fn list_active_runs(&self) -> Result<Vec<WorkflowRun>, StoreError> {
        let conn = self.lock()?;
        let ids = query_ids(
            &conn,
            "SELECT id FROM workflow_runs WHERE archived = 0 ORDER BY created_at",
            [],
        )?;
        ids.iter().map(|id| load_run_conn(&conn, id)).collect()
    }

    /// Reopen a stalled run so its current stage is re-invoked.
    pub fn resume_run(&self, run_id: &str, note: Option<&str>) -> Result<WorkflowRun, StoreError> {
        self.intervene(run_id, InterventionKind::Resumed, note)
    }

    /// Fail a non-terminal run.
    pub fn cancel_run(&self, run_id: &str, reason: Option<&str>) -> Result<WorkflowRun, StoreError> {
        self.intervene(run_id, InterventionKind::Cancelled, reason)
    }

    fn intervene(
        &self,
        run_id: &str,
        kind: InterventionKind,
        note: Option<&str>,
    ) -> Result<WorkflowRun, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let mut run = load_run_conn(&tx, run_id)?;
        if run.archived {
            return match kind {
                InterventionKind::Resumed => Err(StoreError::NotResumable {
                    run_id: run_id.to_string(),
                    reason: format!("run is {}; start a new run instead", run.status),
                }),
                InterventionKind::Cancelled => Err(StoreError::RunTerminal(run_id.to_string())),
            };
        }
        if kind == InterventionKind::Resumed && run.status != RunStatus::Stalled {
            return Err(StoreError::NotResumable {
                run_id: run_id.to_string(),
                reason: format!("run is {}, only stalled runs resume", run.status),
            });
        }

        let intervention = Intervention {
            kind,
            stage: run.current_stage,
            note: note.map(str::to_string),
            at: Utc::now(),
            seq: run.last_seq() + 1,
        };
        insert_intervention(&tx, run_id, &intervention)?;
        run.interventions.push(intervention);
        run.refresh();
        run.updated_at = Utc::now();
        update_projection(&tx, &run)?;
        tx.commit()?;

        tracing::info!(run_id, kind = kind.as_str(), status = %run.status, "Run intervention recorded");
        Ok(run)
    }
}

pub(crate) fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn query_ids<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;
    let mut ids = Vec::new();
    for row in rows {
        ids.push(row?);
    }
    Ok(ids)
}

fn insert_attempt(conn: &Connection, run_id: &str, attempt: &StageAttempt) -> Result<(), StoreError> {
    let payload_json = attempt
        .payload
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        r#"
        INSERT INTO stage_attempts
            (run_id, seq, stage, attempt, input_snapshot_json, outcome, retry_count,
             retry_ceiling, payload_json, error, started_at, finished_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
        params![
            run_id,
            attempt.seq,
            attempt.stage.as_str(),
            attempt.attempt,
            serde_json::to_string(&attempt.input_snapshot)?,
            attempt.outcome.as_str(),
            attempt.retry_count,
            attempt.retry_ceiling,
            payload_json,
            attempt.error,
            attempt.started_at.to_rfc3339(),
            attempt.finished_at.to_rfc3339(),
        ],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::DuplicateAttempt {
                run_id: run_id.to_string(),
                stage: attempt.stage,
                attempt: attempt.attempt,
            }
        }
        other => StoreError::Sqlite(other),
    })?;
    Ok(())
}

fn insert_intervention(
    conn: &Connection,
    run_id: &str,
    intervention: &Intervention,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO run_interventions (run_id, seq, kind, stage, note, at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            run_id,
            intervention.seq,
            intervention.kind.as_str(),
            intervention.stage.as_str(),
            intervention.note,
            intervention.at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Write the derived status columns. They mirror the history for queries;
/// loads always re-derive.
fn update_projection(conn: &Connection, run: &WorkflowRun) -> Result<(), StoreError> {
    conn.execute(
        r#"
        UPDATE workflow_runs
        SET conversation_refs_json = ?1, status = ?2, current_stage = ?3, archived = ?4, updated_at = ?5
        WHERE id = ?6
        "#,
        params![
            serde_json::to_string(&run.conversation_refs)?,
            run.status.as_str(),
            run.current_stage.as_str(),
            run.archived,
            run.updated_at.to_rfc3339(),
            run.id,
        ],
    )?;
    Ok(())
}

struct AttemptRow {
    seq: i64,
    stage: String,
    attempt: u32,
    input_snapshot_json: String,
    outcome: String,
    retry_count: u32,
    retry_ceiling: u32,
    payload_json: Option<String>,
    error: Option<String>,
    started_at: String,
    finished_at: String,
}

fn corrupt(what: &str, value: &str) -> StoreError {
    StoreError::Serialization(serde::de::Error::custom(format!(
        "unknown {} '{}' in database",
        what, value
    )))
}

pub(crate) fn load_run_conn(conn: &Connection, run_id: &str) -> Result<WorkflowRun, StoreError> {
    let (project_id, refs_json, created_at, updated_at): (ProjectId, String, String, String) = conn
        .query_row(
            "SELECT project_id, conversation_refs_json, created_at, updated_at FROM workflow_runs WHERE id = ?1",
            params![run_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?
        .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;

    let mut stmt = conn.prepare(
        r#"
        SELECT seq, stage, attempt, input_snapshot_json, outcome, retry_count, retry_ceiling,
               payload_json, error, started_at, finished_at
        FROM stage_attempts WHERE run_id = ?1 ORDER BY seq
        "#,
    )?;
    let rows = stmt.query_map(params![run_id], |row| {
        Ok(AttemptRow {
            seq: row.get(0)?,
            stage: row.get(1)?,
            attempt: row.get(2)?,
            input_snapshot_json: row.get(3)?,
            outcome: row.get(4)?,
            retry_count: row.get(5)?,
            retry_ceiling: row.get(6)?,
            payload_json: row.get(7)?,
            error: row.get(8)?,
            started_at: row.get(9)?,
            finished_at: row.get(10)?,
        })
    })?;

    let mut history = Vec::new();
    for row in rows {
        let row = row?;
        let payload: Option<StagePayload> = row
            .payload_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        history.push(StageAttempt {
            stage: Stage::parse(&row.stage).ok_or_else(|| corrupt("stage", &row.stage))?,
            attempt: row.attempt,
            input_snapshot: serde_json::from_str(&row.input_snapshot_json)?,
            outcome: StageOutcome::parse(&row.outcome)
                .ok_or_else(|| corrupt("outcome", &row.outcome))?,
            retry_count: row.retry_count,
            retry_ceiling: row.retry_ceiling,
            payload,
            error: row.error,
            started_at: parse_timestamp(&row.started_at),
            finished_at: parse_timestamp(&row.finished_at),
            seq: row.seq,
        });
    }

    let mut stmt = conn.prepare(
        "SELECT seq, kind, stage, note, at FROM run_interventions WHERE run_id = ?1 ORDER BY seq",
    )?;
    let rows = stmt.query_map(params![run_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut interventions = Vec::new();
    for row in rows {
        let (seq, kind, stage, note, at) = row?;
        interventions.push(Intervention {
            kind: InterventionKind::parse(&kind).ok_or_else(|| corrupt("intervention", &kind))?,
            stage: Stage::parse(&stage).ok_or_else(|| corrupt("stage", &stage))?,
            note,
            at: parse_timestamp(&at),
            seq,
        });
    }

    let mut run = WorkflowRun {
        id: run_id.to_string(),
        project_id,
        conversation_refs: serde_json::from_str(&refs_json)?,
        status: RunStatus::Pending,
        current_stage: Stage::first(),
        history,
        interventions,
        archived: false,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    };
    run.refresh();
    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::artifacts::{ExtractionOutput, Requirement, RequirementCategory, SourceRef};

    fn store() -> PipelineStore {
        let db = SupermonDb::open_in_memory().unwrap();
        PipelineStore::new(&db)
    }

    fn extraction_payload() -> StagePayload {
        StagePayload::Extraction(ExtractionOutput {
            candidates: vec![Requirement {
                id: "REQ-001".into(),
                text: "Users can reset their password".into(),
                category: RequirementCategory::Functional,
                confidence: 0.9,
                sources: vec![SourceRef {
                    timestamp: Utc::now(),
                    conversation_ref: "slack:C1".into(),
                    message_id: "m1".into(),
                }],
                dedup_key: String::new(),
                needs_review: false,
                review_reason: None,
            }],
            discarded: 0,
            conversations: vec!["slack:C1".into()],
            used_heuristics: false,
        })
    }

    fn attempt(stage: Stage, n: u32, outcome: StageOutcome, retry_count: u32) -> StageAttempt {
        StageAttempt {
            stage,
            attempt: n,
            input_snapshot: vec![],
            outcome,
            retry_count,
            retry_ceiling: 3,
            payload: match outcome {
                StageOutcome::Success => Some(extraction_payload()),
                _ => None,
            },
            error: match outcome {
                StageOutcome::Success => None,
                _ => Some("boom".into()),
            },
            started_at: Utc::now(),
            finished_at: Utc::now(),
            seq: 0,
        }
    }

    #[test]
    fn test_create_then_coalesce() {
        let store = store();

        let first = store.create_or_resume_run(42, Some("slack:C1")).unwrap();
        assert!(first.created);
        assert_eq!(first.run.status, RunStatus::Pending);

        let second = store.create_or_resume_run(42, Some("slack:C2")).unwrap();
        assert!(!second.created);
        assert!(second.ref_added);
        assert_eq!(second.run.id, first.run.id);
        assert_eq!(second.run.conversation_refs, vec!["slack:C1", "slack:C2"]);

        let again = store.create_or_resume_run(42, Some("slack:C2")).unwrap();
        assert!(!again.ref_added);

        let other = store.create_or_resume_run(7, None).unwrap();
        assert!(other.created);
        assert_ne!(other.run.id, first.run.id);
    }

    #[test]
    fn test_running_run_keeps_its_inputs() {
        let store = store();
        let run = store.create_or_resume_run(1, Some("slack:C1")).unwrap().run;
        store
            .record_attempt(&run.id, attempt(Stage::Extraction, 1, StageOutcome::Success, 0))
            .unwrap();

        let coalesced = store.create_or_resume_run(1, Some("slack:C9")).unwrap();
        assert!(!coalesced.created);
        assert!(!coalesced.ref_added);
        assert_eq!(coalesced.run.conversation_refs, vec!["slack:C1"]);
        assert_eq!(coalesced.run.current_stage, Stage::Validation);
    }

    #[test]
    fn test_stale_and_duplicate_attempts_rejected() {
        let store = store();
        let run = store.create_or_resume_run(1, Some("slack:C1")).unwrap().run;

        store
            .record_attempt(&run.id, attempt(Stage::Extraction, 1, StageOutcome::TransientFailure, 1))
            .unwrap();

        let dup = store.record_attempt(&run.id, attempt(Stage::Extraction, 1, StageOutcome::TransientFailure, 1));
        assert!(matches!(dup, Err(StoreError::DuplicateAttempt { attempt: 1, .. })));

        let updated = store
            .record_attempt(&run.id, attempt(Stage::Extraction, 2, StageOutcome::Success, 0))
            .unwrap();
        assert_eq!(updated.current_stage, Stage::Validation);

        let stale = store.record_attempt(&run.id, attempt(Stage::Extraction, 3, StageOutcome::Success, 0));
        assert!(matches!(stale, Err(StoreError::StaleRun { declared: Stage::Extraction, .. })));

        let reloaded = store.load_run(&run.id).unwrap();
        assert_eq!(reloaded.history.len(), 2);
    }

    #[test]
    fn test_stall_resume_and_trigger_reopen() {
        let store = store();
        let run = store.create_or_resume_run(3, Some("slack:C1")).unwrap().run;
        for n in 1..=3 {
            store
                .record_attempt(&run.id, attempt(Stage::Extraction, n, StageOutcome::TransientFailure, n))
                .unwrap();
        }
        assert_eq!(store.load_run(&run.id).unwrap().status, RunStatus::Stalled);

        let blocked = store.record_attempt(&run.id, attempt(Stage::Extraction, 4, StageOutcome::Success, 0));
        assert!(matches!(blocked, Err(StoreError::StaleRun { .. })));

        let reopened = store.create_or_resume_run(3, Some("slack:C1")).unwrap();
        assert!(reopened.resumed);
        assert_eq!(reopened.run.status, RunStatus::Running);

        let resume_again = store.resume_run(&run.id, None);
        assert!(matches!(resume_again, Err(StoreError::NotResumable { .. })));
    }

    #[test]
    fn test_terminal_runs_are_archived() {
        let store = store();
        let run = store.create_or_resume_run(5, Some("slack:C1")).unwrap().run;
        let failed = store
            .record_attempt(&run.id, attempt(Stage::Extraction, 1, StageOutcome::PermanentFailure, 0))
            .unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert!(failed.archived);
        assert!(store.active_run(5).unwrap().is_none());

        let late = store.record_attempt(&run.id, attempt(Stage::Extraction, 2, StageOutcome::Success, 0));
        assert!(matches!(late, Err(StoreError::RunTerminal(_))));

        let fresh = store.create_or_resume_run(5, Some("slack:C1")).unwrap();
        assert!(fresh.created);
        assert_eq!(store.list_runs(5).unwrap().len(), 2);
    }

    #[test]
    fn test_cancel_fails_run() {
        let store = store();
        let run = store.create_or_resume_run(9, None).unwrap().run;
        let cancelled = store.cancel_run(&run.id, Some("duplicate project")).unwrap();
        assert_eq!(cancelled.status, RunStatus::Failed);
        assert!(matches!(
            store.cancel_run(&run.id, None),
            Err(StoreError::RunTerminal(_))
        ));
    }

    #[test]
    fn test_conflict_while_committing() {
        let store = store();
        store.create_or_resume_run(11, None).unwrap();
        let _guard = store.begin_commit(11).unwrap();
        assert!(matches!(
            store.create_or_resume_run(11, None),
            Err(StoreError::AlreadyActiveConflict(11))
        ));
    }

    #[test]
    fn test_history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supermon.db");

        let run_id = {
            let db = SupermonDb::open_at(&path).unwrap();
            let store = PipelineStore::new(&db);
            let run = store.create_or_resume_run(1, Some("slack:C1")).unwrap().run;
            store
                .record_attempt(&run.id, attempt(Stage::Extraction, 1, StageOutcome::Success, 0))
                .unwrap();
            run.id
        };

        let db = SupermonDb::open_at(&path).unwrap();
        let store = PipelineStore::new(&db);
        let run = store.load_run(&run_id).unwrap();
        assert_eq!(run.current_stage, Stage::Validation);
        assert_eq!(run.status, RunStatus::Running);
        assert!(matches!(
            run.history[0].payload,
            Some(StagePayload::Extraction(_))
        ));
    }
}
