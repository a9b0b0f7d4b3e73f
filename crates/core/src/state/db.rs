//! # Pipeline Database
//!
//! Single SQLite database for all SuperMon workflow state, stored at
//! `.supermon/supermon.db` by default.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Default on-disk location.
pub const DEFAULT_DB_PATH: &str = ".supermon/supermon.db";

/// Unified database handle shared by the store and managers
pub struct SupermonDb {
    conn: Arc<Mutex<Connection>>,
}

impl SupermonDb {
    /// Open or create the database at the default location
    pub fn open() -> Result<Self> {
        Self::open_at(DEFAULT_DB_PATH)
    }

    /// Open database at a specific path
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path.as_ref()).context("Failed to open supermon database")?;
        Self::from_connection(conn)
    }

    /// Private in-memory database (tests, offline runs)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Get a shared connection for use by other modules
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// Run schema migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;

        if current_version < 1 {
            Self::migrate_v1(&conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                [1],
            )?;
        }

        Ok(())
    }

    /// Migration to version 1 - runs, attempts and planning artifacts
    fn migrate_v1(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_runs (
                id TEXT PRIMARY KEY,
                project_id INTEGER NOT NULL,
                conversation_refs_json TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL,
                current_stage TEXT NOT NULL,
                archived INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- At most one non-archived run per project.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_one_active
                ON workflow_runs(project_id) WHERE archived = 0;
            CREATE INDEX IF NOT EXISTS idx_runs_project ON workflow_runs(project_id, created_at);

            CREATE TABLE IF NOT EXISTS stage_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL REFERENCES workflow_runs(id),
                seq INTEGER NOT NULL,
                stage TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                input_snapshot_json TEXT NOT NULL DEFAULT '[]',
                outcome TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                retry_ceiling INTEGER NOT NULL,
                payload_json TEXT,
                error TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                UNIQUE (run_id, stage, attempt)
            );

            CREATE TABLE IF NOT EXISTS run_interventions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL REFERENCES workflow_runs(id),
                seq INTEGER NOT NULL,
                kind TEXT NOT NULL,
                stage TEXT NOT NULL,
                note TEXT,
                at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS requirements (
                run_id TEXT NOT NULL REFERENCES workflow_runs(id),
                id TEXT NOT NULL,
                project_id INTEGER NOT NULL,
                text TEXT NOT NULL,
                category TEXT NOT NULL,
                confidence REAL NOT NULL,
                dedup_key TEXT NOT NULL,
                needs_review INTEGER NOT NULL DEFAULT 0,
                review_reason TEXT,
                sources_json TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (run_id, id),
                UNIQUE (run_id, dedup_key)
            );

            CREATE TABLE IF NOT EXISTS epics (
                run_id TEXT NOT NULL REFERENCES workflow_runs(id),
                id TEXT NOT NULL,
                project_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,
                priority TEXT NOT NULL,
                estimated_hours INTEGER NOT NULL DEFAULT 0,
                acceptance_criteria_json TEXT NOT NULL DEFAULT '[]',
                position INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (run_id, id)
            );

            CREATE TABLE IF NOT EXISTS epic_requirements (
                run_id TEXT NOT NULL,
                epic_id TEXT NOT NULL,
                requirement_id TEXT NOT NULL,
                PRIMARY KEY (run_id, epic_id, requirement_id),
                FOREIGN KEY (run_id, epic_id) REFERENCES epics(run_id, id)
            );

            CREATE TABLE IF NOT EXISTS user_stories (
                run_id TEXT NOT NULL,
                id TEXT NOT NULL,
                epic_id TEXT NOT NULL,
                project_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,
                priority TEXT NOT NULL,
                story_points INTEGER NOT NULL,
                estimated_hours INTEGER NOT NULL,
                acceptance_criteria_json TEXT NOT NULL DEFAULT '[]',
                external_issue_id TEXT,
                position INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (run_id, id),
                FOREIGN KEY (run_id, epic_id) REFERENCES epics(run_id, id)
            );

            CREATE TABLE IF NOT EXISTS story_requirements (
                run_id TEXT NOT NULL,
                story_id TEXT NOT NULL,
                requirement_id TEXT NOT NULL,
                PRIMARY KEY (run_id, story_id, requirement_id),
                FOREIGN KEY (run_id, story_id) REFERENCES user_stories(run_id, id)
            );

            CREATE TABLE IF NOT EXISTS meetings (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL UNIQUE REFERENCES workflow_runs(id),
                project_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                agenda_json TEXT NOT NULL DEFAULT '[]',
                scheduled_at TEXT NOT NULL,
                duration_minutes INTEGER NOT NULL,
                participants_json TEXT NOT NULL DEFAULT '[]',
                external_id TEXT NOT NULL,
                idempotency_key TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS action_items (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES workflow_runs(id),
                project_id INTEGER NOT NULL,
                meeting_id TEXT,
                description TEXT NOT NULL,
                owner TEXT NOT NULL,
                due_at TEXT NOT NULL,
                status TEXT NOT NULL,
                followup_count INTEGER NOT NULL DEFAULT 0,
                last_followed_up_at TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_action_items_status ON action_items(status);
            CREATE INDEX IF NOT EXISTS idx_action_items_project ON action_items(project_id);

            CREATE TABLE IF NOT EXISTS project_settings (
                project_id INTEGER PRIMARY KEY,
                data TEXT NOT NULL DEFAULT '{}',
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .context("Failed to apply schema v1")?;

        tracing::info!("SupermonDb initialized with schema version {}", SCHEMA_VERSION);

        Ok(())
    }
}
