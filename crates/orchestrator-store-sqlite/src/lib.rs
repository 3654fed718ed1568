// crates/orchestrator-store-sqlite/src/lib.rs
// ============================================================================
// Crate: orchestrator-store-sqlite
// Description: SQLite-backed implementation of orchestrator_core::Store.
// Purpose: Give the Scheduler durable, transactional task/run/artifact/decision storage.
// Dependencies: rusqlite (bundled), orchestrator-core, serde_json
// ============================================================================

//! ## Overview
//! One file, one connection, one [`std::sync::Mutex`]. [`SqliteStore::with_scope`]
//! opens a `BEGIN IMMEDIATE` transaction before handing out a [`SqliteScope`],
//! which is this crate's equivalent of the row-level lock the specification
//! asks `claim_next_pending_run` to take: `IMMEDIATE` acquires SQLite's
//! reserved write lock up front, so a second worker's own `with_scope` call
//! blocks (or returns `SQLITE_BUSY`, translated to [`StoreError::Conflict`])
//! until the first transaction commits or rolls back.

use std::path::Path;
use std::sync::Mutex;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite::Row;
use rusqlite::Transaction;
use rusqlite::TransactionBehavior;
use rusqlite::params;
use serde_json::Value;

use orchestrator_core::Artifact;
use orchestrator_core::ArtifactId;
use orchestrator_core::Decision;
use orchestrator_core::DecisionId;
use orchestrator_core::DecisionKind;
use orchestrator_core::DecisionValue;
use orchestrator_core::Run;
use orchestrator_core::RunId;
use orchestrator_core::RunStatus;
use orchestrator_core::Stage;
use orchestrator_core::Store;
use orchestrator_core::StoreError;
use orchestrator_core::StoreScope;
use orchestrator_core::Task;
use orchestrator_core::TaskId;
use orchestrator_core::TaskStatus;
use orchestrator_core::TaskWithChildren;
use orchestrator_core::Timestamp;

const SCHEMA_VERSION: i64 = 1;
const MAX_STORE_PATH_LENGTH: usize = 4096;

/// Durable SQLite-backed [`Store`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (creating if absent) a store at `path`, applying pragmas and
    /// initializing the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the path is invalid or the connection
    /// cannot be opened.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        validate_store_path(path)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|err| StoreError::Connectivity(format!("create store dir: {err}")))?;
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
        let mut conn = Connection::open_with_flags(path, flags)
            .map_err(|err| StoreError::Connectivity(format!("open: {err}")))?;
        apply_pragmas(&conn)?;
        initialize_schema(&mut conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Opens a private in-memory store. Useful for tests.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the connection cannot be opened.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let mut conn =
            Connection::open_in_memory().map_err(|err| StoreError::Connectivity(format!("open: {err}")))?;
        apply_pragmas(&conn)?;
        initialize_schema(&mut conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

impl Store for SqliteStore {
    fn with_scope(
        &self,
        body: &mut dyn FnMut(&mut dyn StoreScope) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let mut conn =
            self.conn.lock().map_err(|_| StoreError::Connectivity("store mutex poisoned".to_string()))?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| map_sqlite_err(&err))?;
        let mut scope = SqliteScope { tx: &tx };
        match body(&mut scope) {
            Ok(()) => tx.commit().map_err(|err| map_sqlite_err(&err)),
            Err(err) => {
                let _ = tx.rollback();
                Err(err)
            }
        }
    }

    fn get_task_with_children(&self, task_id: TaskId) -> Result<Option<TaskWithChildren>, StoreError> {
        let conn =
            self.conn.lock().map_err(|_| StoreError::Connectivity("store mutex poisoned".to_string()))?;
        let Some(task) = fetch_task(&conn, task_id)? else {
            return Ok(None);
        };
        let runs = fetch_runs(&conn, task_id)?;
        let artifacts = fetch_artifacts(&conn, task_id)?;
        let decisions = fetch_decisions(&conn, task_id)?;
        Ok(Some(TaskWithChildren { task, runs, artifacts, decisions }))
    }
}

/// The scope handed to the closure passed to [`SqliteStore::with_scope`].
struct SqliteScope<'conn> {
    tx: &'conn Transaction<'conn>,
}

impl StoreScope for SqliteScope<'_> {
    fn create_task(
        &mut self,
        title: &str,
        raw_request: &str,
        max_attempts: u32,
    ) -> Result<Task, StoreError> {
        let now = now_millis();
        self.tx
            .execute(
                "INSERT INTO tasks (title, raw_request, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![title, raw_request, TaskStatus::Pending.tag(), now],
            )
            .map_err(|err| map_sqlite_err(&err))?;
        let task_id = TaskId::from_raw(self.tx.last_insert_rowid())
            .ok_or_else(|| StoreError::Connectivity("store assigned a non-positive task id".to_string()))?;
        self.insert_run(task_id, Stage::Product, 1, max_attempts)?;
        Ok(Task {
            id: task_id,
            title: title.to_string(),
            raw_request: raw_request.to_string(),
            status: TaskStatus::Pending,
            created_at: Timestamp(now),
            updated_at: Timestamp(now),
        })
    }

    fn get_task(&mut self, task_id: TaskId) -> Result<Option<Task>, StoreError> {
        fetch_task(self.tx, task_id)
    }

    fn list_runs(&mut self, task_id: TaskId) -> Result<Vec<Run>, StoreError> {
        fetch_runs(self.tx, task_id)
    }

    fn list_artifacts(&mut self, task_id: TaskId) -> Result<Vec<Artifact>, StoreError> {
        fetch_artifacts(self.tx, task_id)
    }

    fn latest_decision(&mut self, task_id: TaskId) -> Result<Option<Decision>, StoreError> {
        let mut stmt = self
            .tx
            .prepare(
                "SELECT id, task_id, kind, decision, comment, created_at
                 FROM decisions WHERE task_id = ?1 ORDER BY id DESC LIMIT 1",
            )
            .map_err(|err| map_sqlite_err(&err))?;
        stmt.query_row(params![task_id.get()], row_to_decision)
            .optional()
            .map_err(|err| map_sqlite_err(&err))
    }

    fn claim_next_pending_run(&mut self) -> Result<Option<Run>, StoreError> {
        let mut stmt = self
            .tx
            .prepare(
                "SELECT id, task_id, stage, status, attempt, max_attempts, payload, result, error,
                        created_at, updated_at
                 FROM runs WHERE status = ?1 ORDER BY created_at ASC, id ASC LIMIT 1",
            )
            .map_err(|err| map_sqlite_err(&err))?;
        stmt.query_row(params![RunStatus::Pending.tag()], row_to_run)
            .optional()
            .map_err(|err| map_sqlite_err(&err))
    }

    fn mark_run_running(&mut self, run_id: RunId) -> Result<Run, StoreError> {
        self.transition_run(run_id, RunStatus::Running)
    }

    fn pass_run(&mut self, run_id: RunId, result: Option<Value>) -> Result<Run, StoreError> {
        let now = now_millis();
        let serialized = result.as_ref().map(serde_json::Value::to_string);
        self.tx
            .execute(
                "UPDATE runs SET status = ?1, result = ?2, updated_at = ?3 WHERE id = ?4",
                params![RunStatus::Pass.tag(), serialized, now, run_id.get()],
            )
            .map_err(|err| map_sqlite_err(&err))?;
        fetch_run(self.tx, run_id)?.ok_or_else(|| missing_row("run", run_id.get()))
    }

    fn fail_run(&mut self, run_id: RunId, error: String) -> Result<Run, StoreError> {
        let now = now_millis();
        self.tx
            .execute(
                "UPDATE runs SET status = ?1, error = ?2, updated_at = ?3 WHERE id = ?4",
                params![RunStatus::Fail.tag(), error, now, run_id.get()],
            )
            .map_err(|err| map_sqlite_err(&err))?;
        fetch_run(self.tx, run_id)?.ok_or_else(|| missing_row("run", run_id.get()))
    }

    fn reset_run_to_pending(&mut self, run_id: RunId) -> Result<Run, StoreError> {
        self.transition_run(run_id, RunStatus::Pending)
    }

    fn insert_run(
        &mut self,
        task_id: TaskId,
        stage: Stage,
        attempt: u32,
        max_attempts: u32,
    ) -> Result<Run, StoreError> {
        let now = now_millis();
        self.tx
            .execute(
                "INSERT INTO runs (task_id, stage, status, attempt, max_attempts, payload, result,
                                   error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, NULL, ?6, ?6)",
                params![task_id.get(), stage.tag(), RunStatus::Pending.tag(), attempt, max_attempts, now],
            )
            .map_err(|err| map_sqlite_err(&err))?;
        let run_id = RunId::from_raw(self.tx.last_insert_rowid())
            .ok_or_else(|| StoreError::Connectivity("store assigned a non-positive run id".to_string()))?;
        Ok(Run {
            id: run_id,
            task_id,
            stage,
            status: RunStatus::Pending,
            attempt,
            max_attempts,
            payload: None,
            result: None,
            error: None,
            created_at: Timestamp(now),
            updated_at: Timestamp(now),
        })
    }

    fn insert_artifact(
        &mut self,
        task_id: TaskId,
        run_id: Option<RunId>,
        kind: &str,
        data: Value,
    ) -> Result<Artifact, StoreError> {
        let now = now_millis();
        self.tx
            .execute(
                "INSERT INTO artifacts (task_id, run_id, kind, data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![task_id.get(), run_id.map(RunId::get), kind, data.to_string(), now],
            )
            .map_err(|err| map_sqlite_err(&err))?;
        let artifact_id = ArtifactId::from_raw(self.tx.last_insert_rowid()).ok_or_else(|| {
            StoreError::Connectivity("store assigned a non-positive artifact id".to_string())
        })?;
        Ok(Artifact { id: artifact_id, task_id, run_id, kind: kind.to_string(), data, created_at: Timestamp(now) })
    }

    fn set_task_status(&mut self, task_id: TaskId, status: TaskStatus) -> Result<Task, StoreError> {
        let now = now_millis();
        self.tx
            .execute(
                "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.tag(), now, task_id.get()],
            )
            .map_err(|err| map_sqlite_err(&err))?;
        fetch_task(self.tx, task_id)?.ok_or_else(|| missing_row("task", task_id.get()))
    }

    fn insert_decision(
        &mut self,
        task_id: TaskId,
        decision: DecisionValue,
        comment: Option<String>,
    ) -> Result<Decision, StoreError> {
        let now = now_millis();
        self.tx
            .execute(
                "INSERT INTO decisions (task_id, kind, decision, comment, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![task_id.get(), DecisionKind::HumanApproval.tag(), decision.tag(), comment, now],
            )
            .map_err(|err| map_sqlite_err(&err))?;
        let decision_id = DecisionId::from_raw(self.tx.last_insert_rowid()).ok_or_else(|| {
            StoreError::Connectivity("store assigned a non-positive decision id".to_string())
        })?;
        Ok(Decision {
            id: decision_id,
            task_id,
            kind: DecisionKind::HumanApproval,
            decision,
            comment,
            created_at: Timestamp(now),
        })
    }

    fn count_stage_runs(&mut self, task_id: TaskId, stage: Stage) -> Result<u32, StoreError> {
        let count: i64 = self
            .tx
            .query_row(
                "SELECT COUNT(*) FROM runs WHERE task_id = ?1 AND stage = ?2",
                params![task_id.get(), stage.tag()],
                |row| row.get(0),
            )
            .map_err(|err| map_sqlite_err(&err))?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }
}

impl SqliteScope<'_> {
    fn transition_run(&mut self, run_id: RunId, status: RunStatus) -> Result<Run, StoreError> {
        let now = now_millis();
        self.tx
            .execute(
                "UPDATE runs SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.tag(), now, run_id.get()],
            )
            .map_err(|err| map_sqlite_err(&err))?;
        fetch_run(self.tx, run_id)?.ok_or_else(|| missing_row("run", run_id.get()))
    }
}

// ============================================================================
// SECTION: Row mapping
// ============================================================================

/// Converts a nullable-by-construction identifier column into a `rusqlite`
/// error instead of panicking when a stored row id is somehow non-positive.
fn require_positive_id<T>(value: Option<T>, column: usize) -> rusqlite::Result<T> {
    value.ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Integer,
            Box::new(std::io::Error::other("stored identifier is not positive")),
        )
    })
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let id: i64 = row.get(0)?;
    let status_tag: String = row.get(3)?;
    Ok(Task {
        id: require_positive_id(TaskId::from_raw(id), 0)?,
        title: row.get(1)?,
        raw_request: row.get(2)?,
        status: TaskStatus::from_tag(&status_tag).unwrap_or(TaskStatus::Pending),
        created_at: Timestamp(row.get(4)?),
        updated_at: Timestamp(row.get(5)?),
    })
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<Run> {
    let id: i64 = row.get(0)?;
    let task_id: i64 = row.get(1)?;
    let stage_tag: String = row.get(2)?;
    let status_tag: String = row.get(3)?;
    let payload: Option<String> = row.get(6)?;
    let result: Option<String> = row.get(7)?;
    Ok(Run {
        id: require_positive_id(RunId::from_raw(id), 0)?,
        task_id: require_positive_id(TaskId::from_raw(task_id), 1)?,
        stage: Stage::from_tag(&stage_tag).unwrap_or(Stage::Product),
        status: RunStatus::from_tag(&status_tag).unwrap_or(RunStatus::Pending),
        attempt: row.get(4)?,
        max_attempts: row.get(5)?,
        payload: payload.and_then(|text| serde_json::from_str(&text).ok()),
        result: result.and_then(|text| serde_json::from_str(&text).ok()),
        error: row.get(8)?,
        created_at: Timestamp(row.get(9)?),
        updated_at: Timestamp(row.get(10)?),
    })
}

fn row_to_artifact(row: &Row<'_>) -> rusqlite::Result<Artifact> {
    let id: i64 = row.get(0)?;
    let task_id: i64 = row.get(1)?;
    let run_id: Option<i64> = row.get(2)?;
    let data: String = row.get(4)?;
    Ok(Artifact {
        id: require_positive_id(ArtifactId::from_raw(id), 0)?,
        task_id: require_positive_id(TaskId::from_raw(task_id), 1)?,
        run_id: run_id.and_then(RunId::from_raw),
        kind: row.get(3)?,
        data: serde_json::from_str(&data).unwrap_or(Value::Null),
        created_at: Timestamp(row.get(5)?),
    })
}

fn row_to_decision(row: &Row<'_>) -> rusqlite::Result<Decision> {
    let id: i64 = row.get(0)?;
    let task_id: i64 = row.get(1)?;
    let kind_tag: String = row.get(2)?;
    let decision_tag: String = row.get(3)?;
    Ok(Decision {
        id: require_positive_id(DecisionId::from_raw(id), 0)?,
        task_id: require_positive_id(TaskId::from_raw(task_id), 1)?,
        kind: DecisionKind::from_tag(&kind_tag).unwrap_or(DecisionKind::HumanApproval),
        decision: DecisionValue::from_tag(&decision_tag).unwrap_or(DecisionValue::Reject),
        comment: row.get(4)?,
        created_at: Timestamp(row.get(5)?),
    })
}

fn fetch_task(conn: &Connection, task_id: TaskId) -> Result<Option<Task>, StoreError> {
    conn.query_row(
        "SELECT id, title, raw_request, status, created_at, updated_at FROM tasks WHERE id = ?1",
        params![task_id.get()],
        row_to_task,
    )
    .optional()
    .map_err(|err| map_sqlite_err(&err))
}

fn fetch_run(conn: &Connection, run_id: RunId) -> Result<Option<Run>, StoreError> {
    conn.query_row(
        "SELECT id, task_id, stage, status, attempt, max_attempts, payload, result, error,
                created_at, updated_at
         FROM runs WHERE id = ?1",
        params![run_id.get()],
        row_to_run,
    )
    .optional()
    .map_err(|err| map_sqlite_err(&err))
}

fn fetch_runs(conn: &Connection, task_id: TaskId) -> Result<Vec<Run>, StoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, task_id, stage, status, attempt, max_attempts, payload, result, error,
                    created_at, updated_at
             FROM runs WHERE task_id = ?1 ORDER BY id ASC",
        )
        .map_err(|err| map_sqlite_err(&err))?;
    let rows = stmt
        .query_map(params![task_id.get()], row_to_run)
        .map_err(|err| map_sqlite_err(&err))?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(|err| map_sqlite_err(&err))
}

fn fetch_artifacts(conn: &Connection, task_id: TaskId) -> Result<Vec<Artifact>, StoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, task_id, run_id, kind, data, created_at
             FROM artifacts WHERE task_id = ?1 ORDER BY id ASC",
        )
        .map_err(|err| map_sqlite_err(&err))?;
    let rows = stmt
        .query_map(params![task_id.get()], row_to_artifact)
        .map_err(|err| map_sqlite_err(&err))?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(|err| map_sqlite_err(&err))
}

fn fetch_decisions(conn: &Connection, task_id: TaskId) -> Result<Vec<Decision>, StoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, task_id, kind, decision, comment, created_at
             FROM decisions WHERE task_id = ?1 ORDER BY id ASC",
        )
        .map_err(|err| map_sqlite_err(&err))?;
    let rows = stmt
        .query_map(params![task_id.get()], row_to_decision)
        .map_err(|err| map_sqlite_err(&err))?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(|err| map_sqlite_err(&err))
}

// ============================================================================
// SECTION: Connection setup
// ============================================================================

fn validate_store_path(path: &Path) -> Result<(), StoreError> {
    if path.as_os_str().is_empty() {
        return Err(StoreError::Connectivity("store path must not be empty".to_string()));
    }
    if path.display().to_string().len() > MAX_STORE_PATH_LENGTH {
        return Err(StoreError::Connectivity("store path exceeds length limit".to_string()));
    }
    if path.is_dir() {
        return Err(StoreError::Connectivity("store path must be a file, not a directory".to_string()));
    }
    Ok(())
}

fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
        .map_err(|err| StoreError::Connectivity(format!("pragmas: {err}")))?;
    conn.busy_timeout(std::time::Duration::from_millis(5_000))
        .map_err(|err| StoreError::Connectivity(format!("busy_timeout: {err}")))?;
    Ok(())
}

fn initialize_schema(conn: &mut Connection) -> Result<(), StoreError> {
    let tx = conn.transaction().map_err(|err| map_sqlite_err(&err))?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")
        .map_err(|err| map_sqlite_err(&err))?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM store_meta LIMIT 1", [], |row| row.get(0))
        .optional()
        .map_err(|err| map_sqlite_err(&err))?;
    if version.is_none() {
        tx.execute("INSERT INTO store_meta (version) VALUES (?1)", params![SCHEMA_VERSION])
            .map_err(|err| map_sqlite_err(&err))?;
        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                raw_request TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY,
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                stage TEXT NOT NULL,
                status TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                max_attempts INTEGER NOT NULL,
                payload TEXT,
                result TEXT,
                error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_runs_status ON runs (status, created_at, id);
             CREATE INDEX IF NOT EXISTS idx_runs_task ON runs (task_id);
             CREATE TABLE IF NOT EXISTS artifacts (
                id INTEGER PRIMARY KEY,
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                run_id INTEGER REFERENCES runs(id) ON DELETE SET NULL,
                kind TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_artifacts_task ON artifacts (task_id);
             CREATE TABLE IF NOT EXISTS decisions (
                id INTEGER PRIMARY KEY,
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                decision TEXT NOT NULL,
                comment TEXT,
                created_at INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_decisions_task ON decisions (task_id);",
        )
        .map_err(|err| map_sqlite_err(&err))?;
    }
    tx.commit().map_err(|err| map_sqlite_err(&err))
}

fn map_sqlite_err(err: &rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(sqlite_err, _) = err {
        if sqlite_err.code == rusqlite::ErrorCode::DatabaseBusy
            || sqlite_err.code == rusqlite::ErrorCode::DatabaseLocked
        {
            return StoreError::Conflict(err.to_string());
        }
    }
    StoreError::Connectivity(err.to_string())
}

fn missing_row(table: &str, id: i64) -> StoreError {
    StoreError::Connectivity(format!("{table} {id} vanished mid-transaction"))
}

fn now_millis() -> i64 {
    let elapsed = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
}
