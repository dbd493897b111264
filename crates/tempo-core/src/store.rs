//! SQLite-backed store for tasks, singletons, chat transcript, and the LLM
//! audit log.
//!
//! Every public operation is one closure on the dedicated database thread
//! (`tokio_rusqlite::Connection::call`), so each operation is its own short
//! transaction and no session outlives a logical operation. Guarded task
//! transitions re-read the row inside an immediate transaction, which makes
//! the single-active check a test-and-set.

use std::path::Path;

use chrono::NaiveDateTime;
use rusqlite::{params, TransactionBehavior};
use tokio_rusqlite::Connection;
use tracing::{debug, info};

use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::time::{encode_ts, now_local};
use crate::types::{
    ChatMessage, GlobalContext, LlmCall, NewLlmCall, NewTask, SettingsRow, Task, TaskSnapshot,
    DEFAULT_LLM_MODEL, DEFAULT_MAX_TOKENS,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("task {0} not found")]
    NotFound(i64),
    #[error("task was deleted by another session")]
    Gone,
    #[error("task '{title}' is already completed")]
    AlreadyCompleted { title: String },
    #[error("another task '{active_title}' is already active")]
    ActiveConflict { active_title: String },
    #[error("task '{title}' has not been started")]
    NotStarted { title: String },
}

/// Busy, locked, and constraint failures are worth one more try; everything
/// else is not ours to mask.
fn is_transient(err: &tokio_rusqlite::Error) -> bool {
    match err {
        tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
            e.code,
            rusqlite::ErrorCode::DatabaseBusy
                | rusqlite::ErrorCode::DatabaseLocked
                | rusqlite::ErrorCode::ConstraintViolation
        ),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Async SQLite store shared by the engine, the reconciler, and the chat
/// orchestrator.
pub struct Store {
    conn: Connection,
    audit_retry: RetryPolicy,
}

impl Store {
    /// Open (or create) a database at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self {
            conn,
            audit_retry: RetryPolicy::default(),
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create a purely in-memory database (tests).
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self {
            conn,
            audit_retry: RetryPolicy {
                base_delay: std::time::Duration::from_millis(5),
                max_delay: std::time::Duration::from_millis(20),
                ..RetryPolicy::default()
            },
        };
        store.init_schema().await?;
        Ok(store)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;
                    PRAGMA foreign_keys=ON;

                    CREATE TABLE IF NOT EXISTS tasks (
                        id               INTEGER PRIMARY KEY AUTOINCREMENT,
                        title            TEXT NOT NULL,
                        description      TEXT NOT NULL DEFAULT '',
                        context          TEXT NOT NULL DEFAULT '',
                        due_date         TEXT,
                        scheduled_start  TEXT,
                        scheduled_end    TEXT,
                        actual_start     TEXT,
                        actual_end       TEXT,
                        priority         REAL NOT NULL DEFAULT 0.0,
                        completed        INTEGER NOT NULL DEFAULT 0,
                        needs_scheduling INTEGER NOT NULL DEFAULT 0,
                        created_at       TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_tasks_completed
                        ON tasks(completed);
                    CREATE INDEX IF NOT EXISTS idx_tasks_scheduled_start
                        ON tasks(scheduled_start);
                    CREATE INDEX IF NOT EXISTS idx_tasks_needs_scheduling
                        ON tasks(needs_scheduling);
                    CREATE INDEX IF NOT EXISTS idx_tasks_actual_start
                        ON tasks(actual_start);

                    CREATE TABLE IF NOT EXISTS global_context (
                        id            INTEGER PRIMARY KEY AUTOINCREMENT,
                        discriminator INTEGER NOT NULL UNIQUE DEFAULT 1,
                        context       TEXT NOT NULL DEFAULT '',
                        updated_at    TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS settings (
                        id            INTEGER PRIMARY KEY AUTOINCREMENT,
                        discriminator INTEGER NOT NULL UNIQUE DEFAULT 1,
                        llm_model     TEXT NOT NULL,
                        max_tokens    INTEGER NOT NULL,
                        updated_at    TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS chat_messages (
                        id                 INTEGER PRIMARY KEY AUTOINCREMENT,
                        user_message       TEXT NOT NULL,
                        assistant_response TEXT NOT NULL,
                        created_at         TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS llm_calls (
                        id          INTEGER PRIMARY KEY AUTOINCREMENT,
                        module_name TEXT NOT NULL,
                        inputs      TEXT NOT NULL,
                        outputs     TEXT NOT NULL,
                        duration_ms REAL NOT NULL,
                        created_at  TEXT NOT NULL
                    );
                    ",
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    // -----------------------------------------------------------------------
    // Task queries
    // -----------------------------------------------------------------------

    /// All tasks, highest priority first, earlier due dates first within a
    /// priority band.
    pub async fn get_all_tasks(&self) -> Result<Vec<Task>, StoreError> {
        self.query_tasks("ORDER BY priority DESC, due_date ASC").await
    }

    pub async fn get_task(&self, id: i64) -> Result<Option<Task>, StoreError> {
        let task = self
            .conn
            .call(move |conn| Ok(query_task(conn, id)?))
            .await?;
        Ok(task)
    }

    pub async fn get_incomplete_tasks(&self) -> Result<Vec<Task>, StoreError> {
        self.query_tasks("WHERE completed = 0").await
    }

    /// Tasks that have a scheduled start, ascending.
    pub async fn get_scheduled_tasks(&self) -> Result<Vec<Task>, StoreError> {
        self.query_tasks("WHERE scheduled_start IS NOT NULL ORDER BY scheduled_start ASC")
            .await
    }

    /// Incomplete tasks still carrying fallback placeholder times.
    pub async fn get_tasks_needing_scheduling(&self) -> Result<Vec<Task>, StoreError> {
        self.query_tasks("WHERE needs_scheduling = 1 AND completed = 0")
            .await
    }

    /// The at-most-one active task.
    pub async fn get_active_task(&self) -> Result<Option<Task>, StoreError> {
        let task = self
            .conn
            .call(|conn| Ok(query_active(conn)?))
            .await?;
        Ok(task)
    }

    /// Completed tasks, most recently finished first.
    pub async fn get_completed_tasks(&self) -> Result<Vec<Task>, StoreError> {
        self.query_tasks("WHERE completed = 1 ORDER BY actual_end DESC")
            .await
    }

    async fn query_tasks(&self, clause: &'static str) -> Result<Vec<Task>, StoreError> {
        let tasks = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {TASK_COLUMNS} FROM tasks {clause}");
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_task(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(tasks)
    }

    // -----------------------------------------------------------------------
    // Task writes
    // -----------------------------------------------------------------------

    pub async fn create_task(&self, new: NewTask) -> Result<Task, StoreError> {
        let created_at = now_local();
        let task = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO tasks (title, description, context, due_date,
                        scheduled_start, scheduled_end, priority, completed,
                        needs_scheduling, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9)",
                    params![
                        new.title,
                        new.description,
                        new.context,
                        new.due_date.as_ref().map(encode_ts),
                        new.scheduled_start.as_ref().map(encode_ts),
                        new.scheduled_end.as_ref().map(encode_ts),
                        new.priority,
                        new.needs_scheduling,
                        encode_ts(&created_at),
                    ],
                )?;
                let id = conn.last_insert_rowid();
                let task = query_task(conn, id)?.ok_or_else(|| {
                    tokio_rusqlite::Error::Rusqlite(rusqlite::Error::QueryReturnedNoRows)
                })?;
                Ok(task)
            })
            .await?;
        info!(task_id = task.id, title = %task.title, "created task");
        Ok(task)
    }

    /// Insert a full task row from a restore document. `id` and
    /// `created_at` are re-issued.
    pub async fn insert_task_snapshot(&self, snap: TaskSnapshot) -> Result<Task, StoreError> {
        let created_at = now_local();
        let task = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO tasks (title, description, context, due_date,
                        scheduled_start, scheduled_end, actual_start, actual_end,
                        priority, completed, needs_scheduling, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    params![
                        snap.title,
                        snap.description,
                        snap.context,
                        snap.due_date.as_ref().map(encode_ts),
                        snap.scheduled_start.as_ref().map(encode_ts),
                        snap.scheduled_end.as_ref().map(encode_ts),
                        snap.actual_start.as_ref().map(encode_ts),
                        snap.actual_end.as_ref().map(encode_ts),
                        snap.priority,
                        snap.completed,
                        snap.needs_scheduling,
                        encode_ts(&created_at),
                    ],
                )?;
                let id = conn.last_insert_rowid();
                let task = query_task(conn, id)?.ok_or_else(|| {
                    tokio_rusqlite::Error::Rusqlite(rusqlite::Error::QueryReturnedNoRows)
                })?;
                Ok(task)
            })
            .await?;
        Ok(task)
    }

    /// Delete a task in any state. Returns `false` when no row existed.
    pub async fn delete_task(&self, id: i64) -> Result<bool, StoreError> {
        let removed = self
            .conn
            .call(move |conn| {
                let n = conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
                Ok(n > 0)
            })
            .await?;
        if removed {
            info!(task_id = id, "deleted task");
        }
        Ok(removed)
    }

    /// Mark a task started. Test-and-set: the active-task check and the
    /// write share one immediate transaction, and a transient failure is
    /// retried exactly once before surfacing.
    pub async fn start_task(&self, id: i64) -> Result<Task, StoreError> {
        match self.start_task_once(id).await {
            Err(StoreError::Db(e)) if is_transient(&e) => {
                debug!(task_id = id, error = %e, "start hit transient failure, retrying once");
                self.start_task_once(id).await
            }
            other => other,
        }
    }

    async fn start_task_once(&self, id: i64) -> Result<Task, StoreError> {
        let now = now_local();
        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let Some(mut task) = query_task(&tx, id)? else {
                    return Ok(Err(StoreError::Gone));
                };
                if task.completed {
                    return Ok(Err(StoreError::AlreadyCompleted { title: task.title }));
                }
                if task.actual_start.is_some() {
                    // Restarting the already-active task is a no-op, which
                    // keeps a retried start idempotent.
                    return Ok(Ok(task));
                }
                if let Some(active) = query_active(&tx)? {
                    if active.id != id {
                        return Ok(Err(StoreError::ActiveConflict {
                            active_title: active.title,
                        }));
                    }
                }
                tx.execute(
                    "UPDATE tasks SET actual_start = ?1 WHERE id = ?2",
                    params![encode_ts(&now), id],
                )?;
                tx.commit()?;
                task.actual_start = Some(now);
                Ok(Ok(task))
            })
            .await?;
        if let Ok(task) = &outcome {
            info!(task_id = task.id, title = %task.title, "started task");
        }
        outcome
    }

    /// Return an active task to pending by clearing its actual start.
    pub async fn stop_task(&self, id: i64) -> Result<Task, StoreError> {
        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let Some(mut task) = query_task(&tx, id)? else {
                    return Ok(Err(StoreError::Gone));
                };
                if task.completed {
                    return Ok(Err(StoreError::AlreadyCompleted { title: task.title }));
                }
                if task.actual_start.is_none() {
                    return Ok(Err(StoreError::NotStarted { title: task.title }));
                }
                tx.execute(
                    "UPDATE tasks SET actual_start = NULL WHERE id = ?1",
                    params![id],
                )?;
                tx.commit()?;
                task.actual_start = None;
                Ok(Ok(task))
            })
            .await?;
        if let Ok(task) = &outcome {
            info!(task_id = task.id, title = %task.title, "stopped task");
        }
        outcome
    }

    /// Mark an active task completed, stamping its actual end.
    pub async fn complete_task(&self, id: i64) -> Result<Task, StoreError> {
        let now = now_local();
        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let Some(mut task) = query_task(&tx, id)? else {
                    return Ok(Err(StoreError::Gone));
                };
                if task.completed {
                    return Ok(Err(StoreError::AlreadyCompleted { title: task.title }));
                }
                if task.actual_start.is_none() {
                    return Ok(Err(StoreError::NotStarted { title: task.title }));
                }
                tx.execute(
                    "UPDATE tasks SET completed = 1, actual_end = ?1 WHERE id = ?2",
                    params![encode_ts(&now), id],
                )?;
                tx.commit()?;
                task.completed = true;
                task.actual_end = Some(now);
                Ok(Ok(task))
            })
            .await?;
        if let Ok(task) = &outcome {
            info!(task_id = task.id, title = %task.title, "completed task");
        }
        outcome
    }

    /// Reconciler write-back: replace the scheduled window and clear the
    /// needs-scheduling flag. Returns `false` when the task vanished.
    pub async fn set_task_schedule(
        &self,
        id: i64,
        start: Option<NaiveDateTime>,
        end: Option<NaiveDateTime>,
    ) -> Result<bool, StoreError> {
        let updated = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE tasks
                     SET scheduled_start = ?1, scheduled_end = ?2, needs_scheduling = 0
                     WHERE id = ?3",
                    params![
                        start.as_ref().map(encode_ts),
                        end.as_ref().map(encode_ts),
                        id
                    ],
                )?;
                Ok(n > 0)
            })
            .await?;
        Ok(updated)
    }

    /// Clear the needs-scheduling flag, keeping whatever window is stored
    /// (the give-up arm of initial scheduling).
    pub async fn clear_needs_scheduling(&self, id: i64) -> Result<bool, StoreError> {
        let updated = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE tasks SET needs_scheduling = 0 WHERE id = ?1",
                    params![id],
                )?;
                Ok(n > 0)
            })
            .await?;
        Ok(updated)
    }

    /// Reconciler write-back: apply an LLM-assigned priority.
    pub async fn set_task_priority(&self, id: i64, priority: f64) -> Result<bool, StoreError> {
        let updated = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE tasks SET priority = ?1 WHERE id = ?2",
                    params![priority, id],
                )?;
                Ok(n > 0)
            })
            .await?;
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // GlobalContext singleton
    // -----------------------------------------------------------------------

    /// Get the singleton context row, creating it on first access. The
    /// unique discriminator plus INSERT OR IGNORE makes concurrent callers
    /// converge on one row.
    pub async fn get_or_create_context(&self) -> Result<GlobalContext, StoreError> {
        let now = now_local();
        let ctx = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO global_context (discriminator, context, updated_at)
                     VALUES (1, '', ?1)",
                    params![encode_ts(&now)],
                )?;
                let ctx = conn.query_row(
                    "SELECT id, context, updated_at FROM global_context WHERE discriminator = 1",
                    [],
                    row_to_context,
                )?;
                Ok(ctx)
            })
            .await?;
        Ok(ctx)
    }

    pub async fn update_context(&self, context: String) -> Result<GlobalContext, StoreError> {
        let now = now_local();
        let ctx = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO global_context (discriminator, context, updated_at)
                     VALUES (1, '', ?1)",
                    params![encode_ts(&now)],
                )?;
                conn.execute(
                    "UPDATE global_context SET context = ?1, updated_at = ?2 WHERE discriminator = 1",
                    params![context, encode_ts(&now)],
                )?;
                let ctx = conn.query_row(
                    "SELECT id, context, updated_at FROM global_context WHERE discriminator = 1",
                    [],
                    row_to_context,
                )?;
                Ok(ctx)
            })
            .await?;
        Ok(ctx)
    }

    // -----------------------------------------------------------------------
    // Settings singleton
    // -----------------------------------------------------------------------

    pub async fn get_or_create_settings(&self) -> Result<SettingsRow, StoreError> {
        self.get_or_create_settings_with(DEFAULT_LLM_MODEL.to_string(), DEFAULT_MAX_TOKENS)
            .await
    }

    /// Get-or-create with explicit first-run defaults (the daemon seeds the
    /// row from its configured model).
    pub async fn get_or_create_settings_with(
        &self,
        default_model: String,
        default_max_tokens: i64,
    ) -> Result<SettingsRow, StoreError> {
        let now = now_local();
        let settings = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO settings (discriminator, llm_model, max_tokens, updated_at)
                     VALUES (1, ?1, ?2, ?3)",
                    params![default_model, default_max_tokens, encode_ts(&now)],
                )?;
                let settings = conn.query_row(
                    "SELECT id, llm_model, max_tokens, updated_at FROM settings WHERE discriminator = 1",
                    [],
                    row_to_settings,
                )?;
                Ok(settings)
            })
            .await?;
        Ok(settings)
    }

    pub async fn update_settings(
        &self,
        llm_model: String,
        max_tokens: i64,
    ) -> Result<SettingsRow, StoreError> {
        let now = now_local();
        let settings = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO settings (discriminator, llm_model, max_tokens, updated_at)
                     VALUES (1, ?1, ?2, ?3)",
                    params![llm_model, max_tokens, encode_ts(&now)],
                )?;
                conn.execute(
                    "UPDATE settings SET llm_model = ?1, max_tokens = ?2, updated_at = ?3
                     WHERE discriminator = 1",
                    params![llm_model, max_tokens, encode_ts(&now)],
                )?;
                let settings = conn.query_row(
                    "SELECT id, llm_model, max_tokens, updated_at FROM settings WHERE discriminator = 1",
                    [],
                    row_to_settings,
                )?;
                Ok(settings)
            })
            .await?;
        info!(model = %settings.llm_model, max_tokens = settings.max_tokens, "updated settings");
        Ok(settings)
    }

    // -----------------------------------------------------------------------
    // Chat transcript
    // -----------------------------------------------------------------------

    pub async fn create_chat_message(
        &self,
        user_message: String,
        assistant_response: String,
    ) -> Result<ChatMessage, StoreError> {
        let created_at = now_local();
        let message = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO chat_messages (user_message, assistant_response, created_at)
                     VALUES (?1, ?2, ?3)",
                    params![user_message, assistant_response, encode_ts(&created_at)],
                )?;
                let id = conn.last_insert_rowid();
                let message = conn.query_row(
                    "SELECT id, user_message, assistant_response, created_at
                     FROM chat_messages WHERE id = ?1",
                    params![id],
                    row_to_chat_message,
                )?;
                Ok(message)
            })
            .await?;
        Ok(message)
    }

    /// Most recent chat turns, newest first.
    pub async fn get_recent_chat_messages(
        &self,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let messages = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, user_message, assistant_response, created_at
                     FROM chat_messages
                     ORDER BY created_at DESC, id DESC
                     LIMIT ?1",
                )?;
                let mut rows = stmt.query(params![limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_chat_message(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(messages)
    }

    pub async fn delete_all_chat_messages(&self) -> Result<usize, StoreError> {
        let count = self
            .conn
            .call(|conn| Ok(conn.execute("DELETE FROM chat_messages", [])?))
            .await?;
        info!(count, "cleared chat transcript");
        Ok(count)
    }

    pub async fn delete_chat_messages_older_than(&self, days: i64) -> Result<usize, StoreError> {
        let cutoff = now_local() - chrono::Duration::days(days);
        let count = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM chat_messages WHERE created_at < ?1",
                    params![encode_ts(&cutoff)],
                )?)
            })
            .await?;
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // LLM audit log
    // -----------------------------------------------------------------------

    /// Append an audit record. Transient insert failures retry with the
    /// shared backoff; a terminal failure surfaces to the caller, who is
    /// expected to log and move on (audit failure is never call failure).
    pub async fn create_llm_call(&self, record: NewLlmCall) -> Result<LlmCall, StoreError> {
        let policy = self.audit_retry;
        retry_with_backoff(policy, "llm_call_insert", || {
            let record = record.clone();
            async move { self.insert_llm_call(record).await }
        })
        .await
    }

    async fn insert_llm_call(&self, record: NewLlmCall) -> Result<LlmCall, StoreError> {
        let created_at = now_local();
        let call = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO llm_calls (module_name, inputs, outputs, duration_ms, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        record.module_name,
                        record.inputs,
                        record.outputs,
                        record.duration_ms,
                        encode_ts(&created_at),
                    ],
                )?;
                let id = conn.last_insert_rowid();
                let call = conn.query_row(
                    "SELECT id, module_name, inputs, outputs, duration_ms, created_at
                     FROM llm_calls WHERE id = ?1",
                    params![id],
                    row_to_llm_call,
                )?;
                Ok(call)
            })
            .await?;
        debug!(
            module = %call.module_name,
            duration_ms = call.duration_ms,
            "recorded llm call"
        );
        Ok(call)
    }

    /// Latest audit records, newest first.
    pub async fn get_latest_llm_calls(&self, limit: i64) -> Result<Vec<LlmCall>, StoreError> {
        let calls = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, module_name, inputs, outputs, duration_ms, created_at
                     FROM llm_calls
                     ORDER BY created_at DESC, id DESC
                     LIMIT ?1",
                )?;
                let mut rows = stmt.query(params![limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_llm_call(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(calls)
    }

    pub async fn delete_llm_calls_older_than(&self, days: i64) -> Result<usize, StoreError> {
        let cutoff = now_local() - chrono::Duration::days(days);
        let count = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM llm_calls WHERE created_at < ?1",
                    params![encode_ts(&cutoff)],
                )?)
            })
            .await?;
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

const TASK_COLUMNS: &str = "id, title, description, context, due_date, scheduled_start, \
     scheduled_end, actual_start, actual_end, priority, completed, needs_scheduling, created_at";

fn query_task(conn: &rusqlite::Connection, id: i64) -> rusqlite::Result<Option<Task>> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_task(row)?)),
        None => Ok(None),
    }
}

fn query_active(conn: &rusqlite::Connection) -> rusqlite::Result<Option<Task>> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks
         WHERE actual_start IS NOT NULL AND completed = 0
         LIMIT 1"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_task(row)?)),
        None => Ok(None),
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        context: row.get(3)?,
        due_date: opt_ts_col(row, 4)?,
        scheduled_start: opt_ts_col(row, 5)?,
        scheduled_end: opt_ts_col(row, 6)?,
        actual_start: opt_ts_col(row, 7)?,
        actual_end: opt_ts_col(row, 8)?,
        priority: row.get(9)?,
        completed: row.get(10)?,
        needs_scheduling: row.get(11)?,
        created_at: ts_col(row, 12)?,
    })
}

fn row_to_context(row: &rusqlite::Row<'_>) -> rusqlite::Result<GlobalContext> {
    Ok(GlobalContext {
        id: row.get(0)?,
        context: row.get(1)?,
        updated_at: ts_col(row, 2)?,
    })
}

fn row_to_settings(row: &rusqlite::Row<'_>) -> rusqlite::Result<SettingsRow> {
    Ok(SettingsRow {
        id: row.get(0)?,
        llm_model: row.get(1)?,
        max_tokens: row.get(2)?,
        updated_at: ts_col(row, 3)?,
    })
}

fn row_to_chat_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    Ok(ChatMessage {
        id: row.get(0)?,
        user_message: row.get(1)?,
        assistant_response: row.get(2)?,
        created_at: ts_col(row, 3)?,
    })
}

fn row_to_llm_call(row: &rusqlite::Row<'_>) -> rusqlite::Result<LlmCall> {
    Ok(LlmCall {
        id: row.get(0)?,
        module_name: row.get(1)?,
        inputs: row.get(2)?,
        outputs: row.get(3)?,
        duration_ms: row.get(4)?,
        created_at: ts_col(row, 5)?,
    })
}

fn ts_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<NaiveDateTime> {
    let raw: String = row.get(idx)?;
    crate::time::decode_ts(&raw).ok_or_else(|| bad_ts(idx, &raw))
}

fn opt_ts_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDateTime>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(raw) => crate::time::decode_ts(&raw)
            .map(Some)
            .ok_or_else(|| bad_ts(idx, &raw)),
        None => Ok(None),
    }
}

fn bad_ts(idx: usize, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unparseable datetime '{raw}'"),
        )),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    fn new_task(title: &str) -> NewTask {
        NewTask {
            title: title.into(),
            needs_scheduling: true,
            ..NewTask::default()
        }
    }

    #[tokio::test]
    async fn create_assigns_monotonic_ids() {
        let store = Store::open_in_memory().await.unwrap();
        let a = store.create_task(new_task("a")).await.unwrap();
        let b = store.create_task(new_task("b")).await.unwrap();
        assert!(b.id > a.id);
        assert!(!a.completed);
        assert!(a.needs_scheduling);
    }

    #[tokio::test]
    async fn get_all_orders_by_priority_desc() {
        let store = Store::open_in_memory().await.unwrap();
        let low = store.create_task(new_task("low")).await.unwrap();
        let high = store.create_task(new_task("high")).await.unwrap();
        store.set_task_priority(low.id, 2.0).await.unwrap();
        store.set_task_priority(high.id, 8.5).await.unwrap();

        let all = store.get_all_tasks().await.unwrap();
        assert_eq!(all[0].title, "high");
        assert_eq!(all[1].title, "low");
    }

    #[tokio::test]
    async fn scheduled_tasks_ordered_ascending() {
        let store = Store::open_in_memory().await.unwrap();
        let now = now_local();
        let later = store.create_task(new_task("later")).await.unwrap();
        let sooner = store.create_task(new_task("sooner")).await.unwrap();
        store
            .set_task_schedule(later.id, Some(now + Duration::hours(4)), Some(now + Duration::hours(5)))
            .await
            .unwrap();
        store
            .set_task_schedule(sooner.id, Some(now + Duration::hours(1)), Some(now + Duration::hours(2)))
            .await
            .unwrap();

        let scheduled = store.get_scheduled_tasks().await.unwrap();
        assert_eq!(scheduled.len(), 2);
        assert_eq!(scheduled[0].title, "sooner");
        // Write-back also cleared the flag.
        assert!(!scheduled[0].needs_scheduling);
    }

    #[tokio::test]
    async fn needing_scheduling_excludes_completed() {
        let store = Store::open_in_memory().await.unwrap();
        let open = store.create_task(new_task("open")).await.unwrap();
        let done = store.create_task(new_task("done")).await.unwrap();
        store.start_task(done.id).await.unwrap();
        store.complete_task(done.id).await.unwrap();

        let pending = store.get_tasks_needing_scheduling().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, open.id);
    }

    #[tokio::test]
    async fn start_sets_actual_start_and_conflicts_name_the_winner() {
        let store = Store::open_in_memory().await.unwrap();
        let first = store.create_task(new_task("first")).await.unwrap();
        let second = store.create_task(new_task("second")).await.unwrap();

        let started = store.start_task(first.id).await.unwrap();
        assert!(started.actual_start.is_some());

        let err = store.start_task(second.id).await.unwrap_err();
        match err {
            StoreError::ActiveConflict { active_title } => assert_eq!(active_title, "first"),
            other => panic!("expected ActiveConflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn start_is_idempotent_for_the_active_task() {
        let store = Store::open_in_memory().await.unwrap();
        let task = store.create_task(new_task("solo")).await.unwrap();
        let first = store.start_task(task.id).await.unwrap();
        let again = store.start_task(task.id).await.unwrap();
        assert_eq!(first.actual_start, again.actual_start);
    }

    #[tokio::test]
    async fn start_completed_task_is_refused() {
        let store = Store::open_in_memory().await.unwrap();
        let task = store.create_task(new_task("done")).await.unwrap();
        store.start_task(task.id).await.unwrap();
        store.complete_task(task.id).await.unwrap();
        assert!(matches!(
            store.start_task(task.id).await,
            Err(StoreError::AlreadyCompleted { .. })
        ));
    }

    #[tokio::test]
    async fn transitions_on_missing_rows_report_gone() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(matches!(store.start_task(99).await, Err(StoreError::Gone)));
        assert!(matches!(store.stop_task(99).await, Err(StoreError::Gone)));
        assert!(matches!(
            store.complete_task(99).await,
            Err(StoreError::Gone)
        ));
    }

    #[tokio::test]
    async fn stop_returns_task_to_pending() {
        let store = Store::open_in_memory().await.unwrap();
        let task = store.create_task(new_task("pausable")).await.unwrap();
        store.start_task(task.id).await.unwrap();
        let stopped = store.stop_task(task.id).await.unwrap();
        assert!(stopped.actual_start.is_none());
        assert!(store.get_active_task().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stop_requires_active() {
        let store = Store::open_in_memory().await.unwrap();
        let task = store.create_task(new_task("idle")).await.unwrap();
        assert!(matches!(
            store.stop_task(task.id).await,
            Err(StoreError::NotStarted { .. })
        ));
    }

    #[tokio::test]
    async fn complete_requires_started_and_stamps_end() {
        let store = Store::open_in_memory().await.unwrap();
        let task = store.create_task(new_task("finishable")).await.unwrap();
        assert!(matches!(
            store.complete_task(task.id).await,
            Err(StoreError::NotStarted { .. })
        ));

        store.start_task(task.id).await.unwrap();
        let done = store.complete_task(task.id).await.unwrap();
        assert!(done.completed);
        assert!(done.actual_end.is_some());

        let completed = store.get_completed_tasks().await.unwrap();
        assert_eq!(completed.len(), 1);
    }

    #[tokio::test]
    async fn delete_any_state_and_missing_is_false() {
        let store = Store::open_in_memory().await.unwrap();
        let task = store.create_task(new_task("victim")).await.unwrap();
        store.start_task(task.id).await.unwrap();
        assert!(store.delete_task(task.id).await.unwrap());
        assert!(!store.delete_task(task.id).await.unwrap());
        assert!(store.get_task(task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn context_singleton_survives_concurrent_get_or_create() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(
                async move { store.get_or_create_context().await },
            ));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn context_update_roundtrip() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .update_context("mornings are for deep work".into())
            .await
            .unwrap();
        let ctx = store.get_or_create_context().await.unwrap();
        assert_eq!(ctx.context, "mornings are for deep work");
    }

    #[tokio::test]
    async fn settings_defaults_then_update() {
        let store = Store::open_in_memory().await.unwrap();
        let settings = store.get_or_create_settings().await.unwrap();
        assert_eq!(settings.llm_model, DEFAULT_LLM_MODEL);
        assert_eq!(settings.max_tokens, DEFAULT_MAX_TOKENS);

        let updated = store
            .update_settings("openai/gpt-4o-mini".into(), 4000)
            .await
            .unwrap();
        assert_eq!(updated.llm_model, "openai/gpt-4o-mini");
        assert_eq!(updated.max_tokens, 4000);
        assert_eq!(updated.id, settings.id);
    }

    #[tokio::test]
    async fn chat_messages_newest_first_with_limit() {
        let store = Store::open_in_memory().await.unwrap();
        for i in 0..5 {
            store
                .create_chat_message(format!("q{i}"), format!("a{i}"))
                .await
                .unwrap();
        }
        let recent = store.get_recent_chat_messages(3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].user_message, "q4");
        assert_eq!(recent[2].user_message, "q2");

        let cleared = store.delete_all_chat_messages().await.unwrap();
        assert_eq!(cleared, 5);
    }

    #[tokio::test]
    async fn llm_calls_newest_first_and_age_trim() {
        let store = Store::open_in_memory().await.unwrap();
        for i in 0..3 {
            store
                .create_llm_call(NewLlmCall {
                    module_name: format!("module{i}"),
                    inputs: "{}".into(),
                    outputs: "{}".into(),
                    duration_ms: 12.5,
                })
                .await
                .unwrap();
        }
        let latest = store.get_latest_llm_calls(10).await.unwrap();
        assert_eq!(latest.len(), 3);
        assert_eq!(latest[0].module_name, "module2");

        // Nothing is older than a year; everything is older than "0 days ago".
        assert_eq!(store.delete_llm_calls_older_than(365).await.unwrap(), 0);
        assert_eq!(store.delete_llm_calls_older_than(0).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn retention_on_chat_by_age() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .create_chat_message("hello".into(), "hi".into())
            .await
            .unwrap();
        assert_eq!(store.delete_chat_messages_older_than(30).await.unwrap(), 0);
        assert_eq!(store.delete_chat_messages_older_than(0).await.unwrap(), 1);
    }
}
