//! SQLite-backed task store.
//!
//! Timestamps are stored as Unix milliseconds so that monotonic clamping
//! (`MAX(submitted_at, ?)`) can happen inside a single UPDATE. Transition and
//! sequencing rules are enforced by conditional statements; when a statement
//! affects no rows the store re-reads the task to report why.

use std::{future::Future, pin::Pin, str::FromStr, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use tracing::{debug, info};

use super::TaskStore;
use crate::{
    error::{CoreError, Result},
    models::{
        AttemptOutcome, CallbackStatus, DeliveryAttempt, Page, StatusUpdate, Task, TaskFilter,
        TaskId, TaskStatus,
    },
};

const TASK_COLUMNS: &str = "id, mode, input, iterations, callback_url, status, result, error, \
                            duration_ms, submitted_at, started_at, completed_at, callback_status, \
                            callback_attempts, callback_error";

/// Task store persisting to a SQLite database.
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: Arc<SqlitePool>,
}

impl SqliteTaskStore {
    /// Wraps an existing pool.
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    /// Opens (creating if needed) the database at `url` and applies the schema.
    ///
    /// # Errors
    ///
    /// Returns error if the URL is invalid, the file cannot be opened, or
    /// schema creation fails.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        let store = Self::new(Arc::new(pool));
        store.migrate().await?;
        info!(url, "task store ready");
        Ok(store)
    }

    /// Opens a private in-memory database.
    ///
    /// Uses a single connection that is never recycled, since every new
    /// connection to `:memory:` would see an empty database.
    ///
    /// # Errors
    ///
    /// Returns error if schema creation fails.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self::new(Arc::new(pool));
        store.migrate().await?;
        Ok(store)
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<SqlitePool> {
        self.pool.clone()
    }

    /// Closes every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Creates tables and indexes if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns error if any DDL statement fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                mode TEXT NOT NULL CHECK (mode IN ('sync', 'async')),
                input TEXT NOT NULL,
                iterations INTEGER NOT NULL,
                callback_url TEXT,
                status TEXT NOT NULL
                    CHECK (status IN ('pending', 'running', 'succeeded', 'failed')),
                result TEXT,
                error TEXT,
                duration_ms INTEGER,
                submitted_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER,
                callback_status TEXT
                    CHECK (callback_status IN ('pending', 'delivered', 'failed', 'abandoned')),
                callback_attempts INTEGER NOT NULL DEFAULT 0,
                callback_error TEXT
            )
            ",
        )
        .execute(&*self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS delivery_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL REFERENCES tasks(id),
                attempt_number INTEGER NOT NULL CHECK (attempt_number >= 1),
                attempted_at INTEGER NOT NULL,
                outcome TEXT NOT NULL
                    CHECK (outcome IN ('delivered', 'failed', 'rejected', 'abandoned')),
                status_code INTEGER,
                error TEXT,
                duration_ms INTEGER NOT NULL,
                next_retry_at INTEGER,
                UNIQUE (task_id, attempt_number)
            )
            ",
        )
        .execute(&*self.pool)
        .await?;

        for ddl in [
            "CREATE INDEX IF NOT EXISTS idx_tasks_submitted ON tasks(submitted_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_mode ON tasks(mode, submitted_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
        ] {
            sqlx::query(ddl).execute(&*self.pool).await?;
        }

        debug!("task store schema applied");
        Ok(())
    }

    async fn current_status(&self, id: TaskId) -> Result<Option<TaskStatus>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT status FROM tasks WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&*self.pool)
            .await?;
        row.map(|(s,)| TaskStatus::from_str(&s).map_err(CoreError::Database)).transpose()
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| CoreError::Database(format!("timestamp out of range: {ms}")))
}

fn opt_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

fn parse_column<T: FromStr<Err = String>>(value: &str) -> Result<T> {
    value.parse().map_err(CoreError::Database)
}

fn to_u32(value: i64, column: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| CoreError::Database(format!("{column} out of range: {value}")))
}

fn to_u64(value: i64, column: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| CoreError::Database(format!("{column} out of range: {value}")))
}

/// Raw `tasks` row as stored.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    mode: String,
    input: String,
    iterations: i64,
    callback_url: Option<String>,
    status: String,
    result: Option<String>,
    error: Option<String>,
    duration_ms: Option<i64>,
    submitted_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    callback_status: Option<String>,
    callback_attempts: i64,
    callback_error: Option<String>,
}

impl TryFrom<TaskRow> for Task {
    type Error = CoreError;

    fn try_from(row: TaskRow) -> Result<Self> {
        Ok(Self {
            id: TaskId::from_str(&row.id)
                .map_err(|e| CoreError::Database(format!("invalid task id {}: {e}", row.id)))?,
            mode: parse_column(&row.mode)?,
            input: row.input,
            iterations: to_u32(row.iterations, "iterations")?,
            callback_url: row.callback_url,
            status: parse_column(&row.status)?,
            result: row.result,
            error: row.error,
            duration_ms: row.duration_ms.map(|ms| to_u64(ms, "duration_ms")).transpose()?,
            submitted_at: from_millis(row.submitted_at)?,
            started_at: opt_millis(row.started_at)?,
            completed_at: opt_millis(row.completed_at)?,
            callback_status: row
                .callback_status
                .as_deref()
                .map(parse_column::<CallbackStatus>)
                .transpose()?,
            callback_attempts: to_u32(row.callback_attempts, "callback_attempts")?,
            callback_error: row.callback_error,
        })
    }
}

/// Raw `delivery_attempts` row as stored.
#[derive(sqlx::FromRow)]
struct AttemptRow {
    task_id: String,
    attempt_number: i64,
    attempted_at: i64,
    outcome: String,
    status_code: Option<i64>,
    error: Option<String>,
    duration_ms: i64,
    next_retry_at: Option<i64>,
}

impl TryFrom<AttemptRow> for DeliveryAttempt {
    type Error = CoreError;

    fn try_from(row: AttemptRow) -> Result<Self> {
        Ok(Self {
            task_id: TaskId::from_str(&row.task_id)
                .map_err(|e| CoreError::Database(format!("invalid task id {}: {e}", row.task_id)))?,
            attempt_number: to_u32(row.attempt_number, "attempt_number")?,
            attempted_at: from_millis(row.attempted_at)?,
            outcome: parse_column::<AttemptOutcome>(&row.outcome)?,
            status_code: row
                .status_code
                .map(|code| {
                    u16::try_from(code)
                        .map_err(|_| CoreError::Database(format!("status_code out of range: {code}")))
                })
                .transpose()?,
            error: row.error,
            duration_ms: to_u64(row.duration_ms, "duration_ms")?,
            next_retry_at: opt_millis(row.next_retry_at)?,
        })
    }
}

impl TaskStore for SqliteTaskStore {
    fn create_task(&self, task: Task) -> Pin<Box<dyn Future<Output = Result<TaskId>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO tasks (
                    id, mode, input, iterations, callback_url, status,
                    submitted_at, callback_status, callback_attempts
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)
                ",
            )
            .bind(task.id.to_string())
            .bind(task.mode.as_str())
            .bind(&task.input)
            .bind(i64::from(task.iterations))
            .bind(task.callback_url.as_deref())
            .bind(task.status.as_str())
            .bind(to_millis(task.submitted_at))
            .bind(task.callback_status.map(CallbackStatus::as_str))
            .execute(&*self.pool)
            .await?;

            Ok(task.id)
        })
    }

    fn update_task_status(
        &self,
        id: TaskId,
        update: StatusUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let allowed = update
                .status
                .predecessors()
                .iter()
                .map(|s| format!("'{}'", s.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            if allowed.is_empty() {
                return Err(CoreError::InvalidInput(format!(
                    "{} is not a valid target status",
                    update.status
                )));
            }

            let result = if update.status == TaskStatus::Running {
                sqlx::query(&format!(
                    "UPDATE tasks SET status = ?1, started_at = MAX(submitted_at, ?2) \
                     WHERE id = ?3 AND status IN ({allowed})"
                ))
                .bind(update.status.as_str())
                .bind(to_millis(update.at))
                .bind(id.to_string())
                .execute(&*self.pool)
                .await?
            } else {
                sqlx::query(&format!(
                    "UPDATE tasks SET status = ?1, result = ?2, error = ?3, duration_ms = ?4, \
                     completed_at = MAX(COALESCE(started_at, submitted_at), ?5) \
                     WHERE id = ?6 AND status IN ({allowed})"
                ))
                .bind(update.status.as_str())
                .bind(update.result.as_deref())
                .bind(update.error.as_deref())
                .bind(update.duration_ms.map(|ms| i64::try_from(ms).unwrap_or(i64::MAX)))
                .bind(to_millis(update.at))
                .bind(id.to_string())
                .execute(&*self.pool)
                .await?
            };

            if result.rows_affected() == 1 {
                return Ok(());
            }
            match self.current_status(id).await? {
                None => Err(CoreError::NotFound(format!("task {id}"))),
                Some(from) => Err(CoreError::InvalidTransition { id, from, to: update.status }),
            }
        })
    }

    fn append_delivery_attempt(
        &self,
        attempt: DeliveryAttempt,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let task_id = attempt.task_id.to_string();
            let number = i64::from(attempt.attempt_number);
            let mut tx = self.pool.begin().await?;

            let inserted = sqlx::query(
                r"
                INSERT INTO delivery_attempts (
                    task_id, attempt_number, attempted_at, outcome,
                    status_code, error, duration_ms, next_retry_at
                )
                SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8
                WHERE EXISTS (SELECT 1 FROM tasks WHERE id = ?1)
                  AND (SELECT COUNT(*) FROM delivery_attempts WHERE task_id = ?1) = ?2 - 1
                ",
            )
            .bind(&task_id)
            .bind(number)
            .bind(to_millis(attempt.attempted_at))
            .bind(attempt.outcome.as_str())
            .bind(attempt.status_code.map(i64::from))
            .bind(attempt.error.as_deref())
            .bind(i64::try_from(attempt.duration_ms).unwrap_or(i64::MAX))
            .bind(attempt.next_retry_at.map(to_millis))
            .execute(&mut *tx)
            .await?;

            if inserted.rows_affected() == 0 {
                tx.rollback().await?;
                return match self.current_status(attempt.task_id).await? {
                    None => Err(CoreError::NotFound(format!("task {task_id}"))),
                    Some(_) => Err(CoreError::ConstraintViolation(format!(
                        "attempt {number} out of sequence for task {task_id}"
                    ))),
                };
            }

            sqlx::query("UPDATE tasks SET callback_attempts = ?1 WHERE id = ?2")
                .bind(number)
                .bind(&task_id)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(())
        })
    }

    fn update_delivery_status(
        &self,
        id: TaskId,
        status: CallbackStatus,
        error: Option<String>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE tasks SET callback_status = ?1, callback_error = ?2 \
                 WHERE id = ?3 AND callback_status = 'pending'",
            )
            .bind(status.as_str())
            .bind(error.as_deref())
            .bind(id.to_string())
            .execute(&*self.pool)
            .await?;

            if result.rows_affected() == 1 {
                return Ok(());
            }
            match self.current_status(id).await? {
                None => Err(CoreError::NotFound(format!("task {id}"))),
                Some(_) => Err(CoreError::ConstraintViolation(format!(
                    "delivery for task {id} already settled"
                ))),
            }
        })
    }

    fn get_task(&self, id: TaskId) -> Pin<Box<dyn Future<Output = Result<Option<Task>>> + Send + '_>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, TaskRow>(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"
            ))
            .bind(id.to_string())
            .fetch_optional(&*self.pool)
            .await?;

            row.map(Task::try_from).transpose()
        })
    }

    fn delivery_trace(
        &self,
        id: TaskId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryAttempt>>> + Send + '_>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, AttemptRow>(
                r"
                SELECT task_id, attempt_number, attempted_at, outcome,
                       status_code, error, duration_ms, next_retry_at
                FROM delivery_attempts
                WHERE task_id = ?1
                ORDER BY attempt_number ASC
                ",
            )
            .bind(id.to_string())
            .fetch_all(&*self.pool)
            .await?;

            rows.into_iter().map(DeliveryAttempt::try_from).collect()
        })
    }

    fn list_tasks(
        &self,
        filter: TaskFilter,
        page: Page,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Task>>> + Send + '_>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, TaskRow>(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks \
                 WHERE (?1 IS NULL OR mode = ?1) AND (?2 IS NULL OR status = ?2) \
                 ORDER BY submitted_at DESC, rowid DESC \
                 LIMIT ?3 OFFSET ?4"
            ))
            .bind(filter.mode.map(|m| m.as_str()))
            .bind(filter.status.map(|s| s.as_str()))
            .bind(i64::from(page.limit))
            .bind(i64::from(page.offset))
            .fetch_all(&*self.pool)
            .await?;

            rows.into_iter().map(Task::try_from).collect()
        })
    }

    fn health_check(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;
            Ok(())
        })
    }
}
