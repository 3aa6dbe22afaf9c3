//! SQLite implementation of [`TaskStore`].
//!
//! Uses [`sqlx`] with the `sqlite` feature. Migrations are run automatically
//! on startup via [`SqliteStore::connect`].
//!
//! # Migrations path
//!
//! `sqlx::migrate!("./migrations")` resolves the path **at compile time**
//! relative to `CARGO_MANIFEST_DIR` (the crate root), so the directory is
//! embedded into the binary. The database file location is determined at
//! runtime by the `KILN_DATABASE_URL` environment variable.
//!
//! # Queries
//!
//! The `sqlx::query` (runtime-verified) form is used deliberately so that no
//! `DATABASE_URL` environment variable is needed at compile time. Timestamps
//! are stored as RFC3339 TEXT; UTC timestamps compare correctly as strings.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use kiln_core::{StoreError, Task, TaskStatus, TaskStore};

/// SQLite-backed task store.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the SQLite database at `url` and run pending
    /// migrations.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let pool = SqlitePool::connect(url).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError(e.to_string())
}

fn parse_err(context: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError(format!("corrupt {context} column: {e}"))
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    user_id: String,
    kind: String,
    provider: String,
    status: String,
    progress: i64,
    prompt: String,
    ratio: Option<String>,
    reference_urls: String,
    params: String,
    metadata: String,
    credits_charged: i64,
    usage_receipt_id: Option<String>,
    is_free_usage: bool,
    free_usage_remaining: i64,
    refunded: bool,
    external_task_id: Option<String>,
    source_node_id: Option<String>,
    result_url: Option<String>,
    error_message: Option<String>,
    storage_expires_at: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

fn parse_ts(context: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    raw.parse::<DateTime<Utc>>()
        .map_err(|e| parse_err(context, e))
}

fn parse_opt_ts(context: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|r| parse_ts(context, r)).transpose()
}

impl TaskRow {
    fn into_task(self) -> Result<Task, StoreError> {
        Ok(Task {
            kind: self.kind.parse().map_err(|e| parse_err("kind", e))?,
            provider: self.provider.parse().map_err(|e| parse_err("provider", e))?,
            status: self.status.parse().map_err(|e| parse_err("status", e))?,
            progress: self.progress.clamp(0, 100) as u8,
            free_usage_remaining: self.free_usage_remaining.max(0) as u32,
            reference_urls: serde_json::from_str(&self.reference_urls)
                .map_err(|e| parse_err("reference_urls", e))?,
            params: serde_json::from_str(&self.params).map_err(|e| parse_err("params", e))?,
            metadata: serde_json::from_str(&self.metadata)
                .map_err(|e| parse_err("metadata", e))?,
            storage_expires_at: parse_opt_ts(
                "storage_expires_at",
                self.storage_expires_at.as_deref(),
            )?,
            created_at: parse_ts("created_at", &self.created_at)?,
            updated_at: parse_ts("updated_at", &self.updated_at)?,
            completed_at: parse_opt_ts("completed_at", self.completed_at.as_deref())?,
            id: self.id,
            user_id: self.user_id,
            prompt: self.prompt,
            ratio: self.ratio,
            credits_charged: self.credits_charged,
            usage_receipt_id: self.usage_receipt_id,
            is_free_usage: self.is_free_usage,
            refunded: self.refunded,
            external_task_id: self.external_task_id,
            source_node_id: self.source_node_id,
            result_url: self.result_url,
            error_message: self.error_message,
        })
    }
}

const SELECT_COLUMNS: &str = "id, user_id, kind, provider, status, progress, prompt, ratio, \
     reference_urls, params, metadata, credits_charged, usage_receipt_id, is_free_usage, \
     free_usage_remaining, refunded, external_task_id, source_node_id, result_url, \
     error_message, storage_expires_at, created_at, updated_at, completed_at";

// Terminal statuses as stored, for reuse in WHERE clauses.
const TERMINAL: &str = "('SUCCESS', 'FAILURE')";

#[async_trait]
impl TaskStore for SqliteStore {
    async fn insert(&self, task: &Task) -> Result<(), StoreError> {
        let reference_urls = serde_json::to_string(&task.reference_urls)
            .map_err(|e| parse_err("reference_urls", e))?;
        let params =
            serde_json::to_string(&task.params).map_err(|e| parse_err("params", e))?;
        let metadata =
            serde_json::to_string(&task.metadata).map_err(|e| parse_err("metadata", e))?;

        sqlx::query(
            "INSERT INTO tasks (id, user_id, kind, provider, status, progress, prompt, ratio, \
             reference_urls, params, metadata, credits_charged, usage_receipt_id, \
             is_free_usage, free_usage_remaining, refunded, external_task_id, source_node_id, \
             result_url, error_message, storage_expires_at, created_at, updated_at, \
             completed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
             ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
        )
        .bind(&task.id)
        .bind(&task.user_id)
        .bind(task.kind.to_string())
        .bind(task.provider.to_string())
        .bind(task.status.to_string())
        .bind(task.progress as i64)
        .bind(&task.prompt)
        .bind(&task.ratio)
        .bind(&reference_urls)
        .bind(&params)
        .bind(&metadata)
        .bind(task.credits_charged)
        .bind(&task.usage_receipt_id)
        .bind(task.is_free_usage)
        .bind(task.free_usage_remaining as i64)
        .bind(task.refunded)
        .bind(&task.external_task_id)
        .bind(&task.source_node_id)
        .bind(&task.result_url)
        .bind(&task.error_message)
        .bind(task.storage_expires_at.map(|t| t.to_rfc3339()))
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .bind(task.completed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {SELECT_COLUMNS} FROM tasks WHERE id = ?1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        row.map(TaskRow::into_task).transpose()
    }

    async fn list_recent(&self, user_id: &str, limit: u32) -> Result<Vec<Task>, StoreError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM tasks WHERE user_id = ?1 \
             ORDER BY created_at DESC LIMIT ?2"
        ))
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    async fn set_status(
        &self,
        id: &str,
        status: TaskStatus,
        progress: u8,
    ) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "UPDATE tasks SET status = ?1, progress = MAX(progress, ?2), updated_at = ?3 \
             WHERE id = ?4 AND status NOT IN {TERMINAL}"
        ))
        .bind(status.to_string())
        .bind(progress as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn set_progress(&self, id: &str, progress: u8) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "UPDATE tasks SET progress = MIN(100, MAX(progress, ?1)), updated_at = ?2 \
             WHERE id = ?3 AND status NOT IN {TERMINAL}"
        ))
        .bind(progress as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn set_external_task_id(&self, id: &str, external_id: &str) -> Result<(), StoreError> {
        // Write-once: the guard clause makes a second call a no-op.
        sqlx::query(&format!(
            "UPDATE tasks SET external_task_id = ?1, updated_at = ?2 \
             WHERE id = ?3 AND external_task_id IS NULL AND status NOT IN {TERMINAL}"
        ))
        .bind(external_id)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn complete(&self, id: &str, result_url: &str) -> Result<bool, StoreError> {
        // The status guard makes terminal states final: a row that already
        // ended (cancelled, reaped) swallows the late success.
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(&format!(
            "UPDATE tasks SET status = 'SUCCESS', progress = 100, result_url = ?1, \
             completed_at = ?2, updated_at = ?2 WHERE id = ?3 AND status NOT IN {TERMINAL}"
        ))
        .bind(result_url)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn fail(&self, id: &str, error_message: &str) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(&format!(
            "UPDATE tasks SET status = 'FAILURE', error_message = ?1, \
             completed_at = ?2, updated_at = ?2 WHERE id = ?3 AND status NOT IN {TERMINAL}"
        ))
        .bind(error_message)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_refunded(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE tasks SET refunded = 1, updated_at = ?1 WHERE id = ?2")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn merge_metadata(
        &self,
        id: &str,
        patch: serde_json::Value,
    ) -> Result<(), StoreError> {
        // Read-modify-write inside a transaction so concurrent patches from
        // the worker and supervisor cannot clobber each other.
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let current: Option<(String,)> =
            sqlx::query_as("SELECT metadata FROM tasks WHERE id = ?1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
        let Some((raw,)) = current else {
            return Err(StoreError(format!("task {id} not found")));
        };

        let mut metadata: serde_json::Value =
            serde_json::from_str(&raw).map_err(|e| parse_err("metadata", e))?;
        if let (Some(target), Some(source)) = (metadata.as_object_mut(), patch.as_object()) {
            for (k, v) in source {
                target.insert(k.clone(), v.clone());
            }
        }
        let merged =
            serde_json::to_string(&metadata).map_err(|e| parse_err("metadata", e))?;

        sqlx::query("UPDATE tasks SET metadata = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(&merged)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn stale_non_terminal(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Task>, StoreError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM tasks \
             WHERE status NOT IN {TERMINAL} AND updated_at < ?1"
        ))
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    async fn unrefunded_failures(&self) -> Result<Vec<Task>, StoreError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM tasks \
             WHERE status = 'FAILURE' AND refunded = 0 AND is_free_usage = 0 \
             AND usage_receipt_id IS NOT NULL"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }
}
