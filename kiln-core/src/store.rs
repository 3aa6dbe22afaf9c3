//! Task persistence interface.
//!
//! The relational store is an external collaborator; the engine only talks
//! to it through [`TaskStore`]. [`MemoryStore`] is the in-process
//! implementation used by tests and by embedded deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::task::{Task, TaskStatus};

#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    async fn insert(&self, task: &Task) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Task>, StoreError>;

    /// Most-recent tasks for one user, newest first.
    async fn list_recent(&self, user_id: &str, limit: u32) -> Result<Vec<Task>, StoreError>;

    /// Write a non-terminal status plus progress. Bumps `updated_at`.
    /// A no-op on rows already terminal.
    async fn set_status(
        &self,
        id: &str,
        status: TaskStatus,
        progress: u8,
    ) -> Result<(), StoreError>;

    /// Raise progress; writes `max(current, progress)` so progress never
    /// goes backwards. Bumps `updated_at`. A no-op on terminal rows.
    async fn set_progress(&self, id: &str, progress: u8) -> Result<(), StoreError>;

    /// Record the vendor task handle. Write-once: a second call on the same
    /// task is ignored, as is any call on a terminal row.
    async fn set_external_task_id(&self, id: &str, external_id: &str) -> Result<(), StoreError>;

    /// Terminal success: `SUCCESS`, progress 100, `result_url`, `completed_at`.
    /// Returns `false` without writing when the row is already terminal, so
    /// a late vendor success cannot overwrite a cancellation or a reap.
    async fn complete(&self, id: &str, result_url: &str) -> Result<bool, StoreError>;

    /// Terminal failure: `FAILURE`, `error_message`, `completed_at`.
    /// Returns `false` without writing when the row is already terminal.
    async fn fail(&self, id: &str, error_message: &str) -> Result<bool, StoreError>;

    /// Set the refund claim-check flag.
    async fn mark_refunded(&self, id: &str) -> Result<(), StoreError>;

    /// Shallow-merge `patch` (an object) into the task's metadata map.
    async fn merge_metadata(&self, id: &str, patch: serde_json::Value)
    -> Result<(), StoreError>;

    /// Non-terminal tasks whose `updated_at` is older than `cutoff`.
    async fn stale_non_terminal(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, StoreError>;

    /// Failed tasks that were charged but whose refund has not gone through
    /// yet (ledger outage at failure time).
    async fn unrefunded_failures(&self) -> Result<Vec<Task>, StoreError>;
}

/// Map-under-RwLock store. Many readers may observe task state concurrently
/// while the orchestrator writes.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<HashMap<String, Task>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn mutate<F>(&self, id: &str, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Task),
    {
        let mut guard = self.inner.write().await;
        let task = guard
            .get_mut(id)
            .ok_or_else(|| StoreError(format!("task {id} not found")))?;
        f(task);
        task.updated_at = Utc::now();
        Ok(())
    }

    /// Like `mutate`, but terminal rows are left untouched. Returns whether
    /// the closure ran.
    async fn mutate_live<F>(&self, id: &str, f: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut Task),
    {
        let mut guard = self.inner.write().await;
        let task = guard
            .get_mut(id)
            .ok_or_else(|| StoreError(format!("task {id} not found")))?;
        if task.status.is_terminal() {
            return Ok(false);
        }
        f(task);
        task.updated_at = Utc::now();
        Ok(true)
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert(&self, task: &Task) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.inner.read().await.get(id).cloned())
    }

    async fn list_recent(&self, user_id: &str, limit: u32) -> Result<Vec<Task>, StoreError> {
        let guard = self.inner.read().await;
        let mut tasks: Vec<Task> = guard
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.truncate(limit as usize);
        Ok(tasks)
    }

    async fn set_status(
        &self,
        id: &str,
        status: TaskStatus,
        progress: u8,
    ) -> Result<(), StoreError> {
        self.mutate_live(id, |t| {
            t.status = status;
            t.progress = t.progress.max(progress);
        })
        .await
        .map(|_| ())
    }

    async fn set_progress(&self, id: &str, progress: u8) -> Result<(), StoreError> {
        self.mutate_live(id, |t| t.progress = t.progress.max(progress.min(100)))
            .await
            .map(|_| ())
    }

    async fn set_external_task_id(&self, id: &str, external_id: &str) -> Result<(), StoreError> {
        self.mutate_live(id, |t| {
            if t.external_task_id.is_none() {
                t.external_task_id = Some(external_id.to_owned());
            }
        })
        .await
        .map(|_| ())
    }

    async fn complete(&self, id: &str, result_url: &str) -> Result<bool, StoreError> {
        self.mutate_live(id, |t| {
            t.status = TaskStatus::Success;
            t.progress = 100;
            t.result_url = Some(result_url.to_owned());
            t.completed_at = Some(Utc::now());
        })
        .await
    }

    async fn fail(&self, id: &str, error_message: &str) -> Result<bool, StoreError> {
        self.mutate_live(id, |t| {
            t.status = TaskStatus::Failure;
            t.error_message = Some(error_message.to_owned());
            t.completed_at = Some(Utc::now());
        })
        .await
    }

    async fn mark_refunded(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(id, |t| t.refunded = true).await
    }

    async fn merge_metadata(
        &self,
        id: &str,
        patch: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.mutate(id, |t| {
            if let (Some(target), Some(source)) = (t.metadata.as_object_mut(), patch.as_object())
            {
                for (k, v) in source {
                    target.insert(k.clone(), v.clone());
                }
            }
        })
        .await
    }

    async fn stale_non_terminal(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .values()
            .filter(|t| !t.status.is_terminal() && t.updated_at < cutoff)
            .cloned()
            .collect())
    }

    async fn unrefunded_failures(&self) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .values()
            .filter(|t| {
                t.status == TaskStatus::Failure
                    && !t.refunded
                    && !t.is_free_usage
                    && t.usage_receipt_id.is_some()
            })
            .cloned()
            .collect())
    }
}
