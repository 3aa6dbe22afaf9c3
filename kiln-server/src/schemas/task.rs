//! Task API schemas.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use kiln_core::{NewTask, ProviderId, ProviderParams, Task, TaskKind};

/// Body of `POST /v1/tasks`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateTaskRequest {
    /// `IMAGE`, `VIDEO`, or `STORYBOARD`.
    #[schema(value_type = String, example = "VIDEO")]
    pub kind: TaskKind,
    /// `minimax`, `doubao`, or `gemini`.
    #[schema(value_type = String, example = "minimax")]
    pub provider: ProviderId,
    pub prompt: String,
    /// Aspect ratio, e.g. `"16:9"`.
    pub ratio: Option<String>,
    #[serde(default)]
    pub reference_urls: Vec<String>,
    pub resolution: Option<String>,
    /// Clip duration in seconds (video only).
    pub duration: Option<u32>,
    /// Generation sub-type, e.g. `"t2v"`, `"i2v"`, `"fl2v"`, `"ref2v"`.
    pub generation_type: Option<String>,
    /// Batch size for image generation.
    pub max_outputs: Option<u32>,
    /// Caller-side correlation key, echoed back unchanged.
    pub source_node_id: Option<String>,
    /// Extra provider-specific parameters (e.g. `{"model": "..."}`).
    #[serde(default)]
    #[schema(value_type = Object)]
    pub extra: serde_json::Map<String, serde_json::Value>,
    /// Initial metadata to attach to the task.
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<serde_json::Value>,
}

impl CreateTaskRequest {
    pub fn into_new_task(self) -> NewTask {
        NewTask {
            kind: self.kind,
            provider: self.provider,
            prompt: self.prompt,
            ratio: self.ratio,
            reference_urls: self.reference_urls,
            params: ProviderParams {
                resolution: self.resolution,
                duration: self.duration,
                generation_type: self.generation_type,
                max_outputs: self.max_outputs,
                extra: self.extra,
            },
            source_node_id: self.source_node_id,
            metadata: self.metadata,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema, IntoParams)]
pub struct ListTasksQuery {
    /// Maximum rows to return (default 50).
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TaskResponse {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub provider: String,
    pub status: String,
    pub progress: u8,
    pub prompt: String,
    pub ratio: Option<String>,
    pub result_url: Option<String>,
    pub error_message: Option<String>,
    pub external_task_id: Option<String>,
    pub source_node_id: Option<String>,
    #[schema(value_type = Object)]
    pub metadata: serde_json::Value,
    pub credits_charged: i64,
    pub is_free_usage: bool,
    /// Free daily uses left after this task was admitted.
    pub free_usage_remaining: u32,
    pub refunded: bool,
    pub storage_expires_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl TaskResponse {
    pub fn from_task(task: Task) -> Self {
        Self {
            id: task.id,
            user_id: task.user_id,
            kind: task.kind.to_string(),
            provider: task.provider.to_string(),
            status: task.status.to_string(),
            progress: task.progress,
            prompt: task.prompt,
            ratio: task.ratio,
            result_url: task.result_url,
            error_message: task.error_message,
            external_task_id: task.external_task_id,
            source_node_id: task.source_node_id,
            metadata: task.metadata,
            credits_charged: task.credits_charged,
            is_free_usage: task.is_free_usage,
            free_usage_remaining: task.free_usage_remaining,
            refunded: task.refunded,
            storage_expires_at: task.storage_expires_at.map(|t| t.to_rfc3339()),
            created_at: task.created_at.to_rfc3339(),
            updated_at: task.updated_at.to_rfc3339(),
            completed_at: task.completed_at.map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ReapReportResponse {
    pub examined: usize,
    pub reaped: usize,
    pub refunded: usize,
}
