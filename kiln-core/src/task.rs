use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::provider::ProviderId;

/// Lifecycle state of a generation task.
///
/// `Success` and `Failure` are terminal; no transition ever leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Success,
    Failure,
}

impl TaskStatus {
    /// Returns `true` if the task has reached a terminal state.
    ///
    /// Callers that poll status until the task is done should use this
    /// rather than matching individual variants.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }
}

/// What kind of artifact a task produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    Image,
    Video,
    /// Text-to-structured-JSON script generation; no artifact rehoming.
    Storyboard,
}

/// Provider-specific request parameters.
///
/// `extra` is an open map for keys only a single adapter understands; each
/// adapter documents the subset it reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderParams {
    pub resolution: Option<String>,
    /// Clip duration in seconds (video only).
    pub duration: Option<u32>,
    /// Generation sub-type, e.g. `"t2v"`, `"i2v"`, `"fl2v"`.
    pub generation_type: Option<String>,
    /// Number of artifacts for batch image generation (default 1).
    pub max_outputs: Option<u32>,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One asynchronous generation request and its lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub kind: TaskKind,
    pub provider: ProviderId,
    pub status: TaskStatus,
    /// 0..=100, monotonically non-decreasing while non-terminal.
    pub progress: u8,

    pub prompt: String,
    pub ratio: Option<String>,
    pub reference_urls: Vec<String>,
    pub params: ProviderParams,
    /// Open bookkeeping map (batch results, storyboard script, provider
    /// extras). Treated as opaque passthrough by the store.
    pub metadata: serde_json::Value,

    pub credits_charged: i64,
    /// Set iff a charge was made; used to drive the refund on failure.
    pub usage_receipt_id: Option<String>,
    pub is_free_usage: bool,
    /// Free daily quota left after this admission, surfaced to the caller
    /// on creation. Zero for charged usage.
    pub free_usage_remaining: u32,
    /// Set at most once, only after a successful refund.
    pub refunded: bool,

    /// Vendor task handle; write-once, present only for deferred providers.
    pub external_task_id: Option<String>,
    /// Caller-side correlation key, opaque to the engine.
    pub source_node_id: Option<String>,

    /// Durable artifact URL; set only on `Success`.
    pub result_url: Option<String>,
    /// Human-readable failure surface; set only on `Failure`.
    pub error_message: Option<String>,
    /// Retention deadline computed from the owner's plan tier at creation.
    pub storage_expires_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    /// Bumped on every status/progress write; the reaper's staleness signal.
    pub updated_at: DateTime<Utc>,
    /// Set once, on reaching a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Build a fresh `PENDING` task for `user_id` from a request and the
    /// admission outcome.
    pub fn new(
        user_id: &str,
        request: NewTask,
        admission: &crate::gate::Admission,
        storage_expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Task {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_owned(),
            kind: request.kind,
            provider: request.provider,
            status: TaskStatus::Pending,
            progress: 0,
            prompt: request.prompt,
            ratio: request.ratio,
            reference_urls: request.reference_urls,
            params: request.params,
            metadata: request
                .metadata
                .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
            credits_charged: admission.credits_charged,
            usage_receipt_id: admission.usage_receipt_id.clone(),
            is_free_usage: admission.is_free_usage,
            free_usage_remaining: admission.free_usage_remaining,
            refunded: false,
            external_task_id: None,
            source_node_id: request.source_node_id,
            result_url: None,
            error_message: None,
            storage_expires_at,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Caller-supplied description of a task to create.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub kind: TaskKind,
    pub provider: ProviderId,
    pub prompt: String,
    pub ratio: Option<String>,
    #[serde(default)]
    pub reference_urls: Vec<String>,
    #[serde(default)]
    pub params: ProviderParams,
    pub source_node_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_round_trip() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Success,
            TaskStatus::Failure,
        ] {
            let text = s.to_string();
            assert_eq!(text.parse::<TaskStatus>().ok(), Some(s), "{text}");
        }
        assert_eq!("PROCESSING".parse::<TaskStatus>().ok(), Some(TaskStatus::Processing));
    }

    #[test]
    fn only_success_and_failure_are_terminal() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Success.is_terminal());
        assert!(TaskStatus::Failure.is_terminal());
    }
}
