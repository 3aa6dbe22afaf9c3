use thiserror::Error;

/// Errors produced by the task store.
///
/// The engine never sees the backing database's error type directly; store
/// implementations wrap their failures in this.
#[derive(Debug, Clone, Error)]
#[error("store error: {0}")]
pub struct StoreError(pub String);

/// Errors produced by the orchestration engine.
///
/// The first three variants are pre-dispatch rejections returned
/// synchronously to the caller; no task row exists for them. Everything
/// after a task is created is recorded on the task row instead of being
/// surfaced to an active caller.
#[derive(Debug, Clone, Error)]
pub enum OrchestrateError {
    /// The user's tier is not allowed to use the selected provider/capability.
    #[error("not permitted: {0}")]
    NotPermitted(String),

    /// The user is at their tier's max-concurrent-tasks limit.
    #[error("concurrency limit reached ({limit} in-flight tasks)")]
    ConcurrencyExceeded { limit: u32 },

    /// The credit ledger declined the charge.
    #[error("insufficient credits: {0}")]
    InsufficientCredits(String),

    /// The vendor rejected the request (content policy, quota, bad params).
    #[error("provider error: {0}")]
    Provider(String),

    /// Network/timeout failure talking to a vendor; retryable up to a bound.
    #[error("transport error: {0}")]
    Transport(String),

    /// Artifact could not be copied to durable storage. Non-fatal to the task.
    #[error("rehoming failed: {0}")]
    Rehost(String),

    /// Storyboard response did not match the expected JSON schema.
    #[error("storyboard parse error: {0}")]
    Parse(String),

    /// Reaper-detected staleness or poll-attempt exhaustion.
    #[error("task timed out")]
    Timeout,

    /// The referenced task does not exist.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Worker-pool submission queue is saturated.
    #[error("orchestrator queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// Task store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An external collaborator (ledger/entitlements) failed unexpectedly.
    #[error("upstream service error: {0}")]
    Upstream(String),
}

impl OrchestrateError {
    /// Returns `true` for errors worth retrying against the same vendor.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OrchestrateError::Transport(_))
    }
}
