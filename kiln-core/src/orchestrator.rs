//! The orchestration engine: task creation, the bounded worker pool, vendor
//! dispatch, and terminal bookkeeping.
//!
//! Every terminal transition funnels through [`Orchestrator::finalize`] or
//! [`Orchestrator::fail_task`] so the concurrency slot release and the
//! once-only refund cannot be missed on any path.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::OrchestrateError;
use crate::gate::{refund_once, AdmitRequest, ChargeRequest, Gate};
use crate::poll::{PollConfig, PollSupervisor, Supervised};
use crate::provider::{
    Generated, GenerationRequest, ProviderAdapter, ProviderRegistry, TextRequest,
};
use crate::rehome::Rehomer;
use crate::store::TaskStore;
use crate::storyboard::Storyboard;
use crate::task::{NewTask, Task, TaskKind, TaskStatus};

const CANCELLED_MESSAGE: &str = "Cancelled by user";

const STORYBOARD_SYSTEM_PROMPT: &str = "You are a film storyboard writer. \
Respond with a single JSON object and nothing else, in this shape: \
{\"title\": string, \"acts\": [{\"title\": string, \"shots\": [{\"scene\": string, \
\"description\": string, \"dialogue\": string | null, \"camera\": string | null}]}]}. \
Every act must contain at least one shot.";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Dispatch attempts against a vendor before giving up on transport
    /// failures.
    pub dispatch_attempts: u32,
    /// Base wait between dispatch retries; grows linearly per attempt.
    pub retry_backoff: Duration,
    pub poll: PollConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
            dispatch_attempts: 3,
            retry_backoff: Duration::from_secs(2),
            poll: PollConfig::default(),
        }
    }
}

pub struct Orchestrator {
    store: Arc<dyn TaskStore>,
    gate: Arc<Gate>,
    registry: Arc<ProviderRegistry>,
    rehomer: Arc<Rehomer>,
    queue: flume::Sender<String>,
    // Held so the queue survives even with zero workers; submissions then
    // wait in the channel until capacity rejects them.
    queue_rx: flume::Receiver<String>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Build the engine and spawn its worker pool.
    pub fn start(
        store: Arc<dyn TaskStore>,
        gate: Arc<Gate>,
        registry: Arc<ProviderRegistry>,
        rehomer: Arc<Rehomer>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        let (tx, rx) = flume::bounded::<String>(config.queue_capacity);
        let orchestrator = Arc::new(Self {
            store,
            gate,
            registry,
            rehomer,
            queue: tx,
            queue_rx: rx,
            config,
        });

        for worker in 0..orchestrator.config.workers {
            let rx = orchestrator.queue_rx.clone();
            let this = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                debug!(worker, "orchestrator worker started");
                while let Ok(task_id) = rx.recv_async().await {
                    this.process(&task_id).await;
                }
                debug!(worker, "orchestrator worker stopped");
            });
        }

        orchestrator
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn gate(&self) -> &Arc<Gate> {
        &self.gate
    }

    /// Admit, persist, and enqueue a new task. Returns the row already in
    /// `PROCESSING`; all further progress is observable only through the
    /// store. A replayed idempotency key returns the originally created row
    /// without admitting or inserting again.
    pub async fn create(
        &self,
        user_id: &str,
        request: NewTask,
        idempotency_key: Option<String>,
    ) -> Result<Task, OrchestrateError> {
        if let Some(key) = &idempotency_key {
            if let Some(task_id) = self.gate.replayed_task(key).await {
                if let Some(task) = self.store.get(&task_id).await? {
                    info!(task_id = %task.id, key = %key, "creation replayed from idempotency cache");
                    return Ok(task);
                }
            }
        }

        let admission = self
            .gate
            .admit(&AdmitRequest {
                user_id: user_id.to_owned(),
                kind: request.kind,
                provider: request.provider,
                charge: charge_for(&request),
                idempotency_key: idempotency_key.clone(),
            })
            .await?;

        // From here until the row exists, any failure must hand back the
        // charge and the concurrency slot the admission just took.
        let storage_expires_at = match self.gate.entitlements().retention(user_id).await {
            Ok(retention) => retention.map(|d| chrono::Utc::now() + d),
            Err(e) => {
                self.unwind_admission(user_id, &admission).await;
                return Err(OrchestrateError::Upstream(e.to_string()));
            }
        };

        let mut task = Task::new(user_id, request, &admission, storage_expires_at);
        if let Err(e) = self.store.insert(&task).await {
            self.unwind_admission(user_id, &admission).await;
            return Err(e.into());
        }

        // The PENDING -> PROCESSING transition is synchronous: the caller
        // gets back a row that is already in flight, before any vendor call.
        if let Err(e) = self
            .store
            .set_status(&task.id, TaskStatus::Processing, 10)
            .await
        {
            // The row exists, so the normal failure funnel settles the
            // charge and the slot.
            self.fail_task(&task.id, "Task could not be started").await;
            return Err(e.into());
        }
        task.status = TaskStatus::Processing;
        task.progress = 10;

        if let Some(key) = &idempotency_key {
            self.gate.bind_task(key, &task.id).await;
        }
        info!(
            task_id = %task.id,
            user_id,
            kind = %task.kind,
            provider = %task.provider,
            credits = task.credits_charged,
            free = task.is_free_usage,
            "task created"
        );

        if self.queue.try_send(task.id.clone()).is_err() {
            // Admission already charged; the task must die refunded rather
            // than sit in PENDING forever.
            let capacity = self.config.queue_capacity;
            warn!(task_id = %task.id, capacity, "worker queue full, rejecting task");
            let reason = format!("Orchestrator queue full (capacity {capacity})");
            self.fail_task(&task.id, &reason).await;
            return Err(OrchestrateError::QueueFull { capacity });
        }

        Ok(task)
    }

    pub async fn get(&self, task_id: &str) -> Result<Task, OrchestrateError> {
        self.store
            .get(task_id)
            .await?
            .ok_or_else(|| OrchestrateError::TaskNotFound(task_id.to_owned()))
    }

    pub async fn list_recent(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<Task>, OrchestrateError> {
        Ok(self.store.list_recent(user_id, limit).await?)
    }

    /// Cancel a non-terminal task. The poll supervisor observes the terminal
    /// state on its next iteration and stops. Returns `false` if the task
    /// was already terminal.
    pub async fn cancel(&self, task_id: &str) -> Result<bool, OrchestrateError> {
        let task = self.get(task_id).await?;
        if task.status.is_terminal() {
            return Ok(false);
        }
        if !self.store.fail(task_id, CANCELLED_MESSAGE).await? {
            // Lost the race with another terminal writer.
            return Ok(false);
        }
        self.gate.release(&task.user_id).await;
        if let Err(e) = refund_once(&self.store, self.gate.ledger(), &task, CANCELLED_MESSAGE).await
        {
            error!(task_id, error = %e, "refund failed on cancellation");
        }
        info!(task_id, "task cancelled");
        Ok(true)
    }

    /// Worker entry point: drive one task from `PENDING` to a terminal state.
    async fn process(&self, task_id: &str) {
        let task = match self.store.get(task_id).await {
            Ok(Some(task)) if !task.status.is_terminal() => task,
            Ok(_) => return,
            Err(e) => {
                error!(task_id, error = %e, "failed to load task for processing");
                return;
            }
        };

        if let Err(e) = self.run_task(&task).await {
            self.fail_task(task_id, &e.to_string()).await;
        }
    }

    async fn run_task(&self, task: &Task) -> Result<(), OrchestrateError> {
        let adapter = self
            .registry
            .get(task.provider)
            .ok_or_else(|| OrchestrateError::Provider(format!("no adapter for {}", task.provider)))?;

        match task.kind {
            TaskKind::Storyboard => self.run_storyboard(task, &adapter).await,
            TaskKind::Image | TaskKind::Video => self.run_generation(task, &adapter).await,
        }
    }

    async fn run_generation(
        &self,
        task: &Task,
        adapter: &Arc<dyn ProviderAdapter>,
    ) -> Result<(), OrchestrateError> {
        let request = GenerationRequest {
            kind: task.kind,
            prompt: task.prompt.clone(),
            ratio: task.ratio.clone(),
            reference_urls: task.reference_urls.clone(),
            params: task.params.clone(),
        };

        self.store.set_progress(&task.id, 20).await?;
        let generated = self.dispatch_with_retry(task, adapter, &request).await?;

        match generated {
            Generated::Artifacts(urls) => {
                self.store.set_progress(&task.id, 80).await?;
                self.finish_with_artifacts(task, urls).await
            }
            Generated::External { task_id: external } => {
                self.store.set_external_task_id(&task.id, &external).await?;
                self.store.set_progress(&task.id, 30).await?;

                let supervisor =
                    PollSupervisor::new(Arc::clone(&self.store), self.config.poll.clone());
                match supervisor
                    .wait_until_terminal(&task.id, &external, adapter)
                    .await?
                {
                    Supervised::Artifact(url) => self.finish_with_artifacts(task, vec![url]).await,
                    Supervised::Superseded => Ok(()),
                }
            }
        }
    }

    /// Dispatch against the vendor, retrying transport failures with a
    /// linearly growing backoff. Vendor rejections fail immediately.
    async fn dispatch_with_retry(
        &self,
        task: &Task,
        adapter: &Arc<dyn ProviderAdapter>,
        request: &GenerationRequest,
    ) -> Result<Generated, OrchestrateError> {
        let attempts = self.config.dispatch_attempts.max(1);
        let mut last_message = String::new();
        for attempt in 1..=attempts {
            match adapter.generate(request).await {
                Ok(generated) => return Ok(generated),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(task_id = %task.id, attempt, error = %e, "dispatch failed, retrying");
                    last_message = e.to_string();
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                }
                Err(e) if e.is_retryable() => {
                    last_message = e.to_string();
                }
                Err(e) => return Err(OrchestrateError::Provider(e.to_string())),
            }
        }
        Err(OrchestrateError::Transport(format!(
            "dispatch failed after {attempts} attempts: {last_message}"
        )))
    }

    /// Rehome artifacts and complete the task. Rehoming failures degrade to
    /// the vendor URL and are recorded in metadata; they never fail the task.
    async fn finish_with_artifacts(
        &self,
        task: &Task,
        urls: Vec<String>,
    ) -> Result<(), OrchestrateError> {
        if urls.is_empty() {
            return Err(OrchestrateError::Provider(
                "vendor returned no artifacts".to_owned(),
            ));
        }

        let ext = default_ext(task.kind);
        let mut durable = Vec::with_capacity(urls.len());
        let mut degraded = false;
        for url in &urls {
            match self.rehomer.rehome(url, ext).await {
                Ok(rehomed) => durable.push(rehomed),
                Err(e) => {
                    warn!(task_id = %task.id, url, error = %e, "rehoming failed, keeping vendor URL");
                    durable.push(url.clone());
                    degraded = true;
                }
            }
        }

        if durable.len() > 1 {
            self.store
                .merge_metadata(
                    &task.id,
                    serde_json::json!({
                        "all_artifact_urls": durable,
                        "artifact_count": durable.len(),
                    }),
                )
                .await?;
        }
        if degraded {
            self.store
                .merge_metadata(&task.id, serde_json::json!({ "rehomed": false }))
                .await?;
        }

        self.finalize(task, &durable[0]).await
    }

    async fn run_storyboard(
        &self,
        task: &Task,
        adapter: &Arc<dyn ProviderAdapter>,
    ) -> Result<(), OrchestrateError> {
        self.store.set_progress(&task.id, 20).await?;
        let text = adapter
            .generate_text(&TextRequest {
                prompt: task.prompt.clone(),
                system_prompt: Some(STORYBOARD_SYSTEM_PROMPT.to_owned()),
                temperature: Some(0.7),
                max_tokens: Some(4000),
            })
            .await
            .map_err(|e| {
                if e.is_retryable() {
                    OrchestrateError::Transport(e.to_string())
                } else {
                    OrchestrateError::Provider(e.to_string())
                }
            })?;

        let board = Storyboard::parse(&text)?;
        self.store.set_progress(&task.id, 80).await?;

        let script = serde_json::to_value(&board)
            .map_err(|e| OrchestrateError::Parse(e.to_string()))?;
        self.store
            .merge_metadata(
                &task.id,
                serde_json::json!({
                    "storyboard": script,
                    "shot_count": board.shot_count(),
                }),
            )
            .await?;

        // The script itself is the artifact; storing it as a JSON blob keeps
        // result_url meaningful for every task kind.
        let body = serde_json::to_vec_pretty(&board)
            .map_err(|e| OrchestrateError::Parse(e.to_string()))?;
        let url = self
            .rehomer
            .blobs()
            .put_bytes(".json", bytes::Bytes::from(body))
            .await
            .map_err(|e| OrchestrateError::Rehost(e.0))?;

        self.finalize(task, &url).await
    }

    /// Terminal success path. If the row was terminated elsewhere while the
    /// result was in flight (cancellation, reap), the late result is dropped
    /// and the slot is not released a second time.
    async fn finalize(&self, task: &Task, result_url: &str) -> Result<(), OrchestrateError> {
        if !self.store.complete(&task.id, result_url).await? {
            warn!(task_id = %task.id, "task already terminal, discarding late result");
            return Ok(());
        }
        self.gate.release(&task.user_id).await;
        info!(task_id = %task.id, result_url, "task completed");
        Ok(())
    }

    /// Terminal failure path: record the error, release the concurrency
    /// slot, refund the charge once. Skips tasks already terminal so a
    /// cancellation racing a worker failure settles on the first writer.
    async fn fail_task(&self, task_id: &str, message: &str) {
        let task = match self.store.get(task_id).await {
            Ok(Some(task)) if !task.status.is_terminal() => task,
            Ok(_) => return,
            Err(e) => {
                error!(task_id, error = %e, "failed to load task for failure handling");
                return;
            }
        };

        match self.store.fail(task_id, message).await {
            Ok(true) => {}
            // Another path terminated the task first; it also settled the
            // slot and the refund.
            Ok(false) => return,
            Err(e) => {
                error!(task_id, error = %e, "failed to record task failure");
                return;
            }
        }
        self.gate.release(&task.user_id).await;
        warn!(task_id, error = message, "task failed");

        if let Err(e) = refund_once(&self.store, self.gate.ledger(), &task, message).await {
            error!(task_id, error = %e, "refund failed; flag stays clear for retry");
        }
    }

    /// Undo an admission whose task row never came to exist: hand back the
    /// concurrency slot and refund the charge directly against the receipt.
    async fn unwind_admission(&self, user_id: &str, admission: &crate::gate::Admission) {
        self.gate.release(user_id).await;
        if let Some(receipt_id) = &admission.usage_receipt_id {
            if let Err(e) = self
                .gate
                .ledger()
                .refund(receipt_id, "Task creation failed")
                .await
            {
                error!(user_id, receipt_id = %receipt_id, error = %e, "refund failed for admission without a task row");
            }
        }
    }
}

fn charge_for(request: &NewTask) -> ChargeRequest {
    let operation = match request.kind {
        TaskKind::Image => "image_generation",
        TaskKind::Video => "video_generation",
        TaskKind::Storyboard => "storyboard_generation",
    };
    ChargeRequest {
        operation: operation.to_owned(),
        provider: request.provider,
        resolution: request.params.resolution.clone(),
        duration: request.params.duration,
        quantity: request.params.max_outputs.unwrap_or(1).max(1),
    }
}

fn default_ext(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::Image => ".png",
        TaskKind::Video => ".mp4",
        TaskKind::Storyboard => ".json",
    }
}
