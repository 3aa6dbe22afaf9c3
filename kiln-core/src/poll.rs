//! Poll supervisor for deferred vendor tasks.
//!
//! One supervisor instance drives one vendor task to a terminal state. The
//! stored task row is re-read before every poll so the supervisor is also
//! the join point for cancellation: if anything else moved the task to a
//! terminal state, the loop stops without touching it.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::OrchestrateError;
use crate::provider::{PollStatus, ProviderAdapter};
use crate::store::TaskStore;

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollConfig {
    // 120 attempts at 10s: a 20-minute ceiling per vendor task.
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_attempts: 120,
        }
    }
}

/// How a supervised poll loop ended.
#[derive(Debug, Clone)]
pub enum Supervised {
    /// The vendor finished; here is its artifact URL.
    Artifact(String),
    /// The task reached a terminal state through another path (cancellation,
    /// reaper) while we were polling. Nothing further to do.
    Superseded,
}

pub struct PollSupervisor {
    store: Arc<dyn TaskStore>,
    config: PollConfig,
}

impl PollSupervisor {
    pub fn new(store: Arc<dyn TaskStore>, config: PollConfig) -> Self {
        Self { store, config }
    }

    /// Poll `external_id` until the vendor finishes, the attempt budget runs
    /// out, or the stored task is terminated elsewhere.
    ///
    /// Transport failures consume an attempt and the loop continues; vendor
    /// credential rejections (401/403) abort immediately since no retry can
    /// ever succeed.
    pub async fn wait_until_terminal(
        &self,
        task_id: &str,
        external_id: &str,
        adapter: &Arc<dyn ProviderAdapter>,
    ) -> Result<Supervised, OrchestrateError> {
        for attempt in 1..=self.config.max_attempts {
            match self.store.get(task_id).await? {
                Some(task) if !task.status.is_terminal() => {}
                _ => {
                    debug!(task_id, "task terminated externally, stopping poll");
                    return Ok(Supervised::Superseded);
                }
            }

            match adapter.poll(external_id).await {
                Ok(PollStatus::Succeeded { artifact_url }) => {
                    return Ok(Supervised::Artifact(artifact_url));
                }
                Ok(PollStatus::Failed { reason }) => {
                    return Err(OrchestrateError::Provider(reason));
                }
                Ok(PollStatus::Running) => {
                    self.store
                        .set_progress(task_id, self.progress_for(attempt))
                        .await?;
                    debug!(task_id, external_id, attempt, "vendor task still running");
                }
                Err(e) if e.is_auth() => {
                    warn!(task_id, external_id, error = %e, "vendor rejected credentials, aborting poll");
                    return Err(OrchestrateError::Transport(e.to_string()));
                }
                Err(e) if e.is_retryable() => {
                    warn!(task_id, external_id, attempt, error = %e, "poll attempt failed");
                }
                Err(e) => return Err(OrchestrateError::Provider(e.to_string())),
            }

            tokio::time::sleep(self.config.interval).await;
        }

        Err(OrchestrateError::Timeout)
    }

    /// Synthetic progress while the vendor gives none: climbs from just past
    /// dispatch (30) toward 90, leaving the tail for rehoming/completion.
    fn progress_for(&self, attempt: u32) -> u8 {
        let span = 60 * attempt / self.config.max_attempts.max(1);
        (30 + span).min(90) as u8
    }
}
