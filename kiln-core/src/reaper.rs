//! Zombie task reaper.
//!
//! Tasks stop moving when the process restarts mid-poll or a vendor never
//! answers. Any non-terminal task whose `updated_at` has not moved within
//! the staleness window is failed with a timeout message and its charge is
//! refunded through the shared once-only path.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::OrchestrateError;
use crate::gate::{refund_once, Gate};
use crate::store::TaskStore;
use crate::task::Task;

const TIMEOUT_MESSAGE: &str = "Task timed out: no progress within the staleness window";

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// How long a non-terminal task may go without an `updated_at` bump.
    pub stale_after: Duration,
    /// Sweep cadence.
    pub interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(30 * 60),
            interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Summary of one sweep.
#[derive(Debug, Clone, Default)]
pub struct ReapReport {
    pub examined: usize,
    pub reaped: usize,
    pub refunded: usize,
}

pub struct Reaper {
    store: Arc<dyn TaskStore>,
    gate: Arc<Gate>,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(store: Arc<dyn TaskStore>, gate: Arc<Gate>, config: ReaperConfig) -> Self {
        Self { store, gate, config }
    }

    /// The stale tasks a sweep would reap right now, without acting.
    pub async fn preview(&self) -> Result<Vec<Task>, OrchestrateError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.stale_after)
                .unwrap_or_else(|_| chrono::Duration::minutes(30));
        Ok(self.store.stale_non_terminal(cutoff).await?)
    }

    /// Fail and refund every stale task. Idempotent: a task another path
    /// terminated between listing and acting is skipped.
    pub async fn sweep(&self) -> Result<ReapReport, OrchestrateError> {
        let candidates = self.preview().await?;
        let mut report = ReapReport {
            examined: candidates.len(),
            ..Default::default()
        };

        for task in candidates {
            // Re-read: the listing is a snapshot and the task may have
            // finished since.
            let current = match self.store.get(&task.id).await? {
                Some(t) if !t.status.is_terminal() => t,
                _ => continue,
            };

            if !self.store.fail(&current.id, TIMEOUT_MESSAGE).await? {
                // Terminated between the re-read and the write.
                continue;
            }
            self.gate.release(&current.user_id).await;
            report.reaped += 1;
            warn!(
                task_id = %current.id,
                user_id = %current.user_id,
                stale_since = %current.updated_at,
                "reaped zombie task"
            );

            match refund_once(&self.store, self.gate.ledger(), &current, TIMEOUT_MESSAGE).await {
                Ok(true) => report.refunded += 1,
                Ok(false) => {}
                // The task stays failed with `refunded` clear; the flag
                // makes a later manual or scheduled retry safe.
                Err(e) => error!(task_id = %current.id, error = %e, "refund failed during sweep"),
            }
        }

        // Settle refunds that a ledger outage left behind. Each task here is
        // already failed; only the flag write is outstanding.
        for task in self.store.unrefunded_failures().await? {
            match refund_once(
                &self.store,
                self.gate.ledger(),
                &task,
                "Refund retry after ledger outage",
            )
            .await
            {
                Ok(true) => report.refunded += 1,
                Ok(false) => {}
                Err(e) => error!(task_id = %task.id, error = %e, "refund retry failed"),
            }
        }

        if report.reaped > 0 {
            info!(
                examined = report.examined,
                reaped = report.reaped,
                refunded = report.refunded,
                "reaper sweep complete"
            );
        }
        Ok(report)
    }

    /// Sweep forever at the configured cadence.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep().await {
                error!(error = %e, "reaper sweep failed");
            }
        }
    }
}
