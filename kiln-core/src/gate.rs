//! Admission control: entitlement, concurrency, and billing checks run
//! before a task row exists.
//!
//! The checks run in a fixed order (permission, concurrency, billing) so a
//! rejection never leaves a side effect behind: the charge is the last step,
//! and a failed charge releases the concurrency reservation taken just
//! before it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::OrchestrateError;
use crate::provider::ProviderId;
use crate::task::TaskKind;

/// Outcome of a permission check for one user/capability pair.
#[derive(Debug, Clone)]
pub struct PermissionGrant {
    pub allowed: bool,
    /// Human-readable denial reason; meaningful only when `allowed` is false.
    pub reason: Option<String>,
    /// Served from the tier's free daily quota; no charge is made.
    pub free: bool,
    /// Remaining free quota after this use, for client display.
    pub free_remaining: u32,
}

#[derive(Debug, Clone, Error)]
#[error("entitlement service error: {0}")]
pub struct EntitlementError(pub String);

/// The user-level service: tier permissions, concurrency limits, usage
/// accounting, and retention policy. External collaborator.
#[async_trait]
pub trait EntitlementService: Send + Sync + 'static {
    async fn check_permission(
        &self,
        user_id: &str,
        kind: TaskKind,
        provider: ProviderId,
    ) -> Result<PermissionGrant, EntitlementError>;

    /// The tier's max-concurrent-tasks limit for this user.
    async fn max_concurrency(&self, user_id: &str) -> Result<u32, EntitlementError>;

    /// Record one usage event for daily-quota accounting.
    async fn record_usage(
        &self,
        user_id: &str,
        provider: ProviderId,
        free: bool,
    ) -> Result<(), EntitlementError>;

    /// How long this user's artifacts are retained; `None` means no deadline.
    async fn retention(&self, user_id: &str)
    -> Result<Option<chrono::Duration>, EntitlementError>;
}

/// Proof that the ledger accepted a charge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub id: String,
    pub credits_charged: i64,
}

#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    #[error("insufficient credits: {0}")]
    InsufficientCredits(String),
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// Pricing inputs for a charge; the ledger owns the actual price table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeRequest {
    /// Operation name, e.g. `"image_generation"` or `"video_generation"`.
    pub operation: String,
    pub provider: ProviderId,
    pub resolution: Option<String>,
    pub duration: Option<u32>,
    pub quantity: u32,
}

/// The credit ledger / billing service. External collaborator.
#[async_trait]
pub trait CreditLedger: Send + Sync + 'static {
    async fn charge(&self, user_id: &str, request: &ChargeRequest)
    -> Result<Receipt, LedgerError>;

    async fn refund(&self, receipt_id: &str, reason: &str) -> Result<(), LedgerError>;
}

/// Everything the gate needs to decide on one admission.
#[derive(Debug, Clone)]
pub struct AdmitRequest {
    pub user_id: String,
    pub kind: TaskKind,
    pub provider: ProviderId,
    pub charge: ChargeRequest,
    /// Caller-supplied retry key; a repeated key returns the original
    /// admission without charging or recording usage again.
    pub idempotency_key: Option<String>,
}

/// A granted admission, carried onto the task row at creation.
#[derive(Debug, Clone)]
pub struct Admission {
    pub is_free_usage: bool,
    pub credits_charged: i64,
    pub usage_receipt_id: Option<String>,
    pub free_usage_remaining: u32,
}

/// How long an idempotency-key entry stays replayable. Long enough to cover
/// any sane client retry schedule, short enough that the cache cannot grow
/// without bound.
const ADMISSION_REPLAY_TTL: Duration = Duration::from_secs(60 * 60);

struct AdmittedEntry {
    admission: Admission,
    /// Set once the task row exists, so a replayed creation can return the
    /// original row instead of inserting a second one.
    task_id: Option<String>,
    admitted_at: Instant,
}

/// Admission gate: permission, per-user concurrency reservation, billing.
///
/// Concurrency reservations live in process memory and are released by the
/// orchestrator on every terminal transition, so the check-then-act against
/// the tier limit is atomic under concurrent admissions from one user.
pub struct Gate {
    entitlements: Arc<dyn EntitlementService>,
    ledger: Arc<dyn CreditLedger>,
    in_flight: Mutex<HashMap<String, u32>>,
    admitted: Mutex<HashMap<String, AdmittedEntry>>,
    replay_ttl: Duration,
}

impl Gate {
    pub fn new(entitlements: Arc<dyn EntitlementService>, ledger: Arc<dyn CreditLedger>) -> Self {
        Self {
            entitlements,
            ledger,
            in_flight: Mutex::new(HashMap::new()),
            admitted: Mutex::new(HashMap::new()),
            replay_ttl: ADMISSION_REPLAY_TTL,
        }
    }

    /// Override the idempotency replay window (tests use a short one).
    pub fn with_replay_ttl(mut self, ttl: Duration) -> Self {
        self.replay_ttl = ttl;
        self
    }

    pub fn entitlements(&self) -> &Arc<dyn EntitlementService> {
        &self.entitlements
    }

    pub fn ledger(&self) -> &Arc<dyn CreditLedger> {
        &self.ledger
    }

    /// Run the admission checks in order. On success one usage event has
    /// been recorded and (for non-free usage) the ledger has been charged.
    pub async fn admit(&self, request: &AdmitRequest) -> Result<Admission, OrchestrateError> {
        // Retried admission calls must not double-charge or double-count.
        if let Some(key) = &request.idempotency_key {
            let mut guard = self.admitted.lock().await;
            guard.retain(|_, entry| entry.admitted_at.elapsed() < self.replay_ttl);
            if let Some(prior) = guard.get(key) {
                info!(key = %key, "admission replayed from idempotency cache");
                return Ok(prior.admission.clone());
            }
        }

        let grant = self
            .entitlements
            .check_permission(&request.user_id, request.kind, request.provider)
            .await
            .map_err(|e| OrchestrateError::Upstream(e.to_string()))?;
        if !grant.allowed {
            return Err(OrchestrateError::NotPermitted(
                grant
                    .reason
                    .unwrap_or_else(|| "capability not available on this plan".to_owned()),
            ));
        }

        let limit = self
            .entitlements
            .max_concurrency(&request.user_id)
            .await
            .map_err(|e| OrchestrateError::Upstream(e.to_string()))?;
        self.reserve(&request.user_id, limit).await?;

        let admission = if grant.free {
            Admission {
                is_free_usage: true,
                credits_charged: 0,
                usage_receipt_id: None,
                free_usage_remaining: grant.free_remaining,
            }
        } else {
            match self.ledger.charge(&request.user_id, &request.charge).await {
                Ok(receipt) => Admission {
                    is_free_usage: false,
                    credits_charged: receipt.credits_charged,
                    usage_receipt_id: Some(receipt.id),
                    free_usage_remaining: 0,
                },
                Err(e) => {
                    self.release(&request.user_id).await;
                    return Err(match e {
                        LedgerError::InsufficientCredits(m) => {
                            OrchestrateError::InsufficientCredits(m)
                        }
                        LedgerError::Unavailable(m) => OrchestrateError::Upstream(m),
                    });
                }
            }
        };

        // Usage accounting is best-effort: a lost event skews quota by one
        // use, which is preferable to failing an already-charged admission.
        if let Err(e) = self
            .entitlements
            .record_usage(&request.user_id, request.provider, admission.is_free_usage)
            .await
        {
            warn!(user_id = %request.user_id, error = %e, "failed to record usage event");
        }

        if let Some(key) = &request.idempotency_key {
            self.admitted.lock().await.insert(
                key.clone(),
                AdmittedEntry {
                    admission: admission.clone(),
                    task_id: None,
                    admitted_at: Instant::now(),
                },
            );
        }

        Ok(admission)
    }

    /// Attach the created task row to its idempotency key so later replays
    /// resolve to the same task.
    pub async fn bind_task(&self, key: &str, task_id: &str) {
        if let Some(entry) = self.admitted.lock().await.get_mut(key) {
            entry.task_id = Some(task_id.to_owned());
        }
    }

    /// The task a previous admission under `key` created, if still cached.
    pub async fn replayed_task(&self, key: &str) -> Option<String> {
        let guard = self.admitted.lock().await;
        guard
            .get(key)
            .filter(|entry| entry.admitted_at.elapsed() < self.replay_ttl)
            .and_then(|entry| entry.task_id.clone())
    }

    async fn reserve(&self, user_id: &str, limit: u32) -> Result<(), OrchestrateError> {
        let mut guard = self.in_flight.lock().await;
        let count = guard.entry(user_id.to_owned()).or_insert(0);
        if *count >= limit {
            return Err(OrchestrateError::ConcurrencyExceeded { limit });
        }
        *count += 1;
        Ok(())
    }

    /// Release one concurrency slot. Called by the orchestrator on every
    /// terminal transition and by the gate itself on failed charges.
    pub async fn release(&self, user_id: &str) {
        let mut guard = self.in_flight.lock().await;
        if let Some(count) = guard.get_mut(user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                guard.remove(user_id);
            }
        }
    }

    /// Current reservation count for a user (diagnostics).
    pub async fn in_flight(&self, user_id: &str) -> u32 {
        self.in_flight.lock().await.get(user_id).copied().unwrap_or(0)
    }
}

/// Refund a failed task's charge at most once.
///
/// The `refunded` flag is the claim check: it is only set after the ledger
/// accepts the refund, so a ledger outage leaves the flag clear and a later
/// sweep retries. Free usage and never-charged tasks are no-ops. Returns
/// whether a refund was issued.
pub async fn refund_once(
    store: &Arc<dyn crate::store::TaskStore>,
    ledger: &Arc<dyn CreditLedger>,
    task: &crate::task::Task,
    reason: &str,
) -> Result<bool, OrchestrateError> {
    if task.refunded || task.is_free_usage {
        return Ok(false);
    }
    let Some(receipt_id) = &task.usage_receipt_id else {
        return Ok(false);
    };

    ledger
        .refund(receipt_id, reason)
        .await
        .map_err(|e| OrchestrateError::Upstream(e.to_string()))?;
    store.mark_refunded(&task.id).await?;
    info!(task_id = %task.id, receipt_id = %receipt_id, credits = task.credits_charged, "refund issued");
    Ok(true)
}
