//! Engine-level tests: the orchestrator, gate, reaper, and poll supervisor
//! wired against scripted collaborators.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};

use crate::error::OrchestrateError;
use crate::gate::{
    AdmitRequest, ChargeRequest, CreditLedger, EntitlementError, EntitlementService, Gate,
    LedgerError, PermissionGrant, Receipt,
};
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::poll::PollConfig;
use crate::provider::{
    Generated, GenerationRequest, PollStatus, ProviderAdapter, ProviderCallError, ProviderId,
    ProviderRegistry, TextRequest,
};
use crate::reaper::{Reaper, ReaperConfig};
use crate::rehome::{BlobError, BlobStore, Rehomer};
use crate::store::{MemoryStore, TaskStore};
use crate::task::{NewTask, ProviderParams, Task, TaskKind, TaskStatus};

const BLOB_PREFIX: &str = "https://blobs.test/";

// A 1x1 PNG is overkill; any bytes round-trip through the blob store.
const INLINE_PNG: &str = "data:image/png;base64,aGVsbG8gd29ybGQ=";

struct StaticEntitlements {
    allow: bool,
    free: bool,
    limit: u32,
    retention: Option<chrono::Duration>,
    fail_retention: bool,
}

impl Default for StaticEntitlements {
    fn default() -> Self {
        Self {
            allow: true,
            free: false,
            limit: 10,
            retention: Some(chrono::Duration::days(7)),
            fail_retention: false,
        }
    }
}

#[async_trait]
impl EntitlementService for StaticEntitlements {
    async fn check_permission(
        &self,
        _user_id: &str,
        _kind: TaskKind,
        _provider: ProviderId,
    ) -> Result<PermissionGrant, EntitlementError> {
        Ok(PermissionGrant {
            allowed: self.allow,
            reason: (!self.allow).then(|| "plan does not include this provider".to_owned()),
            free: self.free,
            free_remaining: if self.free { 2 } else { 0 },
        })
    }

    async fn max_concurrency(&self, _user_id: &str) -> Result<u32, EntitlementError> {
        Ok(self.limit)
    }

    async fn record_usage(
        &self,
        _user_id: &str,
        _provider: ProviderId,
        _free: bool,
    ) -> Result<(), EntitlementError> {
        Ok(())
    }

    async fn retention(
        &self,
        _user_id: &str,
    ) -> Result<Option<chrono::Duration>, EntitlementError> {
        if self.fail_retention {
            return Err(EntitlementError("retention lookup failed".to_owned()));
        }
        Ok(self.retention)
    }
}

#[derive(Default)]
struct CountingLedger {
    charges: AtomicU32,
    refunds: Mutex<Vec<String>>,
    deny_charge: bool,
    fail_refund: AtomicBool,
}

impl CountingLedger {
    fn charge_count(&self) -> u32 {
        self.charges.load(Ordering::SeqCst)
    }

    fn refund_count(&self) -> usize {
        self.refunds.lock().unwrap().len()
    }
}

#[async_trait]
impl CreditLedger for CountingLedger {
    async fn charge(
        &self,
        _user_id: &str,
        _request: &ChargeRequest,
    ) -> Result<Receipt, LedgerError> {
        if self.deny_charge {
            return Err(LedgerError::InsufficientCredits("balance is 0".to_owned()));
        }
        let n = self.charges.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Receipt {
            id: format!("rcpt-{n}"),
            credits_charged: 40,
        })
    }

    async fn refund(&self, receipt_id: &str, _reason: &str) -> Result<(), LedgerError> {
        if self.fail_refund.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("ledger down".to_owned()));
        }
        self.refunds.lock().unwrap().push(receipt_id.to_owned());
        Ok(())
    }
}

#[derive(Default)]
struct MemoryBlobs {
    stored: Mutex<Vec<(String, usize)>>,
    fail: bool,
}

#[async_trait]
impl BlobStore for MemoryBlobs {
    async fn put_stream(
        &self,
        ext: &str,
        mut stream: BoxStream<'static, Result<Bytes, BlobError>>,
    ) -> Result<String, BlobError> {
        if self.fail {
            return Err(BlobError("disk full".to_owned()));
        }
        let mut size = 0;
        while let Some(chunk) = stream.next().await {
            size += chunk?.len();
        }
        let url = format!("{BLOB_PREFIX}{}{ext}", uuid::Uuid::new_v4());
        self.stored.lock().unwrap().push((ext.to_owned(), size));
        Ok(url)
    }

    fn owns_url(&self, url: &str) -> bool {
        url.starts_with(BLOB_PREFIX)
    }
}

/// Adapter whose responses are scripted per test. Exhausted generate scripts
/// error; exhausted poll scripts report the task still running.
#[derive(Default)]
struct ScriptedAdapter {
    generates: Mutex<VecDeque<Result<Generated, ProviderCallError>>>,
    polls: Mutex<VecDeque<Result<PollStatus, ProviderCallError>>>,
    text: Mutex<Option<Result<String, ProviderCallError>>>,
}

impl ScriptedAdapter {
    fn will_generate(self, outcome: Result<Generated, ProviderCallError>) -> Self {
        self.generates.lock().unwrap().push_back(outcome);
        self
    }

    fn will_poll(self, outcome: Result<PollStatus, ProviderCallError>) -> Self {
        self.polls.lock().unwrap().push_back(outcome);
        self
    }

    fn will_answer(self, text: Result<String, ProviderCallError>) -> Self {
        *self.text.lock().unwrap() = Some(text);
        self
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Minimax
    }

    async fn generate(
        &self,
        _request: &GenerationRequest,
    ) -> Result<Generated, ProviderCallError> {
        self.generates
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderCallError::Provider("script exhausted".to_owned())))
    }

    async fn poll(&self, _external_task_id: &str) -> Result<PollStatus, ProviderCallError> {
        self.polls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(PollStatus::Running))
    }

    async fn generate_text(&self, _request: &TextRequest) -> Result<String, ProviderCallError> {
        self.text
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Err(ProviderCallError::Provider("no text scripted".to_owned())))
    }
}

/// Deferred adapter whose poll blocks until the test releases it, then
/// reports a vendor success. Lets a test terminate the task while a poll is
/// in flight.
struct GatedPollAdapter {
    entered: Arc<tokio::sync::Notify>,
    release: Arc<tokio::sync::Notify>,
}

#[async_trait]
impl ProviderAdapter for GatedPollAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Minimax
    }

    async fn generate(
        &self,
        _request: &GenerationRequest,
    ) -> Result<Generated, ProviderCallError> {
        Ok(Generated::External {
            task_id: "mm-gated".to_owned(),
        })
    }

    async fn poll(&self, _external_task_id: &str) -> Result<PollStatus, ProviderCallError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(PollStatus::Succeeded {
            artifact_url: format!("{BLOB_PREFIX}late.mp4"),
        })
    }
}

struct Harness {
    store: Arc<dyn TaskStore>,
    gate: Arc<Gate>,
    ledger: Arc<CountingLedger>,
    blobs: Arc<MemoryBlobs>,
    orchestrator: Arc<Orchestrator>,
}

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        workers: 2,
        queue_capacity: 16,
        dispatch_attempts: 2,
        retry_backoff: Duration::from_millis(1),
        poll: PollConfig {
            interval: Duration::from_millis(5),
            max_attempts: 200,
        },
    }
}

fn harness(adapter: impl ProviderAdapter) -> Harness {
    harness_with(
        StaticEntitlements::default(),
        CountingLedger::default(),
        MemoryBlobs::default(),
        adapter,
        fast_config(),
    )
}

fn harness_with(
    entitlements: StaticEntitlements,
    ledger: CountingLedger,
    blobs: MemoryBlobs,
    adapter: impl ProviderAdapter,
    config: OrchestratorConfig,
) -> Harness {
    let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
    let ledger = Arc::new(ledger);
    let blobs = Arc::new(blobs);
    let gate = Arc::new(Gate::new(
        Arc::new(entitlements),
        ledger.clone() as Arc<dyn CreditLedger>,
    ));
    let registry = Arc::new(ProviderRegistry::new().register(Arc::new(adapter)));
    let rehomer =
        Arc::new(Rehomer::new(blobs.clone() as Arc<dyn BlobStore>).expect("rehomer"));
    let orchestrator = Orchestrator::start(
        store.clone(),
        gate.clone(),
        registry,
        rehomer,
        config,
    );
    Harness {
        store,
        gate,
        ledger,
        blobs,
        orchestrator,
    }
}

fn video_request() -> NewTask {
    NewTask {
        kind: TaskKind::Video,
        provider: ProviderId::Minimax,
        prompt: "a harbor at dawn".to_owned(),
        ratio: Some("16:9".to_owned()),
        reference_urls: vec![],
        params: ProviderParams {
            resolution: Some("1080P".to_owned()),
            duration: Some(5),
            ..Default::default()
        },
        source_node_id: Some("node-7".to_owned()),
        metadata: None,
    }
}

fn image_request() -> NewTask {
    NewTask {
        kind: TaskKind::Image,
        provider: ProviderId::Minimax,
        prompt: "a lighthouse".to_owned(),
        ratio: Some("1:1".to_owned()),
        reference_urls: vec![],
        params: ProviderParams::default(),
        source_node_id: None,
        metadata: None,
    }
}

fn storyboard_request() -> NewTask {
    NewTask {
        kind: TaskKind::Storyboard,
        provider: ProviderId::Minimax,
        prompt: "three-act heist story".to_owned(),
        ratio: None,
        reference_urls: vec![],
        params: ProviderParams::default(),
        source_node_id: None,
        metadata: None,
    }
}

async fn wait_terminal(store: &Arc<dyn TaskStore>, id: &str) -> Task {
    for _ in 0..1000 {
        if let Some(task) = store.get(id).await.expect("store get") {
            if task.status.is_terminal() {
                return task;
            }
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("task {id} never reached a terminal state");
}

async fn wait_external_id(store: &Arc<dyn TaskStore>, id: &str) -> String {
    for _ in 0..1000 {
        if let Some(task) = store.get(id).await.expect("store get") {
            if let Some(external) = task.external_task_id {
                return external;
            }
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("task {id} never recorded an external id");
}

#[tokio::test]
async fn sync_artifacts_are_rehomed_and_complete_the_task() {
    let adapter = ScriptedAdapter::default()
        .will_generate(Ok(Generated::Artifacts(vec![INLINE_PNG.to_owned()])));
    let h = harness(adapter);

    let task = h.orchestrator.create("alice", image_request(), None).await.unwrap();
    // Creation returns after the synchronous PENDING -> PROCESSING move.
    assert_eq!(task.status, TaskStatus::Processing);
    assert_eq!(task.progress, 10);
    assert_eq!(task.credits_charged, 40);

    let done = wait_terminal(&h.store, &task.id).await;
    assert_eq!(done.status, TaskStatus::Success);
    assert_eq!(done.progress, 100);
    let url = done.result_url.expect("result url");
    assert!(url.starts_with(BLOB_PREFIX), "{url}");
    assert!(url.ends_with(".png"), "{url}");
    assert!(done.completed_at.is_some());
    assert_eq!(h.gate.in_flight("alice").await, 0);
    assert_eq!(h.ledger.refund_count(), 0);
    assert_eq!(h.blobs.stored.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn deferred_task_polls_through_to_success() {
    let adapter = ScriptedAdapter::default()
        .will_generate(Ok(Generated::External {
            task_id: "mm-123".to_owned(),
        }))
        .will_poll(Ok(PollStatus::Running))
        .will_poll(Ok(PollStatus::Running))
        .will_poll(Ok(PollStatus::Succeeded {
            artifact_url: format!("{BLOB_PREFIX}already-durable.mp4"),
        }));
    let h = harness(adapter);

    let task = h.orchestrator.create("alice", video_request(), None).await.unwrap();
    let done = wait_terminal(&h.store, &task.id).await;

    assert_eq!(done.status, TaskStatus::Success);
    assert_eq!(done.external_task_id.as_deref(), Some("mm-123"));
    // Already-durable URLs pass through rehoming untouched.
    assert_eq!(
        done.result_url.as_deref(),
        Some(format!("{BLOB_PREFIX}already-durable.mp4").as_str())
    );
    assert_eq!(h.gate.in_flight("alice").await, 0);
}

#[tokio::test]
async fn transient_poll_errors_are_absorbed() {
    let adapter = ScriptedAdapter::default()
        .will_generate(Ok(Generated::External {
            task_id: "mm-9".to_owned(),
        }))
        .will_poll(Err(ProviderCallError::transport("502", Some(502))))
        .will_poll(Ok(PollStatus::Succeeded {
            artifact_url: format!("{BLOB_PREFIX}v.mp4"),
        }));
    let h = harness(adapter);

    let task = h.orchestrator.create("alice", video_request(), None).await.unwrap();
    let done = wait_terminal(&h.store, &task.id).await;
    assert_eq!(done.status, TaskStatus::Success);
}

#[tokio::test]
async fn credential_rejection_aborts_polling_and_refunds() {
    let adapter = ScriptedAdapter::default()
        .will_generate(Ok(Generated::External {
            task_id: "mm-8".to_owned(),
        }))
        .will_poll(Err(ProviderCallError::transport("401", Some(401))));
    let h = harness(adapter);

    let task = h.orchestrator.create("alice", video_request(), None).await.unwrap();
    let done = wait_terminal(&h.store, &task.id).await;

    assert_eq!(done.status, TaskStatus::Failure);
    assert!(done.refunded);
    assert_eq!(h.ledger.refund_count(), 1);
    assert_eq!(h.gate.in_flight("alice").await, 0);
}

#[tokio::test]
async fn permission_denial_has_no_side_effects() {
    let h = harness_with(
        StaticEntitlements {
            allow: false,
            ..Default::default()
        },
        CountingLedger::default(),
        MemoryBlobs::default(),
        ScriptedAdapter::default(),
        fast_config(),
    );

    let err = h
        .orchestrator
        .create("alice", image_request(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrateError::NotPermitted(_)));
    assert_eq!(h.ledger.charge_count(), 0);
    assert_eq!(h.gate.in_flight("alice").await, 0);
    assert!(h.store.list_recent("alice", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn insufficient_credits_releases_the_reserved_slot() {
    let h = harness_with(
        StaticEntitlements::default(),
        CountingLedger {
            deny_charge: true,
            ..Default::default()
        },
        MemoryBlobs::default(),
        ScriptedAdapter::default(),
        fast_config(),
    );

    let err = h
        .orchestrator
        .create("alice", image_request(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrateError::InsufficientCredits(_)));
    assert_eq!(h.gate.in_flight("alice").await, 0);
    assert!(h.store.list_recent("alice", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_creation_after_a_charge_refunds_and_releases() {
    let h = harness_with(
        StaticEntitlements {
            fail_retention: true,
            ..Default::default()
        },
        CountingLedger::default(),
        MemoryBlobs::default(),
        ScriptedAdapter::default(),
        fast_config(),
    );

    let err = h
        .orchestrator
        .create("alice", image_request(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrateError::Upstream(_)));

    // The admission had already charged; the rejection hands everything back.
    assert_eq!(h.ledger.charge_count(), 1);
    assert_eq!(h.ledger.refund_count(), 1);
    assert_eq!(h.gate.in_flight("alice").await, 0);
    assert!(h.store.list_recent("alice", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrency_limit_rejects_until_a_slot_frees() {
    let adapter = ScriptedAdapter::default()
        .will_generate(Ok(Generated::External {
            task_id: "mm-a".to_owned(),
        }))
        .will_generate(Ok(Generated::External {
            task_id: "mm-b".to_owned(),
        }));
    let h = harness_with(
        StaticEntitlements {
            limit: 1,
            ..Default::default()
        },
        CountingLedger::default(),
        MemoryBlobs::default(),
        adapter,
        fast_config(),
    );

    let first = h.orchestrator.create("alice", video_request(), None).await.unwrap();
    assert_eq!(h.gate.in_flight("alice").await, 1);

    let err = h
        .orchestrator
        .create("alice", video_request(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrateError::ConcurrencyExceeded { limit: 1 }));

    assert!(h.orchestrator.cancel(&first.id).await.unwrap());
    assert_eq!(h.gate.in_flight("alice").await, 0);

    h.orchestrator.create("alice", video_request(), None).await.unwrap();
}

#[tokio::test]
async fn simultaneous_admissions_grant_exactly_the_limit() {
    let h = harness_with(
        StaticEntitlements {
            limit: 2,
            ..Default::default()
        },
        CountingLedger::default(),
        MemoryBlobs::default(),
        ScriptedAdapter::default(),
        fast_config(),
    );

    let mut handles = Vec::new();
    for _ in 0..3 {
        let gate = h.gate.clone();
        handles.push(tokio::spawn(async move {
            gate.admit(&AdmitRequest {
                user_id: "alice".to_owned(),
                kind: TaskKind::Image,
                provider: ProviderId::Minimax,
                charge: ChargeRequest {
                    operation: "image_generation".to_owned(),
                    provider: ProviderId::Minimax,
                    resolution: None,
                    duration: None,
                    quantity: 1,
                },
                idempotency_key: None,
            })
            .await
        }));
    }

    let mut granted = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => granted += 1,
            Err(OrchestrateError::ConcurrencyExceeded { limit: 2 }) => rejected += 1,
            Err(e) => panic!("unexpected admission outcome: {e}"),
        }
    }
    assert_eq!(granted, 2);
    assert_eq!(rejected, 1);
    assert_eq!(h.gate.in_flight("alice").await, 2);
    // The rejected admission never reached the ledger.
    assert_eq!(h.ledger.charge_count(), 2);
}

#[tokio::test]
async fn vendor_rejection_fails_and_refunds_exactly_once() {
    let adapter = ScriptedAdapter::default().will_generate(Err(ProviderCallError::Provider(
        "prompt violates content policy".to_owned(),
    )));
    let h = harness(adapter);

    let task = h.orchestrator.create("alice", image_request(), None).await.unwrap();
    let done = wait_terminal(&h.store, &task.id).await;

    assert_eq!(done.status, TaskStatus::Failure);
    assert!(done.refunded);
    assert!(done
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("content policy"));
    assert_eq!(h.ledger.refund_count(), 1);

    // A sweep afterwards must not refund again.
    let reaper = Reaper::new(
        h.store.clone(),
        h.gate.clone(),
        ReaperConfig {
            stale_after: Duration::ZERO,
            interval: Duration::from_secs(300),
        },
    );
    let report = reaper.sweep().await.unwrap();
    assert_eq!(report.reaped, 0);
    assert_eq!(h.ledger.refund_count(), 1);
}

#[tokio::test]
async fn transport_failures_retry_then_fail() {
    let adapter = ScriptedAdapter::default()
        .will_generate(Err(ProviderCallError::transport("reset", None)))
        .will_generate(Err(ProviderCallError::transport("reset again", None)));
    let h = harness(adapter);

    let task = h.orchestrator.create("alice", image_request(), None).await.unwrap();
    let done = wait_terminal(&h.store, &task.id).await;
    assert_eq!(done.status, TaskStatus::Failure);
    assert!(done.refunded);
}

#[tokio::test]
async fn transport_failure_then_success_recovers() {
    let adapter = ScriptedAdapter::default()
        .will_generate(Err(ProviderCallError::transport("reset", None)))
        .will_generate(Ok(Generated::Artifacts(vec![INLINE_PNG.to_owned()])));
    let h = harness(adapter);

    let task = h.orchestrator.create("alice", image_request(), None).await.unwrap();
    let done = wait_terminal(&h.store, &task.id).await;
    assert_eq!(done.status, TaskStatus::Success);
    assert_eq!(h.ledger.refund_count(), 0);
}

#[tokio::test]
async fn cancellation_joins_at_the_poll_supervisor() {
    let adapter = ScriptedAdapter::default().will_generate(Ok(Generated::External {
        task_id: "mm-slow".to_owned(),
    }));
    let h = harness(adapter);

    let task = h.orchestrator.create("alice", video_request(), None).await.unwrap();
    wait_external_id(&h.store, &task.id).await;

    assert!(h.orchestrator.cancel(&task.id).await.unwrap());
    let done = h.store.get(&task.id).await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Failure);
    assert_eq!(done.error_message.as_deref(), Some("Cancelled by user"));
    assert!(done.refunded);

    // The supervisor notices the terminal row and stops without writing.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let after = h.store.get(&task.id).await.unwrap().unwrap();
    assert_eq!(after.status, TaskStatus::Failure);
    assert_eq!(h.ledger.refund_count(), 1);

    // Cancelling again is a no-op.
    assert!(!h.orchestrator.cancel(&task.id).await.unwrap());
    assert_eq!(h.ledger.refund_count(), 1);
}

#[tokio::test]
async fn late_vendor_success_cannot_overwrite_a_cancelled_task() {
    let entered = Arc::new(tokio::sync::Notify::new());
    let release = Arc::new(tokio::sync::Notify::new());
    let h = harness(GatedPollAdapter {
        entered: entered.clone(),
        release: release.clone(),
    });

    let task = h.orchestrator.create("alice", video_request(), None).await.unwrap();

    // Cancel while the poll is mid-flight, after the supervisor's pre-poll
    // re-read already passed.
    entered.notified().await;
    assert!(h.orchestrator.cancel(&task.id).await.unwrap());
    let cancelled = h.store.get(&task.id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, TaskStatus::Failure);
    assert!(cancelled.refunded);

    // The vendor now answers with a success; the terminal row must swallow it.
    release.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let after = h.store.get(&task.id).await.unwrap().unwrap();
    assert_eq!(after.status, TaskStatus::Failure);
    assert!(after.result_url.is_none());
    assert_eq!(after.error_message.as_deref(), Some("Cancelled by user"));
    assert!(after.refunded);
    assert_eq!(h.ledger.refund_count(), 1);
    // The slot was released by the cancellation and only by it.
    assert_eq!(h.gate.in_flight("alice").await, 0);
}

#[tokio::test]
async fn rehoming_failure_degrades_to_the_vendor_url() {
    let adapter = ScriptedAdapter::default()
        .will_generate(Ok(Generated::Artifacts(vec![INLINE_PNG.to_owned()])));
    let h = harness_with(
        StaticEntitlements::default(),
        CountingLedger::default(),
        MemoryBlobs {
            fail: true,
            ..Default::default()
        },
        adapter,
        fast_config(),
    );

    let task = h.orchestrator.create("alice", image_request(), None).await.unwrap();
    let done = wait_terminal(&h.store, &task.id).await;

    assert_eq!(done.status, TaskStatus::Success);
    assert_eq!(done.result_url.as_deref(), Some(INLINE_PNG));
    assert_eq!(done.metadata["rehomed"], serde_json::json!(false));
    assert_eq!(h.ledger.refund_count(), 0);
}

#[tokio::test]
async fn batch_images_record_every_artifact() {
    let urls: Vec<String> = (0..3).map(|_| INLINE_PNG.to_owned()).collect();
    let adapter = ScriptedAdapter::default().will_generate(Ok(Generated::Artifacts(urls)));
    let h = harness(adapter);

    let mut request = image_request();
    request.params.max_outputs = Some(3);
    let task = h.orchestrator.create("alice", request, None).await.unwrap();
    let done = wait_terminal(&h.store, &task.id).await;

    assert_eq!(done.status, TaskStatus::Success);
    assert_eq!(done.metadata["artifact_count"], serde_json::json!(3));
    let all = done.metadata["all_artifact_urls"].as_array().unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(
        done.result_url.as_deref(),
        all[0].as_str(),
        "result_url is the first artifact"
    );
}

#[tokio::test]
async fn storyboard_success_stores_script_and_artifact() {
    let script = r#"{
        "title": "Heist",
        "acts": [
            { "title": "Setup", "shots": [ { "scene": "vault", "description": "The crew studies blueprints", "dialogue": null, "camera": "overhead" } ] },
            { "title": "Job", "shots": [ { "scene": "vault", "description": "Drill bites steel", "dialogue": "Quiet.", "camera": "macro" } ] }
        ]
    }"#;
    let adapter = ScriptedAdapter::default()
        .will_answer(Ok(format!("Sure! Here it is:\n```json\n{script}\n```")));
    let h = harness(adapter);

    let task = h.orchestrator.create("alice", storyboard_request(), None).await.unwrap();
    let done = wait_terminal(&h.store, &task.id).await;

    assert_eq!(done.status, TaskStatus::Success);
    assert_eq!(done.metadata["shot_count"], serde_json::json!(2));
    assert_eq!(done.metadata["storyboard"]["acts"].as_array().unwrap().len(), 2);
    let url = done.result_url.expect("result url");
    assert!(url.starts_with(BLOB_PREFIX) && url.ends_with(".json"), "{url}");
}

#[tokio::test]
async fn storyboard_parse_failure_fails_the_task() {
    let adapter = ScriptedAdapter::default()
        .will_answer(Ok("I refuse to answer in JSON today.".to_owned()));
    let h = harness(adapter);

    let task = h.orchestrator.create("alice", storyboard_request(), None).await.unwrap();
    let done = wait_terminal(&h.store, &task.id).await;

    assert_eq!(done.status, TaskStatus::Failure);
    assert!(done.refunded);
    assert!(h.blobs.stored.lock().unwrap().is_empty(), "no artifact on parse failure");
}

#[tokio::test]
async fn free_usage_is_never_charged_or_refunded() {
    let adapter = ScriptedAdapter::default().will_generate(Err(ProviderCallError::Provider(
        "vendor said no".to_owned(),
    )));
    let h = harness_with(
        StaticEntitlements {
            free: true,
            ..Default::default()
        },
        CountingLedger::default(),
        MemoryBlobs::default(),
        adapter,
        fast_config(),
    );

    let task = h.orchestrator.create("alice", image_request(), None).await.unwrap();
    assert!(task.is_free_usage);
    assert_eq!(task.credits_charged, 0);
    assert!(task.usage_receipt_id.is_none());
    // The remaining free quota rides along on the created row.
    assert_eq!(task.free_usage_remaining, 2);

    let done = wait_terminal(&h.store, &task.id).await;
    assert_eq!(done.status, TaskStatus::Failure);
    assert!(!done.refunded);
    assert_eq!(h.ledger.charge_count(), 0);
    assert_eq!(h.ledger.refund_count(), 0);
}

#[tokio::test]
async fn saturated_queue_fails_the_overflow_task_with_a_refund() {
    let mut config = fast_config();
    config.workers = 0;
    config.queue_capacity = 1;
    let h = harness_with(
        StaticEntitlements::default(),
        CountingLedger::default(),
        MemoryBlobs::default(),
        ScriptedAdapter::default(),
        config,
    );

    h.orchestrator.create("alice", image_request(), None).await.unwrap();
    let err = h
        .orchestrator
        .create("alice", image_request(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrateError::QueueFull { capacity: 1 }));

    let tasks = h.store.list_recent("alice", 10).await.unwrap();
    assert_eq!(tasks.len(), 2);
    let failed: Vec<_> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Failure)
        .collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].refunded);
    assert_eq!(h.ledger.charge_count(), 2);
    assert_eq!(h.ledger.refund_count(), 1);
}

#[tokio::test]
async fn admission_replay_does_not_double_charge() {
    let h = harness(ScriptedAdapter::default());
    let request = AdmitRequest {
        user_id: "alice".to_owned(),
        kind: TaskKind::Image,
        provider: ProviderId::Minimax,
        charge: ChargeRequest {
            operation: "image_generation".to_owned(),
            provider: ProviderId::Minimax,
            resolution: None,
            duration: None,
            quantity: 1,
        },
        idempotency_key: Some("retry-abc".to_owned()),
    };

    let first = h.gate.admit(&request).await.unwrap();
    let second = h.gate.admit(&request).await.unwrap();
    assert_eq!(h.ledger.charge_count(), 1);
    assert_eq!(first.usage_receipt_id, second.usage_receipt_id);
}

#[tokio::test]
async fn replayed_creation_returns_the_original_task() {
    let adapter = ScriptedAdapter::default()
        .will_generate(Ok(Generated::Artifacts(vec![INLINE_PNG.to_owned()])));
    let h = harness(adapter);
    let key = Some("retry-key-1".to_owned());

    let first = h
        .orchestrator
        .create("alice", image_request(), key.clone())
        .await
        .unwrap();
    let second = h
        .orchestrator
        .create("alice", image_request(), key.clone())
        .await
        .unwrap();

    // One row, one charge, one reservation; the replay is a read.
    assert_eq!(first.id, second.id);
    assert_eq!(h.ledger.charge_count(), 1);
    assert_eq!(h.store.list_recent("alice", 10).await.unwrap().len(), 1);

    // After the task finishes, the same key still resolves to it.
    let done = wait_terminal(&h.store, &first.id).await;
    assert_eq!(done.status, TaskStatus::Success);
    let third = h.orchestrator.create("alice", image_request(), key).await.unwrap();
    assert_eq!(third.id, first.id);
    assert_eq!(third.status, TaskStatus::Success);
    assert_eq!(h.ledger.charge_count(), 1);
}

#[tokio::test]
async fn expired_idempotency_entries_are_evicted() {
    let ledger = Arc::new(CountingLedger::default());
    let gate = Gate::new(
        Arc::new(StaticEntitlements::default()),
        ledger.clone() as Arc<dyn CreditLedger>,
    )
    .with_replay_ttl(Duration::from_millis(5));
    let request = AdmitRequest {
        user_id: "alice".to_owned(),
        kind: TaskKind::Image,
        provider: ProviderId::Minimax,
        charge: ChargeRequest {
            operation: "image_generation".to_owned(),
            provider: ProviderId::Minimax,
            resolution: None,
            duration: None,
            quantity: 1,
        },
        idempotency_key: Some("retry-old".to_owned()),
    };

    gate.admit(&request).await.unwrap();
    assert_eq!(ledger.charges.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(10)).await;

    // The window has passed: the key no longer replays and the retry is a
    // fresh admission.
    assert!(gate.replayed_task("retry-old").await.is_none());
    gate.admit(&request).await.unwrap();
    assert_eq!(ledger.charges.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn reaper_times_out_stale_tasks_idempotently() {
    let mut config = fast_config();
    config.workers = 0; // nothing drains the queue, tasks stay PROCESSING
    let h = harness_with(
        StaticEntitlements::default(),
        CountingLedger::default(),
        MemoryBlobs::default(),
        ScriptedAdapter::default(),
        config,
    );

    let task = h.orchestrator.create("alice", video_request(), None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let reaper = Reaper::new(
        h.store.clone(),
        h.gate.clone(),
        ReaperConfig {
            stale_after: Duration::ZERO,
            interval: Duration::from_secs(300),
        },
    );
    assert_eq!(reaper.preview().await.unwrap().len(), 1);

    let report = reaper.sweep().await.unwrap();
    assert_eq!(report.reaped, 1);
    assert_eq!(report.refunded, 1);

    let done = h.store.get(&task.id).await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Failure);
    assert!(done.refunded);
    assert!(done
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("timed out"));
    assert_eq!(h.gate.in_flight("alice").await, 0);

    let again = reaper.sweep().await.unwrap();
    assert_eq!(again.reaped, 0);
    assert_eq!(again.refunded, 0);
    assert_eq!(h.ledger.refund_count(), 1);
}

#[tokio::test]
async fn refund_outage_is_settled_by_a_later_sweep() {
    let mut config = fast_config();
    config.workers = 0;
    let ledger = CountingLedger::default();
    ledger.fail_refund.store(true, Ordering::SeqCst);
    let h = harness_with(
        StaticEntitlements::default(),
        ledger,
        MemoryBlobs::default(),
        ScriptedAdapter::default(),
        config,
    );

    let task = h.orchestrator.create("alice", video_request(), None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let reaper = Reaper::new(
        h.store.clone(),
        h.gate.clone(),
        ReaperConfig {
            stale_after: Duration::ZERO,
            interval: Duration::from_secs(300),
        },
    );
    let report = reaper.sweep().await.unwrap();
    assert_eq!(report.reaped, 1);
    assert_eq!(report.refunded, 0);

    // The flag stays clear and the task stays failed.
    let failed = h.store.get(&task.id).await.unwrap().unwrap();
    assert_eq!(failed.status, TaskStatus::Failure);
    assert!(!failed.refunded);

    h.ledger.fail_refund.store(false, Ordering::SeqCst);
    let retry = reaper.sweep().await.unwrap();
    assert_eq!(retry.reaped, 0);
    assert_eq!(retry.refunded, 1);
    let settled = h.store.get(&task.id).await.unwrap().unwrap();
    assert!(settled.refunded);
    assert_eq!(h.ledger.refund_count(), 1);
}

#[tokio::test]
async fn store_progress_is_monotone_and_external_id_write_once() {
    let store = MemoryStore::new();
    let h = harness(ScriptedAdapter::default());
    let admission = h
        .gate
        .admit(&AdmitRequest {
            user_id: "bob".to_owned(),
            kind: TaskKind::Video,
            provider: ProviderId::Minimax,
            charge: ChargeRequest {
                operation: "video_generation".to_owned(),
                provider: ProviderId::Minimax,
                resolution: None,
                duration: None,
                quantity: 1,
            },
            idempotency_key: None,
        })
        .await
        .unwrap();
    let task = Task::new("bob", video_request(), &admission, None);
    store.insert(&task).await.unwrap();

    store.set_progress(&task.id, 50).await.unwrap();
    store.set_progress(&task.id, 20).await.unwrap();
    assert_eq!(store.get(&task.id).await.unwrap().unwrap().progress, 50);

    store.set_external_task_id(&task.id, "first").await.unwrap();
    store.set_external_task_id(&task.id, "second").await.unwrap();
    assert_eq!(
        store
            .get(&task.id)
            .await
            .unwrap()
            .unwrap()
            .external_task_id
            .as_deref(),
        Some("first")
    );

    store
        .merge_metadata(&task.id, serde_json::json!({ "a": 1 }))
        .await
        .unwrap();
    store
        .merge_metadata(&task.id, serde_json::json!({ "b": 2 }))
        .await
        .unwrap();
    let merged = store.get(&task.id).await.unwrap().unwrap().metadata;
    assert_eq!(merged["a"], serde_json::json!(1));
    assert_eq!(merged["b"], serde_json::json!(2));
}
