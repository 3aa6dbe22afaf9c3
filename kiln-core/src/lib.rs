//! Generation task orchestration engine.
//!
//! The engine turns a caller's generation request into a tracked
//! asynchronous task: admission (permission, concurrency, billing), vendor
//! dispatch through pluggable provider adapters, poll supervision for
//! deferred vendors, artifact rehoming into durable storage, and a reaper
//! that times out tasks that stopped moving. All external collaborators
//! (task store, credit ledger, entitlements, blob store) are trait seams
//! injected at construction.

pub mod error;
pub mod gate;
pub mod orchestrator;
pub mod poll;
pub mod provider;
pub mod providers;
pub mod reaper;
pub mod rehome;
pub mod store;
pub mod storyboard;
pub mod task;

#[cfg(test)]
mod tests;

pub use error::{OrchestrateError, StoreError};
pub use gate::{
    refund_once, AdmitRequest, Admission, ChargeRequest, CreditLedger, EntitlementError,
    EntitlementService, Gate, LedgerError, PermissionGrant, Receipt,
};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use poll::{PollConfig, PollSupervisor, Supervised};
pub use provider::{
    Generated, GenerationRequest, PollStatus, ProviderAdapter, ProviderCallError, ProviderId,
    ProviderRegistry, TextRequest,
};
pub use reaper::{ReapReport, Reaper, ReaperConfig};
pub use rehome::{BlobError, BlobStore, Rehomer};
pub use store::{MemoryStore, TaskStore};
pub use storyboard::{Act, Shot, Storyboard};
pub use task::{NewTask, ProviderParams, Task, TaskKind, TaskStatus};
