//! Provider abstraction: the seam between the orchestrator and the vendor
//! HTTP adapters.
//!
//! Adapters come in two shapes and [`Generated`] captures both: sync vendors
//! return artifact URLs directly, deferred vendors return an external task
//! handle that the poll supervisor then drives to completion.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use strum::{Display, EnumString};
use thiserror::Error;

use crate::task::{ProviderParams, TaskKind};

/// Known generation vendors.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProviderId {
    Minimax,
    Doubao,
    Gemini,
}

/// What a dispatch call produced.
#[derive(Debug, Clone)]
pub enum Generated {
    /// The vendor completed synchronously; one URL per artifact, vendor-hosted
    /// or `data:` inline.
    Artifacts(Vec<String>),
    /// The vendor accepted the job and handed back a task handle to poll.
    External { task_id: String },
}

/// One poll observation of a deferred vendor task.
#[derive(Debug, Clone)]
pub enum PollStatus {
    Running,
    Succeeded { artifact_url: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, Error)]
pub enum ProviderCallError {
    /// The vendor understood the request and said no (content policy, quota,
    /// bad parameters). Not retryable.
    #[error("provider rejected request: {0}")]
    Provider(String),

    /// Network failure, timeout, or vendor-side 5xx. Retryable.
    #[error("transport failure: {message}")]
    Transport {
        message: String,
        status: Option<u16>,
    },

    /// The adapter does not implement the requested capability.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl ProviderCallError {
    pub fn transport(message: impl Into<String>, status: Option<u16>) -> Self {
        ProviderCallError::Transport {
            message: message.into(),
            status,
        }
    }

    /// Credential rejection from the vendor; continuing to poll is pointless.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            ProviderCallError::Transport {
                status: Some(401 | 403),
                ..
            }
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderCallError::Transport { .. }) && !self.is_auth()
    }
}

/// Inputs for an image or video dispatch.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub kind: TaskKind,
    pub prompt: String,
    pub ratio: Option<String>,
    pub reference_urls: Vec<String>,
    pub params: ProviderParams,
}

/// Inputs for a text/chat call (storyboard generation).
#[derive(Debug, Clone)]
pub struct TextRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// One vendor adapter. Implementations own their HTTP client and
/// credentials; the orchestrator never sees vendor wire formats.
#[async_trait]
pub trait ProviderAdapter: Send + Sync + 'static {
    fn id(&self) -> ProviderId;

    /// Dispatch an image or video generation.
    async fn generate(&self, request: &GenerationRequest) -> Result<Generated, ProviderCallError>;

    /// Poll a deferred task by its vendor handle. Adapters whose `generate`
    /// never returns [`Generated::External`] may leave the default.
    async fn poll(&self, external_task_id: &str) -> Result<PollStatus, ProviderCallError> {
        let _ = external_task_id;
        Err(ProviderCallError::Unsupported(
            format!("{} does not expose a polling endpoint", self.id()),
        ))
    }

    /// Text generation, used by storyboard tasks.
    async fn generate_text(&self, request: &TextRequest) -> Result<String, ProviderCallError> {
        let _ = request;
        Err(ProviderCallError::Unsupported(
            format!("{} does not support text generation", self.id()),
        ))
    }
}

/// Lookup table from [`ProviderId`] to adapter instance.
#[derive(Default)]
pub struct ProviderRegistry {
    adapters: HashMap<ProviderId, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(adapter.id(), adapter);
        self
    }

    pub fn get(&self, id: ProviderId) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&id).cloned()
    }

    pub fn ids(&self) -> Vec<ProviderId> {
        self.adapters.keys().copied().collect()
    }
}
