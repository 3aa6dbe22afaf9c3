//! Artifact rehoming: copy vendor-hosted artifacts into durable storage
//! before their short-lived URLs expire.
//!
//! Downloads stream straight from the vendor response into the blob store;
//! artifact payloads are never buffered whole in memory. Rehoming failure is
//! reported to the caller, who degrades to the vendor URL rather than
//! failing the task.

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::OrchestrateError;

#[derive(Debug, Clone, Error)]
#[error("blob store error: {0}")]
pub struct BlobError(pub String);

/// Durable artifact storage. External collaborator (object store, CDN-backed
/// bucket, or local disk in embedded deployments).
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Store a byte stream under a fresh key with the given extension
    /// (including the dot). Returns the durable public URL.
    async fn put_stream(
        &self,
        ext: &str,
        stream: BoxStream<'static, Result<Bytes, BlobError>>,
    ) -> Result<String, BlobError>;

    /// Convenience for payloads already in memory (decoded `data:` URLs,
    /// storyboard JSON).
    async fn put_bytes(&self, ext: &str, data: Bytes) -> Result<String, BlobError> {
        self.put_stream(ext, stream::once(async move { Ok(data) }).boxed())
            .await
    }

    /// Whether `url` already points into this store. Such URLs pass through
    /// rehoming untouched.
    fn owns_url(&self, url: &str) -> bool;
}

pub struct Rehomer {
    http: reqwest::Client,
    blobs: Arc<dyn BlobStore>,
}

impl Rehomer {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Result<Self, OrchestrateError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| OrchestrateError::Rehost(e.to_string()))?;
        Ok(Self { http, blobs })
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// Copy one artifact into durable storage and return its new URL.
    ///
    /// `default_ext` is used when neither the response headers nor the URL
    /// path reveal a file type.
    pub async fn rehome(&self, url: &str, default_ext: &str) -> Result<String, OrchestrateError> {
        if self.blobs.owns_url(url) {
            debug!(url, "artifact already durable, passing through");
            return Ok(url.to_owned());
        }
        if let Some(rest) = url.strip_prefix("data:") {
            return self.rehome_inline(rest, default_ext).await;
        }

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| OrchestrateError::Rehost(e.to_string()))?;
        if !response.status().is_success() {
            return Err(OrchestrateError::Rehost(format!(
                "download returned HTTP {}",
                response.status()
            )));
        }

        let ext = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(ext_for_mime)
            .or_else(|| ext_from_path(url))
            .unwrap_or(default_ext)
            .to_owned();

        let stream = response
            .bytes_stream()
            .map_err(|e| BlobError(e.to_string()))
            .boxed();
        let durable = self
            .blobs
            .put_stream(&ext, stream)
            .await
            .map_err(|e| OrchestrateError::Rehost(e.0))?;
        info!(source = url, durable = %durable, "artifact rehomed");
        Ok(durable)
    }

    /// Decode a `data:<mime>;base64,<payload>` URL into the blob store.
    async fn rehome_inline(
        &self,
        rest: &str,
        default_ext: &str,
    ) -> Result<String, OrchestrateError> {
        let (header, payload) = rest
            .split_once(',')
            .ok_or_else(|| OrchestrateError::Rehost("malformed data URL".to_owned()))?;
        if !header.ends_with(";base64") {
            return Err(OrchestrateError::Rehost(
                "data URL is not base64-encoded".to_owned(),
            ));
        }
        let mime = header.trim_end_matches(";base64");
        let ext = ext_for_mime(mime).unwrap_or(default_ext);

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|e| OrchestrateError::Rehost(format!("base64 decode failed: {e}")))?;
        let durable = self
            .blobs
            .put_bytes(ext, Bytes::from(bytes))
            .await
            .map_err(|e| OrchestrateError::Rehost(e.0))?;
        info!(durable = %durable, "inline artifact rehomed");
        Ok(durable)
    }
}

fn ext_for_mime(mime: &str) -> Option<&'static str> {
    // Strip any charset parameter before matching.
    let mime = mime.split(';').next().unwrap_or(mime).trim();
    match mime {
        "video/mp4" => Some(".mp4"),
        "video/webm" => Some(".webm"),
        "image/png" => Some(".png"),
        "image/jpeg" => Some(".jpg"),
        "image/webp" => Some(".webp"),
        "image/gif" => Some(".gif"),
        "application/json" => Some(".json"),
        _ => None,
    }
}

/// Last-path-segment extension, query string ignored.
fn ext_from_path(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next()?;
    let name = path.rsplit('/').next()?;
    let dot = name.rfind('.')?;
    let ext = &name[dot..];
    (ext.len() > 1 && ext.len() <= 6).then_some(ext)
}
