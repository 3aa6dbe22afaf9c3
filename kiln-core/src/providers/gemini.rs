//! Gemini adapter.
//!
//! Calls a relay deployment that fronts the Gemini API. Synchronous for both
//! images and text; image responses may come back as `data:` URLs with the
//! bytes inline, which the rehoming step decodes into durable storage.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::{classify_status, transport_err};
use crate::provider::{
    Generated, GenerationRequest, ProviderAdapter, ProviderCallError, ProviderId, TextRequest,
};
use crate::task::TaskKind;

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    /// Base URL of the relay deployment.
    pub base_url: String,
    /// Shared secret for the relay; sent as a bearer token when set.
    pub secret: Option<String>,
}

pub struct Gemini {
    http: reqwest::Client,
    config: GeminiConfig,
}

#[derive(Debug, Deserialize)]
struct RelayImageResponse {
    #[serde(default)]
    success: bool,
    #[serde(rename = "imageUrl")]
    image_url: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RelayTextResponse {
    #[serde(default)]
    success: bool,
    text: Option<String>,
    error: Option<String>,
}

impl Gemini {
    pub fn new(config: GeminiConfig) -> Result<Self, ProviderCallError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(transport_err)?;
        Ok(Self { http, config })
    }

    async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, ProviderCallError> {
        let mut builder = self
            .http
            .post(format!("{}{path}", self.config.base_url))
            .json(&body);
        if let Some(secret) = &self.config.secret {
            builder = builder.bearer_auth(secret);
        }
        let response = builder.send().await.map_err(transport_err)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }
        Ok(response)
    }
}

#[async_trait]
impl ProviderAdapter for Gemini {
    fn id(&self) -> ProviderId {
        ProviderId::Gemini
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generated, ProviderCallError> {
        if request.kind != TaskKind::Image {
            return Err(ProviderCallError::Unsupported(
                "gemini adapter only generates images".to_owned(),
            ));
        }

        let parsed: RelayImageResponse = self
            .post_json(
                "/api/gemini/image",
                json!({
                    "prompt": request.prompt,
                    "aspectRatio": request.ratio.as_deref().unwrap_or("1:1"),
                    "referenceImages": request.reference_urls,
                }),
            )
            .await?
            .json()
            .await
            .map_err(transport_err)?;

        if !parsed.success {
            return Err(ProviderCallError::Provider(
                parsed
                    .error
                    .unwrap_or_else(|| "gemini relay reported failure".to_owned()),
            ));
        }
        match parsed.image_url {
            Some(url) if !url.is_empty() => Ok(Generated::Artifacts(vec![url])),
            _ => Err(ProviderCallError::Provider(
                "gemini relay returned no image".to_owned(),
            )),
        }
    }

    async fn generate_text(&self, request: &TextRequest) -> Result<String, ProviderCallError> {
        let parsed: RelayTextResponse = self
            .post_json(
                "/api/gemini/text",
                json!({
                    "prompt": request.prompt,
                    "systemPrompt": request.system_prompt,
                    "temperature": request.temperature,
                    "maxTokens": request.max_tokens,
                }),
            )
            .await?
            .json()
            .await
            .map_err(transport_err)?;

        if !parsed.success {
            return Err(ProviderCallError::Provider(
                parsed
                    .error
                    .unwrap_or_else(|| "gemini relay reported failure".to_owned()),
            ));
        }
        parsed
            .text
            .filter(|text| !text.is_empty())
            .ok_or_else(|| ProviderCallError::Provider("gemini relay returned no text".to_owned()))
    }
}
