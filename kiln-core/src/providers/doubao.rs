//! Doubao (Volcengine Ark) adapter.
//!
//! Three capabilities: synchronous image generation (single or sequential
//! batch), deferred video generation through the content-generation-tasks
//! API, and chat-completions text generation for storyboards.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::{classify_status, transport_err};
use crate::provider::{
    Generated, GenerationRequest, PollStatus, ProviderAdapter, ProviderCallError, ProviderId,
    TextRequest,
};
use crate::task::TaskKind;

const DEFAULT_BASE_URL: &str = "https://ark.cn-beijing.volces.com/api/v3";
const DEFAULT_IMAGE_MODEL: &str = "doubao-seedream-4-0-250828";
const DEFAULT_VIDEO_MODEL: &str = "doubao-seedance-1-0-pro-250528";
const DEFAULT_CHAT_MODEL: &str = "doubao-seed-1-6-250615";

/// Batch image generation is capped by the vendor.
const MAX_BATCH_IMAGES: u32 = 15;
/// Image-to-image accepts at most this many reference images.
const MAX_REFERENCE_IMAGES: usize = 10;

#[derive(Debug, Clone)]
pub struct DoubaoConfig {
    pub api_key: String,
    pub base_url: String,
    pub image_model: String,
    pub video_model: String,
    pub chat_model: String,
}

impl DoubaoConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_owned(),
            image_model: DEFAULT_IMAGE_MODEL.to_owned(),
            video_model: DEFAULT_VIDEO_MODEL.to_owned(),
            chat_model: DEFAULT_CHAT_MODEL.to_owned(),
        }
    }
}

pub struct Doubao {
    http: reqwest::Client,
    config: DoubaoConfig,
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageDatum>,
}

#[derive(Debug, Deserialize)]
struct ImageDatum {
    url: Option<String>,
    b64_json: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateVideoTaskResponse {
    #[serde(default)]
    id: String,
}

#[derive(Debug, Deserialize)]
struct VideoTaskResponse {
    #[serde(default)]
    status: String,
    content: Option<VideoTaskContent>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct VideoTaskContent {
    video_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// The image endpoint takes explicit pixel sizes rather than ratios.
fn image_size_for_ratio(ratio: &str) -> &'static str {
    match ratio {
        "1:1" => "4096x4096",
        "16:9" => "3840x2160",
        "9:16" => "2160x3840",
        "4:3" => "4096x3072",
        "3:4" => "3072x4096",
        "21:9" => "3440x1440",
        "3:2" => "4096x2731",
        "2:3" => "2731x4096",
        _ => "4096x4096",
    }
}

impl Doubao {
    pub fn new(config: DoubaoConfig) -> Result<Self, ProviderCallError> {
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
        let response = self
            .http
            .post(format!("{}{path}", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_err)?;
        Self::ensure_success(response).await
    }

    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ProviderCallError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }
        Ok(response)
    }

    async fn generate_images(
        &self,
        request: &GenerationRequest,
    ) -> Result<Generated, ProviderCallError> {
        let model = request
            .params
            .extra
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.config.image_model);
        let ratio = request.ratio.as_deref().unwrap_or("1:1");
        let max_outputs = request.params.max_outputs.unwrap_or(1);

        let mut body = json!({
            "model": model,
            "prompt": request.prompt,
            "size": image_size_for_ratio(ratio),
            "n": 1,
            "response_format": "url",
            "watermark": false,
        });
        if max_outputs > 1 {
            body["sequential_image_generation"] = json!("auto");
            body["sequential_image_generation_options"] = json!({
                "max_images": max_outputs.clamp(2, MAX_BATCH_IMAGES),
            });
            body["stream"] = json!(false);
        }
        if !request.reference_urls.is_empty() {
            let refs: Vec<&str> = request
                .reference_urls
                .iter()
                .take(MAX_REFERENCE_IMAGES)
                .map(String::as_str)
                .collect();
            body["image"] = json!(refs);
        }

        let parsed: ImagesResponse = self
            .post_json("/images/generations", body)
            .await?
            .json()
            .await
            .map_err(transport_err)?;

        let urls: Vec<String> = parsed
            .data
            .into_iter()
            .filter_map(|d| match (d.url, d.b64_json) {
                (Some(url), _) if !url.is_empty() => Some(url),
                (_, Some(b64)) => Some(format!("data:image/png;base64,{b64}")),
                _ => None,
            })
            .collect();
        if urls.is_empty() {
            return Err(ProviderCallError::Provider(
                "doubao returned no image data".to_owned(),
            ));
        }
        debug!(count = urls.len(), "doubao image generation complete");
        Ok(Generated::Artifacts(urls))
    }

    async fn generate_video(
        &self,
        request: &GenerationRequest,
    ) -> Result<Generated, ProviderCallError> {
        let model = request
            .params
            .extra
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.config.video_model);
        let generation_type = request.params.generation_type.as_deref().unwrap_or("t2v");
        let duration = request.params.duration.unwrap_or(5);
        let resolution = request
            .params
            .resolution
            .as_deref()
            .unwrap_or("1080P")
            .to_lowercase();

        // Frame-anchored modes inherit the source image's aspect ratio.
        let ratio = match generation_type {
            "t2v" | "ref2v" => request.ratio.as_deref().unwrap_or("16:9"),
            _ => "adaptive",
        };
        let prompt = format!(
            "{} --ratio {ratio} --duration {duration} --resolution {resolution} --watermark false",
            request.prompt.trim()
        );

        let mut content = vec![json!({ "type": "text", "text": prompt })];
        match generation_type {
            "ref2v" => {
                for url in &request.reference_urls {
                    content.push(json!({
                        "type": "image_url",
                        "image_url": { "url": url },
                        "role": "reference_image",
                    }));
                }
            }
            "fl2v" if request.reference_urls.len() >= 2 => {
                content.push(json!({
                    "type": "image_url",
                    "image_url": { "url": request.reference_urls[0] },
                    "role": "first_frame",
                }));
                content.push(json!({
                    "type": "image_url",
                    "image_url": { "url": request.reference_urls[1] },
                    "role": "last_frame",
                }));
            }
            _ => {
                // i2v and default: one first-frame image, no explicit role.
                if let Some(first) = request.reference_urls.first() {
                    content.push(json!({
                        "type": "image_url",
                        "image_url": { "url": first },
                    }));
                }
            }
        }

        let parsed: CreateVideoTaskResponse = self
            .post_json(
                "/contents/generations/tasks",
                json!({ "model": model, "content": content }),
            )
            .await?
            .json()
            .await
            .map_err(transport_err)?;

        if parsed.id.is_empty() {
            return Err(ProviderCallError::Provider(
                "doubao returned no task id".to_owned(),
            ));
        }
        debug!(task_id = %parsed.id, "doubao video task accepted");
        Ok(Generated::External { task_id: parsed.id })
    }
}

#[async_trait]
impl ProviderAdapter for Doubao {
    fn id(&self) -> ProviderId {
        ProviderId::Doubao
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generated, ProviderCallError> {
        match request.kind {
            TaskKind::Image => self.generate_images(request).await,
            TaskKind::Video => self.generate_video(request).await,
            TaskKind::Storyboard => Err(ProviderCallError::Unsupported(
                "storyboard tasks use generate_text".to_owned(),
            )),
        }
    }

    async fn poll(&self, external_task_id: &str) -> Result<PollStatus, ProviderCallError> {
        let response = self
            .http
            .get(format!(
                "{}/contents/generations/tasks/{external_task_id}",
                self.config.base_url
            ))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(transport_err)?;
        let parsed: VideoTaskResponse = Self::ensure_success(response)
            .await?
            .json()
            .await
            .map_err(transport_err)?;

        match parsed.status.as_str() {
            "succeeded" => match parsed.content.and_then(|c| c.video_url) {
                Some(artifact_url) if !artifact_url.is_empty() => {
                    Ok(PollStatus::Succeeded { artifact_url })
                }
                _ => Err(ProviderCallError::Provider(
                    "doubao task succeeded without a video URL".to_owned(),
                )),
            },
            "failed" => Ok(PollStatus::Failed {
                reason: parsed
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "doubao reported generation failure".to_owned()),
            }),
            "cancelled" => Ok(PollStatus::Failed {
                reason: "doubao task was cancelled upstream".to_owned(),
            }),
            // queued / running
            _ => Ok(PollStatus::Running),
        }
    }

    async fn generate_text(&self, request: &TextRequest) -> Result<String, ProviderCallError> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({
            "role": "user",
            "content": [{ "type": "text", "text": request.prompt }],
        }));

        let parsed: ChatResponse = self
            .post_json(
                "/chat/completions",
                json!({
                    "model": self.config.chat_model,
                    "messages": messages,
                    "temperature": request.temperature.unwrap_or(0.7),
                    "max_tokens": request.max_tokens.unwrap_or(4000),
                }),
            )
            .await?
            .json()
            .await
            .map_err(transport_err)?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|text| !text.is_empty())
            .ok_or_else(|| {
                ProviderCallError::Provider("doubao returned no text content".to_owned())
            })
    }
}
