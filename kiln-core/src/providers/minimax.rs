//! MiniMax video adapter.
//!
//! Deferred vendor: dispatch returns a vendor task id, the poll supervisor
//! drives it to a terminal state, and a successful poll resolves the vendor
//! `file_id` into a downloadable URL through the files endpoint.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::{classify_status, transport_err};
use crate::provider::{
    Generated, GenerationRequest, PollStatus, ProviderAdapter, ProviderCallError, ProviderId,
};
use crate::task::TaskKind;

const DEFAULT_BASE_URL: &str = "https://api.minimaxi.com/v1";
const DEFAULT_VIDEO_MODEL: &str = "MiniMax-Hailuo-02";

#[derive(Debug, Clone)]
pub struct MinimaxConfig {
    pub api_key: String,
    pub base_url: String,
    pub video_model: String,
}

impl MinimaxConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_owned(),
            video_model: DEFAULT_VIDEO_MODEL.to_owned(),
        }
    }
}

pub struct Minimax {
    http: reqwest::Client,
    config: MinimaxConfig,
}

#[derive(Debug, Deserialize)]
struct BaseResp {
    status_code: i64,
    #[serde(default)]
    status_msg: String,
}

#[derive(Debug, Deserialize)]
struct CreateTaskResponse {
    #[serde(default)]
    task_id: String,
    base_resp: Option<BaseResp>,
}

#[derive(Debug, Deserialize)]
struct QueryTaskResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    file_id: String,
    base_resp: Option<BaseResp>,
}

#[derive(Debug, Deserialize)]
struct RetrieveFileResponse {
    file: Option<RetrievedFile>,
    base_resp: Option<BaseResp>,
}

#[derive(Debug, Deserialize)]
struct RetrievedFile {
    #[serde(default)]
    download_url: String,
}

impl Minimax {
    pub fn new(config: MinimaxConfig) -> Result<Self, ProviderCallError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(transport_err)?;
        Ok(Self { http, config })
    }

    fn check_base_resp(base: &Option<BaseResp>) -> Result<(), ProviderCallError> {
        if let Some(base) = base {
            if base.status_code != 0 {
                return Err(ProviderCallError::Provider(format!(
                    "minimax error {}: {}",
                    base.status_code, base.status_msg
                )));
            }
        }
        Ok(())
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

    async fn get(&self, path_and_query: &str) -> Result<reqwest::Response, ProviderCallError> {
        let response = self
            .http
            .get(format!("{}{path_and_query}", self.config.base_url))
            .bearer_auth(&self.config.api_key)
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

    /// Resolve a completed task's `file_id` into a download URL.
    async fn retrieve_file_url(&self, file_id: &str) -> Result<String, ProviderCallError> {
        let parsed: RetrieveFileResponse = self
            .get(&format!("/files/retrieve?file_id={file_id}"))
            .await?
            .json()
            .await
            .map_err(transport_err)?;
        Self::check_base_resp(&parsed.base_resp)?;
        match parsed.file {
            Some(file) if !file.download_url.is_empty() => Ok(file.download_url),
            _ => Err(ProviderCallError::Provider(format!(
                "minimax file {file_id} has no download URL"
            ))),
        }
    }
}

#[async_trait]
impl ProviderAdapter for Minimax {
    fn id(&self) -> ProviderId {
        ProviderId::Minimax
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generated, ProviderCallError> {
        if request.kind != TaskKind::Video {
            return Err(ProviderCallError::Unsupported(
                "minimax adapter only generates video".to_owned(),
            ));
        }

        let model = request
            .params
            .extra
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.config.video_model);

        let mut body = json!({
            "model": model,
            "prompt": request.prompt,
        });
        if let Some(duration) = request.params.duration {
            body["duration"] = json!(duration);
        }
        if let Some(resolution) = &request.params.resolution {
            body["resolution"] = json!(resolution);
        }
        // Image-to-video: the first reference image becomes the first frame.
        if let Some(first) = request.reference_urls.first() {
            body["first_frame_image"] = json!(first);
        }

        let parsed: CreateTaskResponse = self
            .post_json("/video_generation", body)
            .await?
            .json()
            .await
            .map_err(transport_err)?;
        Self::check_base_resp(&parsed.base_resp)?;

        if parsed.task_id.is_empty() {
            return Err(ProviderCallError::Provider(
                "minimax returned no task id".to_owned(),
            ));
        }
        debug!(task_id = %parsed.task_id, "minimax video task accepted");
        Ok(Generated::External {
            task_id: parsed.task_id,
        })
    }

    async fn poll(&self, external_task_id: &str) -> Result<PollStatus, ProviderCallError> {
        let parsed: QueryTaskResponse = self
            .get(&format!("/query/video_generation?task_id={external_task_id}"))
            .await?
            .json()
            .await
            .map_err(transport_err)?;
        Self::check_base_resp(&parsed.base_resp)?;

        match parsed.status.as_str() {
            "Success" => {
                if parsed.file_id.is_empty() {
                    return Err(ProviderCallError::Provider(
                        "minimax task succeeded without a file id".to_owned(),
                    ));
                }
                let artifact_url = self.retrieve_file_url(&parsed.file_id).await?;
                Ok(PollStatus::Succeeded { artifact_url })
            }
            "Fail" => Ok(PollStatus::Failed {
                reason: "minimax reported generation failure".to_owned(),
            }),
            // Queueing / Preparing / Processing
            _ => Ok(PollStatus::Running),
        }
    }
}
