/// ModelScope inference API backend
///
/// Jobs go to `v1/images/generations` in async mode and are polled through
/// `v1/tasks/{id}`. Both calls authenticate with a bearer token.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::{BackendType, Submission, TaskBackend};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::http::{join_url, HttpClient};
use crate::settings::Settings;
use crate::status::{StatusReport, TaskPhase, TaskStatus};
use crate::task::{TaskRequest, TaskResult};

pub struct ImagesApiBackend {
    http: HttpClient,
    base_url: String,
    token: Option<String>,
    default_model: String,
}

impl ImagesApiBackend {
    pub fn new(http: HttpClient, base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            token,
            default_model: ClientConfig::default().default_edit_model,
        }
    }

    pub fn from_config(config: &ClientConfig, settings: &Settings, http: HttpClient) -> Self {
        Self {
            http,
            base_url: config.endpoints.inference_base_url.clone(),
            token: settings.token().map(str::to_string),
            default_model: config.default_edit_model.clone(),
        }
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    fn bearer(&self) -> Result<String> {
        self.token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| format!("Bearer {t}"))
            .ok_or_else(|| ClientError::Auth("ModelScope API token is not configured".to_string()))
    }

    fn build_request<'a>(&'a self, request: &'a TaskRequest) -> GenerationRequest<'a> {
        let mut body = GenerationRequest {
            model: request.model.as_deref().unwrap_or(&self.default_model),
            prompt: &request.prompt,
            size: request.size.map(|s| s.to_string()),
            image_url: &request.image_urls,
            negative_prompt: None,
            seed: None,
            steps: None,
            guidance: None,
            loras: None,
        };

        if !request.quick {
            body.negative_prompt = request.negative_prompt.as_deref().filter(|n| !n.is_empty());
            body.seed = request.seed;
            body.steps = request.steps;
            body.guidance = request.guidance;
            if !request.loras.is_empty() {
                body.loras = Some(request.loras.iter().map(|l| (l.key(), l.scale)).collect());
            }
        }
        body
    }
}

#[async_trait]
impl TaskBackend for ImagesApiBackend {
    fn name(&self) -> &str {
        "ModelScope Images API"
    }

    fn backend_type(&self) -> BackendType {
        BackendType::ImagesApi
    }

    fn has_credential(&self) -> bool {
        self.bearer().is_ok()
    }

    async fn submit(&self, request: &TaskRequest) -> Result<Submission> {
        let auth = self.bearer()?;
        let body = self.build_request(request);
        let url = join_url(&self.base_url, "v1/images/generations");

        let value = self
            .http
            .post_json(
                &url,
                &[
                    ("Authorization", auth.as_str()),
                    ("X-ModelScope-Async-Mode", "true"),
                ],
                &body,
            )
            .await?;

        let response: SubmitResponse = serde_json::from_value(value)
            .map_err(|e| ClientError::InvalidResponse(format!("submit response: {e}")))?;
        let task_id = response
            .task_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ClientError::InvalidResponse("submit response has no task_id".to_string()))?;

        info!("Submitted {} task {}", body.model, task_id);
        Ok(Submission::pending(task_id))
    }

    async fn fetch_status(&self, task_id: &str) -> Result<StatusReport> {
        let auth = self.bearer()?;
        let url = join_url(&self.base_url, &format!("v1/tasks/{task_id}"));

        let value = self
            .http
            .get_json(
                &url,
                &[
                    ("Authorization", auth.as_str()),
                    ("X-ModelScope-Task-Type", "image_generation"),
                ],
            )
            .await?;

        let response: TaskResponse = serde_json::from_value(value)
            .map_err(|e| ClientError::InvalidResponse(format!("task response: {e}")))?;
        debug!("Task {} status {}", task_id, response.task_status);

        Ok(StatusReport::new(response.into_status()?))
    }
}

/// Body of `POST v1/images/generations`
#[derive(Debug, Serialize)]
struct GenerationRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<String>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    image_url: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    negative_prompt: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    guidance: Option<f32>,
    /// LoRA name (or version id) to scale
    #[serde(skip_serializing_if = "Option::is_none")]
    loras: Option<BTreeMap<String, f32>>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    task_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskResponse {
    task_status: String,
    #[serde(default)]
    output_images: Vec<String>,
    #[serde(default)]
    errors: Option<serde_json::Value>,
}

impl TaskResponse {
    fn into_status(self) -> Result<TaskStatus> {
        let phase = TaskPhase::from_remote(&self.task_status).ok_or_else(|| {
            ClientError::InvalidResponse(format!("unknown task status '{}'", self.task_status))
        })?;

        Ok(match phase {
            TaskPhase::Completed => TaskStatus::Completed(TaskResult::new(self.output_images)),
            TaskPhase::Failed => TaskStatus::Failed(
                self.errors
                    .as_ref()
                    .and_then(|e| e.get("message").and_then(|m| m.as_str()))
                    .unwrap_or("image generation failed")
                    .to_string(),
            ),
            TaskPhase::Cancelled => TaskStatus::Cancelled,
            TaskPhase::Processing => TaskStatus::Processing,
            TaskPhase::Pending | TaskPhase::Submitted | TaskPhase::TimedOut => TaskStatus::Pending,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ImageSize, LoraArg};
    use crate::http::RequestBody;
    use crate::test_support::ScriptedTransport;
    use serde_json::json;

    fn backend(transport: &std::sync::Arc<ScriptedTransport>) -> ImagesApiBackend {
        ImagesApiBackend::new(
            transport.client(),
            "https://api-inference.modelscope.cn/",
            Some("ms-token".to_string()),
        )
    }

    #[tokio::test]
    async fn test_submit_request_shape() {
        let transport = ScriptedTransport::new().json(json!({ "task_id": "T1" }));
        let request = TaskRequest::new("cat")
            .with_size(ImageSize::new(512, 512))
            .with_image_url("http://x/a.png")
            .with_seed(3)
            .with_lora(LoraArg::new(310150, 0.8));

        let submission = backend(&transport).submit(&request).await.unwrap();
        assert_eq!(submission, Submission::pending("T1"));

        let seen = transport.requests();
        assert_eq!(seen[0].url, "https://api-inference.modelscope.cn/v1/images/generations");
        assert_eq!(seen[0].header_value("Authorization"), Some("Bearer ms-token"));
        assert_eq!(seen[0].header_value("X-ModelScope-Async-Mode"), Some("true"));
        match &seen[0].body {
            RequestBody::Json(body) => {
                assert_eq!(body["model"], "Qwen/Qwen-Image-Edit-2511");
                assert_eq!(body["size"], "512x512");
                assert_eq!(body["image_url"], json!(["http://x/a.png"]));
                assert_eq!(body["seed"], 3);
                assert!((body["loras"]["310150"].as_f64().unwrap() - 0.8).abs() < 1e-6);
                assert!(body.get("steps").is_none());
            }
            other => panic!("expected JSON body, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_quick_request_omits_tuning() {
        let transport = ScriptedTransport::new().json(json!({ "task_id": "T2" }));
        let request = TaskRequest::new("cat")
            .with_seed(3)
            .with_steps(30)
            .with_negative_prompt("blur")
            .quick();

        backend(&transport).submit(&request).await.unwrap();

        let RequestBody::Json(body) = &transport.requests()[0].body else {
            panic!("expected JSON body");
        };
        assert!(body.get("seed").is_none());
        assert!(body.get("steps").is_none());
        assert!(body.get("negative_prompt").is_none());
    }

    #[tokio::test]
    async fn test_missing_token_makes_no_call() {
        let transport = ScriptedTransport::new();
        let backend = ImagesApiBackend::new(transport.client(), "http://h/", Some(" ".into()));

        assert!(!backend.has_credential());
        let err = backend.submit(&TaskRequest::new("cat")).await.unwrap_err();
        assert!(matches!(err, ClientError::Auth(_)));
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let transport = ScriptedTransport::new()
            .json(json!({ "task_status": "RUNNING" }))
            .json(json!({ "task_status": "SUCCEED", "output_images": ["http://x/out.png"] }))
            .json(json!({ "task_status": "FAILED" }))
            .json(json!({ "task_status": "MYSTERY" }));
        let backend = backend(&transport);

        assert_eq!(backend.fetch_status("T1").await.unwrap().status, TaskStatus::Processing);
        assert_eq!(
            backend.fetch_status("T1").await.unwrap().status,
            TaskStatus::Completed(TaskResult::new(vec!["http://x/out.png".into()]))
        );
        assert!(matches!(
            backend.fetch_status("T1").await.unwrap().status,
            TaskStatus::Failed(_)
        ));

        let err = backend.fetch_status("T1").await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidResponse(_)));

        let seen = transport.requests();
        assert_eq!(seen[0].url, "https://api-inference.modelscope.cn/v1/tasks/T1");
        assert_eq!(seen[0].header_value("X-ModelScope-Task-Type"), Some("image_generation"));
    }

    #[tokio::test]
    async fn test_submit_without_task_id() {
        let transport = ScriptedTransport::new().json(json!({ "request_id": "r" }));
        let err = backend(&transport)
            .submit(&TaskRequest::new("cat"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidResponse(_)));
    }
}
