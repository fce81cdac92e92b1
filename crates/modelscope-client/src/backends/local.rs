/// Local companion service
///
/// The service at `http://localhost:8005` holds the studio cookie itself and
/// proxies generation, uploads images into its session, captions them and
/// serves the model catalog. Every JSON reply carries a `success` flag with
/// the failure reason in `error` or `message`.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{BackendType, Submission, TaskBackend};
use crate::catalog::{Checkpoint, ImageSize, LoraArg, ModelCatalog};
use crate::config::{ClientConfig, UploadLimits};
use crate::error::{ClientError, Result};
use crate::http::{join_url, HttpClient};
use crate::settings::Settings;
use crate::status::{StatusReport, TaskPhase, TaskStatus};
use crate::task::{TaskRequest, TaskResult};
use crate::upload::{ProgressFn, UploadFile, UploadReceipt};

/// Reply to `GET /health`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
}

pub struct LocalService {
    http: HttpClient,
    process_http: HttpClient,
    base_url: String,
    cookie: Option<String>,
    openai_key: Option<String>,
    limits: UploadLimits,
    size: ImageSize,
    checkpoint: Option<Checkpoint>,
    loras: Vec<LoraArg>,
}

impl LocalService {
    pub fn new(http: HttpClient, base_url: impl Into<String>) -> Self {
        let config = ClientConfig::default();
        Self {
            process_http: http.with_timeout(config.process_timeout()),
            http,
            base_url: base_url.into(),
            cookie: None,
            openai_key: None,
            limits: config.upload,
            size: Settings::default().image_size,
            checkpoint: None,
            loras: Vec::new(),
        }
    }

    pub fn from_config(config: &ClientConfig, settings: &Settings, http: HttpClient) -> Self {
        Self {
            process_http: http.with_timeout(config.process_timeout()),
            http,
            base_url: config.endpoints.local_base_url.clone(),
            cookie: settings.cookie().map(str::to_string),
            openai_key: settings.openai_key().map(str::to_string),
            limits: config.upload.clone(),
            size: settings.image_size,
            checkpoint: settings.checkpoint.clone(),
            loras: settings.loras.clone(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn openai_key(&self) -> Option<&str> {
        self.openai_key.as_deref()
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    pub async fn health(&self) -> Result<HealthStatus> {
        let value = self.http.get_json(&self.url("health"), &[]).await?;
        serde_json::from_value(value)
            .map_err(|e| ClientError::InvalidResponse(format!("health response: {e}")))
    }

    /// Upload an image into the service session
    pub async fn upload(&self, file: UploadFile, on_progress: Option<ProgressFn>) -> Result<UploadReceipt> {
        file.validate(&self.limits)?;
        let name = file.file_name.clone();
        debug!("Uploading {} ({} bytes)", name, file.len());

        let value = self
            .http
            .upload_file(&self.url("upload"), file, Vec::new(), on_progress)
            .await?;
        let value = check_success(value)?;

        let receipt: UploadReceipt = serde_json::from_value(value)
            .map_err(|e| ClientError::InvalidResponse(format!("upload response: {e}")))?;
        info!("Uploaded {} as {}", name, receipt.filename);
        Ok(receipt)
    }

    /// Caption the image most recently uploaded in this session
    pub async fn analyze_uploaded(&self) -> Result<String> {
        let value = self
            .http
            .post_json(&self.url("analyze"), &[], &json!({}))
            .await?;
        caption_from(value)
    }

    /// Caption an image the service downloads itself
    pub async fn analyze_url(&self, url: &str) -> Result<String> {
        let value = self
            .http
            .post_json(&self.url("analyze_from_url"), &[], &json!({ "url": url }))
            .await?;
        caption_from(value)
    }

    /// Caption through `/reverse_image` with a caller-supplied OpenAI key
    pub async fn reverse_image(&self, image_url: &str, openai_api_key: &str) -> Result<String> {
        let value = self
            .http
            .post_json(
                &self.url("reverse_image"),
                &[],
                &json!({ "image_url": image_url, "openai_api_key": openai_api_key }),
            )
            .await?;
        caption_from(value)
    }

    /// Upload, caption and generate in a single server-side call.
    ///
    /// Runs under the long process timeout; the returned result carries the
    /// caption as its prompt.
    pub async fn process_image_complete(
        &self,
        file: UploadFile,
        request: &TaskRequest,
        on_progress: Option<ProgressFn>,
    ) -> Result<TaskResult> {
        file.validate(&self.limits)?;
        let cookie = self
            .cookie
            .as_deref()
            .ok_or_else(|| ClientError::Auth("ModelScope cookie is not configured".to_string()))?;

        let size = request.size.unwrap_or(self.size);
        let mut json_data = json!({
            "cookie": cookie,
            "width": size.width,
            "height": size.height,
            "num_images": request.num_images.unwrap_or(4),
            "enable_hires": request.enable_hires.unwrap_or(true),
        });
        if let Some(key) = &self.openai_key {
            json_data["openai_api_key"] = json!(key);
        }
        if let Some(checkpoint) = request.checkpoint.as_ref().or(self.checkpoint.as_ref()) {
            json_data["checkpoint"] = serde_json::to_value(checkpoint)?;
        }
        let loras = if request.loras.is_empty() {
            &self.loras
        } else {
            &request.loras
        };
        for (slot, lora) in loras.iter().take(4).enumerate() {
            json_data[format!("lora{}", slot + 1)] = serde_json::to_value(lora)?;
        }

        info!("Processing {} through the local service", file.file_name);
        let value = self
            .process_http
            .upload_file(
                &self.url("process_image_complete"),
                file,
                vec![("json_data".to_string(), json_data.to_string())],
                on_progress,
            )
            .await?;
        let value = check_success(value)?;

        let mut result = TaskResult::new(string_list(&value["images"]));
        if let Some(prompt) = value["prompt"].as_str() {
            result = result.with_prompt(prompt);
        }
        if result.images.is_empty() {
            return Err(ClientError::Failed("service returned no images".to_string()));
        }
        Ok(result)
    }

    /// Checkpoints and LoRAs published by the service
    pub async fn catalog(&self) -> ModelCatalog {
        ModelCatalog::fetch(&self.http, &self.base_url).await
    }
}

#[async_trait]
impl TaskBackend for LocalService {
    fn name(&self) -> &str {
        "Local service"
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Local
    }

    /// The service holds its own studio credentials
    fn has_credential(&self) -> bool {
        true
    }

    async fn submit(&self, request: &TaskRequest) -> Result<Submission> {
        let size = request.size.unwrap_or(self.size);
        let mut body = json!({
            "prompt": request.prompt,
            "width": size.width,
            "height": size.height,
        });
        if !request.quick {
            if let Some(negative) = &request.negative_prompt {
                body["negative_prompt"] = json!(negative);
            }
            if let Some(n) = request.num_images {
                body["num_images"] = json!(n);
            }
            if let Some(seed) = request.seed {
                body["seed"] = json!(seed);
            }
        }

        let value = self
            .http
            .post_json(&self.url("api/generate_image"), &[], &body)
            .await?;
        let value = check_success(value)?;

        let task_id = value["task_id"].as_str().filter(|id| !id.is_empty());
        let images = string_list(&value["images"]);

        match (task_id, images.is_empty()) {
            (id, false) => {
                let task_id = id
                    .map(str::to_string)
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                info!("Local service finished task {} synchronously", task_id);
                Ok(Submission {
                    task_id,
                    result: Some(TaskResult::new(images)),
                })
            }
            (Some(id), true) => Ok(Submission::pending(id)),
            (None, true) => Err(ClientError::InvalidResponse(
                "generate response has neither images nor task_id".to_string(),
            )),
        }
    }

    async fn fetch_status(&self, task_id: &str) -> Result<StatusReport> {
        let url = self.url(&format!("queue_status/{}", urlencoding::encode(task_id)));
        let value = self.http.get_json(&url, &[]).await?;

        if value["success"] == Value::Bool(false) {
            return Ok(StatusReport::new(TaskStatus::Failed(service_message(&value))));
        }

        let raw = value["status"].as_str().unwrap_or_default();
        let phase = TaskPhase::from_remote(raw)
            .ok_or_else(|| ClientError::InvalidResponse(format!("unknown task status '{raw}'")))?;

        let status = match phase {
            TaskPhase::Completed => TaskStatus::Completed(TaskResult::new(string_list(&value["images"]))),
            TaskPhase::Failed => TaskStatus::Failed(service_message(&value)),
            TaskPhase::Cancelled => TaskStatus::Cancelled,
            TaskPhase::Processing => TaskStatus::Processing,
            TaskPhase::Pending | TaskPhase::Submitted | TaskPhase::TimedOut => TaskStatus::Pending,
        };

        let mut report = StatusReport::new(status);
        if let Some(percent) = value["progress"].as_f64() {
            report = report.with_percent(percent as f32);
        }
        if let Some(message) = value["message"].as_str().filter(|m| !m.is_empty()) {
            report = report.with_detail(message);
        }
        Ok(report)
    }

    async fn fetch_result(&self, task_id: &str, completed: TaskResult) -> Result<TaskResult> {
        if !completed.images.is_empty() {
            return Ok(completed);
        }
        let url = self.url(&format!("result/{}", urlencoding::encode(task_id)));
        let value = check_success(self.http.get_json(&url, &[]).await?)?;

        let mut result = TaskResult::new(string_list(&value["images"]));
        if let Some(prompt) = value["prompt"].as_str() {
            result = result.with_prompt(prompt);
        }
        Ok(result)
    }

    async fn is_available(&self) -> Result<bool> {
        match self.health().await {
            Ok(health) => Ok(health.success),
            Err(_) => Ok(false),
        }
    }
}

/// Turn a `success:false` reply into `Failed`
fn check_success(value: Value) -> Result<Value> {
    if value["success"] == Value::Bool(false) {
        return Err(ClientError::Failed(service_message(&value)));
    }
    Ok(value)
}

fn service_message(value: &Value) -> String {
    value["error"]
        .as_str()
        .or_else(|| value["message"].as_str())
        .unwrap_or("request failed")
        .to_string()
}

fn caption_from(value: Value) -> Result<String> {
    let value = check_success(value)?;
    value["prompt"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ClientError::InvalidResponse("analysis response has no prompt".to_string()))
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
