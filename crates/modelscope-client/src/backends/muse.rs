/// ModelScope studio (Muse) backend
///
/// Text-to-image jobs submitted with the user's browser session cookie. The
/// CSRF token the studio expects is read out of the same cookie.
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{BackendType, Submission, TaskBackend};
use crate::catalog::{Checkpoint, ImageSize, LoraArg};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::http::{join_url, HttpClient};
use crate::settings::Settings;
use crate::status::{StatusReport, TaskPhase, TaskStatus};
use crate::task::{TaskRequest, TaskResult};

const SUBMIT_PATH: &str = "api/v1/muse/predict/task/submit";
const STATUS_PATH: &str = "api/v1/muse/predict/task/status";

/// Status code the studio returns for task ids its status endpoint cannot parse
const UNPOLLABLE_ID_CODE: i64 = 40000;

/// Cookie names that may carry the CSRF token, in lookup order
const CSRF_COOKIES: &[&str] = &["csrf_token", "csrftoken", "csrf_session", "XSRF-TOKEN"];

const DEFAULT_IMAGES_PER_PROMPT: u32 = 4;

pub struct MuseBackend {
    http: HttpClient,
    base_url: String,
    cookie: Option<String>,
    size: ImageSize,
    checkpoint: Checkpoint,
    loras: Vec<LoraArg>,
}

impl MuseBackend {
    pub fn new(http: HttpClient, base_url: impl Into<String>, cookie: Option<String>) -> Self {
        let settings = Settings::default();
        Self {
            http,
            base_url: base_url.into(),
            cookie,
            size: settings.image_size,
            checkpoint: Checkpoint::default(),
            loras: settings.loras,
        }
    }

    pub fn from_config(config: &ClientConfig, settings: &Settings, http: HttpClient) -> Self {
        Self {
            http,
            base_url: config.endpoints.muse_base_url.clone(),
            cookie: settings.cookie().map(str::to_string),
            size: settings.image_size,
            checkpoint: settings.checkpoint.clone().unwrap_or_default(),
            loras: settings.loras.clone(),
        }
    }

    fn cookie(&self) -> Result<&str> {
        self.cookie
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ClientError::Auth("ModelScope cookie is not configured".to_string()))
    }

    fn headers(&self, cookie: &str) -> Vec<(String, String)> {
        let mut headers = vec![
            ("Cookie".to_string(), cookie.to_string()),
            ("Origin".to_string(), self.base_url.trim_end_matches('/').to_string()),
            (
                "Referer".to_string(),
                join_url(&self.base_url, "aigc/imageGeneration?tab=advanced"),
            ),
            (
                "X-Modelscope-Trace-Id".to_string(),
                uuid::Uuid::new_v4().to_string(),
            ),
            ("X-Modelscope-Accept-Language".to_string(), "zh_CN".to_string()),
        ];
        match csrf_token(cookie) {
            Some(token) => headers.push(("X-CSRF-TOKEN".to_string(), token)),
            None => warn!("No CSRF token found in ModelScope cookie"),
        }
        headers
    }

    /// TXT_2_IMG payload for the studio
    fn build_payload(&self, request: &TaskRequest) -> Value {
        let checkpoint = request.checkpoint.as_ref().unwrap_or(&self.checkpoint);
        let loras = if request.loras.is_empty() {
            &self.loras
        } else {
            &request.loras
        };
        let lora_args: Vec<Value> = loras
            .iter()
            .map(|l| json!({ "modelVersionId": l.model_version_id, "scale": l.scale }))
            .collect();
        let size = request.size.unwrap_or(self.size);

        let mut payload = json!({
            "taskType": "TXT_2_IMG",
            "predictType": "TXT_2_IMG",
            "modelArgs": {
                "checkpointModelVersionId": checkpoint.model_version_id,
                "checkpointShowInfo": checkpoint.show_info,
                "loraArgs": lora_args,
                "predictType": "TXT_2_IMG"
            },
            "promptArgs": {
                "prompt": request.prompt,
                "negativePrompt": request.negative_prompt.clone().unwrap_or_default()
            },
            "basicDiffusionArgs": {
                "sampler": "Euler",
                "guidanceScale": request.guidance.unwrap_or(checkpoint.guidance_scale),
                "seed": request.seed.unwrap_or(-1),
                "numInferenceSteps": request.steps.unwrap_or(checkpoint.num_inference_steps),
                "numImagesPerPrompt": request.num_images.unwrap_or(DEFAULT_IMAGES_PER_PROMPT),
                "width": size.width,
                "height": size.height
            },
            "advanced": false,
            "addWaterMark": false,
            "adetailerArgsMap": {},
            "controlNetFullArgs": []
        });

        if request.enable_hires.unwrap_or(true) {
            payload["hiresFixFrontArgs"] = json!({
                "modelName": "Nomos 8k SCHATL 4x",
                "scale": 4
            });
        }
        payload
    }
}

#[async_trait]
impl TaskBackend for MuseBackend {
    fn name(&self) -> &str {
        "ModelScope Muse"
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Muse
    }

    fn has_credential(&self) -> bool {
        self.cookie().is_ok()
    }

    async fn submit(&self, request: &TaskRequest) -> Result<Submission> {
        let cookie = self.cookie()?;
        let headers = self.headers(cookie);
        let headers: Vec<(&str, &str)> = headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let value = self
            .http
            .post_json(
                &join_url(&self.base_url, SUBMIT_PATH),
                &headers,
                &self.build_payload(request),
            )
            .await?;

        let task_id = parse_submit(&value)?;
        info!("Submitted Muse task {}", task_id);
        Ok(Submission::pending(task_id))
    }

    async fn fetch_status(&self, task_id: &str) -> Result<StatusReport> {
        let cookie = self.cookie()?;
        let headers = self.headers(cookie);
        let headers: Vec<(&str, &str)> = headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let url = format!(
            "{}?taskId={}",
            join_url(&self.base_url, STATUS_PATH),
            urlencoding::encode(task_id)
        );
        let value = self.http.get_json(&url, &headers).await?;
        parse_status(task_id, &value)
    }
}

/// Extract the CSRF token from a cookie header value, percent-decoded
pub fn csrf_token(cookie: &str) -> Option<String> {
    let pairs: Vec<(&str, &str)> = cookie
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .collect();

    CSRF_COOKIES.iter().find_map(|name| {
        pairs
            .iter()
            .find(|(k, _)| k.trim() == *name)
            .map(|(_, v)| v.trim().trim_matches('"'))
            .filter(|v| !v.is_empty())
            .map(|v| {
                urlencoding::decode(v)
                    .map(|d| d.into_owned())
                    .unwrap_or_else(|_| v.to_string())
            })
    })
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_submit(value: &Value) -> Result<String> {
    let data = &value["Data"];

    if let Some(code) = data.get("code").and_then(Value::as_i64) {
        if code != 0 {
            let message = data["message"].as_str().unwrap_or("unknown error");
            if message.contains("会话已过期") {
                return Err(ClientError::Auth(
                    "ModelScope session expired, refresh the cookie".to_string(),
                ));
            }
            return Err(ClientError::Failed(format!("submit rejected: {message}")));
        }
    }
    if value["Success"] == Value::Bool(false) {
        let message = value["Message"].as_str().unwrap_or("submit rejected");
        return Err(ClientError::Failed(message.to_string()));
    }

    [
        &data["taskId"],
        &data["data"]["taskId"],
        &value["data"]["taskId"],
        &value["taskId"],
    ]
    .into_iter()
    .find_map(id_string)
    .ok_or_else(|| {
        ClientError::InvalidResponse("submit response has no taskId, check the cookie".to_string())
    })
}

fn parse_status(task_id: &str, value: &Value) -> Result<StatusReport> {
    let message = value["Data"]["message"].as_str().unwrap_or_default();
    if value["Code"].as_i64() == Some(UNPOLLABLE_ID_CODE)
        || message.contains("NumberFormatException")
    {
        return Err(ClientError::InvalidRequest(format!(
            "task id {task_id} cannot be polled through the status endpoint"
        )));
    }

    let task = &value["Data"]["data"];
    if value["Success"] != Value::Bool(true) || !task.is_object() {
        return Err(ClientError::InvalidResponse(format!(
            "unexpected status response: {value}"
        )));
    }

    let raw = task["status"].as_str().unwrap_or_default();
    let phase = TaskPhase::from_remote(raw)
        .ok_or_else(|| ClientError::InvalidResponse(format!("unknown task status '{raw}'")))?;
    debug!("Muse task {} status {}", task_id, raw);

    let status = match phase {
        TaskPhase::Completed => {
            let result = extract_result(task);
            if result.images.is_empty() {
                TaskStatus::Failed("task completed without image URLs".to_string())
            } else {
                TaskStatus::Completed(result)
            }
        }
        TaskPhase::Failed => TaskStatus::Failed(
            task["errorMsg"]
                .as_str()
                .unwrap_or("unknown error")
                .to_string(),
        ),
        TaskPhase::Cancelled => TaskStatus::Cancelled,
        TaskPhase::Processing => TaskStatus::Processing,
        TaskPhase::Pending | TaskPhase::Submitted | TaskPhase::TimedOut => TaskStatus::Pending,
    };

    let mut report = StatusReport::new(status);
    let progress = &task["progress"];
    if let Some(percent) = progress["percent"].as_f64() {
        report = report.with_percent(percent as f32);
    }
    if let Some(detail) = progress["detail"].as_str().filter(|d| !d.is_empty()) {
        report = report.with_detail(detail);
    }
    if let Some(queue) = task.get("taskQueue").filter(|q| q.is_object()) {
        if phase == TaskPhase::Pending && report.detail.is_none() {
            report = report.with_detail(format!(
                "queued at position {} of {}",
                queue["currentPosition"], queue["total"]
            ));
        }
    }
    Ok(report)
}

/// Image URLs from the shapes `predictResult` has been observed in
fn extract_result(task: &Value) -> TaskResult {
    let urls = |items: &Value, key: &str| -> Vec<String> {
        items
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item[key].as_str())
                    .filter(|u| !u.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };

    let predict = &task["predictResult"];
    let images = &predict["images"];
    if images.is_array() {
        let mut result = TaskResult::new(urls(images, "imageUrl"));
        if let Some(prompt) = images[0]["prompt"].as_str().filter(|p| !p.is_empty()) {
            result = result.with_prompt(prompt);
        }
        if !result.images.is_empty() {
            return result;
        }
    }

    let images = if predict.is_array() {
        urls(predict, "url")
    } else if predict["results"].is_array() {
        urls(&predict["results"], "url")
    } else if let Some(url) = predict["url"].as_str() {
        vec![url.to_string()]
    } else {
        urls(&task["results"], "url")
    };
    TaskResult::new(images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::RequestBody;
    use crate::test_support::ScriptedTransport;

    const COOKIE: &str = "sid=1; csrf_token=ab%2Bcd; lang=zh";

    fn backend(transport: &std::sync::Arc<ScriptedTransport>) -> MuseBackend {
        MuseBackend::new(
            transport.client(),
            "https://www.modelscope.cn",
            Some(COOKIE.to_string()),
        )
    }

    fn status(task: Value) -> Value {
        json!({ "Success": true, "Code": 200, "Data": { "data": task } })
    }

    #[test]
    fn test_csrf_token() {
        assert_eq!(csrf_token(COOKIE).as_deref(), Some("ab+cd"));
        assert_eq!(csrf_token("csrftoken=\"xyz\"").as_deref(), Some("xyz"));
        assert_eq!(csrf_token("XSRF-TOKEN=t1; csrf_token=t2").as_deref(), Some("t2"));
        assert!(csrf_token("sid=1").is_none());
    }

    #[tokio::test]
    async fn test_submit() {
        let transport = ScriptedTransport::new().json(json!({
            "Success": true, "Message": "", "Data": { "taskId": 98765 }
        }));
        let request = TaskRequest::new("a lighthouse").with_num_images(2);

        let submission = backend(&transport).submit(&request).await.unwrap();
        assert_eq!(submission.task_id, "98765");

        let seen = transport.requests();
        assert_eq!(
            seen[0].url,
            "https://www.modelscope.cn/api/v1/muse/predict/task/submit"
        );
        assert_eq!(seen[0].header_value("Cookie"), Some(COOKIE));
        assert_eq!(seen[0].header_value("X-CSRF-TOKEN"), Some("ab+cd"));

        let RequestBody::Json(body) = &seen[0].body else {
            panic!("expected JSON body");
        };
        assert_eq!(body["taskType"], "TXT_2_IMG");
        assert_eq!(body["modelArgs"]["checkpointModelVersionId"], 275167);
        assert_eq!(body["modelArgs"]["loraArgs"][0]["modelVersionId"], 310150);
        assert_eq!(body["promptArgs"]["prompt"], "a lighthouse");
        assert_eq!(body["basicDiffusionArgs"]["numImagesPerPrompt"], 2);
        assert_eq!(body["basicDiffusionArgs"]["width"], 928);
        assert!(body["hiresFixFrontArgs"].is_object());
    }

    #[tokio::test]
    async fn test_submit_expired_session() {
        let transport = ScriptedTransport::new().json(json!({
            "Success": true, "Data": { "code": 10001, "message": "会话已过期" }
        }));
        let err = backend(&transport)
            .submit(&TaskRequest::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Auth(_)));
    }

    #[tokio::test]
    async fn test_status_progress_and_result() {
        let transport = ScriptedTransport::new()
            .json(status(json!({
                "status": "PROCESSING",
                "progress": { "percent": 40, "detail": "sampling" }
            })))
            .json(status(json!({
                "status": "COMPLETED",
                "predictResult": { "images": [
                    { "imageUrl": "http://x/1.png", "prompt": "p" },
                    { "imageUrl": "http://x/2.png" }
                ] }
            })))
            .json(status(json!({
                "status": "SUCCEED",
                "predictResult": [{ "url": "http://x/3.png" }]
            })));
        let backend = backend(&transport);

        let report = backend.fetch_status("42").await.unwrap();
        assert_eq!(report.status, TaskStatus::Processing);
        assert_eq!(report.percent, Some(40.0));
        assert_eq!(report.detail.as_deref(), Some("sampling"));

        let report = backend.fetch_status("42").await.unwrap();
        assert_eq!(
            report.status,
            TaskStatus::Completed(
                TaskResult::new(vec!["http://x/1.png".into(), "http://x/2.png".into()])
                    .with_prompt("p")
            )
        );

        let report = backend.fetch_status("42").await.unwrap();
        assert_eq!(
            report.status,
            TaskStatus::Completed(TaskResult::new(vec!["http://x/3.png".into()]))
        );

        assert_eq!(
            transport.requests()[0].url,
            "https://www.modelscope.cn/api/v1/muse/predict/task/status?taskId=42"
        );
    }

    #[tokio::test]
    async fn test_status_failures() {
        let transport = ScriptedTransport::new()
            .json(status(json!({ "status": "FAILED", "errorMsg": "nsfw" })))
            .json(json!({ "Success": false, "Code": 40000, "Data": {} }))
            .json(json!({ "Success": false, "Code": 500 }));
        let backend = backend(&transport);

        assert_eq!(
            backend.fetch_status("1").await.unwrap().status,
            TaskStatus::Failed("nsfw".into())
        );

        let err = backend.fetch_status("uuid-like").await.unwrap_err();
        assert!(!err.is_transient());

        let err = backend.fetch_status("1").await.unwrap_err();
        assert!(err.is_transient());
    }
}
