/// Image analysis: turn an image into a generation prompt
///
/// Captions come either from the local service, which runs the vision model
/// itself, or straight from an OpenAI-compatible vision chat endpoint.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

use crate::backends::LocalService;
use crate::config::{ClientConfig, VisionConfig};
use crate::error::{ClientError, Result};
use crate::http::{join_url, HttpClient};
use crate::settings::Settings;
use crate::upload::{UploadFile, UploadReceipt};

/// Caption generated for an image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Caption {
    /// Caption text, cleaned and length-capped
    pub text: String,

    /// Analyzer that produced it
    pub provider: String,
}

/// Image to analyze
#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    /// Publicly reachable image URL
    Url(String),
    /// File already uploaded into the local service session
    Uploaded(UploadReceipt),
    /// Raw image bytes
    File(UploadFile),
}

/// Caption provider
#[async_trait]
pub trait ImageAnalyzer: Send + Sync {
    /// Provider name
    fn name(&self) -> &str;

    /// Generate a caption for an image
    async fn analyze(&self, source: &ImageSource) -> Result<Caption>;
}

/// Captions produced by the local service
pub struct LocalAnalyzer {
    service: Arc<LocalService>,
    max_chars: usize,
}

impl LocalAnalyzer {
    pub fn new(service: Arc<LocalService>) -> Self {
        Self {
            service,
            max_chars: VisionConfig::default().max_caption_chars,
        }
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }
}

#[async_trait]
impl ImageAnalyzer for LocalAnalyzer {
    fn name(&self) -> &str {
        "local"
    }

    async fn analyze(&self, source: &ImageSource) -> Result<Caption> {
        let raw = match source {
            ImageSource::Url(url) => match self.service.openai_key() {
                Some(key) => self.service.reverse_image(url, key).await?,
                None => self.service.analyze_url(url).await?,
            },
            ImageSource::Uploaded(receipt) => {
                debug!("Analyzing uploaded {}", receipt.filename);
                self.service.analyze_uploaded().await?
            }
            ImageSource::File(file) => {
                return Err(ClientError::InvalidRequest(format!(
                    "{} must be uploaded before the local service can analyze it",
                    file.file_name
                )))
            }
        };

        Ok(Caption {
            text: postprocess::finish(&raw, self.max_chars)?,
            provider: self.name().to_string(),
        })
    }
}

/// OpenAI-compatible vision chat analyzer
pub struct VisionChatAnalyzer {
    http: HttpClient,
    base_url: String,
    api_key: Option<String>,
    config: VisionConfig,
}

impl VisionChatAnalyzer {
    pub fn new(http: HttpClient, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        let config = VisionConfig::default();
        Self {
            http: http.with_timeout(std::time::Duration::from_millis(config.timeout_ms)),
            base_url: base_url.into(),
            api_key,
            config,
        }
    }

    /// ModelScope inference endpoint authenticated with the API token
    pub fn from_config(config: &ClientConfig, settings: &Settings, http: HttpClient) -> Self {
        Self {
            http: http.with_timeout(std::time::Duration::from_millis(config.vision.timeout_ms)),
            base_url: config.endpoints.vision_base_url.clone(),
            api_key: settings.token().map(str::to_string),
            config: config.vision.clone(),
        }
    }

    /// Set custom instruction
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.config.instruction = instruction.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }
}

#[async_trait]
impl ImageAnalyzer for VisionChatAnalyzer {
    fn name(&self) -> &str {
        "vision-chat"
    }

    async fn analyze(&self, source: &ImageSource) -> Result<Caption> {
        let key = self
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ClientError::Auth("vision API key is not configured".to_string()))?;

        let image_url = match source {
            ImageSource::Url(url) => url.clone(),
            ImageSource::File(file) => file.to_data_url(),
            ImageSource::Uploaded(receipt) => {
                return Err(ClientError::InvalidRequest(format!(
                    "{} lives on the local service; analyze it there or pass the file",
                    receipt.filename
                )))
            }
        };

        let request_body = json!({
            "model": self.config.model,
            "stream": false,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": self.config.instruction },
                    { "type": "image_url", "image_url": { "url": image_url } }
                ]
            }]
        });

        let auth = format!("Bearer {}", key.trim());
        let value = self
            .http
            .post_json(
                &join_url(&self.base_url, "chat/completions"),
                &[("Authorization", auth.as_str())],
                &request_body,
            )
            .await?;

        let response: ChatResponse = serde_json::from_value(value)
            .map_err(|e| ClientError::InvalidResponse(format!("chat response: {e}")))?;
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        let text = postprocess::finish(&content, self.config.max_caption_chars)?;
        info!("Caption from {}: {} chars", self.config.model, text.chars().count());
        Ok(Caption {
            text,
            provider: self.name().to_string(),
        })
    }
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

/// Caption post-processing utilities
pub mod postprocess {
    use crate::error::{ClientError, Result};

    /// Collapse runs of whitespace into single spaces
    pub fn clean_caption(caption: &str) -> String {
        caption.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Cap a caption at `max_chars` characters.
    ///
    /// An over-long caption is cut after the last `。` in the window when that
    /// keeps more than four fifths of it, else after the last `，` under the
    /// same condition, else hard at `max_chars`.
    pub fn truncate_caption(caption: &str, max_chars: usize) -> String {
        let chars: Vec<char> = caption.chars().collect();
        if chars.len() <= max_chars {
            return caption.to_string();
        }

        let window = &chars[..max_chars];
        let floor = max_chars * 4 / 5;
        let cut_after = |mark: char| window.iter().rposition(|&c| c == mark).filter(|&i| i > floor);

        let end = cut_after('。')
            .or_else(|| cut_after('，'))
            .map(|i| i + 1)
            .unwrap_or(max_chars);
        window[..end].iter().collect()
    }

    /// Put a fixed prompt prefix (style words, trigger word) before a caption
    pub fn add_prefix(caption: &str, prefix: &str) -> String {
        if caption.is_empty() {
            prefix.to_string()
        } else {
            format!("{}, {}", prefix, caption)
        }
    }

    /// Clean and cap, rejecting an empty result
    pub fn finish(raw: &str, max_chars: usize) -> Result<String> {
        let text = truncate_caption(&clean_caption(raw), max_chars);
        if text.is_empty() {
            return Err(ClientError::InvalidResponse("empty caption".to_string()));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::RequestBody;
    use crate::test_support::ScriptedTransport;

    #[test]
    fn test_clean_caption() {
        let dirty = "  extra \n\n spaces\there  ";
        assert_eq!(postprocess::clean_caption(dirty), "extra spaces here");
    }

    #[test]
    fn test_add_prefix() {
        assert_eq!(
            postprocess::add_prefix("a beautiful landscape", "film photo"),
            "film photo, a beautiful landscape"
        );
        assert_eq!(postprocess::add_prefix("", "film photo"), "film photo");
    }

    #[test]
    fn test_truncate_prefers_full_stop() {
        let caption = format!("{}。{}，{}", "a".repeat(420), "b".repeat(30), "c".repeat(100));
        let cut = postprocess::truncate_caption(&caption, 500);
        assert_eq!(cut.chars().count(), 421);
        assert!(cut.ends_with('。'));
    }

    #[test]
    fn test_truncate_falls_back_to_comma() {
        let caption = format!("{}。{}，{}", "a".repeat(100), "b".repeat(350), "c".repeat(100));
        let cut = postprocess::truncate_caption(&caption, 500);
        assert_eq!(cut.chars().count(), 452);
        assert!(cut.ends_with('，'));
    }

    #[test]
    fn test_truncate_hard_cut() {
        let caption = "字".repeat(600);
        let cut = postprocess::truncate_caption(&caption, 500);
        assert_eq!(cut.chars().count(), 500);

        assert_eq!(postprocess::truncate_caption("short", 500), "short");
    }

    #[tokio::test]
    async fn test_vision_chat_request() {
        let transport = ScriptedTransport::new().json(json!({
            "choices": [{ "message": { "content": "  a red\n\ncar  " } }]
        }));
        let analyzer = VisionChatAnalyzer::new(
            transport.client(),
            "https://api-inference.modelscope.cn/v1",
            Some("ms-key".into()),
        );

        let file = UploadFile::from_bytes("car.png", b"png".to_vec());
        let caption = analyzer.analyze(&ImageSource::File(file)).await.unwrap();
        assert_eq!(caption.text, "a red car");
        assert_eq!(caption.provider, "vision-chat");

        let request = &transport.requests()[0];
        assert_eq!(
            request.url,
            "https://api-inference.modelscope.cn/v1/chat/completions"
        );
        assert_eq!(request.header_value("Authorization"), Some("Bearer ms-key"));
        let RequestBody::Json(body) = &request.body else {
            panic!("expected JSON body");
        };
        assert_eq!(body["model"], "Qwen/Qwen3-VL-30B-A3B-Instruct");
        assert_eq!(
            body["messages"][0]["content"][1]["image_url"]["url"],
            "data:image/png;base64,cG5n"
        );
    }

    #[tokio::test]
    async fn test_vision_chat_empty_reply() {
        let transport = ScriptedTransport::new().json(json!({ "choices": [] }));
        let analyzer = VisionChatAnalyzer::new(transport.client(), "http://h/v1", Some("k".into()));

        let err = analyzer
            .analyze(&ImageSource::Url("http://x/a.png".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_local_analyzer_routes_by_source() {
        let transport = ScriptedTransport::new()
            .json(json!({ "success": true, "prompt": "from url" }))
            .json(json!({ "success": true, "prompt": "from upload" }));
        let service = Arc::new(LocalService::new(transport.client(), "http://localhost:8005"));
        let analyzer = LocalAnalyzer::new(service);

        let caption = analyzer
            .analyze(&ImageSource::Url("http://x/a.png".into()))
            .await
            .unwrap();
        assert_eq!(caption.text, "from url");

        let receipt = UploadReceipt {
            filename: "a.png".into(),
        };
        let caption = analyzer.analyze(&ImageSource::Uploaded(receipt)).await.unwrap();
        assert_eq!(caption.text, "from upload");

        let err = analyzer
            .analyze(&ImageSource::File(UploadFile::from_bytes("a.png", vec![1])))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidRequest(_)));

        let seen = transport.requests();
        assert_eq!(seen[0].url, "http://localhost:8005/analyze_from_url");
        assert_eq!(seen[1].url, "http://localhost:8005/analyze");
    }
}
