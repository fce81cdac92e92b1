/// Client configuration: endpoints, timeouts, polling and upload limits
///
/// Every field has an explicit default, so a partial JSON file only needs the
/// values it overrides.
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// Service base URLs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    /// Local companion service
    pub local_base_url: String,

    /// ModelScope inference API (images + tasks)
    pub inference_base_url: String,

    /// ModelScope studio site hosting the Muse API
    pub muse_base_url: String,

    /// OpenAI-compatible vision chat API
    pub vision_base_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            local_base_url: "http://localhost:8005".to_string(),
            inference_base_url: "https://api-inference.modelscope.cn/".to_string(),
            muse_base_url: "https://www.modelscope.cn".to_string(),
            vision_base_url: "https://api-inference.modelscope.cn/v1".to_string(),
        }
    }
}

/// How the polling loop accounts for swallowed fetch errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// A failed status fetch consumes a polling attempt
    CountAsAttempt,
    /// Failed fetches are tracked separately; more than `max_errors` ends the poll
    Separate { max_errors: u32 },
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self::CountAsAttempt
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Sleep between status fetches for the remote APIs
    pub interval_ms: u64,

    /// Sleep between status fetches against the local service
    pub local_interval_ms: u64,

    pub max_attempts: u32,

    pub error_policy: ErrorPolicy,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            local_interval_ms: 2_000,
            max_attempts: 120,
            error_policy: ErrorPolicy::CountAsAttempt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadLimits {
    pub max_bytes: u64,
    pub allowed_extensions: Vec<String>,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_bytes: 16 * 1024 * 1024,
            allowed_extensions: ["webp", "png", "jpg", "jpeg", "gif", "bmp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Vision model used for captioning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub model: String,

    /// Instruction sent alongside the image
    pub instruction: String,

    /// Captions longer than this are cut
    pub max_caption_chars: usize,

    pub timeout_ms: u64,
}

pub const DEFAULT_VISION_INSTRUCTION: &str = "Describe this image as a prompt for an image \
generation model, in under 300 words. Stay strictly faithful to what is visible. Name the \
visual style (portrait photography, ink painting, oil, watercolour and so on), the lighting, \
the camera angle and the composition. For portraits describe expression, skin detail and \
pose. Use objective, factual language with no metaphors, no symbolic readings and no \
judgement of the work, and avoid exact numbers and special symbols.";

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            model: "Qwen/Qwen3-VL-30B-A3B-Instruct".to_string(),
            instruction: DEFAULT_VISION_INSTRUCTION.to_string(),
            max_caption_chars: 500,
            timeout_ms: 60_000,
        }
    }
}

/// Static client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub endpoints: Endpoints,

    /// Deadline for ordinary JSON requests
    pub request_timeout_ms: u64,

    /// Deadline for `/process_image_complete`, which runs the whole pipeline server-side
    pub process_timeout_ms: u64,

    pub poll: PollConfig,
    pub upload: UploadLimits,
    pub vision: VisionConfig,

    /// Model used by the images API when the request names none
    pub default_edit_model: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: Endpoints::default(),
            request_timeout_ms: 30_000,
            process_timeout_ms: 300_000,
            poll: PollConfig::default(),
            upload: UploadLimits::default(),
            vision: VisionConfig::default(),
            default_edit_model: "Qwen/Qwen-Image-Edit-2511".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_millis(self.process_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll.interval_ms)
    }

    pub fn local_poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll.local_interval_ms)
    }

    /// With local service URL
    pub fn with_local_base_url(mut self, url: impl Into<String>) -> Self {
        self.endpoints.local_base_url = url.into();
        self
    }

    /// With polling interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll.interval_ms = interval.as_millis() as u64;
        self
    }

    /// With polling attempt budget
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.poll.max_attempts = attempts;
        self
    }

    /// Save configuration to JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load configuration from JSON
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.poll.max_attempts, 120);
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.poll.error_policy, ErrorPolicy::CountAsAttempt);
        assert_eq!(config.upload.max_bytes, 16 * 1024 * 1024);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{
            "endpoints": { "local_base_url": "http://10.0.0.2:8005" },
            "poll": { "max_attempts": 10, "error_policy": { "mode": "separate", "max_errors": 3 } }
        }"#;
        let config: ClientConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.endpoints.local_base_url, "http://10.0.0.2:8005");
        assert_eq!(config.endpoints.muse_base_url, "https://www.modelscope.cn");
        assert_eq!(config.poll.max_attempts, 10);
        assert_eq!(config.poll.interval_ms, 5_000);
        assert_eq!(
            config.poll.error_policy,
            ErrorPolicy::Separate { max_errors: 3 }
        );
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("client.json");

        let config = ClientConfig::default()
            .with_poll_interval(Duration::from_millis(250))
            .with_max_attempts(4);
        config.save(&path).unwrap();

        let loaded = ClientConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
