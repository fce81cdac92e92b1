/// Task request, handle and result types
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::{Checkpoint, ImageSize, LoraArg};
use crate::error::{ClientError, Result};
use crate::status::TaskPhase;

/// Generation or edit job parameters
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Positive prompt
    pub prompt: String,

    /// Source images for edit models
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_urls: Vec<String>,

    /// Model identifier (backend default when absent)
    pub model: Option<String>,

    /// Output size
    pub size: Option<ImageSize>,

    pub negative_prompt: Option<String>,

    pub seed: Option<i64>,

    /// Inference steps
    pub steps: Option<u32>,

    /// Guidance scale
    pub guidance: Option<f32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub loras: Vec<LoraArg>,

    /// Base checkpoint (Muse only)
    pub checkpoint: Option<Checkpoint>,

    /// Images per prompt (Muse only)
    pub num_images: Option<u32>,

    /// Hires fix pass (Muse only)
    pub enable_hires: Option<bool>,

    /// Omit the optional tuning parameters from the wire request
    #[serde(default)]
    pub quick: bool,
}

impl TaskRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_image_url(mut self, url: impl Into<String>) -> Self {
        self.image_urls.push(url.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_size(mut self, size: ImageSize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_negative_prompt(mut self, negative: impl Into<String>) -> Self {
        self.negative_prompt = Some(negative.into());
        self
    }

    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = Some(steps);
        self
    }

    pub fn with_guidance(mut self, guidance: f32) -> Self {
        self.guidance = Some(guidance);
        self
    }

    pub fn with_lora(mut self, lora: LoraArg) -> Self {
        self.loras.push(lora);
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn with_num_images(mut self, n: u32) -> Self {
        self.num_images = Some(n);
        self
    }

    pub fn quick(mut self) -> Self {
        self.quick = true;
        self
    }

    /// Check the request before anything goes on the wire
    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(ClientError::InvalidRequest("prompt is empty".to_string()));
        }
        if let Some(size) = &self.size {
            size.validate()?;
        }
        if let Some(n) = self.num_images {
            if !(1..=4).contains(&n) {
                return Err(ClientError::InvalidRequest(format!(
                    "num_images must be 1..=4, got {n}"
                )));
            }
        }
        if self.image_urls.iter().any(|url| url.trim().is_empty()) {
            return Err(ClientError::InvalidRequest("empty image URL".to_string()));
        }
        Ok(())
    }
}

/// Identifies one in-flight remote job
#[derive(Debug, Clone, PartialEq)]
pub struct TaskHandle {
    pub task_id: String,
    pub submitted_at: DateTime<Utc>,

    /// Submission counter of the owning client, part of the handle identity
    pub(crate) generation: u64,

    /// Result already returned by a service that answered synchronously
    pub(crate) ready: Option<TaskResult>,
}

impl TaskHandle {
    pub(crate) fn new(task_id: String, generation: u64, ready: Option<TaskResult>) -> Self {
        Self {
            task_id,
            submitted_at: Utc::now(),
            generation,
            ready,
        }
    }

    /// Whether `other` refers to the same submission
    pub fn same_submission(&self, other: &TaskHandle) -> bool {
        self.generation == other.generation && self.task_id == other.task_id
    }
}

/// Final output of a completed task
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskResult {
    /// Output image URLs, in service order
    pub images: Vec<String>,

    /// Prompt or caption associated with the output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl TaskResult {
    pub fn new(images: Vec<String>) -> Self {
        Self {
            images,
            prompt: None,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }
}

/// Progress notification emitted while polling
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub task_id: String,
    pub phase: TaskPhase,

    /// 1-based polling attempt that produced this update
    pub attempt: u32,

    pub max_attempts: u32,
    pub percent: Option<f32>,
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = TaskRequest::new("cat")
            .with_size(ImageSize::new(512, 512))
            .with_image_url("http://x/a.png")
            .with_seed(7)
            .with_lora(LoraArg::new(310150, 1.0));

        assert_eq!(request.prompt, "cat");
        assert_eq!(request.image_urls, vec!["http://x/a.png"]);
        assert_eq!(request.seed, Some(7));
        assert_eq!(request.loras.len(), 1);
        assert!(!request.quick);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_request_validation() {
        assert!(TaskRequest::new("  ").validate().is_err());
        assert!(TaskRequest::new("cat")
            .with_size(ImageSize::new(4096, 512))
            .validate()
            .is_err());
        assert!(TaskRequest::new("cat").with_num_images(5).validate().is_err());
        assert!(TaskRequest::new("cat").with_image_url("").validate().is_err());
    }

    #[test]
    fn test_handle_identity() {
        let a = TaskHandle::new("T1".into(), 1, None);
        let b = TaskHandle::new("T1".into(), 2, None);
        assert!(a.same_submission(&a.clone()));
        assert!(!a.same_submission(&b));
    }

    #[test]
    fn test_result_serialization() {
        let result = TaskResult::new(vec!["http://x/out.png".into()]);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json, serde_json::json!({ "images": ["http://x/out.png"] }));
    }
}
