/// Task backends
///
/// Provides a unified interface over the services that run image jobs:
/// - ModelScope inference API (bearer token, async mode)
/// - ModelScope studio "Muse" API (browser cookie)
/// - Local companion service (proxies both, plus upload and captioning)

pub mod images_api;
pub mod local;
pub mod muse;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use images_api::ImagesApiBackend;
pub use local::LocalService;
pub use muse::MuseBackend;

use crate::client::PollPolicy;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::http::HttpClient;
use crate::settings::Settings;
use crate::status::StatusReport;
use crate::task::{TaskRequest, TaskResult};

/// Backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    /// `v1/images/generations` + `v1/tasks/{id}`
    ImagesApi,
    /// Studio Muse API
    Muse,
    /// Local companion service
    Local,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ImagesApi => write!(f, "images-api"),
            Self::Muse => write!(f, "muse"),
            Self::Local => write!(f, "local"),
        }
    }
}

impl std::str::FromStr for BackendType {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "images-api" | "images_api" | "api" => Ok(Self::ImagesApi),
            "muse" => Ok(Self::Muse),
            "local" => Ok(Self::Local),
            other => Err(ClientError::InvalidRequest(format!(
                "unknown backend '{other}' (images-api, muse, local)"
            ))),
        }
    }
}

/// Outcome of a successful submission
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub task_id: String,

    /// Set when the service finished the job before answering
    pub result: Option<TaskResult>,
}

impl Submission {
    pub fn pending(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            result: None,
        }
    }
}

/// A service that accepts image jobs and reports their status
#[async_trait]
pub trait TaskBackend: Send + Sync {
    /// Backend name
    fn name(&self) -> &str;

    /// Backend type
    fn backend_type(&self) -> BackendType;

    /// Whether the credential this backend needs is configured
    fn has_credential(&self) -> bool;

    /// Submit a job
    async fn submit(&self, request: &TaskRequest) -> Result<Submission>;

    /// Fetch the current status of a job
    async fn fetch_status(&self, task_id: &str) -> Result<StatusReport>;

    /// Resolve the final result once a status reported completion.
    ///
    /// Services that return outputs inline with the status keep the default.
    async fn fetch_result(&self, _task_id: &str, completed: TaskResult) -> Result<TaskResult> {
        Ok(completed)
    }

    /// Check if backend is reachable
    async fn is_available(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Backend factory for creating backend instances
pub struct BackendFactory;

impl BackendFactory {
    /// Create backend from config and settings
    pub fn create(
        backend_type: BackendType,
        config: &ClientConfig,
        settings: &Settings,
        http: HttpClient,
    ) -> Arc<dyn TaskBackend> {
        match backend_type {
            BackendType::ImagesApi => Arc::new(ImagesApiBackend::from_config(config, settings, http)),
            BackendType::Muse => Arc::new(MuseBackend::from_config(config, settings, http)),
            BackendType::Local => Arc::new(LocalService::from_config(config, settings, http)),
        }
    }

    /// Polling policy for a backend type
    pub fn poll_policy(backend_type: BackendType, config: &ClientConfig) -> PollPolicy {
        let interval = match backend_type {
            BackendType::Local => config.local_poll_interval(),
            BackendType::ImagesApi | BackendType::Muse => config.poll_interval(),
        };
        PollPolicy {
            interval,
            max_attempts: config.poll.max_attempts,
            errors: config.poll.error_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_backend_type_display() {
        assert_eq!(BackendType::ImagesApi.to_string(), "images-api");
        assert_eq!(BackendType::Muse.to_string(), "muse");
        assert_eq!(BackendType::Local.to_string(), "local");
        assert_eq!("Muse".parse::<BackendType>().unwrap(), BackendType::Muse);
        assert!("comfy".parse::<BackendType>().is_err());
    }

    #[test]
    fn test_factory() {
        let config = ClientConfig::default();
        let settings = Settings {
            modelscope_token: Some("ms-token".into()),
            ..Default::default()
        };
        let http = HttpClient::reqwest(Duration::from_secs(5)).unwrap();

        let backend = BackendFactory::create(BackendType::ImagesApi, &config, &settings, http.clone());
        assert_eq!(backend.backend_type(), BackendType::ImagesApi);
        assert!(backend.has_credential());

        let backend = BackendFactory::create(BackendType::Muse, &config, &settings, http);
        assert!(!backend.has_credential());
    }

    #[test]
    fn test_poll_policy_per_backend() {
        let config = ClientConfig::default();
        let local = BackendFactory::poll_policy(BackendType::Local, &config);
        let api = BackendFactory::poll_policy(BackendType::ImagesApi, &config);

        assert_eq!(local.interval, Duration::from_secs(2));
        assert_eq!(api.interval, Duration::from_secs(5));
        assert_eq!(api.max_attempts, 120);
    }
}
