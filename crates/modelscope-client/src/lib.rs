/// ModelScope image task client
///
/// Submits image generation and edit jobs to ModelScope (or the local
/// companion service), polls them to completion and composes the
/// upload → caption → generate flow.

pub mod analysis;
pub mod backends;
pub mod cancel;
pub mod catalog;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod pipeline;
pub mod settings;
pub mod status;
pub mod task;
pub mod upload;

#[cfg(test)]
pub(crate) mod test_support;

pub use analysis::{Caption, ImageAnalyzer, ImageSource, LocalAnalyzer, VisionChatAnalyzer};
pub use backends::{
    BackendFactory, BackendType, ImagesApiBackend, LocalService, MuseBackend, Submission,
    TaskBackend,
};
pub use cancel::CancelToken;
pub use catalog::{Checkpoint, ImageSize, LoraArg, ModelCatalog, ResolutionTier};
pub use client::{PollPolicy, TaskClient};
pub use config::{ClientConfig, ErrorPolicy};
pub use error::{ClientError, Result};
pub use http::{HttpClient, HttpRequest, HttpResponse, Transport};
pub use pipeline::{Pipeline, PipelineInput, PipelineObserver, PipelineOutput, Stage, Uploader};
pub use settings::{Settings, SettingsStore};
pub use status::{StatusReport, TaskPhase, TaskStatus};
pub use task::{ProgressUpdate, TaskHandle, TaskRequest, TaskResult};
pub use upload::{ProgressFn, UploadFile, UploadProgress, UploadReceipt};
