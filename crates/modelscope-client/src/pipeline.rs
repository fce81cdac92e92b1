/// Upload → analyze → generate → poll orchestration
///
/// Stages run strictly in order. The first failing stage is reported once
/// through [`PipelineObserver::on_error`] and ends the run; nothing already
/// done is rolled back.
use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

use crate::analysis::{postprocess, Caption, ImageAnalyzer, ImageSource};
use crate::backends::LocalService;
use crate::cancel::{cancellable, CancelToken};
use crate::client::TaskClient;
use crate::error::{ClientError, Result};
use crate::task::{ProgressUpdate, TaskRequest, TaskResult};
use crate::upload::{ProgressFn, UploadFile, UploadProgress, UploadReceipt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Upload,
    Analyze,
    Submit,
    Poll,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upload => write!(f, "upload"),
            Self::Analyze => write!(f, "analyze"),
            Self::Submit => write!(f, "submit"),
            Self::Poll => write!(f, "poll"),
        }
    }
}

/// Receives pipeline progress. Every method defaults to doing nothing.
pub trait PipelineObserver: Send + Sync {
    fn on_stage(&self, _stage: Stage) {}

    fn on_upload_progress(&self, _progress: UploadProgress) {}

    fn on_caption(&self, _caption: &Caption) {}

    fn on_submitted(&self, _task_id: &str) {}

    fn on_progress(&self, _update: &ProgressUpdate) {}

    /// Called once, for the stage that failed
    fn on_error(&self, _stage: Stage, _error: &ClientError) {}
}

pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// Stores a file where the analyzer can reach it
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, file: UploadFile, on_progress: Option<ProgressFn>) -> Result<UploadReceipt>;
}

#[async_trait]
impl Uploader for LocalService {
    async fn upload(&self, file: UploadFile, on_progress: Option<ProgressFn>) -> Result<UploadReceipt> {
        LocalService::upload(self, file, on_progress).await
    }
}

/// What the pipeline starts from
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineInput {
    Url(String),
    File(UploadFile),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
    pub caption: Caption,
    pub task_id: String,
    pub result: TaskResult,
}

pub struct Pipeline {
    uploader: Option<Arc<dyn Uploader>>,
    analyzer: Arc<dyn ImageAnalyzer>,
    client: Arc<TaskClient>,
    template: TaskRequest,
    observer: Arc<dyn PipelineObserver>,
    current: Mutex<Option<CancelToken>>,
}

impl Pipeline {
    pub fn new(analyzer: Arc<dyn ImageAnalyzer>, client: Arc<TaskClient>) -> Self {
        Self {
            uploader: None,
            analyzer,
            client,
            template: TaskRequest::default(),
            observer: Arc::new(NoopObserver),
            current: Mutex::new(None),
        }
    }

    /// Upload files before analysis; without an uploader the analyzer gets
    /// the raw bytes
    pub fn with_uploader(mut self, uploader: Arc<dyn Uploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Generation parameters. A non-empty template prompt is prepended to
    /// the caption.
    pub fn with_template(mut self, template: TaskRequest) -> Self {
        self.template = template;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn client(&self) -> &Arc<TaskClient> {
        &self.client
    }

    /// Abort the running pipeline at its current stage
    pub fn cancel(&self) -> bool {
        let token = self.current.lock().take();
        let tracked = self.client.cancel();
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => tracked,
        }
    }

    pub async fn run(&self, input: PipelineInput) -> Result<PipelineOutput> {
        let token = CancelToken::new();
        if let Some(previous) = self.current.lock().replace(token.clone()) {
            previous.cancel();
        }
        let outcome = self.run_stages(input, &token).await;

        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|t| t.same_token(&token)) {
            *current = None;
        }
        outcome
    }

    async fn run_stages(&self, input: PipelineInput, token: &CancelToken) -> Result<PipelineOutput> {
        let source = match input {
            PipelineInput::Url(url) => ImageSource::Url(url),
            PipelineInput::File(file) => match &self.uploader {
                Some(uploader) => {
                    let observer = self.observer.clone();
                    let progress: ProgressFn =
                        Arc::new(move |p: UploadProgress| observer.on_upload_progress(p));
                    let receipt = self
                        .stage(Stage::Upload, cancellable(uploader.upload(file, Some(progress)), token))
                        .await?;
                    ImageSource::Uploaded(receipt)
                }
                None => ImageSource::File(file),
            },
        };

        let caption = self
            .stage(Stage::Analyze, cancellable(self.analyzer.analyze(&source), token))
            .await?;
        debug!("Caption: {}", caption.text);
        self.observer.on_caption(&caption);

        let mut request = self.template.clone();
        request.prompt = if request.prompt.trim().is_empty() {
            caption.text.clone()
        } else {
            postprocess::add_prefix(&caption.text, request.prompt.trim())
        };

        let handle = self
            .stage(Stage::Submit, cancellable(self.client.submit(&request), token))
            .await?;
        self.observer.on_submitted(&handle.task_id);

        let observer = self.observer.clone();
        let result = self
            .stage(
                Stage::Poll,
                cancellable(
                    self.client.poll(&handle, move |update| observer.on_progress(update)),
                    token,
                ),
            )
            .await?;

        info!("Pipeline finished task {}", handle.task_id);
        Ok(PipelineOutput {
            caption,
            task_id: handle.task_id,
            result,
        })
    }

    async fn stage<T, F>(&self, stage: Stage, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.observer.on_stage(stage);
        match fut.await {
            Ok(value) => Ok(value),
            Err(e) => {
                debug!("Pipeline stage {} failed: {}", stage, e);
                self.observer.on_error(stage, &e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{BackendType, Submission, TaskBackend};
    use crate::client::PollPolicy;
    use crate::status::{StatusReport, TaskStatus};
    use std::time::Duration;

    struct FixedAnalyzer(Option<&'static str>);

    #[async_trait]
    impl ImageAnalyzer for FixedAnalyzer {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn analyze(&self, _source: &ImageSource) -> Result<Caption> {
            match self.0 {
                Some(text) => Ok(Caption {
                    text: text.to_string(),
                    provider: "fixed".into(),
                }),
                None => Err(ClientError::Failed("vision model down".into())),
            }
        }
    }

    struct EchoBackend {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TaskBackend for EchoBackend {
        fn name(&self) -> &str {
            "echo"
        }
        fn backend_type(&self) -> BackendType {
            BackendType::Muse
        }
        fn has_credential(&self) -> bool {
            true
        }
        async fn submit(&self, request: &TaskRequest) -> Result<Submission> {
            self.prompts.lock().push(request.prompt.clone());
            Ok(Submission::pending("M1"))
        }
        async fn fetch_status(&self, _task_id: &str) -> Result<StatusReport> {
            Ok(StatusReport::new(TaskStatus::Completed(TaskResult::new(vec![
                "http://x/g.png".into(),
            ]))))
        }
    }

    struct CountingUploader;

    #[async_trait]
    impl Uploader for CountingUploader {
        async fn upload(&self, file: UploadFile, on_progress: Option<ProgressFn>) -> Result<UploadReceipt> {
            if let Some(progress) = on_progress {
                progress(UploadProgress { sent: file.len(), total: file.len() });
            }
            Ok(UploadReceipt {
                filename: file.file_name,
            })
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl PipelineObserver for Recorder {
        fn on_stage(&self, stage: Stage) {
            self.events.lock().push(format!("stage:{stage}"));
        }
        fn on_upload_progress(&self, progress: UploadProgress) {
            self.events.lock().push(format!("upload:{}", progress.percent()));
        }
        fn on_submitted(&self, task_id: &str) {
            self.events.lock().push(format!("submitted:{task_id}"));
        }
        fn on_error(&self, stage: Stage, _error: &ClientError) {
            self.events.lock().push(format!("error:{stage}"));
        }
    }

    fn client(backend: Arc<EchoBackend>) -> Arc<TaskClient> {
        Arc::new(TaskClient::new(backend, PollPolicy::new(Duration::ZERO, 5)))
    }

    #[tokio::test]
    async fn test_full_run_with_upload() {
        let backend = Arc::new(EchoBackend {
            prompts: Mutex::new(Vec::new()),
        });
        let recorder = Arc::new(Recorder::default());
        let pipeline = Pipeline::new(Arc::new(FixedAnalyzer(Some("a cat on a sofa"))), client(backend.clone()))
            .with_uploader(Arc::new(CountingUploader))
            .with_template(TaskRequest::new("photo-realistic"))
            .with_observer(recorder.clone());

        let output = pipeline
            .run(PipelineInput::File(UploadFile::from_bytes("cat.png", vec![1, 2, 3])))
            .await
            .unwrap();

        assert_eq!(output.task_id, "M1");
        assert_eq!(output.caption.text, "a cat on a sofa");
        assert_eq!(output.result.images, vec!["http://x/g.png".to_string()]);
        assert_eq!(
            backend.prompts.lock().as_slice(),
            ["photo-realistic, a cat on a sofa".to_string()]
        );
        assert_eq!(
            recorder.events.lock().as_slice(),
            [
                "stage:upload",
                "upload:100",
                "stage:analyze",
                "stage:submit",
                "submitted:M1",
                "stage:poll"
            ]
            .map(String::from)
        );
    }

    #[tokio::test]
    async fn test_failed_stage_reported_once_and_stops() {
        let backend = Arc::new(EchoBackend {
            prompts: Mutex::new(Vec::new()),
        });
        let recorder = Arc::new(Recorder::default());
        let pipeline = Pipeline::new(
            Arc::new(FixedAnalyzer(None)),
            client(backend.clone()),
        )
        .with_observer(recorder.clone());

        let err = pipeline
            .run(PipelineInput::Url("http://x/a.png".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Failed(_)));
        assert!(backend.prompts.lock().is_empty());

        let events = recorder.events.lock();
        assert_eq!(events.as_slice(), ["stage:analyze", "error:analyze"].map(String::from));
    }
}
