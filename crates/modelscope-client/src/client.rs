/// Task client: submit a job, poll it to a terminal outcome, cancel it
///
/// One client tracks at most one active task. Submitting again supersedes
/// the previous task locally; its poll ends with `Cancelled` while the remote
/// job keeps running.
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backends::TaskBackend;
use crate::cancel::{cancellable, CancelToken};
use crate::config::ErrorPolicy;
use crate::error::{ClientError, Result};
use crate::status::{StatusReport, TaskLifecycle, TaskPhase, TaskStatus};
use crate::task::{ProgressUpdate, TaskHandle, TaskRequest, TaskResult};

/// How often and how long to poll
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    /// Sleep between status fetches; zero polls back to back
    pub interval: Duration,

    /// Status fetches before giving up with `Timeout`
    pub max_attempts: u32,

    pub errors: ErrorPolicy,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 120,
            errors: ErrorPolicy::CountAsAttempt,
        }
    }
}

impl PollPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_error_policy(mut self, errors: ErrorPolicy) -> Self {
        self.errors = errors;
        self
    }
}

struct ActiveTask {
    /// Empty until the service has answered the submission
    task_id: String,
    generation: u64,
    cancel: CancelToken,
}

pub struct TaskClient {
    backend: Arc<dyn TaskBackend>,
    policy: PollPolicy,
    active: Mutex<Option<ActiveTask>>,
    generation: AtomicU64,
}

impl TaskClient {
    pub fn new(backend: Arc<dyn TaskBackend>, policy: PollPolicy) -> Self {
        Self {
            backend,
            policy,
            active: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> &Arc<dyn TaskBackend> {
        &self.backend
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Id of the task currently tracked, if the service has assigned one
    pub fn active_task_id(&self) -> Option<String> {
        self.active
            .lock()
            .as_ref()
            .map(|task| task.task_id.clone())
            .filter(|id| !id.is_empty())
    }

    /// Submit a job and start tracking it.
    ///
    /// Fails with `Auth` before any network call when the backend has no
    /// credential, and with `InvalidRequest` when the request does not
    /// validate. Any previously tracked task is superseded.
    pub async fn submit(&self, request: &TaskRequest) -> Result<TaskHandle> {
        if !self.backend.has_credential() {
            return Err(ClientError::Auth(format!(
                "{} credential is not configured",
                self.backend.name()
            )));
        }
        request.validate()?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancelToken::new();
        let previous = self.active.lock().replace(ActiveTask {
            task_id: String::new(),
            generation,
            cancel: token.clone(),
        });
        if let Some(previous) = previous {
            info!("Superseding task {}", display_id(&previous.task_id));
            previous.cancel.cancel();
        }

        let submission = match cancellable(self.backend.submit(request), &token).await {
            Ok(submission) => submission,
            Err(e) => {
                self.release(generation);
                return Err(e);
            }
        };

        if let Some(task) = self.active.lock().as_mut() {
            if task.generation == generation {
                task.task_id = submission.task_id.clone();
            }
        }
        info!("Task {} submitted to {}", submission.task_id, self.backend.name());

        Ok(TaskHandle::new(submission.task_id, generation, submission.result))
    }

    /// Poll `handle` until it completes, fails, is cancelled or runs out of
    /// attempts. `on_progress` sees every non-terminal status.
    pub async fn poll<F>(&self, handle: &TaskHandle, mut on_progress: F) -> Result<TaskResult>
    where
        F: FnMut(&ProgressUpdate) + Send,
    {
        let token = match self.token_for(handle) {
            Some(token) => token,
            None => {
                debug!("Task {} is no longer tracked", handle.task_id);
                return Err(ClientError::Cancelled);
            }
        };
        let mut lifecycle = TaskLifecycle::new();

        if let Some(result) = handle.ready.clone() {
            lifecycle.advance(TaskPhase::Completed)?;
            return self.finish(handle, Ok(result));
        }

        let outcome = self
            .poll_loop(handle, &token, &mut lifecycle, &mut on_progress)
            .await;
        if let Err(e) = &outcome {
            let phase = match e {
                ClientError::Cancelled => Some(TaskPhase::Cancelled),
                ClientError::Timeout(_) => Some(TaskPhase::TimedOut),
                _ => None,
            };
            if let Some(phase) = phase {
                if lifecycle.phase().can_transition_to(phase) {
                    let _ = lifecycle.advance(phase);
                }
            }
        }
        debug!(
            "Task {} ended {} after {} transitions",
            handle.task_id,
            lifecycle.phase(),
            lifecycle.transitions()
        );
        self.finish(handle, outcome)
    }

    async fn poll_loop<F>(
        &self,
        handle: &TaskHandle,
        token: &CancelToken,
        lifecycle: &mut TaskLifecycle,
        on_progress: &mut F,
    ) -> Result<TaskResult>
    where
        F: FnMut(&ProgressUpdate) + Send,
    {
        let task_id = handle.task_id.as_str();
        let max_attempts = self.policy.max_attempts;
        let mut attempts = 0u32;
        let mut errors = 0u32;

        loop {
            if token.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            if attempts >= max_attempts {
                return Err(ClientError::Timeout(format!(
                    "task {task_id} not finished after {max_attempts} attempts"
                )));
            }
            attempts += 1;
            debug!("Polling task {} ({}/{})", task_id, attempts, max_attempts);

            match cancellable(self.backend.fetch_status(task_id), token).await {
                Ok(report) => {
                    lifecycle.advance(report.status.phase())?;
                    let StatusReport {
                        status,
                        percent,
                        detail,
                    } = report;
                    match status {
                        TaskStatus::Completed(partial) => {
                            let result =
                                cancellable(self.backend.fetch_result(task_id, partial), token)
                                    .await?;
                            info!("Task {} completed with {} images", task_id, result.images.len());
                            return Ok(result);
                        }
                        TaskStatus::Failed(reason) => return Err(ClientError::Failed(reason)),
                        TaskStatus::Cancelled => return Err(ClientError::Cancelled),
                        TaskStatus::TimedOut => {
                            return Err(ClientError::Timeout(format!(
                                "service reported task {task_id} as timed out"
                            )))
                        }
                        TaskStatus::Pending | TaskStatus::Processing => {
                            on_progress(&ProgressUpdate {
                                task_id: task_id.to_string(),
                                phase: lifecycle.phase(),
                                attempt: attempts,
                                max_attempts,
                                percent,
                                detail,
                            });
                        }
                    }
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) if e.is_transient() => {
                    warn!("Status fetch for {} failed, retrying: {}", task_id, e);
                    if let ErrorPolicy::Separate { max_errors } = self.policy.errors {
                        attempts -= 1;
                        errors += 1;
                        if errors > max_errors {
                            return Err(e);
                        }
                    }
                }
                Err(e) => return Err(e),
            }

            if attempts >= max_attempts {
                continue;
            }
            if !self.policy.interval.is_zero() {
                let interval = self.policy.interval;
                cancellable(
                    async {
                        tokio::time::sleep(interval).await;
                        Ok(())
                    },
                    token,
                )
                .await?;
            }
        }
    }

    /// Submit then poll
    pub async fn run<F>(&self, request: &TaskRequest, on_progress: F) -> Result<TaskResult>
    where
        F: FnMut(&ProgressUpdate) + Send,
    {
        let handle = self.submit(request).await?;
        self.poll(&handle, on_progress).await
    }

    /// Single status fetch, without tracking
    pub async fn status(&self, task_id: &str) -> Result<StatusReport> {
        self.backend.fetch_status(task_id).await
    }

    /// Stop tracking the active task, aborting its in-flight request and
    /// polling sleep. The remote job is not cancelled.
    ///
    /// Returns whether a task was active.
    pub fn cancel(&self) -> bool {
        match self.active.lock().take() {
            Some(task) => {
                info!("Cancelling task {}", display_id(&task.task_id));
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn token_for(&self, handle: &TaskHandle) -> Option<CancelToken> {
        self.active
            .lock()
            .as_ref()
            .filter(|task| task.generation == handle.generation && task.task_id == handle.task_id)
            .map(|task| task.cancel.clone())
    }

    /// Clear the active slot if it still belongs to `generation`
    fn release(&self, generation: u64) {
        let mut active = self.active.lock();
        if active.as_ref().map(|t| t.generation) == Some(generation) {
            *active = None;
        }
    }

    fn finish(&self, handle: &TaskHandle, outcome: Result<TaskResult>) -> Result<TaskResult> {
        self.release(handle.generation);
        outcome
    }
}

fn display_id(task_id: &str) -> &str {
    if task_id.is_empty() {
        "<submitting>"
    } else {
        task_id
    }
}
