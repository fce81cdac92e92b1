/// Task status model and lifecycle validation
///
/// A remote task moves `Submitted -> {Pending, Processing} -> {Completed, Failed}`.
/// `Cancelled` and `TimedOut` are reached locally (or reported by the service
/// in the case of `Cancelled`). Terminal phases accept no further transition.
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};
use crate::task::TaskResult;

/// Payload-free tag of a task's position in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    /// Accepted by the service, no status observed yet
    Submitted,
    /// Queued remotely
    Pending,
    /// Running remotely
    Processing,
    Completed,
    Failed,
    Cancelled,
    /// Polling budget exhausted
    TimedOut,
}

impl TaskPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    /// Whether a task in `self` may move to `next`.
    ///
    /// Non-terminal phases may repeat and alternate (one status per poll;
    /// services requeue running jobs). Terminal phases are final.
    pub fn can_transition_to(self, next: TaskPhase) -> bool {
        use TaskPhase::*;
        match (self, next) {
            (_, Submitted) => false,
            (from, _) if from.is_terminal() => false,
            _ => true,
        }
    }

    /// Parse a status string as reported by any of the supported services.
    pub fn from_remote(status: &str) -> Option<Self> {
        match status.trim().to_ascii_uppercase().as_str() {
            "PENDING" | "QUEUING" | "QUEUED" | "WAITING" => Some(Self::Pending),
            "PROCESSING" | "RUNNING" | "STARTING" => Some(Self::Processing),
            "SUCCEED" | "SUCCEEDED" | "SUCCESS" | "COMPLETED" => Some(Self::Completed),
            "FAILED" | "FAILURE" | "ERROR" => Some(Self::Failed),
            "CANCELLED" | "CANCELED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Submitted => write!(f, "submitted"),
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Observed task status, carrying the result or failure reason when terminal
#[derive(Debug, Clone, PartialEq)]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed(TaskResult),
    Failed(String),
    Cancelled,
    TimedOut,
}

impl TaskStatus {
    pub fn phase(&self) -> TaskPhase {
        match self {
            Self::Pending => TaskPhase::Pending,
            Self::Processing => TaskPhase::Processing,
            Self::Completed(_) => TaskPhase::Completed,
            Self::Failed(_) => TaskPhase::Failed,
            Self::Cancelled => TaskPhase::Cancelled,
            Self::TimedOut => TaskPhase::TimedOut,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase().is_terminal()
    }
}

/// One status response from a backend
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub status: TaskStatus,

    /// Completion percentage, when the service reports one
    pub percent: Option<f32>,

    /// Human-readable progress detail
    pub detail: Option<String>,
}

impl StatusReport {
    pub fn new(status: TaskStatus) -> Self {
        Self {
            status,
            percent: None,
            detail: None,
        }
    }

    pub fn with_percent(mut self, percent: f32) -> Self {
        self.percent = Some(percent);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Validated lifecycle of a single task
#[derive(Debug, Clone)]
pub struct TaskLifecycle {
    phase: TaskPhase,
    transitions: u32,
}

impl TaskLifecycle {
    pub fn new() -> Self {
        Self {
            phase: TaskPhase::Submitted,
            transitions: 0,
        }
    }

    pub fn phase(&self) -> TaskPhase {
        self.phase
    }

    /// Number of accepted transitions so far
    pub fn transitions(&self) -> u32 {
        self.transitions
    }

    /// Move to `next`, rejecting impossible transitions.
    pub fn advance(&mut self, next: TaskPhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(ClientError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        self.transitions += 1;
        Ok(())
    }
}

impl Default for TaskLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
