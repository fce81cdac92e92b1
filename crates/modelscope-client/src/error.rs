use thiserror::Error;

use crate::status::TaskPhase;

/// Errors surfaced by the HTTP wrapper, the task client and the pipeline
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("missing credential: {0}")]
    Auth(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("task failed: {0}")]
    Failed(String),
    #[error("task cancelled")]
    Cancelled,
    #[error("invalid task transition: {from} -> {to}")]
    InvalidTransition { from: TaskPhase, to: TaskPhase },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;

impl ClientError {
    /// Errors the polling loop swallows and retries on.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::Http { .. } | Self::InvalidResponse(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            Self::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ClientError::Network("reset".into()).is_transient());
        assert!(ClientError::Timeout("30s".into()).is_transient());
        assert!(ClientError::Http {
            status: 502,
            message: "bad gateway".into()
        }
        .is_transient());
        assert!(ClientError::InvalidResponse("not json".into()).is_transient());

        assert!(!ClientError::Cancelled.is_transient());
        assert!(!ClientError::Failed("boom".into()).is_transient());
        assert!(!ClientError::Auth("token".into()).is_transient());
    }

    #[test]
    fn test_display() {
        let err = ClientError::Http {
            status: 401,
            message: "unauthorized".into(),
        };
        assert_eq!(err.to_string(), "HTTP 401: unauthorized");

        let err = ClientError::InvalidTransition {
            from: TaskPhase::Completed,
            to: TaskPhase::Pending,
        };
        assert_eq!(err.to_string(), "invalid task transition: completed -> pending");
    }
}
