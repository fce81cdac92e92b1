/// Upload payloads and progress reporting
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::config::UploadLimits;
use crate::error::{ClientError, Result};

/// Callback receiving byte progress while a body is streamed
pub type ProgressFn = Arc<dyn Fn(UploadProgress) + Send + Sync>;

/// Bytes sent so far out of the total body size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub sent: u64,
    pub total: u64,
}

impl UploadProgress {
    /// Fraction in `0.0..=1.0`; an empty body counts as complete
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            (self.sent as f64 / self.total as f64).min(1.0)
        }
    }

    /// Rounded percentage, 0..=100
    pub fn percent(&self) -> u8 {
        (self.fraction() * 100.0).round() as u8
    }
}

/// An image file to send as multipart field `file`
#[derive(Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub file_name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for UploadFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadFile")
            .field("file_name", &self.file_name)
            .field("mime", &self.mime)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl UploadFile {
    pub fn from_bytes(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let file_name = file_name.into();
        let mime = mime_guess::from_path(&file_name)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Self {
            file_name,
            mime,
            bytes,
        }
    }

    pub async fn from_path(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}.jpg", uuid::Uuid::new_v4()));
        Ok(Self::from_bytes(file_name, bytes))
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn extension(&self) -> Option<String> {
        Path::new(&self.file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }

    /// Reject empty, oversized or non-image files
    pub fn validate(&self, limits: &UploadLimits) -> Result<()> {
        if self.is_empty() {
            return Err(ClientError::InvalidRequest(format!(
                "{} is empty",
                self.file_name
            )));
        }
        if self.len() > limits.max_bytes {
            return Err(ClientError::InvalidRequest(format!(
                "{} is {} bytes, limit is {}",
                self.file_name,
                self.len(),
                limits.max_bytes
            )));
        }
        match self.extension() {
            Some(ext) if limits.allowed_extensions.iter().any(|a| a.eq_ignore_ascii_case(&ext)) => {
                Ok(())
            }
            _ => Err(ClientError::InvalidRequest(format!(
                "unsupported file type: {}",
                self.file_name
            ))),
        }
    }

    /// `data:` URL embedding the file, for vision endpoints
    pub fn to_data_url(&self) -> String {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&self.bytes);
        format!("data:{};base64,{}", self.mime, encoded)
    }
}

/// Local service reply to `POST /upload`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub filename: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_fraction() {
        let p = UploadProgress { sent: 50, total: 200 };
        assert_eq!(p.fraction(), 0.25);
        assert_eq!(p.percent(), 25);

        let empty = UploadProgress { sent: 0, total: 0 };
        assert_eq!(empty.percent(), 100);
    }

    #[test]
    fn test_mime_guess() {
        let file = UploadFile::from_bytes("photo.PNG", vec![1, 2, 3]);
        assert_eq!(file.mime, "image/png");
        assert_eq!(file.extension().as_deref(), Some("png"));
    }

    #[test]
    fn test_validation() {
        let limits = UploadLimits::default();

        assert!(UploadFile::from_bytes("a.webp", vec![0; 16]).validate(&limits).is_ok());
        assert!(UploadFile::from_bytes("a.png", vec![]).validate(&limits).is_err());
        assert!(UploadFile::from_bytes("a.txt", vec![0; 16]).validate(&limits).is_err());

        let big = UploadFile::from_bytes("a.jpg", vec![0; (limits.max_bytes + 1) as usize]);
        assert!(big.validate(&limits).is_err());
    }

    #[test]
    fn test_data_url() {
        let file = UploadFile::from_bytes("a.png", b"hi".to_vec());
        assert_eq!(file.to_data_url(), "data:image/png;base64,aGk=");
    }

    #[tokio::test]
    async fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.jpeg");
        std::fs::write(&path, b"jpeg").unwrap();

        let file = UploadFile::from_path(&path).await.unwrap();
        assert_eq!(file.file_name, "shot.jpeg");
        assert_eq!(file.mime, "image/jpeg");
        assert_eq!(file.len(), 4);
    }
}
