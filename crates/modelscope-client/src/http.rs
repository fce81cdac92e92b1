/// HTTP client wrapper
///
/// Every call goes through a [`Transport`], so the task client and the
/// pipeline can run against reqwest in production and a scripted transport in
/// tests. [`HttpClient`] adds the fixed timeout, the default JSON content type,
/// status checking and JSON decoding on top.
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::upload::{ProgressFn, UploadFile, UploadProgress};

const USER_AGENT: &str = concat!("modelscope-client/", env!("CARGO_PKG_VERSION"));

/// Upload bodies are streamed in chunks of this size for progress reporting
const UPLOAD_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
        }
    }
}

/// Multipart form with an optional `file` part and plain text fields
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultipartForm {
    pub file: Option<UploadFile>,
    pub fields: Vec<(String, String)>,
}

impl MultipartForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, file: UploadFile) -> Self {
        self.file = Some(file);
        self
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Multipart(MultipartForm),
}

/// A single outgoing request
#[derive(Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    pub progress: Option<ProgressFn>,
}

impl std::fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .finish()
    }
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
            progress: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn headers(mut self, headers: &[(&str, &str)]) -> Self {
        for (name, value) in headers {
            self.headers.push((name.to_string(), value.to_string()));
        }
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn multipart(mut self, form: MultipartForm) -> Self {
        self.body = RequestBody::Multipart(form);
        self
    }

    pub fn on_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Case-insensitive header lookup
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Add `name: value` unless the caller already set that header
    fn default_header(&mut self, name: &str, value: &str) {
        if self.header_value(name).is_none() {
            self.headers.push((name.to_string(), value.to_string()));
        }
    }
}

/// Raw response as returned by a transport
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            status_text: String::new(),
            body: body.into(),
        }
    }

    pub fn json_body(status: u16, body: &Value) -> Self {
        Self::new(status, body.to_string())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Result<Value> {
        serde_json::from_slice(&self.body).map_err(|e| {
            ClientError::InvalidResponse(format!("response body is not JSON: {e}"))
        })
    }
}

/// Sends requests over the wire
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// reqwest-backed transport with a cookie store, so session-based endpoints of
/// the local service work across calls
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .cookie_store(true)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }

    fn file_part(file: UploadFile, progress: Option<ProgressFn>) -> Result<reqwest::multipart::Part> {
        let total = file.len();
        let chunks: Vec<Vec<u8>> = file.bytes.chunks(UPLOAD_CHUNK).map(<[u8]>::to_vec).collect();
        let mut sent = 0u64;
        let stream = futures_util::stream::iter(chunks.into_iter().map(move |chunk| {
            sent += chunk.len() as u64;
            if let Some(progress) = &progress {
                progress(UploadProgress { sent, total });
            }
            Ok::<_, std::io::Error>(chunk)
        }));

        let part = reqwest::multipart::Part::stream_with_length(
            reqwest::Body::wrap_stream(stream),
            total,
        )
        .file_name(file.file_name)
        .mime_str(&file.mime)?;
        Ok(part)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.body(serde_json::to_vec(&value)?),
            RequestBody::Multipart(form) => {
                let mut multipart = reqwest::multipart::Form::new();
                for (name, value) in form.fields {
                    multipart = multipart.text(name, value);
                }
                if let Some(file) = form.file {
                    multipart = multipart.part("file", Self::file_part(file, request.progress)?);
                }
                builder.multipart(multipart)
            }
        };

        let response = builder.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        Ok(HttpResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            body: body.to_vec(),
        })
    }
}

/// Request/timeout wrapper shared by every backend
#[derive(Clone)]
pub struct HttpClient {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Client over a fresh reqwest transport
    pub fn reqwest(timeout: Duration) -> Result<Self> {
        Ok(Self::new(Arc::new(ReqwestTransport::new()?), timeout))
    }

    /// Same transport, different deadline
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            transport: self.transport.clone(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a request and check its status.
    ///
    /// Fails with `Timeout` past the deadline (the in-flight call is dropped),
    /// `Network` on transport failure and `Http` on a non-2xx status.
    pub async fn send(&self, mut request: HttpRequest) -> Result<HttpResponse> {
        if !matches!(request.body, RequestBody::Multipart(_)) {
            request.default_header("Content-Type", "application/json");
        }

        let method = request.method;
        let url = request.url.clone();
        debug!("{} {}", method, url);

        let response = tokio::time::timeout(self.timeout, self.transport.execute(request))
            .await
            .map_err(|_| {
                ClientError::Timeout(format!(
                    "{} {} exceeded {} ms",
                    method,
                    url,
                    self.timeout.as_millis()
                ))
            })??;

        if !response.is_success() {
            let text = response.text();
            let message = if text.trim().is_empty() {
                response.status_text.clone()
            } else {
                text.trim().to_string()
            };
            return Err(ClientError::Http {
                status: response.status,
                message,
            });
        }

        Ok(response)
    }

    /// Send a request and decode the JSON body
    pub async fn request(&self, request: HttpRequest) -> Result<Value> {
        self.send(request).await?.json()
    }

    pub async fn get_json(&self, url: &str, headers: &[(&str, &str)]) -> Result<Value> {
        self.request(HttpRequest::get(url).headers(headers)).await
    }

    pub async fn post_json<B: Serialize>(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &B,
    ) -> Result<Value> {
        let body = serde_json::to_value(body)?;
        self.request(HttpRequest::post(url).headers(headers).json(body))
            .await
    }

    /// Multipart upload of `file` plus text `fields`, reporting byte progress.
    pub async fn upload_file(
        &self,
        url: &str,
        file: UploadFile,
        fields: Vec<(String, String)>,
        on_progress: Option<ProgressFn>,
    ) -> Result<Value> {
        let mut form = MultipartForm::new().file(file);
        form.fields = fields;

        let mut request = HttpRequest::post(url).multipart(form);
        if let Some(progress) = on_progress {
            request = request.on_progress(progress);
        }
        self.request(request).await
    }
}

/// Join a base URL and a path with exactly one slash between them
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
