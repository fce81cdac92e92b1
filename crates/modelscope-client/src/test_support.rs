/// Scripted transport for unit tests
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ClientError, Result};
use crate::http::{HttpClient, HttpRequest, HttpResponse, Transport};

/// Replays queued responses in order and records every request
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Result<HttpResponse>>>,
    seen: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn json(self: &Arc<Self>, body: Value) -> Arc<Self> {
        self.reply(Ok(HttpResponse::json_body(200, &body)))
    }

    pub fn status(self: &Arc<Self>, status: u16, body: &str) -> Arc<Self> {
        self.reply(Ok(HttpResponse::new(status, body)))
    }

    pub fn error(self: &Arc<Self>, err: ClientError) -> Arc<Self> {
        self.reply(Err(err))
    }

    fn reply(self: &Arc<Self>, reply: Result<HttpResponse>) -> Arc<Self> {
        self.replies.lock().push_back(reply);
        self.clone()
    }

    pub fn client(self: &Arc<Self>) -> HttpClient {
        HttpClient::new(self.clone(), Duration::from_secs(30))
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.seen.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.seen.lock().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let url = request.url.clone();
        self.seen.lock().push(request);
        self.replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(ClientError::Network(format!("no scripted reply for {url}"))))
    }
}
