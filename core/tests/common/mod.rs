//! Scripted in-memory transport shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tinyapi_core::{ApiError, HttpBody, HttpRequest, HttpResponse, Transport};
use tokio::time::Instant;

/// A request the transport received, with the (possibly paused) clock
/// reading at the time.
#[derive(Debug, Clone)]
pub struct Sent {
    pub at: Instant,
    pub request: HttpRequest,
}

/// Replies with queued responses in order, then echoes `{"url": ...}`.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Result<HttpResponse, ApiError>>>,
    sent: Mutex<Vec<Sent>>,
    delay: Duration,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every exchange takes `delay` before replying.
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn reply_json(&self, body: Value) {
        self.reply(HttpResponse::new(200, body.to_string()));
    }

    pub fn reply(&self, response: HttpResponse) {
        self.replies.lock().push_back(Ok(response));
    }

    pub fn fail(&self, message: &str) {
        self.replies
            .lock()
            .push_back(Err(ApiError::Transport(message.to_string())));
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    /// JSON body of the `index`th request.
    pub fn body(&self, index: usize) -> Value {
        match &self.sent.lock()[index].request.body {
            Some(HttpBody::Text(text)) => serde_json::from_str(text).unwrap(),
            other => panic!("request {index} has no JSON body: {other:?}"),
        }
    }

    /// URLs inside the `index`th combined request.
    pub fn batched_urls(&self, index: usize) -> Vec<String> {
        self.body(index)["batch"]
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| entry["url"].as_str().unwrap().to_string())
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn transmit(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        let url = request.url.clone();
        self.sent.lock().push(Sent {
            at: Instant::now(),
            request,
        });
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self.replies.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(HttpResponse::new(200, json!({ "url": url }).to_string())))
    }
}
