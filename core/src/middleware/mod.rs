//! Middleware stages.
//!
//! A stage can rewrite a request before anything is sent (`pre_process`),
//! take over the send or transform whatever the previous stage produced
//! (`process`), and rewrite the settled outcome on the way back
//! (`post_process`). Every method defaults to passing its input through, so
//! a stage implements only what it needs.
//!
//! `process` returns a [`Step`]: either a value that is already available or
//! a future that has started the actual exchange. The chain engine in
//! [`chain`] uses that tag to decide whether the next stage can run
//! immediately or has to wait.
//!
//! The set of stages an [`Api`](crate::Api) runs is a closed enum,
//! [`Middleware`]: the built-in [`Batch`] scheduler or any custom [`Stage`].

pub mod batch;
pub mod chain;

use std::sync::Arc;

use serde_json::Value;

use crate::client::CallOptions;
use crate::endpoint::string_pairs;
use crate::error::ApiError;
use crate::headers::{HeaderSettings, FORM, JSON};
use crate::http::{HttpBody, HttpMethod, HttpRequest};
use crate::transport::{fetch_json, BoxFuture, Transport};

pub use batch::{Batch, BatchConfig, BatchResult, GroupKey};

/// What flows between stages: the request until someone sends it, the
/// decoded response afterwards.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Request(HttpRequest),
    Response(Value),
}

impl Payload {
    /// The decoded response, or `NotSent` if nobody transmitted the request.
    pub fn into_response(self) -> Result<Value, ApiError> {
        match self {
            Payload::Response(value) => Ok(value),
            Payload::Request(_) => Err(ApiError::NotSent),
        }
    }
}

pub type Outcome = Result<Payload, ApiError>;

/// Result of a stage: settled now, or suspended on an in-flight exchange.
pub enum Step {
    Ready(Outcome),
    Pending(BoxFuture<'static, Outcome>),
}

impl Step {
    pub fn ok(payload: Payload) -> Self {
        Step::Ready(Ok(payload))
    }

    /// Wait for the outcome.
    pub async fn settle(self) -> Outcome {
        match self {
            Step::Ready(outcome) => outcome,
            Step::Pending(future) => future.await,
        }
    }
}

/// Shared handles a stage needs to send requests.
#[derive(Clone)]
pub struct Context {
    transport: Arc<dyn Transport>,
    headers: Arc<HeaderSettings>,
}

impl Context {
    pub fn new(transport: Arc<dyn Transport>, headers: Arc<HeaderSettings>) -> Self {
        Self { transport, headers }
    }

    pub fn headers(&self) -> &HeaderSettings {
        &self.headers
    }

    /// POST `payload` to `url` as a JSON document, outside the endpoint
    /// table and the chain. `None` sends `{}`.
    pub async fn post_json(&self, url: &str, payload: Option<&Value>) -> Result<Value, ApiError> {
        let body = match payload {
            Some(payload) => serde_json::to_string(payload)?,
            None => "{}".to_string(),
        };
        let request = HttpRequest {
            method: HttpMethod::Post,
            url: url.to_string(),
            headers: self.headers.headers_for(HttpMethod::Post, JSON),
            body: Some(HttpBody::Text(body)),
        };
        fetch_json(self.transport.as_ref(), request).await
    }

    /// POST the fields of `payload` to `url` as a form.
    pub async fn post_form(&self, url: &str, payload: &Value) -> Result<Value, ApiError> {
        let request = HttpRequest {
            method: HttpMethod::Post,
            url: url.to_string(),
            headers: self.headers.headers_for(HttpMethod::Post, FORM),
            body: Some(HttpBody::Form(string_pairs(payload))),
        };
        fetch_json(self.transport.as_ref(), request).await
    }

    /// Start transmitting `request`; the step settles with the decoded body.
    pub fn submit(&self, request: HttpRequest) -> Step {
        let transport = Arc::clone(&self.transport);
        Step::Pending(Box::pin(async move {
            fetch_json(transport.as_ref(), request)
                .await
                .map(Payload::Response)
        }))
    }
}

/// One unit of the middleware chain.
pub trait Stage: Send + Sync + 'static {
    /// Rewrite the request before the process pass. Runs synchronously, in
    /// declared order.
    fn pre_process(&self, request: HttpRequest, _options: &CallOptions) -> Result<HttpRequest, ApiError> {
        Ok(request)
    }

    /// Transform the payload, or start sending it.
    fn process(&self, _ctx: &Context, payload: Payload, _options: &CallOptions) -> Step {
        Step::ok(payload)
    }

    /// Rewrite the settled outcome. Runs in reverse declared order, over
    /// failures as well as successes.
    fn post_process(&self, outcome: Outcome) -> Step {
        Step::Ready(outcome)
    }

    /// Send `request` through the transport.
    fn submit(&self, ctx: &Context, request: HttpRequest) -> Step {
        ctx.submit(request)
    }
}

/// A configured chain entry.
#[derive(Clone)]
pub enum Middleware {
    Batch(Batch),
    Custom(Arc<dyn Stage>),
}

impl Middleware {
    pub fn custom(stage: impl Stage) -> Self {
        Middleware::Custom(Arc::new(stage))
    }

    pub fn stage(&self) -> &dyn Stage {
        match self {
            Middleware::Batch(batch) => batch as &dyn Stage,
            Middleware::Custom(stage) => stage.as_ref(),
        }
    }
}

impl From<Batch> for Middleware {
    fn from(batch: Batch) -> Self {
        Middleware::Batch(batch)
    }
}
