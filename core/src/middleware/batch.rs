//! Automatic request batching.
//!
//! # Design
//! Calls are collected into groups keyed by [`GroupKey`]. The implicit
//! `Auto` group is flushed when it reaches `maximum` calls or when the quiet
//! timer armed by its first call fires, whichever comes first. The timer is
//! never re-armed by later calls, so it bounds worst-case latency. Explicit
//! groups have neither cap nor timer and are flushed only by [`Batch::send`].
//!
//! Flushing removes the bucket from the table inside the same critical
//! section that decided to flush, and only then transmits. A call that
//! arrives while the combined request is in flight starts a new bucket under
//! the same key. Each bucket carries a generation number and a timer only
//! flushes the generation that armed it, so a timer that lost the race with
//! a cap flush does nothing.
//!
//! The combined response is split positionally: entry `i` settles call `i`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::client::CallOptions;
use crate::error::ApiError;
use crate::headers::JSON;
use crate::http::{HttpBody, HttpMethod, HttpRequest};
use crate::middleware::{Context, Payload, Stage, Step};
use crate::transport::BoxFuture;

/// Outcome of one batched call.
pub type BatchResult = Result<Value, ApiError>;

fn default_maximum() -> usize {
    20
}

fn default_true() -> bool {
    true
}

/// Batch scheduler settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BatchConfig {
    /// Endpoint that receives combined requests.
    pub batch_url: String,
    /// Endpoint for combined requests containing a POST, PUT or PATCH.
    #[serde(default)]
    pub mutable_batch_url: Option<String>,
    /// Size at which the auto group flushes immediately.
    #[serde(default = "default_maximum")]
    pub maximum: usize,
    /// Quiet period before the auto group flushes, in milliseconds.
    #[serde(default)]
    pub timeout_ms: u64,
    /// Whether a single mutating call is also routed to `mutable_batch_url`.
    #[serde(default = "default_true")]
    pub route_single_mutations: bool,
}

impl BatchConfig {
    pub fn new(batch_url: impl Into<String>) -> Self {
        Self {
            batch_url: batch_url.into(),
            mutable_batch_url: None,
            maximum: default_maximum(),
            timeout_ms: 0,
            route_single_mutations: true,
        }
    }

    pub fn mutable_batch_url(mut self, url: impl Into<String>) -> Self {
        self.mutable_batch_url = Some(url.into());
        self
    }

    pub fn maximum(mut self, maximum: usize) -> Self {
        self.maximum = maximum;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn route_single_mutations(mut self, enabled: bool) -> Self {
        self.route_single_mutations = enabled;
        self
    }

    fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Identifies a batch group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupKey {
    Auto,
    Explicit(Uuid),
}

impl GroupKey {
    /// A fresh explicit group.
    pub fn explicit() -> Self {
        GroupKey::Explicit(Uuid::new_v4())
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::Auto => f.write_str("auto"),
            GroupKey::Explicit(id) => write!(f, "{id}"),
        }
    }
}

struct PendingCall {
    request: HttpRequest,
    reply: oneshot::Sender<BatchResult>,
}

struct Bucket {
    generation: u64,
    calls: Vec<PendingCall>,
    timer: Option<AbortHandle>,
}

struct Shared {
    config: BatchConfig,
    groups: Mutex<HashMap<GroupKey, Bucket>>,
    generations: AtomicU64,
}

/// The batching middleware. Cloning yields another handle to the same
/// group table.
#[derive(Clone)]
pub struct Batch {
    inner: Arc<Shared>,
}

impl Batch {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            inner: Arc::new(Shared {
                config,
                groups: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Number of calls waiting in `key`.
    pub fn queued(&self, key: GroupKey) -> usize {
        self.inner
            .groups
            .lock()
            .get(&key)
            .map_or(0, |bucket| bucket.calls.len())
    }

    /// Number of groups currently accumulating.
    pub fn group_count(&self) -> usize {
        self.inner.groups.lock().len()
    }

    /// Place `request` into its group, or send it straight away when
    /// `skip_batching` is set.
    ///
    /// Flushes and timers are spawned on the current Tokio runtime. Outside
    /// one the call is not queued and fails with `ApiError::NoRuntime`.
    pub fn enqueue(&self, ctx: &Context, request: HttpRequest, options: &CallOptions) -> Step {
        if options.skip_batching {
            debug!(url = %request.url, "batching skipped");
            return self.submit(ctx, request);
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!(url = %request.url, "no Tokio runtime, call not batched");
            return Step::Ready(Err(ApiError::NoRuntime));
        };

        let key = options.group.map_or(GroupKey::Auto, GroupKey::Explicit);
        let (reply, receiver) = oneshot::channel();
        let full = {
            let mut groups = self.inner.groups.lock();
            let bucket = groups
                .entry(key)
                .or_insert_with(|| Bucket::new(self.inner.generations.fetch_add(1, Ordering::Relaxed)));
            bucket.calls.push(PendingCall { request, reply });
            debug!(group = %key, queued = bucket.calls.len(), "call enqueued");

            if key != GroupKey::Auto {
                None
            } else if bucket.calls.len() >= self.inner.config.maximum.max(1) {
                groups.remove(&key)
            } else {
                if bucket.timer.is_none() {
                    bucket.timer = Some(self.arm_timer(&runtime, ctx, bucket.generation));
                }
                None
            }
        };

        if let Some(bucket) = full {
            if let Some(timer) = bucket.timer {
                timer.abort();
            }
            debug!(size = bucket.calls.len(), "auto group full, flushing");
            let batch = self.clone();
            let ctx = ctx.clone();
            runtime.spawn(async move {
                batch.flush(&ctx, bucket.calls).await;
            });
        }

        Step::Pending(Box::pin(async move {
            match receiver.await {
                Ok(result) => result.map(Payload::Response),
                Err(_) => Err(ApiError::Discarded),
            }
        }))
    }

    /// Flush `key` now. Resolves with every member's outcome in call order;
    /// an absent or empty group resolves with an empty list and sends nothing.
    ///
    /// The group is closed when `send` is called, not when the returned
    /// future is first polled.
    pub fn send(&self, ctx: &Context, key: GroupKey) -> BoxFuture<'static, Vec<BatchResult>> {
        let calls = match self.take(key, None) {
            Some(bucket) => {
                if let Some(timer) = bucket.timer {
                    timer.abort();
                }
                bucket.calls
            }
            None => Vec::new(),
        };
        let batch = self.clone();
        let ctx = ctx.clone();
        Box::pin(async move { batch.flush(&ctx, calls).await })
    }

    /// Drop every call waiting in `key` without sending anything. Each
    /// abandoned call resolves with `ApiError::Discarded`. Returns how many
    /// calls were dropped.
    pub fn clear(&self, key: GroupKey) -> usize {
        let Some(bucket) = self.take(key, None) else {
            return 0;
        };
        if let Some(timer) = bucket.timer {
            timer.abort();
        }
        debug!(group = %key, dropped = bucket.calls.len(), "group cleared");
        bucket.calls.len()
    }

    /// Remove `key` from the table. With `generation` set, only a bucket of
    /// that generation is removed.
    fn take(&self, key: GroupKey, generation: Option<u64>) -> Option<Bucket> {
        let mut groups = self.inner.groups.lock();
        let current = groups
            .get(&key)
            .is_some_and(|bucket| generation.map_or(true, |g| g == bucket.generation));
        if !current {
            return None;
        }
        groups.remove(&key)
    }

    fn arm_timer(&self, runtime: &Handle, ctx: &Context, generation: u64) -> AbortHandle {
        let batch = self.clone();
        let ctx = ctx.clone();
        let quiet_period = self.inner.config.quiet_period();
        runtime.spawn(async move {
            tokio::time::sleep(quiet_period).await;
            // The bucket's handle is this task; dropping it does not abort.
            if let Some(bucket) = batch.take(GroupKey::Auto, Some(generation)) {
                debug!(size = bucket.calls.len(), "quiet period elapsed, flushing");
                batch.flush(&ctx, bucket.calls).await;
            }
        })
        .abort_handle()
    }

    async fn flush(&self, ctx: &Context, calls: Vec<PendingCall>) -> Vec<BatchResult> {
        if calls.is_empty() {
            return Vec::new();
        }
        let (requests, replies): (Vec<_>, Vec<_>) =
            calls.into_iter().map(|call| (call.request, call.reply)).unzip();

        let results = match self.combine(ctx, &requests) {
            Ok(combined) => {
                debug!(url = %combined.url, size = requests.len(), "sending combined request");
                let outcome = self
                    .submit(ctx, combined)
                    .settle()
                    .await
                    .and_then(Payload::into_response);
                match outcome {
                    Ok(body) => split(&body, requests.len()),
                    Err(e) => {
                        warn!(error = %e, size = requests.len(), "combined request failed");
                        vec![Err(e); requests.len()]
                    }
                }
            }
            Err(e) => vec![Err(e); requests.len()],
        };

        for (reply, result) in replies.into_iter().zip(&results) {
            // The caller may have stopped waiting.
            let _ = reply.send(result.clone());
        }
        results
    }

    fn combine(&self, ctx: &Context, requests: &[HttpRequest]) -> Result<HttpRequest, ApiError> {
        let entries: Vec<Value> = requests.iter().map(HttpRequest::to_batch_entry).collect();
        let body = serde_json::to_string(&json!({ "batch": entries }))?;
        Ok(HttpRequest {
            method: HttpMethod::Post,
            url: self.select_url(requests).to_string(),
            headers: ctx.headers().headers_for(HttpMethod::Post, JSON),
            body: Some(HttpBody::Text(body)),
        })
    }

    fn select_url(&self, requests: &[HttpRequest]) -> &str {
        let config = &self.inner.config;
        let eligible = config.route_single_mutations || requests.len() > 1;
        match &config.mutable_batch_url {
            Some(url)
                if eligible
                    && *url != config.batch_url
                    && requests.iter().any(|r| r.method.is_mutating()) =>
            {
                url
            }
            _ => &config.batch_url,
        }
    }
}

impl Bucket {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            calls: Vec::new(),
            timer: None,
        }
    }
}

impl Stage for Batch {
    fn process(&self, ctx: &Context, payload: Payload, options: &CallOptions) -> Step {
        match payload {
            Payload::Request(request) => self.enqueue(ctx, request, options),
            response => Step::ok(response),
        }
    }
}

/// One element of a combined response.
///
/// Fields are read one at a time: an odd value in one field must not hide
/// the status of the call.
#[derive(Debug)]
struct BatchReply {
    status: Option<f64>,
    reason: Option<String>,
    body: Option<Value>,
}

impl BatchReply {
    fn parse(entry: &Value) -> Result<Self, ApiError> {
        let Value::Object(fields) = entry else {
            return Err(ApiError::Deserialization(format!(
                "batch entry is not an object: {entry}"
            )));
        };
        let status = match field(fields, "status_code", "statusCode") {
            None => None,
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(text)) => Some(
                text.trim()
                    .parse::<f64>()
                    .map_err(|_| malformed_status(&Value::String(text.clone())))?,
            ),
            Some(other) => return Err(malformed_status(other)),
        };
        if let Some(code) = status {
            if !code.is_finite() || code < 0.0 {
                return Err(malformed_status(&json!(code)));
            }
        }
        let reason = field(fields, "reason_phrase", "reasonPhrase").map(|value| match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        });
        Ok(Self {
            status,
            reason,
            body: fields.get("body").filter(|body| !body.is_null()).cloned(),
        })
    }

    /// The status when it marks a failure. Float codes are truncated and
    /// codes beyond `u16` saturate.
    fn failed_status(&self) -> Option<u16> {
        self.status
            .filter(|code| *code >= 300.0)
            .map(|code| code as u16)
    }
}

/// `snake` or its `camel` alias, ignoring nulls.
fn field<'a>(fields: &'a Map<String, Value>, snake: &str, camel: &str) -> Option<&'a Value> {
    fields
        .get(snake)
        .or_else(|| fields.get(camel))
        .filter(|value| !value.is_null())
}

fn malformed_status(value: &Value) -> ApiError {
    ApiError::Deserialization(format!("batch entry has an unreadable status code: {value}"))
}

/// Split a combined response into `expected` per-call outcomes.
///
/// Accepts a bare array or a `{"data": [...]}` envelope.
fn split(body: &Value, expected: usize) -> Vec<BatchResult> {
    let (entries, enveloped) = match body {
        Value::Array(entries) => (entries, false),
        Value::Object(map) => match map.get("data") {
            Some(Value::Array(entries)) => (entries, true),
            _ => return vec![Err(unexpected_shape()); expected],
        },
        _ => return vec![Err(unexpected_shape()); expected],
    };
    (0..expected)
        .map(|index| match entries.get(index) {
            Some(entry) if enveloped => split_enveloped(entry),
            Some(entry) => split_flat(entry),
            None => Err(ApiError::MissingBatchEntry { index }),
        })
        .collect()
}

fn unexpected_shape() -> ApiError {
    ApiError::Deserialization("combined response is neither an array nor a data envelope".into())
}

fn split_flat(entry: &Value) -> BatchResult {
    let reply = BatchReply::parse(entry)?;
    match reply.failed_status() {
        Some(status) => Err(ApiError::Http {
            status,
            reason: reply.reason,
            body: reply.body.unwrap_or(Value::Null),
        }),
        None => Ok(reply.body.unwrap_or(Value::Null)),
    }
}

fn split_enveloped(entry: &Value) -> BatchResult {
    let reply = BatchReply::parse(entry)?;
    match reply.failed_status() {
        Some(status) => {
            let reason = reply.reason;
            let data = reply
                .body
                .unwrap_or_else(|| json!({ "errors": { "detail": reason.clone() } }));
            Err(ApiError::Http {
                status,
                reason,
                body: json!({ "response": entry, "data": data }),
            })
        }
        None => Ok(json!({
            "response": entry,
            "data": reply.body.unwrap_or(Value::Null),
        })),
    }
}
