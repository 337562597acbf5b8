//! The network boundary.
//!
//! The crate never performs I/O itself. A `Transport` executes one exchange
//! and reports either a response (any status) or a transport failure; the
//! `fetch_json` helper turns that into the decoded body callers see.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::ApiError;
use crate::http::{HttpRequest, HttpResponse};

/// A heap-allocated, type-erased future that can move between tasks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Executes a single HTTP exchange.
///
/// Return `Err` only when no response exists. Responses with status >= 300
/// are returned as `Ok` and classified by the caller.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn transmit(&self, request: HttpRequest) -> Result<HttpResponse, ApiError>;
}

/// Send `request` and decode the JSON body. Failed statuses become
/// `ApiError::Http` carrying the parsed body.
pub async fn fetch_json(transport: &dyn Transport, request: HttpRequest) -> Result<Value, ApiError> {
    debug!(method = %request.method, url = %request.url, "transmit");
    let response = transport.transmit(request).await?;
    response.into_json()
}
