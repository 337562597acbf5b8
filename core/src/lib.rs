//! Client-side request dispatcher with middleware and automatic batching.
//!
//! # Overview
//! An [`Api`] is built from a declarative endpoint tree. Calling an endpoint
//! builds an [`HttpRequest`], runs it through the configured [`Middleware`]
//! chain and resolves with the decoded JSON response. The optional [`Batch`]
//! stage coalesces concurrent calls into one combined request and splits
//! the combined response back to each caller by position.
//!
//! # Design
//! - The crate performs no I/O. A [`Transport`] supplied by the host sends
//!   each request.
//! - Stages return a tagged [`Step`]: ready now, or pending on an exchange.
//!   The synchronous part of a call runs before [`Api::call`] returns.
//! - Scheduler state is owned by the `Batch` value; there are no globals.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use serde_json::json;
//! # use tinyapi_core::{Api, Batch, BatchConfig, CallOptions, Transport};
//! # async fn run(transport: Arc<dyn Transport>) -> Result<(), tinyapi_core::ApiError> {
//! let api = Api::builder(transport)
//!     .merge(json!({ "todos": "CRUD", "stats": { "GET": "stats" } }))?
//!     .middleware(Batch::new(BatchConfig::new("/batch/")))
//!     .build();
//!
//! let todos = api.call("todosList", CallOptions::new())?;
//! let stats = api.call("stats", CallOptions::new())?;
//! // Both calls travel in one POST /batch/.
//! let (todos, stats) = (todos.await?, stats.await?);
//! # let _ = (todos, stats);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod endpoint;
pub mod error;
pub mod headers;
pub mod http;
pub mod middleware;
pub mod query;
pub mod transport;

pub use client::{Api, ApiBuilder, BatchGroup, CallOptions, Crud};
pub use endpoint::{BodyKind, Endpoint, EndpointOptions, EndpointTable};
pub use error::ApiError;
pub use headers::HeaderSettings;
pub use http::{HttpBody, HttpMethod, HttpRequest, HttpResponse};
pub use middleware::chain::ResponseFuture;
pub use middleware::{
    Batch, BatchConfig, BatchResult, Context, GroupKey, Middleware, Outcome, Payload, Stage, Step,
};
pub use query::JsonApiQuery;
pub use transport::{fetch_json, BoxFuture, Transport};
