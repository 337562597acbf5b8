//! Error types for the dispatcher.
//!
//! # Design
//! Three kinds of failure share one enum:
//! - `Transport` means no HTTP response exists at all. A combined batch call
//!   that fails this way rejects every member with a clone of the error.
//! - `Http` means a response arrived with status >= 300. Batch members get one
//!   each, carrying the member's own status, reason and body so callers can
//!   match on them.
//! - Everything else is a programmer or encoding error. Endpoint registration
//!   and template substitution failures are returned synchronously.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// The exchange could not be completed (connect, DNS, I/O).
    #[error("transport failed: {0}")]
    Transport(String),

    /// A response was received but its status indicates failure.
    #[error("HTTP {status}: {body}")]
    Http {
        status: u16,
        reason: Option<String>,
        body: Value,
    },

    /// A response body could not be decoded.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// A request payload could not be encoded.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A `{name}` path template had no matching parameter.
    #[error("missing string template: {0}")]
    MissingParam(String),

    #[error("endpoint {0:?} is already registered")]
    DuplicateEndpoint(String),

    #[error("no endpoint named {0:?}")]
    UnknownEndpoint(String),

    #[error("invalid endpoint data: {0}")]
    InvalidEndpointTree(String),

    /// The combined response had fewer entries than the batch had calls.
    #[error("batch response has no entry for call {index}")]
    MissingBatchEntry { index: usize },

    /// The call's batch group was cleared before it was sent.
    #[error("call was discarded before its batch was sent")]
    Discarded,

    /// Batching was requested outside a Tokio runtime.
    #[error("batching needs a Tokio runtime")]
    NoRuntime,

    /// The chain finished while still holding an unsent request.
    #[error("middleware chain finished without sending the request")]
    NotSent,
}

impl ApiError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn reason_phrase(&self) -> Option<&str> {
        match self {
            ApiError::Http { reason, .. } => reason.as_deref(),
            _ => None,
        }
    }

    pub fn body(&self) -> Option<&Value> {
        match self {
            ApiError::Http { body, .. } => Some(body),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::Serialization(e.to_string())
    }
}
