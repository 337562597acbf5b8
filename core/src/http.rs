//! HTTP request and response descriptors.
//!
//! # Design
//! Requests and responses are plain data. The dispatcher builds an
//! `HttpRequest`, middleware stages move it through the chain by value, and a
//! `Transport` turns it into an `HttpResponse`. Nothing in this module touches
//! the network.
//!
//! Stages never mutate a request another stage still holds: every rewrite
//! consumes the old descriptor and returns a new one.

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::ApiError;

/// HTTP method for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    /// Returns the uppercase wire representation (e.g. `"GET"`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }

    /// Methods that change server state and may need the mutable batch endpoint.
    pub fn is_mutating(self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Patch)
    }

    /// Methods that never carry a CSRF token or a request body.
    pub fn is_safe(self) -> bool {
        matches!(self, Self::Get | Self::Head | Self::Options)
    }
}

/// Parses a method name, ignoring ASCII case.
impl FromStr for HttpMethod {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            "HEAD" => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            other => Err(ApiError::InvalidEndpointTree(format!("unknown method {other:?}"))),
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for HttpMethod {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Request payload.
#[derive(Debug, Clone, PartialEq)]
pub enum HttpBody {
    /// Already-encoded text, usually a JSON document.
    Text(String),
    /// Form fields in submission order.
    Form(Vec<(String, String)>),
}

impl HttpBody {
    /// JSON projection used inside a combined batch request.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Text(text) => Value::String(text.clone()),
            Self::Form(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            ),
        }
    }
}

/// An HTTP request described as plain data.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<HttpBody>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns a copy with `name` set to `value`, replacing any existing entry.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
        self
    }

    /// The `{url, method, headers?, body?}` entry this request contributes to
    /// a combined batch body. Empty headers and absent bodies are omitted.
    pub fn to_batch_entry(&self) -> Value {
        let mut entry = Map::new();
        entry.insert("url".into(), Value::String(self.url.clone()));
        entry.insert("method".into(), Value::String(self.method.as_str().into()));
        if !self.headers.is_empty() {
            let headers = self
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            entry.insert("headers".into(), Value::Object(headers));
        }
        if let Some(body) = &self.body {
            entry.insert("body".into(), body.to_json());
        }
        Value::Object(entry)
    }
}

/// An HTTP response described as plain data.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            reason: None,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Anything at or above 300 is a logical failure.
    pub fn is_success(&self) -> bool {
        self.status < 300
    }

    /// Decode the body as JSON.
    ///
    /// A failed status becomes `ApiError::Http` carrying the parsed body, or
    /// `{"status": <code>}` when the body is not JSON. `204` and empty
    /// successful bodies decode to `{}`.
    pub fn into_json(self) -> Result<Value, ApiError> {
        if !self.is_success() {
            let body = serde_json::from_str(&self.body)
                .unwrap_or_else(|_| serde_json::json!({ "status": self.status }));
            return Err(ApiError::Http {
                status: self.status,
                reason: self.reason,
                body,
            });
        }
        if self.status == 204 || self.body.trim().is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        serde_json::from_str(&self.body).map_err(|e| ApiError::Deserialization(e.to_string()))
    }
}
