//! Endpoint definitions and the declarative endpoint tree.
//!
//! A tree is a JSON object. Keys named after an HTTP method declare an
//! endpoint at the current path, `CRUD` declares the five standard resource
//! endpoints, and any other key descends one path segment:
//!
//! ```text
//! {
//!   "todos": "CRUD",                         // todosList, todosCreate, ...
//!   "stats": { "GET": "stats" },             // GET /stats/
//!   "upload": { "POST": { "name": "upload",
//!                         "options": { "type": "form" } } }
//! }
//! ```
//!
//! Registration errors (duplicate names, malformed nodes) are returned from
//! [`EndpointTable::merge`] and never surface later as failed calls.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::ApiError;
use crate::http::HttpMethod;

/// How a non-GET payload is encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyKind {
    #[default]
    Json,
    Form,
}

impl fmt::Display for BodyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyKind::Json => f.write_str("json"),
            BodyKind::Form => f.write_str("form"),
        }
    }
}

/// Per-endpoint defaults, overridable per call.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointOptions {
    #[serde(default, rename = "type")]
    pub kind: BodyKind,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub include: Vec<String>,
}

/// A named request template.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub name: String,
    /// Path template, always ending in `/`, e.g. `/todos/{id}/`.
    pub path: String,
    pub method: HttpMethod,
    pub options: EndpointOptions,
}

/// Names of the endpoints registered for one CRUD resource.
#[derive(Debug, Clone, PartialEq)]
pub struct CrudEndpoints {
    pub list: String,
    pub create: String,
    pub detail: String,
    pub update: String,
    pub remove: String,
}

#[derive(Debug, Clone, Default)]
pub struct EndpointTable {
    endpoints: HashMap<String, Endpoint>,
    crud: HashMap<String, CrudEndpoints>,
}

impl EndpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.get(name)
    }

    pub fn crud(&self, key: &str) -> Option<&CrudEndpoints> {
        self.crud.get(key)
    }

    /// Register every endpoint in `tree`.
    pub fn merge(&mut self, tree: &Value) -> Result<(), ApiError> {
        self.merge_at(tree, "")
    }

    fn merge_at(&mut self, tree: &Value, path: &str) -> Result<(), ApiError> {
        let Value::Object(nodes) = tree else {
            return Err(ApiError::InvalidEndpointTree(format!(
                "expected an object at {:?}",
                if path.is_empty() { "/" } else { path }
            )));
        };
        for (key, node) in nodes {
            match key.as_str() {
                "CRUD" => {
                    let split = path.rfind('/').map_or(0, |i| i + 1);
                    self.add_crud(&path[split..], &path[..split])?;
                }
                "GET" | "POST" | "PUT" | "PATCH" | "DELETE" => {
                    let method: HttpMethod = key.parse()?;
                    let (name, options) = endpoint_entry(node)?;
                    self.add(name, &format!("{path}/"), method, options)?;
                }
                _ if node.as_str() == Some("CRUD") => self.add_crud(key, path)?,
                _ => self.merge_at(node, &format!("{path}/{key}"))?,
            }
        }
        Ok(())
    }

    /// Register one endpoint. A trailing `/` is added to `path` when missing.
    pub fn add(
        &mut self,
        name: String,
        path: &str,
        method: HttpMethod,
        options: EndpointOptions,
    ) -> Result<(), ApiError> {
        if self.endpoints.contains_key(&name) {
            return Err(ApiError::DuplicateEndpoint(name));
        }
        let path = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{path}/")
        };
        self.endpoints.insert(
            name.clone(),
            Endpoint {
                name,
                path,
                method,
                options,
            },
        );
        Ok(())
    }

    fn add_crud(&mut self, key: &str, path: &str) -> Result<(), ApiError> {
        if key.is_empty() {
            return Err(ApiError::InvalidEndpointTree("CRUD needs a resource name".into()));
        }
        let joiner = if path.ends_with('/') { "" } else { "/" };
        let base = format!("{path}{joiner}{key}");
        let detail = format!("{base}/{{id}}");
        let names = CrudEndpoints {
            list: format!("{key}List"),
            create: format!("{key}Create"),
            detail: format!("{key}Get"),
            update: format!("{key}Update"),
            remove: format!("{key}Remove"),
        };
        let defaults = EndpointOptions::default;
        self.add(names.list.clone(), &base, HttpMethod::Get, defaults())?;
        self.add(names.create.clone(), &base, HttpMethod::Post, defaults())?;
        self.add(names.detail.clone(), &detail, HttpMethod::Get, defaults())?;
        self.add(names.update.clone(), &detail, HttpMethod::Patch, defaults())?;
        self.add(names.remove.clone(), &detail, HttpMethod::Delete, defaults())?;
        self.crud.insert(key.to_string(), names);
        Ok(())
    }
}

/// Accepts `"name"` or `{"name": ..., "options": {...}}`.
fn endpoint_entry(node: &Value) -> Result<(String, EndpointOptions), ApiError> {
    match node {
        Value::String(name) => Ok((name.clone(), EndpointOptions::default())),
        Value::Object(fields) => {
            let name = fields
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| ApiError::InvalidEndpointTree("endpoint is missing a name".into()))?;
            let options = match fields.get("options") {
                Some(options) => EndpointOptions::deserialize(options)
                    .map_err(|e| ApiError::InvalidEndpointTree(e.to_string()))?,
                None => EndpointOptions::default(),
            };
            Ok((name.to_string(), options))
        }
        other => Err(ApiError::InvalidEndpointTree(format!(
            "endpoint must be a name or an object, got {other}"
        ))),
    }
}

/// Replace `{name}` terms in `text` with values from `params`.
///
/// Braces that do not enclose a term (`{a{b}`) are copied through.
pub fn supplant(text: &str, params: &BTreeMap<String, String>) -> Result<String, ApiError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        match after.find(['{', '}']) {
            Some(close) if after.as_bytes()[close] == b'}' => {
                let name = &after[..close];
                let value = params
                    .get(name)
                    .ok_or_else(|| ApiError::MissingParam(name.to_string()))?;
                out.push_str(&rest[..open]);
                out.push_str(value);
                rest = &after[close + 1..];
            }
            _ => {
                out.push_str(&rest[..=open]);
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

/// Flatten a JSON object into string pairs in the object's key order;
/// non-objects yield nothing.
pub(crate) fn string_pairs(payload: &Value) -> Vec<(String, String)> {
    payload
        .as_object()
        .map(Map::iter)
        .into_iter()
        .flatten()
        .map(|(k, v)| {
            let value = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), value)
        })
        .collect()
}
