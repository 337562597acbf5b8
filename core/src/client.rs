//! The dispatcher: endpoint lookup, request building and chain execution.
//!
//! # Design
//! `Api` is an immutable, cheaply cloneable handle built by `ApiBuilder`. A
//! call resolves an endpoint by name, builds an `HttpRequest` from the
//! endpoint template and the per-call `CallOptions`, then hands it to the
//! middleware chain. Programmer errors (unknown endpoint, missing path
//! parameter) come back from `call` itself; everything the network decides
//! comes back through the returned future.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::endpoint::{string_pairs, supplant, BodyKind, CrudEndpoints, Endpoint, EndpointTable};
use crate::error::ApiError;
use crate::headers::{HeaderSettings, FORM, JSON};
use crate::http::{HttpBody, HttpMethod, HttpRequest};
use crate::middleware::chain::{dispatch, ResponseFuture};
use crate::middleware::{Batch, BatchResult, Context, GroupKey, Middleware};
use crate::query::JsonApiQuery;
use crate::transport::{BoxFuture, Transport};

/// Per-call settings. Anything left unset falls back to the endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallOptions {
    pub method: Option<HttpMethod>,
    /// Values for `{name}` terms in the endpoint path.
    pub params: BTreeMap<String, String>,
    /// Query parameters for GET, the body otherwise.
    pub payload: Option<Value>,
    pub kind: Option<BodyKind>,
    pub content_type: Option<String>,
    pub include: Vec<String>,
    pub sort: Vec<String>,
    pub filter: BTreeMap<String, String>,
    /// Prefix for the endpoint path, e.g. `http://localhost:3000`.
    pub url_root: Option<String>,
    /// Send this call on its own even when batching is configured.
    pub skip_batching: bool,
    /// Explicit batch group this call belongs to.
    pub group: Option<Uuid>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn kind(mut self, kind: BodyKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn include<I, S>(mut self, include: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include = include.into_iter().map(Into::into).collect();
        self
    }

    pub fn sort<I, S>(mut self, sort: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sort = sort.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter(mut self, attr: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter.insert(attr.into(), value.into());
        self
    }

    pub fn url_root(mut self, root: impl Into<String>) -> Self {
        self.url_root = Some(root.into());
        self
    }

    pub fn skip_batching(mut self) -> Self {
        self.skip_batching = true;
        self
    }

    pub fn group(mut self, group: Uuid) -> Self {
        self.group = Some(group);
        self
    }
}

/// Collects endpoints, middleware and header settings for an [`Api`].
pub struct ApiBuilder {
    endpoints: EndpointTable,
    stages: Vec<Middleware>,
    transport: Arc<dyn Transport>,
    headers: HeaderSettings,
}

impl ApiBuilder {
    /// Register the endpoints described by `tree`.
    pub fn merge(mut self, tree: Value) -> Result<Self, ApiError> {
        self.endpoints.merge(&tree)?;
        Ok(self)
    }

    /// Append a stage to the chain.
    pub fn middleware(mut self, middleware: impl Into<Middleware>) -> Self {
        self.stages.push(middleware.into());
        self
    }

    pub fn headers(mut self, headers: HeaderSettings) -> Self {
        self.headers = headers;
        self
    }

    pub fn build(self) -> Api {
        Api {
            inner: Arc::new(ApiInner {
                endpoints: self.endpoints,
                stages: self.stages.into(),
                ctx: Context::new(self.transport, Arc::new(self.headers)),
            }),
        }
    }
}

struct ApiInner {
    endpoints: EndpointTable,
    stages: Arc<[Middleware]>,
    ctx: Context,
}

/// A configured API client.
#[derive(Clone)]
pub struct Api {
    inner: Arc<ApiInner>,
}

impl Api {
    pub fn builder(transport: Arc<dyn Transport>) -> ApiBuilder {
        ApiBuilder {
            endpoints: EndpointTable::new(),
            stages: Vec::new(),
            transport,
            headers: HeaderSettings::default(),
        }
    }

    /// An API with the endpoints in `tree` and no middleware.
    pub fn new(tree: Value, transport: Arc<dyn Transport>) -> Result<Self, ApiError> {
        Ok(Self::builder(transport).merge(tree)?.build())
    }

    pub fn endpoint(&self, name: &str) -> Option<&Endpoint> {
        self.inner.endpoints.get(name)
    }

    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    /// Build the request descriptor for calling `name` with `options`.
    pub fn request(&self, name: &str, options: &CallOptions) -> Result<HttpRequest, ApiError> {
        let endpoint = self
            .endpoint(name)
            .ok_or_else(|| ApiError::UnknownEndpoint(name.to_string()))?;
        let method = options.method.unwrap_or(endpoint.method);
        let kind = options.kind.unwrap_or(endpoint.options.kind);

        let mut initial = Vec::new();
        let mut body = None;
        if let Some(payload) = &options.payload {
            if method == HttpMethod::Get {
                initial.extend(
                    string_pairs(payload)
                        .into_iter()
                        .map(|(k, v)| format!("{k}={}", urlencoding::encode(&v))),
                );
            } else if kind == BodyKind::Form {
                body = Some(HttpBody::Form(string_pairs(payload)));
            } else {
                body = Some(HttpBody::Text(serde_json::to_string(payload)?));
            }
        }

        let include = if options.include.is_empty() {
            endpoint.options.include.clone()
        } else {
            options.include.clone()
        };
        let query = JsonApiQuery {
            initial,
            include,
            filter: options.filter.clone(),
            sort: options.sort.clone(),
        };

        let mut url = supplant(&endpoint.path, &options.params)?;
        url.push_str(&query.to_query_string());
        if let Some(root) = &options.url_root {
            url = format!("{}{url}", root.trim_end_matches('/'));
        }

        let default_type = match kind {
            BodyKind::Json => JSON,
            BodyKind::Form => FORM,
        };
        let content_type = options
            .content_type
            .as_deref()
            .or(endpoint.options.content_type.as_deref())
            .unwrap_or(default_type);

        debug!("API {method} {kind}: {url}");
        Ok(HttpRequest {
            method,
            url,
            headers: self.inner.ctx.headers().headers_for(method, content_type),
            body,
        })
    }

    /// Call endpoint `name`.
    ///
    /// The request is built and run through every synchronous stage before
    /// this returns, so a batched call has already joined its group.
    pub fn call(&self, name: &str, options: CallOptions) -> Result<ResponseFuture, ApiError> {
        let request = self.request(name, &options)?;
        dispatch(
            Arc::clone(&self.inner.stages),
            self.inner.ctx.clone(),
            request,
            options,
        )
    }

    /// POST a JSON document to an arbitrary URL. See [`Context::post_json`].
    pub async fn post_json(&self, url: &str, payload: Option<&Value>) -> Result<Value, ApiError> {
        self.inner.ctx.post_json(url, payload).await
    }

    /// POST form fields to an arbitrary URL. See [`Context::post_form`].
    pub async fn post_form(&self, url: &str, payload: &Value) -> Result<Value, ApiError> {
        self.inner.ctx.post_form(url, payload).await
    }

    /// CRUD helpers for a resource registered with `CRUD`.
    pub fn crud(&self, key: &str) -> Option<Crud<'_>> {
        self.inner
            .endpoints
            .crud(key)
            .map(|names| Crud { api: self, names })
    }

    /// The batch stage, if one is configured.
    pub fn batcher(&self) -> Option<&Batch> {
        self.inner.stages.iter().find_map(|middleware| match middleware {
            Middleware::Batch(batch) => Some(batch),
            Middleware::Custom(_) => None,
        })
    }

    /// Start an explicit batch group. `None` without a batch stage.
    pub fn batch(&self) -> Option<BatchGroup> {
        let batch = self.batcher()?.clone();
        Some(BatchGroup {
            api: self.clone(),
            batch,
            id: Uuid::new_v4(),
        })
    }
}

/// Calls for one CRUD resource.
pub struct Crud<'a> {
    api: &'a Api,
    names: &'a CrudEndpoints,
}

impl Crud<'_> {
    pub fn list(&self, options: CallOptions) -> Result<ResponseFuture, ApiError> {
        self.api.call(&self.names.list, options)
    }

    pub fn create(&self, payload: Value, options: CallOptions) -> Result<ResponseFuture, ApiError> {
        self.api.call(&self.names.create, options.payload(payload))
    }

    pub fn detail(&self, id: impl ToString, options: CallOptions) -> Result<ResponseFuture, ApiError> {
        self.api.call(&self.names.detail, options.param("id", id))
    }

    pub fn update(
        &self,
        id: impl ToString,
        payload: Value,
        options: CallOptions,
    ) -> Result<ResponseFuture, ApiError> {
        self.api
            .call(&self.names.update, options.param("id", id).payload(payload))
    }

    pub fn remove(&self, id: impl ToString, options: CallOptions) -> Result<ResponseFuture, ApiError> {
        self.api.call(&self.names.remove, options.param("id", id))
    }
}

/// An explicit batch group: calls made through it wait until [`send`].
///
/// [`send`]: BatchGroup::send
pub struct BatchGroup {
    api: Api,
    batch: Batch,
    id: Uuid,
}

impl BatchGroup {
    pub fn id(&self) -> Uuid {
        self.id
    }

    fn key(&self) -> GroupKey {
        GroupKey::Explicit(self.id)
    }

    /// Call `name` as a member of this group.
    pub fn call(&self, name: &str, options: CallOptions) -> Result<ResponseFuture, ApiError> {
        self.api.call(name, options.group(self.id))
    }

    /// Number of calls waiting to be sent.
    pub fn queued(&self) -> usize {
        self.batch.queued(self.key())
    }

    /// Send every queued call as one combined request. Resolves with each
    /// call's outcome in call order. The group can be reused afterwards.
    pub fn send(&self) -> BoxFuture<'static, Vec<BatchResult>> {
        self.batch.send(self.api.context(), self.key())
    }

    /// Drop queued calls without sending them; they resolve with
    /// `ApiError::Discarded`.
    pub fn clear(&self) -> usize {
        self.batch.clear(self.key())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::http::HttpResponse;
    use crate::middleware::BatchConfig;

    struct Offline;

    #[async_trait]
    impl Transport for Offline {
        async fn transmit(&self, _request: HttpRequest) -> Result<HttpResponse, ApiError> {
            Err(ApiError::Transport("offline".into()))
        }
    }

    fn api() -> Api {
        Api::builder(Arc::new(Offline))
            .merge(json!({
                "todos": "CRUD",
                "A": { "GET": { "name": "a", "options": { "include": ["owner"] } } },
                "upload": { "POST": { "name": "upload", "options": { "type": "form" } } },
            }))
            .unwrap()
            .headers(HeaderSettings {
                csrf: Some("tok".into()),
                bearer: None,
            })
            .build()
    }

    #[test]
    fn get_payload_becomes_query_string() {
        let req = api()
            .request("todosList", &CallOptions::new().payload(json!({ "q": "a b" })))
            .unwrap();
        assert_eq!(req.method, HttpMethod::Get);
        assert_eq!(req.url, "/todos/?q=a%20b");
        assert!(req.body.is_none());
    }

    #[test]
    fn json_payload_becomes_text_body() {
        let req = api()
            .request("todosCreate", &CallOptions::new().payload(json!({ "title": "x" })))
            .unwrap();
        assert_eq!(req.method, HttpMethod::Post);
        let Some(HttpBody::Text(text)) = &req.body else {
            panic!("expected a text body");
        };
        let body: Value = serde_json::from_str(text).unwrap();
        assert_eq!(body, json!({ "title": "x" }));
        assert_eq!(req.header("Content-Type"), Some(JSON));
        assert_eq!(req.header("X-CSRFToken"), Some("tok"));
    }

    #[test]
    fn form_endpoints_send_fields() {
        let req = api()
            .request("upload", &CallOptions::new().payload(json!({ "name": "f" })))
            .unwrap();
        assert_eq!(req.body, Some(HttpBody::Form(vec![("name".into(), "f".into())])));
        assert_eq!(req.header("Content-Type"), Some(FORM));
    }

    #[test]
    fn fields_and_query_pairs_keep_submission_order() {
        let api = api();
        let payload = json!({ "zeta": "1", "alpha": "2" });
        let form = api
            .request("upload", &CallOptions::new().payload(payload.clone()))
            .unwrap();
        assert_eq!(
            form.body,
            Some(HttpBody::Form(vec![
                ("zeta".into(), "1".into()),
                ("alpha".into(), "2".into()),
            ]))
        );
        let get = api
            .request("todosList", &CallOptions::new().payload(payload))
            .unwrap();
        assert_eq!(get.url, "/todos/?zeta=1&alpha=2");
    }

    #[test]
    fn get_payload_comes_before_json_api_parts() {
        let req = api()
            .request("a", &CallOptions::new().payload(json!({ "page": 2 })).sort(["-id"]))
            .unwrap();
        assert_eq!(req.url, "/A/?page=2&include=owner&sort=-id");
    }

    #[test]
    fn params_fill_the_path_template() {
        let req = api()
            .request("todosGet", &CallOptions::new().param("id", 7))
            .unwrap();
        assert_eq!(req.url, "/todos/7/");
        assert!(req.header("X-CSRFToken").is_none());
    }

    #[test]
    fn missing_params_fail_synchronously() {
        let err = api().call("todosGet", CallOptions::new()).err().unwrap();
        assert!(matches!(err, ApiError::MissingParam(_)));
    }

    #[test]
    fn unknown_endpoints_fail_synchronously() {
        let err = api().call("nope", CallOptions::new()).err().unwrap();
        assert!(matches!(err, ApiError::UnknownEndpoint(_)));
    }

    #[test]
    fn endpoint_include_and_query_options_are_appended() {
        let req = api()
            .request(
                "a",
                &CallOptions::new().filter("state", "open").sort(["-id"]),
            )
            .unwrap();
        assert_eq!(req.url, "/A/?include=owner&filter[state]=open&sort=-id");
    }

    #[test]
    fn url_root_is_prefixed_without_double_slash() {
        let req = api()
            .request("a", &CallOptions::new().include(["x"]).url_root("http://host:3000/"))
            .unwrap();
        assert_eq!(req.url, "http://host:3000/A/?include=x");
    }

    #[test]
    fn method_override_applies() {
        let req = api()
            .request("todosList", &CallOptions::new().method(HttpMethod::Options))
            .unwrap();
        assert_eq!(req.method, HttpMethod::Options);
    }

    #[test]
    fn crud_helpers_resolve_registered_resources() {
        let api = api();
        assert!(api.crud("todos").is_some());
        assert!(api.crud("missing").is_none());
    }

    #[test]
    fn batch_group_requires_batch_stage() {
        assert!(api().batch().is_none());
        let api = Api::builder(Arc::new(Offline))
            .middleware(Batch::new(BatchConfig::new("/batch/")))
            .build();
        let first = api.batch().unwrap();
        let second = api.batch().unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(first.queued(), 0);
    }

    #[tokio::test]
    async fn transport_failure_reaches_caller() {
        let err = api()
            .call("todosList", CallOptions::new())
            .unwrap()
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Transport(_)));
    }
}
