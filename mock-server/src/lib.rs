//! In-memory HTTP backend for exercising the client end to end.
//!
//! Serves a small todo resource plus the two batch endpoints. A batch
//! endpoint replays each entry of `{"batch": [...]}` against the resource
//! router and answers with one `{status_code, reason_phrase, body}` element
//! per entry, in request order.

use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderName, HeaderValue, Method, Request, StatusCode},
    routing::{get, post},
    Json, Router,
};
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{net::TcpListener, sync::RwLock};
use tower::ServiceExt;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Todo {
    pub id: Uuid,
    pub title: String,
    pub completed: bool,
}

#[derive(Deserialize)]
pub struct CreateTodo {
    pub title: String,
    #[serde(default)]
    pub completed: bool,
}

#[derive(Deserialize)]
pub struct UpdateTodo {
    pub title: Option<String>,
    pub completed: Option<bool>,
}

/// One sub-request inside a combined batch body.
#[derive(Debug, Deserialize)]
pub struct BatchEntry {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub batch: Vec<BatchEntry>,
}

/// Outcome of one sub-request.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchReply {
    pub status_code: u16,
    pub reason_phrase: String,
    pub body: Value,
}

pub type Db = Arc<RwLock<HashMap<Uuid, Todo>>>;

fn resources(db: Db) -> Router {
    Router::new()
        .route("/todos/", get(list_todos).post(create_todo))
        .route(
            "/todos/{id}/",
            get(get_todo)
                .put(update_todo)
                .patch(update_todo)
                .delete(delete_todo),
        )
        .with_state(db)
}

pub fn app() -> Router {
    let resources = resources(Db::default());
    Router::new()
        .route("/batch/", post(run_batch))
        .route("/batch/mutable/", post(run_batch))
        .with_state(resources.clone())
        .merge(resources)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "mock server listening");
    }
    axum::serve(listener, app()).await
}

async fn list_todos(State(db): State<Db>) -> Json<Vec<Todo>> {
    let todos = db.read().await;
    Json(todos.values().cloned().collect())
}

async fn create_todo(
    State(db): State<Db>,
    Json(input): Json<CreateTodo>,
) -> (StatusCode, Json<Todo>) {
    let todo = Todo {
        id: Uuid::new_v4(),
        title: input.title,
        completed: input.completed,
    };
    db.write().await.insert(todo.id, todo.clone());
    (StatusCode::CREATED, Json(todo))
}

async fn get_todo(
    State(db): State<Db>,
    Path(id): Path<Uuid>,
) -> Result<Json<Todo>, StatusCode> {
    let todos = db.read().await;
    todos.get(&id).cloned().map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn update_todo(
    State(db): State<Db>,
    Path(id): Path<Uuid>,
    Json(input): Json<UpdateTodo>,
) -> Result<Json<Todo>, StatusCode> {
    let mut todos = db.write().await;
    let todo = todos.get_mut(&id).ok_or(StatusCode::NOT_FOUND)?;
    if let Some(title) = input.title {
        todo.title = title;
    }
    if let Some(completed) = input.completed {
        todo.completed = completed;
    }
    Ok(Json(todo.clone()))
}

async fn delete_todo(
    State(db): State<Db>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, StatusCode> {
    let mut todos = db.write().await;
    todos.remove(&id).map(|_| StatusCode::NO_CONTENT).ok_or(StatusCode::NOT_FOUND)
}

async fn run_batch(
    State(resources): State<Router>,
    Json(input): Json<BatchRequest>,
) -> Json<Vec<BatchReply>> {
    debug!(size = input.batch.len(), "running batch");
    let mut replies = Vec::with_capacity(input.batch.len());
    // Entries run one after another so later entries see earlier writes.
    for entry in input.batch {
        replies.push(replay(&resources, entry).await);
    }
    Json(replies)
}

async fn replay(resources: &Router, entry: BatchEntry) -> BatchReply {
    let request = match sub_request(entry) {
        Ok(request) => request,
        Err(status) => return reply(status, Value::Null),
    };
    let response = match resources.clone().oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    };
    let status = response.status();
    let bytes = match response.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return reply(StatusCode::INTERNAL_SERVER_ERROR, Value::Null),
    };
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    reply(status, body)
}

fn sub_request(entry: BatchEntry) -> Result<Request<Body>, StatusCode> {
    let method = Method::from_bytes(entry.method.as_bytes()).map_err(|_| StatusCode::BAD_REQUEST)?;
    let (body, json) = match entry.body {
        None | Some(Value::Null) => (Body::empty(), false),
        Some(Value::String(text)) => (Body::from(text), false),
        Some(other) => (Body::from(other.to_string()), true),
    };
    let mut request = Request::builder()
        .method(method)
        .uri(&entry.url)
        .body(body)
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    let headers = request.headers_mut();
    for (name, value) in &entry.headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| StatusCode::BAD_REQUEST)?;
        let value = HeaderValue::from_str(value).map_err(|_| StatusCode::BAD_REQUEST)?;
        headers.insert(name, value);
    }
    if json {
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    Ok(request)
}

fn reply(status: StatusCode, body: Value) -> BatchReply {
    BatchReply {
        status_code: status.as_u16(),
        reason_phrase: status.canonical_reason().unwrap_or_default().to_string(),
        body,
    }
}
