//! In-memory demo server used as the engine's transport.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use quarry_core::{BaseQuery, RequestContext, TransportResult};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: u64,
    pub title: String,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("no route for {method} {path}")]
    NotFound { method: String, path: String },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("writes are disabled")]
    WritesDisabled,

    #[error("request aborted")]
    Aborted,
}

impl ServerError {
    fn status(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::BadRequest(_) => 400,
            Self::WritesDisabled => 503,
            Self::Aborted => 499,
        }
    }

    fn into_value(self) -> Value {
        json!({ "status": self.status(), "data": { "message": self.to_string() } })
    }
}

#[derive(Debug, Default)]
struct Data {
    count: i64,
    posts: BTreeMap<u64, Post>,
}

/// A tiny REST-ish server living in process memory.
///
/// Routes:
/// - `GET /count`, `POST /count/increment {by}`
/// - `GET /posts`, `GET /posts/{id}`, `PATCH /posts/{id} {title}`
#[derive(Debug)]
pub struct DemoServer {
    data: Mutex<Data>,
    latency: Duration,
    fail_writes: bool,
}

impl DemoServer {
    pub fn new(latency: Duration) -> Self {
        Self {
            data: Mutex::new(Data::default()),
            latency,
            fail_writes: false,
        }
    }

    /// Reject every write with a 503.
    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    pub fn with_posts(self, posts: impl IntoIterator<Item = Post>) -> Self {
        self.lock().posts.extend(posts.into_iter().map(|p| (p.id, p)));
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Data> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, method: &str, path: &str, body: &Value) -> Result<Value, ServerError> {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let is_write = method != "GET";
        if is_write && self.fail_writes {
            return Err(ServerError::WritesDisabled);
        }

        let mut data = self.lock();
        match (method, segments.as_slice()) {
            ("GET", ["count"]) => Ok(json!({ "count": data.count })),
            ("POST", ["count", "increment"]) => {
                let by = body.get("by").and_then(Value::as_i64).unwrap_or(1);
                data.count += by;
                Ok(json!({ "count": data.count }))
            }
            ("GET", ["posts"]) => Ok(json!(data.posts.values().collect::<Vec<_>>())),
            ("GET", ["posts", id]) => {
                let id = parse_id(id)?;
                data.posts
                    .get(&id)
                    .map(|p| json!(p))
                    .ok_or_else(|| not_found(method, path))
            }
            ("PATCH", ["posts", id]) => {
                let id = parse_id(id)?;
                let title = body
                    .get("title")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ServerError::BadRequest("missing title".into()))?;
                let post = data.posts.get_mut(&id).ok_or_else(|| not_found(method, path))?;
                post.title = title.to_string();
                Ok(json!(post))
            }
            _ => Err(not_found(method, path)),
        }
    }
}

fn parse_id(raw: &str) -> Result<u64, ServerError> {
    raw.parse()
        .map_err(|_| ServerError::BadRequest(format!("invalid id: {raw}")))
}

fn not_found(method: &str, path: &str) -> ServerError {
    ServerError::NotFound {
        method: method.to_string(),
        path: path.to_string(),
    }
}

#[async_trait]
impl BaseQuery for DemoServer {
    async fn execute(&self, request: Value, ctx: RequestContext, _extra_options: Option<Value>) -> TransportResult {
        let (method, path, body) = match &request {
            Value::String(path) => ("GET".to_string(), path.clone(), Value::Null),
            Value::Object(parts) => (
                parts.get("method")
                    .and_then(Value::as_str)
                    .unwrap_or("GET")
                    .to_ascii_uppercase(),
                parts.get("url").and_then(Value::as_str).unwrap_or("/").to_string(),
                parts.get("body").cloned().unwrap_or(Value::Null),
            ),
            other => return Err(ServerError::BadRequest(format!("invalid request: {other}")).into_value()),
        };

        tokio::select! {
            () = tokio::time::sleep(self.latency) => {}
            () = ctx.signal().aborted() => return Err(ServerError::Aborted.into_value()),
        }

        let response = self.handle(&method, &path, &body);
        match &response {
            Ok(_) => debug!(%method, %path, "served"),
            Err(e) => info!(%method, %path, error = %e, "request failed"),
        }
        response.map_err(ServerError::into_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn server() -> DemoServer {
        DemoServer::new(Duration::ZERO).with_posts([Post {
            id: 1,
            title: "hello".into(),
        }])
    }

    #[test]
    fn test_counter_routes() {
        let server = server();
        assert_eq!(server.handle("GET", "/count", &Value::Null).unwrap(), json!({"count": 0}));
        assert_eq!(
            server.handle("POST", "/count/increment", &json!({"by": 5})).unwrap(),
            json!({"count": 5})
        );
    }

    #[test]
    fn test_post_routes() {
        let server = server();
        assert_eq!(
            server.handle("GET", "/posts", &Value::Null).unwrap(),
            json!([{"id": 1, "title": "hello"}])
        );
        assert_eq!(
            server.handle("PATCH", "/posts/1", &json!({"title": "bye"})).unwrap(),
            json!({"id": 1, "title": "bye"})
        );
        assert!(matches!(
            server.handle("GET", "/posts/9", &Value::Null),
            Err(ServerError::NotFound { .. })
        ));
        assert!(matches!(
            server.handle("GET", "/posts/x", &Value::Null),
            Err(ServerError::BadRequest(_))
        ));
    }

    #[test]
    fn test_failing_writes() {
        let server = server().failing_writes();
        let err = server
            .handle("PATCH", "/posts/1", &json!({"title": "bye"}))
            .unwrap_err();
        assert_eq!(err.into_value()["status"], 503);
        assert!(server.handle("GET", "/posts", &Value::Null).is_ok());
    }
}
