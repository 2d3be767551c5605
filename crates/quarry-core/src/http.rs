//! HTTP transport built on reqwest.

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::endpoint::{BaseQuery, RequestContext, TransportResult};

/// Transport that resolves request descriptors against a base URL.
///
/// A descriptor is either a path string (`"/posts/1"`) or an object:
///
/// ```json
/// {"url": "/posts", "method": "POST", "body": {...}, "params": {...}, "headers": {...}}
/// ```
///
/// Successful responses yield the JSON body (or the raw text when it is not
/// JSON). Other statuses yield `{"status": <code>, "data": <body>}`, and
/// network failures yield `{"status": "FETCH_ERROR", "error": <message>}`.
#[derive(Debug, Clone)]
pub struct FetchBaseQuery {
    http: Client,
    base_url: String,
    headers: Vec<(String, String)>,
}

impl FetchBaseQuery {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            headers: Vec::new(),
        }
    }

    /// Header sent with every request.
    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn build(
        &self,
        descriptor: &Value,
        extra_options: Option<&Value>,
    ) -> Result<reqwest::RequestBuilder, Value> {
        let empty = Map::new();
        let (path, parts) = match descriptor {
            Value::String(path) => (path.as_str(), &empty),
            Value::Object(parts) => {
                let path = parts
                    .get("url")
                    .and_then(Value::as_str)
                    .ok_or_else(|| fetch_error("request descriptor has no `url`"))?;
                (path, parts)
            }
            other => return Err(fetch_error(format!("invalid request descriptor: {other}"))),
        };

        let method = match parts.get("method").and_then(Value::as_str) {
            Some(m) => Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                .map_err(|_| fetch_error(format!("invalid method: {m}")))?,
            None => Method::GET,
        };

        let mut request = self.http.request(method, self.url_for(path));

        if let Some(Value::Object(params)) = parts.get("params") {
            let pairs: Vec<(&str, String)> = params
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.as_str(), scalar_to_string(v)))
                .collect();
            request = request.query(&pairs);
        }

        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        let extra_headers = extra_options.and_then(|o| o.get("headers"));
        for headers in [extra_headers, parts.get("headers")].into_iter().flatten() {
            if let Value::Object(headers) = headers {
                for (name, value) in headers {
                    request = request.header(name, scalar_to_string(value));
                }
            }
        }

        match parts.get("body") {
            None | Some(Value::Null) => {}
            Some(Value::String(text)) => request = request.body(text.clone()),
            Some(body) => request = request.json(body),
        }

        Ok(request)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> TransportResult {
        let response = request.send().await.map_err(|e| {
            warn!(error = %e, "request failed");
            fetch_error(e.to_string())
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| fetch_error(e.to_string()))?;
        let data = parse_body(&text);

        debug!(status = status.as_u16(), "response received");
        if status.is_success() {
            Ok(data)
        } else {
            Err(json!({ "status": status.as_u16(), "data": data }))
        }
    }
}

#[async_trait]
impl BaseQuery for FetchBaseQuery {
    async fn execute(
        &self,
        request: Value,
        ctx: RequestContext,
        extra_options: Option<Value>,
    ) -> TransportResult {
        let request = self.build(&request, extra_options.as_ref())?;
        tokio::select! {
            result = self.send(request) => result,
            () = ctx.signal().aborted() => Err(fetch_error("request aborted")),
        }
    }
}

fn fetch_error(message: impl Into<String>) -> Value {
    json!({ "status": "FETCH_ERROR", "error": message.into() })
}

fn parse_body(text: &str) -> Value {
    if text.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::endpoint::{MutationDefinition, QueryDefinition};
    use crate::engine::Engine;
    use crate::handle::MutationOptions;
    use crate::subscription::SubscriptionOptions;

    fn engine(server: &MockServer) -> Engine {
        Engine::builder()
            .base_query(FetchBaseQuery::new(server.uri()).default_header("x-client", "quarry"))
            .query(
                "getPost",
                QueryDefinition::new().request(|id| Value::String(format!("/posts/{id}"))),
            )
            .query(
                "search",
                QueryDefinition::new().request(|q| json!({ "url": "/search", "params": { "q": q } })),
            )
            .mutation(
                "addPost",
                MutationDefinition::new()
                    .request(|body| json!({ "url": "posts", "method": "post", "body": body })),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_url_joining() {
        let base = FetchBaseQuery::new("http://localhost:8080/api/");
        assert_eq!(base.base_url(), "http://localhost:8080/api");
        assert_eq!(base.url_for("/posts"), "http://localhost:8080/api/posts");
        assert_eq!(base.url_for("posts"), "http://localhost:8080/api/posts");
        assert_eq!(base.url_for("https://other.example/x"), "https://other.example/x");
    }

    #[test]
    fn test_parse_body() {
        assert_eq!(parse_body(""), Value::Null);
        assert_eq!(parse_body(r#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(parse_body("plain"), json!("plain"));
    }

    #[tokio::test]
    async fn test_get_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/posts/1"))
            .and(header("x-client", "quarry"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 1, "title": "hello"})))
            .expect(1)
            .mount(&server)
            .await;

        let engine = engine(&server);
        let handle = engine
            .initiate_query("getPost", 1, SubscriptionOptions::default())
            .await
            .unwrap();
        assert_eq!(handle.result().await, Ok(json!({"id": 1, "title": "hello"})));
    }

    #[tokio::test]
    async fn test_params_and_text_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("q", "rust"))
            .respond_with(ResponseTemplate::new(200).set_body_string("found"))
            .mount(&server)
            .await;

        let engine = engine(&server);
        let handle = engine
            .initiate_query("search", "rust", SubscriptionOptions::default())
            .await
            .unwrap();
        assert_eq!(handle.result().await, Ok(json!("found")));
    }

    #[tokio::test]
    async fn test_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/posts/404"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "missing"})))
            .mount(&server)
            .await;

        let engine = engine(&server);
        let handle = engine
            .initiate_query("getPost", 404, SubscriptionOptions::default())
            .await
            .unwrap();
        assert_eq!(
            handle.result().await,
            Err(crate::QueryError::Transport(
                json!({"status": 404, "data": {"message": "missing"}})
            ))
        );
    }

    #[tokio::test]
    async fn test_post_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/posts"))
            .and(body_json(json!({"title": "new"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 7, "title": "new"})))
            .expect(1)
            .mount(&server)
            .await;

        let engine = engine(&server);
        let handle = engine
            .initiate_mutation("addPost", json!({"title": "new"}), MutationOptions::default())
            .await
            .unwrap();
        assert_eq!(handle.result().await, Ok(json!({"id": 7, "title": "new"})));
    }

    #[tokio::test]
    async fn test_network_failure() {
        let engine = Engine::builder()
            .base_query(FetchBaseQuery::new("http://127.0.0.1:1"))
            .query("getPost", QueryDefinition::new().request(|_| json!("/posts/1")))
            .build()
            .unwrap();

        let handle = engine
            .initiate_query("getPost", 1, SubscriptionOptions::default())
            .await
            .unwrap();
        match handle.result().await {
            Err(crate::QueryError::Transport(error)) => assert_eq!(error["status"], "FETCH_ERROR"),
            other => panic!("expected fetch error, got {other:?}"),
        }
    }
}
