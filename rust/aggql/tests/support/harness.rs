use aggql::{config::AppConfig, server::Server};
use axum::{
    body::{self, Body},
    http::{self, Request, StatusCode},
    Router,
};
use serde::Serialize;
use serde_json::Value;
use std::{future::Future, path::PathBuf, sync::Once};
use tower::ServiceExt;

const API_KEY: &str = "test-api-key";

static TRACING_INIT: Once = Once::new();

/// Runs a test closure against a router booted from the fixture schema.
pub async fn with_harness<F, Fut>(test: F)
where
    F: FnOnce(TestHarness) -> Fut,
    Fut: Future<Output = ()>,
{
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });

    let mut config = AppConfig::embedded("logs");
    config.api_key = Some(API_KEY.to_string());
    config.schema_path = Some(fixture_path("schema.json"));

    let server = Server::new(config)
        .await
        .expect("failed to boot aggql server for harness");
    let harness = TestHarness {
        router: server.router(),
        api_key: API_KEY.to_string(),
    };

    test(harness).await;
}

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

#[derive(Clone)]
pub struct TestHarness {
    router: Router,
    api_key: String,
}

#[allow(dead_code)]
impl TestHarness {
    pub async fn translate(&self, body: Value) -> http::Response<Body> {
        self.post("/translate", &serde_json::json!({ "body": body }), true)
            .await
    }

    pub async fn render(&self, body: Value, rows: Value) -> http::Response<Body> {
        self.post(
            "/render",
            &serde_json::json!({ "body": body, "rows": rows }),
            true,
        )
        .await
    }

    pub async fn translate_without_api_key(&self, body: Value) -> http::Response<Body> {
        self.post("/translate", &serde_json::json!({ "body": body }), false)
            .await
    }

    pub async fn get(&self, path: &str) -> http::Response<Body> {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())
            .expect("failed to build harness request");
        self.send(request).await
    }

    async fn post<T>(&self, path: &str, payload: &T, include_api_key: bool) -> http::Response<Body>
    where
        T: Serialize,
    {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header(http::header::CONTENT_TYPE, "application/json");

        if include_api_key {
            builder = builder.header("x-api-key", &self.api_key);
        }

        let body = serde_json::to_vec(payload).expect("request payload should serialize");
        let request = builder
            .body(Body::from(body))
            .expect("failed to build harness request");
        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> http::Response<Body> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should handle harness request")
    }
}

pub async fn read_json(response: http::Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("response body should deserialize");
    let value =
        serde_json::from_slice::<Value>(&bytes).expect("response body should be valid JSON");
    (status, value)
}
