mod support;

use http::StatusCode;
use pretty_assertions::assert_eq;
use serde_json::json;
use serial_test::serial;
use support::{read_json, with_harness};

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn healthz_reports_ok() {
    with_harness(|harness| async move {
        let (status, body) = read_json(harness.get("/healthz").await).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "ok" }));
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn missing_api_key_is_rejected() {
    with_harness(|harness| async move {
        let response = harness
            .translate_without_api_key(json!({ "aggs": {} }))
            .await;
        let (status, body) = read_json(response).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, json!({ "error": "authentication failed" }));
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn non_object_body_is_a_bad_request() {
    with_harness(|harness| async move {
        let (status, body) = read_json(harness.translate(json!([1, 2, 3])).await).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(
            body["error"].as_str().unwrap_or_default().contains("JSON object"),
            "unexpected error body: {body}"
        );
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn sibling_bucket_aggregations_are_unprocessable() {
    with_harness(|harness| async move {
        let request = json!({ "aggs": { "hosts": {
            "terms": { "field": "host.name" },
            "aggs": {
                "a": { "terms": { "field": "status" } },
                "b": { "histogram": { "field": "bytes", "interval": 100 } },
            },
        }}});
        let (status, body) = read_json(harness.translate(request).await).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(
            body["error"].as_str().unwrap_or_default().starts_with("unsupported aggregation"),
            "unexpected error body: {body}"
        );
    })
    .await;
}
