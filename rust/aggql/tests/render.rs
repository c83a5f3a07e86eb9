mod support;

use http::StatusCode;
use pretty_assertions::assert_eq;
use serde_json::json;
use serial_test::serial;
use support::{read_json, with_harness};

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn terms_drop_the_missing_key_row() {
    with_harness(|harness| async move {
        let body = json!({ "aggs": { "0": { "terms": { "field": "host.name", "size": 3 } } } });
        let rows = json!([
            { "aggr__0__key_0": "web-1", "aggr__0__count": 7, "aggr__0__order_1": 7 },
            { "aggr__0__key_0": "", "aggr__0__count": 4, "aggr__0__order_1": 4 },
            { "aggr__0__key_0": "web-2", "aggr__0__count": 2, "aggr__0__order_1": 2 },
        ]);
        let (status, response) = read_json(harness.render(body, rows).await).await;
        assert_eq!(status, StatusCode::OK, "unexpected response: {response}");
        assert_eq!(
            response,
            json!({ "aggregations": { "0": {
                "doc_count_error_upper_bound": 0,
                "sum_other_doc_count": 0,
                "buckets": [
                    { "key": "web-1", "doc_count": 7 },
                    { "key": "web-2", "doc_count": 2 },
                ],
            }}})
        );
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn terms_count_documents_outside_the_top_buckets() {
    with_harness(|harness| async move {
        let body = json!({ "aggs": { "h": { "terms": { "field": "host.name", "size": 1 } } } });
        let rows = json!([
            { "aggr__h__parent_count": 10, "aggr__h__key_0": "a", "aggr__h__count": 5, "aggr__h__order_1": 5 },
            { "aggr__h__parent_count": 10, "aggr__h__key_0": "b", "aggr__h__count": 3, "aggr__h__order_1": 3 },
        ]);
        let (status, response) = read_json(harness.render(body, rows).await).await;
        assert_eq!(status, StatusCode::OK, "unexpected response: {response}");
        assert_eq!(
            response,
            json!({ "aggregations": { "h": {
                "doc_count_error_upper_bound": 0,
                "sum_other_doc_count": 5,
                "buckets": [{ "key": "a", "doc_count": 5 }],
            }}})
        );
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn date_histogram_keys_render_as_timestamps() {
    with_harness(|harness| async move {
        let body = json!({ "aggs": { "0": {
            "date_histogram": { "field": "@timestamp", "interval": "30s" },
        }}});
        let rows = json!([{ "aggr__0__key_0": 56962398, "aggr__0__count": 12 }]);
        let (status, response) = read_json(harness.render(body, rows).await).await;
        assert_eq!(status, StatusCode::OK, "unexpected response: {response}");
        assert_eq!(
            response["aggregations"]["0"]["buckets"],
            json!([{
                "key": 1_708_871_940_000i64,
                "key_as_string": "2024-02-25T14:39:00.000",
                "doc_count": 12,
            }])
        );
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn pipelines_fill_gaps_and_summarise_buckets() {
    with_harness(|harness| async move {
        let body = json!({ "aggs": {
            "per_min": {
                "date_histogram": { "field": "@timestamp", "fixed_interval": "1m" },
                "aggs": { "change": { "derivative": { "buckets_path": "_count" } } },
            },
            "busiest": { "max_bucket": { "buckets_path": "per_min>_count" } },
        }});
        let rows = json!([
            { "aggr__per_min__key_0": 100, "aggr__per_min__count": 2 },
            { "aggr__per_min__key_0": 102, "aggr__per_min__count": 5 },
        ]);
        let (status, response) = read_json(harness.render(body, rows).await).await;
        assert_eq!(status, StatusCode::OK, "unexpected response: {response}");

        let aggregations = &response["aggregations"];
        assert_eq!(
            aggregations["per_min"]["buckets"],
            json!([
                { "key": 6_000_000, "key_as_string": "1970-01-01T01:40:00.000", "doc_count": 2 },
                {
                    "key": 6_060_000,
                    "key_as_string": "1970-01-01T01:41:00.000",
                    "doc_count": 0,
                    "change": { "value": -2.0 },
                },
                {
                    "key": 6_120_000,
                    "key_as_string": "1970-01-01T01:42:00.000",
                    "doc_count": 5,
                    "change": { "value": 5.0 },
                },
            ])
        );
        assert_eq!(
            aggregations["busiest"],
            json!({ "value": 5.0, "keys": ["1970-01-01T01:42:00.000"] })
        );
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn filters_render_keyed_groups_with_metrics() {
    with_harness(|harness| async move {
        let body = json!({ "aggs": { "by_status": {
            "filters": { "filters": {
                "errors": { "range": { "status": { "gte": 500 } } },
                "ok": { "term": { "status": 200 } },
            }},
            "aggs": { "bytes": { "sum": { "field": "bytes" } } },
        }}});
        let rows = json!([{
            "filter_0__aggr__by_status__count": 3,
            "filter_0__metric__by_status__bytes_col_0": 1024.0,
            "filter_1__aggr__by_status__count": 9,
            "filter_1__metric__by_status__bytes_col_0": null,
        }]);
        let (status, response) = read_json(harness.render(body, rows).await).await;
        assert_eq!(status, StatusCode::OK, "unexpected response: {response}");
        assert_eq!(
            response["aggregations"]["by_status"],
            json!({ "buckets": {
                "errors": { "doc_count": 3, "bytes": { "value": 1024.0 } },
                "ok": { "doc_count": 9, "bytes": { "value": 0.0 } },
            }})
        );
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn zero_aggregations_report_the_count() {
    with_harness(|harness| async move {
        let body = json!({ "query": { "match_all": {} } });
        let rows = json!([{ "count()": "42" }]);
        let (status, response) = read_json(harness.render(body, rows).await).await;
        assert_eq!(status, StatusCode::OK, "unexpected response: {response}");
        assert_eq!(
            response,
            json!({ "hits": { "total": { "value": 42, "relation": "eq" } } })
        );
    })
    .await;
}
