mod support;

use http::StatusCode;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use serial_test::serial;
use support::{read_json, with_harness, TestHarness};

async fn sql_for(harness: &TestHarness, body: Value) -> String {
    let (status, response) = read_json(harness.translate(body).await).await;
    assert_eq!(status, StatusCode::OK, "unexpected response: {response}");
    response["sql"]
        .as_str()
        .expect("sql should be a string")
        .to_string()
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn single_terms_is_one_grouped_select() {
    with_harness(|harness| async move {
        let sql = sql_for(
            &harness,
            json!({ "aggs": { "0": { "terms": { "field": "host.name", "size": 3 } } } }),
        )
        .await;
        assert_eq!(
            sql,
            concat!(
                r#"SELECT sum(count(*)) OVER () AS aggr__0__parent_count, "#,
                r#""host.name" AS aggr__0__key_0, count(*) AS aggr__0__count, "#,
                r#"count() AS aggr__0__order_1 FROM logs GROUP BY "host.name" "#,
                "ORDER BY aggr__0__order_1 DESC, aggr__0__key_0 ASC LIMIT 4"
            )
        );
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn zero_aggregations_count_filtered_rows() {
    with_harness(|harness| async move {
        let sql = sql_for(
            &harness,
            json!({ "query": { "bool": { "filter": [ { "term": { "host": "web-1" } } ] } } }),
        )
        .await;
        assert_eq!(sql, r#"SELECT count(*) FROM logs WHERE "host.name"='web-1'"#);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn translation_reports_filter_terms_and_its_clock() {
    with_harness(|harness| async move {
        let (status, response) = read_json(
            harness
                .translate(json!({
                    "query": { "bool": { "filter": [
                        { "term": { "host": "Web-1" } },
                        { "range": { "bytes": { "gte": 10 } } },
                    ]}},
                }))
                .await,
        )
        .await;
        assert_eq!(status, StatusCode::OK, "unexpected response: {response}");
        assert_eq!(response["highlight"], json!({ "host.name": ["web-1"] }));
        assert!(response["now"].is_string());
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn nested_buckets_use_one_rank_filter_select() {
    with_harness(|harness| async move {
        let sql = sql_for(
            &harness,
            json!({ "aggs": { "hosts": {
                "terms": { "field": "host.name", "size": 5 },
                "aggs": { "codes": {
                    "terms": { "field": "status", "size": 2 },
                    "aggs": { "avg_bytes": { "avg": { "field": "bytes" } } },
                }},
            }}}),
        )
        .await;
        assert_eq!(sql.matches("dense_rank()").count(), 2);
        assert_eq!(sql.matches("FROM (SELECT").count(), 2);
        assert!(sql.contains("aggr__hosts__order_1_rank<=6"));
        assert!(sql.contains("aggr__hosts__codes__order_1_rank<=3"));
        assert!(sql.contains(r#"avgOrNull("bytes") AS metric__hosts__codes__avg_bytes_col_0"#));
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn default_percentiles_are_fractions() {
    with_harness(|harness| async move {
        let sql = sql_for(
            &harness,
            json!({ "aggs": { "lat": { "percentiles": { "field": "latency" } } } }),
        )
        .await;
        for fraction in ["0.01", "0.05", "0.25", "0.5", "0.75", "0.95", "0.99"] {
            assert!(
                sql.contains(&format!(r#"quantiles({fraction})("latency")"#)),
                "missing {fraction} in {sql}"
            );
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn nested_filters_multiply_columns() {
    with_harness(|harness| async move {
        let sql = sql_for(
            &harness,
            json!({ "aggs": { "outer": {
                "filters": { "filters": {
                    "a": { "term": { "status": 1 } },
                    "b": { "term": { "status": 2 } },
                }},
                "aggs": { "inner": {
                    "filters": { "filters": {
                        "x": { "term": { "bytes": 1 } },
                        "y": { "term": { "bytes": 2 } },
                        "z": { "term": { "bytes": 3 } },
                    }},
                    "aggs": { "total": { "sum": { "field": "latency" } } },
                }},
            }}}),
        )
        .await;
        assert_eq!(sql.matches("metric__outer__inner__total_col_0").count(), 6);
        assert!(sql.contains(
            r#"sumOrNullIf("latency",("bytes"=1 AND "status"=1)) AS filter_0__filter_0__metric__outer__inner__total_col_0"#
        ));
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn top_hits_join_back_per_group() {
    with_harness(|harness| async move {
        let sql = sql_for(
            &harness,
            json!({ "aggs": { "hosts": {
                "terms": { "field": "host.name", "size": 2 },
                "aggs": { "latest": { "top_hits": {
                    "size": 1,
                    "_source": { "includes": ["bytes"] },
                    "sort": [ { "@timestamp": { "order": "desc" } } ],
                }}},
            }}}),
        )
        .await;
        assert!(sql.starts_with("WITH hits_group_table AS ("));
        assert!(sql.contains("LEFT OUTER JOIN logs AS hit_table"));
        assert!(sql.contains("WHERE top_hits_rank<=1"));
    })
    .await;
}
