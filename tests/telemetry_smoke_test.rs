//! Smoke tests for the full observability stack.
//!
//! These tests require an OTLP collector on localhost:4317 that forwards
//! traces to Tempo (:3200), metrics to Prometheus (:9090) and logs to
//! Loki (:3100).
//!
//! Run with:
//! ```sh
//! cargo test --test telemetry_smoke_test -- --ignored --nocapture
//! ```

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::json;
use workqueue::engine::WorkQueue;
use workqueue::model::{NewWorkItem, WorkOutcome, WorkResult};
use workqueue::registry::WorkerRegistry;
use workqueue::store::InMemoryWorkStore;
use workqueue::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};

const SERVICE: &str = "workqueue-smoke-test";

static TELEMETRY: OnceLock<TelemetryGuard> = OnceLock::new();

fn ensure_telemetry() -> &'static TelemetryGuard {
    TELEMETRY.get_or_init(|| {
        init_telemetry(TelemetryConfig {
            endpoint: Some("http://localhost:4317".to_string()),
            service_name: SERVICE.to_string(),
            log_level: "info".to_string(),
        })
        .expect("failed to init telemetry")
    })
}

/// Force-flush all providers and give backends time to ingest.
async fn flush_and_wait(guard: &TelemetryGuard) {
    guard.force_flush();
    tokio::time::sleep(Duration::from_secs(8)).await;
}

/// Drive one item through add, allocate, fail, retry and succeed.
async fn run_lifecycle() {
    let queue = WorkQueue::new(
        Arc::new(InMemoryWorkStore::new()),
        Arc::new(WorkerRegistry::with_builtins()),
    );
    let item = queue
        .add_work(NewWorkItem::new("SMOKE").input(json!({"n": 1})).retries(1))
        .await
        .unwrap();
    let types = vec!["SMOKE".to_string()];

    let leased = queue.allocate_work(&types, "smoke-worker").await.unwrap().unwrap();
    assert_eq!(leased.id, item.id);
    queue
        .finish_work(leased.id, WorkOutcome::failed(json!("boom")).into())
        .await
        .unwrap();

    let retry = queue.allocate_work(&types, "smoke-worker").await.unwrap().unwrap();
    queue
        .finish_work(retry.id, WorkResult::from(WorkOutcome::ok(json!("done"))))
        .await
        .unwrap();

    queue.do_work("HEARTBEAT", json!({"ping": true})).await.unwrap();
}

#[test]
#[ignore]
fn smoke_traces() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let guard = ensure_telemetry();
        {
            let span = workqueue::telemetry::work::start_inline_span("SMOKE");
            let _enter = span.enter();
            tracing::info!("smoke span");
        }
        flush_and_wait(guard).await;

        let client = reqwest::Client::new();
        let resp = client
            .get("http://localhost:3200/api/search")
            .query(&[("tags", format!("service.name={SERVICE}")), ("limit", "5".to_string())])
            .send()
            .await
            .expect("failed to query Tempo");
        assert!(resp.status().is_success(), "Tempo query failed: {}", resp.status());

        let body: serde_json::Value = resp.json().await.expect("failed to parse Tempo response");
        let traces = body["traces"].as_array();
        assert!(
            traces.is_some_and(|t| !t.is_empty()),
            "expected traces in Tempo, got: {body}"
        );
    });
}

#[test]
#[ignore]
fn smoke_lifecycle_metrics() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let guard = ensure_telemetry();
        run_lifecycle().await;
        flush_and_wait(guard).await;

        let client = reqwest::Client::new();
        for metric in [
            "workqueue_work_added_total",
            "workqueue_work_finished_total",
            "workqueue_work_retried_total",
        ] {
            let resp = client
                .get("http://localhost:9090/api/v1/query")
                .query(&[("query", metric)])
                .send()
                .await
                .expect("failed to query Prometheus");
            assert!(resp.status().is_success(), "Prometheus query failed: {}", resp.status());

            let body: serde_json::Value = resp.json().await.expect("bad Prometheus response");
            let results = body["data"]["result"].as_array();
            assert!(
                results.is_some_and(|r| !r.is_empty()),
                "expected {metric} in Prometheus, got: {body}"
            );
        }
    });
}

#[test]
#[ignore]
fn smoke_logs() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let guard = ensure_telemetry();
        run_lifecycle().await;
        flush_and_wait(guard).await;

        let client = reqwest::Client::new();
        let resp = client
            .get("http://localhost:3100/loki/api/v1/query_range")
            .query(&[
                ("query", format!(r#"{{service_name="{SERVICE}"}}"#)),
                ("limit", "10".to_string()),
            ])
            .send()
            .await
            .expect("failed to query Loki");
        assert!(resp.status().is_success(), "Loki query failed: {}", resp.status());

        let body: serde_json::Value = resp.json().await.expect("failed to parse Loki response");
        let streams = body["data"]["result"].as_array();
        assert!(
            streams.is_some_and(|s| !s.is_empty()),
            "expected log streams in Loki, got: {body}"
        );
    });
}
