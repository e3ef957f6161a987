// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use mockito::{Matcher, Server};
use std::sync::Arc;
use std::time::Duration;
use telemetry_exporter::aggregator::StepMetricAggregator;
use telemetry_exporter::config::{parse_collector_urls, ExporterConfig};
use telemetry_exporter::exporter::TelemetryExporter;
use telemetry_exporter::exposition::PrometheusExposition;
use telemetry_exporter::json::{MetricEncoder, TraceEncoder};
use telemetry_exporter::meter::MeterRegistry;
use telemetry_exporter::publisher::{BackgroundPublisher, PublisherConfig, PublisherState};
use telemetry_exporter::queue::OverflowPolicy;
use telemetry_exporter::record::{LogRecord, MetricId, MetricType, TraceSpan};
use telemetry_exporter::sink::{Credentials, HttpSink, SinkConfig};
use telemetry_exporter::tags::{CommonTags, Tag};
use tokio::time::{sleep, timeout};

fn fast_publishing() -> PublisherConfig {
    PublisherConfig {
        flush_interval: Duration::from_millis(50),
        cool_down: Duration::from_millis(100),
        queue_capacity: 64,
        overflow_policy: OverflowPolicy::DropOldest,
    }
}

fn sink_config(urls: &[String]) -> SinkConfig {
    SinkConfig {
        urls: parse_collector_urls("TEST", &urls.join(",")),
        connect_timeout: Duration::from_millis(500),
        read_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

/// Polls until `mock` was hit or two seconds passed.
async fn wait_for(mock: &mockito::Mock) {
    let _ = timeout(Duration::from_secs(2), async {
        while !mock.matched_async().await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

#[tokio::test]
async fn test_log_record_reaches_collector() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/logs")
        .match_header("content-type", "application/json")
        .match_header("authorization", "Basic dXNlcjpwYXNz")
        .match_body(r#"{"server":"host-1","subject":"svc-a","content":"boot ok","level":"INFO"}"#)
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let config = ExporterConfig {
        server_id: "host-1".to_string(),
        logs_urls: parse_collector_urls("LOGS", &format!("{}/logs", server.url())),
        credentials: Some(Credentials::new("user", "pass")),
        flush_interval: Duration::from_millis(50),
        ..Default::default()
    };
    let exporter = TelemetryExporter::new(&config);

    assert!(exporter.log(LogRecord::new("svc-a", "boot ok", "INFO")));
    exporter.start().unwrap();
    wait_for(&mock).await;
    // a few more passes must not resend it
    sleep(Duration::from_millis(200)).await;
    exporter.stop();

    mock.assert_async().await;
    assert_eq!(exporter.logs().unwrap().stats().sent, 1);
}

#[tokio::test]
async fn test_unreachable_collector_does_not_block_the_others() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/traces")
        .match_body(Matcher::PartialJsonString(
            r#"{"id":"span-1","traceId":"trace-1","kind":"server"}"#.to_string(),
        ))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let publisher = BackgroundPublisher::new(
        "TRACES",
        TraceEncoder,
        HttpSink::new(
            "TRACES",
            sink_config(&[
                "http://127.0.0.1:1/traces".to_string(),
                format!("{}/traces", server.url()),
            ]),
        ),
        CommonTags::default(),
        fast_publishing(),
    );
    let span = TraceSpan::new("span-1", None, "trace-1", 1_700_000_000_000, 12, "server").unwrap();
    publisher.enqueue(span);

    publisher.start().unwrap();
    wait_for(&mock).await;
    publisher.stop();

    mock.assert_async().await;
    assert_eq!(publisher.stats().encode_failures, 0);
}

#[tokio::test]
async fn test_rejected_record_is_not_retried() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/traces")
        .with_status(503)
        .expect(1)
        .create_async()
        .await;

    let publisher = BackgroundPublisher::new(
        "TRACES",
        TraceEncoder,
        HttpSink::new("TRACES", sink_config(&[format!("{}/traces", server.url())])),
        CommonTags::default(),
        fast_publishing(),
    );
    publisher.enqueue(TraceSpan::new("span-1", None, "trace-1", 0, 1, "client").unwrap());

    publisher.start().unwrap();
    wait_for(&mock).await;
    sleep(Duration::from_millis(250)).await;
    publisher.stop();

    mock.assert_async().await;
    assert!(publisher.queue().is_empty());
}

#[tokio::test]
async fn test_record_tags_win_over_common_tags() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/traces")
        .match_body(Matcher::PartialJsonString(
            r#"{"tags":{"level":"error","env":"prod"}}"#.to_string(),
        ))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let publisher = BackgroundPublisher::new(
        "TRACES",
        TraceEncoder,
        HttpSink::new("TRACES", sink_config(&[format!("{}/traces", server.url())])),
        CommonTags::new(vec![Tag::new("level", "info"), Tag::new("env", "prod")]),
        fast_publishing(),
    );
    publisher.enqueue(
        TraceSpan::new("span-1", Some("root".to_string()), "trace-1", 0, 1, "client")
            .unwrap()
            .with_tag("level", "error"),
    );

    publisher.start().unwrap();
    wait_for(&mock).await;
    publisher.stop();

    mock.assert_async().await;
}

#[tokio::test]
async fn test_metrics_pipeline_with_exposition() {
    let mut server = Server::new_async().await;
    let steady = server
        .mock("POST", "/metrics")
        .match_body(Matcher::PartialJsonString(
            r#"{"id":{"name":"queue.depth","type":"GAUGE"},"measure":{"value":4.5}}"#.to_string(),
        ))
        .with_status(200)
        .expect_at_least(1)
        .create_async()
        .await;
    let one_shot = server
        .mock("POST", "/metrics")
        .match_body(Matcher::PartialJsonString(
            r#"{"id":{"name":"trace.end","type":"TIMER"}}"#.to_string(),
        ))
        .with_status(500)
        .expect(1)
        .create_async()
        .await;

    let publisher = Arc::new(BackgroundPublisher::new(
        "METRICS",
        MetricEncoder,
        HttpSink::new("METRICS", sink_config(&[format!("{}/metrics", server.url())])),
        CommonTags::new(vec![Tag::new("app", "demo")]),
        fast_publishing(),
    ));
    let registry = Arc::new(MeterRegistry::new());
    let exposition = Arc::new(PrometheusExposition::new());
    let aggregator = Arc::new(
        StepMetricAggregator::new(Arc::clone(&registry), Arc::clone(&publisher), Duration::from_millis(100))
            .with_exposition(Arc::clone(&exposition)),
    );

    registry
        .gauge(MetricId::new("queue.depth", MetricType::Gauge).with_tag("queue", "logs"))
        .set(4.5);
    registry
        .timer(MetricId::new("trace.end", MetricType::Timer))
        .record(Duration::from_millis(8));

    publisher.start().unwrap();
    aggregator.start().unwrap();
    wait_for(&steady).await;
    wait_for(&one_shot).await;
    // eviction closes the step that sent the one-shot
    let evicted = timeout(Duration::from_secs(2), async {
        while registry.contains(&MetricId::new("trace.end", MetricType::Timer)) {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    aggregator.stop();
    publisher.stop();

    assert!(evicted.is_ok());
    steady.assert_async().await;
    one_shot.assert_async().await;
    let text = exposition.render();
    assert!(text.contains("queue_depth{queue=\"logs\",app=\"demo\"} 4.5"));
}

#[tokio::test]
async fn test_stop_abandons_queued_records() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/logs")
        .with_status(200)
        .expect(0)
        .create_async()
        .await;

    let config = ExporterConfig {
        logs_urls: parse_collector_urls("LOGS", &format!("{}/logs", server.url())),
        flush_interval: Duration::from_secs(30),
        ..Default::default()
    };
    let exporter = TelemetryExporter::new(&config);
    exporter.start().unwrap();
    // the first pass ran on an empty queue, the next one is 30s away
    sleep(Duration::from_millis(100)).await;
    exporter.log(LogRecord::new("svc-a", "late", "INFO"));
    exporter.stop();

    let logs = exporter.logs().unwrap();
    let stopped = timeout(Duration::from_secs(2), async {
        while logs.state() != PublisherState::Stopped {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(stopped.is_ok());
    assert_eq!(logs.queue().len(), 1);
    mock.assert_async().await;
}
