// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One pipeline per process: log, trace and metric channels sharing a
//! common tag list.
//!
//! A channel without collector URLs is disabled. The metric channel is
//! always aggregated so the exposition stays current even when no metric
//! collector is configured.

use crate::aggregator::StepMetricAggregator;
use crate::config::ExporterConfig;
use crate::errors::PublisherError;
use crate::exposition::PrometheusExposition;
use crate::json::{LogEncoder, MetricEncoder, TraceEncoder};
use crate::meter::MeterRegistry;
use crate::publisher::{LogPublisher, MetricPublisher, TracePublisher};
use crate::record::{LogRecord, TraceSpan};
use crate::sink::{Credentials, HttpSink};
use crate::tags::CommonTags;
use std::sync::Arc;
use tracing::{debug, info};

pub struct TelemetryExporter {
    common_tags: CommonTags,
    logs: Option<Arc<LogPublisher>>,
    traces: Option<Arc<TracePublisher>>,
    metrics: Arc<MetricPublisher>,
    aggregator: Arc<StepMetricAggregator<HttpSink>>,
    exposition: Arc<PrometheusExposition>,
}

impl TelemetryExporter {
    #[must_use]
    pub fn new(config: &ExporterConfig) -> Self {
        Self::build(config, None)
    }

    /// Like [`TelemetryExporter::new`], evicting stale instruments from
    /// `global` as well as from the exporter's own registry.
    #[must_use]
    pub fn with_global_registry(config: &ExporterConfig, global: Arc<MeterRegistry>) -> Self {
        Self::build(config, Some(global))
    }

    fn build(config: &ExporterConfig, global: Option<Arc<MeterRegistry>>) -> Self {
        let common_tags = CommonTags::new(config.tags.clone());
        let publisher_config = config.publisher_config();

        let logs = (!config.logs_urls.is_empty()).then(|| {
            Arc::new(LogPublisher::new(
                "LOGS",
                LogEncoder::new(config.server_id.clone()),
                HttpSink::new("LOGS", config.logs_sink()),
                common_tags.clone(),
                publisher_config.clone(),
            ))
        });
        let traces = (!config.traces_urls.is_empty()).then(|| {
            Arc::new(TracePublisher::new(
                "TRACES",
                TraceEncoder,
                HttpSink::new("TRACES", config.traces_sink()),
                common_tags.clone(),
                publisher_config.clone(),
            ))
        });
        let metrics = Arc::new(MetricPublisher::new(
            "METRICS",
            MetricEncoder,
            HttpSink::new("METRICS", config.metrics_sink()),
            common_tags.clone(),
            publisher_config,
        ));

        let exposition = Arc::new(PrometheusExposition::new());
        let mut aggregator = StepMetricAggregator::new(
            Arc::new(MeterRegistry::new()),
            Arc::clone(&metrics),
            config.step,
        )
        .with_exposition(Arc::clone(&exposition));
        if let Some(global) = global {
            aggregator = aggregator.with_mirror(global);
        }

        Self {
            common_tags,
            logs,
            traces,
            metrics,
            aggregator: Arc::new(aggregator),
            exposition,
        }
    }

    /// Queues a log record. Returns `false` if the record was not accepted.
    pub fn log(&self, record: LogRecord) -> bool {
        match &self.logs {
            Some(logs) => logs.enqueue(record),
            None => false,
        }
    }

    /// Queues a finished span. Returns `false` if the span was not accepted.
    pub fn trace(&self, span: TraceSpan) -> bool {
        match &self.traces {
            Some(traces) => traces.enqueue(span),
            None => false,
        }
    }

    pub fn registry(&self) -> &Arc<MeterRegistry> {
        self.aggregator.registry()
    }

    pub fn common_tags(&self) -> &CommonTags {
        &self.common_tags
    }

    pub fn exposition(&self) -> &Arc<PrometheusExposition> {
        &self.exposition
    }

    pub fn logs(&self) -> Option<&Arc<LogPublisher>> {
        self.logs.as_ref()
    }

    pub fn traces(&self) -> Option<&Arc<TracePublisher>> {
        self.traces.as_ref()
    }

    pub fn metrics(&self) -> &Arc<MetricPublisher> {
        &self.metrics
    }

    pub fn aggregator(&self) -> &Arc<StepMetricAggregator<HttpSink>> {
        &self.aggregator
    }

    /// Replaces the credentials of every channel.
    pub fn set_credentials(&self, credentials: Option<Credentials>) {
        if let Some(logs) = &self.logs {
            logs.sink().set_credentials(credentials.clone());
        }
        if let Some(traces) = &self.traces {
            traces.sink().set_credentials(credentials.clone());
        }
        self.metrics.sink().set_credentials(credentials);
    }

    pub fn start(&self) -> Result<(), PublisherError> {
        if let Some(logs) = &self.logs {
            logs.start()?;
        }
        if let Some(traces) = &self.traces {
            traces.start()?;
        }
        self.metrics.start()?;
        self.aggregator.start()?;
        info!(
            "Telemetry export started (logs: {}, traces: {}, metrics: {} collector(s))",
            self.logs.as_ref().map_or(0, |p| p.sink().urls().len()),
            self.traces.as_ref().map_or(0, |p| p.sink().urls().len()),
            self.metrics.sink().urls().len()
        );
        Ok(())
    }

    /// Stops every channel without flushing what is still queued.
    pub fn stop(&self) {
        self.aggregator.stop();
        if let Some(logs) = &self.logs {
            logs.stop();
        }
        if let Some(traces) = &self.traces {
            traces.stop();
        }
        self.metrics.stop();
        debug!("Telemetry export stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_collector_urls;
    use crate::publisher::PublisherState;
    use crate::record::{MetricId, MetricType};
    use crate::tags::Tag;

    fn config_with_logs() -> ExporterConfig {
        ExporterConfig {
            logs_urls: parse_collector_urls("LOGS", "http://127.0.0.1:1/logs"),
            tags: vec![Tag::new("env", "test")],
            ..Default::default()
        }
    }

    #[test]
    fn test_channels_without_urls_are_disabled() {
        let exporter = TelemetryExporter::new(&config_with_logs());
        assert!(exporter.logs().is_some());
        assert!(exporter.traces().is_none());

        assert!(exporter.log(LogRecord::new("svc", "hello", "INFO")));
        let span = TraceSpan::new("s", None, "t", 0, 0, "server").unwrap();
        assert!(!exporter.trace(span));
        assert_eq!(exporter.logs().unwrap().queue().len(), 1);
    }

    #[test]
    fn test_common_tags_are_shared_between_channels() {
        let exporter = TelemetryExporter::new(&config_with_logs());
        exporter.common_tags().add("region", "eu");

        let seen_by_logs = exporter.logs().unwrap().common_tags().snapshot();
        let seen_by_metrics = exporter.metrics().common_tags().snapshot();
        assert_eq!(seen_by_logs, vec![Tag::new("env", "test"), Tag::new("region", "eu")]);
        assert_eq!(seen_by_logs, seen_by_metrics);
    }

    #[tokio::test]
    async fn test_start_and_stop_every_channel() {
        let exporter = TelemetryExporter::new(&config_with_logs());
        exporter
            .registry()
            .counter(MetricId::new("boot", MetricType::Counter))
            .increment();

        exporter.start().unwrap();
        assert_eq!(exporter.logs().unwrap().state(), PublisherState::Running);
        assert_eq!(exporter.metrics().state(), PublisherState::Running);
        assert!(matches!(exporter.start(), Err(PublisherError::AlreadyRunning)));

        exporter.stop();
        assert_ne!(exporter.metrics().state(), PublisherState::Running);
    }

    #[tokio::test]
    async fn test_global_registry_evictions() {
        let global = Arc::new(MeterRegistry::new());
        let exporter = TelemetryExporter::with_global_registry(&ExporterConfig::default(), Arc::clone(&global));
        let gauge = exporter
            .registry()
            .gauge(MetricId::new("unset", MetricType::Gauge));
        global.register(gauge);

        exporter.aggregator().step().await;

        assert!(exporter.registry().is_empty());
        assert!(global.is_empty());
    }
}
