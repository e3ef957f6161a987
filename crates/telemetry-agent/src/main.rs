// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc, time::Instant};
use tracing::{debug, error, info};

use telemetry_exporter::{
    config::ExporterConfig,
    exporter::TelemetryExporter,
    logger::{env_filter, Formatter},
    record::{LogRecord, MetricId, MetricType},
};

#[tokio::main]
pub async fn main() {
    let log_level = env::var("TELEMETRY_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter(&log_level))
        .with_ansi(false)
        .event_format(Formatter)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Unable to install log subscriber: {e}");
    }

    debug!("Logging subsystem enabled");

    let config = match ExporterConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}. Shutting down.");
            return;
        }
    };

    let exporter = TelemetryExporter::new(&config);
    if let Err(e) = exporter.start() {
        error!("Unable to start telemetry export: {e}");
        return;
    }

    let started = Arc::new(Instant::now());
    let registry = exporter.registry();
    let _uptime = registry.gauge_fn(
        MetricId::new("telemetry.agent.uptime", MetricType::Gauge).with_base_unit("seconds"),
        &started,
        |started| started.elapsed().as_secs_f64(),
    );
    registry
        .counter(MetricId::new("telemetry.agent.boots", MetricType::Counter))
        .increment();

    exporter.log(LogRecord::new(
        "telemetry-agent",
        format!("boot ok, server {}", config.server_id),
        "INFO",
    ));
    info!("Telemetry agent running, press Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for shutdown signal: {e}");
    }

    exporter.stop();
    info!("Telemetry agent stopped");
}
