// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::aggregator::DEFAULT_STEP;
use crate::errors::ConfigError;
use crate::publisher::{PublisherConfig, DEFAULT_COOL_DOWN, DEFAULT_FLUSH_INTERVAL};
use crate::queue::{OverflowPolicy, DEFAULT_QUEUE_CAPACITY};
use crate::sink::{
    Credentials, SinkConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_METRICS_READ_TIMEOUT,
    DEFAULT_READ_TIMEOUT,
};
use crate::tags::{parse_tags, Tag};
use reqwest::Url;
use std::env;
use std::fmt::Debug;
use std::str::FromStr;
use std::time::Duration;
use tracing::{error, warn};

const VALID_LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

/// Configuration of a whole export pipeline
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    /// Value of the `server` field on log records
    pub server_id: String,
    /// Collector URLs per channel. An empty list disables the channel.
    pub logs_urls: Vec<Url>,
    pub traces_urls: Vec<Url>,
    pub metrics_urls: Vec<Url>,
    pub credentials: Option<Credentials>,
    pub flush_interval: Duration,
    pub cool_down: Duration,
    pub queue_capacity: usize,
    /// `drop_oldest` or `drop_newest`, checked by `validate()`
    pub overflow_policy: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub metrics_read_timeout: Duration,
    /// Metric aggregation step
    pub step: Duration,
    /// Tags appended to every outgoing record
    pub tags: Vec<Tag>,
    /// Log level (trace, debug, info, warn, error, off)
    pub log_level: String,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            server_id: "unknown".to_string(),
            logs_urls: Vec::new(),
            traces_urls: Vec::new(),
            metrics_urls: Vec::new(),
            credentials: None,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            cool_down: DEFAULT_COOL_DOWN,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow_policy: "drop_oldest".to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            metrics_read_timeout: DEFAULT_METRICS_READ_TIMEOUT,
            step: DEFAULT_STEP,
            tags: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

/// Accepts absolute `http`/`https` URLs with a host.
pub fn parse_collector_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw.trim()).map_err(|e| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::UnsupportedScheme {
            url: raw.to_string(),
            scheme: url.scheme().to_string(),
        });
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(url)
}

/// Parses a comma-separated URL list. Rejected entries are logged and
/// skipped, the rest of the list is kept.
pub fn parse_collector_urls(channel: &str, raw: &str) -> Vec<Url> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match parse_collector_url(entry) {
            Ok(url) => Some(url),
            Err(e) => {
                error!("{channel} | {e}, skipping");
                None
            }
        })
        .collect()
}

fn parse_or_default<T>(var: &str, raw: Option<String>, default: T) -> T
where
    T: FromStr + Debug,
{
    match raw {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            error!("Invalid value '{raw}' for {var}, using default {default:?}");
            default
        }),
    }
}

fn millis_or_default(var: &str, raw: Option<String>, default: Duration) -> Duration {
    raw.map_or(default, |raw| match raw.trim().parse::<u64>() {
        Ok(millis) => Duration::from_millis(millis),
        Err(_) => {
            error!("Invalid value '{raw}' for {var}, using default {default:?}");
            default
        }
    })
}

impl ExporterConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Same as [`ExporterConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let server_id = var("TELEMETRY_SERVER_ID")
            .or_else(|| var("HOSTNAME"))
            .map_or(defaults.server_id, |id| id.trim().to_string());

        let urls = |name: &str, channel: &str| {
            var(name).map_or_else(Vec::new, |raw| parse_collector_urls(channel, &raw))
        };
        let logs_urls = urls("TELEMETRY_LOGS_URLS", "LOGS");
        let traces_urls = urls("TELEMETRY_TRACES_URLS", "TRACES");
        let metrics_urls = urls("TELEMETRY_METRICS_URLS", "METRICS");

        let credentials = match (var("TELEMETRY_USERNAME"), var("TELEMETRY_PASSWORD")) {
            (Some(username), Some(password)) => Some(Credentials::new(username, password)),
            (None, None) => None,
            _ => {
                warn!("Both TELEMETRY_USERNAME and TELEMETRY_PASSWORD are needed, sending without credentials");
                None
            }
        };

        let tags = match var("TELEMETRY_TAGS") {
            Some(raw) => parse_tags(&raw)?,
            None => Vec::new(),
        };

        let config = Self {
            server_id,
            logs_urls,
            traces_urls,
            metrics_urls,
            credentials,
            flush_interval: millis_or_default(
                "TELEMETRY_FLUSH_INTERVAL_MS",
                var("TELEMETRY_FLUSH_INTERVAL_MS"),
                defaults.flush_interval,
            ),
            cool_down: millis_or_default(
                "TELEMETRY_COOL_DOWN_MS",
                var("TELEMETRY_COOL_DOWN_MS"),
                defaults.cool_down,
            ),
            queue_capacity: parse_or_default(
                "TELEMETRY_QUEUE_CAPACITY",
                var("TELEMETRY_QUEUE_CAPACITY"),
                defaults.queue_capacity,
            ),
            overflow_policy: var("TELEMETRY_OVERFLOW_POLICY")
                .map_or(defaults.overflow_policy, |policy| policy.trim().to_string()),
            connect_timeout: millis_or_default(
                "TELEMETRY_CONNECT_TIMEOUT_MS",
                var("TELEMETRY_CONNECT_TIMEOUT_MS"),
                defaults.connect_timeout,
            ),
            read_timeout: millis_or_default(
                "TELEMETRY_READ_TIMEOUT_MS",
                var("TELEMETRY_READ_TIMEOUT_MS"),
                defaults.read_timeout,
            ),
            metrics_read_timeout: millis_or_default(
                "TELEMETRY_METRICS_READ_TIMEOUT_MS",
                var("TELEMETRY_METRICS_READ_TIMEOUT_MS"),
                defaults.metrics_read_timeout,
            ),
            step: Duration::from_secs(parse_or_default(
                "TELEMETRY_STEP_SECS",
                var("TELEMETRY_STEP_SECS"),
                defaults.step.as_secs(),
            )),
            tags,
            log_level: var("TELEMETRY_LOG_LEVEL")
                .map_or(defaults.log_level, |level| level.trim().to_lowercase()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        OverflowPolicy::from_str(&self.overflow_policy)?;

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "Queue capacity must be greater than 0".to_string(),
            ));
        }

        if self.flush_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "Flush interval must be greater than 0".to_string(),
            ));
        }

        if self.step.is_zero() {
            return Err(ConfigError::Invalid(
                "Metric step must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            flush_interval: self.flush_interval,
            cool_down: self.cool_down,
            queue_capacity: self.queue_capacity,
            overflow_policy: OverflowPolicy::from_str(&self.overflow_policy).unwrap_or_default(),
        }
    }

    fn sink_config(&self, urls: &[Url], read_timeout: Duration) -> SinkConfig {
        SinkConfig {
            urls: urls.to_vec(),
            credentials: self.credentials.clone(),
            connect_timeout: self.connect_timeout,
            read_timeout,
        }
    }

    pub fn logs_sink(&self) -> SinkConfig {
        self.sink_config(&self.logs_urls, self.read_timeout)
    }

    pub fn traces_sink(&self) -> SinkConfig {
        self.sink_config(&self.traces_urls, self.read_timeout)
    }

    pub fn metrics_sink(&self) -> SinkConfig {
        self.sink_config(&self.metrics_urls, self.metrics_read_timeout)
    }
}
