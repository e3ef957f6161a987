// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP fan-out of encoded records to every configured collector.

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use futures::future::join_all;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use std::fmt;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, error};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_METRICS_READ_TIMEOUT: Duration = Duration::from_secs(6);

/// Basic-auth credentials. The password never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    fn header_value(&self) -> Option<HeaderValue> {
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.username, self.password));
        match HeaderValue::from_str(&format!("Basic {encoded}")) {
            Ok(mut value) => {
                value.set_sensitive(true);
                Some(value)
            }
            Err(e) => {
                error!("Unable to build Authorization header: {e}");
                None
            }
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub urls: Vec<Url>,
    pub credentials: Option<Credentials>,
    pub connect_timeout: Duration,
    /// Longest wait for any single read from the collector once connected.
    pub read_timeout: Duration,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            credentials: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Outcome of one fan-out. Only used for logging and tests, a failed
/// delivery is never retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReport {
    pub delivered: usize,
    pub failed: usize,
}

impl SendReport {
    pub fn all_failed(&self) -> bool {
        self.delivered == 0 && self.failed > 0
    }
}

/// Destination of encoded record bodies.
///
/// Implementations absorb every failure; callers only ever get a report.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn send(&self, body: Bytes) -> SendReport;
}

pub struct HttpSink {
    /// Log prefix, e.g. "TRACES".
    name: &'static str,
    client: reqwest::Client,
    urls: Vec<Url>,
    /// Cached `Basic ...` value, rebuilt only when credentials change.
    authorization: RwLock<Option<HeaderValue>>,
}

impl HttpSink {
    #[must_use]
    pub fn new(name: &'static str, config: SinkConfig) -> Self {
        let client = get_client(name, &config);
        let authorization = config.credentials.as_ref().and_then(Credentials::header_value);
        HttpSink {
            name,
            client,
            urls: config.urls,
            authorization: RwLock::new(authorization),
        }
    }

    pub fn urls(&self) -> &[Url] {
        &self.urls
    }

    pub fn set_credentials(&self, credentials: Option<Credentials>) {
        let value = credentials.as_ref().and_then(Credentials::header_value);
        *self
            .authorization
            .write()
            .unwrap_or_else(PoisonError::into_inner) = value;
    }

    fn authorization(&self) -> Option<HeaderValue> {
        self.authorization
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn post(&self, url: &Url, body: Bytes, authorization: Option<HeaderValue>) -> bool {
        let mut request = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(value) = authorization {
            request = request.header(AUTHORIZATION, value);
        }

        match request.send().await {
            Ok(resp) if resp.status() == StatusCode::OK => true,
            Ok(resp) => {
                debug!(
                    "{} | Collector {} answered {}, record dropped",
                    self.name,
                    url,
                    resp.status()
                );
                false
            }
            Err(e) => {
                debug!("{} | Failed to POST to {}: {}", self.name, url, e);
                false
            }
        }
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn send(&self, body: Bytes) -> SendReport {
        let authorization = self.authorization();
        let attempts = self
            .urls
            .iter()
            .map(|url| self.post(url, body.clone(), authorization.clone()));

        let mut report = SendReport::default();
        for delivered in join_all(attempts).await {
            if delivered {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }
        report
    }
}

impl fmt::Debug for HttpSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSink")
            .field("name", &self.name)
            .field("urls", &self.urls)
            .finish_non_exhaustive()
    }
}

fn get_client(name: &str, config: &SinkConfig) -> reqwest::Client {
    match reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.read_timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!("{name} | Failed to build HTTP client: {e}, using reqwest defaults");
            reqwest::Client::new()
        }
    }
}
