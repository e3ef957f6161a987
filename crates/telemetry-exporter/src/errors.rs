// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Rejected configuration values.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid collector URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Unsupported scheme '{scheme}' in collector URL '{url}', expected http or https")]
    UnsupportedScheme { url: String, scheme: String },

    #[error("Invalid overflow policy '{0}', expected drop_oldest or drop_newest")]
    InvalidOverflowPolicy(String),

    #[error("Invalid tag '{0}', expected key:value")]
    InvalidTag(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// A trace span violated one of its construction invariants.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SpanError {
    #[error("span id must not be empty")]
    EmptyId,

    #[error("trace id must not be empty")]
    EmptyTraceId,

    #[error("span kind must not be empty")]
    EmptyKind,
}

/// A single record could not be encoded. Never fatal to the drain loop.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("measurement '{statistic}' of '{metric}' is not a finite number")]
    NonFiniteMeasurement { metric: String, statistic: String },

    #[error("record rejected by encoder: {0}")]
    Rejected(String),

    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PublisherError {
    #[error("publisher is already running")]
    AlreadyRunning,

    #[error("publisher must be started from within a tokio runtime")]
    NoRuntime,
}
