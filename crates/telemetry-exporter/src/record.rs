// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The three record shapes that flow through the pipeline.

use crate::errors::SpanError;
use crate::tags::Tag;
use derive_more::Display;
use std::hash::{Hash, Hasher};

/// A single log line handed over by the logging framework.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub subject: String,
    pub content: String,
    pub level: String,
}

impl LogRecord {
    pub fn new(
        subject: impl Into<String>,
        content: impl Into<String>,
        level: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            content: content.into(),
            level: level.into(),
        }
    }
}

/// A completed span. `id`, `trace_id` and `kind` are never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceSpan {
    id: String,
    parent_id: Option<String>,
    trace_id: String,
    /// Start of the span, milliseconds since the unix epoch.
    timestamp: i64,
    /// Milliseconds.
    duration: i64,
    kind: String,
    tags: Vec<Tag>,
}

impl TraceSpan {
    pub fn new(
        id: impl Into<String>,
        parent_id: Option<String>,
        trace_id: impl Into<String>,
        timestamp: i64,
        duration: i64,
        kind: impl Into<String>,
    ) -> Result<Self, SpanError> {
        let id = id.into();
        let trace_id = trace_id.into();
        let kind = kind.into();
        if id.is_empty() {
            return Err(SpanError::EmptyId);
        }
        if trace_id.is_empty() {
            return Err(SpanError::EmptyTraceId);
        }
        if kind.is_empty() {
            return Err(SpanError::EmptyKind);
        }
        Ok(Self {
            id,
            parent_id,
            trace_id,
            timestamp,
            duration,
            kind,
            tags: Vec::new(),
        })
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push(Tag::new(key, value));
        self
    }

    #[must_use]
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = Tag>) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum MetricType {
    #[display("COUNTER")]
    Counter,
    #[display("GAUGE")]
    Gauge,
    #[display("SUMMARY")]
    Summary,
    #[display("TIMER")]
    Timer,
    #[display("OTHER")]
    Other,
}

/// What a single measurement of an instrument represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Statistic {
    #[display("count")]
    Count,
    #[display("total")]
    Total,
    #[display("total_time")]
    TotalTime,
    #[display("max")]
    Max,
    #[display("value")]
    Value,
    #[display("active_tasks")]
    ActiveTasks,
    #[display("duration")]
    Duration,
    #[display("unknown")]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub statistic: Statistic,
    pub value: f64,
}

impl Measurement {
    pub fn new(statistic: Statistic, value: f64) -> Self {
        Self { statistic, value }
    }
}

/// Identity of an instrument.
///
/// Equality and hashing consider the name, the type and the tag *set*;
/// the declared tag order is kept for serialization only.
#[derive(Debug, Clone)]
pub struct MetricId {
    pub name: String,
    pub description: Option<String>,
    pub base_unit: Option<String>,
    pub metric_type: MetricType,
    pub tags: Vec<Tag>,
}

impl MetricId {
    pub fn new(name: impl Into<String>, metric_type: MetricType) -> Self {
        Self {
            name: name.into(),
            description: None,
            base_unit: None,
            metric_type,
            tags: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_base_unit(mut self, base_unit: impl Into<String>) -> Self {
        self.base_unit = Some(base_unit.into());
        self
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push(Tag::new(key, value));
        self
    }

    #[must_use]
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = Tag>) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.key == key)
            .map(|tag| tag.value.as_str())
    }

    fn sorted_tags(&self) -> Vec<&Tag> {
        let mut tags: Vec<&Tag> = self.tags.iter().collect();
        tags.sort();
        tags
    }
}

impl PartialEq for MetricId {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.metric_type == other.metric_type
            && self.tags.len() == other.tags.len()
            && self.sorted_tags() == other.sorted_tags()
    }
}

impl Eq for MetricId {}

impl Hash for MetricId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.metric_type.hash(state);
        self.sorted_tags().hash(state);
    }
}

/// One step's worth of an instrument's valid measurements.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSnapshot {
    id: MetricId,
    measurements: Vec<Measurement>,
}

impl MetricSnapshot {
    /// Drops NaN measurements. Returns `None` when nothing valid remains,
    /// which marks the instrument as inactive.
    pub fn new(id: MetricId, measurements: impl IntoIterator<Item = Measurement>) -> Option<Self> {
        let measurements: Vec<Measurement> = measurements
            .into_iter()
            .filter(|measurement| !measurement.value.is_nan())
            .collect();
        if measurements.is_empty() {
            return None;
        }
        Some(Self { id, measurements })
    }

    pub fn id(&self) -> &MetricId {
        &self.id
    }

    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }
}
