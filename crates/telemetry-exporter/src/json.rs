// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming JSON encoding of records.
//!
//! Records are serialized straight into the request body writer, one object
//! per record, with a fixed field order per record kind:
//!
//! ```text
//! Log:    {"server","subject","content","level"}
//! Trace:  {"id","parentId","traceId","timestamp","duration","kind","tags":{..}}
//! Metric: {"id":{"name","description","baseUnit","type"},"tags":{..},"measure":{..}}
//! ```
//!
//! Strings are pure ASCII on the wire: anything outside ASCII is written as
//! `\uXXXX` (surrogate pairs above the BMP). Floats never use exponent
//! notation. Missing optional strings are written as `""`.

use crate::errors::EncodeError;
use crate::record::{LogRecord, Measurement, MetricSnapshot, TraceSpan};
use crate::tags::{merge, Tag, TagObject};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::ser::Formatter;
use std::fmt::Display;
use std::io;

/// Compact formatter that escapes non-ASCII code points and prints floats
/// in positional notation. Stateless, so every call builds its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct AsciiFormatter;

impl Formatter for AsciiFormatter {
    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let mut start = 0;
        for (index, ch) in fragment.char_indices() {
            if ch.is_ascii() {
                continue;
            }
            if start < index {
                writer.write_all(&fragment.as_bytes()[start..index])?;
            }
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                write!(writer, "\\u{unit:04x}")?;
            }
            start = index + ch.len_utf8();
        }
        writer.write_all(&fragment.as_bytes()[start..])
    }

    fn write_f64<W>(&mut self, writer: &mut W, value: f64) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        // `Display` for f64 is positional (1e21 prints all its digits)
        write!(writer, "{value}")
    }

    fn write_f32<W>(&mut self, writer: &mut W, value: f32) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        write!(writer, "{value}")
    }
}

/// Serializes `value` onto `writer` with [`AsciiFormatter`].
pub fn write_json<W, T>(writer: W, value: &T) -> Result<(), EncodeError>
where
    W: io::Write,
    T: ?Sized + Serialize,
{
    let mut serializer = serde_json::Serializer::with_formatter(writer, AsciiFormatter);
    value.serialize(&mut serializer)?;
    Ok(())
}

/// Turns one record into one request body.
///
/// `common_tags` is the pipeline's shared tag list; encoders that carry tags
/// append the ones the record does not already define.
pub trait RecordEncoder<R>: Send + Sync {
    fn encode<W: io::Write>(
        &self,
        record: &R,
        common_tags: &[Tag],
        writer: W,
    ) -> Result<(), EncodeError>;
}

fn display<T: Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

/// Log records carry the configured server id in front of their own fields.
#[derive(Debug, Clone)]
pub struct LogEncoder {
    server_id: String,
}

impl LogEncoder {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
        }
    }
}

#[derive(serde::Serialize)]
struct LogPayload<'a> {
    server: &'a str,
    subject: &'a str,
    content: &'a str,
    level: &'a str,
}

impl RecordEncoder<LogRecord> for LogEncoder {
    fn encode<W: io::Write>(
        &self,
        record: &LogRecord,
        _common_tags: &[Tag],
        writer: W,
    ) -> Result<(), EncodeError> {
        write_json(
            writer,
            &LogPayload {
                server: &self.server_id,
                subject: &record.subject,
                content: &record.content,
                level: &record.level,
            },
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TraceEncoder;

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct TracePayload<'a> {
    id: &'a str,
    parent_id: &'a str,
    trace_id: &'a str,
    timestamp: i64,
    duration: i64,
    kind: &'a str,
    tags: TagObject<'a>,
}

impl RecordEncoder<TraceSpan> for TraceEncoder {
    fn encode<W: io::Write>(
        &self,
        span: &TraceSpan,
        common_tags: &[Tag],
        writer: W,
    ) -> Result<(), EncodeError> {
        let tags = merge(span.tags(), common_tags);
        write_json(
            writer,
            &TracePayload {
                id: span.id(),
                parent_id: span.parent_id().unwrap_or_default(),
                trace_id: span.trace_id(),
                timestamp: span.timestamp(),
                duration: span.duration(),
                kind: span.kind(),
                tags: TagObject(&tags),
            },
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricEncoder;

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct MetricIdPayload<'a> {
    name: &'a str,
    description: &'a str,
    base_unit: &'a str,
    #[serde(rename = "type", serialize_with = "display")]
    metric_type: crate::record::MetricType,
}

#[derive(serde::Serialize)]
struct MetricPayload<'a> {
    id: MetricIdPayload<'a>,
    tags: TagObject<'a>,
    measure: MeasureObject<'a>,
}

struct MeasureObject<'a>(&'a [Measurement]);

impl Serialize for MeasureObject<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for measurement in self.0 {
            map.serialize_entry(&measurement.statistic.to_string(), &measurement.value)?;
        }
        map.end()
    }
}

impl RecordEncoder<MetricSnapshot> for MetricEncoder {
    fn encode<W: io::Write>(
        &self,
        snapshot: &MetricSnapshot,
        common_tags: &[Tag],
        writer: W,
    ) -> Result<(), EncodeError> {
        let id = snapshot.id();
        // serde_json would silently turn these into `null`
        if let Some(bad) = snapshot
            .measurements()
            .iter()
            .find(|measurement| !measurement.value.is_finite())
        {
            return Err(EncodeError::NonFiniteMeasurement {
                metric: id.name.clone(),
                statistic: bad.statistic.to_string(),
            });
        }
        let tags = merge(&id.tags, common_tags);
        write_json(
            writer,
            &MetricPayload {
                id: MetricIdPayload {
                    name: &id.name,
                    description: id.description.as_deref().unwrap_or_default(),
                    base_unit: id.base_unit.as_deref().unwrap_or_default(),
                    metric_type: id.metric_type,
                },
                tags: TagObject(&tags),
                measure: MeasureObject(snapshot.measurements()),
            },
        )
    }
}
