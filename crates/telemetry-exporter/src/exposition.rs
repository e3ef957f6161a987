// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pull-style text exposition of the latest step snapshots.
//!
//! Each collection merges its samples into the families already held: a
//! sample replaces the previous one with the same label set and leaves the
//! others alone. When the number of families passes
//! [`MAX_SAMPLE_FAMILIES`] everything is dropped and rebuilt from the next
//! collection.
//!
//! A family name carries exactly one type. Statistics without a natural
//! counter meaning are exposed as gauges, and a sample whose type disagrees
//! with the family already holding its name is skipped.

use crate::record::{MetricSnapshot, MetricType, Statistic};
use crate::tags::{merge, Tag};
use prometheus::proto::{Counter, Gauge, LabelPair, Metric, MetricFamily, MetricType as ProtoType};
use prometheus::{Encoder, TextEncoder};
use std::collections::BTreeMap;
use std::io;
use std::sync::{Mutex, PoisonError};
use tracing::warn;

pub const MAX_SAMPLE_FAMILIES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FamilyKind {
    Counter,
    Gauge,
}

#[derive(Debug)]
struct Family {
    kind: FamilyKind,
    help: String,
    samples: BTreeMap<Vec<(String, String)>, f64>,
}

#[derive(Debug, Default)]
pub struct PrometheusExposition {
    /// Keyed by exposed family name.
    families: Mutex<BTreeMap<String, Family>>,
}

/// Replaces characters outside `[a-zA-Z0-9_:]`; a leading digit gets a `_`.
fn sanitize_metric_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

fn sanitize_label_name(name: &str) -> String {
    sanitize_metric_name(name).replace(':', "_")
}

/// Family name suffix and kind for one statistic of a metric.
fn family_of(metric_type: MetricType, statistic: Statistic) -> (&'static str, FamilyKind) {
    match (statistic, metric_type) {
        (Statistic::Count, MetricType::Counter) => ("_total", FamilyKind::Counter),
        (Statistic::Count, _) => ("_count", FamilyKind::Counter),
        (Statistic::Total | Statistic::TotalTime, _) => ("_sum", FamilyKind::Counter),
        (Statistic::Max, _) => ("_max", FamilyKind::Gauge),
        (Statistic::ActiveTasks, _) => ("_active_count", FamilyKind::Gauge),
        (Statistic::Duration, _) => ("_duration_sum", FamilyKind::Gauge),
        (Statistic::Value | Statistic::Unknown, _) => ("", FamilyKind::Gauge),
    }
}

impl PrometheusExposition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges one step worth of snapshots. `common_tags` become labels
    /// unless the metric defines the same key.
    pub fn collect(&self, snapshots: &[MetricSnapshot], common_tags: &[Tag]) {
        let mut families = self.families.lock().unwrap_or_else(PoisonError::into_inner);
        if families.len() > MAX_SAMPLE_FAMILIES {
            warn!(
                "METRICS | {} exposition families exceed the limit of {}, rebuilding",
                families.len(),
                MAX_SAMPLE_FAMILIES
            );
            families.clear();
        }

        for snapshot in snapshots {
            let id = snapshot.id();
            let base = sanitize_metric_name(&id.name);
            let labels: Vec<(String, String)> = merge(&id.tags, common_tags)
                .into_iter()
                .map(|tag| (sanitize_label_name(&tag.key), tag.value.clone()))
                .collect();
            for measurement in snapshot.measurements() {
                let (suffix, kind) = family_of(id.metric_type, measurement.statistic);
                let name = format!("{base}{suffix}");
                let family = families.entry(name).or_insert_with_key(|_| Family {
                    kind,
                    help: id.description.clone().unwrap_or_else(|| id.name.clone()),
                    samples: BTreeMap::new(),
                });
                if family.kind != kind {
                    warn!(
                        "METRICS | '{}{}' is already exposed as a {:?}, skipping {} of '{}'",
                        base, suffix, family.kind, measurement.statistic, id.name
                    );
                    continue;
                }
                family.samples.insert(labels.clone(), measurement.value);
            }
        }
    }

    pub fn family_count(&self) -> usize {
        self.families
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn metric_families(&self) -> Vec<MetricFamily> {
        let families = self.families.lock().unwrap_or_else(PoisonError::into_inner);
        families
            .iter()
            .filter(|(_, family)| !family.samples.is_empty())
            .map(|(name, family)| {
                let mut proto = MetricFamily::default();
                proto.set_name(name.clone());
                proto.set_help(family.help.clone());
                proto.set_field_type(match family.kind {
                    FamilyKind::Counter => ProtoType::COUNTER,
                    FamilyKind::Gauge => ProtoType::GAUGE,
                });
                for (labels, value) in &family.samples {
                    let mut metric = Metric::default();
                    for (name, label_value) in labels {
                        let mut pair = LabelPair::default();
                        pair.set_name(name.clone());
                        pair.set_value(label_value.clone());
                        metric.mut_label().push(pair);
                    }
                    match family.kind {
                        FamilyKind::Counter => {
                            let mut counter = Counter::default();
                            counter.set_value(*value);
                            metric.set_counter(counter);
                        }
                        FamilyKind::Gauge => {
                            let mut gauge = Gauge::default();
                            gauge.set_value(*value);
                            metric.set_gauge(gauge);
                        }
                    }
                    proto.mut_metric().push(metric);
                }
                proto
            })
            .collect()
    }

    /// Writes the text exposition format.
    pub fn write<W: io::Write>(&self, writer: &mut W) -> prometheus::Result<()> {
        TextEncoder::new().encode(&self.metric_families(), writer)
    }

    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = self.write(&mut buffer) {
            warn!("METRICS | Failed to render exposition: {e}");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
