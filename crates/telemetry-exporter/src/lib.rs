// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Best-effort export of logs, trace spans and step-aggregated metrics.
//!
//! Producers hand records to a [`queue::BoundedRecordQueue`] without ever
//! blocking. A [`publisher::BackgroundPublisher`] task drains the queue on a
//! fixed interval, encodes every record as a single JSON object and POSTs it
//! to each configured collector through an [`sink::HttpSink`]. Metrics take a
//! detour through the [`aggregator::StepMetricAggregator`], which snapshots a
//! windowed [`meter::MeterRegistry`] once per step.
//!
//! ```text
//!  log / span / step snapshot
//!            │ enqueue (never blocks)
//!            v
//!   ┌─────────────────┐   drain every interval   ┌──────────┐   POST   ┌───────────┐
//!   │ BoundedRecord   │ ───────────────────────> │ encoder  │ ───────> │ collector │ (each URL)
//!   │ Queue (ring)    │                          └──────────┘          └───────────┘
//!   └─────────────────┘
//! ```
//!
//! Nothing here returns an error to producers. Transport and encoding
//! failures are logged and the affected record is dropped.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod aggregator;
pub mod config;
pub mod errors;
pub mod exporter;
pub mod exposition;
pub mod json;
pub mod logger;
pub mod meter;
pub mod publisher;
pub mod queue;
pub mod record;
pub mod sink;
pub mod tags;

#[cfg(test)]
pub(crate) mod test_support;
