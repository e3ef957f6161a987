// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Once per step, turns every registered instrument into a snapshot and
//! routes it to the metric publisher.
//!
//! Steady-state instruments go through the publisher queue. One-shot
//! instruments are published right away on the aggregation task and then
//! evicted whether or not the collector took them. Instruments whose
//! measurements are all NaN are evicted without being published.

use crate::errors::PublisherError;
use crate::exposition::PrometheusExposition;
use crate::json::MetricEncoder;
use crate::meter::{Meter, MeterRegistry};
use crate::publisher::BackgroundPublisher;
use crate::record::MetricSnapshot;
use crate::sink::Sink;
use futures::FutureExt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Instrument};

pub const DEFAULT_STEP: Duration = Duration::from_secs(60);

/// What one aggregation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepReport {
    /// Snapshots handed to the publisher queue.
    pub queued: usize,
    /// One-shot snapshots sent immediately.
    pub one_shot: usize,
    pub evicted: usize,
}

pub struct StepMetricAggregator<S> {
    registry: Arc<MeterRegistry>,
    /// Second registry the evictions are applied to as well.
    mirror: Option<Arc<MeterRegistry>>,
    publisher: Arc<BackgroundPublisher<MetricSnapshot, MetricEncoder, S>>,
    exposition: Option<Arc<PrometheusExposition>>,
    step: Duration,
    worker: Mutex<Option<CancellationToken>>,
}

impl<S> StepMetricAggregator<S>
where
    S: Sink + 'static,
{
    pub fn new(
        registry: Arc<MeterRegistry>,
        publisher: Arc<BackgroundPublisher<MetricSnapshot, MetricEncoder, S>>,
        step: Duration,
    ) -> Self {
        Self {
            registry,
            mirror: None,
            publisher,
            exposition: None,
            step,
            worker: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_mirror(mut self, mirror: Arc<MeterRegistry>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    #[must_use]
    pub fn with_exposition(mut self, exposition: Arc<PrometheusExposition>) -> Self {
        self.exposition = Some(exposition);
        self
    }

    pub fn registry(&self) -> &Arc<MeterRegistry> {
        &self.registry
    }

    pub fn publisher(&self) -> &Arc<BackgroundPublisher<MetricSnapshot, MetricEncoder, S>> {
        &self.publisher
    }

    pub fn exposition(&self) -> Option<&Arc<PrometheusExposition>> {
        self.exposition.as_ref()
    }

    pub fn step_duration(&self) -> Duration {
        self.step
    }

    /// Runs one aggregation pass over the registry.
    pub async fn step(&self) -> StepReport {
        let mut report = StepReport::default();
        let mut evict: Vec<Arc<dyn Meter>> = Vec::new();
        let mut collected = Vec::new();

        for meter in self.registry.meters() {
            let measurements = match catch_unwind(AssertUnwindSafe(|| meter.measure())) {
                Ok(measurements) => measurements,
                Err(_) => {
                    warn!("METRICS | Instrument '{}' panicked while measured, evicting", meter.id().name);
                    evict.push(meter);
                    continue;
                }
            };
            let Some(snapshot) = MetricSnapshot::new(meter.id().clone(), measurements) else {
                debug!("METRICS | '{}' has no valid measurement, evicting", meter.id().name);
                evict.push(meter);
                continue;
            };
            if self.exposition.is_some() {
                collected.push(snapshot.clone());
            }

            if meter.is_one_shot() {
                match self.publisher.publish_now(snapshot).await {
                    Some(sent) if !sent.all_failed() => {}
                    _ => debug!(
                        "METRICS | One-shot '{}' was not delivered",
                        meter.id().name
                    ),
                }
                report.one_shot += 1;
                evict.push(meter);
            } else {
                if !self.publisher.enqueue(snapshot) {
                    debug!("METRICS | Queue full, '{}' dropped for this step", meter.id().name);
                }
                report.queued += 1;
            }
        }

        if let Some(exposition) = &self.exposition {
            exposition.collect(&collected, &self.publisher.common_tags().snapshot());
        }

        for meter in &evict {
            self.registry.remove_instance(meter);
            if let Some(mirror) = &self.mirror {
                mirror.remove_instance(meter);
            }
        }
        report.evicted = evict.len();
        report
    }

    /// Spawns the step loop. The first pass runs one step after start.
    pub fn start(self: &Arc<Self>) -> Result<(), PublisherError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| PublisherError::NoRuntime)?;
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return Err(PublisherError::AlreadyRunning);
        }
        let cancel_token = CancellationToken::new();
        runtime.spawn(Arc::clone(self).run(cancel_token.clone()).in_current_span());
        *worker = Some(cancel_token);
        debug!("METRICS | Aggregation started, step {:?}", self.step);
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(cancel_token) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            cancel_token.cancel();
        }
    }

    async fn run(self: Arc<Self>, cancel_token: CancellationToken) {
        // a zero period would panic
        let mut interval = tokio::time::interval(self.step.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        interval.tick().await;
        loop {
            tokio::select! {
                () = cancel_token.cancelled() => break,
                _ = interval.tick() => {
                    match AssertUnwindSafe(self.step()).catch_unwind().await {
                        Ok(report) => debug!("METRICS | Step done: {report:?}"),
                        Err(_) => error!("METRICS | Aggregation pass aborted by a panic"),
                    }
                }
            }
        }
        debug!("METRICS | Aggregation stopped");
    }
}
