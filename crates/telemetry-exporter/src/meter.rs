// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Windowed instrument registry read by the step aggregator.
//!
//! Instruments report what happened during the step that just closed:
//! counters and timers reset when measured, gauges report their current
//! value. An instrument with nothing valid to report measures NaN.

use crate::record::{Measurement, MetricId, MetricType, Statistic};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tracing::warn;

/// Tag that marks an instrument as one-shot when its value is `true`.
pub const ONE_SHOT_TAG: &str = "oneshot";

/// Metric families that describe single trace events and are always
/// one-shot. `trace.span` also covers `trace.span.db` and so on.
pub const ONE_SHOT_METRIC_NAMES: &[&str] = &["trace.start", "trace.end", "trace.span"];

/// One-shot instruments are published once and then evicted.
pub fn is_one_shot(id: &MetricId) -> bool {
    if id
        .tag(ONE_SHOT_TAG)
        .is_some_and(|value| value.eq_ignore_ascii_case("true"))
    {
        return true;
    }
    ONE_SHOT_METRIC_NAMES.iter().any(|family| {
        id.name
            .strip_prefix(family)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
    })
}

pub trait Meter: Send + Sync {
    fn id(&self) -> &MetricId;

    /// Measurements for the step that just closed.
    fn measure(&self) -> Vec<Measurement>;

    fn is_one_shot(&self) -> bool {
        is_one_shot(self.id())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// f64 stored as bits.
#[derive(Debug)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }

    fn swap(&self, value: f64) -> f64 {
        f64::from_bits(self.0.swap(value.to_bits(), Ordering::AcqRel))
    }

    fn add(&self, delta: f64) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            });
    }
}

/// Step counter: reports the amount counted since the previous step.
#[derive(Debug)]
pub struct Counter {
    id: MetricId,
    count: AtomicF64,
}

impl Counter {
    pub fn new(mut id: MetricId) -> Self {
        id.metric_type = MetricType::Counter;
        Self {
            id,
            count: AtomicF64::new(0.0),
        }
    }

    pub fn increment(&self) {
        self.increment_by(1.0);
    }

    /// Negative and NaN amounts are ignored.
    pub fn increment_by(&self, amount: f64) {
        if amount > 0.0 {
            self.count.add(amount);
        }
    }
}

impl Meter for Counter {
    fn id(&self) -> &MetricId {
        &self.id
    }

    fn measure(&self) -> Vec<Measurement> {
        vec![Measurement::new(Statistic::Count, self.count.swap(0.0))]
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Holds the last value set. Unset gauges measure NaN.
#[derive(Debug)]
pub struct Gauge {
    id: MetricId,
    value: AtomicF64,
}

impl Gauge {
    pub fn new(mut id: MetricId) -> Self {
        id.metric_type = MetricType::Gauge;
        Self {
            id,
            value: AtomicF64::new(f64::NAN),
        }
    }

    pub fn set(&self, value: f64) {
        self.value.store(value);
    }

    pub fn value(&self) -> f64 {
        self.value.load()
    }
}

impl Meter for Gauge {
    fn id(&self) -> &MetricId {
        &self.id
    }

    fn measure(&self) -> Vec<Measurement> {
        vec![Measurement::new(Statistic::Value, self.value.load())]
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Gauge computed from weakly referenced state. Once the state is dropped
/// the gauge measures NaN and gets evicted at the next step.
pub struct FnGauge {
    id: MetricId,
    read: Box<dyn Fn() -> f64 + Send + Sync>,
}

impl FnGauge {
    pub fn new<T>(mut id: MetricId, state: &Arc<T>, read: fn(&T) -> f64) -> Self
    where
        T: Send + Sync + 'static,
    {
        id.metric_type = MetricType::Gauge;
        let state: Weak<T> = Arc::downgrade(state);
        Self {
            id,
            read: Box::new(move || state.upgrade().map_or(f64::NAN, |state| read(&state))),
        }
    }
}

impl Meter for FnGauge {
    fn id(&self) -> &MetricId {
        &self.id
    }

    fn measure(&self) -> Vec<Measurement> {
        vec![Measurement::new(Statistic::Value, (self.read)())]
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[derive(Debug, Default)]
struct TimerStep {
    count: u64,
    total_ms: f64,
    max_ms: f64,
}

/// Step timer reporting count, total time and max in milliseconds.
#[derive(Debug)]
pub struct Timer {
    id: MetricId,
    step: Mutex<TimerStep>,
}

impl Timer {
    pub fn new(mut id: MetricId) -> Self {
        id.metric_type = MetricType::Timer;
        if id.base_unit.is_none() {
            id.base_unit = Some("milliseconds".to_string());
        }
        Self {
            id,
            step: Mutex::new(TimerStep::default()),
        }
    }

    pub fn record(&self, duration: Duration) {
        let millis = duration.as_secs_f64() * 1000.0;
        let mut step = self.step.lock().unwrap_or_else(PoisonError::into_inner);
        step.count += 1;
        step.total_ms += millis;
        step.max_ms = step.max_ms.max(millis);
    }
}

impl Meter for Timer {
    fn id(&self) -> &MetricId {
        &self.id
    }

    #[allow(clippy::cast_precision_loss)]
    fn measure(&self) -> Vec<Measurement> {
        let step = std::mem::take(&mut *self.step.lock().unwrap_or_else(PoisonError::into_inner));
        vec![
            Measurement::new(Statistic::Count, step.count as f64),
            Measurement::new(Statistic::TotalTime, step.total_ms),
            Measurement::new(Statistic::Max, step.max_ms),
        ]
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

fn same_instance(a: &Arc<dyn Meter>, b: &Arc<dyn Meter>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Instruments keyed by [`MetricId`].
#[derive(Default)]
pub struct MeterRegistry {
    meters: Mutex<HashMap<MetricId, Arc<dyn Meter>>>,
}

impl MeterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, id: MetricId) -> Arc<Counter> {
        self.get_or_register(Counter::new(id))
    }

    pub fn gauge(&self, id: MetricId) -> Arc<Gauge> {
        self.get_or_register(Gauge::new(id))
    }

    pub fn gauge_fn<T>(&self, id: MetricId, state: &Arc<T>, read: fn(&T) -> f64) -> Arc<FnGauge>
    where
        T: Send + Sync + 'static,
    {
        self.get_or_register(FnGauge::new(id, state, read))
    }

    pub fn timer(&self, id: MetricId) -> Arc<Timer> {
        self.get_or_register(Timer::new(id))
    }

    /// Registers `meter` unless an instrument with the same id exists, in
    /// which case the existing one is returned.
    pub fn register(&self, meter: Arc<dyn Meter>) -> Arc<dyn Meter> {
        let mut meters = self.meters.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            meters
                .entry(meter.id().clone())
                .or_insert_with(|| meter),
        )
    }

    fn get_or_register<M: Meter + 'static>(&self, candidate: M) -> Arc<M> {
        let mut meters = self.meters.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = meters.get(candidate.id()) {
            match Arc::clone(existing).as_any().downcast::<M>() {
                Ok(meter) => return meter,
                Err(_) => {
                    warn!(
                        "METRICS | '{}' is already registered with another instrument kind, \
                         returning an unregistered instrument",
                        candidate.id().name
                    );
                    return Arc::new(candidate);
                }
            }
        }
        let meter = Arc::new(candidate);
        meters.insert(meter.id().clone(), Arc::clone(&meter) as Arc<dyn Meter>);
        meter
    }

    pub fn get(&self, id: &MetricId) -> Option<Arc<dyn Meter>> {
        self.meters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn remove(&self, id: &MetricId) -> Option<Arc<dyn Meter>> {
        self.meters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Removes `meter` only if it is still the registered instance for its
    /// id, so a replacement registered meanwhile survives.
    pub fn remove_instance(&self, meter: &Arc<dyn Meter>) -> bool {
        let mut meters = self.meters.lock().unwrap_or_else(PoisonError::into_inner);
        match meters.get(meter.id()) {
            Some(current) if same_instance(current, meter) => {
                meters.remove(meter.id());
                true
            }
            _ => false,
        }
    }

    /// Snapshot of the registered instruments.
    pub fn meters(&self) -> Vec<Arc<dyn Meter>> {
        self.meters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn contains(&self, id: &MetricId) -> bool {
        self.meters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.meters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
