// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background draining of a record queue into a sink.
//!
//! One [`BackgroundPublisher`] owns one queue and one task. The task
//! alternates between draining the queue completely and sleeping for the
//! flush interval:
//!
//! ```text
//!   Stopped ──start()──> Running ──stop()──> Stopping ──task exits──> Stopped
//!
//!   Running:   drain ─> sleep(interval) ─> drain ─> ...
//!                │
//!                └── panic escapes a pass ─> log ─> sleep(cool_down) ─> drain
//! ```
//!
//! A record that fails to encode, or whose encoder panics, is logged and
//! skipped; the rest of the pass continues. Only a panic outside encoding
//! (in the sink, say) aborts the pass and triggers the cool-down.
//! `stop()` wakes the task and returns immediately. Records still queued at
//! that point are never sent.

use crate::errors::PublisherError;
use crate::json::{LogEncoder, MetricEncoder, RecordEncoder, TraceEncoder};
use crate::queue::{BoundedRecordQueue, OverflowPolicy, DEFAULT_QUEUE_CAPACITY};
use crate::record::{LogRecord, MetricSnapshot, TraceSpan};
use crate::sink::{HttpSink, SendReport, Sink};
use crate::tags::{CommonTags, Tag};
use bytes::{BufMut, Bytes, BytesMut};
use futures::FutureExt;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Instrument};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_COOL_DOWN: Duration = Duration::from_secs(10);

pub type LogPublisher = BackgroundPublisher<LogRecord, LogEncoder, HttpSink>;
pub type TracePublisher = BackgroundPublisher<TraceSpan, TraceEncoder, HttpSink>;
pub type MetricPublisher = BackgroundPublisher<MetricSnapshot, MetricEncoder, HttpSink>;

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub flush_interval: Duration,
    /// Pause after a drain pass failed as a whole.
    pub cool_down: Duration,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            cool_down: DEFAULT_COOL_DOWN,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow_policy: OverflowPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PublisherState {
    Stopped = 0,
    Running = 1,
    Stopping = 2,
}

impl PublisherState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    /// Records encoded and handed to the sink, whatever the delivery outcome.
    pub sent: u64,
    /// Records dropped because encoding failed or panicked.
    pub encode_failures: u64,
    /// Drain passes aborted by a panic outside encoding.
    pub systemic_failures: u64,
}

struct Shared<R, E, S> {
    name: &'static str,
    queue: BoundedRecordQueue<R>,
    encoder: E,
    sink: S,
    common_tags: CommonTags,
    state: AtomicU8,
    sent: AtomicU64,
    encode_failures: AtomicU64,
    systemic_failures: AtomicU64,
}

impl<R, E, S> Shared<R, E, S>
where
    E: RecordEncoder<R>,
    S: Sink,
{
    fn set_state(&self, state: PublisherState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn state(&self) -> PublisherState {
        PublisherState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn encode(&self, record: &R, common_tags: &[Tag]) -> Option<Bytes> {
        let mut body = BytesMut::with_capacity(256).writer();
        let encoded = catch_unwind(AssertUnwindSafe(|| {
            self.encoder.encode(record, common_tags, &mut body)
        }));
        match encoded {
            Ok(Ok(())) => Some(body.into_inner().freeze()),
            Ok(Err(e)) => {
                self.encode_failures.fetch_add(1, Ordering::Relaxed);
                warn!("{} | Failed to encode record, dropped: {}", self.name, e);
                None
            }
            Err(panic) => {
                self.encode_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    "{} | Encoder panicked, record dropped: {}",
                    self.name,
                    panic_message(panic.as_ref())
                );
                None
            }
        }
    }

    async fn publish(&self, body: Bytes) -> SendReport {
        self.sent.fetch_add(1, Ordering::Relaxed);
        let report = self.sink.send(body).await;
        if report.all_failed() {
            debug!("{} | Record not accepted by any collector", self.name);
        }
        report
    }

    /// Sends everything currently queued. Stops early once cancelled.
    async fn drain(&self, cancel_token: &CancellationToken) -> usize {
        let common_tags = self.common_tags.snapshot();
        let mut drained = 0;
        while !cancel_token.is_cancelled() {
            // the record must not live across the send
            let body = {
                let Some(record) = self.queue.dequeue() else {
                    break;
                };
                drained += 1;
                self.encode(&record, &common_tags)
            };
            if let Some(body) = body {
                self.publish(body).await;
            }
        }
        drained
    }
}

struct Worker {
    cancel_token: CancellationToken,
}

/// Generic drain-on-interval exporter, see the module docs.
pub struct BackgroundPublisher<R, E, S> {
    shared: Arc<Shared<R, E, S>>,
    config: PublisherConfig,
    worker: Mutex<Option<Worker>>,
}

impl<R, E, S> BackgroundPublisher<R, E, S>
where
    R: Send + 'static,
    E: RecordEncoder<R> + 'static,
    S: Sink + 'static,
{
    /// The queue exists from construction on, so records enqueued before
    /// `start()` are sent by the first drain pass.
    pub fn new(
        name: &'static str,
        encoder: E,
        sink: S,
        common_tags: CommonTags,
        config: PublisherConfig,
    ) -> Self {
        let queue = BoundedRecordQueue::new(name, config.queue_capacity, config.overflow_policy);
        Self {
            shared: Arc::new(Shared {
                name,
                queue,
                encoder,
                sink,
                common_tags,
                state: AtomicU8::new(PublisherState::Stopped as u8),
                sent: AtomicU64::new(0),
                encode_failures: AtomicU64::new(0),
                systemic_failures: AtomicU64::new(0),
            }),
            config,
            worker: Mutex::new(None),
        }
    }

    /// Never blocks and never touches the network.
    pub fn enqueue(&self, record: R) -> bool {
        self.shared.queue.enqueue(record)
    }

    /// Encodes and sends `record` on the caller's task, bypassing the queue.
    pub async fn publish_now(&self, record: R) -> Option<SendReport> {
        let common_tags = self.shared.common_tags.snapshot();
        let body = self.shared.encode(&record, &common_tags);
        drop(record);
        match body {
            Some(body) => Some(self.shared.publish(body).await),
            None => None,
        }
    }

    /// Spawns the drain task on the current tokio runtime.
    pub fn start(&self) -> Result<(), PublisherError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| PublisherError::NoRuntime)?;
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if self.shared.state() != PublisherState::Stopped {
            return Err(PublisherError::AlreadyRunning);
        }

        let cancel_token = CancellationToken::new();
        self.shared.set_state(PublisherState::Running);
        runtime.spawn(
            run(
                Arc::clone(&self.shared),
                self.config.clone(),
                cancel_token.clone(),
            )
            .in_current_span(),
        );
        *worker = Some(Worker { cancel_token });
        debug!(
            "{} | Publisher started, flushing every {:?}",
            self.shared.name, self.config.flush_interval
        );
        Ok(())
    }

    /// Wakes the task and returns without waiting for it. Does not flush.
    pub fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if self.shared.state() == PublisherState::Running {
                self.shared.set_state(PublisherState::Stopping);
            }
            worker.cancel_token.cancel();
            debug!(
                "{} | Publisher stopping, {} queued record(s) abandoned",
                self.shared.name,
                self.shared.queue.len()
            );
        }
    }

    pub fn state(&self) -> PublisherState {
        self.shared.state()
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            sent: self.shared.sent.load(Ordering::Relaxed),
            encode_failures: self.shared.encode_failures.load(Ordering::Relaxed),
            systemic_failures: self.shared.systemic_failures.load(Ordering::Relaxed),
        }
    }

    pub fn queue(&self) -> &BoundedRecordQueue<R> {
        &self.shared.queue
    }

    pub fn sink(&self) -> &S {
        &self.shared.sink
    }

    pub fn common_tags(&self) -> &CommonTags {
        &self.shared.common_tags
    }
}

impl<R, E, S> Drop for BackgroundPublisher<R, E, S> {
    fn drop(&mut self) {
        let worker = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            worker.cancel_token.cancel();
        }
    }
}

/// Sleeps for `duration`. Returns `false` if woken by cancellation.
async fn sleep_or_cancelled(duration: Duration, cancel_token: &CancellationToken) -> bool {
    tokio::select! {
        () = tokio::time::sleep(duration) => !cancel_token.is_cancelled(),
        () = cancel_token.cancelled() => false,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

async fn run<R, E, S>(
    shared: Arc<Shared<R, E, S>>,
    config: PublisherConfig,
    cancel_token: CancellationToken,
) where
    R: Send + 'static,
    E: RecordEncoder<R> + 'static,
    S: Sink + 'static,
{
    while !cancel_token.is_cancelled() {
        let pass = AssertUnwindSafe(shared.drain(&cancel_token))
            .catch_unwind()
            .await;
        let pause = match pass {
            Ok(drained) => {
                if drained > 0 {
                    debug!("{} | Drained {} record(s)", shared.name, drained);
                }
                config.flush_interval
            }
            Err(panic) => {
                shared.systemic_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    "{} | Drain pass aborted: {}, resuming in {:?}",
                    shared.name,
                    panic_message(panic.as_ref()),
                    config.cool_down
                );
                config.cool_down
            }
        };
        if !sleep_or_cancelled(pause, &cancel_token).await {
            break;
        }
    }
    shared.set_state(PublisherState::Stopped);
    debug!("{} | Publisher stopped", shared.name);
}
