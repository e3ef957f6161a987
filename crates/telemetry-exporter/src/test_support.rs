// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared fakes for unit tests.

use crate::errors::EncodeError;
use crate::json::{write_json, RecordEncoder};
use crate::sink::{SendReport, Sink};
use crate::tags::Tag;
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Captures every body it is handed.
#[derive(Default)]
pub(crate) struct RecordingSink {
    bodies: Mutex<Vec<String>>,
    fail: AtomicBool,
    panic_next: AtomicBool,
    delay: Option<Duration>,
}

impl RecordingSink {
    pub(crate) fn failing() -> Self {
        let sink = Self::default();
        sink.fail.store(true, Ordering::SeqCst);
        sink
    }

    /// Panics on the first send, then behaves normally.
    pub(crate) fn panicking_once() -> Self {
        let sink = Self::default();
        sink.panic_next.store(true, Ordering::SeqCst);
        sink
    }

    pub(crate) fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub(crate) fn bodies(&self) -> Vec<String> {
        self.bodies.lock().unwrap().clone()
    }

    pub(crate) fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn send(&self, body: Bytes) -> SendReport {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("sink blew up");
        }
        self.bodies
            .lock()
            .unwrap()
            .push(String::from_utf8(body.to_vec()).unwrap());
        if self.fail.load(Ordering::SeqCst) {
            SendReport {
                delivered: 0,
                failed: 1,
            }
        } else {
            SendReport {
                delivered: 1,
                failed: 0,
            }
        }
    }
}

/// Encodes plain strings; `"bad"` fails to encode and `"boom"` panics.
#[derive(Default)]
pub(crate) struct StringEncoder;

#[derive(serde::Serialize)]
struct StringPayload<'a> {
    value: &'a str,
}

impl RecordEncoder<String> for StringEncoder {
    fn encode<W: io::Write>(
        &self,
        record: &String,
        _common_tags: &[Tag],
        writer: W,
    ) -> Result<(), EncodeError> {
        match record.as_str() {
            "bad" => Err(EncodeError::Rejected("malformed test record".to_string())),
            "boom" => panic!("encoder blew up"),
            value => write_json(writer, &StringPayload { value }),
        }
    }
}

/// Polls `condition` every few milliseconds until it holds or `timeout`
/// elapses. Returns whether it held.
pub(crate) async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
