// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log line format for hosts that install this crate's subscriber.
//!
//! ```text
//! TELEMETRY | LEVEL | [span{fields}: ...] message fields
//! TELEMETRY | WARN | LOGS | Queue full, dropped 64 record(s) so far
//! ```

use std::fmt;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

pub const LOG_PREFIX: &str = "TELEMETRY";

/// Prefixes every line with [`LOG_PREFIX`] and the level, followed by the
/// active spans from the root down.
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(&mut writer, "{LOG_PREFIX} | {} | ", event.metadata().level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Filter for `level` with the HTTP stack silenced.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(format!("h2=off,hyper=off,rustls=off,{level}"))
        .unwrap_or_else(|_| EnvFilter::new("h2=off,hyper=off,rustls=off,info"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_prefix_level_and_span_context() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .event_format(Formatter)
            .with_writer(captured.clone())
            .with_env_filter(env_filter("debug"))
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("drain", channel = "LOGS");
            let _entered = span.enter();
            tracing::warn!("Queue full");
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert_eq!(output, "TELEMETRY | WARN | drain{channel=\"LOGS\"}: Queue full\n");
        assert!(!output.contains('\u{1b}'));
    }

    #[test]
    fn test_env_filter_falls_back_on_garbage() {
        let filter = env_filter("noisy=loudest");
        assert!(filter.to_string().contains("info"));
    }
}
