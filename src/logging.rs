//! Structured logging setup.
//!
//! Mirrors the teacher framework's `tracing` registry setup, generalized to
//! always run (a proxy has no reason to ship without logging) and to
//! optionally tee output to a file in addition to stdout.

use std::path::Path;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{Layer, fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt};

/// Guard returned by [`init`]; dropping it flushes the non-blocking file
/// writer. Must be held for the lifetime of the process.
pub struct LoggingGuard(#[allow(dead_code)] Option<tracing_appender::non_blocking::WorkerGuard>);

/// Initializes the global tracing subscriber. When `log_file` is set, logs
/// are additionally written there via a non-blocking appender.
pub fn init(log_file: Option<&Path>) -> LoggingGuard {
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .with_filter(LevelFilter::INFO);

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
            let file_name = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("remote-cache-proxy.log"));
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking)
                .with_filter(LevelFilter::INFO);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .init();

    LoggingGuard(guard)
}
