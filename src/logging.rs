//! Diagnostics for dupctl.
//!
//! Everything here goes to stderr through `tracing`, pretty or JSON. Duplicity's
//! own output is not logged; it travels through the runner's output sink, and
//! [`RelayLog`] only summarises how much of it went past.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::core::Stream;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// One JSON object per event
    pub json: bool,
    /// Default level DEBUG instead of INFO
    pub verbose: bool,
}

/// Install the global subscriber. `RUST_LOG` overrides the level from `config`.
pub fn init(config: LogConfig) {
    let level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("dupctl={}", level.as_str().to_lowercase())));

    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        // Operation spans close with their duration, so runs can be timed from the log.
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true),
            )
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .init();
    }
}

/// Relayed output since the previous report for one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayTally {
    pub chunks: u64,
    pub bytes: u64,
}

#[derive(Default)]
struct StreamCounters {
    /// Milliseconds since `RelayLog::start`, offset by one so 0 means "never reported".
    last_report: AtomicU64,
    chunks: AtomicU64,
    bytes: AtomicU64,
}

/// Counts relayed chunks per stream and hands out a tally at most once per interval.
///
/// A chatty stdout does not hide stderr activity: each stream has its own clock.
pub struct RelayLog {
    interval_ms: u64,
    start: Instant,
    stdout: StreamCounters,
    stderr: StreamCounters,
}

impl RelayLog {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            start: Instant::now(),
            stdout: StreamCounters::default(),
            stderr: StreamCounters::default(),
        }
    }

    /// Count one chunk. Returns the accumulated tally when this stream is due a report.
    pub fn record(&self, stream: Stream, bytes: usize) -> Option<RelayTally> {
        let counters = match stream {
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        };
        counters.chunks.fetch_add(1, Ordering::Relaxed);
        counters.bytes.fetch_add(bytes as u64, Ordering::Relaxed);

        let now = self.start.elapsed().as_millis() as u64 + 1;
        let last = counters.last_report.load(Ordering::Relaxed);
        if last != 0 && now.saturating_sub(last) < self.interval_ms {
            return None;
        }
        // Losing the race means another thread is reporting this window.
        counters
            .last_report
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .ok()?;

        Some(RelayTally {
            chunks: counters.chunks.swap(0, Ordering::Relaxed),
            bytes: counters.bytes.swap(0, Ordering::Relaxed),
        })
    }
}
