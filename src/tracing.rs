//! Tracing subscriber setup for structured framework logging.
//!
//! This module wires up the `tracing` ecosystem with formatted output
//! including file names, line numbers, levels, and span close events. Call
//! [`init_tracing`] once at startup; every framework log line (access log,
//! throttle decisions, rescued errors, GC sweeps) flows through the
//! installed subscriber.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, Layer,
};

/// Initializes the global tracing subscriber with formatted output.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_span_events(FmtSpan::CLOSE)
                .with_file(true)
                .with_line_number(true)
                .with_level(true)
                .with_filter(LevelFilter::DEBUG),
        )
        .init();
}
