use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter::EnvFilter, fmt};

use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::PanicHookInfo;

/// Logs panics as one error event carrying the location as fields. The backtrace is attached
/// when `RUST_BACKTRACE` asks for one.
fn report_panic(panic_info: &PanicHookInfo<'_>) {
    let message = panic_info.payload_as_str().unwrap_or("<non-string panic payload>");
    let location = panic_info
        .location()
        .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()));

    let backtrace = Backtrace::capture();
    if backtrace.status() == BacktraceStatus::Captured {
        tracing::error!(location, %backtrace, "panic: {message}");
    } else {
        tracing::error!(location, "panic: {message}");
    }
}

/// Sets up the tracing subscriber. RUST_LOG overrides the default `info` level.
pub fn register(log_format_json: bool) {
    let filter = EnvFilter::builder()
        // h2 is too noisy below info
        .with_default_directive(Level::INFO.into())
        .from_env_lossy()
        .add_directive("h2=info".parse().unwrap_or(Level::INFO.into()));

    let layer = if log_format_json {
        // JSON format, flattened
        fmt::layer()
            .with_ansi(false)
            .json()
            .flatten_event(true)
            .boxed()
    } else {
        fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .init();

    std::panic::set_hook(Box::new(report_panic));
}
