//! Tracing subscriber setup for the binary.
//!
//! `RUST_LOG` wins when set. Otherwise host logs and captured widget console
//! output are shown at `info`, or `debug` with `--verbose`. Everything goes to
//! stderr so stdout stays clean JSON.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Target captured widget console lines are logged under
pub const WIDGET_CONSOLE_TARGET: &str = "widget_console";

pub fn default_directive(verbose: bool) -> String {
    let level = if verbose { "debug" } else { "info" };
    format!(
        "warn,widget_host={level},widget_host_lib={level},{}={level}",
        WIDGET_CONSOLE_TARGET
    )
}

/// Install the global subscriber. A second call is ignored.
pub fn init(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new(default_directive(true))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(false)))
    };

    let layer = fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_filter(filter);

    if tracing_subscriber::registry().with(layer).try_init().is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
