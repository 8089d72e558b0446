//! `tracing` setup shared by the supervisor and worker processes.
//!
//! Console output always goes to stderr: in a worker, stdout is the control
//! channel and a stray log line there would be read as a malformed message.
//! `RUST_LOG` overrides the default filter.

use std::io::IsTerminal;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// HTTP and WebSocket client crates are chatty at debug level; keep them at
/// `warn` unless `RUST_LOG` asks otherwise.
const QUIET_DEPENDENCIES: &[&str] = &["hyper", "hyper_util", "reqwest", "tungstenite", "tokio_tungstenite"];

/// Filter used when `RUST_LOG` is unset: `level` for everything, dependencies
/// capped at `warn`.
pub fn default_directives(level: &str) -> String {
    let mut directives = level.to_string();
    for krate in QUIET_DEPENDENCIES {
        directives.push_str(&format!(",{krate}=warn"));
    }
    directives
}

fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(level)))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber.
///
/// - `log_level`: default level when `RUST_LOG` is unset; an unparsable value
///   falls back to `info`
/// - `log_dir`: optional directory for daily-rotating files named
///   `<module_name>.<date>`
/// - `module_name`: file prefix, e.g. `bookfeed-supervisor` or
///   `bookfeed-worker-binance`
///
/// A second call is a no-op, so in-process workers can share the
/// supervisor's subscriber.
pub fn init_logging(log_level: &str, log_dir: Option<&str>, module_name: &str) {
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_ansi(std::io::stderr().is_terminal());

    let file_layer = log_dir.map(|dir| {
        fmt::layer()
            .with_writer(tracing_appender::rolling::daily(dir, module_name))
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
    });

    let _ = tracing_subscriber::registry()
        .with(build_filter(log_level))
        .with(console_layer)
        .with(file_layer)
        .try_init();
}
