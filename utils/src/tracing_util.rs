//! Helpers related to tracing, used by main entrypoints

use tracing_subscriber::EnvFilter;

/// The environment variable consulted for log filtering, in addition to `RUST_LOG`.
pub const LOG_ENV: &str = "RPMCACHE_LOG";

fn env_filter() -> EnvFilter {
    // Our own variable wins; otherwise fall back to the conventional one.
    let directives = [LOG_ENV, EnvFilter::DEFAULT_ENV]
        .into_iter()
        .filter_map(|k| std::env::var(k).ok())
        .find(|v| !v.is_empty());
    match directives {
        Some(v) => EnvFilter::new(v),
        None => EnvFilter::new("warn"),
    }
}

/// Initialize tracing with the default configuration: warnings and errors
/// on stderr unless [`LOG_ENV`] or `RUST_LOG` specify a filter.
pub fn initialize_tracing() {
    // Don't include timestamps and such because they're not really useful and
    // too verbose, and plus several log targets such as journald will already
    // include timestamps.
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    // Log to stderr by default
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .event_format(format)
        .with_writer(std::io::stderr)
        .init();
}
