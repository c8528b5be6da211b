use tracing_subscriber::{fmt, EnvFilter};

/// Initialize structured logging with environment filter.
/// Set RCAP_LOG=debug (or trace, info, warn, error) for verbosity control.
pub fn init_logging() {
    init_logging_with_default("info");
}

/// Same as [`init_logging`], with `default` used when RCAP_LOG is unset.
pub fn init_logging_with_default(default: &str) {
    let filter = EnvFilter::try_from_env("RCAP_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();
}
