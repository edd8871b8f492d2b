//! Telemetry helpers for structured logging.

/// Install a default env-filtered `tracing` subscriber unless the application
/// already set one. Worker threads, timer threads and queue lifecycle events
/// log through it; `RUST_LOG=prometheus_taskq=debug` shows per-task events.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_thread_names(true)
        .try_init();
}
