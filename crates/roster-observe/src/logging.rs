use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `ROSTER_LOG` first, then `RUST_LOG`, then a default.
///
/// Log field contract for roster machines:
/// - Always include `machine` (the holder identity) once a machine has one.
/// - Include `role` (the role path) on any lease event.
/// - Include `lower`/`higher` on any assignment or result event.
/// - Include `run_id` on run-level events.
pub fn init_tracing() {
    let filter = env_filter();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("ROSTER_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
