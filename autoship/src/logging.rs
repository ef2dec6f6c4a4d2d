//! Tracing setup shared by the agent and store binaries.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Operator diagnostics via `RUST_LOG`, output to stderr.
//!
//! - **Execution logs (`execution`)**: Per-task product output accumulated in memory
//!   and returned in `ExecutionResult.logs`. Always captured, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; falls back to `default_directive` when it is unset or invalid.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=autoship=debug autoship-agent --config agent.toml
/// ```
pub fn init(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
