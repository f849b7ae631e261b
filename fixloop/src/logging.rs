//! Development-time tracing for the pipeline.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Diagnostics via `RUST_LOG` or `-v`, output to stderr.
//!   Not persisted, not part of the run's product output.
//!
//! - **Run artifacts (`io/run_log`)**: `summary.json`, stage logs and change
//!   logs under the artifacts directory. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter directive used when `RUST_LOG` is unset.
///
/// `0` → `warn`, `1` → `fixloop=info`, `2+` → `fixloop=debug` (other crates stay at `warn`).
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "warn,fixloop=info",
        _ => "warn,fixloop=debug",
    }
}

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins over `verbosity` when set. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=fixloop::pipeline=debug fixloop run https://github.com/acme/widget.git
/// ```
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
