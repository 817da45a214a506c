//! Log subscriber setup for binaries and tests embedding the pipeline.
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is left to the caller.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a stderr fmt subscriber. `RUST_LOG` overrides `default_filter`.
///
/// Returns `false` when a global subscriber was already installed, which
/// makes repeated calls (e.g. from several tests) harmless.
pub fn init(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    #[test]
    fn init_is_idempotent() {
        super::init("content_snapshot=debug");
        assert!(!super::init("info"));
    }
}
