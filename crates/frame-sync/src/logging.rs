//! Optional `tracing` subscriber for hosts without one.

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static INIT: OnceCell<()> = OnceCell::new();

/// Install a formatted subscriber filtered by `RUST_LOG` (default `info`).
///
/// Only the first call does anything. If the process already installed a
/// global subscriber, that one is kept.
pub fn init() {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}
