//! Tracing initialization for the Drover daemon.
//!
//! Console `fmt` subscriber filtered by `RUST_LOG` when set, the
//! configured level otherwise. Call once at startup, before any events
//! are emitted.

use tracing_subscriber::EnvFilter;

pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
