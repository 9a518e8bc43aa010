//! Opt-in logging setup. This crate never initializes a subscriber on its
//! own; every `tracing` call here is inert until the embedding binary
//! installs one, either via [`init`] or its own setup.

use tracing_subscriber::{fmt, EnvFilter};

/// Installs a reasonable default subscriber: env-filtered (`RUST_LOG`,
/// falling back to `info`), human-readable output. Intended for CLIs and
/// examples; long-running daemons may prefer `json()`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// Like [`init`] but emits newline-delimited JSON, for services that feed
/// a log collector rather than a terminal.
pub fn init_json() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().json().with_env_filter(filter).try_init();
}
