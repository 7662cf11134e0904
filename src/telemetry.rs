//! Tracing setup. Logs go to stderr; stdout carries IPC responses.
//!
//! - `SKILLTRACKD_LOG` holds EnvFilter directives (default "info").
//! - `SKILLTRACKD_LOG_FORMAT` selects "pretty" (default) or "json".

use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

pub fn init_tracing(cfg: &LoggingConfig) {
    let filter = EnvFilter::try_from_env("SKILLTRACKD_LOG").unwrap_or_else(|_| {
        EnvFilter::new(cfg.filter.as_deref().unwrap_or("info"))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    let format = std::env::var("SKILLTRACKD_LOG_FORMAT")
        .ok()
        .or_else(|| cfg.format.clone());
    match format.as_deref() {
        Some("json") => {
            builder.json().init();
        }
        _ => {
            builder.init();
        }
    }
}
