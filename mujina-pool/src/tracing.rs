//! Logging setup.
//!
//! Modules import the macros through [`prelude`] so the whole crate logs the
//! same way: `use crate::tracing::prelude::*;`.

use tracing_subscriber::{
    EnvFilter, fmt, fmt::time::LocalTime, layer::SubscriberExt, util::SubscriberInitExt,
};

pub mod prelude {
    pub use ::tracing::{debug, error, info, instrument, trace, warn};
}

/// Default filter when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "info,tower_http=warn";

/// Install the global subscriber.
///
/// Logs go to journald when started by systemd (`JOURNAL_STREAM` is set),
/// otherwise to stderr with local timestamps. Calling this twice is harmless.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var_os("JOURNAL_STREAM").is_some() {
        match tracing_journald::layer() {
            Ok(journald) => {
                let _ = registry.with(journald).try_init();
                return;
            }
            Err(e) => eprintln!("journald unavailable, logging to stderr: {e}"),
        }
    }

    let _ = registry
        .with(fmt::layer().with_timer(LocalTime::rfc_3339()))
        .try_init();
}
