//! Logging module
//!
//! Module-tagged logging macros on top of `tracing`. Output goes to stderr so
//! stdout stays free for the helper protocol.

use once_cell::sync::OnceCell;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Registry;

const DEFAULT_FILTER: &str = "info";
const DEBUG_FILTER: &str = "debug";

static FILTER_HANDLE: OnceCell<reload::Handle<EnvFilter, Registry>> = OnceCell::new();

/// Initialize the logging system. Safe to call more than once.
pub fn init() {
    FILTER_HANDLE.get_or_init(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        let (filter, handle) = reload::Layer::new(filter);

        let fmt = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false);

        // A subscriber may already be installed (tests, embedding apps)
        let _ = tracing_subscriber::registry().with(filter).with(fmt).try_init();
        handle
    });
}

/// Switch between DEBUG (developer mode) and the default INFO level
pub fn set_log_level(debug: bool) {
    let Some(handle) = FILTER_HANDLE.get() else {
        return;
    };
    let directive = if debug { DEBUG_FILTER } else { DEFAULT_FILTER };
    if let Err(e) = handle.modify(|filter| *filter = EnvFilter::new(directive)) {
        eprintln!("failed to change log level: {}", e);
    }
}

#[macro_export]
macro_rules! log_debug {
    ($module:expr, $($arg:tt)*) => {
        ::tracing::debug!(module = %$module, "{}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($module:expr, $($arg:tt)*) => {
        ::tracing::info!(module = %$module, "{}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($module:expr, $($arg:tt)*) => {
        ::tracing::warn!(module = %$module, "{}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($module:expr, $($arg:tt)*) => {
        ::tracing::error!(module = %$module, "{}", format_args!($($arg)*))
    };
}
