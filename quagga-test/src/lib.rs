//! Miscellaneous test code for Quagga.

use std::sync::Once;

use tracing_error::ErrorLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub mod prelude;
pub mod vectors;

static INIT: Once = Once::new();

/// Initialize globals for tests such as the tracing subscriber and panic /
/// error reporting hooks.
///
/// Safe to call more than once; only the first call has any effect.
pub fn init() {
    INIT.call_once(|| {
        let fmt_layer = fmt::layer().with_target(false);
        // Use the RUST_LOG env var, or by default:
        //  - warn for most tests, and
        //  - for some modules, hide expected warn logs
        let filter_layer = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("warn"));

        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .with(ErrorLayer::default())
            .init();

        color_eyre::config::HookBuilder::default()
            .display_env_section(false)
            .install()
            .expect("color-eyre hooks install only once");
    })
}
