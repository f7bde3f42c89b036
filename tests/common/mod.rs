//! Shared test bootstrap for the integration suite.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs the `tracing` subscriber once per test binary. Honors the
/// `TEST_LOG` environment variable.
pub fn init_test_logging() {
    INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        let filter =
            EnvFilter::try_from_env("TEST_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
