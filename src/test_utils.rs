//! Test logging bootstrap and assertion macros.
//!
//! Unit tests initialize a `tracing` subscriber once per process via
//! [`init_test_logging`] and structure their output with the
//! [`test_phase!`](crate::test_phase), [`test_section!`](crate::test_section)
//! and [`test_complete!`](crate::test_complete) macros.
//! [`assert_with_log!`](crate::assert_with_log) records the expected and
//! actual values before asserting, so a failing run leaves a usable trace.
//!
//! The subscriber honors the `TEST_LOG` environment variable
//! (e.g. `TEST_LOG=coopsync=trace`). Integration tests install their own
//! subscriber (see `tests/common`); for them this function only provides
//! the once-per-process guard.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs the test `tracing` subscriber. Idempotent.
pub fn init_test_logging() {
    INIT.call_once(|| {
        #[cfg(test)]
        install_subscriber();
    });
}

#[cfg(test)]
fn install_subscriber() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("TEST_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Marks the beginning of a named test.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        $crate::tracing_compat::info!(phase = $name, "=== phase ===");
    };
}

/// Marks a section within a test.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        $crate::tracing_compat::info!(section = $name, "--- section ---");
    };
}

/// Marks successful completion of a named test.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        $crate::tracing_compat::info!(test = $name, "test complete");
    };
    ($name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        $crate::tracing_compat::info!(test = $name, $($key = ?$value),+, "test complete");
    };
}

/// Asserts `$cond`, logging the expectation and the observed value either way.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $label:expr, $expected:expr, $actual:expr) => {{
        let ok = $cond;
        let expected = &$expected;
        let actual = &$actual;
        if ok {
            $crate::tracing_compat::debug!(
                check = $label,
                expected = ?expected,
                actual = ?actual,
                "check passed"
            );
        } else {
            $crate::tracing_compat::error!(
                check = $label,
                expected = ?expected,
                actual = ?actual,
                "check FAILED"
            );
        }
        assert!(ok, "{}: expected {:?}, got {:?}", $label, expected, actual);
    }};
}
