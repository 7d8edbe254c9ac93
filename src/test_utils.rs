//! Test harness helpers: log bootstrap and phase/assertion macros.
//!
//! Every test starts with [`init_test_logging`], so test phases always reach the
//! log. The adapters' internal events only join them when built with
//! `tracing-integration`, e.g.
//! `RUST_LOG=flowbridge=trace cargo test --features tracing-integration`.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a test-friendly `tracing` subscriber once per process.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("flowbridge=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Marks the start of a test phase in the log.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        ::tracing::info!(phase = %$name, "test phase");
    };
}

/// Marks successful completion of a test.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        ::tracing::info!(test = %$name, "test complete");
    };
}

/// Asserts `cond`, logging the expected and actual values either way.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $label:expr, $expected:expr, $actual:expr) => {{
        let ok = $cond;
        let expected = &$expected;
        let actual = &$actual;
        if ok {
            ::tracing::debug!(label = %$label, ?expected, ?actual, "assertion passed");
        } else {
            ::tracing::error!(label = %$label, ?expected, ?actual, "assertion failed");
        }
        assert!(ok, "{}: expected {:?}, actual {:?}", $label, expected, actual);
    }};
}
