//! Shared helpers for tests across the workspace.

use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;

static LOGGING: Lazy<()> = Lazy::new(|| {
    if std::env::var("RUST_LOG").is_ok() {
        tracing_log::LogTracer::init().expect("registering log forwarder");
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .finish();
        tracing::subscriber::set_global_default(subscriber).expect("installing subscriber");
    }
});

/// Enable tracing output for a test when `RUST_LOG` is set.
///
/// Safe to call from every test; installation happens at most once per
/// process.
pub fn maybe_start_logging() {
    Lazy::force(&LOGGING);
}

/// Assert that `actual` contains the substring `expected`, with a readable
/// failure message.
#[macro_export]
macro_rules! assert_contains {
    ($actual:expr, $expected:expr) => {
        let actual_value: String = $actual.to_string();
        let expected_value: String = $expected.to_string();
        assert!(
            actual_value.contains(&expected_value),
            "Can not find expected value in actual.\nExpected:\n{}\nActual:\n{}",
            expected_value,
            actual_value,
        );
    };
}

/// Assert that `actual` does not contain the substring `expected`.
#[macro_export]
macro_rules! assert_not_contains {
    ($actual:expr, $expected:expr) => {
        let actual_value: String = $actual.to_string();
        let expected_value: String = $expected.to_string();
        assert!(
            !actual_value.contains(&expected_value),
            "Found unexpected value in actual.\nUnexpected:\n{}\nActual:\n{}",
            expected_value,
            actual_value,
        );
    };
}
