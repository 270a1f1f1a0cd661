//! Tracing subscriber setup for programs and tests embedding the kernel.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const TEST_FILTER: &str = "nestfs_kernel=debug,nestfs_drivers=debug";

/// Installs the global subscriber unless one is set. Returns whether this
/// call installed it.
fn install(default_filter: &str, test_writer: bool) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(filter);
    if test_writer {
        registry.with(fmt::layer().with_test_writer()).try_init().is_ok()
    } else {
        registry.with(fmt::layer()).try_init().is_ok()
    }
}

/// Installs a formatting subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter`. Does nothing if a global subscriber is already set.
pub fn init(default_filter: &str) -> bool {
    install(default_filter, false)
}

/// Like [`init`], but writes through the test harness so output is captured
/// per test.
pub fn init_for_tests() -> bool {
    install(TEST_FILTER, true)
}
