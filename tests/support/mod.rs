pub mod do_roundtrip;

#[cfg(feature = "test-utils")]
pub use do_roundtrip::*;

/// Initialize tracing for tests with proper test output handling
pub fn tracing_init() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
