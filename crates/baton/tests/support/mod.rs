//! Shared helpers for integration tests.

#![allow(dead_code)]

use baton::Namespace;
use tracing_subscriber::EnvFilter;

/// Install a test-writer subscriber once. `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// A namespace in a fresh temporary directory. Keep the `TempDir` alive for
/// the duration of the test.
pub fn namespace() -> (tempfile::TempDir, Namespace) {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let ns = Namespace::at(dir.path().join("python_unity_shared_memory"));
    (dir, ns)
}
