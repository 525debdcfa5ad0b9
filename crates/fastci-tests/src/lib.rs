//! Test infrastructure for fastci.
//!
//! In-process fakes for the container runtime, the change notifier and the
//! store, a [`TestContext`] wiring them to a real scheduler, and
//! testcontainers-based services for the tests behind the `integration`
//! feature.
//!
//! # Usage
//!
//! ```ignore
//! use fastci_tests::{DocumentFixture, TestContext};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let ctx = TestContext::new();
//!     let (pipeline, _) = ctx.create(&DocumentFixture::chain()).await;
//!     ctx.tick().await;
//! }
//! ```

pub mod containers;
pub mod context;
pub mod fakes;
pub mod fixtures;

pub use context::TestContext;
pub use fakes::*;
pub use fixtures::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,fastci_tests=debug,fastci_scheduler=debug")),
        )
        .with_test_writer()
        .try_init();
}
