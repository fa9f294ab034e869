//! Integration test infrastructure for Conveyor.
//!
//! Provides pipeline fixtures and deterministic fake collaborators so the
//! scheduler can be exercised without invoking real tools.
//!
//! # Usage
//!
//! ```ignore
//! use conveyor_tests::{PipelineFixture, Harness, FailOn};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let harness = Harness::new(FailOn::jobs(["syntax_errors"]));
//!     let report = harness.run(&PipelineFixture::php(), TriggerType::Push).await;
//! }
//! ```

pub mod fixtures;
pub mod helpers;

pub use fixtures::*;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,conveyor_scheduler=debug")),
        )
        .with_test_writer()
        .try_init();
}
