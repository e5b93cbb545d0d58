//! Infrastructure layer - adapters and wiring.
//!
//! This layer provides:
//! - Clock abstraction (system time vs mock)
//! - Storage implementations (sharded maps)
//! - Settings loading
//! - The handler façade used by the request pipeline

pub mod clock;
pub mod config;
pub mod handler;
pub mod storage;

/// Mock implementations for testing.
///
/// Only available with the `test-helpers` feature or in test builds.
/// To use these mocks in integration tests, add to your `Cargo.toml`:
/// ```toml
/// [dev-dependencies]
/// service-control-adapter = { version = "*", features = ["test-helpers"] }
/// ```
#[cfg(any(test, feature = "test-helpers"))]
pub mod mocks;
