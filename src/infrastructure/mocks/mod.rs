//! Test doubles for the adapter's ports.
//!
//! A scripted remote client, a controllable clock and a tracing layer that
//! captures events, so tests can drive the processor and the report
//! builder deterministically.

pub mod clock;
pub mod layer;
pub mod remote;

pub use clock::MockClock;
pub use layer::MockCaptureLayer;
pub use remote::MockRemoteClient;
