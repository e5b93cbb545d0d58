//! Application layer - orchestration of domain logic.
//!
//! This layer coordinates the domain logic and manages the runtime behavior:
//! - Check cache and single-flight coalescing of remote exchanges
//! - Check processor (authorization and quota decisions)
//! - Report builder (aggregation and batched flushing)
//! - Flush scheduler (background task)
//!
//! ## Ports
//!
//! The application layer defines ports (traits) that infrastructure
//! adapters must implement. This keeps the application layer independent
//! from transport details.

pub mod aggregator;
pub mod cache;
pub mod circuit_breaker;
pub mod metrics;
pub mod ports;
pub mod processor;
pub mod scheduler;
pub(crate) mod singleflight;
