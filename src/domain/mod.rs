//! Domain layer - pure data and algorithms with no I/O.
//!
//! This layer contains the core concepts of the adapter:
//! - Cache and aggregation keys
//! - Authorization decisions
//! - Distribution (histogram) accumulation
//! - Metric descriptors and telemetry instances
//! - Service and quota settings
//! - Messages exchanged with the remote backend
//!
//! All types in this layer are synchronous and easily testable.

pub mod decision;
pub mod distribution;
pub mod key;
pub mod metric;
pub mod remote;
pub mod setting;
