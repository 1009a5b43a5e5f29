//! Mosaic Daemon Library
//!
//! Resource-aware execution core for multi-model requests:
//! - Device ledger: per-device capacity accounting
//! - Allocator: placement strategies over ledger snapshots
//! - Session manager: reference-counted placements with lazy eviction
//! - Pattern executor: sequential, ensemble and voting topologies
//! - Control-plane HTTP server

pub mod allocator;
pub mod backend;
pub mod engine;
pub mod ledger;
pub mod model;
pub mod orchestration;
pub mod server;
pub mod session;
mod telemetry;

pub use engine::{Engine, EngineError};
pub use model::ModelSpec;
