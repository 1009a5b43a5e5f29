//! `Mosaic` Core Library
//!
//! Shared functionality for `Mosaic` components:
//! - Configuration types and hierarchical resolution
//! - Tracing subscriber bootstrap
//! - Optional `OpenTelemetry` metrics pipeline
//! - Common error types

pub mod config;
pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod tracing_init;

pub use config::{Config, ExtractionRule, PatternKind, StrategyKind};
pub use error::{Error, Result};
