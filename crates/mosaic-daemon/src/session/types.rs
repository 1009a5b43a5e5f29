//! Types for the model session manager.

use serde::Serialize;

use mosaic_core::StrategyKind;
use mosaic_core::config::PlacementConfig;

use crate::allocator::AllocError;
use crate::ledger::LedgerError;

/// A model resident on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Placement {
    pub model_id: String,
    pub device_id: String,
    pub capacity_reserved: u64,
    /// Unix milliseconds of the most recent acquisition.
    pub acquired_at_ms: u64,
    /// Strictly increasing across acquisitions; orders eviction candidates.
    #[serde(skip)]
    pub sequence: u64,
    pub ref_count: usize,
}

/// Session manager settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub strategy: StrategyKind,
    pub auto_unload: bool,
    pub allow_colocation: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Auto,
            auto_unload: true,
            allow_colocation: true,
        }
    }
}

impl From<&PlacementConfig> for SessionConfig {
    fn from(cfg: &PlacementConfig) -> Self {
        Self {
            strategy: cfg.strategy,
            auto_unload: cfg.auto_unload,
            allow_colocation: cfg.allow_colocation,
        }
    }
}

/// Errors from acquiring or releasing placements.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    #[error("No device can fit model {model_id} ({requirement} requested)")]
    NoFit { model_id: String, requirement: u64 },

    #[error("Capacity exhausted for model {model_id} ({requirement} requested) after evicting {evicted} placement(s)")]
    CapacityExhausted {
        model_id: String,
        requirement: u64,
        evicted: usize,
    },

    #[error("Model {model_id} is not held")]
    NotHeld { model_id: String },

    #[error("Eviction of {model_id} did not complete: {reason}")]
    EvictionFailed { model_id: String, reason: String },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Alloc(#[from] AllocError),
}
