//! Allocator: chooses a device for a model from a ledger snapshot.
//!
//! The strategies themselves are pure ([`strategy`]). The only state held
//! here is the round-robin cursor, guarded by its own lock.

pub mod strategy;

use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tracing::debug;

use mosaic_core::StrategyKind;
use mosaic_core::config::PlacementConfig;

use crate::ledger::LedgerSnapshot;
use crate::model::ModelSpec;

/// Filters applied to every candidate device before a strategy runs.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementPolicy {
    pub vram_threshold_percent: Option<f64>,
    pub allow_colocation: bool,
}

impl Default for PlacementPolicy {
    fn default() -> Self {
        Self {
            vram_threshold_percent: None,
            allow_colocation: true,
        }
    }
}

impl From<&PlacementConfig> for PlacementPolicy {
    fn from(cfg: &PlacementConfig) -> Self {
        Self {
            vram_threshold_percent: cfg.vram_threshold_percent,
            allow_colocation: cfg.allow_colocation,
        }
    }
}

/// Errors from a placement decision.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("No device can fit model {model_id} ({requirement} requested)")]
    NoFit { model_id: String, requirement: u64 },

    #[error("Model {model_id} needs a pinned device under the manual strategy")]
    PinRequired { model_id: String },

    #[error("Unknown device: {device_id}")]
    UnknownDevice { device_id: String },
}

impl AllocError {
    pub(crate) fn no_fit(spec: &ModelSpec) -> Self {
        Self::NoFit {
            model_id: spec.id.clone(),
            requirement: spec.capacity,
        }
    }
}

/// One line of a batch recommendation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recommendation {
    pub model_id: String,
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Allocator {
    policy: PlacementPolicy,
    cursor: Mutex<Option<usize>>,
}

impl Allocator {
    pub const fn new(policy: PlacementPolicy) -> Self {
        Self {
            policy,
            cursor: Mutex::new(None),
        }
    }

    pub const fn policy(&self) -> &PlacementPolicy {
        &self.policy
    }

    /// Index of the device the round-robin strategy chose last.
    pub fn cursor(&self) -> Option<usize> {
        *self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Position the round-robin cursor, as if `index` had just been chosen.
    pub fn set_cursor(&self, index: Option<usize>) {
        *self.cursor.lock().unwrap_or_else(PoisonError::into_inner) = index;
    }

    /// Choose a device for `spec`. Round-robin decisions advance the cursor.
    pub fn place(
        &self,
        spec: &ModelSpec,
        snapshot: &LedgerSnapshot,
        strategy: StrategyKind,
    ) -> Result<String, AllocError> {
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let device = strategy::decide(spec, snapshot, strategy, &self.policy, *cursor)?;
        if advances_cursor(spec, strategy) {
            *cursor = Some(device.index);
        }
        drop(cursor);
        debug!(
            model_id = %spec.id,
            device_id = %device.id,
            strategy = strategy.as_str(),
            "Placement decided"
        );
        Ok(device.id.clone())
    }

    /// Record that `spec` was committed to the device at `index`, for
    /// callers that decide with [`Allocator::preview`] and only then reserve.
    pub fn commit_cursor(&self, spec: &ModelSpec, strategy: StrategyKind, index: usize) {
        if advances_cursor(spec, strategy) {
            self.set_cursor(Some(index));
        }
    }

    /// Same decision as [`Allocator::place`] with the cursor left untouched.
    pub fn preview(
        &self,
        spec: &ModelSpec,
        snapshot: &LedgerSnapshot,
        strategy: StrategyKind,
    ) -> Result<String, AllocError> {
        let cursor = self.cursor();
        strategy::decide(spec, snapshot, strategy, &self.policy, cursor).map(|d| d.id.clone())
    }

    /// Propose devices for several models, placing each one on a scratch
    /// copy of `snapshot` so later models see earlier proposals. Nothing is
    /// committed and the shared cursor does not move.
    pub fn recommend_batch(
        &self,
        specs: &[ModelSpec],
        snapshot: &LedgerSnapshot,
        strategy: StrategyKind,
    ) -> Vec<Recommendation> {
        let mut scratch = snapshot.clone();
        let mut cursor = self.cursor();
        specs
            .iter()
            .map(|spec| {
                match strategy::decide(spec, &scratch, strategy, &self.policy, cursor) {
                    Ok(device) => {
                        let device_id = device.id.clone();
                        if advances_cursor(spec, strategy) {
                            cursor = Some(device.index);
                        }
                        scratch.assume_reserved(&device_id, &spec.id, spec.capacity);
                        Recommendation {
                            model_id: spec.id.clone(),
                            device_id: Some(device_id),
                            error: None,
                        }
                    }
                    Err(e) => Recommendation {
                        model_id: spec.id.clone(),
                        device_id: None,
                        error: Some(e.to_string()),
                    },
                }
            })
            .collect()
    }
}

fn advances_cursor(spec: &ModelSpec, strategy: StrategyKind) -> bool {
    strategy == StrategyKind::RoundRobin && spec.pinned_device.is_none()
}
