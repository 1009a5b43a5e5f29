//! Model descriptors shared across the layers.

use serde::{Deserialize, Serialize};

use mosaic_core::config::ModelConfig;

/// What the engine needs to know to place and invoke a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: String,
    /// Estimated capacity requirement.
    pub capacity: u64,
    #[serde(default)]
    pub pinned_device: Option<String>,
    /// Registry name of the backend serving this model.
    pub backend: String,
}

impl ModelSpec {
    pub fn new(id: impl Into<String>, capacity: u64, backend: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capacity,
            pinned_device: None,
            backend: backend.into(),
        }
    }

    #[must_use]
    pub fn pinned_to(mut self, device_id: impl Into<String>) -> Self {
        self.pinned_device = Some(device_id.into());
        self
    }
}

impl From<&ModelConfig> for ModelSpec {
    fn from(cfg: &ModelConfig) -> Self {
        Self {
            id: cfg.id.clone(),
            capacity: cfg.capacity,
            pinned_device: cfg.pinned_device.clone(),
            backend: cfg.backend.clone(),
        }
    }
}
