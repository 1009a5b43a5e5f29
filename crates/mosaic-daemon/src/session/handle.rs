//! RAII placement handle.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use super::state::PlacementTable;
use super::types::Placement;

/// One reference on a resident model.
///
/// Dropping the handle gives the reference back exactly once. The placement
/// itself stays resident until a later acquire needs its capacity.
#[must_use = "dropping a handle releases the placement immediately"]
pub struct PlacementHandle {
    placement: Placement,
    table: Arc<Mutex<PlacementTable>>,
    released: bool,
}

impl PlacementHandle {
    pub(crate) const fn new(placement: Placement, table: Arc<Mutex<PlacementTable>>) -> Self {
        Self {
            placement,
            table,
            released: false,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.placement.model_id
    }

    pub fn device_id(&self) -> &str {
        &self.placement.device_id
    }

    /// The placement as it was when this handle was issued.
    pub const fn placement(&self) -> &Placement {
        &self.placement
    }

    pub fn release(mut self) {
        self.release_once();
    }

    /// Keep the reference without a guard. It must later be returned through
    /// [`super::ModelSessionManager::release_model`].
    pub fn detach(mut self) -> Placement {
        self.released = true;
        self.placement.clone()
    }

    fn release_once(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let result = self
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release(&self.placement.model_id);
        match result {
            Ok(remaining) => debug!(
                model_id = %self.placement.model_id,
                ref_count = remaining,
                "Placement released"
            ),
            Err(e) => warn!(model_id = %self.placement.model_id, error = %e, "Release failed"),
        }
    }
}

impl Drop for PlacementHandle {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl std::fmt::Debug for PlacementHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlacementHandle")
            .field("model_id", &self.placement.model_id)
            .field("device_id", &self.placement.device_id)
            .field("released", &self.released)
            .finish()
    }
}
