//! Model session management.
//!
//! Tracks which model is resident on which device, counts concurrent users
//! of each placement, and evicts idle placements when a new model needs room.

mod handle;
mod manager;
mod state;
mod types;

pub use handle::PlacementHandle;
pub use manager::{EvictionListener, ModelSessionManager};
pub use types::{Placement, PlacementError, SessionConfig};
