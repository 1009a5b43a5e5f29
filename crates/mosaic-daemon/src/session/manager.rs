//! Model session manager: placements, reference counts and eviction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::allocator::{AllocError, Allocator};
use crate::ledger::{DeviceLedger, LedgerError};
use crate::model::ModelSpec;
use crate::telemetry;

use super::handle::PlacementHandle;
use super::state::PlacementTable;
use super::types::{Placement, PlacementError, SessionConfig};

/// Called with every placement evicted to make room.
pub type EvictionListener = Arc<dyn Fn(&Placement) + Send + Sync>;

type Gate = Arc<tokio::sync::Mutex<()>>;

/// Exclusive hold on one model's gate. Dropping it forgets the gate when the
/// model ended up without a placement, so ids that never became resident
/// leave nothing behind.
struct GateLease<'a> {
    manager: &'a ModelSessionManager,
    model_id: &'a str,
    gate: Gate,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for GateLease<'_> {
    fn drop(&mut self) {
        let resident = self.manager.lock_table().get(self.model_id).is_some();
        if !resident {
            self.manager.forget_gate(self.model_id, &self.gate);
        }
    }
}

/// The only component that commits placements into the ledger.
pub struct ModelSessionManager {
    ledger: Arc<DeviceLedger>,
    allocator: Arc<Allocator>,
    config: SessionConfig,
    table: Arc<Mutex<PlacementTable>>,
    gates: Mutex<HashMap<String, Gate>>,
    on_evict: Option<EvictionListener>,
}

impl ModelSessionManager {
    pub fn new(ledger: Arc<DeviceLedger>, allocator: Arc<Allocator>, config: SessionConfig) -> Self {
        Self {
            ledger,
            allocator,
            config,
            table: Arc::new(Mutex::new(PlacementTable::default())),
            gates: Mutex::new(HashMap::new()),
            on_evict: None,
        }
    }

    #[must_use]
    pub fn with_eviction_listener(mut self, listener: EvictionListener) -> Self {
        self.on_evict = Some(listener);
        self
    }

    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub const fn ledger(&self) -> &Arc<DeviceLedger> {
        &self.ledger
    }

    pub const fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    /// Obtain a reference on `spec`'s placement, creating it if needed.
    ///
    /// Concurrent acquires for one model are serialized so only the first
    /// runs the allocator; the rest share its placement.
    pub async fn acquire(&self, spec: &ModelSpec) -> Result<PlacementHandle, PlacementError> {
        let existing = self.lock_table().retain(&spec.id);
        if let Some(placement) = existing {
            debug!(model_id = %spec.id, ref_count = placement.ref_count, "Placement reused");
            return Ok(self.handle(placement));
        }

        let _lease = self.lease(&spec.id).await;

        let existing = self.lock_table().retain(&spec.id);
        if let Some(placement) = existing {
            debug!(model_id = %spec.id, ref_count = placement.ref_count, "Placement reused");
            return Ok(self.handle(placement));
        }

        let placement = self.place_new(spec).await?;
        Ok(self.handle(placement))
    }

    pub fn release(&self, handle: PlacementHandle) {
        handle.release();
    }

    /// Return one detached reference on `model_id`.
    ///
    /// Fails with [`PlacementError::NotHeld`] when nothing is held, so the
    /// count never goes negative. Returns the remaining count.
    pub fn release_model(&self, model_id: &str) -> Result<usize, PlacementError> {
        let remaining = self.lock_table().release(model_id)?;
        debug!(model_id, ref_count = remaining, "Placement released");
        Ok(remaining)
    }

    pub fn placement(&self, model_id: &str) -> Option<Placement> {
        self.lock_table().get(model_id).cloned()
    }

    /// All resident placements, by model id.
    pub fn placements(&self) -> Vec<Placement> {
        self.lock_table().list()
    }

    async fn place_new(&self, spec: &ModelSpec) -> Result<Placement, PlacementError> {
        let exclusive = !self.config.allow_colocation;
        let mut evicted = 0;

        loop {
            let snapshot = self.ledger.snapshot().await;
            let strategy = self.config.strategy;
            let committed = match self.allocator.preview(spec, &snapshot, strategy) {
                Ok(device_id) => match self
                    .ledger
                    .reserve_for(&device_id, &spec.id, spec.capacity, exclusive)
                    .await
                {
                    Ok(()) => {
                        // The cursor only moves for a device that was used.
                        if let Some(device) = snapshot.get(&device_id) {
                            self.allocator.commit_cursor(spec, strategy, device.index);
                        }
                        Some(device_id)
                    }
                    // Another placement landed between snapshot and commit.
                    Err(
                        e @ (LedgerError::InsufficientCapacity { .. }
                        | LedgerError::Occupied { .. }),
                    ) => {
                        debug!(model_id = %spec.id, error = %e, "Placement commit lost a race");
                        None
                    }
                    Err(e) => return Err(e.into()),
                },
                Err(AllocError::NoFit { .. }) => None,
                Err(e) => return Err(e.into()),
            };

            if let Some(device_id) = committed {
                let placement = self
                    .lock_table()
                    .insert(&spec.id, &device_id, spec.capacity);
                telemetry::placement(self.config.strategy.as_str(), &device_id);
                info!(
                    model_id = %spec.id,
                    device_id = %device_id,
                    amount = spec.capacity,
                    evicted,
                    "Model placed"
                );
                return Ok(placement);
            }

            if !self.config.auto_unload {
                return Err(PlacementError::NoFit {
                    model_id: spec.id.clone(),
                    requirement: spec.capacity,
                });
            }
            if self.evict_one().await?.is_none() {
                warn!(model_id = %spec.id, amount = spec.capacity, evicted, "Capacity exhausted");
                return Err(PlacementError::CapacityExhausted {
                    model_id: spec.id.clone(),
                    requirement: spec.capacity,
                    evicted,
                });
            }
            evicted += 1;
        }
    }

    /// Evict the oldest idle placement whose model is not mid-acquire.
    async fn evict_one(&self) -> Result<Option<Placement>, PlacementError> {
        let candidates = self.lock_table().idle_oldest_first();
        for candidate in candidates {
            let gate = self.gate(&candidate.model_id);
            let Ok(_victim) = gate.try_lock() else {
                continue;
            };
            let taken = self.lock_table().take_if_idle(&candidate.model_id);
            let Some(victim) = taken else {
                continue;
            };
            // Off-task so a dropped acquire cannot strand the capacity.
            let ledger = Arc::clone(&self.ledger);
            let (device_id, model_id, amount) = (
                victim.device_id.clone(),
                victim.model_id.clone(),
                victim.capacity_reserved,
            );
            tokio::spawn(async move { ledger.release_for(&device_id, &model_id, amount).await })
                .await
                .map_err(|e| PlacementError::EvictionFailed {
                    model_id: victim.model_id.clone(),
                    reason: e.to_string(),
                })??;
            telemetry::eviction(&victim.device_id);
            info!(
                model_id = %victim.model_id,
                device_id = %victim.device_id,
                amount = victim.capacity_reserved,
                "Idle placement evicted"
            );
            self.forget_gate(&victim.model_id, &gate);
            if let Some(listener) = &self.on_evict {
                listener(&victim);
            }
            return Ok(Some(victim));
        }
        Ok(None)
    }

    fn handle(&self, placement: Placement) -> PlacementHandle {
        PlacementHandle::new(placement, Arc::clone(&self.table))
    }

    fn gate(&self, model_id: &str) -> Gate {
        Arc::clone(self.lock_gates().entry(model_id.to_string()).or_default())
    }

    /// Lock the current gate of `model_id`. A gate forgotten while we waited
    /// on it is stale, so the wait is repeated on its replacement.
    async fn lease<'a>(&'a self, model_id: &'a str) -> GateLease<'a> {
        loop {
            let gate = self.gate(model_id);
            let guard = Arc::clone(&gate).lock_owned().await;
            let current = self
                .lock_gates()
                .get(model_id)
                .is_some_and(|g| Arc::ptr_eq(g, &gate));
            if current {
                return GateLease {
                    manager: self,
                    model_id,
                    gate,
                    _guard: guard,
                };
            }
        }
    }

    fn forget_gate(&self, model_id: &str, gate: &Gate) {
        let mut gates = self.lock_gates();
        if gates.get(model_id).is_some_and(|g| Arc::ptr_eq(g, gate)) {
            gates.remove(model_id);
        }
    }

    fn lock_gates(&self) -> MutexGuard<'_, HashMap<String, Gate>> {
        self.gates.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_table(&self) -> MutexGuard<'_, PlacementTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use mosaic_core::StrategyKind;

    use super::*;
    use crate::allocator::PlacementPolicy;
    use crate::ledger::DeviceInfo;

    fn manager(devices: &[(&str, u64)], config: SessionConfig) -> ModelSessionManager {
        let ledger = DeviceLedger::with_devices(devices.iter().map(|(id, total)| DeviceInfo {
            id: (*id).to_string(),
            total_capacity: *total,
            reserved_capacity: 0,
            current_used: 0,
        }))
        .unwrap();
        let allocator = Allocator::new(PlacementPolicy {
            vram_threshold_percent: None,
            allow_colocation: config.allow_colocation,
        });
        ModelSessionManager::new(Arc::new(ledger), Arc::new(allocator), config)
    }

    fn spec(id: &str, capacity: u64) -> ModelSpec {
        ModelSpec::new(id, capacity, "echo")
    }

    #[tokio::test]
    async fn existing_placement_is_shared() {
        let mgr = manager(&[("gpu0", 24)], SessionConfig::default());
        let a = mgr.acquire(&spec("m", 10)).await.unwrap();
        let b = mgr.acquire(&spec("m", 10)).await.unwrap();
        assert_eq!(a.device_id(), b.device_id());
        assert_eq!(mgr.placement("m").unwrap().ref_count, 2);
        assert_eq!(mgr.ledger().device("gpu0").await.unwrap().current_used, 10);

        drop(a);
        mgr.release(b);
        let placement = mgr.placement("m").unwrap();
        assert_eq!(placement.ref_count, 0);
        // Release is lazy: capacity stays held.
        assert_eq!(mgr.ledger().device("gpu0").await.unwrap().current_used, 10);
    }

    #[tokio::test]
    async fn idle_placement_is_evicted_for_new_model() {
        let evictions = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&evictions);
        let mgr = manager(&[("gpu0", 20)], SessionConfig::default()).with_eviction_listener(
            Arc::new(move |p: &Placement| {
                assert_eq!(p.model_id, "old");
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        mgr.acquire(&spec("old", 16)).await.unwrap().release();
        let handle = mgr.acquire(&spec("new", 12)).await.unwrap();

        assert_eq!(handle.device_id(), "gpu0");
        assert!(mgr.placement("old").is_none());
        assert_eq!(evictions.load(Ordering::SeqCst), 1);
        let dev = mgr.ledger().device("gpu0").await.unwrap();
        assert_eq!(dev.current_used, 12);
        assert_eq!(dev.residents, vec!["new".to_string()]);
    }

    #[tokio::test]
    async fn busy_placement_is_never_evicted() {
        let mgr = manager(&[("gpu0", 20)], SessionConfig::default());
        let _busy = mgr.acquire(&spec("busy", 16)).await.unwrap();
        let err = mgr.acquire(&spec("new", 12)).await.unwrap_err();
        assert_eq!(
            err,
            PlacementError::CapacityExhausted {
                model_id: "new".to_string(),
                requirement: 12,
                evicted: 0,
            }
        );
        assert_eq!(mgr.placement("busy").unwrap().ref_count, 1);
    }

    #[tokio::test]
    async fn no_fit_without_auto_unload() {
        let config = SessionConfig {
            auto_unload: false,
            ..SessionConfig::default()
        };
        let mgr = manager(&[("gpu0", 20)], config);
        mgr.acquire(&spec("old", 16)).await.unwrap().release();
        let err = mgr.acquire(&spec("new", 12)).await.unwrap_err();
        assert!(matches!(err, PlacementError::NoFit { .. }));
        assert!(mgr.placement("old").is_some());
    }

    #[tokio::test]
    async fn eviction_goes_oldest_first() {
        let mgr = manager(&[("gpu0", 30)], SessionConfig::default());
        mgr.acquire(&spec("a", 10)).await.unwrap().release();
        mgr.acquire(&spec("b", 10)).await.unwrap().release();
        mgr.acquire(&spec("c", 10)).await.unwrap().release();
        // Touch "a" so "b" becomes the oldest.
        mgr.acquire(&spec("a", 10)).await.unwrap().release();

        let _d = mgr.acquire(&spec("d", 10)).await.unwrap();
        assert!(mgr.placement("b").is_none());
        assert!(mgr.placement("a").is_some());
        assert!(mgr.placement("c").is_some());
    }

    #[tokio::test]
    async fn release_model_rejects_double_release() {
        let mgr = manager(&[("gpu0", 24)], SessionConfig::default());
        let placement = mgr.acquire(&spec("m", 4)).await.unwrap().detach();
        assert_eq!(placement.ref_count, 1);
        assert_eq!(mgr.release_model("m").unwrap(), 0);
        assert!(matches!(
            mgr.release_model("m"),
            Err(PlacementError::NotHeld { .. })
        ));
        assert!(matches!(
            mgr.release_model("ghost"),
            Err(PlacementError::NotHeld { .. })
        ));
    }

    #[tokio::test]
    async fn colocation_disabled_uses_separate_devices() {
        let config = SessionConfig {
            strategy: StrategyKind::Pack,
            allow_colocation: false,
            ..SessionConfig::default()
        };
        let mgr = manager(&[("gpu0", 24), ("gpu1", 24)], config);
        let a = mgr.acquire(&spec("a", 4)).await.unwrap();
        let b = mgr.acquire(&spec("b", 4)).await.unwrap();
        assert_eq!(a.device_id(), "gpu0");
        assert_eq!(b.device_id(), "gpu1");
    }

    #[tokio::test]
    async fn gates_do_not_outlive_placements() {
        let mgr = manager(&[("gpu0", 8)], SessionConfig::default());
        for i in 0..50 {
            mgr.acquire(&spec(&format!("m{i}"), 6)).await.unwrap().release();
            assert!(mgr.lock_gates().len() <= mgr.placements().len());
        }
        assert_eq!(mgr.placements().len(), 1);

        // A failed acquire leaves no gate for its model.
        let _held = mgr.acquire(&spec("m49", 6)).await.unwrap();
        let err = mgr.acquire(&spec("big", 6)).await.unwrap_err();
        assert!(matches!(err, PlacementError::CapacityExhausted { .. }));
        assert!(!mgr.lock_gates().contains_key("big"));
        assert_eq!(mgr.lock_gates().len(), 1);
    }

    #[tokio::test]
    async fn lost_commit_leaves_round_robin_cursor() {
        // The allocator may pick an occupied device; the exclusive commit
        // then refuses it.
        let ledger = DeviceLedger::with_devices(["gpu0", "gpu1"].map(|id| DeviceInfo {
            id: id.to_string(),
            total_capacity: 24,
            reserved_capacity: 0,
            current_used: 0,
        }))
        .unwrap();
        let mgr = ModelSessionManager::new(
            Arc::new(ledger),
            Arc::new(Allocator::new(PlacementPolicy::default())),
            SessionConfig {
                strategy: StrategyKind::RoundRobin,
                auto_unload: false,
                allow_colocation: false,
            },
        );

        let a = mgr.acquire(&spec("a", 4)).await.unwrap();
        assert_eq!(a.device_id(), "gpu0");
        assert_eq!(mgr.allocator().cursor(), Some(0));
        let b = mgr.acquire(&spec("b", 4)).await.unwrap();
        assert_eq!(b.device_id(), "gpu1");
        assert_eq!(mgr.allocator().cursor(), Some(1));

        let err = mgr.acquire(&spec("c", 4)).await.unwrap_err();
        assert!(matches!(err, PlacementError::NoFit { .. }));
        assert_eq!(mgr.allocator().cursor(), Some(1));
    }

    #[tokio::test]
    async fn pinned_model_lands_on_its_device() {
        let mgr = manager(&[("gpu0", 24), ("gpu1", 24)], SessionConfig::default());
        let handle = mgr
            .acquire(&spec("m", 4).pinned_to("gpu1"))
            .await
            .unwrap();
        assert_eq!(handle.device_id(), "gpu1");
    }
}
