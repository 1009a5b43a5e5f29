//! Placement strategies as pure functions over a ledger snapshot.

use std::cmp::{Ordering, Reverse};

use mosaic_core::StrategyKind;

use crate::ledger::{Device, LedgerSnapshot};
use crate::model::ModelSpec;

use super::{AllocError, PlacementPolicy};

/// Whether placing `amount` on `device` would push it over `pct` percent.
#[allow(clippy::cast_precision_loss)]
fn exceeds_threshold(device: &Device, amount: u64, pct: f64) -> bool {
    let held = device
        .current_used
        .saturating_add(device.reserved_capacity)
        .saturating_add(amount);
    // Cross-multiplied so whole-number thresholds compare exactly.
    held as f64 * 100.0 > pct * device.total_capacity as f64
}

/// Filters applied before any strategy runs.
pub fn admissible(device: &Device, spec: &ModelSpec, policy: &PlacementPolicy) -> bool {
    if !device.fits(spec.capacity) {
        return false;
    }
    if let Some(pct) = policy.vram_threshold_percent
        && exceeds_threshold(device, spec.capacity, pct)
    {
        return false;
    }
    if !policy.allow_colocation && device.residents.iter().any(|m| *m != spec.id) {
        return false;
    }
    true
}

/// Admissible devices in index order.
pub fn candidates<'a>(
    snapshot: &'a LedgerSnapshot,
    spec: &ModelSpec,
    policy: &PlacementPolicy,
) -> Vec<&'a Device> {
    let mut out: Vec<&Device> = snapshot
        .iter()
        .filter(|d| admissible(d, spec, policy))
        .collect();
    out.sort_by_key(|d| d.index);
    out
}

/// Largest free capacity; equal free capacity goes to the lowest index.
pub fn auto<'a>(candidates: &[&'a Device]) -> Option<&'a Device> {
    candidates
        .iter()
        .copied()
        .min_by_key(|d| (Reverse(d.free()), d.index))
}

/// Lowest-indexed admissible device.
pub fn pack<'a>(candidates: &[&'a Device]) -> Option<&'a Device> {
    candidates.iter().copied().min_by_key(|d| d.index)
}

/// Lowest current utilization; ties go to the lowest index.
pub fn spread<'a>(candidates: &[&'a Device]) -> Option<&'a Device> {
    candidates.iter().copied().min_by(|a, b| {
        a.utilization()
            .partial_cmp(&b.utilization())
            .unwrap_or(Ordering::Equal)
            .then(a.index.cmp(&b.index))
    })
}

/// First admissible device at or after the slot following `cursor`,
/// wrapping around `device_count`.
pub fn round_robin<'a>(
    candidates: &[&'a Device],
    device_count: usize,
    cursor: Option<usize>,
) -> Option<&'a Device> {
    if device_count == 0 {
        return None;
    }
    let start = cursor.map_or(0, |c| (c + 1) % device_count);
    candidates
        .iter()
        .copied()
        .min_by_key(|d| (d.index + device_count - start) % device_count)
}

/// Choose a device for `spec` without touching any shared state.
///
/// A model with a pinned device is always placed by the manual rule.
pub fn decide<'a>(
    spec: &ModelSpec,
    snapshot: &'a LedgerSnapshot,
    strategy: StrategyKind,
    policy: &PlacementPolicy,
    cursor: Option<usize>,
) -> Result<&'a Device, AllocError> {
    if let Some(pin) = &spec.pinned_device {
        let device = snapshot
            .get(pin)
            .ok_or_else(|| AllocError::UnknownDevice {
                device_id: pin.clone(),
            })?;
        return if admissible(device, spec, policy) {
            Ok(device)
        } else {
            Err(AllocError::no_fit(spec))
        };
    }

    let pool = candidates(snapshot, spec, policy);
    let chosen = match strategy {
        StrategyKind::Auto => auto(&pool),
        StrategyKind::Pack => pack(&pool),
        StrategyKind::Spread => spread(&pool),
        StrategyKind::RoundRobin => round_robin(&pool, snapshot.devices.len(), cursor),
        StrategyKind::Manual => {
            return Err(AllocError::PinRequired {
                model_id: spec.id.clone(),
            });
        }
    };
    chosen.ok_or_else(|| AllocError::no_fit(spec))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn dev(id: &str, index: usize, total: u64, reserved: u64, used: u64) -> Device {
        Device {
            id: id.to_string(),
            index,
            total_capacity: total,
            reserved_capacity: reserved,
            current_used: used,
            residents: Vec::new(),
        }
    }

    fn snap(devices: Vec<Device>) -> LedgerSnapshot {
        LedgerSnapshot { devices }
    }

    fn open() -> PlacementPolicy {
        PlacementPolicy {
            vram_threshold_percent: None,
            allow_colocation: true,
        }
    }

    fn spec(capacity: u64) -> ModelSpec {
        ModelSpec::new("m", capacity, "echo")
    }

    fn pick(s: &LedgerSnapshot, strategy: StrategyKind, capacity: u64) -> String {
        decide(&spec(capacity), s, strategy, &open(), None)
            .unwrap()
            .id
            .clone()
    }

    #[test]
    fn auto_prefers_most_free() {
        let s = snap(vec![dev("gpu0", 0, 24, 0, 10), dev("gpu1", 1, 24, 0, 2)]);
        assert_eq!(pick(&s, StrategyKind::Auto, 8), "gpu1");
    }

    #[test]
    fn auto_tie_goes_to_lowest_index() {
        let s = snap(vec![
            dev("gpu1", 0, 16, 0, 0),
            dev("gpu0", 1, 16, 0, 0),
        ]);
        // Registration order decides, not the id string.
        assert_eq!(pick(&s, StrategyKind::Auto, 8), "gpu1");
    }

    #[test]
    fn pack_fills_lowest_index_first() {
        let s = snap(vec![dev("gpu0", 0, 24, 0, 10), dev("gpu1", 1, 24, 0, 0)]);
        assert_eq!(pick(&s, StrategyKind::Pack, 8), "gpu0");
        assert_eq!(pick(&s, StrategyKind::Pack, 20), "gpu1");
    }

    #[test]
    fn spread_prefers_lowest_utilization() {
        let s = snap(vec![
            dev("gpu0", 0, 100, 0, 50),
            dev("gpu1", 1, 40, 0, 10),
            dev("gpu2", 2, 80, 0, 30),
        ]);
        // 0.5, 0.25, 0.375
        assert_eq!(pick(&s, StrategyKind::Spread, 5), "gpu1");
    }

    #[test]
    fn round_robin_skips_insufficient_devices() {
        // gpu0 has 5 free, gpu1 has 20 free; cursor last landed on gpu0.
        let s = snap(vec![dev("gpu0", 0, 24, 0, 19), dev("gpu1", 1, 24, 4, 0)]);
        let chosen = decide(&spec(8), &s, StrategyKind::RoundRobin, &open(), Some(0)).unwrap();
        assert_eq!(chosen.id, "gpu1");
        let chosen = decide(&spec(8), &s, StrategyKind::RoundRobin, &open(), None).unwrap();
        assert_eq!(chosen.id, "gpu1");
    }

    #[test]
    fn round_robin_wraps_around() {
        let s = snap(vec![
            dev("gpu0", 0, 10, 0, 0),
            dev("gpu1", 1, 10, 0, 0),
            dev("gpu2", 2, 10, 0, 0),
        ]);
        let next = |c| {
            decide(&spec(1), &s, StrategyKind::RoundRobin, &open(), c)
                .unwrap()
                .index
        };
        assert_eq!(next(None), 0);
        assert_eq!(next(Some(0)), 1);
        assert_eq!(next(Some(1)), 2);
        assert_eq!(next(Some(2)), 0);
    }

    #[test]
    fn threshold_excludes_devices_before_strategy() {
        let s = snap(vec![dev("gpu0", 0, 100, 0, 60), dev("gpu1", 1, 100, 0, 0)]);
        let policy = PlacementPolicy {
            vram_threshold_percent: Some(80.0),
            allow_colocation: true,
        };
        // Pack would choose gpu0, but 60 + 30 = 90% > 80%.
        let chosen = decide(&spec(30), &s, StrategyKind::Pack, &policy, None).unwrap();
        assert_eq!(chosen.id, "gpu1");
        // Exactly at the threshold is allowed.
        let chosen = decide(&spec(20), &s, StrategyKind::Pack, &policy, None).unwrap();
        assert_eq!(chosen.id, "gpu0");
    }

    #[test]
    fn colocation_disabled_excludes_occupied_devices() {
        let mut busy = dev("gpu0", 0, 24, 1, 20);
        busy.residents.push("other".to_string());
        let s = snap(vec![busy]);
        let policy = PlacementPolicy {
            vram_threshold_percent: None,
            allow_colocation: false,
        };
        let err = decide(&spec(1), &s, StrategyKind::Auto, &policy, None).unwrap_err();
        assert!(matches!(err, AllocError::NoFit { .. }));
    }

    #[test]
    fn manual_requires_pin() {
        let s = snap(vec![dev("gpu0", 0, 24, 0, 0)]);
        let err = decide(&spec(1), &s, StrategyKind::Manual, &open(), None).unwrap_err();
        assert!(matches!(err, AllocError::PinRequired { .. }));
    }

    #[test]
    fn pinned_device_overrides_strategy() {
        let s = snap(vec![dev("gpu0", 0, 24, 0, 0), dev("gpu1", 1, 8, 0, 0)]);
        let pinned = spec(4).pinned_to("gpu1");
        let chosen = decide(&pinned, &s, StrategyKind::Auto, &open(), None).unwrap();
        assert_eq!(chosen.id, "gpu1");

        let too_big = spec(10).pinned_to("gpu1");
        assert!(matches!(
            decide(&too_big, &s, StrategyKind::Manual, &open(), None),
            Err(AllocError::NoFit { .. })
        ));

        let unknown = spec(1).pinned_to("tpu0");
        assert!(matches!(
            decide(&unknown, &s, StrategyKind::Manual, &open(), None),
            Err(AllocError::UnknownDevice { .. })
        ));
    }

    #[test]
    fn empty_snapshot_has_no_fit() {
        let s = snap(Vec::new());
        for strategy in [
            StrategyKind::Auto,
            StrategyKind::Pack,
            StrategyKind::Spread,
            StrategyKind::RoundRobin,
        ] {
            assert!(decide(&spec(1), &s, strategy, &open(), None).is_err());
        }
    }
}
