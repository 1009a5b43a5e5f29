//! Device records and ledger errors.

use serde::Serialize;

use mosaic_core::config::DeviceConfig;

/// Capacity accounting for one device.
///
/// Invariant: `current_used + reserved_capacity <= total_capacity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    pub id: String,
    /// Registration order; the "lowest device" in every tie-break.
    pub index: usize,
    pub total_capacity: u64,
    pub reserved_capacity: u64,
    pub current_used: u64,
    /// Models currently holding capacity on this device.
    pub residents: Vec<String>,
}

/// A device as reported by discovery at cold start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub total_capacity: u64,
    pub reserved_capacity: u64,
    /// Capacity already consumed outside this process.
    pub current_used: u64,
}

impl From<&DeviceConfig> for DeviceInfo {
    fn from(cfg: &DeviceConfig) -> Self {
        Self {
            id: cfg.id.clone(),
            total_capacity: cfg.total_capacity,
            reserved_capacity: cfg.reserved_capacity,
            current_used: 0,
        }
    }
}

impl Device {
    pub(crate) fn from_info(info: DeviceInfo, index: usize) -> Result<Self, LedgerError> {
        let device = Self {
            id: info.id,
            index,
            total_capacity: info.total_capacity,
            reserved_capacity: info.reserved_capacity,
            current_used: info.current_used,
            residents: Vec::new(),
        };
        if device
            .current_used
            .checked_add(device.reserved_capacity)
            .is_none_or(|held| held > device.total_capacity)
        {
            return Err(LedgerError::InvalidDevice {
                device_id: device.id,
                reason: format!(
                    "used {} + reserved {} exceeds total {}",
                    info.current_used, info.reserved_capacity, info.total_capacity
                ),
            });
        }
        Ok(device)
    }

    /// Capacity available to placements at all.
    pub const fn allocatable(&self) -> u64 {
        self.total_capacity.saturating_sub(self.reserved_capacity)
    }

    /// Capacity still free for new placements.
    pub const fn free(&self) -> u64 {
        self.allocatable().saturating_sub(self.current_used)
    }

    pub const fn fits(&self, amount: u64) -> bool {
        amount <= self.free()
    }

    pub fn is_occupied(&self) -> bool {
        !self.residents.is_empty()
    }

    pub fn hosts(&self, model_id: &str) -> bool {
        self.residents.iter().any(|m| m == model_id)
    }

    /// Fraction of total capacity that is reserved or used.
    pub fn utilization(&self) -> f64 {
        self.utilization_after(0)
    }

    /// Utilization if `amount` more were placed here.
    #[allow(clippy::cast_precision_loss)]
    pub fn utilization_after(&self, amount: u64) -> f64 {
        if self.total_capacity == 0 {
            return 1.0;
        }
        let held = self
            .current_used
            .saturating_add(self.reserved_capacity)
            .saturating_add(amount);
        held as f64 / self.total_capacity as f64
    }

    pub(crate) fn try_reserve(&mut self, amount: u64) -> Result<(), LedgerError> {
        if !self.fits(amount) {
            return Err(LedgerError::InsufficientCapacity {
                device_id: self.id.clone(),
                requested: amount,
                available: self.free(),
            });
        }
        self.current_used += amount;
        Ok(())
    }

    pub(crate) fn try_release(&mut self, amount: u64) -> Result<(), LedgerError> {
        if amount > self.current_used {
            return Err(LedgerError::OverRelease {
                device_id: self.id.clone(),
                requested: amount,
                used: self.current_used,
            });
        }
        self.current_used -= amount;
        Ok(())
    }
}

/// Point-in-time view of every device, in registration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSnapshot {
    pub devices: Vec<Device>,
}

impl LedgerSnapshot {
    pub fn get(&self, device_id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == device_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn total_free(&self) -> u64 {
        self.devices.iter().map(Device::free).sum()
    }

    /// Apply a hypothetical reservation to this copy. Used for dry runs that
    /// place several models in sequence.
    pub fn assume_reserved(&mut self, device_id: &str, model_id: &str, amount: u64) -> bool {
        let Some(device) = self.devices.iter_mut().find(|d| d.id == device_id) else {
            return false;
        };
        if device.try_reserve(amount).is_err() {
            return false;
        }
        device.residents.push(model_id.to_string());
        true
    }
}

/// Errors from the device ledger.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("Unknown device: {device_id}")]
    UnknownDevice { device_id: String },

    #[error("Device already registered: {device_id}")]
    DuplicateDevice { device_id: String },

    #[error("Invalid device {device_id}: {reason}")]
    InvalidDevice { device_id: String, reason: String },

    #[error("Insufficient capacity on {device_id}: requested {requested}, available {available}")]
    InsufficientCapacity {
        device_id: String,
        requested: u64,
        available: u64,
    },

    #[error("Device {device_id} already hosts {residents:?}")]
    Occupied {
        device_id: String,
        residents: Vec<String>,
    },

    #[error("Release of {requested} on {device_id} exceeds used capacity {used}")]
    OverRelease {
        device_id: String,
        requested: u64,
        used: u64,
    },

    #[error("Model {model_id} is not resident on {device_id}")]
    NotResident { device_id: String, model_id: String },

    #[error("Device discovery failed: {0}")]
    Discovery(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    fn device(total: u64, reserved: u64) -> Device {
        Device::from_info(
            DeviceInfo {
                id: "gpu0".to_string(),
                total_capacity: total,
                reserved_capacity: reserved,
                current_used: 0,
            },
            0,
        )
        .unwrap()
    }

    #[test]
    fn free_accounts_for_reserved() {
        let mut d = device(24, 1);
        assert_eq!(d.allocatable(), 23);
        assert_eq!(d.free(), 23);
        d.try_reserve(20).unwrap();
        assert_eq!(d.free(), 3);
        assert!(d.fits(3));
        assert!(!d.fits(4));
    }

    #[test]
    fn reserve_is_all_or_nothing() {
        let mut d = device(10, 0);
        let err = d.try_reserve(11).unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientCapacity {
                device_id: "gpu0".to_string(),
                requested: 11,
                available: 10,
            }
        );
        assert_eq!(d.current_used, 0);
    }

    #[test]
    fn over_release_is_rejected() {
        let mut d = device(10, 0);
        d.try_reserve(4).unwrap();
        assert!(d.try_release(5).is_err());
        assert_eq!(d.current_used, 4);
        d.try_release(4).unwrap();
        assert_eq!(d.current_used, 0);
    }

    #[test]
    fn utilization_includes_reserved() {
        let d = device(100, 10);
        assert_eq!(d.utilization(), 0.1);
        assert_eq!(d.utilization_after(40), 0.5);
    }

    #[test]
    fn zero_capacity_device_is_fully_utilized() {
        let d = device(0, 0);
        assert_eq!(d.utilization(), 1.0);
        assert!(d.fits(0));
        assert!(!d.fits(1));
    }

    #[test]
    fn info_with_impossible_usage_is_rejected() {
        let err = Device::from_info(
            DeviceInfo {
                id: "gpu0".to_string(),
                total_capacity: 10,
                reserved_capacity: 4,
                current_used: 7,
            },
            0,
        )
        .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidDevice { .. }));
    }

    #[test]
    fn snapshot_assume_reserved_tracks_residents() {
        let mut snap = LedgerSnapshot {
            devices: vec![device(10, 0)],
        };
        assert!(snap.assume_reserved("gpu0", "m1", 6));
        assert!(!snap.assume_reserved("gpu0", "m2", 6));
        assert!(!snap.assume_reserved("gpu9", "m2", 1));
        assert_eq!(snap.devices[0].residents, vec!["m1".to_string()]);
        assert_eq!(snap.total_free(), 4);
    }
}
