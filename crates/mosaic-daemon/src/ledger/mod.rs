//! Device ledger: the single source of truth for device capacity.
//!
//! Each device sits behind its own mutex so reservations on different
//! devices never contend. [`DeviceLedger::snapshot`] takes the table lock
//! exclusively, which waits out every in-flight per-device mutation and
//! yields one consistent view for cross-device comparisons.

mod device;
mod discovery;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

pub use device::{Device, DeviceInfo, LedgerError, LedgerSnapshot};
pub use discovery::{DeviceDiscovery, StaticDiscovery};

struct DeviceSlot {
    id: String,
    state: Mutex<Device>,
}

/// In-memory capacity ledger for all devices.
#[derive(Default)]
pub struct DeviceLedger {
    devices: RwLock<Vec<DeviceSlot>>,
}

impl DeviceLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a ledger from discovered devices, preserving their order.
    pub fn with_devices(
        devices: impl IntoIterator<Item = DeviceInfo>,
    ) -> Result<Self, LedgerError> {
        let mut slots: Vec<DeviceSlot> = Vec::new();
        for info in devices {
            if slots.iter().any(|s| s.id == info.id) {
                return Err(LedgerError::DuplicateDevice { device_id: info.id });
            }
            let device = Device::from_info(info, slots.len())?;
            slots.push(DeviceSlot {
                id: device.id.clone(),
                state: Mutex::new(device),
            });
        }
        info!(devices = slots.len(), "Device ledger initialised");
        Ok(Self {
            devices: RwLock::new(slots),
        })
    }

    /// Rebuild a ledger from a discovery collaborator.
    pub async fn discover(source: &dyn DeviceDiscovery) -> Result<Self, LedgerError> {
        Self::with_devices(source.discover().await?)
    }

    /// Register one more device at the end of the index order.
    pub async fn register(&self, info: DeviceInfo) -> Result<(), LedgerError> {
        let mut devices = self.devices.write().await;
        if devices.iter().any(|s| s.id == info.id) {
            return Err(LedgerError::DuplicateDevice { device_id: info.id });
        }
        let device = Device::from_info(info, devices.len())?;
        info!(device_id = %device.id, total = device.total_capacity, "Device registered");
        devices.push(DeviceSlot {
            id: device.id.clone(),
            state: Mutex::new(device),
        });
        Ok(())
    }

    /// Reserve `amount` on one device. No partial reservation.
    pub async fn reserve(&self, device_id: &str, amount: u64) -> Result<(), LedgerError> {
        self.with_device(device_id, |device| device.try_reserve(amount))
            .await?;
        debug!(device_id, amount, "Capacity reserved");
        Ok(())
    }

    /// Return `amount` to one device.
    pub async fn release(&self, device_id: &str, amount: u64) -> Result<(), LedgerError> {
        self.with_device(device_id, |device| device.try_release(amount))
            .await?;
        debug!(device_id, amount, "Capacity released");
        Ok(())
    }

    /// Reserve capacity on behalf of a model and record it as resident.
    ///
    /// With `exclusive`, fails with [`LedgerError::Occupied`] if any other
    /// model already lives on the device. Capacity and residency change
    /// together under the device lock.
    pub async fn reserve_for(
        &self,
        device_id: &str,
        model_id: &str,
        amount: u64,
        exclusive: bool,
    ) -> Result<(), LedgerError> {
        self.with_device(device_id, |device| {
            if exclusive && device.residents.iter().any(|m| m != model_id) {
                return Err(LedgerError::Occupied {
                    device_id: device.id.clone(),
                    residents: device.residents.clone(),
                });
            }
            device.try_reserve(amount)?;
            if !device.hosts(model_id) {
                device.residents.push(model_id.to_string());
            }
            Ok(())
        })
        .await?;
        debug!(device_id, model_id, amount, "Capacity reserved for model");
        Ok(())
    }

    /// Release a model's capacity and clear its residency.
    pub async fn release_for(
        &self,
        device_id: &str,
        model_id: &str,
        amount: u64,
    ) -> Result<(), LedgerError> {
        self.with_device(device_id, |device| {
            let Some(pos) = device.residents.iter().position(|m| m == model_id) else {
                return Err(LedgerError::NotResident {
                    device_id: device.id.clone(),
                    model_id: model_id.to_string(),
                });
            };
            device.try_release(amount)?;
            device.residents.remove(pos);
            Ok(())
        })
        .await?;
        debug!(device_id, model_id, amount, "Capacity released for model");
        Ok(())
    }

    /// Consistent point-in-time view of every device.
    pub async fn snapshot(&self) -> LedgerSnapshot {
        let mut devices = self.devices.write().await;
        LedgerSnapshot {
            devices: devices
                .iter_mut()
                .map(|slot| slot.state.get_mut().clone())
                .collect(),
        }
    }

    /// Current state of a single device.
    pub async fn device(&self, device_id: &str) -> Option<Device> {
        let devices = self.devices.read().await;
        let slot = devices.iter().find(|s| s.id == device_id)?;
        let device = slot.state.lock().await.clone();
        Some(device)
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    #[allow(clippy::significant_drop_tightening)]
    async fn with_device<T>(
        &self,
        device_id: &str,
        f: impl FnOnce(&mut Device) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let devices = self.devices.read().await;
        let slot = devices
            .iter()
            .find(|s| s.id == device_id)
            .ok_or_else(|| LedgerError::UnknownDevice {
                device_id: device_id.to_string(),
            })?;
        let mut device = slot.state.lock().await;
        f(&mut device)
    }
}
