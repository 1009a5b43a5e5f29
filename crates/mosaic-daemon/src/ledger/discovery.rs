//! Cold-start device discovery.

use async_trait::async_trait;

use mosaic_core::config::DeviceConfig;

use super::device::{DeviceInfo, LedgerError};

/// Reports the devices present at startup and what they already hold.
#[async_trait]
pub trait DeviceDiscovery: Send + Sync {
    async fn discover(&self) -> Result<Vec<DeviceInfo>, LedgerError>;
}

/// Discovery backed by the configured device table.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    devices: Vec<DeviceInfo>,
}

impl StaticDiscovery {
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self { devices }
    }

    pub fn from_config(devices: &[DeviceConfig]) -> Self {
        Self::new(devices.iter().map(DeviceInfo::from).collect())
    }
}

#[async_trait]
impl DeviceDiscovery for StaticDiscovery {
    async fn discover(&self) -> Result<Vec<DeviceInfo>, LedgerError> {
        Ok(self.devices.clone())
    }
}
