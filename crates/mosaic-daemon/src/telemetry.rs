//! Metric hooks. No-ops unless built with the `metrics` feature.

#[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
pub fn placement(strategy: &str, device_id: &str) {
    #[cfg(feature = "metrics")]
    mosaic_core::metrics::record_placement(strategy, device_id);
}

#[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
pub fn eviction(device_id: &str) {
    #[cfg(feature = "metrics")]
    mosaic_core::metrics::record_eviction(device_id);
}

#[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
pub fn branch(pattern: &str, status: &str, latency_ms: u64) {
    #[cfg(feature = "metrics")]
    mosaic_core::metrics::record_branch(pattern, status, latency_ms);
}
