//! Discovered device bookkeeping: admission, eviction and nearest-device
//! selection. Time is passed in so the rules can be exercised without a clock.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::domain::models::{DeviceHandle, DiscoveredDevice};
use crate::domain::settings::ScannerSettings;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub device_timeout: Duration,
    pub nearest_update_interval: Duration,
    /// Devices weaker than this are never admitted
    pub min_rssi: i16,
    /// Only devices strictly stronger than this can be nearest
    pub nearest_threshold: i16,
}

impl From<&ScannerSettings> for RegistryConfig {
    fn from(s: &ScannerSettings) -> Self {
        Self {
            device_timeout: s.device_timeout(),
            nearest_update_interval: s.nearest_update_interval(),
            min_rssi: s.min_rssi,
            nearest_threshold: s.nearest_rssi_threshold,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from(&ScannerSettings::default())
    }
}

pub struct DeviceRegistry {
    devices: HashMap<String, DiscoveredDevice>,
    last_nearest_update: Option<Instant>,
    config: RegistryConfig,
}

impl DeviceRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            devices: HashMap::new(),
            last_nearest_update: None,
            config,
        }
    }

    /// Insert or refresh a sighting. Returns false when the signal is below
    /// the admission floor.
    pub fn upsert(&mut self, handle: DeviceHandle, name: &str, rssi: i16, now: Instant) -> bool {
        if rssi < self.config.min_rssi {
            debug!("Ignoring {} ({} dBm below floor)", name, rssi);
            return false;
        }

        match self.devices.get_mut(&handle.id) {
            Some(existing) => {
                existing.name = name.to_string();
                existing.rssi = rssi;
                existing.last_seen = now;
                existing.handle = handle;
            }
            None => {
                info!("Discovered device: {} ({})", name, handle.id);
                self.devices.insert(
                    handle.id.clone(),
                    DiscoveredDevice {
                        id: handle.id.clone(),
                        name: name.to_string(),
                        rssi,
                        last_seen: now,
                        is_nearest: false,
                        handle,
                    },
                );
            }
        }

        self.update_nearest(now);
        true
    }

    /// Drop every device not seen within the timeout. Returns the removed ids.
    pub fn evict_expired(&mut self, now: Instant) -> Vec<String> {
        let timeout = self.config.device_timeout;
        let expired: Vec<String> = self
            .devices
            .values()
            .filter(|d| now.saturating_duration_since(d.last_seen) > timeout)
            .map(|d| d.id.clone())
            .collect();

        for id in &expired {
            if let Some(device) = self.devices.remove(id) {
                info!("Device timed out: {}", device.name);
            }
        }

        if !expired.is_empty() {
            self.select_nearest(now);
        }
        expired
    }

    /// Remove one device; removing an absent id is a no-op.
    pub fn remove(&mut self, id: &str) -> bool {
        self.devices.remove(id).is_some()
    }

    /// Recompute the nearest flag unless it was recomputed within the
    /// update interval. Returns whether a recomputation happened.
    pub fn update_nearest(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_nearest_update {
            if now.saturating_duration_since(last) < self.config.nearest_update_interval {
                return false;
            }
        }
        self.select_nearest(now);
        true
    }

    fn select_nearest(&mut self, now: Instant) {
        self.last_nearest_update = Some(now);

        let threshold = self.config.nearest_threshold;
        let nearest_id = self
            .devices
            .values()
            .filter(|d| d.rssi > threshold)
            .max_by_key(|d| d.rssi)
            .map(|d| d.id.clone());

        for device in self.devices.values_mut() {
            device.is_nearest = Some(&device.id) == nearest_id.as_ref();
        }

        if let Some(id) = nearest_id {
            if let Some(device) = self.devices.get(&id) {
                debug!("Nearest device: {} ({} dBm)", device.name, device.rssi);
            }
        }
    }

    pub fn device(&self, id: &str) -> Option<&DiscoveredDevice> {
        self.devices.get(id)
    }

    pub fn nearest(&self) -> Option<&DiscoveredDevice> {
        self.devices.values().find(|d| d.is_nearest)
    }

    /// Nearest first, then strongest signal first.
    pub fn list(&self) -> Vec<DiscoveredDevice> {
        let mut list: Vec<DiscoveredDevice> = self.devices.values().cloned().collect();
        list.sort_by(|a, b| b.is_nearest.cmp(&a.is_nearest).then(b.rssi.cmp(&a.rssi)));
        list
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(RegistryConfig::default())
    }

    #[test]
    fn strongest_device_above_threshold_is_nearest() {
        let mut reg = registry();
        let t0 = Instant::now();
        reg.upsert(DeviceHandle::new("a"), "A", -50, t0);
        reg.upsert(DeviceHandle::new("b"), "B", -90, t0);
        reg.upsert(DeviceHandle::new("c"), "C", -70, t0);

        assert!(reg.update_nearest(t0 + Duration::from_secs(6)));
        assert_eq!(reg.nearest().map(|d| d.id.as_str()), Some("a"));
        assert!(!reg.device("b").unwrap().is_nearest);
        assert!(!reg.device("c").unwrap().is_nearest);

        let ids: Vec<String> = reg.list().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
    }

    #[test]
    fn device_below_threshold_is_never_nearest() {
        let mut reg = registry();
        let t0 = Instant::now();
        reg.upsert(DeviceHandle::new("b"), "B", -90, t0);
        assert!(reg.nearest().is_none());

        // Exactly at the threshold does not qualify either
        reg.upsert(DeviceHandle::new("edge"), "Edge", -80, t0);
        reg.update_nearest(t0 + Duration::from_secs(10));
        assert!(reg.nearest().is_none());
    }

    #[test]
    fn nearest_recalculation_is_rate_limited() {
        let mut reg = registry();
        let t0 = Instant::now();
        reg.upsert(DeviceHandle::new("weak"), "Weak", -75, t0);
        assert_eq!(reg.nearest().map(|d| d.id.as_str()), Some("weak"));

        // Within the interval the flag stays put
        reg.upsert(DeviceHandle::new("strong"), "Strong", -40, t0 + Duration::from_secs(1));
        assert_eq!(reg.nearest().map(|d| d.id.as_str()), Some("weak"));

        reg.update_nearest(t0 + Duration::from_secs(5));
        assert_eq!(reg.nearest().map(|d| d.id.as_str()), Some("strong"));
    }

    #[test]
    fn stale_devices_are_evicted_and_removal_is_idempotent() {
        let mut reg = registry();
        let t0 = Instant::now();
        reg.upsert(DeviceHandle::new("old"), "Old", -60, t0);
        reg.upsert(DeviceHandle::new("fresh"), "Fresh", -65, t0 + Duration::from_secs(8));

        assert!(reg.evict_expired(t0 + Duration::from_secs(10)).is_empty());

        let removed = reg.evict_expired(t0 + Duration::from_secs(11));
        assert_eq!(removed, vec!["old".to_string()]);
        assert!(reg.device("old").is_none());
        assert_eq!(reg.nearest().map(|d| d.id.as_str()), Some("fresh"));

        assert!(reg.evict_expired(t0 + Duration::from_secs(11)).is_empty());
        assert!(!reg.remove("old"));
        assert!(reg.remove("fresh"));
        assert!(reg.is_empty());
    }

    #[test]
    fn rediscovery_refreshes_last_seen() {
        let mut reg = registry();
        let t0 = Instant::now();
        reg.upsert(DeviceHandle::new("d"), "D", -60, t0);
        reg.upsert(DeviceHandle::new("d"), "D2", -55, t0 + Duration::from_secs(9));

        assert!(reg.evict_expired(t0 + Duration::from_secs(15)).is_empty());
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.device("d").unwrap().name, "D2");
        assert_eq!(reg.device("d").unwrap().rssi, -55);
    }

    #[test]
    fn signal_below_floor_is_rejected() {
        let mut reg = registry();
        assert!(!reg.upsert(DeviceHandle::new("far"), "Far", -101, Instant::now()));
        assert!(reg.is_empty());
    }
}
