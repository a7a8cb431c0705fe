use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::types::{Capabilities, Device, DeviceType};

/// In-memory registry of client devices. Duplicate names are permitted;
/// identity is the generated id.
pub struct DeviceRegistry {
    devices: DashMap<String, Device>,
    ttl: Duration,
}

impl DeviceRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            devices: DashMap::new(),
            ttl,
        }
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        device_type: DeviceType,
        capabilities: Capabilities,
    ) -> Device {
        let now = Utc::now();
        let device = Device {
            id: format!("dev_{}", Uuid::now_v7()),
            name: name.into(),
            device_type,
            capabilities,
            created_at: now,
            last_seen_at: now,
        };
        debug!(id = %device.id, name = %device.name, "device registered");
        self.devices.insert(device.id.clone(), device.clone());
        device
    }

    pub fn get(&self, id: &str) -> Option<Device> {
        self.devices.get(id).map(|d| d.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    /// Update the heartbeat. Unknown ids are ignored.
    pub fn touch(&self, id: &str) {
        if let Some(mut device) = self.devices.get_mut(id) {
            device.last_seen_at = Utc::now();
        }
    }

    pub fn list(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.iter().map(|d| d.clone()).collect();
        devices.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        devices
    }

    /// Evict devices idle longer than the TTL. Returns the eviction count.
    pub fn sweep(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.ttl).unwrap_or_default();
        let before = self.devices.len();
        self.devices.retain(|_, d| d.last_seen_at >= cutoff);
        let evicted = before - self.devices.len();
        if evicted > 0 {
            debug!(evicted, "idle devices evicted");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_names_get_distinct_ids() {
        let registry = DeviceRegistry::new(Duration::from_secs(60));
        let a = registry.register("T", DeviceType::Server, Capabilities::default());
        let b = registry.register("T", DeviceType::Server, Capabilities::default());
        assert_ne!(a.id, b.id);
        assert_eq!(registry.list().len(), 2);
    }

    #[test]
    fn sweep_removes_idle_devices() {
        let registry = DeviceRegistry::new(Duration::ZERO);
        registry.register("old", DeviceType::Web, Capabilities::default());
        // TTL zero means everything registered in the past is idle.
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(registry.sweep(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn touch_updates_last_seen() {
        let registry = DeviceRegistry::new(Duration::from_secs(60));
        let device = registry.register("T", DeviceType::Mobile, Capabilities::default());
        let before = registry.get(&device.id).unwrap().last_seen_at;
        std::thread::sleep(Duration::from_millis(5));
        registry.touch(&device.id);
        assert!(registry.get(&device.id).unwrap().last_seen_at > before);
    }
}
