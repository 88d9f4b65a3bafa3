// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for device discovery

use depthshare::backends::device::priority::{LoggingPriorityHook, ServicePriorityState};
use depthshare::backends::device::{DeviceBackend, DeviceProvider};
use depthshare::backends::synthetic::{SyntheticBackend, SyntheticOptions, SyntheticProvider};
use depthshare::{CaptureSettings, DeviceRegistry, SourceFlags};
use std::sync::{Arc, Mutex};

/// Provider whose device list can change between refreshes
struct ChangingProvider {
    devices: Arc<Mutex<Vec<SyntheticOptions>>>,
}

impl DeviceProvider for ChangingProvider {
    fn name(&self) -> &str {
        "changing"
    }

    fn enumerate(&self) -> Vec<Box<dyn DeviceBackend>> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .map(|options| Box::new(SyntheticBackend::new(options)) as Box<dyn DeviceBackend>)
            .collect()
    }
}

fn options(name: &str) -> SyntheticOptions {
    let mut options = SyntheticOptions::small(name);
    options.priority = ServicePriorityState::new(Box::new(LoggingPriorityHook));
    options
}

fn changing_registry(names: &[&str]) -> (DeviceRegistry, Arc<Mutex<Vec<SyntheticOptions>>>) {
    let devices = Arc::new(Mutex::new(names.iter().map(|n| options(n)).collect()));
    let mut registry = DeviceRegistry::new(CaptureSettings::default());
    registry.register_provider(Box::new(ChangingProvider {
        devices: Arc::clone(&devices),
    }));
    registry.refresh();
    (registry, devices)
}

#[test]
fn test_standard_provider_devices() {
    let mut registry = DeviceRegistry::new(CaptureSettings::default());
    registry.register_provider(Box::new(SyntheticProvider::standard()));
    registry.refresh();

    let infos = registry.infos();
    assert_eq!(infos.len(), 2);
    assert!(infos.iter().all(|info| info.provider == "synthetic"));
    assert!(infos.iter().all(|info| info.state == "idle" && info.leases == 0));

    let v1 = registry.find("synthetic-kinect-v1").unwrap();
    assert!(!v1.supported_sources().contains(SourceFlags::INFRARED));
    assert_eq!(infos[1].color, "1920x1080");
}

#[test]
fn test_refresh_keeps_known_managers() {
    let (mut registry, _) = changing_registry(&["a", "b"]);
    let before = registry.find("a").unwrap();
    let _access = before.acquire_access(SourceFlags::DEPTH).unwrap();

    registry.refresh();
    assert_eq!(registry.devices().len(), 2);
    assert_eq!(registry.find("a").unwrap().lease_count(), 1);
    assert_eq!(registry.active_count(), 1);
}

#[test]
fn test_vanished_devices_are_dropped_unless_leased() {
    let (mut registry, devices) = changing_registry(&["a", "b"]);
    let access = registry
        .find("b")
        .unwrap()
        .acquire_access(SourceFlags::COLOR)
        .unwrap();

    devices.lock().unwrap().clear();
    registry.refresh();
    assert!(registry.find("a").is_none());
    assert!(registry.find("b").is_some());

    access.release();
    registry.refresh();
    assert!(registry.devices().is_empty());
}

#[test]
fn test_device_info_serializes() {
    let (registry, _) = changing_registry(&["json"]);
    let value = serde_json::to_value(registry.infos()).unwrap();
    assert_eq!(value[0]["unique_name"], "json");
    assert_eq!(value[0]["supported_sources"], SourceFlags::ALL.to_string());
    assert_eq!(value[0]["framerate"], 100.0);
}
