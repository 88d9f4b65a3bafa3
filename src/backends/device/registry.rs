// SPDX-License-Identifier: GPL-3.0-only

//! Device discovery
//!
//! Providers enumerate the devices of one backend family. The registry keeps
//! one [`DeviceManager`] per unique name across refreshes, so consumers that
//! already hold a handle keep talking to the same device.

use serde::Serialize;
use tracing::{debug, info, warn};

use super::manager::DeviceManager;
use super::types::SourceFlags;
use super::{DeviceBackend, WorkerState};
use crate::config::CaptureSettings;

/// Enumerates the devices of one backend family
pub trait DeviceProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Backends for every device currently present
    fn enumerate(&self) -> Vec<Box<dyn DeviceBackend>>;
}

/// Identity and capabilities of a device, for listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub unique_name: String,
    pub provider: String,
    pub supported_sources: SourceFlags,
    pub color: String,
    pub depth: String,
    pub framerate: f64,
    pub parameters: Vec<String>,
    pub state: String,
    pub leases: usize,
}

struct RegisteredDevice {
    provider: String,
    manager: DeviceManager,
}

/// All known devices across providers
pub struct DeviceRegistry {
    settings: CaptureSettings,
    providers: Vec<Box<dyn DeviceProvider>>,
    devices: Vec<RegisteredDevice>,
}

impl DeviceRegistry {
    pub fn new(settings: CaptureSettings) -> Self {
        Self {
            settings,
            providers: Vec::new(),
            devices: Vec::new(),
        }
    }

    pub fn register_provider(&mut self, provider: Box<dyn DeviceProvider>) {
        debug!(provider = provider.name(), "Device provider registered");
        self.providers.push(provider);
    }

    /// Enumerate every provider again.
    ///
    /// Known devices keep their manager. Devices that disappeared are dropped
    /// unless someone still holds a lease on them.
    pub fn refresh(&mut self) {
        let mut seen = Vec::new();

        for provider in &self.providers {
            for backend in provider.enumerate() {
                let name = backend.unique_name();
                seen.push(name.clone());
                if self.devices.iter().any(|d| d.manager.unique_name() == name) {
                    continue;
                }
                match DeviceManager::new(backend, self.settings) {
                    Ok(manager) => {
                        info!(device = %name, provider = provider.name(), "Device discovered");
                        self.devices.push(RegisteredDevice {
                            provider: provider.name().to_string(),
                            manager,
                        });
                    }
                    Err(e) => warn!(device = %name, error = %e, "Skipping device"),
                }
            }
        }

        self.devices.retain(|device| {
            let keep = seen.iter().any(|name| name == device.manager.unique_name())
                || device.manager.lease_count() > 0;
            if !keep {
                info!(device = %device.manager.unique_name(), "Device removed");
            }
            keep
        });
    }

    pub fn devices(&self) -> Vec<DeviceManager> {
        self.devices.iter().map(|d| d.manager.clone()).collect()
    }

    pub fn find(&self, unique_name: &str) -> Option<DeviceManager> {
        self.devices
            .iter()
            .find(|d| d.manager.unique_name() == unique_name)
            .map(|d| d.manager.clone())
    }

    pub fn infos(&self) -> Vec<DeviceInfo> {
        self.devices
            .iter()
            .map(|device| {
                let manager = &device.manager;
                let profile = manager.profile();
                DeviceInfo {
                    unique_name: manager.unique_name().to_string(),
                    provider: device.provider.clone(),
                    supported_sources: manager.supported_sources(),
                    color: profile.color.to_string(),
                    depth: profile.depth.to_string(),
                    framerate: profile.framerate.as_f64(),
                    parameters: manager
                        .parameters()
                        .iter()
                        .map(|spec| spec.name().to_string())
                        .collect(),
                    state: manager.capture_state().to_string(),
                    leases: manager.lease_count(),
                }
            })
            .collect()
    }

    /// Devices with a running capture worker
    pub fn active_count(&self) -> usize {
        self.devices
            .iter()
            .filter(|d| d.manager.capture_state() != WorkerState::Idle)
            .count()
    }
}
