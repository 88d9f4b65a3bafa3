// SPDX-License-Identifier: GPL-3.0-only

//! Consumer leases on a shared device

use std::sync::{Arc, Weak};

use tokio::sync::watch;
use tracing::debug;

use super::manager::{DeviceManager, DeviceShared};
use super::parameters::ParameterValue;
use super::types::{Frame, SourceFlags};
use crate::errors::{DeviceError, DeviceResult};

/// Stable identity of a lease within its device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LeaseId(pub(crate) u64);

impl LeaseId {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lease-{}", self.0)
    }
}

/// One consumer's claim on a shared device
///
/// Created by [`DeviceManager::acquire_access`]. Dropping the lease, or
/// calling [`release`](Self::release), hands it back exactly once. The lease
/// only holds a weak reference, so it may outlive the device; releasing it
/// then does nothing.
#[derive(Debug)]
pub struct Access {
    id: LeaseId,
    /// Sources this lease asked for, cached so reads never wait on the device
    sources: SourceFlags,
    device: Weak<DeviceShared>,
    released: bool,
}

impl Access {
    pub(crate) fn new(id: LeaseId, sources: SourceFlags, device: Weak<DeviceShared>) -> Self {
        Self {
            id,
            sources,
            device,
            released: false,
        }
    }

    pub fn id(&self) -> LeaseId {
        self.id
    }

    /// Sources requested by this lease
    pub fn sources(&self) -> SourceFlags {
        self.sources
    }

    /// Change the requested sources and re-aggregate the device
    pub fn set_sources(&mut self, sources: SourceFlags) -> DeviceResult<()> {
        self.shared()?.set_lease_sources(self.id, sources)?;
        self.sources = sources;
        Ok(())
    }

    /// Most recent frame of the device, if any
    pub fn last_frame(&self) -> Option<Arc<Frame>> {
        self.device.upgrade().and_then(|device| device.last_frame())
    }

    /// Overwrite this lease's parameter preferences
    pub fn update_parameters(&self, values: &[(&str, ParameterValue)]) -> DeviceResult<()> {
        self.shared()?.update_parameters(self.id, values)
    }

    /// Watch published frames
    pub fn subscribe(&self) -> DeviceResult<watch::Receiver<Option<Arc<Frame>>>> {
        Ok(self.shared()?.subscribe())
    }

    /// Manager of the device this lease belongs to
    pub fn device(&self) -> Option<DeviceManager> {
        self.device.upgrade().map(DeviceManager::from_shared)
    }

    /// Give the lease back now instead of at the end of its scope
    pub fn release(mut self) {
        self.release_once();
    }

    fn shared(&self) -> DeviceResult<Arc<DeviceShared>> {
        if self.released {
            return Err(DeviceError::DeviceGone);
        }
        self.device.upgrade().ok_or(DeviceError::DeviceGone)
    }

    fn release_once(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match self.device.upgrade() {
            Some(device) => device.release(self.id),
            None => debug!(lease = %self.id, "Device already gone, nothing to release"),
        }
    }
}

impl Drop for Access {
    fn drop(&mut self) {
        self.release_once();
    }
}
