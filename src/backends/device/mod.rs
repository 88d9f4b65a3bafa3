// SPDX-License-Identifier: GPL-3.0-only
// Shared multi-stream device access with trait-based hardware backends

//! Shared device access
//!
//! Several consumers share one multi-stream depth sensor through leases.
//! The manager merges their requests and runs one capture worker per device.
//!
//! ```text
//! ┌──────────┐ ┌──────────┐ ┌──────────┐
//! │  Access  │ │  Access  │ │  Access  │   ← one lease per consumer
//! └────┬─────┘ └────┬─────┘ └────┬─────┘
//!      └────────────┼────────────┘
//!                   ▼
//!          ┌─────────────────┐
//!          │  DeviceManager  │  ← aggregation, worker lifecycle
//!          └────────┬────────┘
//!                   ▼
//!          ┌─────────────────┐
//!          │  CaptureWorker  │  ← reconfigure, synchronize, publish
//!          └────────┬────────┘
//!                   ▼
//!          ┌─────────────────┐
//!          │  DeviceBackend  │  ← vendor-specific acquisition
//!          └─────────────────┘
//! ```

pub mod access;
pub mod capture;
pub mod frame_loop;
pub mod manager;
pub mod mapping;
pub mod parameters;
pub mod priority;
pub mod registry;
pub mod sync;
pub mod types;

pub use access::{Access, LeaseId};
pub use capture::WorkerState;
pub use manager::DeviceManager;
pub use parameters::{ParameterSpec, ParameterValue};
pub use registry::{DeviceInfo, DeviceProvider, DeviceRegistry};
pub use types::*;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Vendor-specific hardware access
///
/// One implementation per sensor family. The capture worker owns the
/// synchronization and publishing logic; a backend only opens streams and
/// hands back raw samples.
///
/// Methods are called with the device's hardware lock held, so a backend
/// never sees concurrent calls.
pub trait DeviceBackend: Send {
    /// Stable identity shown by the registry
    fn unique_name(&self) -> String;

    /// Sources this device can serve, fixed for its lifetime
    fn supported_sources(&self) -> SourceFlags;

    /// Stream resolutions, frame rate and depth encoding
    fn profile(&self) -> DeviceProfile;

    /// Parameters exposed by this device
    fn parameters(&self) -> Vec<ParameterSpec> {
        Vec::new()
    }

    /// Whether a stream takes part in timestamp reconciliation
    fn requires_sync(&self, _kind: StreamKind) -> bool {
        true
    }

    /// Open the hardware session
    fn open(&mut self) -> BackendResult<()>;

    /// Replace the set of running streams
    fn reconfigure(&mut self, config: &StreamConfiguration) -> BackendResult<()>;

    /// Latest sample of one stream if a new one arrived, never blocks
    fn poll_stream(&mut self, kind: StreamKind) -> BackendResult<Option<StreamSample>>;

    /// Depth-space coordinate for every pixel of a `color_width` x
    /// `color_height` grid
    fn coordinate_table(
        &mut self,
        depth: &DepthPlane,
        color_width: u32,
        color_height: u32,
    ) -> BackendResult<MappingPlane>;

    /// Hardware-accelerated projection onto the color grid.
    ///
    /// `Ok(None)` selects the software path with temporal hold.
    fn project_to_color(
        &mut self,
        _depth: &DepthPlane,
        _body_index: Option<&BodyIndexPlane>,
        _color_width: u32,
        _color_height: u32,
    ) -> BackendResult<Option<ProjectedPlanes>> {
        Ok(None)
    }

    /// Apply one resolved parameter value
    fn push_parameter(&mut self, name: &str, value: &ParameterValue) -> BackendResult<()>;

    /// Close the hardware session
    fn close(&mut self);
}

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
