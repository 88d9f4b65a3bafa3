// SPDX-License-Identifier: GPL-3.0-only

//! depthshare - shared access to multi-stream depth sensors
//!
//! Several independent consumers use one sensor at the same time. Each holds
//! an [`Access`] lease naming the planes it wants (color, depth, infrared,
//! body index, color-mapped depth, ...) and its preferred device settings.
//! The [`DeviceManager`] merges those requests, runs a single capture worker
//! for the device and publishes timestamp-coherent [`Frame`]s that any
//! number of readers can hold.
//!
//! # Modules
//!
//! - [`backends`]: device layer and hardware backends
//! - [`config`]: user configuration handling
//! - [`snapshot`]: writing frames to disk
//!
//! # Example
//!
//! ```no_run
//! use depthshare::backends::synthetic::{SyntheticBackend, SyntheticOptions};
//! use depthshare::{CaptureSettings, DeviceManager, SourceFlags};
//!
//! let backend = SyntheticBackend::new(SyntheticOptions::kinect_v2("sensor"));
//! let device = DeviceManager::new(Box::new(backend), CaptureSettings::default())?;
//! let access = device.acquire_access(SourceFlags::COLOR | SourceFlags::DEPTH)?;
//! if let Some(frame) = access.last_frame() {
//!     println!("frame {} with {}", frame.frame_index, frame.sources());
//! }
//! # Ok::<(), depthshare::errors::DeviceError>(())
//! ```

pub mod backends;
pub mod config;
pub mod constants;
pub mod errors;
pub mod snapshot;

// Re-export commonly used types
pub use backends::device::{
    Access, DeviceManager, DeviceRegistry, Frame, ParameterValue, SourceFlags, WorkerState,
};
pub use config::{CaptureSettings, Config};
pub use errors::{AppError, AppResult, DeviceError, DeviceResult};
