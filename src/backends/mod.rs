// SPDX-License-Identifier: GPL-3.0-only

//! Backend abstraction layer for shared depth sensors
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              Consumers (leases)              │
//! └────────────────────┬────────────────────────┘
//!                      │
//! ┌────────────────────┴────────────────────────┐
//! │                Device Layer                  │
//! │  ┌──────────────┐    ┌──────────────────┐   │
//! │  │   Registry   │    │  DeviceManager   │   │
//! │  │ (providers)  │    │ + CaptureWorker  │   │
//! │  └──────────────┘    └────────┬─────────┘   │
//! │                      ┌────────┴─────────┐   │
//! │                      │  DeviceBackend   │   │
//! │                      │ (synthetic, ...) │   │
//! │                      └──────────────────┘   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`device`]: leases, aggregation, capture worker and frame model
//! - [`synthetic`]: deterministic software sensor

pub mod device;
pub mod synthetic;
