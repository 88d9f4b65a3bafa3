// SPDX-License-Identifier: GPL-3.0-only

//! Error types for shared device access
//!
//! Only [`DeviceError::Init`] and the caller errors ever reach a consumer.
//! Reconfiguration, acquisition and parameter push failures are absorbed by
//! the capture worker and only show up in the logs.

use std::fmt;

use crate::backends::device::SourceFlags;
use crate::backends::device::parameters::ParameterType;

/// Result type alias using DeviceError
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Errors raised by the device resource manager and its capture worker
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// Hardware session could not be opened or its first stream
    /// configuration was rejected
    Init(String),
    /// Hardware rejected a stream configuration change while running
    Reconfiguration(String),
    /// A single capture iteration failed to retrieve or process a frame
    Acquisition(String),
    /// A resolved parameter could not be applied to the hardware
    ParameterPush { name: String, message: String },
    /// Requested sources are not advertised by the device
    UnsupportedSources(SourceFlags),
    /// No parameter registered under this name
    UnknownParameter(String),
    /// Value type does not match the registered parameter type
    ParameterType { name: String, expected: ParameterType },
    /// A parameter with this name is already registered
    DuplicateParameter(String),
    /// Supported sources are set once at construction
    SupportedSourcesAlreadySet,
    /// The device was torn down while a lease still referenced it
    DeviceGone,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Init(msg) => write!(f, "Device initialization failed: {}", msg),
            DeviceError::Reconfiguration(msg) => write!(f, "Stream reconfiguration failed: {}", msg),
            DeviceError::Acquisition(msg) => write!(f, "Frame acquisition failed: {}", msg),
            DeviceError::ParameterPush { name, message } => {
                write!(f, "Failed to apply parameter '{}': {}", name, message)
            }
            DeviceError::UnsupportedSources(flags) => {
                write!(f, "Sources not supported by device: {}", flags)
            }
            DeviceError::UnknownParameter(name) => write!(f, "Unknown parameter '{}'", name),
            DeviceError::ParameterType { name, expected } => {
                write!(f, "Parameter '{}' expects a {} value", name, expected)
            }
            DeviceError::DuplicateParameter(name) => {
                write!(f, "Parameter '{}' is already registered", name)
            }
            DeviceError::SupportedSourcesAlreadySet => {
                write!(f, "Supported sources can only be set once")
            }
            DeviceError::DeviceGone => write!(f, "Device is no longer available"),
        }
    }
}

impl std::error::Error for DeviceError {}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        DeviceError::Init(err.to_string())
    }
}

/// Top-level error type for the command line front-end
#[derive(Debug, Clone)]
pub enum AppError {
    /// Device-related errors
    Device(DeviceError),
    /// Configuration errors
    Config(String),
    /// Storage/filesystem errors
    Storage(String),
    /// Generic error with message
    Other(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Device(e) => write!(f, "Device error: {}", e),
            AppError::Config(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Storage(msg) => write!(f, "Storage error: {}", msg),
            AppError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl From<DeviceError> for AppError {
    fn from(err: DeviceError) -> Self {
        AppError::Device(err)
    }
}

impl From<String> for AppError {
    fn from(msg: String) -> Self {
        AppError::Other(msg)
    }
}

impl From<&str> for AppError {
    fn from(msg: &str) -> Self {
        AppError::Other(msg.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<image::ImageError> for AppError {
    fn from(err: image::ImageError) -> Self {
        AppError::Storage(err.to_string())
    }
}
