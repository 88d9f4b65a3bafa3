// SPDX-License-Identifier: GPL-3.0-only

//! Crate-wide constants

use std::time::Duration;

/// Depth value written for pixels with no valid projection (millimeters)
pub const INVALID_DEPTH: u16 = 0;

/// Body index value meaning "no body at this pixel"
pub const BODY_INDEX_NONE: u8 = 255;

/// Number of low bits carrying the player index in packed depth samples
pub const PLAYER_INDEX_BITS: u32 = 3;

/// Mask selecting the player index from a packed depth sample
pub const PLAYER_INDEX_MASK: u16 = (1 << PLAYER_INDEX_BITS) - 1;

/// Tolerance used when comparing floating point parameter values
pub const FLOAT_PARAMETER_EPSILON: f64 = 1e-6;

/// Consecutive invalid mapping frames during which the last good value is held
pub const DEFAULT_MAPPING_HOLD_FRAMES: u32 = 3;

/// Pause after a rejected stream reconfiguration
pub const DEFAULT_RECONFIGURE_BACKOFF: Duration = Duration::from_millis(100);

/// Pause after a failed capture iteration.
///
/// Much longer than a frame period so a dead stream does not flood the log.
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_millis(1000);

/// Pause while no stream is enabled
pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_millis(10);

/// Pause between polls while waiting for streams to line up
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Panicking capture iterations in a row before the session is closed
pub const MAX_CONSECUTIVE_PANICS: u32 = 3;

/// Longest single sleep slice before the stop signal is checked again
pub const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Application directory name used for config and snapshots
pub const APP_DIR_NAME: &str = "depthshare";

/// Config file name inside the config directory
pub const CONFIG_FILE_NAME: &str = "config.json";
