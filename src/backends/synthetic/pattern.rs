// SPDX-License-Identifier: GPL-3.0-only

//! Deterministic test patterns
//!
//! Every pattern depends only on pixel position and tick, so tests can
//! predict exact values.

use crate::backends::device::{DepthEncoding, StreamKind, StreamMode, StreamSample};
use crate::constants::{BODY_INDEX_NONE, PLAYER_INDEX_BITS};

/// Nearest depth in the pattern (millimeters)
pub const BASE_DEPTH_MM: u16 = 500;

/// Depth step between neighbouring pattern values (millimeters)
pub const DEPTH_STEP_MM: u16 = 50;

/// Body index of the figure standing in the middle of the scene
pub const FIGURE_BODY_INDEX: u8 = 0;

/// Whether column `x` of a `width` wide image belongs to the figure
pub fn in_figure(x: u32, width: u32) -> bool {
    x >= width / 3 && x < width - width / 3
}

/// Depth in millimeters at a depth pixel
pub fn depth_mm(x: u32, y: u32, tick: u64) -> u16 {
    BASE_DEPTH_MM + ((x as u64 + y as u64 + tick) % 64) as u16 * DEPTH_STEP_MM
}

/// Body index at a depth pixel
pub fn body_index(x: u32, width: u32) -> u8 {
    if in_figure(x, width) {
        FIGURE_BODY_INDEX
    } else {
        BODY_INDEX_NONE
    }
}

/// Raw depth sample value, packing the player index when asked to
pub fn raw_depth(x: u32, y: u32, width: u32, tick: u64, encoding: DepthEncoding) -> u16 {
    let depth = depth_mm(x, y, tick);
    match encoding {
        DepthEncoding::Millimeters => depth,
        DepthEncoding::PlayerIndexPacked => {
            let player = match body_index(x, width) {
                BODY_INDEX_NONE => 0,
                index => index as u16 + 1,
            };
            (depth << PLAYER_INDEX_BITS) | player
        }
    }
}

pub fn color(x: u32, y: u32, mode: StreamMode, tick: u64) -> [u8; 4] {
    [
        (x * 255 / mode.width.max(1)) as u8,
        (y * 255 / mode.height.max(1)) as u8,
        (tick.wrapping_mul(8) % 256) as u8,
        255,
    ]
}

pub fn infrared(x: u32, y: u32, tick: u64) -> u16 {
    ((x as u64 * y as u64 + tick).wrapping_mul(97) % 65_536) as u16
}

/// Build one padded sample of `kind`
pub fn sample(
    kind: StreamKind,
    mode: StreamMode,
    tick: u64,
    timestamp_ns: u64,
    row_padding: u32,
    encoding: DepthEncoding,
) -> StreamSample {
    let bpp = kind.bytes_per_pixel();
    let pitch = mode.width * bpp + row_padding;
    let mut data = Vec::with_capacity((pitch * mode.height) as usize);

    for y in 0..mode.height {
        for x in 0..mode.width {
            match kind {
                StreamKind::Color => data.extend_from_slice(&color(x, y, mode, tick)),
                StreamKind::Depth => data.extend_from_slice(
                    &raw_depth(x, y, mode.width, tick, encoding).to_le_bytes(),
                ),
                StreamKind::Infrared => data.extend_from_slice(&infrared(x, y, tick).to_le_bytes()),
                StreamKind::BodyIndex => data.push(body_index(x, mode.width)),
                StreamKind::BackgroundRemoval => {
                    data.push(if in_figure(x, mode.width) { 255 } else { 0 })
                }
            }
        }
        data.resize(data.len() + row_padding as usize, 0xAA);
    }

    StreamSample {
        kind,
        timestamp_ns,
        width: mode.width,
        height: mode.height,
        pitch,
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_depth_carries_player() {
        let width = 9;
        let inside = raw_depth(4, 0, width, 0, DepthEncoding::PlayerIndexPacked);
        assert_eq!(inside >> PLAYER_INDEX_BITS, depth_mm(4, 0, 0));
        assert_eq!(inside & 0x7, 1);

        let outside = raw_depth(0, 0, width, 0, DepthEncoding::PlayerIndexPacked);
        assert_eq!(outside & 0x7, 0);
    }

    #[test]
    fn test_sample_has_declared_geometry() {
        let sample = sample(
            StreamKind::Infrared,
            StreamMode::new(3, 2),
            1,
            42,
            4,
            DepthEncoding::Millimeters,
        );
        assert_eq!(sample.pitch, 10);
        assert_eq!(sample.data.len(), 20);
        let plane = sample.to_u16_plane().unwrap();
        assert_eq!(plane.get(2, 1), Some(&infrared(2, 1, 1)));
    }
}
