// SPDX-License-Identifier: GPL-3.0-only

//! Software depth-to-color mapping
//!
//! Projects depth-resolution planes onto the color grid through the
//! per-pixel coordinate table reported by the hardware. Single-frame mapping
//! dropouts are smoothed by holding the last good value for a bounded number
//! of frames (the dirty counter).

use super::types::{BodyIndexPlane, DepthPlane, FramePlane, MappingPlane};
use crate::constants::{BODY_INDEX_NONE, PLAYER_INDEX_BITS, PLAYER_INDEX_MASK};

/// Projects one source plane onto the color grid with temporal hold
#[derive(Debug, Clone)]
pub struct TemporalProjector<T> {
    /// Invalid frames tolerated before a pixel falls back to the sentinel
    ceiling: u32,
    width: u32,
    height: u32,
    dirty: Vec<u32>,
    held: Vec<T>,
}

impl<T: Copy> TemporalProjector<T> {
    pub fn new(ceiling: u32) -> Self {
        Self {
            ceiling,
            width: 0,
            height: 0,
            dirty: Vec::new(),
            held: Vec::new(),
        }
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    /// Consecutive invalid frames seen at an output pixel
    pub fn dirty_count(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.dirty.get((y * self.width + x) as usize).copied()
    }

    /// Resize state on resolution change only
    fn ensure_size(&mut self, width: u32, height: u32, invalid: T) {
        if self.width == width && self.height == height {
            return;
        }
        let count = (width * height) as usize;
        self.width = width;
        self.height = height;
        self.dirty = vec![0; count];
        self.held = vec![invalid; count];
    }

    /// Map `source` onto the grid described by `table`.
    ///
    /// Pixels whose coordinate is invalid keep their previous output while
    /// the dirty counter stays at or below the ceiling, then become `invalid`.
    pub fn project(
        &mut self,
        table: &MappingPlane,
        source: &FramePlane<T>,
        invalid: T,
    ) -> FramePlane<T> {
        self.ensure_size(table.width, table.height, invalid);

        // Entries beyond the declared grid are ignored, missing ones count as invalid
        let mut coordinates = table.data.iter();
        for (dirty, held) in self.dirty.iter_mut().zip(self.held.iter_mut()) {
            let sample = coordinates
                .next()
                .and_then(|c| c.to_index(source.width, source.height))
                .and_then(|index| source.data.get(index).copied());

            match sample {
                Some(value) => {
                    *dirty = 0;
                    *held = value;
                }
                None => {
                    *dirty = dirty.saturating_add(1);
                    if *dirty > self.ceiling {
                        *held = invalid;
                    }
                }
            }
        }

        FramePlane::new(table.width, table.height, self.held.clone())
    }
}

/// Split packed depth samples into millimeters and body index.
///
/// Player index 0 means nobody; players 1..=7 become body indices 0..=6.
pub fn split_player_index(packed: &DepthPlane) -> (DepthPlane, BodyIndexPlane) {
    let depth = packed
        .data
        .iter()
        .map(|raw| raw >> PLAYER_INDEX_BITS)
        .collect();
    let body = packed
        .data
        .iter()
        .map(|raw| match (raw & PLAYER_INDEX_MASK) as u8 {
            0 => BODY_INDEX_NONE,
            player => player - 1,
        })
        .collect();

    (
        FramePlane::new(packed.width, packed.height, depth),
        FramePlane::new(packed.width, packed.height, body),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::device::types::DepthCoordinate;
    use crate::constants::INVALID_DEPTH;

    fn table(coordinate: DepthCoordinate) -> MappingPlane {
        FramePlane::new(1, 1, vec![coordinate])
    }

    fn depth(value: u16) -> DepthPlane {
        FramePlane::new(2, 1, vec![value, value + 1])
    }

    #[test]
    fn test_copies_valid_projection() {
        let mut projector = TemporalProjector::new(2);
        let table = FramePlane::new(
            2,
            1,
            vec![DepthCoordinate::new(1.0, 0.0), DepthCoordinate::new(0.0, 0.0)],
        );
        let out = projector.project(&table, &depth(100), INVALID_DEPTH);
        assert_eq!(out.data, vec![101, 100]);
    }

    #[test]
    fn test_holds_until_ceiling_then_invalidates() {
        let ceiling = 3;
        let mut projector = TemporalProjector::new(ceiling);
        let valid = table(DepthCoordinate::new(0.0, 0.0));
        let invalid = table(DepthCoordinate::INVALID);

        assert_eq!(projector.project(&valid, &depth(500), INVALID_DEPTH).data, vec![500]);

        for n in 1..=ceiling {
            let out = projector.project(&invalid, &depth(900), INVALID_DEPTH);
            assert_eq!(out.data, vec![500], "held on invalid frame {}", n);
            assert_eq!(projector.dirty_count(0, 0), Some(n));
        }

        let out = projector.project(&invalid, &depth(900), INVALID_DEPTH);
        assert_eq!(out.data, vec![INVALID_DEPTH]);
    }

    #[test]
    fn test_valid_frame_resets_counter() {
        let mut projector = TemporalProjector::new(2);
        let valid = table(DepthCoordinate::new(0.0, 0.0));
        let out_of_range = table(DepthCoordinate::new(5.0, 0.0));

        projector.project(&valid, &depth(10), INVALID_DEPTH);
        projector.project(&out_of_range, &depth(20), INVALID_DEPTH);
        projector.project(&out_of_range, &depth(20), INVALID_DEPTH);
        assert_eq!(projector.dirty_count(0, 0), Some(2));

        assert_eq!(projector.project(&valid, &depth(30), INVALID_DEPTH).data, vec![30]);
        assert_eq!(projector.dirty_count(0, 0), Some(0));

        // Two more invalid frames are held again
        projector.project(&out_of_range, &depth(40), INVALID_DEPTH);
        let out = projector.project(&out_of_range, &depth(40), INVALID_DEPTH);
        assert_eq!(out.data, vec![30]);
    }

    #[test]
    fn test_table_length_mismatch_stays_in_bounds() {
        let mut projector = TemporalProjector::new(1);
        let oversized = FramePlane::new(
            1,
            1,
            vec![DepthCoordinate::new(1.0, 0.0), DepthCoordinate::new(0.0, 0.0)],
        );
        let out = projector.project(&oversized, &depth(100), INVALID_DEPTH);
        assert_eq!(out.data, vec![101]);

        let short = FramePlane::new(2, 1, vec![DepthCoordinate::new(0.0, 0.0)]);
        let out = projector.project(&short, &depth(100), INVALID_DEPTH);
        assert_eq!(out.data, vec![100, INVALID_DEPTH]);
        assert_eq!(projector.dirty_count(1, 0), Some(1));
    }

    #[test]
    fn test_zero_ceiling_never_holds() {
        let mut projector = TemporalProjector::new(0);
        projector.project(&table(DepthCoordinate::new(0.0, 0.0)), &depth(7), INVALID_DEPTH);
        let out = projector.project(&table(DepthCoordinate::INVALID), &depth(7), INVALID_DEPTH);
        assert_eq!(out.data, vec![INVALID_DEPTH]);
    }

    #[test]
    fn test_resolution_change_reallocates() {
        let mut projector = TemporalProjector::new(5);
        projector.project(&table(DepthCoordinate::INVALID), &depth(1), INVALID_DEPTH);
        assert_eq!(projector.dirty_count(0, 0), Some(1));

        let wide = FramePlane::new(2, 1, vec![DepthCoordinate::INVALID; 2]);
        projector.project(&wide, &depth(1), INVALID_DEPTH);
        assert_eq!(projector.dirty_count(0, 0), Some(1));
        assert_eq!(projector.dirty_count(1, 0), Some(1));
    }

    #[test]
    fn test_split_player_index() {
        let packed = FramePlane::new(3, 1, vec![(1000 << 3) | 2, 1500 << 3, (800 << 3) | 7]);
        let (depth, body) = split_player_index(&packed);
        assert_eq!(depth.data, vec![1000, 1500, 800]);
        assert_eq!(body.data, vec![1, BODY_INDEX_NONE, 6]);
    }
}
