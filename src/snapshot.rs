// SPDX-License-Identifier: GPL-3.0-only

//! Writing frames to disk
//!
//! Each snapshot gets its own timestamped directory holding one PNG per
//! plane. Depth planes additionally get an 8-bit preview and a raw
//! little-endian dump, the coordinate table is dumped raw only.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::{GrayImage, ImageBuffer, Luma, RgbaImage};
use tracing::{debug, info};

use crate::backends::device::{DepthPlane, Frame, FramePlane};
use crate::constants::INVALID_DEPTH;
use crate::errors::{AppError, AppResult};

/// Nearest depth mapped to white in previews (millimeters)
pub const PREVIEW_NEAR_MM: u16 = 400;
/// Farthest depth mapped to black in previews (millimeters)
pub const PREVIEW_FAR_MM: u16 = 4000;

/// Convert depth to 8-bit grayscale, closer is brighter, invalid is black
pub fn depth_preview(depth: &DepthPlane) -> GrayImage {
    let range = (PREVIEW_FAR_MM - PREVIEW_NEAR_MM) as f32;
    let data = depth
        .data
        .iter()
        .map(|&d| {
            if d == INVALID_DEPTH || d >= PREVIEW_FAR_MM {
                0u8
            } else {
                let normalized = 1.0 - (d.saturating_sub(PREVIEW_NEAR_MM)) as f32 / range;
                (normalized.clamp(0.0, 1.0) * 255.0) as u8
            }
        })
        .collect();
    GrayImage::from_raw(depth.width, depth.height, data).unwrap_or_default()
}

/// Files written for one frame
#[derive(Debug, Clone, Default)]
pub struct SnapshotResult {
    pub directory: PathBuf,
    pub files: Vec<PathBuf>,
}

fn save_error(path: &Path, e: impl std::fmt::Display) -> AppError {
    AppError::Storage(format!("Failed to save {}: {}", path.display(), e))
}

fn write_raw<T: bytemuck::Pod>(plane: &FramePlane<T>, path: PathBuf, files: &mut Vec<PathBuf>) -> AppResult<()> {
    std::fs::write(&path, plane.as_bytes()).map_err(|e| save_error(&path, e))?;
    files.push(path);
    Ok(())
}

fn write_frame(frame: &Frame, dir: &Path) -> AppResult<Vec<PathBuf>> {
    let mut files = Vec::new();

    if let Some(color) = &frame.color {
        let path = dir.join("color.png");
        let bytes = bytemuck::cast_slice::<[u8; 4], u8>(&color.data).to_vec();
        let image = RgbaImage::from_raw(color.width, color.height, bytes)
            .ok_or_else(|| save_error(&path, "color plane size mismatch"))?;
        image.save(&path).map_err(|e| save_error(&path, e))?;
        files.push(path);
    }

    for (name, plane) in [
        ("depth", &frame.depth),
        ("color_mapped_depth", &frame.color_mapped_depth),
    ] {
        let Some(depth) = plane else { continue };
        let path = dir.join(format!("{}.png", name));
        depth_preview(depth).save(&path).map_err(|e| save_error(&path, e))?;
        files.push(path);
        write_raw(depth, dir.join(format!("{}.raw", name)), &mut files)?;
    }

    if let Some(infrared) = &frame.infrared {
        let path = dir.join("infrared.png");
        let image = ImageBuffer::<Luma<u16>, Vec<u16>>::from_raw(
            infrared.width,
            infrared.height,
            infrared.data.clone(),
        )
        .ok_or_else(|| save_error(&path, "infrared plane size mismatch"))?;
        image.save(&path).map_err(|e| save_error(&path, e))?;
        files.push(path);
    }

    for (name, plane) in [
        ("body", &frame.body_index),
        ("color_mapped_body", &frame.color_mapped_body),
        ("background_removal", &frame.background_removal),
    ] {
        let Some(mask) = plane else { continue };
        let path = dir.join(format!("{}.png", name));
        let image = GrayImage::from_raw(mask.width, mask.height, mask.data.clone())
            .ok_or_else(|| save_error(&path, "plane size mismatch"))?;
        image.save(&path).map_err(|e| save_error(&path, e))?;
        files.push(path);
    }

    if let Some(table) = &frame.color_to_depth {
        write_raw(table, dir.join("color_to_depth.raw"), &mut files)?;
    }

    Ok(files)
}

/// Save every plane of `frame` below `output_dir`
pub async fn save_frame(frame: Arc<Frame>, output_dir: PathBuf) -> AppResult<SnapshotResult> {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let directory = output_dir.join(format!("frame_{}_{}", timestamp, frame.frame_index));
    tokio::fs::create_dir_all(&directory).await?;

    let dir = directory.clone();
    let files = tokio::task::spawn_blocking(move || write_frame(&frame, &dir))
        .await
        .map_err(|e| AppError::Other(format!("Task join error: {}", e)))??;

    for file in &files {
        debug!(path = %file.display(), "Saved plane");
    }
    info!(directory = %directory.display(), files = files.len(), "Snapshot saved");
    Ok(SnapshotResult { directory, files })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::device::DepthCoordinate;

    #[test]
    fn test_depth_preview_scale() {
        let depth = FramePlane::new(4, 1, vec![INVALID_DEPTH, PREVIEW_NEAR_MM, 2200, PREVIEW_FAR_MM]);
        let preview = depth_preview(&depth);
        assert_eq!(preview.get_pixel(0, 0).0, [0]);
        assert_eq!(preview.get_pixel(1, 0).0, [255]);
        assert_eq!(preview.get_pixel(2, 0).0, [127]);
        assert_eq!(preview.get_pixel(3, 0).0, [0]);
    }

    #[tokio::test]
    async fn test_save_frame_writes_planes() {
        let mut frame = Frame::new(1);
        frame.frame_index = 7;
        frame.color = Some(FramePlane::new(2, 1, vec![[1, 2, 3, 255], [4, 5, 6, 255]]));
        frame.depth = Some(FramePlane::new(2, 1, vec![800u16, 900]));
        frame.color_to_depth = Some(FramePlane::new(1, 1, vec![DepthCoordinate::new(0.5, 0.5)]));

        let dir = std::env::temp_dir().join(format!("depthshare-{}", uuid::Uuid::new_v4()));
        let result = save_frame(Arc::new(frame), dir.clone()).await.unwrap();

        let names: Vec<String> = result
            .files
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect();
        assert_eq!(names, vec!["color.png", "depth.png", "depth.raw", "color_to_depth.raw"]);
        assert_eq!(std::fs::read(result.directory.join("depth.raw")).unwrap(), vec![0x20, 0x03, 0x84, 0x03]);
        assert_eq!(std::fs::read(result.directory.join("color_to_depth.raw")).unwrap().len(), 8);

        std::fs::remove_dir_all(dir).unwrap();
    }
}
