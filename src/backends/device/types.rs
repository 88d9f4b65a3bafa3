// SPDX-License-Identifier: GPL-3.0-only
// Shared types for device backend abstraction

//! Shared types for device backends
//!
//! Source flags, hardware stream descriptions, raw stream samples and the
//! immutable [`Frame`] handed out to consumers.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Bitset selecting which data planes a consumer wants from a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SourceFlags(u32);

impl SourceFlags {
    pub const NONE: SourceFlags = SourceFlags(0);
    pub const BACKGROUND_REMOVAL: SourceFlags = SourceFlags(1 << 0);
    pub const BODY: SourceFlags = SourceFlags(1 << 1);
    pub const COLOR: SourceFlags = SourceFlags(1 << 2);
    pub const COLOR_MAPPED_BODY: SourceFlags = SourceFlags(1 << 3);
    pub const COLOR_MAPPED_DEPTH: SourceFlags = SourceFlags(1 << 4);
    pub const COLOR_TO_DEPTH_MAPPING: SourceFlags = SourceFlags(1 << 5);
    pub const DEPTH: SourceFlags = SourceFlags(1 << 6);
    pub const INFRARED: SourceFlags = SourceFlags(1 << 7);
    pub const ALL: SourceFlags = SourceFlags(0xFF);

    /// Flags that need the color-to-depth coordinate table
    pub const MAPPED: SourceFlags = SourceFlags(
        Self::COLOR_MAPPED_BODY.0 | Self::COLOR_MAPPED_DEPTH.0 | Self::COLOR_TO_DEPTH_MAPPING.0,
    );

    const NAMED: [(SourceFlags, &'static str); 8] = [
        (Self::BACKGROUND_REMOVAL, "background_removal"),
        (Self::BODY, "body"),
        (Self::COLOR, "color"),
        (Self::COLOR_MAPPED_BODY, "color_mapped_body"),
        (Self::COLOR_MAPPED_DEPTH, "color_mapped_depth"),
        (Self::COLOR_TO_DEPTH_MAPPING, "color_to_depth_mapping"),
        (Self::DEPTH, "depth"),
        (Self::INFRARED, "infrared"),
    ];

    pub const fn empty() -> Self {
        Self::NONE
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Build flags from raw bits, rejecting unknown bits
    pub fn from_bits(bits: u32) -> Option<Self> {
        if bits & !Self::ALL.0 == 0 {
            Some(Self(bits))
        } else {
            None
        }
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every flag in `other` is set in `self`
    pub const fn contains(self, other: SourceFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any flag in `other` is set in `self`
    pub const fn intersects(self, other: SourceFlags) -> bool {
        self.0 & other.0 != 0
    }

    /// Flags set in `self` but not in `other`
    pub const fn difference(self, other: SourceFlags) -> SourceFlags {
        SourceFlags(self.0 & !other.0)
    }

    /// Iterate the individual flags that are set
    pub fn iter(self) -> impl Iterator<Item = SourceFlags> {
        Self::NAMED
            .into_iter()
            .map(|(flag, _)| flag)
            .filter(move |flag| self.contains(*flag))
    }

    /// Names of the individual flags that are set
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMED
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }

    /// Hardware streams needed to serve these sources.
    ///
    /// When `body_in_depth` is set the device encodes the player index in
    /// the depth stream, so body data is served from depth.
    pub fn hardware_streams(self, body_in_depth: bool) -> Vec<StreamKind> {
        let mut needs = Vec::new();
        if self.contains(Self::COLOR) {
            needs.push(StreamKind::Color);
        }
        if self.intersects(Self::DEPTH | Self::MAPPED) {
            needs.push(StreamKind::Depth);
        }
        if self.contains(Self::INFRARED) {
            needs.push(StreamKind::Infrared);
        }
        if self.intersects(Self::BODY | Self::COLOR_MAPPED_BODY) {
            if body_in_depth {
                needs.push(StreamKind::Depth);
            } else {
                needs.push(StreamKind::BodyIndex);
            }
        }
        if self.contains(Self::BACKGROUND_REMOVAL) {
            needs.push(StreamKind::BackgroundRemoval);
        }

        StreamKind::ALL
            .into_iter()
            .filter(|kind| needs.contains(kind))
            .collect()
    }
}

impl std::ops::BitOr for SourceFlags {
    type Output = SourceFlags;

    fn bitor(self, rhs: SourceFlags) -> SourceFlags {
        SourceFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for SourceFlags {
    fn bitor_assign(&mut self, rhs: SourceFlags) {
        self.0 |= rhs.0;
    }
}

impl std::ops::BitAnd for SourceFlags {
    type Output = SourceFlags;

    fn bitand(self, rhs: SourceFlags) -> SourceFlags {
        SourceFlags(self.0 & rhs.0)
    }
}

impl std::fmt::Display for SourceFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.names().join(","))
        }
    }
}

/// Error returned when parsing an unknown source name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseSourceError(pub String);

impl std::fmt::Display for ParseSourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Unknown source '{}'", self.0)
    }
}

impl std::error::Error for ParseSourceError {}

impl std::str::FromStr for SourceFlags {
    type Err = ParseSourceError;

    /// Parse a comma-separated list such as `color,depth` (`none` is empty)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut flags = SourceFlags::NONE;
        for part in s.split(',') {
            let name = part.trim().to_lowercase().replace('-', "_");
            if name.is_empty() || name == "none" {
                continue;
            }
            if name == "all" {
                flags |= SourceFlags::ALL;
                continue;
            }
            let flag = Self::NAMED
                .iter()
                .find(|(_, n)| *n == name)
                .map(|(flag, _)| *flag)
                .ok_or_else(|| ParseSourceError(part.trim().to_string()))?;
            flags |= flag;
        }
        Ok(flags)
    }
}

impl From<SourceFlags> for String {
    fn from(flags: SourceFlags) -> Self {
        flags.to_string()
    }
}

impl TryFrom<String> for SourceFlags {
    type Error = ParseSourceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Independently clocked hardware stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamKind {
    Color,
    Depth,
    Infrared,
    BodyIndex,
    BackgroundRemoval,
}

impl StreamKind {
    pub const ALL: [StreamKind; 5] = [
        StreamKind::Color,
        StreamKind::Depth,
        StreamKind::Infrared,
        StreamKind::BodyIndex,
        StreamKind::BackgroundRemoval,
    ];

    /// Bytes per pixel in the raw sample buffer
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            StreamKind::Color => 4,                      // RGBA8
            StreamKind::Depth | StreamKind::Infrared => 2, // little-endian u16
            StreamKind::BodyIndex | StreamKind::BackgroundRemoval => 1,
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StreamKind::Color => "color",
            StreamKind::Depth => "depth",
            StreamKind::Infrared => "infrared",
            StreamKind::BodyIndex => "body_index",
            StreamKind::BackgroundRemoval => "background_removal",
        };
        write!(f, "{}", name)
    }
}

/// Framerate as a fraction (numerator/denominator)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Framerate {
    pub num: u32,
    pub denom: u32,
}

impl Framerate {
    /// Create a new framerate from numerator and denominator
    pub fn new(num: u32, denom: u32) -> Self {
        Self {
            num: num.max(1),
            denom: if denom == 0 { 1 } else { denom },
        }
    }

    /// Create a framerate from an integer (e.g., 30 becomes 30/1)
    pub fn from_int(fps: u32) -> Self {
        Self::new(fps, 1)
    }

    /// Get the framerate as a floating point value
    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.denom as f64
    }

    /// Duration of one hardware frame in nanoseconds
    pub fn period_ns(&self) -> u64 {
        1_000_000_000u64 * self.denom as u64 / self.num as u64
    }

    /// Duration of one hardware frame
    pub fn period(&self) -> Duration {
        Duration::from_nanos(self.period_ns())
    }
}

impl std::fmt::Display for Framerate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.denom != 1 {
            write!(f, "{:.2}", self.as_f64())
        } else {
            write!(f, "{}", self.num)
        }
    }
}

impl Default for Framerate {
    fn default() -> Self {
        Self { num: 30, denom: 1 }
    }
}

/// Resolution of one hardware stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamMode {
    pub width: u32,
    pub height: u32,
}

impl StreamMode {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for StreamMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// How depth samples are encoded by the hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DepthEncoding {
    /// Plain millimeters
    #[default]
    Millimeters,
    /// Millimeters shifted left by [`PLAYER_INDEX_BITS`](crate::constants::PLAYER_INDEX_BITS),
    /// player index (0 = nobody) in the low bits
    PlayerIndexPacked,
}

/// Fixed capabilities of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProfile {
    pub color: StreamMode,
    pub depth: StreamMode,
    pub infrared: StreamMode,
    pub framerate: Framerate,
    pub depth_encoding: DepthEncoding,
}

impl DeviceProfile {
    /// Body data is carried inside the depth stream
    pub fn body_in_depth(&self) -> bool {
        self.depth_encoding == DepthEncoding::PlayerIndexPacked
    }

    /// Resolution a hardware stream runs at
    pub fn mode_for(&self, kind: StreamKind) -> StreamMode {
        match kind {
            StreamKind::Color | StreamKind::BackgroundRemoval => self.color,
            StreamKind::Depth | StreamKind::BodyIndex => self.depth,
            StreamKind::Infrared => self.infrared,
        }
    }
}

/// One stream in a hardware configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamRequest {
    pub kind: StreamKind,
    pub mode: StreamMode,
    pub framerate: Framerate,
}

/// Set of streams the hardware should run.
///
/// Compared structurally so identical requests never restart streams.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct StreamConfiguration {
    pub streams: Vec<StreamRequest>,
}

impl StreamConfiguration {
    /// Configuration serving `sources` on a device with `profile`
    pub fn for_sources(sources: SourceFlags, profile: &DeviceProfile) -> Self {
        let streams = sources
            .hardware_streams(profile.body_in_depth())
            .into_iter()
            .map(|kind| StreamRequest {
                kind,
                mode: profile.mode_for(kind),
                framerate: profile.framerate,
            })
            .collect();
        Self { streams }
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn contains(&self, kind: StreamKind) -> bool {
        self.streams.iter().any(|s| s.kind == kind)
    }

    pub fn kinds(&self) -> Vec<StreamKind> {
        self.streams.iter().map(|s| s.kind).collect()
    }
}

impl std::fmt::Display for StreamConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.streams.is_empty() {
            return write!(f, "no streams");
        }
        let parts: Vec<String> = self
            .streams
            .iter()
            .map(|s| format!("{} {} @ {}fps", s.kind, s.mode, s.framerate))
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}

/// A raw sample polled from one hardware stream
#[derive(Debug, Clone)]
pub struct StreamSample {
    pub kind: StreamKind,
    /// Hardware timestamp in nanoseconds, never zero for a real sample
    pub timestamp_ns: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per row in `data`, may include padding
    pub pitch: u32,
    pub data: Vec<u8>,
}

impl StreamSample {
    /// Copy rows out of the padded buffer, checking declared sizes
    fn rows(&self) -> BackendResult<impl Iterator<Item = &[u8]>> {
        let row_bytes = (self.width * self.kind.bytes_per_pixel()) as usize;
        let pitch = self.pitch as usize;
        if pitch < row_bytes {
            return Err(BackendError::InvalidSample(format!(
                "{} pitch {} shorter than row of {} bytes",
                self.kind, pitch, row_bytes
            )));
        }
        let needed = match self.height as usize {
            0 => 0,
            h => pitch * (h - 1) + row_bytes,
        };
        if self.data.len() < needed {
            return Err(BackendError::InvalidSample(format!(
                "{} buffer holds {} bytes, {}x{} needs {}",
                self.kind,
                self.data.len(),
                self.width,
                self.height,
                needed
            )));
        }
        Ok((0..self.height as usize).map(move |y| &self.data[y * pitch..y * pitch + row_bytes]))
    }

    /// Decode an RGBA8 color or mask-like sample
    pub fn to_rgba_plane(&self) -> BackendResult<ColorPlane> {
        let mut data = Vec::with_capacity((self.width * self.height) as usize);
        for row in self.rows()? {
            data.extend(row.chunks_exact(4).map(|px| [px[0], px[1], px[2], px[3]]));
        }
        Ok(FramePlane::new(self.width, self.height, data))
    }

    /// Decode a little-endian 16-bit sample (depth, infrared)
    pub fn to_u16_plane(&self) -> BackendResult<FramePlane<u16>> {
        let mut data = Vec::with_capacity((self.width * self.height) as usize);
        for row in self.rows()? {
            data.extend(
                row.chunks_exact(2)
                    .map(|px| u16::from_le_bytes([px[0], px[1]])),
            );
        }
        Ok(FramePlane::new(self.width, self.height, data))
    }

    /// Decode an 8-bit sample (body index, background mask)
    pub fn to_u8_plane(&self) -> BackendResult<FramePlane<u8>> {
        let mut data = Vec::with_capacity((self.width * self.height) as usize);
        for row in self.rows()? {
            data.extend_from_slice(row);
        }
        Ok(FramePlane::new(self.width, self.height, data))
    }
}

/// Depth-space coordinate for one color pixel
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct DepthCoordinate {
    pub x: f32,
    pub y: f32,
}

impl DepthCoordinate {
    /// Marker for color pixels with no depth correspondence
    pub const INVALID: DepthCoordinate = DepthCoordinate {
        x: f32::NEG_INFINITY,
        y: f32::NEG_INFINITY,
    };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Nearest depth pixel, or None if out of range or marked invalid
    pub fn to_index(&self, width: u32, height: u32) -> Option<usize> {
        if !self.x.is_finite() || !self.y.is_finite() {
            return None;
        }
        let x = (self.x + 0.5).floor();
        let y = (self.y + 0.5).floor();
        if x < 0.0 || y < 0.0 || x >= width as f32 || y >= height as f32 {
            return None;
        }
        Some(y as usize * width as usize + x as usize)
    }
}

/// One tightly packed image plane of a frame
#[derive(Debug, Clone, PartialEq)]
pub struct FramePlane<T> {
    pub width: u32,
    pub height: u32,
    /// Bytes per row
    pub pitch: u32,
    pub data: Vec<T>,
}

impl<T> FramePlane<T> {
    pub fn new(width: u32, height: u32, data: Vec<T>) -> Self {
        Self {
            width,
            height,
            pitch: width * std::mem::size_of::<T>() as u32,
            data,
        }
    }

    pub fn get(&self, x: u32, y: u32) -> Option<&T> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data.get((y * self.width + x) as usize)
    }

    pub fn pixel_count(&self) -> usize {
        (self.width * self.height) as usize
    }
}

impl<T: Pod> FramePlane<T> {
    /// View the plane as raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }
}

/// RGBA8 color plane
pub type ColorPlane = FramePlane<[u8; 4]>;
/// Depth in millimeters
pub type DepthPlane = FramePlane<u16>;
/// 16-bit infrared intensity
pub type InfraredPlane = FramePlane<u16>;
/// Body index per pixel, [`BODY_INDEX_NONE`](crate::constants::BODY_INDEX_NONE) for no body
pub type BodyIndexPlane = FramePlane<u8>;
/// Foreground mask (255 = foreground)
pub type MaskPlane = FramePlane<u8>;
/// Depth-space coordinate per color pixel
pub type MappingPlane = FramePlane<DepthCoordinate>;

/// Color-resolution planes computed by hardware-accelerated mapping
#[derive(Debug, Clone, Default)]
pub struct ProjectedPlanes {
    pub depth: Option<DepthPlane>,
    pub body_index: Option<BodyIndexPlane>,
}

/// Summary of one plane, used for logging and listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaneInfo {
    pub source: &'static str,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
}

/// One immutable, timestamp-coherent snapshot of the enabled planes.
///
/// Published behind an `Arc`, never mutated afterwards.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Strictly increasing, assigned at publish time
    pub frame_index: u64,
    /// Reference hardware timestamp of the snapshot (nanoseconds)
    pub timestamp_ns: u64,
    /// When the frame was assembled
    pub captured_at: Instant,
    pub background_removal: Option<MaskPlane>,
    pub body_index: Option<BodyIndexPlane>,
    pub color: Option<ColorPlane>,
    pub color_mapped_body: Option<BodyIndexPlane>,
    pub color_mapped_depth: Option<DepthPlane>,
    pub color_to_depth: Option<MappingPlane>,
    pub depth: Option<DepthPlane>,
    pub infrared: Option<InfraredPlane>,
}

impl Frame {
    /// Frame without planes, index assigned on publish
    pub fn new(timestamp_ns: u64) -> Self {
        Self {
            frame_index: 0,
            timestamp_ns,
            captured_at: Instant::now(),
            background_removal: None,
            body_index: None,
            color: None,
            color_mapped_body: None,
            color_mapped_depth: None,
            color_to_depth: None,
            depth: None,
            infrared: None,
        }
    }

    /// Sources actually present in this frame
    pub fn sources(&self) -> SourceFlags {
        self.planes()
            .iter()
            .filter_map(|info| info.source.parse::<SourceFlags>().ok())
            .fold(SourceFlags::NONE, |acc, flag| acc | flag)
    }

    /// Describe the planes present in this frame
    pub fn planes(&self) -> Vec<PlaneInfo> {
        fn info<T>(source: &'static str, plane: &Option<FramePlane<T>>) -> Option<PlaneInfo> {
            plane.as_ref().map(|p| PlaneInfo {
                source,
                width: p.width,
                height: p.height,
                pitch: p.pitch,
            })
        }

        [
            info("background_removal", &self.background_removal),
            info("body", &self.body_index),
            info("color", &self.color),
            info("color_mapped_body", &self.color_mapped_body),
            info("color_mapped_depth", &self.color_mapped_depth),
            info("color_to_depth_mapping", &self.color_to_depth),
            info("depth", &self.depth),
            info("infrared", &self.infrared),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Error types reported by device backends
#[derive(Debug, Clone, PartialEq)]
pub enum BackendError {
    /// Backend is not available on this system
    NotAvailable(String),
    /// Hardware session could not be opened
    OpenFailed(String),
    /// Hardware rejected a stream configuration
    ConfigurationRejected(String),
    /// Polling a stream failed
    StreamFailed(String),
    /// Sample did not match its declared geometry
    InvalidSample(String),
    /// Device was unplugged or the session is closed
    Disconnected,
    /// Parameter not understood by this backend
    UnknownParameter(String),
    /// Other errors
    Other(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::NotAvailable(msg) => write!(f, "Backend not available: {}", msg),
            BackendError::OpenFailed(msg) => write!(f, "Open failed: {}", msg),
            BackendError::ConfigurationRejected(msg) => {
                write!(f, "Configuration rejected: {}", msg)
            }
            BackendError::StreamFailed(msg) => write!(f, "Stream failed: {}", msg),
            BackendError::InvalidSample(msg) => write!(f, "Invalid sample: {}", msg),
            BackendError::Disconnected => write!(f, "Device disconnected"),
            BackendError::UnknownParameter(name) => write!(f, "Unknown parameter '{}'", name),
            BackendError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for BackendError {}
