// SPDX-License-Identifier: GPL-3.0-only

//! Synthetic depth sensor
//!
//! A software device producing deterministic patterns on a wall-clock tick.
//! Each stream advances once per frame period and stamps its samples with
//! the tick time, so streams line up unless a lag is injected.
//!
//! Behaviour can be steered from outside through a shared [`SyntheticProbe`]:
//! call counters, injected failures, per-stream lag and mapping dropouts.
//! The command line front-end uses it as a stand-in device, tests use it as
//! the hardware double.

pub mod pattern;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::backends::device::parameters::combinators;
use crate::backends::device::priority::{
    PriorityRegistration, ServicePriority, ServicePriorityState,
};
use crate::backends::device::{
    BackendError, BackendResult, BodyIndexPlane, DepthCoordinate, DepthEncoding, DepthPlane,
    DeviceBackend, DeviceProfile, DeviceProvider, FramePlane, Framerate, MappingPlane,
    ParameterSpec, ParameterValue, ProjectedPlanes, SourceFlags, StreamConfiguration, StreamKind,
    StreamMode, StreamSample,
};
use crate::constants::{BODY_INDEX_NONE, INVALID_DEPTH};

/// Integer parameter driving the process-wide helper service priority
pub const PARAM_SERVICE_PRIORITY: &str = "service_priority";
/// Short-range depth mode, on when any consumer wants it
pub const PARAM_NEAR_MODE: &str = "near_mode";
/// Exposure compensation in stops, the highest request wins
pub const PARAM_EXPOSURE_COMPENSATION: &str = "exposure_compensation";

/// Shape and behaviour of a synthetic device
#[derive(Clone)]
pub struct SyntheticOptions {
    pub name: String,
    pub profile: DeviceProfile,
    pub supported: SourceFlags,
    /// Columns at the right edge of the color grid without depth correspondence
    pub invalid_columns: u32,
    /// Extra bytes appended to every sample row
    pub row_padding: u32,
    /// Offer hardware projection instead of the software mapping path
    pub hardware_projection: bool,
    pub priority: Arc<ServicePriorityState>,
}

impl SyntheticOptions {
    /// Tiny 100 fps device for tests
    pub fn small(name: &str) -> Self {
        Self {
            name: name.to_string(),
            profile: DeviceProfile {
                color: StreamMode::new(8, 6),
                depth: StreamMode::new(4, 3),
                infrared: StreamMode::new(4, 3),
                framerate: Framerate::from_int(100),
                depth_encoding: DepthEncoding::Millimeters,
            },
            supported: SourceFlags::ALL,
            invalid_columns: 0,
            row_padding: 0,
            hardware_projection: false,
            priority: ServicePriorityState::global(),
        }
    }

    /// First generation sensor: packed depth, no infrared or background removal
    pub fn kinect_v1(name: &str) -> Self {
        Self {
            name: name.to_string(),
            profile: DeviceProfile {
                color: StreamMode::new(640, 480),
                depth: StreamMode::new(320, 240),
                infrared: StreamMode::new(640, 480),
                framerate: Framerate::from_int(30),
                depth_encoding: DepthEncoding::PlayerIndexPacked,
            },
            supported: SourceFlags::ALL
                .difference(SourceFlags::BACKGROUND_REMOVAL | SourceFlags::INFRARED),
            invalid_columns: 8,
            row_padding: 0,
            hardware_projection: false,
            priority: ServicePriorityState::global(),
        }
    }

    /// Second generation sensor with separate body index stream
    pub fn kinect_v2(name: &str) -> Self {
        Self {
            name: name.to_string(),
            profile: DeviceProfile {
                color: StreamMode::new(1920, 1080),
                depth: StreamMode::new(512, 424),
                infrared: StreamMode::new(512, 424),
                framerate: Framerate::from_int(30),
                depth_encoding: DepthEncoding::Millimeters,
            },
            supported: SourceFlags::ALL,
            invalid_columns: 32,
            row_padding: 16,
            hardware_projection: false,
            priority: ServicePriorityState::global(),
        }
    }
}

/// Shared view into a synthetic device
#[derive(Debug, Default)]
pub struct SyntheticProbe {
    open_calls: AtomicUsize,
    close_calls: AtomicUsize,
    reconfigure_calls: AtomicUsize,
    is_open: AtomicBool,
    fail_open: AtomicBool,
    fail_reconfigures: AtomicUsize,
    fail_polls: AtomicUsize,
    fail_pushes: AtomicBool,
    invalid_mapping: AtomicBool,
    lag: Mutex<HashMap<StreamKind, Duration>>,
    pushes: Mutex<Vec<(String, ParameterValue)>>,
    configurations: Mutex<Vec<StreamConfiguration>>,
}

/// Decrement `counter` if positive, returning whether it was
fn consume(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl SyntheticProbe {
    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn reconfigure_calls(&self) -> usize {
        self.reconfigure_calls.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    /// Make every `open` fail until cleared
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Reject the next `count` reconfigurations
    pub fn fail_next_reconfigures(&self, count: usize) {
        self.fail_reconfigures.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` stream polls
    pub fn fail_next_polls(&self, count: usize) {
        self.fail_polls.store(count, Ordering::SeqCst);
    }

    pub fn set_fail_pushes(&self, fail: bool) {
        self.fail_pushes.store(fail, Ordering::SeqCst);
    }

    /// Mark every coordinate of the mapping table invalid
    pub fn set_invalid_mapping(&self, invalid: bool) {
        self.invalid_mapping.store(invalid, Ordering::SeqCst);
    }

    /// Delay one stream; its samples keep their own tick timestamps
    pub fn set_lag(&self, kind: StreamKind, lag: Duration) {
        self.lag.lock().unwrap_or_else(|e| e.into_inner()).insert(kind, lag);
    }

    fn lag(&self, kind: StreamKind) -> Duration {
        self.lag
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .copied()
            .unwrap_or_default()
    }

    /// Parameter pushes received, in order
    pub fn pushes(&self) -> Vec<(String, ParameterValue)> {
        self.pushes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Configurations applied, in order
    pub fn configurations(&self) -> Vec<StreamConfiguration> {
        self.configurations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Software device implementing [`DeviceBackend`]
pub struct SyntheticBackend {
    options: SyntheticOptions,
    probe: Arc<SyntheticProbe>,
    _priority: PriorityRegistration,
    started: Option<Instant>,
    config: StreamConfiguration,
    last_tick: HashMap<StreamKind, u64>,
}

impl SyntheticBackend {
    pub fn new(options: SyntheticOptions) -> Self {
        let registration = options.priority.register();
        Self {
            options,
            probe: Arc::new(SyntheticProbe::default()),
            _priority: registration,
            started: None,
            config: StreamConfiguration::default(),
            last_tick: HashMap::new(),
        }
    }

    pub fn probe(&self) -> Arc<SyntheticProbe> {
        Arc::clone(&self.probe)
    }

    fn period_ns(&self) -> u64 {
        self.options.profile.framerate.period_ns()
    }

    /// Depth-space coordinate of a color pixel
    fn depth_coordinate(&self, x: u32, y: u32, depth: &DepthPlane, color: StreamMode) -> DepthCoordinate {
        if self.probe.invalid_mapping.load(Ordering::SeqCst)
            || x + self.options.invalid_columns >= color.width
        {
            return DepthCoordinate::INVALID;
        }
        DepthCoordinate::new(
            (x * depth.width / color.width) as f32,
            (y * depth.height / color.height) as f32,
        )
    }
}

impl DeviceBackend for SyntheticBackend {
    fn unique_name(&self) -> String {
        self.options.name.clone()
    }

    fn supported_sources(&self) -> SourceFlags {
        self.options.supported
    }

    fn profile(&self) -> DeviceProfile {
        self.options.profile
    }

    fn parameters(&self) -> Vec<ParameterSpec> {
        vec![
            ParameterSpec::int(PARAM_SERVICE_PRIORITY, 0, combinators::max_int),
            ParameterSpec::bool(PARAM_NEAR_MODE, false, combinators::any),
            ParameterSpec::float(PARAM_EXPOSURE_COMPENSATION, 0.0, combinators::max_float),
        ]
    }

    fn open(&mut self) -> BackendResult<()> {
        self.probe.open_calls.fetch_add(1, Ordering::SeqCst);
        if self.probe.fail_open.load(Ordering::SeqCst) {
            return Err(BackendError::OpenFailed(format!(
                "{} is not responding",
                self.options.name
            )));
        }
        self.started = Some(Instant::now());
        self.probe.is_open.store(true, Ordering::SeqCst);
        info!(device = %self.options.name, "Synthetic device opened");
        Ok(())
    }

    fn reconfigure(&mut self, config: &StreamConfiguration) -> BackendResult<()> {
        self.probe.reconfigure_calls.fetch_add(1, Ordering::SeqCst);
        if consume(&self.probe.fail_reconfigures) {
            return Err(BackendError::ConfigurationRejected(
                "injected failure".to_string(),
            ));
        }
        if config.contains(StreamKind::BodyIndex) && self.options.profile.body_in_depth() {
            return Err(BackendError::ConfigurationRejected(
                "body index is carried by the depth stream".to_string(),
            ));
        }

        self.last_tick.retain(|kind, _| config.contains(*kind));
        self.config = config.clone();
        self.probe
            .configurations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(config.clone());
        debug!(device = %self.options.name, config = %config, "Synthetic streams configured");
        Ok(())
    }

    fn poll_stream(&mut self, kind: StreamKind) -> BackendResult<Option<StreamSample>> {
        if consume(&self.probe.fail_polls) {
            return Err(BackendError::StreamFailed("injected failure".to_string()));
        }
        let Some(started) = self.started else {
            return Err(BackendError::Disconnected);
        };
        let Some(request) = self.config.streams.iter().find(|s| s.kind == kind) else {
            return Ok(None);
        };

        let lag = self.probe.lag(kind).as_nanos() as u64;
        let elapsed = started.elapsed().as_nanos() as u64;
        if elapsed < lag {
            return Ok(None);
        }
        let period = self.period_ns();
        let tick = (elapsed - lag) / period;
        if self.last_tick.get(&kind) == Some(&tick) {
            return Ok(None);
        }
        self.last_tick.insert(kind, tick);

        Ok(Some(pattern::sample(
            kind,
            request.mode,
            tick,
            (tick + 1) * period,
            self.options.row_padding,
            self.options.profile.depth_encoding,
        )))
    }

    fn coordinate_table(
        &mut self,
        depth: &DepthPlane,
        color_width: u32,
        color_height: u32,
    ) -> BackendResult<MappingPlane> {
        if depth.width == 0 || depth.height == 0 {
            return Err(BackendError::InvalidSample("empty depth plane".to_string()));
        }
        let color = StreamMode::new(color_width, color_height);
        let mut data = Vec::with_capacity((color_width * color_height) as usize);
        for y in 0..color_height {
            for x in 0..color_width {
                data.push(self.depth_coordinate(x, y, depth, color));
            }
        }
        Ok(FramePlane::new(color_width, color_height, data))
    }

    fn project_to_color(
        &mut self,
        depth: &DepthPlane,
        body_index: Option<&BodyIndexPlane>,
        color_width: u32,
        color_height: u32,
    ) -> BackendResult<Option<ProjectedPlanes>> {
        if !self.options.hardware_projection {
            return Ok(None);
        }

        let table = self.coordinate_table(depth, color_width, color_height)?;
        let lookup = |c: &DepthCoordinate| c.to_index(depth.width, depth.height);
        let mapped_depth = table
            .data
            .iter()
            .map(|c| lookup(c).and_then(|i| depth.data.get(i).copied()).unwrap_or(INVALID_DEPTH))
            .collect();
        let mapped_body = body_index.map(|body| {
            let data = table
                .data
                .iter()
                .map(|c| lookup(c).and_then(|i| body.data.get(i).copied()).unwrap_or(BODY_INDEX_NONE))
                .collect();
            FramePlane::new(color_width, color_height, data)
        });

        Ok(Some(ProjectedPlanes {
            depth: Some(FramePlane::new(color_width, color_height, mapped_depth)),
            body_index: mapped_body,
        }))
    }

    fn push_parameter(&mut self, name: &str, value: &ParameterValue) -> BackendResult<()> {
        self.probe
            .pushes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((name.to_string(), *value));
        if self.probe.fail_pushes.load(Ordering::SeqCst) {
            return Err(BackendError::Other(format!("{} rejected", name)));
        }

        match (name, value) {
            (PARAM_SERVICE_PRIORITY, ParameterValue::Int(level)) => self
                .options
                .priority
                .apply(ServicePriority::from_level(*level))
                .map_err(BackendError::Other),
            (PARAM_NEAR_MODE, ParameterValue::Bool(_))
            | (PARAM_EXPOSURE_COMPENSATION, ParameterValue::Float(_)) => Ok(()),
            _ => Err(BackendError::UnknownParameter(name.to_string())),
        }
    }

    fn close(&mut self) {
        self.probe.close_calls.fetch_add(1, Ordering::SeqCst);
        self.probe.is_open.store(false, Ordering::SeqCst);
        self.started = None;
        self.config = StreamConfiguration::default();
        self.last_tick.clear();
        info!(device = %self.options.name, "Synthetic device closed");
    }
}

/// Provider announcing a fixed set of synthetic devices
pub struct SyntheticProvider {
    devices: Vec<SyntheticOptions>,
}

impl SyntheticProvider {
    pub fn new(devices: Vec<SyntheticOptions>) -> Self {
        Self { devices }
    }

    /// One device of each sensor generation
    pub fn standard() -> Self {
        Self::new(vec![
            SyntheticOptions::kinect_v1("synthetic-kinect-v1"),
            SyntheticOptions::kinect_v2("synthetic-kinect-v2"),
        ])
    }
}

impl DeviceProvider for SyntheticProvider {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn enumerate(&self) -> Vec<Box<dyn DeviceBackend>> {
        self.devices
            .iter()
            .cloned()
            .map(|options| Box::new(SyntheticBackend::new(options)) as Box<dyn DeviceBackend>)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn opened(options: SyntheticOptions, sources: SourceFlags) -> SyntheticBackend {
        let mut backend = SyntheticBackend::new(options);
        let profile = backend.profile();
        backend.open().unwrap();
        backend
            .reconfigure(&StreamConfiguration::for_sources(sources, &profile))
            .unwrap();
        backend
    }

    fn poll_until(backend: &mut SyntheticBackend, kind: StreamKind) -> StreamSample {
        loop {
            if let Some(sample) = backend.poll_stream(kind).unwrap() {
                return sample;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_one_sample_per_tick() {
        let mut backend = opened(SyntheticOptions::small("t"), SourceFlags::DEPTH);
        let first = poll_until(&mut backend, StreamKind::Depth);
        let second = poll_until(&mut backend, StreamKind::Depth);
        assert!(second.timestamp_ns > first.timestamp_ns);
        assert_eq!(second.timestamp_ns % backend.period_ns(), 0);

        // Streams that are not configured never deliver
        assert!(backend.poll_stream(StreamKind::Color).unwrap().is_none());
    }

    #[test]
    fn test_polling_closed_device_fails() {
        let mut backend = SyntheticBackend::new(SyntheticOptions::small("t"));
        assert_eq!(
            backend.poll_stream(StreamKind::Depth).unwrap_err(),
            BackendError::Disconnected
        );
    }

    #[test]
    fn test_packed_device_rejects_body_stream() {
        let mut backend = SyntheticBackend::new(SyntheticOptions::kinect_v1("v1"));
        backend.open().unwrap();
        let config = StreamConfiguration {
            streams: vec![crate::backends::device::StreamRequest {
                kind: StreamKind::BodyIndex,
                mode: StreamMode::new(320, 240),
                framerate: Framerate::from_int(30),
            }],
        };
        assert!(matches!(
            backend.reconfigure(&config),
            Err(BackendError::ConfigurationRejected(_))
        ));
    }

    #[test]
    fn test_coordinate_table_marks_edge_invalid() {
        let mut options = SyntheticOptions::small("t");
        options.invalid_columns = 2;
        let mut backend = SyntheticBackend::new(options);
        let depth = FramePlane::new(4, 3, vec![1000u16; 12]);

        let table = backend.coordinate_table(&depth, 8, 6).unwrap();
        assert_eq!(table.get(2, 1), Some(&DepthCoordinate::new(1.0, 0.0)));
        assert_eq!(table.get(6, 0), Some(&DepthCoordinate::INVALID));

        backend.probe().set_invalid_mapping(true);
        let table = backend.coordinate_table(&depth, 8, 6).unwrap();
        assert!(table.data.iter().all(|c| *c == DepthCoordinate::INVALID));
    }

    #[test]
    fn test_hardware_projection() {
        let mut options = SyntheticOptions::small("t");
        options.hardware_projection = true;
        options.invalid_columns = 1;
        let mut backend = SyntheticBackend::new(options);
        let depth = FramePlane::new(4, 3, (0..12).collect::<Vec<u16>>());

        let projected = backend.project_to_color(&depth, None, 8, 6).unwrap().unwrap();
        let mapped = projected.depth.unwrap();
        assert_eq!(mapped.get(2, 2), Some(&5));
        assert_eq!(mapped.get(7, 0), Some(&INVALID_DEPTH));
        assert!(projected.body_index.is_none());
    }

    #[test]
    fn test_priority_parameter_drives_shared_state() {
        let mut options = SyntheticOptions::small("t");
        let state = ServicePriorityState::new(Box::new(
            crate::backends::device::priority::LoggingPriorityHook,
        ));
        options.priority = Arc::clone(&state);

        let mut backend = SyntheticBackend::new(options);
        assert_eq!(state.device_count(), 1);
        backend
            .push_parameter(PARAM_SERVICE_PRIORITY, &ParameterValue::Int(2))
            .unwrap();
        assert_eq!(state.applied(), ServicePriority::High);

        drop(backend);
        assert_eq!(state.device_count(), 0);
        assert_eq!(state.applied(), ServicePriority::Normal);
    }

    #[test]
    fn test_unknown_parameter_is_rejected() {
        let mut backend = SyntheticBackend::new(SyntheticOptions::small("t"));
        assert_eq!(
            backend.push_parameter("gain", &ParameterValue::Int(1)),
            Err(BackendError::UnknownParameter("gain".to_string()))
        );
        assert_eq!(backend.probe().pushes().len(), 1);
    }
}
