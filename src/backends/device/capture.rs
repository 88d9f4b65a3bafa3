// SPDX-License-Identifier: GPL-3.0-only

//! Capture worker
//!
//! One background thread per active device. It owns the hardware session,
//! applies the latest aggregate source request, polls every stream, waits
//! until their timestamps line up and publishes an immutable [`Frame`].
//!
//! State shared with the manager lives in [`CaptureShared`]:
//! - the backend behind the hardware lock (held per iteration, never while
//!   sleeping)
//! - the aggregate request (sources, pending flag, parameter table)
//! - the last published frame behind its own narrow lock

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::watch;
use tracing::{Span, debug, info, info_span, warn};
use uuid::Uuid;

use super::frame_loop::{CaptureLoopController, LoopAction, StopSignal, pause};
use super::mapping::{TemporalProjector, split_player_index};
use super::parameters::{ParameterChange, ParameterTable};
use super::sync::FrameSynchronizer;
use super::types::*;
use super::{DeviceBackend, lock};
use crate::config::CaptureSettings;
use crate::constants::{BODY_INDEX_NONE, INVALID_DEPTH, MAX_CONSECUTIVE_PANICS};
use crate::errors::{DeviceError, DeviceResult};

/// Lifecycle of a device's capture worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// No hardware session, no loop
    Idle = 0,
    /// Opening hardware and negotiating the first configuration
    Starting = 1,
    /// Acquisition loop running
    Running = 2,
    /// Draining the current iteration before closing hardware
    Stopping = 3,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerState::Starting,
            2 => WorkerState::Running,
            3 => WorkerState::Stopping,
            _ => WorkerState::Idle,
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerState::Idle => "idle",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
        };
        write!(f, "{}", name)
    }
}

/// Aggregate request written by the manager and read by the worker
#[derive(Debug)]
pub(crate) struct AggregateState {
    /// OR of every lease's requested sources
    pub sources: SourceFlags,
    /// Set when `sources` changed and the worker has not picked it up yet
    pub pending: bool,
    pub parameters: ParameterTable,
}

/// State shared between a device manager and its capture worker
pub(crate) struct CaptureShared {
    pub name: String,
    pub profile: DeviceProfile,
    pub settings: CaptureSettings,
    pub hardware: Mutex<Box<dyn DeviceBackend>>,
    pub aggregate: Mutex<AggregateState>,
    last_frame: Mutex<Option<Arc<Frame>>>,
    frames: watch::Sender<Option<Arc<Frame>>>,
    frame_counter: AtomicU64,
    state: AtomicU8,
}

impl CaptureShared {
    pub fn new(
        backend: Box<dyn DeviceBackend>,
        parameters: ParameterTable,
        settings: CaptureSettings,
    ) -> Self {
        let (frames, _) = watch::channel(None);
        Self {
            name: backend.unique_name(),
            profile: backend.profile(),
            settings,
            hardware: Mutex::new(backend),
            aggregate: Mutex::new(AggregateState {
                sources: SourceFlags::NONE,
                pending: false,
                parameters,
            }),
            last_frame: Mutex::new(None),
            frames,
            frame_counter: AtomicU64::new(0),
            state: AtomicU8::new(WorkerState::Idle as u8),
        }
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: WorkerState) {
        debug!(device = %self.name, state = %state, "Capture state changed");
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Latest aggregate sources if they changed since the last call
    fn take_source_update(&self) -> Option<SourceFlags> {
        let mut aggregate = lock(&self.aggregate);
        if aggregate.pending {
            aggregate.pending = false;
            Some(aggregate.sources)
        } else {
            None
        }
    }

    /// Ask for the current aggregate to be applied again
    fn rearm_source_update(&self) {
        lock(&self.aggregate).pending = true;
    }

    /// Assign the next frame index and make `frame` the last frame
    fn publish(&self, mut frame: Frame) -> Arc<Frame> {
        frame.frame_index = self.frame_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let frame = Arc::new(frame);
        *lock(&self.last_frame) = Some(Arc::clone(&frame));
        self.frames.send_replace(Some(Arc::clone(&frame)));
        frame
    }

    pub fn clear_frame(&self) {
        *lock(&self.last_frame) = None;
        self.frames.send_replace(None);
    }

    pub fn last_frame(&self) -> Option<Arc<Frame>> {
        lock(&self.last_frame).clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Frame>>> {
        self.frames.subscribe()
    }
}

/// Push resolved parameter changes, logging failures.
///
/// The change is considered applied either way.
pub(crate) fn push_parameters(
    backend: &mut dyn DeviceBackend,
    device: &str,
    changes: &[ParameterChange],
) {
    for change in changes {
        match backend.push_parameter(&change.name, &change.value) {
            Ok(()) => {
                debug!(device = %device, parameter = %change.name, value = %change.value, "Parameter applied");
            }
            Err(e) => {
                let err = DeviceError::ParameterPush {
                    name: change.name.clone(),
                    message: e.to_string(),
                };
                warn!(device = %device, error = %err, "Keeping previous hardware value");
            }
        }
    }
}

/// Per-session state owned by the capture thread
struct CaptureSession {
    shared: Arc<CaptureShared>,
    stop: StopSignal,
    span: Span,
    /// Sources the current frames are composed for
    enabled: SourceFlags,
    /// Configuration the hardware is running
    applied: StreamConfiguration,
    samples: HashMap<StreamKind, StreamSample>,
    sync: FrameSynchronizer,
    depth_projector: TemporalProjector<u16>,
    body_projector: TemporalProjector<u8>,
    next_deadline: Option<Instant>,
    /// Iterations in a row that panicked
    panics: u32,
}

impl CaptureSession {
    /// Open the hardware and negotiate the first configuration
    fn open(shared: Arc<CaptureShared>, stop: StopSignal) -> DeviceResult<Self> {
        let session_id = Uuid::new_v4();
        let span = info_span!("capture", device = %shared.name, session = %session_id);
        let _enter = span.enter();

        let hold = shared.settings.mapping_hold_frames;
        let mut session = Self {
            stop,
            span: span.clone(),
            enabled: SourceFlags::NONE,
            applied: StreamConfiguration::default(),
            samples: HashMap::new(),
            sync: FrameSynchronizer::new(shared.profile.framerate.period()),
            depth_projector: TemporalProjector::new(hold),
            body_projector: TemporalProjector::new(hold),
            next_deadline: None,
            panics: 0,
            shared,
        };

        let mut hardware = lock(&session.shared.hardware);
        hardware
            .open()
            .map_err(|e| DeviceError::Init(e.to_string()))?;

        let sources = {
            let mut aggregate = lock(&session.shared.aggregate);
            aggregate.pending = false;
            aggregate.sources
        };

        let config = StreamConfiguration::for_sources(sources, &session.shared.profile);
        if !config.is_empty() {
            if let Err(e) = hardware.reconfigure(&config) {
                hardware.close();
                return Err(DeviceError::Init(e.to_string()));
            }
        }

        // Only marked applied once the session is certain to start
        let changes = lock(&session.shared.aggregate).parameters.take_pending();
        let sync_kinds: Vec<StreamKind> = config
            .kinds()
            .into_iter()
            .filter(|kind| hardware.requires_sync(*kind))
            .collect();

        push_parameters(&mut **hardware, &session.shared.name, &changes);
        drop(hardware);

        info!(sources = %sources, config = %config, "Hardware session opened");
        session.enabled = sources;
        session.sync.set_streams(&sync_kinds);
        session.applied = config;
        session.shared.set_state(WorkerState::Running);
        Ok(session)
    }

    /// Run one iteration, turning a panic into a per-iteration failure.
    ///
    /// Repeated panics end the session so the hardware gets closed.
    fn run_guarded(&mut self) -> LoopAction {
        match panic::catch_unwind(AssertUnwindSafe(|| self.run_iteration())) {
            Ok(action) => {
                self.panics = 0;
                action
            }
            Err(_) => {
                self.panics += 1;
                let _enter = self.span.enter();
                warn!(panics = self.panics, "Capture iteration panicked");
                self.samples.clear();
                self.sync.reset();
                self.next_deadline = None;
                if self.panics >= MAX_CONSECUTIVE_PANICS {
                    warn!("Giving up on the hardware session");
                    return LoopAction::Stop;
                }
                pause(&self.stop, self.shared.settings.error_backoff);
                LoopAction::Continue
            }
        }
    }

    /// One pass of the acquisition loop
    fn run_iteration(&mut self) -> LoopAction {
        let span = self.span.clone();
        let _enter = span.enter();
        let settings = self.shared.settings;

        if let Some(sources) = self.shared.take_source_update() {
            if let Err(e) = self.apply_sources(sources) {
                warn!(error = %e, "Retrying stream reconfiguration");
                self.shared.rearm_source_update();
                pause(&self.stop, settings.reconfigure_backoff);
                return LoopAction::Continue;
            }
        }

        if self.applied.is_empty() {
            self.next_deadline = None;
            pause(&self.stop, settings.idle_sleep);
            return LoopAction::Continue;
        }

        match self.acquire() {
            Ok(Some(frame)) => {
                let frame = self.shared.publish(frame);
                self.sync.reset();
                debug!(
                    frame_index = frame.frame_index,
                    timestamp_ns = frame.timestamp_ns,
                    "Frame published"
                );
                self.wait_for_next_tick();
            }
            Ok(None) => {
                pause(&self.stop, settings.poll_interval);
            }
            Err(e) => {
                warn!(error = %e, backoff_ms = settings.error_backoff.as_millis() as u64, "Capture iteration failed");
                self.next_deadline = None;
                pause(&self.stop, settings.error_backoff);
            }
        }

        LoopAction::Continue
    }

    /// Reconfigure the hardware for `sources` unless nothing would change
    fn apply_sources(&mut self, sources: SourceFlags) -> DeviceResult<()> {
        let config = StreamConfiguration::for_sources(sources, &self.shared.profile);
        if config == self.applied {
            debug!(sources = %sources, "Stream configuration unchanged");
            self.enabled = sources;
            return Ok(());
        }

        let sync_kinds: Vec<StreamKind> = {
            let mut hardware = lock(&self.shared.hardware);
            hardware
                .reconfigure(&config)
                .map_err(|e| DeviceError::Reconfiguration(e.to_string()))?;
            config
                .kinds()
                .into_iter()
                .filter(|kind| hardware.requires_sync(*kind))
                .collect()
        };

        info!(sources = %sources, config = %config, "Streams reconfigured");
        self.samples.retain(|kind, _| config.contains(*kind));
        self.sync.set_streams(&sync_kinds);
        self.enabled = sources;
        self.applied = config;
        self.next_deadline = None;
        Ok(())
    }

    /// Poll every stream and compose a frame once they line up
    fn acquire(&mut self) -> DeviceResult<Option<Frame>> {
        let shared = Arc::clone(&self.shared);
        let mut hardware = lock(&shared.hardware);

        for kind in self.applied.kinds() {
            let polled = hardware
                .poll_stream(kind)
                .map_err(|e| DeviceError::Acquisition(format!("{} stream: {}", kind, e)))?;
            if let Some(sample) = polled {
                if sample.timestamp_ns != 0 {
                    self.sync.record(kind, sample.timestamp_ns);
                }
                self.samples.insert(kind, sample);
            }
        }

        let complete = self.applied.kinds().iter().all(|k| self.samples.contains_key(k));
        if !complete || !self.sync.is_coherent() {
            return Ok(None);
        }

        self.compose(&mut **hardware).map(Some)
    }

    fn sample(&self, kind: StreamKind) -> DeviceResult<&StreamSample> {
        self.samples
            .get(&kind)
            .ok_or_else(|| DeviceError::Acquisition(format!("no {} sample", kind)))
    }

    /// Build the frame planes the enabled sources ask for
    fn compose(&mut self, hardware: &mut dyn DeviceBackend) -> DeviceResult<Frame> {
        let enabled = self.enabled;
        let profile = self.shared.profile;
        let invalid = |e: BackendError| DeviceError::Acquisition(e.to_string());

        let timestamp = match self.sync.reference() {
            0 => self.samples.values().map(|s| s.timestamp_ns).max().unwrap_or(0),
            ts => ts,
        };
        let mut frame = Frame::new(timestamp);

        if enabled.contains(SourceFlags::COLOR) {
            frame.color = Some(self.sample(StreamKind::Color)?.to_rgba_plane().map_err(invalid)?);
        }
        if enabled.contains(SourceFlags::INFRARED) {
            frame.infrared = Some(
                self.sample(StreamKind::Infrared)?
                    .to_u16_plane()
                    .map_err(invalid)?,
            );
        }
        if enabled.contains(SourceFlags::BACKGROUND_REMOVAL) {
            frame.background_removal = Some(
                self.sample(StreamKind::BackgroundRemoval)?
                    .to_u8_plane()
                    .map_err(invalid)?,
            );
        }

        let needs_depth = enabled.intersects(SourceFlags::DEPTH | SourceFlags::MAPPED);
        let needs_body = enabled.intersects(SourceFlags::BODY | SourceFlags::COLOR_MAPPED_BODY);

        let (depth, body) = if profile.body_in_depth() {
            if needs_depth || needs_body {
                let packed = self.sample(StreamKind::Depth)?.to_u16_plane().map_err(invalid)?;
                let (depth, body) = split_player_index(&packed);
                (Some(depth), needs_body.then_some(body))
            } else {
                (None, None)
            }
        } else {
            let mut depth = None;
            if needs_depth {
                depth = Some(self.sample(StreamKind::Depth)?.to_u16_plane().map_err(invalid)?);
            }
            let mut body = None;
            if needs_body {
                body = Some(self.sample(StreamKind::BodyIndex)?.to_u8_plane().map_err(invalid)?);
            }
            (depth, body)
        };

        if enabled.intersects(SourceFlags::MAPPED) {
            let depth = depth
                .as_ref()
                .ok_or_else(|| DeviceError::Acquisition("mapping needs depth".to_string()))?;
            self.map_to_color(hardware, &mut frame, depth, body.as_ref())?;
        }

        if enabled.contains(SourceFlags::DEPTH) {
            frame.depth = depth;
        }
        if enabled.contains(SourceFlags::BODY) {
            frame.body_index = body;
        }

        Ok(frame)
    }

    /// Fill the color-resolution planes, preferring hardware projection
    fn map_to_color(
        &mut self,
        hardware: &mut dyn DeviceBackend,
        frame: &mut Frame,
        depth: &DepthPlane,
        body: Option<&BodyIndexPlane>,
    ) -> DeviceResult<()> {
        let enabled = self.enabled;
        let color = self.shared.profile.color;
        let failed = |e: BackendError| DeviceError::Acquisition(e.to_string());

        let wants_depth = enabled.contains(SourceFlags::COLOR_MAPPED_DEPTH);
        let wants_body = enabled.contains(SourceFlags::COLOR_MAPPED_BODY);

        if wants_depth || wants_body {
            let mapped_body = if wants_body { body } else { None };
            if let Some(projected) = hardware
                .project_to_color(depth, mapped_body, color.width, color.height)
                .map_err(failed)?
            {
                if wants_depth {
                    frame.color_mapped_depth = projected.depth;
                }
                if wants_body {
                    frame.color_mapped_body = projected.body_index;
                }
            }
        }

        let software_depth = wants_depth && frame.color_mapped_depth.is_none();
        let software_body = wants_body && frame.color_mapped_body.is_none();
        let wants_table = enabled.contains(SourceFlags::COLOR_TO_DEPTH_MAPPING);
        if !(software_depth || software_body || wants_table) {
            return Ok(());
        }

        let table = hardware
            .coordinate_table(depth, color.width, color.height)
            .map_err(failed)?;
        if (table.width, table.height) != (color.width, color.height)
            || table.data.len() != table.pixel_count()
        {
            return Err(DeviceError::Acquisition(format!(
                "coordinate table has {} entries for {}x{}, expected {}x{}",
                table.data.len(),
                table.width,
                table.height,
                color.width,
                color.height
            )));
        }

        if software_depth {
            frame.color_mapped_depth =
                Some(self.depth_projector.project(&table, depth, INVALID_DEPTH));
        }
        if software_body {
            let body = body
                .ok_or_else(|| DeviceError::Acquisition("mapping needs body index".to_string()))?;
            frame.color_mapped_body =
                Some(self.body_projector.project(&table, body, BODY_INDEX_NONE));
        }
        if wants_table {
            frame.color_to_depth = Some(table);
        }
        Ok(())
    }

    /// Sleep until the next frame deadline.
    ///
    /// Deadlines accumulate by whole periods; a deadline more than one
    /// period in the past is re-anchored to now.
    fn wait_for_next_tick(&mut self) {
        let period = self.shared.profile.framerate.period();
        let now = Instant::now();
        let deadline = match self.next_deadline {
            Some(previous) if previous + period * 2 >= now => previous + period,
            _ => now + period,
        };
        self.next_deadline = Some(deadline);
        if deadline > now {
            pause(&self.stop, deadline - now);
        }
    }

    /// Release the hardware session
    fn close(self) {
        let _enter = self.span.enter();
        release_hardware(&self.shared);
        // Still Running means the loop gave up on its own
        if self.shared.state() == WorkerState::Running {
            self.shared.set_state(WorkerState::Idle);
        }
        info!("Hardware session closed");
    }
}

/// Close the backend and drop everything tied to its session
fn release_hardware(shared: &CaptureShared) {
    lock(&shared.hardware).close();
    shared.clear_frame();
    lock(&shared.aggregate).parameters.forget_applied();
}

/// Running capture thread of one device
pub(crate) struct CaptureWorker {
    controller: CaptureLoopController,
    shared: Arc<CaptureShared>,
}

impl CaptureWorker {
    /// Start the worker and wait until the hardware is up.
    ///
    /// Fails with [`DeviceError::Init`] and leaves the device idle when the
    /// hardware cannot be opened.
    pub fn start(shared: &Arc<CaptureShared>) -> DeviceResult<Self> {
        shared.set_state(WorkerState::Starting);

        let init_shared = Arc::clone(shared);
        let result = CaptureLoopController::start_with_init(
            &format!("capture-{}", shared.name),
            move |stop| CaptureSession::open(init_shared, stop),
            |session: &mut CaptureSession| session.run_guarded(),
            CaptureSession::close,
        );

        match result {
            Ok(controller) => Ok(Self {
                controller,
                shared: Arc::clone(shared),
            }),
            Err(e) => {
                shared.set_state(WorkerState::Idle);
                Err(e)
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.controller.is_running()
    }

    /// Stop the loop, close the hardware and clear the last frame
    pub fn stop(mut self) {
        self.shared.set_state(WorkerState::Stopping);
        if !self.controller.stop() {
            // The thread died without running its cleanup
            warn!(device = %self.shared.name, "Closing hardware after capture thread panic");
            release_hardware(&self.shared);
        }
        self.shared.clear_frame();
        self.shared.set_state(WorkerState::Idle);
    }
}
