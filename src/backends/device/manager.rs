// SPDX-License-Identifier: GPL-3.0-only

//! Device resource manager
//!
//! Owns one device: the outstanding leases, the aggregate request built
//! from them and the capture worker, which runs exactly while at least one
//! lease exists.
//!
//! Lock order is session, then hardware, then aggregate. The capture worker
//! never takes the session lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::access::{Access, LeaseId};
use super::capture::{AggregateState, CaptureShared, CaptureWorker, WorkerState, push_parameters};
use super::parameters::{ParameterSpec, ParameterTable, ParameterValue};
use super::types::{DeviceProfile, Frame, SourceFlags};
use super::{DeviceBackend, lock};
use crate::config::CaptureSettings;
use crate::errors::{DeviceError, DeviceResult};

/// What one lease asked for
#[derive(Debug, Clone)]
struct LeaseRecord {
    sources: SourceFlags,
    parameters: HashMap<String, ParameterValue>,
}

/// Outstanding leases keyed by stable id
#[derive(Debug, Default)]
struct LeaseTable {
    records: BTreeMap<LeaseId, LeaseRecord>,
    next_id: u64,
}

impl LeaseTable {
    fn insert(&mut self, record: LeaseRecord) -> LeaseId {
        self.next_id += 1;
        let id = LeaseId(self.next_id);
        self.records.insert(id, record);
        id
    }

    fn remove(&mut self, id: LeaseId) -> Option<LeaseRecord> {
        self.records.remove(&id)
    }

    fn get_mut(&mut self, id: LeaseId) -> DeviceResult<&mut LeaseRecord> {
        self.records.get_mut(&id).ok_or(DeviceError::DeviceGone)
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// OR of every lease's sources
    fn sources(&self) -> SourceFlags {
        self.records
            .values()
            .fold(SourceFlags::NONE, |acc, record| acc | record.sources)
    }
}

struct DeviceSession {
    leases: LeaseTable,
    worker: Option<CaptureWorker>,
}

/// Capability set written once at construction
#[derive(Debug, Default)]
struct SupportedSources(OnceLock<SourceFlags>);

impl SupportedSources {
    fn get(&self) -> SourceFlags {
        self.0.get().copied().unwrap_or(SourceFlags::NONE)
    }

    fn set(&self, flags: SourceFlags) -> DeviceResult<()> {
        self.0
            .set(flags)
            .map_err(|_| DeviceError::SupportedSourcesAlreadySet)
    }
}

/// State behind every [`DeviceManager`] handle of one device
pub(crate) struct DeviceShared {
    name: String,
    supported: SupportedSources,
    session: Mutex<DeviceSession>,
    capture: Arc<CaptureShared>,
}

impl DeviceShared {
    /// Recompute the aggregate from the current leases.
    ///
    /// With a running worker, changed parameters are pushed right away under
    /// the hardware lock so they never race the worker's own hardware use.
    fn reaggregate(&self, session: &DeviceSession) {
        let sources = session.leases.sources();
        let leases = session.leases.records.values().map(|r| &r.parameters);

        if session.worker.is_none() {
            let mut aggregate = lock(&self.capture.aggregate);
            self.update_aggregate(&mut aggregate, sources, leases);
            return;
        }

        let mut hardware = lock(&self.capture.hardware);
        let changes = {
            let mut aggregate = lock(&self.capture.aggregate);
            self.update_aggregate(&mut aggregate, sources, leases);
            aggregate.parameters.take_pending()
        };
        push_parameters(&mut **hardware, &self.name, &changes);
    }

    fn update_aggregate<'a, I>(&self, aggregate: &mut AggregateState, sources: SourceFlags, leases: I)
    where
        I: IntoIterator<Item = &'a HashMap<String, ParameterValue>>,
        I::IntoIter: Clone,
    {
        if aggregate.sources != sources {
            debug!(device = %self.name, from = %aggregate.sources, to = %sources, "Aggregate sources changed");
            aggregate.sources = sources;
            aggregate.pending = true;
        }
        aggregate.parameters.resolve(leases);
    }

    fn check_supported(&self, requested: SourceFlags) -> DeviceResult<()> {
        let unsupported = requested.difference(self.supported.get());
        if unsupported.is_empty() {
            Ok(())
        } else {
            Err(DeviceError::UnsupportedSources(unsupported))
        }
    }

    fn acquire(self: &Arc<Self>, requested: SourceFlags) -> DeviceResult<Access> {
        self.check_supported(requested)?;

        let mut session = lock(&self.session);
        let parameters = lock(&self.capture.aggregate).parameters.defaults();
        let id = session.leases.insert(LeaseRecord {
            sources: requested,
            parameters,
        });
        self.reaggregate(&session);

        let worker_alive = session.worker.as_ref().is_some_and(CaptureWorker::is_running);
        if !worker_alive {
            if let Some(stale) = session.worker.take() {
                warn!(device = %self.name, "Capture worker exited unexpectedly, restarting");
                stale.stop();
            }
            match CaptureWorker::start(&self.capture) {
                Ok(worker) => session.worker = Some(worker),
                Err(e) => {
                    warn!(device = %self.name, error = %e, "Failed to start capture");
                    session.leases.remove(id);
                    self.reaggregate(&session);
                    return Err(e);
                }
            }
        }

        info!(
            device = %self.name,
            lease = %id,
            sources = %requested,
            leases = session.leases.len(),
            "Access acquired"
        );
        Ok(Access::new(id, requested, Arc::downgrade(self)))
    }

    /// Drop a lease, stopping capture when it was the last one
    pub(crate) fn release(&self, id: LeaseId) {
        let mut session = lock(&self.session);
        if session.leases.remove(id).is_none() {
            return;
        }
        self.reaggregate(&session);
        info!(device = %self.name, lease = %id, leases = session.leases.len(), "Access released");

        if session.leases.is_empty() {
            if let Some(worker) = session.worker.take() {
                worker.stop();
            }
        }
    }

    pub(crate) fn set_lease_sources(&self, id: LeaseId, sources: SourceFlags) -> DeviceResult<()> {
        self.check_supported(sources)?;
        let mut session = lock(&self.session);
        session.leases.get_mut(id)?.sources = sources;
        self.reaggregate(&session);
        Ok(())
    }

    pub(crate) fn update_parameters(
        &self,
        id: LeaseId,
        values: &[(&str, ParameterValue)],
    ) -> DeviceResult<()> {
        {
            let aggregate = lock(&self.capture.aggregate);
            for (name, value) in values {
                aggregate.parameters.validate(name, value)?;
            }
        }

        let mut session = lock(&self.session);
        let record = session.leases.get_mut(id)?;
        for (name, value) in values {
            record.parameters.insert(name.to_string(), *value);
        }
        self.reaggregate(&session);
        Ok(())
    }

    pub(crate) fn last_frame(&self) -> Option<Arc<Frame>> {
        self.capture.last_frame()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<Arc<Frame>>> {
        self.capture.subscribe()
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        let session = self
            .session
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(worker) = session.worker.take() {
            debug!(device = %self.name, "Device dropped with active capture, stopping");
            worker.stop();
        }
    }
}

/// Shared handle to one device
///
/// Cloning yields another handle to the same device.
#[derive(Clone)]
pub struct DeviceManager {
    shared: Arc<DeviceShared>,
}

impl DeviceManager {
    /// Wrap a backend, registering its parameters and capabilities
    pub fn new(backend: Box<dyn DeviceBackend>, settings: CaptureSettings) -> DeviceResult<Self> {
        let mut parameters = ParameterTable::new();
        for spec in backend.parameters() {
            parameters.register(spec)?;
        }
        let supported_sources = backend.supported_sources();

        let capture = Arc::new(CaptureShared::new(backend, parameters, settings));
        let shared = DeviceShared {
            name: capture.name.clone(),
            supported: SupportedSources::default(),
            session: Mutex::new(DeviceSession {
                leases: LeaseTable::default(),
                worker: None,
            }),
            capture,
        };
        shared.supported.set(supported_sources)?;

        info!(device = %shared.name, supported = %supported_sources, "Device registered");
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    pub(crate) fn from_shared(shared: Arc<DeviceShared>) -> Self {
        Self { shared }
    }

    /// Stable identity of the device
    pub fn unique_name(&self) -> &str {
        &self.shared.name
    }

    pub fn profile(&self) -> DeviceProfile {
        self.shared.capture.profile
    }

    /// Sources this device can serve
    pub fn supported_sources(&self) -> SourceFlags {
        self.shared.supported.get()
    }

    /// Capabilities are fixed at construction, so this always fails
    /// once the manager exists.
    pub fn set_supported_sources(&self, flags: SourceFlags) -> DeviceResult<()> {
        self.shared.supported.set(flags)
    }

    /// Register a consumer.
    ///
    /// The first lease starts the capture worker and waits until the
    /// hardware is open; a failure there is returned as
    /// [`DeviceError::Init`] and the device stays idle.
    pub fn acquire_access(&self, requested: SourceFlags) -> DeviceResult<Access> {
        self.shared.acquire(requested)
    }

    /// Overwrite the preferences of `access` and push what changed
    pub fn update_device_parameters(
        &self,
        access: &Access,
        values: &[(&str, ParameterValue)],
    ) -> DeviceResult<()> {
        if !access.device().is_some_and(|d| Arc::ptr_eq(&d.shared, &self.shared)) {
            return Err(DeviceError::DeviceGone);
        }
        self.shared.update_parameters(access.id(), values)
    }

    /// Most recently published frame, never blocks on capture
    pub fn last_frame(&self) -> Option<Arc<Frame>> {
        self.shared.last_frame()
    }

    /// Watch published frames; only the latest one is kept
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Frame>>> {
        self.shared.subscribe()
    }

    pub fn capture_state(&self) -> WorkerState {
        self.shared.capture.state()
    }

    pub fn lease_count(&self) -> usize {
        lock(&self.shared.session).leases.len()
    }

    /// Sources currently requested by all leases together
    pub fn enabled_sources(&self) -> SourceFlags {
        lock(&self.shared.capture.aggregate).sources
    }

    /// Resolved value of a parameter
    pub fn effective_parameter(&self, name: &str) -> Option<ParameterValue> {
        lock(&self.shared.capture.aggregate)
            .parameters
            .effective(name)
    }

    /// Parameters registered by the backend
    pub fn parameters(&self) -> Vec<ParameterSpec> {
        lock(&self.shared.capture.aggregate)
            .parameters
            .specs()
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("name", &self.shared.name)
            .field("state", &self.capture_state())
            .finish()
    }
}
