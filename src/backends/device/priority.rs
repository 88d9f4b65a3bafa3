// SPDX-License-Identifier: GPL-3.0-only

//! Process-wide helper service priority
//!
//! Some sensor runtimes move frames through a helper service shared by every
//! device of that backend. Its scheduling priority is process-wide state:
//! devices register while they exist, a parameter push applies a level, and
//! the priority goes back to normal once the last device is gone.

use std::sync::{Arc, Mutex, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::lock;

/// Scheduling priority requested for the helper service
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ServicePriority {
    #[default]
    Normal,
    AboveNormal,
    High,
}

impl ServicePriority {
    /// Map an integer parameter level (0, 1, 2+) to a priority
    pub fn from_level(level: i64) -> Self {
        match level {
            i64::MIN..=0 => ServicePriority::Normal,
            1 => ServicePriority::AboveNormal,
            _ => ServicePriority::High,
        }
    }

    pub fn level(self) -> i64 {
        match self {
            ServicePriority::Normal => 0,
            ServicePriority::AboveNormal => 1,
            ServicePriority::High => 2,
        }
    }
}

impl std::fmt::Display for ServicePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServicePriority::Normal => write!(f, "normal"),
            ServicePriority::AboveNormal => write!(f, "above normal"),
            ServicePriority::High => write!(f, "high"),
        }
    }
}

/// Applies a priority to the helper service
pub trait PriorityHook: Send + Sync {
    fn apply(&self, priority: ServicePriority) -> Result<(), String>;
}

/// Hook that only records the requested priority in the log
pub struct LoggingPriorityHook;

impl PriorityHook for LoggingPriorityHook {
    fn apply(&self, priority: ServicePriority) -> Result<(), String> {
        info!(priority = %priority, "Helper service priority changed");
        Ok(())
    }
}

#[derive(Debug)]
struct PriorityInner {
    devices: usize,
    applied: ServicePriority,
}

/// Priority shared by every device of one backend
pub struct ServicePriorityState {
    hook: Box<dyn PriorityHook>,
    inner: Mutex<PriorityInner>,
}

/// Global state used by backends without their own hook
static GLOBAL_PRIORITY: OnceLock<Arc<ServicePriorityState>> = OnceLock::new();

impl ServicePriorityState {
    pub fn new(hook: Box<dyn PriorityHook>) -> Arc<Self> {
        Arc::new(Self {
            hook,
            inner: Mutex::new(PriorityInner {
                devices: 0,
                applied: ServicePriority::Normal,
            }),
        })
    }

    /// Process-wide state with the logging hook
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL_PRIORITY.get_or_init(|| Self::new(Box::new(LoggingPriorityHook))))
    }

    /// Count a device until the returned registration is dropped
    pub fn register(self: &Arc<Self>) -> PriorityRegistration {
        let mut inner = lock(&self.inner);
        inner.devices += 1;
        debug!(devices = inner.devices, "Device registered for service priority");
        PriorityRegistration {
            state: Arc::clone(self),
        }
    }

    /// Apply `priority` if it differs from the current one.
    ///
    /// A failing hook leaves the previous priority recorded.
    pub fn apply(&self, priority: ServicePriority) -> Result<(), String> {
        let mut inner = lock(&self.inner);
        if inner.applied == priority {
            return Ok(());
        }
        self.hook.apply(priority)?;
        inner.applied = priority;
        Ok(())
    }

    pub fn applied(&self) -> ServicePriority {
        lock(&self.inner).applied
    }

    pub fn device_count(&self) -> usize {
        lock(&self.inner).devices
    }

    fn unregister(&self) {
        let mut inner = lock(&self.inner);
        inner.devices = inner.devices.saturating_sub(1);
        debug!(devices = inner.devices, "Device unregistered from service priority");
        if inner.devices > 0 || inner.applied == ServicePriority::Normal {
            return;
        }
        match self.hook.apply(ServicePriority::Normal) {
            Ok(()) => inner.applied = ServicePriority::Normal,
            Err(e) => warn!(error = %e, "Failed to reset helper service priority"),
        }
    }
}

/// Keeps a device counted in a [`ServicePriorityState`]
pub struct PriorityRegistration {
    state: Arc<ServicePriorityState>,
}

impl PriorityRegistration {
    pub fn state(&self) -> &Arc<ServicePriorityState> {
        &self.state
    }
}

impl Drop for PriorityRegistration {
    fn drop(&mut self) {
        self.state.unregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingHook(Arc<Mutex<Vec<ServicePriority>>>);

    impl PriorityHook for RecordingHook {
        fn apply(&self, priority: ServicePriority) -> Result<(), String> {
            self.0.lock().unwrap().push(priority);
            Ok(())
        }
    }

    fn recording_state() -> (Arc<ServicePriorityState>, Arc<Mutex<Vec<ServicePriority>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let state = ServicePriorityState::new(Box::new(RecordingHook(Arc::clone(&calls))));
        (state, calls)
    }

    #[test]
    fn test_apply_is_idempotent() {
        let (state, calls) = recording_state();
        let _device = state.register();

        state.apply(ServicePriority::High).unwrap();
        state.apply(ServicePriority::High).unwrap();
        assert_eq!(*calls.lock().unwrap(), vec![ServicePriority::High]);
        assert_eq!(state.applied(), ServicePriority::High);
    }

    #[test]
    fn test_reset_when_last_device_drops() {
        let (state, calls) = recording_state();
        let first = state.register();
        let second = state.register();
        assert_eq!(state.device_count(), 2);

        state.apply(ServicePriority::AboveNormal).unwrap();
        drop(first);
        assert_eq!(state.applied(), ServicePriority::AboveNormal);

        drop(second);
        assert_eq!(state.device_count(), 0);
        assert_eq!(state.applied(), ServicePriority::Normal);
        assert_eq!(
            *calls.lock().unwrap(),
            vec![ServicePriority::AboveNormal, ServicePriority::Normal]
        );
    }

    #[test]
    fn test_no_reset_call_when_already_normal() {
        let (state, calls) = recording_state();
        drop(state.register());
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_levels() {
        assert_eq!(ServicePriority::from_level(-4), ServicePriority::Normal);
        assert_eq!(ServicePriority::from_level(1), ServicePriority::AboveNormal);
        assert_eq!(ServicePriority::from_level(9), ServicePriority::High);
        assert_eq!(ServicePriority::High.level(), 2);
    }
}
