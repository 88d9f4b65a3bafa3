// SPDX-License-Identifier: GPL-3.0-only
//! Thread lifecycle management for capture loops
//!
//! A capture loop runs on its own named thread. Initialization happens on
//! that thread too, and its outcome is handed back to the starting caller
//! before `start_with_init` returns, so a failed hardware open surfaces
//! synchronously while steady-state errors stay inside the loop.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::constants::STOP_CHECK_INTERVAL;

/// What the loop body wants next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    Continue,
    /// Leave the loop and run cleanup
    Stop,
}

/// Stop signal shared between a controller and its loop
pub type StopSignal = Arc<AtomicBool>;

/// Sleep for `duration`, waking early once `stop` is raised.
///
/// Returns false if the sleep was cut short by the stop signal.
pub fn pause(stop: &AtomicBool, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    while !stop.load(Ordering::SeqCst) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        thread::sleep(remaining.min(STOP_CHECK_INTERVAL));
    }
    false
}

/// Body of the loop thread once initialization succeeded
fn drive<S>(
    name: &str,
    stop: &AtomicBool,
    mut state: S,
    mut step: impl FnMut(&mut S) -> LoopAction,
    cleanup: impl FnOnce(S),
) {
    let mut iterations: u64 = 0;
    while !stop.load(Ordering::SeqCst) {
        iterations += 1;
        if step(&mut state) == LoopAction::Stop {
            debug!(thread = %name, iterations, "Loop body asked to stop");
            break;
        }
    }
    cleanup(state);
    info!(thread = %name, iterations, "Capture thread finished");
}

/// Owns one capture thread; dropping it stops and joins the thread
pub struct CaptureLoopController {
    handle: Option<JoinHandle<()>>,
    stop: StopSignal,
    name: String,
}

impl CaptureLoopController {
    /// Start a capture loop and wait for its initialization.
    ///
    /// `init_fn` runs on the new thread and receives the stop signal.
    /// If it fails, the thread exits, `cleanup_fn` is not called and the
    /// error is returned here. Otherwise `loop_fn` runs until it returns
    /// [`LoopAction::Stop`] or the controller is stopped, after which
    /// `cleanup_fn` consumes the state on the loop thread.
    ///
    /// Spawn failures and a panicking `init_fn` surface as `io::Error`.
    pub fn start_with_init<S, E, I, F, C>(
        name: &str,
        init_fn: I,
        loop_fn: F,
        cleanup_fn: C,
    ) -> Result<Self, E>
    where
        S: 'static,
        E: From<io::Error> + Send + 'static,
        I: FnOnce(StopSignal) -> Result<S, E> + Send + 'static,
        F: FnMut(&mut S) -> LoopAction + Send + 'static,
        C: FnOnce(S) + Send + 'static,
    {
        let stop: StopSignal = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), E>>(1);

        let thread_stop = Arc::clone(&stop);
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || match init_fn(Arc::clone(&thread_stop)) {
                Ok(state) => {
                    let _ = ready_tx.send(Ok(()));
                    drive(&thread_name, &thread_stop, state, loop_fn, cleanup_fn);
                }
                Err(e) => {
                    warn!(thread = %thread_name, "Capture thread failed to initialize");
                    let _ = ready_tx.send(Err(e));
                }
            })?;
        info!(thread = %name, "Capture thread spawned");

        let mut controller = Self {
            handle: Some(handle),
            stop,
            name: name.to_string(),
        };

        // A closed channel means init_fn panicked before reporting
        let outcome = ready_rx.recv().unwrap_or_else(|_| {
            Err(io::Error::other(format!(
                "capture thread '{}' died during initialization",
                controller.name
            ))
            .into())
        });
        if outcome.is_err() {
            controller.join();
        }
        outcome.map(|()| controller)
    }

    /// Whether the thread is still alive
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Raise the stop signal without waiting
    fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Raise the stop signal and join, false if the thread panicked
    pub fn stop(&mut self) -> bool {
        debug!(thread = %self.name, "Stopping capture thread");
        self.request_stop();
        self.join()
    }

    /// Join the thread if it has not been joined yet.
    ///
    /// Returns false if the thread panicked.
    pub fn join(&mut self) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        let clean = handle.join().is_ok();
        if !clean {
            warn!(thread = %self.name, "Capture thread panicked");
        }
        clean
    }
}

impl Drop for CaptureLoopController {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_loop_stops_itself() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let mut controller = CaptureLoopController::start_with_init(
            "test-loop",
            |_| Ok::<_, io::Error>(()),
            move |_| {
                let count = counter_clone.fetch_add(1, Ordering::SeqCst);
                if count >= 10 {
                    LoopAction::Stop
                } else {
                    LoopAction::Continue
                }
            },
            |_| {},
        )
        .unwrap();

        controller.join();
        assert_eq!(counter.load(Ordering::SeqCst), 11); // 0-10 inclusive
    }

    #[test]
    fn test_stop_signal_runs_cleanup() {
        let counter = Arc::new(AtomicU32::new(0));
        let cleaned = Arc::new(AtomicBool::new(false));
        let counter_clone = Arc::clone(&counter);
        let cleaned_clone = Arc::clone(&cleaned);

        let mut controller = CaptureLoopController::start_with_init(
            "test-loop",
            |_| Ok::<_, io::Error>(()),
            move |_| {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                LoopAction::Continue
            },
            move |_| cleaned_clone.store(true, Ordering::SeqCst),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(30));
        assert!(controller.is_running());

        controller.stop();
        assert!(counter.load(Ordering::SeqCst) > 0);
        assert!(cleaned.load(Ordering::SeqCst));
        assert!(!controller.is_running());
    }

    #[test]
    fn test_init_state_reaches_loop() {
        let result = Arc::new(AtomicU32::new(0));
        let result_clone = Arc::clone(&result);

        let mut controller = CaptureLoopController::start_with_init(
            "test-init-loop",
            |_| Ok::<_, io::Error>(42u32),
            move |state| {
                result_clone.store(*state, Ordering::SeqCst);
                LoopAction::Stop
            },
            |_| {},
        )
        .unwrap();

        controller.join();
        assert_eq!(result.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn test_init_failure_is_returned() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);

        let result = CaptureLoopController::start_with_init(
            "test-fail-init",
            |_| Err::<(), _>(io::Error::other("Init failed")),
            move |_: &mut ()| {
                ran_clone.store(true, Ordering::SeqCst);
                LoopAction::Stop
            },
            |_| {},
        );

        assert_eq!(result.err().map(|e| e.to_string()), Some("Init failed".to_string()));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stop_reports_panicked_thread() {
        let cleaned = Arc::new(AtomicBool::new(false));
        let cleaned_clone = Arc::clone(&cleaned);

        let mut controller = CaptureLoopController::start_with_init(
            "test-panic-loop",
            |_| Ok::<_, io::Error>(()),
            |_| panic!("iteration blew up"),
            move |_| cleaned_clone.store(true, Ordering::SeqCst),
        )
        .unwrap();

        while controller.is_running() {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!controller.stop());
        assert!(!cleaned.load(Ordering::SeqCst));
        // Already joined
        assert!(controller.join());
    }

    #[test]
    fn test_pause_wakes_on_stop() {
        let stop = AtomicBool::new(true);
        let started = Instant::now();
        assert!(!pause(&stop, Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));

        let stop = AtomicBool::new(false);
        assert!(pause(&stop, Duration::from_millis(1)));
    }
}
