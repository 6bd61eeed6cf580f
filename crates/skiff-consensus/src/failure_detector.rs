//! Leader-failure detection.
//!
//! One detector per replica, armed only while the replica is not leader.
//! It holds a deadline; a timer task fires the callback when the deadline
//! passes. Valid leader contact snoozes the deadline out by the jittered
//! failure timeout, so the callback only fires after heartbeats have been
//! missing for `heartbeat_interval x max_missed_periods x (1 + jitter)`.

use crate::options::RaftOptions;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

struct DetectorState {
    deadline: Instant,
    enabled: bool,
}

/// Randomised leader-failure timer.
pub struct FailureDetector {
    opts: RaftOptions,
    state: Mutex<DetectorState>,
    /// Wakes the timer task whenever the deadline or enablement changes.
    changed: Notify,
}

impl FailureDetector {
    pub fn new(opts: RaftOptions) -> Arc<Self> {
        let deadline = Instant::now() + opts.jittered_failure_timeout();
        Arc::new(FailureDetector {
            opts,
            state: Mutex::new(DetectorState {
                deadline,
                enabled: false,
            }),
            changed: Notify::new(),
        })
    }

    /// Arm the detector with a fresh jittered deadline. No effect if it is
    /// already armed.
    pub fn enable(&self) {
        let mut state = self.state.lock();
        if state.enabled {
            return;
        }
        state.enabled = true;
        state.deadline = Instant::now() + self.opts.jittered_failure_timeout();
        drop(state);
        self.changed.notify_one();
    }

    /// Disarm the detector (leader side). No effect if already disarmed.
    pub fn disable(&self) {
        let mut state = self.state.lock();
        if !state.enabled {
            return;
        }
        state.enabled = false;
        drop(state);
        self.changed.notify_one();
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Push the deadline out by the jittered failure timeout plus `extra`.
    /// Called on every accepted leader contact, and with a back-off delta
    /// after failed elections.
    pub fn snooze(&self, extra: Duration) {
        let mut state = self.state.lock();
        if !state.enabled {
            return;
        }
        state.deadline = Instant::now() + self.opts.jittered_failure_timeout() + extra;
        drop(state);
        self.changed.notify_one();
    }

    /// Make the next timer pass fire immediately. Used at startup to kick
    /// off a first election without waiting a full timeout.
    pub fn expire(&self) {
        let mut state = self.state.lock();
        state.deadline = Instant::now();
        drop(state);
        self.changed.notify_one();
    }

    /// Timer task. Runs until `shutdown_rx` fires; invokes `on_failure`
    /// every time an armed deadline elapses, then re-arms.
    pub async fn run(
        self: Arc<Self>,
        on_failure: Box<dyn Fn() + Send + Sync>,
        mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) {
        loop {
            let (deadline, enabled) = {
                let state = self.state.lock();
                (state.deadline, state.enabled)
            };

            if !enabled {
                tokio::select! {
                    _ = self.changed.notified() => continue,
                    _ = shutdown_rx.recv() => return,
                }
            }

            if Instant::now() >= deadline {
                {
                    // Re-arm before firing so a slow callback cannot make
                    // the detector fire in a tight loop.
                    let mut state = self.state.lock();
                    state.deadline = Instant::now() + self.opts.jittered_failure_timeout();
                }
                on_failure();
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = self.changed.notified() => {}
                _ = shutdown_rx.recv() => return,
            }
        }
    }
}
