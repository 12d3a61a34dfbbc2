//! Recovery supervisor.
//!
//! A dedicated background loop the embedder parks on its own thread. Two
//! triggers: `run` (a failure asked for a stack restart) and `terminate`
//! (shutdown). A restart cycle tears the stack down, reinitializes it,
//! re-runs firmware bootstrap and polls for the done signal; a cycle that
//! does not come up re-arms itself per the configured policy. Terminate
//! always wins a race with run: once requested, no further cycle starts.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use aquila_bus::TimeSource;
use aquila_error::Severity;
use spin::Mutex;

use crate::cmd::FailureNotifier;
use crate::config::WatchdogPolicy;
use crate::error::{DriverError, FwError};

/// Polls of the bootstrap-done signal per cycle.
pub const PROBE_POLLS: u32 = 10;
/// Spacing between polls.
pub const PROBE_INTERVAL_MS: u64 = 100;

/// The stack operations a restart cycle drives, in order.
pub trait Recoverable: Send + Sync {
    /// Abort waiters, fail outstanding slots, unsubscribe the IRQ.
    fn teardown(&self);
    /// Bring the transport and channel state back to a clean baseline.
    fn reinit(&self);
    /// Kick firmware bootstrap.
    fn bootstrap(&self) -> Result<(), FwError>;
    /// True once the stack is serving commands again.
    fn bootstrap_done(&self) -> bool;
}

pub struct Supervisor {
    run: AtomicBool,
    terminate: AtomicBool,
    failed_cycles: AtomicU32,
    policy: WatchdogPolicy,
    last_failure: Mutex<Option<FwError>>,
}

impl Supervisor {
    pub fn new(policy: WatchdogPolicy) -> Self {
        Self {
            run: AtomicBool::new(false),
            terminate: AtomicBool::new(false),
            failed_cycles: AtomicU32::new(0),
            policy,
            last_failure: Mutex::new(None),
        }
    }

    /// Ask for a restart cycle. Ignored once shutdown is requested.
    pub fn request_restart(&self) {
        if self.terminate.load(Ordering::Acquire) {
            log::debug!("restart request ignored, shutting down");
            return;
        }
        self.run.store(true, Ordering::Release);
    }

    pub fn request_shutdown(&self) {
        self.terminate.store(true, Ordering::Release);
    }

    pub fn is_terminating(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    /// Failure that ended the last bounded-policy attempt, if any.
    pub fn last_failure(&self) -> Option<FwError> {
        *self.last_failure.lock()
    }

    pub fn failed_cycles(&self) -> u32 {
        self.failed_cycles.load(Ordering::Acquire)
    }

    fn wait_until(&self, clock: &dyn TimeSource, deadline: u64) {
        while clock.now_ms() < deadline && !self.terminate.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
    }

    /// One restart cycle. Returns true when the stack came back up.
    fn cycle(&self, stack: &dyn Recoverable, clock: &dyn TimeSource) -> bool {
        stack.teardown();
        stack.reinit();
        if let Err(err) = stack.bootstrap() {
            log::warn!("recovery bootstrap failed: {err}");
            *self.last_failure.lock() = Some(err);
            return false;
        }
        for _ in 0..PROBE_POLLS {
            if stack.bootstrap_done() {
                return true;
            }
            if self.terminate.load(Ordering::Acquire) {
                return false;
            }
            let deadline = clock.now_ms().saturating_add(PROBE_INTERVAL_MS);
            self.wait_until(clock, deadline);
        }
        *self.last_failure.lock() = Some(FwError::BootstrapFailed);
        false
    }

    /// The supervisor loop body. Parks until `run` or `terminate`; runs
    /// restart cycles, re-arming per policy; returns only on terminate.
    pub fn supervise(&self, stack: &dyn Recoverable, clock: &dyn TimeSource) {
        loop {
            if self.terminate.load(Ordering::Acquire) {
                log::info!("recovery supervisor terminating");
                return;
            }
            if !self.run.swap(false, Ordering::AcqRel) {
                core::hint::spin_loop();
                continue;
            }

            if self.cycle(stack, clock) {
                self.failed_cycles.store(0, Ordering::Release);
                *self.last_failure.lock() = None;
                log::info!("recovery cycle succeeded");
                continue;
            }

            let failed = self.failed_cycles.fetch_add(1, Ordering::AcqRel) + 1;
            match self.policy {
                WatchdogPolicy::Bounded(limit) if failed >= limit => {
                    log::error!("recovery gave up after {failed} failed cycles");
                    // Stay parked; only an explicit restart or shutdown
                    // moves the supervisor again.
                }
                _ => {
                    log::warn!("recovery cycle {failed} failed, re-arming");
                    self.request_restart();
                }
            }
        }
    }
}

impl FailureNotifier for Supervisor {
    /// Only fatal errors start a restart cycle; transient and backpressure
    /// failures resolve in place.
    fn failure(&self, err: DriverError) {
        if err.severity() == Severity::Fatal {
            log::error!("fatal stack failure: {err}");
            self.request_restart();
        } else {
            log::warn!("non-fatal failure reported: {err}");
        }
    }
}
