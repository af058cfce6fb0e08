//! CPU-deadline watchdog.
//!
//! One background thread per evaluation slot. While a user invocation is in
//! flight the watchdog polls the request's CPU consumption and forcibly
//! terminates V8 execution once the budget is spent. Polling a thread CPU
//! clock beats signal-based timers here: no signal handlers near the engine,
//! and the adaptive sleep (the remaining CPU budget) under-shoots wall clock,
//! so checks land naturally once the worker has actually burned its time.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{fatal, SandboxError};

/// Sleep used whenever there is nothing to watch.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

type UsedCpuTime = Box<dyn Fn() -> u64 + Send>;

enum Phase {
    Disabled,
    Armed {
        limit_ns: u64,
        used_cpu_time: UsedCpuTime,
    },
    Triggered,
    Exiting,
}

struct Shared {
    phase: Mutex<Phase>,
    cv: Condvar,
}

/// Deadline enforcement for one isolate.
///
/// All state transitions happen under the phase mutex, so the watchdog
/// observes `arm` strictly before it can terminate execution for that arming,
/// and a `disarm` prevents any later firing for the finished invocation.
pub struct CpuWatchdog {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl CpuWatchdog {
    /// Spawn the watchdog thread for the isolate behind `isolate_handle`.
    pub fn new(isolate_handle: v8::IsolateHandle) -> Result<Self, SandboxError> {
        let shared = Arc::new(Shared {
            phase: Mutex::new(Phase::Disabled),
            cv: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("cpu-watchdog".into())
            .spawn(move || watch(thread_shared, isolate_handle))
            .map_err(SandboxError::WatchdogSpawn)?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Arm the deadline for one invocation.
    ///
    /// `used_cpu_time` is polled from the watchdog thread and must report the
    /// request's GC-adjusted CPU consumption in nanoseconds. Arming while a
    /// previous arming is still active is an unrecoverable bug.
    pub fn arm(&self, limit_ns: u64, used_cpu_time: impl Fn() -> u64 + Send + 'static) {
        let mut guard = self.shared.phase.lock().expect("watchdog mutex poisoned");
        if !matches!(*guard, Phase::Disabled) {
            fatal("watchdog armed while a previous arming is still active");
        }
        *guard = Phase::Armed {
            limit_ns,
            used_cpu_time: Box::new(used_cpu_time),
        };
        self.shared.cv.notify_all();
    }

    /// Disarm after an invocation; returns whether the deadline fired.
    ///
    /// Holding the phase mutex here means that once this returns, no further
    /// termination can be issued for the finished arming.
    pub fn disarm(&self) -> bool {
        let mut guard = self.shared.phase.lock().expect("watchdog mutex poisoned");
        let fired = match *guard {
            Phase::Armed { .. } => false,
            Phase::Triggered => true,
            Phase::Disabled | Phase::Exiting => fatal("watchdog disarmed while not armed"),
        };
        *guard = Phase::Disabled;
        fired
    }
}

impl Drop for CpuWatchdog {
    fn drop(&mut self) {
        {
            let mut guard = self.shared.phase.lock().expect("watchdog mutex poisoned");
            *guard = Phase::Exiting;
            self.shared.cv.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn watch(shared: Arc<Shared>, isolate_handle: v8::IsolateHandle) {
    // Inspect-then-wait, with the mutex held from the inspection into the
    // wait: an `arm` can never slip in between and go unnoticed.
    let mut guard = shared.phase.lock().expect("watchdog mutex poisoned");
    loop {
        let mut fire = false;
        let mut next_check = IDLE_WAIT;
        match &*guard {
            Phase::Disabled | Phase::Triggered => {}
            Phase::Exiting => return,
            Phase::Armed {
                limit_ns,
                used_cpu_time,
            } => {
                let used = used_cpu_time();
                if used >= *limit_ns {
                    fire = true;
                } else {
                    // Sleep for exactly the CPU budget that is left.
                    next_check = Duration::from_nanos(limit_ns - used);
                }
            }
        }

        if fire {
            isolate_handle.terminate_execution();
            *guard = Phase::Triggered;
            continue;
        }

        let (reacquired, _timeout) = shared
            .cv
            .wait_timeout(guard, next_check)
            .expect("watchdog mutex poisoned");
        guard = reacquired;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn isolate_and_watchdog() -> (v8::OwnedIsolate, CpuWatchdog) {
        crate::init_v8_for_tests();
        let mut isolate = v8::Isolate::new(Default::default());
        let watchdog = CpuWatchdog::new(isolate.thread_safe_handle()).expect("spawn watchdog");
        (isolate, watchdog)
    }

    #[test]
    fn fires_once_the_budget_is_spent() {
        let (mut isolate, watchdog) = isolate_and_watchdog();
        watchdog.arm(1, || 2);
        std::thread::sleep(Duration::from_millis(500));
        assert!(watchdog.disarm());
        // Clear the flag the firing left on the idle isolate.
        isolate.cancel_terminate_execution();
    }

    #[test]
    fn stays_quiet_inside_the_budget() {
        let (_isolate, watchdog) = isolate_and_watchdog();
        watchdog.arm(u64::MAX, || 0);
        std::thread::sleep(Duration::from_millis(50));
        assert!(!watchdog.disarm());
    }

    #[test]
    fn rearm_after_disarm_is_clean() {
        let (mut isolate, watchdog) = isolate_and_watchdog();
        watchdog.arm(u64::MAX, || 0);
        assert!(!watchdog.disarm());
        watchdog.arm(1, || 2);
        std::thread::sleep(Duration::from_millis(500));
        assert!(watchdog.disarm());
        isolate.cancel_terminate_execution();
    }

    #[test]
    fn drop_joins_the_thread() {
        let (_isolate, watchdog) = isolate_and_watchdog();
        drop(watchdog);
    }
}
