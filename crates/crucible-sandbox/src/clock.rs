//! Per-thread CPU clocks readable from other threads.

use std::io;

use crate::error::fatal;

/// Handle to one thread's CPU-time clock.
///
/// Captured with `pthread_getcpuclockid` on the owning thread; any thread may
/// subsequently read it, which is what lets the watchdog meter the worker
/// without signal handlers. The clock only advances while the owning thread is
/// scheduled on a CPU.
#[derive(Debug, Clone, Copy)]
pub struct ThreadCpuClock {
    clockid: libc::clockid_t,
}

impl ThreadCpuClock {
    /// Capture the calling thread's CPU clock.
    pub fn for_current_thread() -> io::Result<Self> {
        let mut clockid: libc::clockid_t = 0;
        let rc = unsafe { libc::pthread_getcpuclockid(libc::pthread_self(), &mut clockid) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(Self { clockid })
    }

    /// Current reading in nanoseconds.
    ///
    /// Aborts the process if the clock cannot be read: without a working
    /// budget meter the sandbox guarantees are void.
    pub fn now_ns(&self) -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let rc = unsafe { libc::clock_gettime(self.clockid, &mut ts) };
        if rc != 0 {
            fatal("clock_gettime failed on a thread CPU clock");
        }
        ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_under_cpu_load() {
        let clock = ThreadCpuClock::for_current_thread().unwrap();
        let before = clock.now_ns();
        let mut acc = 0u64;
        for i in 0..5_000_000u64 {
            acc = acc.wrapping_add(i);
        }
        std::hint::black_box(acc);
        assert!(clock.now_ns() > before);
    }

    #[test]
    fn never_goes_backwards() {
        let clock = ThreadCpuClock::for_current_thread().unwrap();
        let mut last = clock.now_ns();
        for _ in 0..1000 {
            let now = clock.now_ns();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn readable_from_another_thread() {
        let clock = ThreadCpuClock::for_current_thread().unwrap();
        let reading = std::thread::spawn(move || clock.now_ns())
            .join()
            .expect("reader thread");
        // The owning thread has burned some CPU getting here.
        assert!(reading > 0);
    }
}
