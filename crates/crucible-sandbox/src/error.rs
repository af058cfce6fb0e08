//! Error types and the fatal-abort path.

use std::backtrace::Backtrace;

use thiserror::Error;

/// Errors raised while bringing sandbox components up.
///
/// Once a request is in flight, client and user-code failures are folded into
/// the response envelope instead of surfacing here; the only mid-request
/// escalation is [`fatal`], for engine states the protocol has no answer to.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// A second [`Platform`](crate::Platform) was constructed in this process.
    #[error("V8 platform already initialized in this process")]
    PlatformAlreadyInitialized,

    /// The worker thread's CPU clock could not be captured.
    #[error("cannot capture thread CPU clock: {0}")]
    Clock(#[source] std::io::Error),

    /// The watchdog thread could not be spawned.
    #[error("cannot spawn watchdog thread: {0}")]
    WatchdogSpawn(#[source] std::io::Error),
}

/// Abort the process over an unrecoverable engine state.
///
/// Logs the message and a captured backtrace, then aborts; the orchestrator is
/// expected to restart the server.
pub(crate) fn fatal(message: &str) -> ! {
    tracing::error!(backtrace = %Backtrace::force_capture(), "{message}");
    std::process::abort();
}
