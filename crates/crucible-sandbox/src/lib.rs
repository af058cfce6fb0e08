#![warn(missing_docs)]

//! # crucible-sandbox
//!
//! Sandboxed evaluation of untrusted JavaScript for the crucible eval server.
//!
//! Each worker thread owns an [`Evaluator`]: one V8 isolate with a constrained
//! heap, a long-lived serialization context for building responses, and a
//! [`CpuWatchdog`](watchdog::CpuWatchdog) thread that meters the worker's CPU
//! clock. Every request is evaluated in a fresh context and folded into a JSON
//! response envelope; nothing user code does can escape into the next request
//! or into the envelope itself.
//!
//! ## Security model
//!
//! - **Fresh context per request**: a new global object every time, dropped
//!   with the request
//! - **CPU budget**: deadline in *thread CPU time*, enforced by a watchdog
//!   thread; garbage-collection time is not charged to the user
//! - **Memory budget**: capped heap plus a near-heap-limit callback that
//!   terminates the offending execution
//! - **No typed-array memory**: the array-buffer allocator refuses every
//!   allocation
//! - **Protocol isolation**: responses are serialized in a context user code
//!   never sees, so `toJSON` hooks and prototype pollution cannot corrupt the
//!   envelope

pub mod clock;
pub mod error;
pub mod evaluator;
pub mod platform;
pub mod watchdog;

mod diagnostics;
mod request;

pub use error::SandboxError;
pub use evaluator::{Evaluator, SandboxConfig};
pub use platform::Platform;

/// One-time V8 bring-up shared by every unit test in this crate.
#[cfg(test)]
pub(crate) fn init_v8_for_tests() {
    use std::sync::OnceLock;
    static PLATFORM: OnceLock<Platform> = OnceLock::new();
    PLATFORM.get_or_init(|| Platform::new().expect("initialize V8 for tests"));
}
