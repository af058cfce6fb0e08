//! One-per-process V8 lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::SandboxError;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Owns the process-wide V8 runtime.
///
/// Construct exactly one before spawning evaluators and keep it alive until
/// every evaluator has been dropped. Dropping it disposes V8; the engine
/// cannot be re-initialized within the same process, so this normally lives in
/// `main` for the whole run.
pub struct Platform {
    _private: (),
}

impl Platform {
    /// Initialize V8.
    ///
    /// Returns [`SandboxError::PlatformAlreadyInitialized`] if a platform was
    /// already constructed in this process.
    pub fn new() -> Result<Self, SandboxError> {
        if INITIALIZED.swap(true, Ordering::SeqCst) {
            return Err(SandboxError::PlatformAlreadyInitialized);
        }

        // WebAssembly is outside the threat model; never expose it.
        v8::V8::set_flags_from_string("--no-expose-wasm");

        let platform = v8::new_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform);
        v8::V8::initialize();

        tracing::debug!("V8 initialized");
        Ok(Self { _private: () })
    }
}

impl Drop for Platform {
    fn drop(&mut self) {
        // All isolates must already be disposed at this point.
        unsafe { v8::V8::dispose() };
        v8::V8::dispose_platform();
    }
}
