//! Per-thread evaluation slot.
//!
//! An [`Evaluator`] owns one V8 isolate with a constrained heap, the
//! serialization context used to emit responses, the state shared with engine
//! callbacks, and the CPU watchdog. It is bound to the thread that constructs
//! it: the thread CPU clock is captured at construction and the isolate is
//! entered on that thread.

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::clock::ThreadCpuClock;
use crate::error::SandboxError;
use crate::watchdog::CpuWatchdog;

/// Limits applied to every evaluation slot.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// V8 heap cap in bytes.
    pub max_heap_size: usize,
    /// Budget applied to requests that carry no `timeout` field.
    pub default_timeout_ms: u32,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_heap_size: 64 * 1024 * 1024, // 64 MiB
            default_timeout_ms: 10,
        }
    }
}

/// State shared between the worker thread, the engine callbacks, and the
/// watchdog's accounting closure.
///
/// Registered with V8 as a raw callback-data pointer, so the owning `Arc` must
/// stay alive until the isolate is disposed; `Evaluator`'s field order
/// guarantees that.
pub(crate) struct SlotState {
    pub(crate) clock: ThreadCpuClock,
    /// CPU-time reading at GC entry; 0 while no GC is running.
    pub(crate) gc_start: AtomicU64,
    /// Cumulative GC-attributed CPU time on this slot.
    pub(crate) gc_total: AtomicU64,
    pub(crate) heap_limit_enabled: AtomicBool,
    pub(crate) heap_limit_exceeded: AtomicBool,
    pub(crate) isolate_handle: v8::IsolateHandle,
}

impl SlotState {
    fn record_gc_entry(&self) {
        self.gc_start.store(self.clock.now_ns(), Ordering::SeqCst);
    }

    fn record_gc_exit(&self) {
        let started = self.gc_start.swap(0, Ordering::SeqCst);
        if started != 0 {
            let elapsed = self.clock.now_ns().saturating_sub(started);
            self.gc_total.fetch_add(elapsed, Ordering::SeqCst);
        }
    }

    /// Near-heap-limit behavior: terminate the running execution instead of
    /// letting the heap grow. The limit itself is returned unchanged.
    fn approach_heap_limit(&self, current_heap_limit: usize) -> usize {
        if self.heap_limit_enabled.load(Ordering::SeqCst) {
            self.heap_limit_exceeded.store(true, Ordering::SeqCst);
            self.isolate_handle.terminate_execution();
        }
        current_heap_limit
    }
}

/// Accounting state for one armed request.
#[derive(Clone)]
pub(crate) struct CpuBudget {
    pub(crate) shared: Arc<SlotState>,
    pub(crate) start: u64,
    pub(crate) gc_total_at_start: u64,
}

impl CpuBudget {
    /// CPU time attributed to the request so far, in nanoseconds, excluding
    /// garbage collection.
    ///
    /// Inside a GC the reading is frozen at the GC entry point, so an open GC
    /// is never charged twice. Subtraction saturates: the GC counters are
    /// updated from the worker thread while the watchdog reads them.
    pub(crate) fn used_ns(&self) -> u64 {
        let gc_start = self.shared.gc_start.load(Ordering::SeqCst);
        let now = if gc_start != 0 {
            gc_start
        } else {
            self.shared.clock.now_ns()
        };
        let gc_delta = self
            .shared
            .gc_total
            .load(Ordering::SeqCst)
            .saturating_sub(self.gc_total_at_start);
        now.saturating_sub(self.start).saturating_sub(gc_delta)
    }
}

extern "C" fn gc_prologue(
    _isolate: *mut v8::Isolate,
    _kind: v8::GCType,
    _flags: v8::GCCallbackFlags,
    data: *mut c_void,
) {
    let state = unsafe { &*(data as *const SlotState) };
    state.record_gc_entry();
}

extern "C" fn gc_epilogue(
    _isolate: *mut v8::Isolate,
    _kind: v8::GCType,
    _flags: v8::GCCallbackFlags,
    data: *mut c_void,
) {
    let state = unsafe { &*(data as *const SlotState) };
    state.record_gc_exit();
}

extern "C" fn near_heap_limit(
    data: *mut c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    let state = unsafe { &*(data as *const SlotState) };
    state.approach_heap_limit(current_heap_limit)
}

/// Array-buffer allocator that refuses every allocation, so user code cannot
/// back typed arrays with real memory.
struct DeniedBuffers;

unsafe extern "C" fn denied_allocate(_handle: &DeniedBuffers, _len: usize) -> *mut c_void {
    std::ptr::null_mut()
}

unsafe extern "C" fn denied_free(_handle: &DeniedBuffers, _data: *mut c_void, _len: usize) {}

unsafe extern "C" fn denied_reallocate(
    _handle: &DeniedBuffers,
    _data: *mut c_void,
    _old_length: usize,
    _new_length: usize,
) -> *mut c_void {
    std::ptr::null_mut()
}

unsafe extern "C" fn denied_drop(handle: *const DeniedBuffers) {
    drop(unsafe { Arc::from_raw(handle) });
}

static DENIED_BUFFERS_VTABLE: v8::RustAllocatorVtable<DeniedBuffers> = v8::RustAllocatorVtable {
    allocate: denied_allocate,
    allocate_uninitialized: denied_allocate,
    free: denied_free,
    reallocate: denied_reallocate,
    drop: denied_drop,
};

fn denied_buffer_allocator() -> v8::SharedRef<v8::Allocator> {
    let handle = Arc::into_raw(Arc::new(DeniedBuffers));
    unsafe { v8::new_rust_allocator(handle, &DENIED_BUFFERS_VTABLE) }.make_shared()
}

/// One worker thread's evaluation slot.
///
/// Handles requests strictly serially via
/// [`handle_request`](Evaluator::handle_request). Survives every terminal
/// request condition — limit hits, user exceptions, malformed input — and is
/// immediately reusable for the next request.
pub struct Evaluator {
    // Field order is drop order: the watchdog joins before the isolate is
    // disposed, and the context handle is released before the isolate too.
    pub(crate) watchdog: CpuWatchdog,
    pub(crate) response_context: v8::Global<v8::Context>,
    pub(crate) isolate: v8::OwnedIsolate,
    pub(crate) shared: Arc<SlotState>,
    pub(crate) config: SandboxConfig,
}

impl Evaluator {
    /// Create a slot bound to the current thread.
    ///
    /// Requires a live [`Platform`](crate::Platform). The thread CPU clock is
    /// captured here, so all later calls must happen on this same thread.
    pub fn new(config: SandboxConfig) -> Result<Self, SandboxError> {
        let clock = ThreadCpuClock::for_current_thread().map_err(SandboxError::Clock)?;

        let params = v8::CreateParams::default()
            .heap_limits(0, config.max_heap_size)
            .array_buffer_allocator(denied_buffer_allocator());
        let mut isolate = v8::Isolate::new(params);

        let shared = Arc::new(SlotState {
            clock,
            gc_start: AtomicU64::new(0),
            gc_total: AtomicU64::new(0),
            heap_limit_enabled: AtomicBool::new(false),
            heap_limit_exceeded: AtomicBool::new(false),
            isolate_handle: isolate.thread_safe_handle(),
        });

        // The Arc outlives the isolate, so the raw pointer handed to V8 stays
        // valid for every callback invocation.
        let data = Arc::as_ptr(&shared) as *mut c_void;
        isolate.add_gc_prologue_callback(gc_prologue, data, v8::GCType::ALL);
        isolate.add_gc_epilogue_callback(gc_epilogue, data, v8::GCType::ALL);
        isolate.add_near_heap_limit_callback(near_heap_limit, data);

        let response_context = {
            let scope = &mut v8::HandleScope::new(&mut isolate);
            let context = v8::Context::new(scope, Default::default());
            v8::Global::new(scope, context)
        };

        let watchdog = CpuWatchdog::new(isolate.thread_safe_handle())?;

        Ok(Self {
            watchdog,
            response_context,
            isolate,
            shared,
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot_state() -> (v8::OwnedIsolate, Arc<SlotState>) {
        crate::init_v8_for_tests();
        let mut isolate = v8::Isolate::new(Default::default());
        let handle = isolate.thread_safe_handle();
        let state = Arc::new(SlotState {
            clock: ThreadCpuClock::for_current_thread().unwrap(),
            gc_start: AtomicU64::new(0),
            gc_total: AtomicU64::new(0),
            heap_limit_enabled: AtomicBool::new(false),
            heap_limit_exceeded: AtomicBool::new(false),
            isolate_handle: handle,
        });
        (isolate, state)
    }

    #[test]
    fn accounting_freezes_inside_a_gc() {
        let (_isolate, shared) = slot_state();
        let start = shared.clock.now_ns();
        // Pretend a GC opened 7 ms of CPU after the request started.
        shared.gc_start.store(start + 7_000_000, Ordering::SeqCst);
        let budget = CpuBudget {
            shared: Arc::clone(&shared),
            start,
            gc_total_at_start: 0,
        };
        assert_eq!(budget.used_ns(), 7_000_000);
    }

    #[test]
    fn accounting_subtracts_completed_gcs() {
        let (_isolate, shared) = slot_state();
        let now = shared.clock.now_ns();
        // Request "started" 10 ms of CPU ago; 3 ms of that went to GC.
        let budget = CpuBudget {
            shared: Arc::clone(&shared),
            start: now.saturating_sub(10_000_000),
            gc_total_at_start: 0,
        };
        shared.gc_total.store(3_000_000, Ordering::SeqCst);
        let used = budget.used_ns();
        assert!((6_900_000..9_000_000).contains(&used), "used = {used}");
    }

    #[test]
    fn accounting_saturates_rather_than_underflows() {
        let (_isolate, shared) = slot_state();
        let budget = CpuBudget {
            shared: Arc::clone(&shared),
            start: shared.clock.now_ns(),
            gc_total_at_start: 0,
        };
        // More GC than elapsed time, as can transiently happen mid-update.
        shared.gc_total.store(u64::MAX / 2, Ordering::SeqCst);
        assert_eq!(budget.used_ns(), 0);
    }

    #[test]
    fn heap_limit_only_triggers_when_enabled() {
        let (mut isolate, shared) = slot_state();

        assert_eq!(shared.approach_heap_limit(1024), 1024);
        assert!(!shared.heap_limit_exceeded.load(Ordering::SeqCst));

        shared.heap_limit_enabled.store(true, Ordering::SeqCst);
        // The limit is never raised, even when the handler triggers.
        assert_eq!(shared.approach_heap_limit(1024), 1024);
        assert!(shared.heap_limit_exceeded.load(Ordering::SeqCst));
        isolate.cancel_terminate_execution();
    }

    #[test]
    fn gc_bookkeeping_round_trip() {
        let (_isolate, shared) = slot_state();

        shared.record_gc_entry();
        assert_ne!(shared.gc_start.load(Ordering::SeqCst), 0);

        shared.record_gc_exit();
        assert_eq!(shared.gc_start.load(Ordering::SeqCst), 0);

        // An exit without a matching entry leaves the totals alone.
        let total = shared.gc_total.load(Ordering::SeqCst);
        shared.record_gc_exit();
        assert_eq!(shared.gc_total.load(Ordering::SeqCst), total);
    }
}
