//! The per-request evaluation pipeline.
//!
//! Decode → parse → compile → arm limits → invoke → classify → emit. Every
//! client- or user-level failure is folded into a `bad_request` / `code_error`
//! envelope; the pipeline itself never fails. The request JSON is parsed by
//! the engine's own JSON parser inside the evaluation context, and responses
//! are emitted through the evaluator's serialization context, which user code
//! can never reach.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::diagnostics::exception_detail;
use crate::error::fatal;
use crate::evaluator::{CpuBudget, Evaluator};

impl Evaluator {
    /// Evaluate one request blob and produce the UTF-8 JSON response body.
    ///
    /// Must be called on the evaluator's owning thread. Reestablishes every
    /// slot invariant before returning, so the slot is immediately reusable no
    /// matter how the request ended.
    pub fn handle_request(&mut self, request_blob: &[u8]) -> String {
        // A deadline that fired between the previous disarm and now would
        // otherwise poison this invocation; cancelling with nothing pending is
        // a no-op.
        self.isolate.cancel_terminate_execution();

        let shared = Arc::clone(&self.shared);
        let default_timeout_ms = self.config.default_timeout_ms;

        let scope = &mut v8::HandleScope::new(&mut self.isolate);
        let user_context = v8::Context::new(scope, Default::default());
        let ctx_scope = &mut v8::ContextScope::new(scope, user_context);
        let scope: &mut v8::HandleScope = ctx_scope;
        let scope = &mut v8::TryCatch::new(scope);

        // -- Decode ---------------------------------------------------------

        let Ok(request_text) = std::str::from_utf8(request_blob) else {
            return error_response(
                scope,
                &self.response_context,
                "bad_request",
                "Request is not valid UTF-8.",
            );
        };
        let Some(request_string) = v8::String::new(scope, request_text) else {
            return error_response(
                scope,
                &self.response_context,
                "bad_request",
                "Request is not valid UTF-8.",
            );
        };
        let Some(request_value) = v8::json::parse(scope, request_string) else {
            return error_response(
                scope,
                &self.response_context,
                "bad_request",
                "Request is not valid JSON.",
            );
        };
        if request_value.is_array() {
            return error_response(
                scope,
                &self.response_context,
                "bad_request",
                "Request is not an object.",
            );
        }
        let Ok(request_object) = v8::Local::<v8::Object>::try_from(request_value) else {
            return error_response(
                scope,
                &self.response_context,
                "bad_request",
                "Request is not an object.",
            );
        };

        let context_key = v8_str(scope, "context");
        let bindings = request_object
            .get(scope, context_key.into())
            .and_then(|value| v8::Local::<v8::Object>::try_from(value).ok());
        let Some(bindings) = bindings else {
            return error_response(
                scope,
                &self.response_context,
                "bad_request",
                "Missing 'context' parameter or it is not an object.",
            );
        };

        let code_key = v8_str(scope, "code");
        let code = request_object
            .get(scope, code_key.into())
            .and_then(|value| v8::Local::<v8::String>::try_from(value).ok());
        let Some(code) = code else {
            return error_response(
                scope,
                &self.response_context,
                "bad_request",
                "Missing 'code' parameter or it is not a string.",
            );
        };

        let timeout_key = v8_str(scope, "timeout");
        let timeout_value = request_object.get(scope, timeout_key.into());
        let timeout_ms = match timeout_value {
            None => default_timeout_ms,
            Some(value) if value.is_undefined() => default_timeout_ms,
            Some(value) if value.is_uint32() => match value.uint32_value(scope) {
                Some(ms) if ms > 0 => ms,
                _ => {
                    return error_response(
                        scope,
                        &self.response_context,
                        "bad_request",
                        "'timeout' parameter must be a positive integer.",
                    )
                }
            },
            Some(_) => {
                return error_response(
                    scope,
                    &self.response_context,
                    "bad_request",
                    "'timeout' parameter must be a positive integer.",
                )
            }
        };

        // -- Compile --------------------------------------------------------

        let resource_name = v8_str(scope, "<user-code>");
        let origin = v8::ScriptOrigin::new(
            scope,
            resource_name.into(),
            0,
            0,
            false,
            0,
            None,
            false,
            false,
            false,
            None,
        );
        let mut source = v8::script_compiler::Source::new(code, Some(&origin));

        // Two scope-chain extensions: the implicit bindings, then the caller's
        // context object. `global` is the only implicit binding today; further
        // ones install here.
        let implicit = v8::Object::new(scope);
        let global_key = v8_str(scope, "global");
        let user_global = user_context.global(scope);
        let _ = implicit.set(scope, global_key.into(), user_global.into());

        let extensions = [implicit, bindings];
        let function = v8::script_compiler::compile_function(
            scope,
            &mut source,
            &[],
            &extensions,
            v8::script_compiler::CompileOptions::NoCompileOptions,
            v8::script_compiler::NoCacheReason::NoReason,
        );
        let Some(function) = function else {
            let detail = exception_detail(scope);
            return error_response(scope, &self.response_context, "code_error", &detail);
        };

        // -- Arm limits -----------------------------------------------------

        shared.heap_limit_exceeded.store(false, Ordering::SeqCst);
        shared.heap_limit_enabled.store(true, Ordering::SeqCst);

        let budget = CpuBudget {
            shared: Arc::clone(&shared),
            start: shared.clock.now_ns(),
            gc_total_at_start: shared.gc_total.load(Ordering::SeqCst),
        };
        let limit_ns = u64::from(timeout_ms) * 1_000_000;
        let armed_budget = budget.clone();
        self.watchdog.arm(limit_ns, move || armed_budget.used_ns());

        // -- Invoke ---------------------------------------------------------

        let receiver: v8::Local<v8::Value> = user_global.into();
        let retval = function.call(scope, receiver, &[]);
        let stringified = retval.and_then(|value| v8::json::stringify(scope, value));
        let used_ns = budget.used_ns();

        // -- Disarm (the watchdog may fire right up to this line) -----------

        let over_cpu = self.watchdog.disarm();
        shared.heap_limit_enabled.store(false, Ordering::SeqCst);

        // -- Classify -------------------------------------------------------

        if scope.is_execution_terminating() {
            scope.cancel_terminate_execution();
            if shared.heap_limit_exceeded.load(Ordering::SeqCst) {
                // Compact the heap so the next request starts below the limit.
                scope.low_memory_notification();
                return error_response(
                    scope,
                    &self.response_context,
                    "code_error",
                    "Memory limit exceeded.",
                );
            } else if over_cpu {
                let gc_ns = shared
                    .gc_total
                    .load(Ordering::SeqCst)
                    .saturating_sub(budget.gc_total_at_start);
                let detail = format!(
                    "CPU time limit exceeded (limit {} ms, used {} ms, plus {} ms for gc).",
                    timeout_ms,
                    used_ns as f64 / 1e6,
                    gc_ns as f64 / 1e6,
                );
                return error_response(scope, &self.response_context, "code_error", &detail);
            } else {
                fatal("execution terminating with neither the memory nor the CPU limit hit");
            }
        }

        let Some(stringified) = stringified else {
            if scope.has_caught() {
                let detail = exception_detail(scope);
                return error_response(scope, &self.response_context, "code_error", &detail);
            }
            fatal("invocation produced neither a value nor an exception");
        };

        // JSON.stringify yields the bare token `undefined` for a function body
        // with no produced value; that token is not valid JSON. Detection is
        // deliberately exact: length 9, bytes "undefined".
        if stringified.length() == 9 && stringified.to_rust_string_lossy(scope) == "undefined" {
            return success_response("null", used_ns);
        }

        let return_value = stringified.to_rust_string_lossy(scope);
        success_response(&return_value, used_ns)
    }
}

/// Make an engine string, treating allocation failure as fatal.
fn v8_str<'s>(scope: &mut v8::HandleScope<'s, ()>, text: &str) -> v8::Local<'s, v8::String> {
    v8::String::new(scope, text)
        .unwrap_or_else(|| fatal("failed to allocate an engine string for the protocol"))
}

/// Emit the success envelope by direct template concatenation, so the
/// (possibly huge) stringified return value is never re-parsed.
fn success_response(return_value: &str, used_ns: u64) -> String {
    let time_ms = used_ns.div_ceil(1_000_000);
    format!("{{\"status\":\"success\",\"return_value\":{return_value},\"time\":{time_ms}}}")
}

/// Build an error envelope inside the serialization context and stringify it
/// there. The detail may contain arbitrary user-produced text; the context
/// switch keeps user stringification hooks away from the envelope.
fn error_response(
    scope: &mut v8::HandleScope,
    response_context: &v8::Global<v8::Context>,
    status: &str,
    detail: &str,
) -> String {
    let context = v8::Local::new(scope, response_context);
    let scope = &mut v8::ContextScope::new(scope, context);

    let response = v8::Object::new(scope);
    let status_key = v8_str(scope, "status");
    let status_value = v8_str(scope, status);
    let _ = response.set(scope, status_key.into(), status_value.into());
    let detail_key = v8_str(scope, "detail");
    let detail_value = v8_str(scope, detail);
    let _ = response.set(scope, detail_key.into(), detail_value.into());

    let Some(body) = v8::json::stringify(scope, response.into()) else {
        fatal("response serialization failed in the serialization context");
    };
    body.to_rust_string_lossy(scope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::SandboxConfig;

    fn evaluator() -> Evaluator {
        crate::init_v8_for_tests();
        Evaluator::new(SandboxConfig::default()).expect("construct evaluator")
    }

    #[test]
    fn success_envelope_shape() {
        assert_eq!(
            success_response("3", 1_500_000),
            "{\"status\":\"success\",\"return_value\":3,\"time\":2}"
        );
        assert_eq!(
            success_response("null", 0),
            "{\"status\":\"success\",\"return_value\":null,\"time\":0}"
        );
    }

    #[test]
    fn elapsed_milliseconds_round_up() {
        assert!(success_response("1", 1).ends_with("\"time\":1}"));
        assert!(success_response("1", 1_000_000).ends_with("\"time\":1}"));
        assert!(success_response("1", 1_000_001).ends_with("\"time\":2}"));
    }

    // The serialization context must be unaffected by anything a request did:
    // a sentinel built there stringifies the same way after hostile requests.
    #[test]
    fn serialization_context_survives_hostile_requests() {
        let mut evaluator = evaluator();

        let hostile = br#"{"code":"Object.prototype.toJSON=function(){return 'evil';};global.leak=1;return 1;","context":{}}"#;
        let response = evaluator.handle_request(hostile);
        assert!(response.starts_with("{\"status\":\"success\""));

        let scope = &mut v8::HandleScope::new(&mut evaluator.isolate);
        let context = v8::Local::new(scope, &evaluator.response_context);
        let scope = &mut v8::ContextScope::new(scope, context);
        let sentinel = v8::Object::new(scope);
        let key = v8::String::new(scope, "ok").unwrap();
        let value = v8::Boolean::new(scope, true);
        let _ = sentinel.set(scope, key.into(), value.into());
        let json = v8::json::stringify(scope, sentinel.into())
            .unwrap()
            .to_rust_string_lossy(scope);
        assert_eq!(json, "{\"ok\":true}");

        let global = context.global(scope);
        let leak_key = v8::String::new(scope, "leak").unwrap();
        let leak = global.get(scope, leak_key.into()).unwrap();
        assert!(leak.is_undefined());
    }
}
