//! Formatting of compile- and run-time exceptions into response details.

/// Render the exception caught by `scope` as
/// `<message> [<source>:<line>]` followed by a stack-trace block.
///
/// Runs while the user context is current: reading the message and stack can
/// stringify user-exposed values. The result crosses the boundary as a plain
/// UTF-8 string, never as an engine handle.
pub(crate) fn exception_detail(scope: &mut v8::TryCatch<v8::HandleScope>) -> String {
    let message_part = match scope.message() {
        Some(message) => {
            let text = message.get(scope).to_rust_string_lossy(scope);
            let line = message.get_line_number(scope).unwrap_or(0);
            let resource = message
                .get_script_resource_name(scope)
                .and_then(|name| name.to_string(scope))
                .map(|name| name.to_rust_string_lossy(scope))
                .unwrap_or_else(|| "<unknown>".to_string());
            format!("{text} [{resource}:{line}]")
        }
        None => "<no message>".to_string(),
    };

    // The thrown value may carry a .stack; anything that is not a string gets
    // the placeholder.
    let stack_part = scope
        .stack_trace()
        .and_then(|stack| v8::Local::<v8::String>::try_from(stack).ok())
        .map(|stack| stack.to_rust_string_lossy(scope))
        .unwrap_or_else(|| "<no stack trace>".to_string());

    format!("{message_part}\n\nStack trace:\n{stack_part}")
}
