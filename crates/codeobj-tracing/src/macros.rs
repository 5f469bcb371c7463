//! Instrumentation macros.

/// Start a [`crate::performance::PerformanceSpan`], optionally emitting a
/// start event carrying extra fields.
///
/// ```rust
/// use codeobj_tracing::perf_span;
///
/// {
///     let _span = perf_span!("pack_kernargs", args = 4, bytes = 32);
///     // ...
/// }
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        ::tracing::debug!(
            name = $name,
            $($field = $value),+,
            "performance_span_start"
        );
        $crate::performance::PerformanceSpan::new($name, None)
    }};
}

/// Emit a debug-level event tagged with `event = $name`.
///
/// ```rust
/// use codeobj_tracing::perf_event;
///
/// perf_event!("layout_cached", kernel = "saxpy", params = 3);
/// ```
#[macro_export]
macro_rules! perf_event {
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {
        ::tracing::debug!(
            event = $name,
            $($field = $value),+
        );
    };
}
