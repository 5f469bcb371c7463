//! Timing spans and structured events for the load and dispatch paths.
//!
//! ```rust
//! use codeobj_tracing::performance::{record_dispatch, PerformanceSpan};
//!
//! let span = PerformanceSpan::new("module_load", Some(100));
//! // ... load ...
//! drop(span); // logged only if it took at least 100µs
//!
//! record_dispatch("vector_add", 7, [128, 1, 1], [32, 1, 1], 0);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use tracing::Level;

static ENABLED: AtomicBool = AtomicBool::new(cfg!(debug_assertions));
// u64::MAX means "no threshold".
static DEFAULT_THRESHOLD_US: AtomicU64 = AtomicU64::new(u64::MAX);

/// Apply process-wide performance tracing settings.
pub fn configure(enabled: bool, threshold_us: Option<u64>) {
    ENABLED.store(enabled, Ordering::Relaxed);
    DEFAULT_THRESHOLD_US.store(threshold_us.unwrap_or(u64::MAX), Ordering::Relaxed);
}

/// Whether performance spans currently log.
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

fn default_threshold() -> Option<u64> {
    match DEFAULT_THRESHOLD_US.load(Ordering::Relaxed) {
        u64::MAX => None,
        us => Some(us),
    }
}

/// RAII timer: measures from creation and logs the duration when dropped.
///
/// A span created with `threshold_us = None` inherits the threshold set by
/// [`configure`].
pub struct PerformanceSpan {
    threshold_us: Option<u64>,
    start_time: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    pub fn new(span_name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        Self::with_level(Level::DEBUG, span_name, threshold_us)
    }

    pub fn with_level(level: Level, span_name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let span_name = span_name.into();
        let span = match level {
            Level::TRACE => tracing::trace_span!("perf", name = %span_name),
            Level::DEBUG => tracing::debug_span!("perf", name = %span_name),
            Level::INFO => tracing::info_span!("perf", name = %span_name),
            Level::WARN => tracing::warn_span!("perf", name = %span_name),
            Level::ERROR => tracing::error_span!("perf", name = %span_name),
        };

        Self {
            threshold_us: threshold_us.or_else(default_threshold),
            start_time: Instant::now(),
            span,
        }
    }

    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        if !is_enabled() {
            return;
        }
        let elapsed_us = self.elapsed_us();
        if self.threshold_us.is_none_or(|t| elapsed_us >= t) {
            let _entered = self.span.enter();
            tracing::debug!(
                duration_us = elapsed_us,
                duration_ms = elapsed_us as f64 / 1000.0,
                "performance_span_complete"
            );
        }
    }
}

/// A device binary finished loading (or failed to).
pub fn record_module_load(source: &str, image_bytes: u64, undefined_symbols: usize, duration_us: u64) {
    tracing::debug!(
        event = "module_load",
        source = source,
        image_bytes = image_bytes,
        image_kb = image_bytes as f64 / 1024.0,
        undefined_symbols = undefined_symbols,
        duration_us = duration_us,
        "module_load_complete"
    );
}

/// A host global was pinned and bound into an executable.
pub fn record_symbol_binding(name: &str, host_address: u64, device_address: u64, size: u64) {
    tracing::debug!(
        event = "symbol_binding",
        symbol = name,
        host_address = host_address,
        device_address = device_address,
        size = size,
        "host_global_bound"
    );
}

/// `[x, y, z]` as a JSON array.
fn dims_json(dims: [u32; 3]) -> serde_json::Value {
    serde_json::Value::from(dims.to_vec())
}

/// A dispatch packet was submitted.
pub fn record_dispatch(kernel: &str, queue: u64, grid: [u32; 3], block: [u32; 3], kernarg_bytes: usize) {
    let work_items = grid.iter().map(|&d| d as u64).product::<u64>();
    tracing::debug!(
        event = "dispatch",
        kernel = kernel,
        queue = queue,
        grid = %dims_json(grid),
        block = %dims_json(block),
        work_items = work_items,
        kernarg_bytes = kernarg_bytes,
        "kernel_dispatched"
    );
}
