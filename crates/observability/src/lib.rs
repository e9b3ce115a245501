//! Tracing, logging (shared setup) and structured log helpers.

/// Initialize process-wide observability (tracing/logging) with JSON output.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    self::tracing::init(LogFormat::Json);
}

/// Initialize with an explicit output format.
pub fn init_with(format: LogFormat) {
    self::tracing::init(format);
}

pub use self::tracing::LogFormat;

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Structured events for distributed lock acquisition and release.
pub mod lock;

/// Structured events for search-index projection.
pub mod projection;
