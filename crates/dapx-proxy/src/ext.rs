//! Extension traits for best-effort operations.

/// Extension trait for Result types in best-effort operations.
///
/// Use this where failure should be logged at debug level but not
/// propagate (socket teardown, optional probes).
///
/// ```text
/// let stream = TcpStream::connect(addr).await
///     .debug_ok("Probe connect failed")?;
/// ```
pub trait DebugResult<T> {
    /// Convert to Option, logging error at debug level if Err.
    fn debug_ok(self, context: &str) -> Option<T>;
}

impl<T, E: std::fmt::Display> DebugResult<T> for Result<T, E> {
    fn debug_ok(self, context: &str) -> Option<T> {
        match self {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::debug!("{}: {}", context, e);
                None
            }
        }
    }
}
