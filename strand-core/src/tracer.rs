//! The tracing capability.
//!
//! Distributed tracing is provided from outside the core. The runtime only
//! holds the bound tracer, hands it to whoever asks, and closes it on
//! shutdown.

/// A distributed tracer bound to a runtime.
pub trait Tracer: Send + Sync {
    fn name(&self) -> &str;

    /// Flush and release exporter resources.
    fn close(&self) {}
}
