//! Portable transport, always available.

use std::sync::{Arc, OnceLock};

use super::{Transport, TransportKind};
use crate::error::ProbeError;

#[derive(Debug, Default)]
pub struct PortableTransport;

impl PortableTransport {
    /// The process-wide instance handed out by transport selection.
    pub fn shared() -> Arc<dyn Transport> {
        static INSTANCE: OnceLock<Arc<PortableTransport>> = OnceLock::new();
        INSTANCE.get_or_init(|| Arc::new(PortableTransport)).clone()
    }
}

impl Transport for PortableTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::PortableFallback
    }

    fn name(&self) -> &str {
        "portable"
    }

    fn probe(&self) -> Result<(), ProbeError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_instance() {
        let a = PortableTransport::shared();
        let b = PortableTransport::shared();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.is_available());
        assert!(!a.kind().is_native());
    }
}
