//! Transport Negotiation - Choosing the Readiness Backend
//!
//! The runtime multiplexes sockets through one readiness mechanism for its
//! whole lifetime. On Linux that is epoll, on BSD/Darwin kqueue, and anywhere
//! else a portable poll-based fallback.
//!
//! # Selection Order:
//! 1. An explicitly supplied transport, used verbatim without probing
//! 2. The portable fallback when native transports are not preferred
//! 3. Transports registered with the [`ProviderRegistry`], first available wins
//! 4. Built-in native transports: epoll, then kqueue
//! 5. The portable fallback
//!
//! Every native candidate is loaded behind [`load_isolated`], which turns a
//! failed load (feature compiled out, wrong OS, panicking loader) into
//! "unavailable". Selection itself cannot fail.

pub mod epoll;
pub mod kqueue;
pub mod portable;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::ProbeError;
use crate::provider::ProviderRegistry;

pub use epoll::EpollTransport;
pub use kqueue::KqueueTransport;
pub use portable::PortableTransport;

/// The family a transport belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    NativeEpoll,
    NativeKqueue,
    PortableFallback,
}

impl TransportKind {
    pub fn is_native(self) -> bool {
        !matches!(self, Self::PortableFallback)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NativeEpoll => write!(f, "epoll"),
            Self::NativeKqueue => write!(f, "kqueue"),
            Self::PortableFallback => write!(f, "portable"),
        }
    }
}

/// An async I/O backend the runtime can drive its event loops with.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Identity used when logging the selection.
    fn name(&self) -> &str;

    /// Check whether the backend can be used on this host.
    fn probe(&self) -> Result<(), ProbeError>;

    fn is_available(&self) -> bool {
        self.probe().is_ok()
    }
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish()
    }
}

/// Constructor for a native transport candidate.
pub type TransportLoader = fn() -> Result<Arc<dyn Transport>, ProbeError>;

/// Built-in native candidates in preference order.
pub const NATIVE_LOADERS: [TransportLoader; 2] = [epoll::load, kqueue::load];

/// Run a loader, converting any failure (including a panic) into
/// [`ProbeError::Unavailable`].
pub fn load_isolated(loader: TransportLoader) -> Result<Arc<dyn Transport>, ProbeError> {
    match panic::catch_unwind(AssertUnwindSafe(loader)) {
        Ok(result) => result,
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "transport loader panicked".to_string());
            Err(ProbeError::Unavailable(reason))
        }
    }
}

/// The built-in native transport for this host.
///
/// Returns the first available candidate. When none is available, returns
/// the first candidate that could at least be constructed so the caller can
/// report why it is unusable, or `None` if nothing loaded at all.
pub fn native_transport() -> Option<Arc<dyn Transport>> {
    native_transport_from(&NATIVE_LOADERS)
}

pub(crate) fn native_transport_from(loaders: &[TransportLoader]) -> Option<Arc<dyn Transport>> {
    let mut fallback: Option<Arc<dyn Transport>> = None;
    for loader in loaders {
        match load_isolated(*loader) {
            Ok(transport) => match transport.probe() {
                Ok(()) => return Some(transport),
                Err(e) => {
                    debug!(transport = transport.name(), reason = e.reason(), "Native transport unavailable");
                    fallback.get_or_insert(transport);
                }
            },
            Err(e) => debug!(reason = e.reason(), "Native transport failed to load"),
        }
    }
    fallback
}

/// Pick the transport a runtime will be bound to.
pub fn select_transport(
    prefer_native: bool,
    explicit: Option<Arc<dyn Transport>>,
    registry: &ProviderRegistry,
) -> Arc<dyn Transport> {
    select_with(prefer_native, explicit, || registry.discover::<dyn Transport>(), &NATIVE_LOADERS)
}

pub(crate) fn select_with<F>(
    prefer_native: bool,
    explicit: Option<Arc<dyn Transport>>,
    discover: F,
    loaders: &[TransportLoader],
) -> Arc<dyn Transport>
where
    F: FnOnce() -> Vec<Arc<dyn Transport>>,
{
    if let Some(transport) = explicit {
        info!(transport = transport.name(), "Using explicitly configured transport");
        return transport;
    }

    if !prefer_native {
        debug!("Native transport not preferred, using portable transport");
        return PortableTransport::shared();
    }

    for candidate in discover() {
        match candidate.probe() {
            Ok(()) => {
                info!(transport = candidate.name(), "Selected registered transport");
                return candidate;
            }
            Err(e) => debug!(
                transport = candidate.name(),
                reason = e.reason(),
                "Registered transport unavailable, skipping"
            ),
        }
    }

    match native_transport_from(loaders) {
        Some(transport) if transport.is_available() => {
            info!(transport = transport.name(), "Selected native transport");
            transport
        }
        Some(transport) => {
            let reason = transport.probe().err().map(|e| e.reason().to_string()).unwrap_or_default();
            info!(
                transport = transport.name(),
                %reason,
                "Native transport unavailable, falling back to portable transport"
            );
            PortableTransport::shared()
        }
        None => {
            info!("No native transport on this host, using portable transport");
            PortableTransport::shared()
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A transport whose availability is fixed at construction.
    pub struct FakeTransport {
        pub kind: TransportKind,
        pub name: String,
        pub available: bool,
    }

    impl FakeTransport {
        pub fn new(kind: TransportKind, name: &str, available: bool) -> Arc<dyn Transport> {
            Arc::new(Self {
                kind,
                name: name.to_string(),
                available,
            })
        }
    }

    impl Transport for FakeTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn probe(&self) -> Result<(), ProbeError> {
            if self.available {
                Ok(())
            } else {
                Err(ProbeError::unavailable(format!("{} switched off", self.name)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeTransport;
    use super::*;

    fn epoll_up() -> Result<Arc<dyn Transport>, ProbeError> {
        Ok(FakeTransport::new(TransportKind::NativeEpoll, "fake-epoll", true))
    }

    fn epoll_down() -> Result<Arc<dyn Transport>, ProbeError> {
        Ok(FakeTransport::new(TransportKind::NativeEpoll, "fake-epoll", false))
    }

    fn epoll_missing() -> Result<Arc<dyn Transport>, ProbeError> {
        Err(ProbeError::unavailable("library not found"))
    }

    fn kqueue_up() -> Result<Arc<dyn Transport>, ProbeError> {
        Ok(FakeTransport::new(TransportKind::NativeKqueue, "fake-kqueue", true))
    }

    fn kqueue_down() -> Result<Arc<dyn Transport>, ProbeError> {
        Ok(FakeTransport::new(TransportKind::NativeKqueue, "fake-kqueue", false))
    }

    fn kqueue_panics() -> Result<Arc<dyn Transport>, ProbeError> {
        panic!("kqueue symbols missing")
    }

    const EPOLL_VARIANTS: [TransportLoader; 3] = [epoll_up, epoll_down, epoll_missing];
    const KQUEUE_VARIANTS: [TransportLoader; 3] = [kqueue_up, kqueue_down, kqueue_panics];

    #[test]
    fn test_never_returns_unavailable_transport() {
        for epoll in EPOLL_VARIANTS {
            for kqueue in KQUEUE_VARIANTS {
                for registered in [None, Some(false), Some(true)] {
                    let loaders = [epoll, kqueue];
                    let discover = || match registered {
                        Some(up) => vec![FakeTransport::new(TransportKind::NativeEpoll, "registered", up)],
                        None => Vec::new(),
                    };
                    let selected = select_with(true, None, discover, &loaders);
                    assert!(selected.is_available(), "selected {} while unavailable", selected.name());
                }
            }
        }
    }

    #[test]
    fn test_portable_when_native_not_preferred() {
        for epoll in EPOLL_VARIANTS {
            for kqueue in KQUEUE_VARIANTS {
                let loaders = [epoll, kqueue];
                let discover = || vec![FakeTransport::new(TransportKind::NativeEpoll, "registered", true)];
                let selected = select_with(false, None, discover, &loaders);
                assert_eq!(selected.kind(), TransportKind::PortableFallback);
            }
        }
    }

    #[test]
    fn test_explicit_transport_used_verbatim() {
        let explicit = FakeTransport::new(TransportKind::NativeKqueue, "pinned", false);
        let selected = select_with(
            true,
            Some(explicit),
            || panic!("discovery must not run"),
            &[epoll_up],
        );
        assert_eq!(selected.name(), "pinned");
        assert!(!selected.is_available());
    }

    #[test]
    fn test_registered_transport_wins_over_builtin() {
        let discover = || {
            vec![
                FakeTransport::new(TransportKind::NativeEpoll, "first-down", false),
                FakeTransport::new(TransportKind::NativeEpoll, "second-up", true),
            ]
        };
        let selected = select_with(true, None, discover, &[epoll_up]);
        assert_eq!(selected.name(), "second-up");
    }

    #[test]
    fn test_builtin_preference_order() {
        let selected = select_with(true, None, Vec::new, &[epoll_up, kqueue_up]);
        assert_eq!(selected.kind(), TransportKind::NativeEpoll);

        let selected = select_with(true, None, Vec::new, &[epoll_down, kqueue_up]);
        assert_eq!(selected.kind(), TransportKind::NativeKqueue);

        let selected = select_with(true, None, Vec::new, &[epoll_missing, kqueue_down]);
        assert_eq!(selected.kind(), TransportKind::PortableFallback);
    }

    #[test]
    fn test_native_transport_reports_unavailable_candidate() {
        let found = native_transport_from(&[epoll_missing, kqueue_down]).unwrap();
        assert_eq!(found.name(), "fake-kqueue");
        assert!(!found.is_available());

        assert!(native_transport_from(&[epoll_missing, kqueue_panics]).is_none());
    }

    #[test]
    fn test_panicking_loader_is_contained() {
        let err = load_isolated(kqueue_panics).unwrap_err();
        assert_eq!(err.reason(), "kqueue symbols missing");
    }

    #[test]
    fn test_host_selection_is_usable() {
        let registry = ProviderRegistry::new();
        let selected = select_transport(true, None, &registry);
        assert!(selected.is_available());
    }
}
