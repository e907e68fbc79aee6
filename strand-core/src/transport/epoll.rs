//! epoll-based readiness notification (Linux).
//!
//! The transport is probed once at load time by creating and closing an
//! epoll instance. Kernels built without epoll, seccomp profiles that deny
//! `epoll_create1`, or builds without the `native-transport` feature all
//! surface as an unavailable transport rather than an error.

use std::sync::Arc;

use super::{Transport, TransportKind};
use crate::error::ProbeError;

pub struct EpollTransport {
    availability: Result<(), ProbeError>,
}

impl EpollTransport {
    /// Load the transport and record whether epoll works on this host.
    pub fn new() -> Result<Self, ProbeError> {
        load_native()?;
        Ok(Self {
            availability: probe_epoll(),
        })
    }
}

impl Transport for EpollTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::NativeEpoll
    }

    fn name(&self) -> &str {
        "epoll"
    }

    fn probe(&self) -> Result<(), ProbeError> {
        self.availability.clone()
    }
}

/// [`super::TransportLoader`] for the built-in epoll transport.
pub fn load() -> Result<Arc<dyn Transport>, ProbeError> {
    Ok(Arc::new(EpollTransport::new()?))
}

// ── Real implementation (feature = "native-transport") ───────────────

#[cfg(feature = "native-transport")]
fn load_native() -> Result<(), ProbeError> {
    Ok(())
}

#[cfg(all(feature = "native-transport", any(target_os = "linux", target_os = "android")))]
fn probe_epoll() -> Result<(), ProbeError> {
    // SAFETY: epoll_create1 has no memory preconditions; the descriptor is
    // closed immediately and never shared.
    let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    if fd < 0 {
        let err = std::io::Error::last_os_error();
        return Err(ProbeError::unavailable(format!("epoll_create1 failed: {err}")));
    }
    unsafe {
        libc::close(fd);
    }
    Ok(())
}

#[cfg(all(feature = "native-transport", not(any(target_os = "linux", target_os = "android"))))]
fn probe_epoll() -> Result<(), ProbeError> {
    Err(ProbeError::unavailable("epoll requires a Linux kernel"))
}

// ── Stub implementation (feature = "native-transport" NOT enabled) ───

#[cfg(not(feature = "native-transport"))]
fn load_native() -> Result<(), ProbeError> {
    Err(ProbeError::unavailable(
        "native transport support is not enabled; build with the `native-transport` feature",
    ))
}

#[cfg(not(feature = "native-transport"))]
fn probe_epoll() -> Result<(), ProbeError> {
    Err(ProbeError::unavailable("native transport support is not enabled"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(all(feature = "native-transport", target_os = "linux"))]
    #[test]
    fn test_epoll_available_on_linux() {
        let transport = EpollTransport::new().unwrap();
        assert_eq!(transport.kind(), TransportKind::NativeEpoll);
        assert!(transport.is_available());
    }

    #[cfg(all(feature = "native-transport", not(any(target_os = "linux", target_os = "android"))))]
    #[test]
    fn test_epoll_unavailable_elsewhere() {
        let transport = EpollTransport::new().unwrap();
        assert!(!transport.is_available());
    }

    #[cfg(not(feature = "native-transport"))]
    #[test]
    fn test_stub_fails_to_load() {
        assert!(load().is_err());
    }
}
