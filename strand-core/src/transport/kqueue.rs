//! kqueue-based readiness notification (macOS and the BSDs).

use std::sync::Arc;

use super::{Transport, TransportKind};
use crate::error::ProbeError;

pub struct KqueueTransport {
    availability: Result<(), ProbeError>,
}

impl KqueueTransport {
    pub fn new() -> Result<Self, ProbeError> {
        load_native()?;
        Ok(Self {
            availability: probe_kqueue(),
        })
    }
}

impl Transport for KqueueTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::NativeKqueue
    }

    fn name(&self) -> &str {
        "kqueue"
    }

    fn probe(&self) -> Result<(), ProbeError> {
        self.availability.clone()
    }
}

/// [`super::TransportLoader`] for the built-in kqueue transport.
pub fn load() -> Result<Arc<dyn Transport>, ProbeError> {
    Ok(Arc::new(KqueueTransport::new()?))
}

#[cfg(feature = "native-transport")]
fn load_native() -> Result<(), ProbeError> {
    Ok(())
}

#[cfg(all(
    feature = "native-transport",
    any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    )
))]
fn probe_kqueue() -> Result<(), ProbeError> {
    // SAFETY: kqueue() takes no arguments; the descriptor is closed right away.
    let fd = unsafe { libc::kqueue() };
    if fd < 0 {
        let err = std::io::Error::last_os_error();
        return Err(ProbeError::unavailable(format!("kqueue failed: {err}")));
    }
    unsafe {
        libc::close(fd);
    }
    Ok(())
}

#[cfg(all(
    feature = "native-transport",
    not(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))
))]
fn probe_kqueue() -> Result<(), ProbeError> {
    Err(ProbeError::unavailable("kqueue requires a BSD or Darwin kernel"))
}

#[cfg(not(feature = "native-transport"))]
fn load_native() -> Result<(), ProbeError> {
    Err(ProbeError::unavailable(
        "native transport support is not enabled; build with the `native-transport` feature",
    ))
}

#[cfg(not(feature = "native-transport"))]
fn probe_kqueue() -> Result<(), ProbeError> {
    Err(ProbeError::unavailable("native transport support is not enabled"))
}
