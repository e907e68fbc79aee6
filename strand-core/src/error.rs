//! Error types surfaced by bootstrap and transport probing.
//!
//! Probe and provider failures stay local: they are turned into "unavailable"
//! and logged. Only configuration problems, thread start failures and cluster
//! join failures ever reach the caller.

use std::io;
use thiserror::Error;

/// Fatal bootstrap failures.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// The requested runtime cannot be assembled from the current settings.
    ///
    /// Raised synchronously, before any thread is started or any cluster
    /// call is made.
    #[error("invalid runtime configuration: {0}")]
    Configuration(String),

    /// Rendezvous with the cluster failed. Terminal for this bootstrap
    /// attempt; the half-built runtime has already been closed.
    #[error("failed to join cluster")]
    ClusterJoin(#[source] anyhow::Error),

    /// A runtime-owned thread could not be spawned.
    #[error("failed to start runtime thread '{name}'")]
    ThreadSpawn {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The bound executor factory could not create the worker pool.
    #[error("failed to create worker pool")]
    WorkerPool(#[source] anyhow::Error),
}

impl BootstrapError {
    pub(crate) fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

/// Result of an availability probe that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl ProbeError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable(reason.into())
    }

    /// The human readable reason carried by the probe failure.
    pub fn reason(&self) -> &str {
        match self {
            Self::Unavailable(reason) => reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_message() {
        let err = BootstrapError::configuration("no cluster manager bound");
        assert_eq!(
            err.to_string(),
            "invalid runtime configuration: no cluster manager bound"
        );
    }

    #[test]
    fn test_cluster_join_keeps_source() {
        let err = BootstrapError::ClusterJoin(anyhow::anyhow!("membership conflict"));
        let source = std::error::Error::source(&err).expect("source");
        assert_eq!(source.to_string(), "membership conflict");
    }

    #[test]
    fn test_probe_reason() {
        let err = ProbeError::unavailable("kqueue requires a BSD kernel");
        assert_eq!(err.reason(), "kqueue requires a BSD kernel");
        assert_eq!(err.to_string(), "unavailable: kqueue requires a BSD kernel");
    }
}
