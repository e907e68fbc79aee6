//! Strand Core - Bootstrap of an Event-Driven Runtime
//!
//! This crate assembles a runtime out of pluggable capabilities: it negotiates
//! the I/O transport, discovers providers for metrics, tracing, clustering,
//! file resolution and thread creation, and starts the event loops, the
//! worker pool and the blocked thread watchdog.
//!
//! # Entry Point:
//! ```no_run
//! use strand_core::{RuntimeBootstrap, RuntimeOptions};
//!
//! # fn main() -> Result<(), strand_core::BootstrapError> {
//! let runtime = RuntimeBootstrap::new()
//!     .options(RuntimeOptions::default().with_prefer_native_transport(true))
//!     .build_runtime()?;
//! runtime.run_on_loop(|| println!("hello from an event loop")).ok();
//! runtime.close();
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod cluster;
pub mod error;
pub mod executor;
pub mod file_resolver;
pub mod metrics;
pub mod options;
pub mod provider;
pub mod runtime;
pub mod thread;
pub mod tracer;
pub mod transport;

pub use bootstrap::{Bindings, ClusterJoin, RuntimeBootstrap, SlotOrigin};
pub use cluster::{ClusterManager, DefaultNodeSelector, NodeSelector};
pub use error::{BootstrapError, ProbeError};
pub use executor::{DefaultExecutorFactory, ExecutorService, ExecutorServiceFactory, PoolConfig};
pub use file_resolver::{DefaultFileResolver, FileResolver};
pub use metrics::{CountersProvider, RuntimeCounters, RuntimeMetrics};
pub use options::RuntimeOptions;
pub use provider::{ActivationContext, Binding, ProviderKind, ProviderRegistry, ServiceProvider};
pub use runtime::RuntimeInstance;
pub use thread::{
    BlockedThread, BlockedThreadChecker, DefaultThreadFactory, ExecBudget, ThreadDescriptor,
    ThreadFactory, ThreadRole,
};
pub use tracer::Tracer;
pub use transport::{select_transport, PortableTransport, Transport, TransportKind};

use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// The filter comes from `RUST_LOG` and defaults to `info`. Does nothing if a
/// subscriber is already installed.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
