//! Provider Registry - Discovery of Pluggable Capabilities
//!
//! Optional subsystems (metrics, tracing, clustering, file resolution,
//! thread and executor factories, transports) are contributed by providers
//! registered in a [`ProviderRegistry`]. The registry is an explicit,
//! append-only registration table: there is no classpath scanning and no
//! reflection. Discovery simply enumerates what was registered, in
//! registration order.
//!
//! # Activation:
//! The bootstrap asks each discovered [`ServiceProvider`] to activate, one at
//! a time, in discovery order. A provider answers with at most one
//! [`Binding`], which the bootstrap stores in the slot of that capability.
//! Metrics and tracing providers sit behind activation gates; see
//! [`activation_gate`].
//!
//! # Isolation:
//! Tests and embedders can create their own registry with
//! [`ProviderRegistry::new`]. [`ProviderRegistry::global`] is the
//! process-wide instance the bootstrap uses by default.

use anyhow::Result;
use parking_lot::RwLock;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::cluster::{ClusterManager, NodeSelector};
use crate::executor::ExecutorServiceFactory;
use crate::file_resolver::FileResolver;
use crate::metrics::RuntimeMetrics;
use crate::options::RuntimeOptions;
use crate::thread::ThreadFactory;
use crate::tracer::Tracer;
use crate::transport::Transport;

/// The capability a provider contributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Metrics,
    Tracing,
    ClusterManager,
    NodeSelector,
    FileResolver,
    ThreadFactory,
    ExecutorFactory,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Metrics => "metrics",
            Self::Tracing => "tracing",
            Self::ClusterManager => "cluster-manager",
            Self::NodeSelector => "node-selector",
            Self::FileResolver => "file-resolver",
            Self::ThreadFactory => "thread-factory",
            Self::ExecutorFactory => "executor-factory",
        };
        f.write_str(name)
    }
}

/// A value a provider binds into one bootstrap slot.
#[derive(Clone)]
pub enum Binding {
    Metrics(Arc<dyn RuntimeMetrics>),
    Tracer(Arc<dyn Tracer>),
    ClusterManager(Arc<dyn ClusterManager>),
    NodeSelector(Arc<dyn NodeSelector>),
    FileResolver(Arc<dyn FileResolver>),
    ThreadFactory(Arc<dyn ThreadFactory>),
    ExecutorFactory(Arc<dyn ExecutorServiceFactory>),
}

impl Binding {
    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Metrics(_) => ProviderKind::Metrics,
            Self::Tracer(_) => ProviderKind::Tracing,
            Self::ClusterManager(_) => ProviderKind::ClusterManager,
            Self::NodeSelector(_) => ProviderKind::NodeSelector,
            Self::FileResolver(_) => ProviderKind::FileResolver,
            Self::ThreadFactory(_) => ProviderKind::ThreadFactory,
            Self::ExecutorFactory(_) => ProviderKind::ExecutorFactory,
        }
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Binding({})", self.kind())
    }
}

/// What a provider may look at while activating.
#[derive(Debug, Clone, Copy)]
pub struct ActivationContext<'a> {
    pub options: &'a RuntimeOptions,
    /// Free-form configuration passed alongside the options, if any.
    pub config: Option<&'a Value>,
}

/// A discoverable implementation of one capability.
pub trait ServiceProvider: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    /// Produce the binding for this provider's capability, or `None` to
    /// decline. An error marks the provider unavailable; the bootstrap skips
    /// it and carries on.
    fn activate(&self, ctx: &ActivationContext<'_>) -> Result<Option<Binding>>;
}

/// Whether providers of `kind` may activate under `options`.
///
/// - metrics providers need metrics enabled
/// - tracing providers need tracing options present
/// - everything else activates unconditionally
pub fn activation_gate(kind: ProviderKind, options: &RuntimeOptions) -> bool {
    match kind {
        ProviderKind::Metrics => options.metrics_enabled(),
        ProviderKind::Tracing => options.tracing_configured(),
        _ => true,
    }
}

#[derive(Default)]
struct Tables {
    providers: Vec<Arc<dyn ServiceProvider>>,
    transports: Vec<Arc<dyn Transport>>,
}

/// A capability type that can be enumerated from a [`ProviderRegistry`].
pub trait Discoverable: Send + Sync + 'static {
    /// Identifier used in logs.
    const CAPABILITY: &'static str;

    fn discover_in(registry: &ProviderRegistry) -> Vec<Arc<Self>>;
}

impl Discoverable for dyn ServiceProvider {
    const CAPABILITY: &'static str = "service-provider";

    fn discover_in(registry: &ProviderRegistry) -> Vec<Arc<Self>> {
        registry.tables.read().providers.clone()
    }
}

impl Discoverable for dyn Transport {
    const CAPABILITY: &'static str = "transport";

    fn discover_in(registry: &ProviderRegistry) -> Vec<Arc<Self>> {
        registry.tables.read().transports.clone()
    }
}

/// Append-only table of registered capability implementations.
///
/// Clones share the same table.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    tables: Arc<RwLock<Tables>>,
}

impl ProviderRegistry {
    /// Create an empty, isolated registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static ProviderRegistry {
        static GLOBAL: OnceLock<ProviderRegistry> = OnceLock::new();
        GLOBAL.get_or_init(ProviderRegistry::new)
    }

    pub fn register_provider(&self, provider: Arc<dyn ServiceProvider>) -> &Self {
        debug!(provider = provider.name(), kind = %provider.kind(), "Registered service provider");
        self.tables.write().providers.push(provider);
        self
    }

    pub fn register_transport(&self, transport: Arc<dyn Transport>) -> &Self {
        debug!(transport = transport.name(), "Registered transport");
        self.tables.write().transports.push(transport);
        self
    }

    /// Every registered implementation of `C`, in registration order.
    ///
    /// Each call takes a fresh snapshot, so enumeration can be restarted at
    /// any time and later registrations show up in later calls.
    pub fn discover<C: Discoverable + ?Sized>(&self) -> Vec<Arc<C>> {
        let found = C::discover_in(self);
        debug!(capability = C::CAPABILITY, count = found.len(), "Discovered implementations");
        found
    }

    pub fn is_empty(&self) -> bool {
        let tables = self.tables.read();
        tables.providers.is_empty() && tables.transports.is_empty()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tables = self.tables.read();
        f.debug_struct("ProviderRegistry")
            .field("providers", &tables.providers.len())
            .field("transports", &tables.transports.len())
            .finish()
    }
}
