//! Runtime Bootstrap - Assembling a Runtime From Providers
//!
//! [`RuntimeBootstrap`] collects explicit overrides, discovers providers for
//! everything left open, fills in defaults and builds a [`RuntimeInstance`].
//!
//! # Resolution Order:
//! 1. Transport: explicit, else negotiated (see [`select_transport`])
//! 2. Metrics: explicit instance, else an explicit factory behind the gate
//! 3. Tracer: same as metrics
//! 4. Discovered providers, in registration order, for every slot that was
//!    not set explicitly
//! 5. Thread factory, executor factory and file resolver defaults
//!
//! Resolution runs once per bootstrap; later calls return the same bindings.
//!
//! # Precedence:
//! A slot set explicitly is never replaced, and providers of its kind are not
//! activated at all. Among discovered providers of one kind the last one to
//! bind wins, with a warning.

use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::cluster::{ClusterManager, DefaultNodeSelector, NodeSelector};
use crate::error::BootstrapError;
use crate::executor::{DefaultExecutorFactory, ExecutorServiceFactory};
use crate::file_resolver::{DefaultFileResolver, FileResolver};
use crate::metrics::RuntimeMetrics;
use crate::options::RuntimeOptions;
use crate::provider::{
    activation_gate, ActivationContext, Binding, ProviderKind, ProviderRegistry, ServiceProvider,
};
use crate::runtime::{ClusterBinding, RuntimeInstance};
use crate::thread::{BlockedThreadHandler, DefaultThreadFactory, ThreadFactory};
use crate::tracer::Tracer;
use crate::transport::{select_transport, PortableTransport, Transport};

/// Pending clustered runtime. Resolves once the cluster has been joined.
pub type ClusterJoin = BoxFuture<'static, Result<Arc<RuntimeInstance>, BootstrapError>>;

/// Where the value in a slot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOrigin {
    Explicit,
    Discovered,
    Default,
}

struct Slot<T: ?Sized> {
    value: Option<Arc<T>>,
    origin: SlotOrigin,
}

impl<T: ?Sized> Default for Slot<T> {
    fn default() -> Self {
        Self {
            value: None,
            origin: SlotOrigin::Default,
        }
    }
}

impl<T: ?Sized> Slot<T> {
    fn is_bound(&self) -> bool {
        self.value.is_some()
    }

    fn is_explicit(&self) -> bool {
        self.is_bound() && self.origin == SlotOrigin::Explicit
    }

    fn get(&self) -> Option<Arc<T>> {
        self.value.clone()
    }

    /// Store `value`; returns true when an earlier value was replaced.
    fn bind(&mut self, value: Arc<T>, origin: SlotOrigin) -> bool {
        let replaced = self.value.replace(value).is_some();
        self.origin = origin;
        replaced
    }

    fn bind_default(&mut self, make: impl FnOnce() -> Arc<T>) {
        if self.value.is_none() {
            self.value = Some(make());
            self.origin = SlotOrigin::Default;
        }
    }
}

/// The resolved value of every slot.
#[derive(Clone)]
pub struct Bindings {
    pub transport: Arc<dyn Transport>,
    pub metrics: Option<Arc<dyn RuntimeMetrics>>,
    pub tracer: Option<Arc<dyn Tracer>>,
    pub cluster_manager: Option<Arc<dyn ClusterManager>>,
    pub node_selector: Option<Arc<dyn NodeSelector>>,
    pub thread_factory: Arc<dyn ThreadFactory>,
    pub executor_factory: Arc<dyn ExecutorServiceFactory>,
    pub file_resolver: Arc<dyn FileResolver>,
}

impl fmt::Debug for Bindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bindings")
            .field("transport", &self.transport.name())
            .field("metrics", &self.metrics.as_ref().map(|m| m.name().to_string()))
            .field("tracer", &self.tracer.as_ref().map(|t| t.name().to_string()))
            .field(
                "cluster_manager",
                &self.cluster_manager.as_ref().map(|c| c.name().to_string()),
            )
            .field(
                "node_selector",
                &self.node_selector.as_ref().map(|s| s.name().to_string()),
            )
            .finish_non_exhaustive()
    }
}

/// Builder for standalone and clustered runtimes.
pub struct RuntimeBootstrap {
    options: RuntimeOptions,
    config: Option<Value>,
    registry: ProviderRegistry,
    transport: Option<Arc<dyn Transport>>,
    metrics_factory: Option<Arc<dyn ServiceProvider>>,
    tracer_factory: Option<Arc<dyn ServiceProvider>>,
    metrics: Slot<dyn RuntimeMetrics>,
    tracer: Slot<dyn Tracer>,
    cluster_manager: Slot<dyn ClusterManager>,
    node_selector: Slot<dyn NodeSelector>,
    thread_factory: Slot<dyn ThreadFactory>,
    executor_factory: Slot<dyn ExecutorServiceFactory>,
    file_resolver: Slot<dyn FileResolver>,
    blocked_thread_handler: Option<BlockedThreadHandler>,
    resolved: bool,
}

impl Default for RuntimeBootstrap {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeBootstrap {
    /// A bootstrap with default options, discovering from the global registry.
    pub fn new() -> Self {
        Self {
            options: RuntimeOptions::default(),
            config: None,
            registry: ProviderRegistry::global().clone(),
            transport: None,
            metrics_factory: None,
            tracer_factory: None,
            metrics: Slot::default(),
            tracer: Slot::default(),
            cluster_manager: Slot::default(),
            node_selector: Slot::default(),
            thread_factory: Slot::default(),
            executor_factory: Slot::default(),
            file_resolver: Slot::default(),
            blocked_thread_handler: None,
            resolved: false,
        }
    }

    pub fn options(mut self, options: RuntimeOptions) -> Self {
        self.options = options;
        self
    }

    /// Free-form configuration handed to providers while they activate.
    pub fn config(mut self, config: Value) -> Self {
        self.config = Some(config);
        self
    }

    /// Discover providers from `registry` instead of the global one.
    pub fn registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn RuntimeMetrics>) -> Self {
        self.metrics.bind(metrics, SlotOrigin::Explicit);
        self
    }

    /// A metrics provider to use instead of discovery. Still gated on
    /// metrics being enabled.
    pub fn metrics_factory(mut self, factory: Arc<dyn ServiceProvider>) -> Self {
        self.metrics_factory = Some(factory);
        self
    }

    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer.bind(tracer, SlotOrigin::Explicit);
        self
    }

    /// A tracing provider to use instead of discovery. Still gated on
    /// tracing being configured.
    pub fn tracer_factory(mut self, factory: Arc<dyn ServiceProvider>) -> Self {
        self.tracer_factory = Some(factory);
        self
    }

    pub fn cluster_manager(mut self, cluster_manager: Arc<dyn ClusterManager>) -> Self {
        self.cluster_manager.bind(cluster_manager, SlotOrigin::Explicit);
        self
    }

    pub fn node_selector(mut self, node_selector: Arc<dyn NodeSelector>) -> Self {
        self.node_selector.bind(node_selector, SlotOrigin::Explicit);
        self
    }

    pub fn thread_factory(mut self, thread_factory: Arc<dyn ThreadFactory>) -> Self {
        self.thread_factory.bind(thread_factory, SlotOrigin::Explicit);
        self
    }

    pub fn executor_factory(mut self, executor_factory: Arc<dyn ExecutorServiceFactory>) -> Self {
        self.executor_factory.bind(executor_factory, SlotOrigin::Explicit);
        self
    }

    pub fn file_resolver(mut self, file_resolver: Arc<dyn FileResolver>) -> Self {
        self.file_resolver.bind(file_resolver, SlotOrigin::Explicit);
        self
    }

    /// Called for every blocked thread report, after the metrics hook.
    pub fn blocked_thread_handler(mut self, handler: BlockedThreadHandler) -> Self {
        self.blocked_thread_handler = Some(handler);
        self
    }

    /// Where the current value of the slot for `kind` came from, or `None`
    /// if the slot is empty.
    pub fn origin(&self, kind: ProviderKind) -> Option<SlotOrigin> {
        let (bound, origin) = match kind {
            ProviderKind::Metrics => (self.metrics.is_bound(), self.metrics.origin),
            ProviderKind::Tracing => (self.tracer.is_bound(), self.tracer.origin),
            ProviderKind::ClusterManager => {
                (self.cluster_manager.is_bound(), self.cluster_manager.origin)
            }
            ProviderKind::NodeSelector => (self.node_selector.is_bound(), self.node_selector.origin),
            ProviderKind::FileResolver => (self.file_resolver.is_bound(), self.file_resolver.origin),
            ProviderKind::ThreadFactory => {
                (self.thread_factory.is_bound(), self.thread_factory.origin)
            }
            ProviderKind::ExecutorFactory => {
                (self.executor_factory.is_bound(), self.executor_factory.origin)
            }
        };
        bound.then_some(origin)
    }

    /// Resolve every slot. Runs the resolution sequence on the first call
    /// only; later calls return the bindings from that first run.
    pub fn resolve(&mut self) -> Result<Bindings, BootstrapError> {
        if !self.resolved {
            self.options.validate()?;
            let transport = select_transport(
                self.options.prefer_native_transport,
                self.transport.take(),
                &self.registry,
            );
            self.transport = Some(transport);
            self.init_metrics();
            self.init_tracer();
            self.init_providers();
            self.thread_factory.bind_default(|| Arc::new(DefaultThreadFactory));
            self.executor_factory.bind_default(|| Arc::new(DefaultExecutorFactory));
            let file_system = self.options.file_system.clone();
            self.file_resolver
                .bind_default(|| Arc::new(DefaultFileResolver::new(&file_system)));
            self.resolved = true;
        }
        Ok(self.bindings())
    }

    fn bindings(&self) -> Bindings {
        Bindings {
            transport: self.transport.clone().unwrap_or_else(PortableTransport::shared),
            metrics: self.metrics.get(),
            tracer: self.tracer.get(),
            cluster_manager: self.cluster_manager.get(),
            node_selector: self.node_selector.get(),
            thread_factory: self
                .thread_factory
                .get()
                .unwrap_or_else(|| Arc::new(DefaultThreadFactory)),
            executor_factory: self
                .executor_factory
                .get()
                .unwrap_or_else(|| Arc::new(DefaultExecutorFactory)),
            file_resolver: self
                .file_resolver
                .get()
                .unwrap_or_else(|| Arc::new(DefaultFileResolver::new(&self.options.file_system))),
        }
    }

    fn init_metrics(&mut self) {
        if self.metrics.is_bound() {
            return;
        }
        if let Some(factory) = self.metrics_factory.clone() {
            self.activate_factory(factory, ProviderKind::Metrics);
        }
    }

    fn init_tracer(&mut self) {
        if self.tracer.is_bound() {
            return;
        }
        if let Some(factory) = self.tracer_factory.clone() {
            self.activate_factory(factory, ProviderKind::Tracing);
        }
    }

    /// Activate an explicitly supplied factory. Its binding counts as
    /// explicit, so discovery leaves the slot alone afterwards.
    fn activate_factory(&mut self, factory: Arc<dyn ServiceProvider>, expected: ProviderKind) {
        if factory.kind() != expected {
            warn!(
                provider = factory.name(),
                kind = %factory.kind(),
                %expected,
                "Explicit factory has the wrong kind, ignoring it"
            );
            return;
        }
        if !activation_gate(expected, &self.options) {
            debug!(provider = factory.name(), kind = %expected, "Activation gate closed");
            return;
        }
        if let Some(binding) = self.activate(factory.as_ref()) {
            self.apply(factory.name(), binding, SlotOrigin::Explicit);
        }
    }

    fn init_providers(&mut self) {
        for provider in self.registry.discover::<dyn ServiceProvider>() {
            let kind = provider.kind();
            if self.is_explicit(kind) {
                debug!(provider = provider.name(), %kind, "Slot set explicitly, skipping provider");
                continue;
            }
            if !activation_gate(kind, &self.options) {
                debug!(provider = provider.name(), %kind, "Activation gate closed");
                continue;
            }
            let Some(binding) = self.activate(provider.as_ref()) else {
                continue;
            };
            if binding.kind() != kind {
                warn!(
                    provider = provider.name(),
                    declared = %kind,
                    bound = %binding.kind(),
                    "Provider returned a binding of another kind, discarding it"
                );
                continue;
            }
            self.apply(provider.name(), binding, SlotOrigin::Discovered);
        }
    }

    fn activate(&self, provider: &dyn ServiceProvider) -> Option<Binding> {
        let ctx = ActivationContext {
            options: &self.options,
            config: self.config.as_ref(),
        };
        match provider.activate(&ctx) {
            Ok(Some(binding)) => Some(binding),
            Ok(None) => {
                debug!(provider = provider.name(), "Provider declined to activate");
                None
            }
            Err(e) => {
                warn!(provider = provider.name(), error = %e, "Provider unavailable, skipping");
                None
            }
        }
    }

    fn is_explicit(&self, kind: ProviderKind) -> bool {
        self.origin(kind) == Some(SlotOrigin::Explicit)
    }

    fn apply(&mut self, provider: &str, binding: Binding, origin: SlotOrigin) {
        let kind = binding.kind();
        let replaced = match binding {
            Binding::Metrics(v) => self.metrics.bind(v, origin),
            Binding::Tracer(v) => self.tracer.bind(v, origin),
            Binding::ClusterManager(v) => self.cluster_manager.bind(v, origin),
            Binding::NodeSelector(v) => self.node_selector.bind(v, origin),
            Binding::FileResolver(v) => self.file_resolver.bind(v, origin),
            Binding::ThreadFactory(v) => self.thread_factory.bind(v, origin),
            Binding::ExecutorFactory(v) => self.executor_factory.bind(v, origin),
        };
        if replaced {
            warn!(%provider, %kind, "Provider replaced an earlier binding");
        } else {
            debug!(%provider, %kind, "Provider bound");
        }
    }

    fn check_observability(&self) {
        if self.options.metrics_enabled() && !self.metrics.is_bound() {
            warn!("Metrics are enabled but no metrics provider is bound");
        }
        if self.options.tracing_configured() && !self.tracer.is_bound() {
            warn!("Tracing is configured but no tracer is bound");
        }
    }

    /// Build a standalone runtime.
    pub fn build_runtime(mut self) -> Result<Arc<RuntimeInstance>, BootstrapError> {
        let started = Instant::now();
        let bindings = self.resolve()?;
        self.check_observability();
        RuntimeInstance::start(
            Arc::new(self.options),
            bindings,
            None,
            self.blocked_thread_handler,
            started,
        )
    }

    /// Build a clustered runtime.
    ///
    /// Fails right away with [`BootstrapError::Configuration`] when no
    /// cluster manager is bound; no cluster call is made in that case.
    /// Otherwise the runtime is started and the returned future joins the
    /// cluster. If the join fails the runtime is closed and the future
    /// resolves to [`BootstrapError::ClusterJoin`].
    ///
    /// The future only awaits the cluster manager, so any executor can drive
    /// it. There is no built-in timeout: wrap it if the join must be bounded.
    pub fn build_clustered_runtime(mut self) -> Result<ClusterJoin, BootstrapError> {
        let started = Instant::now();
        let bindings = self.resolve()?;
        self.check_observability();

        let Some(cluster_manager) = bindings.cluster_manager.clone() else {
            return Err(BootstrapError::configuration(
                "clustered runtime requested but no cluster manager is bound",
            ));
        };
        let node_selector = bindings.node_selector.clone().unwrap_or_else(|| {
            debug!("No node selector bound, using the default selector");
            Arc::new(DefaultNodeSelector::new())
        });

        let runtime = RuntimeInstance::start(
            Arc::new(self.options),
            bindings,
            Some(ClusterBinding {
                cluster_manager,
                node_selector,
            }),
            self.blocked_thread_handler,
            started,
        )?;

        Ok(Box::pin(async move {
            match runtime.join_cluster().await {
                Ok(()) => Ok(runtime),
                Err(e) => {
                    warn!(error = %e, "Cluster join failed, closing runtime");
                    runtime.close();
                    Err(BootstrapError::ClusterJoin(e))
                }
            }
        }))
    }
}
