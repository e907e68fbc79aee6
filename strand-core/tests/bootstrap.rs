//! End-to-end bootstrap scenarios: standalone and clustered runtimes built
//! from an isolated provider registry.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use strand_core::thread::{RuntimeThread, Task};
use strand_core::{
    ActivationContext, Binding, BootstrapError, ClusterManager, DefaultNodeSelector, NodeSelector,
    ProbeError, ProviderKind, ProviderRegistry, RuntimeBootstrap, RuntimeOptions, ServiceProvider,
    ThreadDescriptor, ThreadFactory, ThreadRole, Transport, TransportKind,
};

#[derive(Default)]
struct ScriptedCluster {
    fail_join: bool,
    joins: AtomicUsize,
    leaves: AtomicUsize,
}

#[async_trait]
impl ClusterManager for ScriptedCluster {
    fn name(&self) -> &str {
        "scripted"
    }

    fn node_id(&self) -> String {
        "node-a".to_string()
    }

    fn nodes(&self) -> Vec<String> {
        vec!["node-a".to_string(), "node-b".to_string()]
    }

    async fn join(&self) -> Result<()> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        if self.fail_join {
            anyhow::bail!("no quorum");
        }
        Ok(())
    }

    async fn leave(&self) -> Result<()> {
        self.leaves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct ClusterProvider(Arc<ScriptedCluster>);

impl ServiceProvider for ClusterProvider {
    fn name(&self) -> &str {
        "scripted-cluster"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::ClusterManager
    }

    fn activate(&self, _ctx: &ActivationContext<'_>) -> Result<Option<Binding>> {
        Ok(Some(Binding::ClusterManager(self.0.clone())))
    }
}

struct FixedSelector;

impl NodeSelector for FixedSelector {
    fn name(&self) -> &str {
        "fixed"
    }

    fn init(&self, _cluster_manager: Arc<dyn ClusterManager>) {}

    fn select_for_send(&self, _address: &str) -> Option<String> {
        Some("node-b".to_string())
    }

    fn select_for_publish(&self, _address: &str) -> Vec<String> {
        vec!["node-b".to_string()]
    }
}

struct SelectorProvider;

impl ServiceProvider for SelectorProvider {
    fn name(&self) -> &str {
        "fixed-selector"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::NodeSelector
    }

    fn activate(&self, _ctx: &ActivationContext<'_>) -> Result<Option<Binding>> {
        Ok(Some(Binding::NodeSelector(Arc::new(FixedSelector))))
    }
}

struct UnavailableNative;

impl Transport for UnavailableNative {
    fn kind(&self) -> TransportKind {
        TransportKind::NativeEpoll
    }

    fn name(&self) -> &str {
        "registered-epoll"
    }

    fn probe(&self) -> Result<(), ProbeError> {
        Err(ProbeError::unavailable("disabled for this test"))
    }
}

/// Records every thread it is asked for, then spawns it normally.
#[derive(Default)]
struct RecordingThreadFactory {
    created: Mutex<Vec<(String, ThreadRole)>>,
}

impl ThreadFactory for RecordingThreadFactory {
    fn new_thread(&self, task: Task, descriptor: ThreadDescriptor) -> io::Result<RuntimeThread> {
        self.created
            .lock()
            .push((descriptor.name().to_string(), descriptor.role()));
        RuntimeThread::spawn(task, descriptor)
    }
}

fn small_options() -> RuntimeOptions {
    RuntimeOptions::default()
        .with_event_loop_pool_size(1)
        .with_worker_pool_size(1)
}

#[tokio::test]
async fn test_clustered_without_manager_fails_before_start() {
    // A node selector alone is not enough to cluster.
    let registry = ProviderRegistry::new();
    registry.register_provider(Arc::new(SelectorProvider));

    let result = RuntimeBootstrap::new()
        .registry(registry)
        .options(small_options())
        .build_clustered_runtime();

    assert!(matches!(result, Err(BootstrapError::Configuration(_))));
}

#[tokio::test]
async fn test_clustered_runtime_with_default_selector() {
    let cluster = Arc::new(ScriptedCluster::default());
    let registry = ProviderRegistry::new();
    registry.register_provider(Arc::new(ClusterProvider(cluster.clone())));

    let runtime = RuntimeBootstrap::new()
        .registry(registry)
        .options(small_options())
        .build_clustered_runtime()
        .unwrap()
        .await
        .unwrap();

    assert!(runtime.is_clustered());
    assert_eq!(cluster.joins.load(Ordering::SeqCst), 1);
    let selector = runtime.node_selector().unwrap();
    assert_eq!(selector.name(), DefaultNodeSelector::NAME);
    // The default selector was initialized with the bound cluster manager.
    assert_eq!(selector.select_for_publish("news"), ["node-a", "node-b"]);

    runtime.shutdown().await.unwrap();
    assert_eq!(cluster.leaves.load(Ordering::SeqCst), 1);
    assert!(runtime.is_closed());
}

#[tokio::test]
async fn test_explicit_selector_and_manager_are_kept() {
    let cluster = Arc::new(ScriptedCluster::default());
    let runtime = RuntimeBootstrap::new()
        .registry(ProviderRegistry::new())
        .options(small_options())
        .cluster_manager(cluster.clone())
        .node_selector(Arc::new(FixedSelector))
        .build_clustered_runtime()
        .unwrap()
        .await
        .unwrap();

    assert_eq!(runtime.cluster_manager().unwrap().name(), "scripted");
    let selector = runtime.node_selector().unwrap();
    assert_eq!(selector.name(), "fixed");
    assert_eq!(selector.select_for_send("orders").as_deref(), Some("node-b"));
    runtime.close();
}

#[tokio::test]
async fn test_join_failure_surfaces_as_cluster_join() {
    let cluster = Arc::new(ScriptedCluster {
        fail_join: true,
        ..Default::default()
    });
    let join = RuntimeBootstrap::new()
        .registry(ProviderRegistry::new())
        .options(small_options())
        .cluster_manager(cluster.clone())
        .build_clustered_runtime()
        .unwrap();

    let err = join.await.unwrap_err();
    assert!(matches!(err, BootstrapError::ClusterJoin(_)));
    assert_eq!(cluster.joins.load(Ordering::SeqCst), 1);
}

#[test]
fn test_cluster_join_needs_no_tokio_runtime() {
    // Driven by a plain futures executor: the join must not rely on a reactor.
    let cluster = Arc::new(ScriptedCluster::default());
    let join = RuntimeBootstrap::new()
        .registry(ProviderRegistry::new())
        .options(small_options())
        .cluster_manager(cluster.clone())
        .build_clustered_runtime()
        .unwrap();

    let runtime = futures::executor::block_on(join).unwrap();
    assert!(runtime.is_clustered());
    assert_eq!(cluster.joins.load(Ordering::SeqCst), 1);

    futures::executor::block_on(runtime.shutdown()).unwrap();
    assert_eq!(cluster.leaves.load(Ordering::SeqCst), 1);
}

#[test]
fn test_cluster_join_failure_without_tokio_runtime() {
    let cluster = Arc::new(ScriptedCluster {
        fail_join: true,
        ..Default::default()
    });
    let join = RuntimeBootstrap::new()
        .registry(ProviderRegistry::new())
        .options(small_options())
        .cluster_manager(cluster)
        .build_clustered_runtime()
        .unwrap();

    let err = futures::executor::block_on(join).unwrap_err();
    assert!(matches!(err, BootstrapError::ClusterJoin(_)));
}

#[test]
fn test_custom_thread_factory_creates_every_runtime_thread() {
    let factory = Arc::new(RecordingThreadFactory::default());
    let runtime = RuntimeBootstrap::new()
        .registry(ProviderRegistry::new())
        .options(
            RuntimeOptions::default()
                .with_event_loop_pool_size(2)
                .with_worker_pool_size(3),
        )
        .thread_factory(factory.clone())
        .build_runtime()
        .unwrap();

    let mut created = factory.created.lock().clone();
    created.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        created,
        [
            ("strand-event-loop-0".to_string(), ThreadRole::EventLoop),
            ("strand-event-loop-1".to_string(), ThreadRole::EventLoop),
            ("strand-worker-0".to_string(), ThreadRole::Worker),
            ("strand-worker-1".to_string(), ThreadRole::Worker),
            ("strand-worker-2".to_string(), ThreadRole::Worker),
        ]
    );
    // Threads made through the bound factory are still watched.
    assert_eq!(runtime.blocked_thread_checker().watched_threads(), 5);
    runtime.close();
}

#[test]
fn test_standalone_ignores_cluster_manager() {
    let runtime = RuntimeBootstrap::new()
        .registry(ProviderRegistry::new())
        .options(small_options())
        .cluster_manager(Arc::new(ScriptedCluster::default()))
        .build_runtime()
        .unwrap();
    assert!(!runtime.is_clustered());
    assert!(runtime.node_selector().is_none());
    runtime.close();
}

#[test]
fn test_unavailable_registered_transport_falls_through() {
    let registry = ProviderRegistry::new();
    registry.register_transport(Arc::new(UnavailableNative));

    let runtime = RuntimeBootstrap::new()
        .registry(registry)
        .options(small_options().with_prefer_native_transport(true))
        .build_runtime()
        .unwrap();
    // Whatever this host offers, the unavailable registered transport is
    // never chosen, and the result is always usable.
    assert_ne!(runtime.transport().name(), "registered-epoll");
    assert!(runtime.transport().is_available());
    runtime.close();
}

#[test]
fn test_portable_unless_native_preferred() {
    let registry = ProviderRegistry::new();
    registry.register_transport(Arc::new(UnavailableNative));

    let runtime = RuntimeBootstrap::new()
        .registry(registry)
        .options(small_options())
        .build_runtime()
        .unwrap();
    assert_eq!(runtime.transport().kind(), TransportKind::PortableFallback);
    runtime.close();
}

#[test]
fn test_options_from_json_drive_bootstrap() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runtime.json");
    std::fs::write(
        &path,
        r#"{ "eventLoopPoolSize": 1, "workerPoolSize": 3, "maxWorkerExecuteTime": null }"#,
    )
    .unwrap();

    let options = RuntimeOptions::from_file(&path).unwrap();
    assert_eq!(options.max_worker_execute_time, None);
    let runtime = RuntimeBootstrap::new()
        .registry(ProviderRegistry::new())
        .options(options)
        .build_runtime()
        .unwrap();
    assert_eq!(runtime.event_loops().len(), 1);
    assert_eq!(runtime.worker_pool().pool_size(), 3);
    runtime.close();
}
