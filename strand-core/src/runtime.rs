//! Runtime Instance - The Assembled Runtime
//!
//! A `RuntimeInstance` is what the bootstrap hands back. It owns the event
//! loops, the worker pool and the blocked thread checker, and holds every
//! binding the bootstrap resolved. All bindings are fixed at construction,
//! so the instance is shared read-only across the threads it spawns.
//!
//! # Thread Layout:
//! - `strand-event-loop-N`: one per `eventLoopPoolSize`, event-loop role
//! - `strand-worker-N`: the blocking pool, worker role
//! - `strand-blocked-thread-checker`: the watchdog
//!
//! Every runtime thread is created through the bound [`ThreadFactory`],
//! wrapped so that the watchdog and the metrics hooks see it.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info, warn};

use crate::bootstrap::Bindings;
use crate::cluster::{ClusterManager, NodeSelector};
use crate::error::BootstrapError;
use crate::executor::{self, ExecutorService, ExecutorServiceFactory, Job, PoolConfig};
use crate::file_resolver::FileResolver;
use crate::metrics::RuntimeMetrics;
use crate::options::RuntimeOptions;
use crate::thread::{
    BlockedThread, BlockedThreadChecker, BlockedThreadHandler, ExecBudget, RuntimeThread, Task,
    ThreadDescriptor, ThreadFactory,
};
use crate::tracer::Tracer;
use crate::transport::Transport;

const CHECKER_THREAD: &str = "strand-blocked-thread-checker";

/// Cluster manager and node selector of a clustered runtime.
#[derive(Clone)]
pub struct ClusterBinding {
    pub cluster_manager: Arc<dyn ClusterManager>,
    pub node_selector: Arc<dyn NodeSelector>,
}

/// Wraps the bound factory so every runtime thread is watched and counted.
struct WatchedThreadFactory {
    inner: Arc<dyn ThreadFactory>,
    checker: Arc<BlockedThreadChecker>,
    metrics: Option<Arc<dyn RuntimeMetrics>>,
}

impl ThreadFactory for WatchedThreadFactory {
    fn new_thread(&self, task: Task, descriptor: ThreadDescriptor) -> io::Result<RuntimeThread> {
        let thread = self.inner.new_thread(task, descriptor)?;
        self.checker.register(thread.monitor());
        if let Some(metrics) = &self.metrics {
            metrics.thread_created(thread.descriptor());
        }
        Ok(thread)
    }
}

/// A single-threaded handler queue.
pub struct EventLoop {
    name: String,
    sender: Mutex<Option<UnboundedSender<Job>>>,
    thread: Mutex<Option<RuntimeThread>>,
}

impl EventLoop {
    fn start(
        thread_factory: &dyn ThreadFactory,
        name: String,
        budget: Duration,
    ) -> Result<Self, BootstrapError> {
        let descriptor = ThreadDescriptor::event_loop(name.clone(), budget)?;
        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let queue = Arc::new(Mutex::new(receiver));
        let thread = thread_factory
            .new_thread(Box::new(move || executor::drain(queue)), descriptor)
            .map_err(|source| BootstrapError::ThreadSpawn {
                name: name.clone(),
                source,
            })?;
        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a handler. Handlers run one at a time, in submission order.
    pub fn execute(&self, handler: Job) -> Result<()> {
        let sender = self.sender.lock();
        let sender = sender
            .as_ref()
            .with_context(|| format!("Event loop '{}' is stopped", self.name))?;
        sender
            .send(handler)
            .map_err(|_| anyhow::anyhow!("Event loop '{}' thread has exited", self.name))
    }

    fn stop(&self) {
        self.sender.lock().take();
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        // Stopping from a handler on this very loop: the thread exits once
        // the handler returns.
        if thread.thread().id() == std::thread::current().id() {
            return;
        }
        if let Err(e) = thread.join() {
            warn!(event_loop = %self.name, error = %e, "Event loop exited abnormally");
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A running runtime.
pub struct RuntimeInstance {
    options: Arc<RuntimeOptions>,
    transport: Arc<dyn Transport>,
    metrics: Option<Arc<dyn RuntimeMetrics>>,
    tracer: Option<Arc<dyn Tracer>>,
    file_resolver: Arc<dyn FileResolver>,
    thread_factory: Arc<dyn ThreadFactory>,
    executor_factory: Arc<dyn ExecutorServiceFactory>,
    cluster: Option<ClusterBinding>,
    event_loops: Vec<EventLoop>,
    worker_pool: Arc<dyn ExecutorService>,
    checker: Arc<BlockedThreadChecker>,
    next_loop: AtomicUsize,
    closed: AtomicBool,
}

impl RuntimeInstance {
    /// Start threads and wire the resolved bindings together.
    ///
    /// On error everything started so far is torn down before returning.
    pub(crate) fn start(
        options: Arc<RuntimeOptions>,
        bindings: Bindings,
        cluster: Option<ClusterBinding>,
        blocked_thread_handler: Option<BlockedThreadHandler>,
        bootstrap_started: Instant,
    ) -> Result<Arc<Self>, BootstrapError> {
        let metrics = bindings.metrics.clone();
        let metrics_hook = metrics.clone();
        let handler: BlockedThreadHandler = Arc::new(move |report: &BlockedThread| {
            if let Some(metrics) = &metrics_hook {
                metrics.blocked_thread(report);
            }
            if let Some(handler) = &blocked_thread_handler {
                handler(report);
            }
        });

        let checker = BlockedThreadChecker::start(
            options.blocked_thread_check_interval,
            options.warning_exception_time,
            Some(handler),
        )
        .map_err(|source| BootstrapError::ThreadSpawn {
            name: CHECKER_THREAD.to_string(),
            source,
        })?;
        let checker = Arc::new(checker);

        let thread_factory: Arc<dyn ThreadFactory> = Arc::new(WatchedThreadFactory {
            inner: bindings.thread_factory.clone(),
            checker: checker.clone(),
            metrics: metrics.clone(),
        });

        let mut event_loops = Vec::with_capacity(options.event_loop_pool_size);
        for index in 0..options.event_loop_pool_size {
            event_loops.push(EventLoop::start(
                thread_factory.as_ref(),
                format!("strand-event-loop-{index}"),
                options.max_event_loop_execute_time,
            )?);
        }

        let worker_pool = bindings
            .executor_factory
            .new_executor(
                thread_factory.clone(),
                PoolConfig::workers(
                    "strand-worker",
                    options.worker_pool_size,
                    ExecBudget::from(options.max_worker_execute_time),
                ),
            )
            .map_err(BootstrapError::WorkerPool)?;

        if let Some(binding) = &cluster {
            binding.node_selector.init(binding.cluster_manager.clone());
        }

        let runtime = Arc::new(Self {
            transport: bindings.transport,
            metrics,
            tracer: bindings.tracer,
            file_resolver: bindings.file_resolver,
            thread_factory,
            executor_factory: bindings.executor_factory,
            cluster,
            event_loops,
            worker_pool,
            checker,
            next_loop: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            options,
        });

        if let Some(metrics) = &runtime.metrics {
            metrics.runtime_started(bootstrap_started.elapsed());
        }
        info!(
            transport = runtime.transport.name(),
            event_loops = runtime.event_loops.len(),
            workers = runtime.worker_pool.pool_size(),
            clustered = runtime.is_clustered(),
            "Runtime started"
        );
        Ok(runtime)
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn metrics(&self) -> Option<&Arc<dyn RuntimeMetrics>> {
        self.metrics.as_ref()
    }

    pub fn tracer(&self) -> Option<&Arc<dyn Tracer>> {
        self.tracer.as_ref()
    }

    pub fn file_resolver(&self) -> &Arc<dyn FileResolver> {
        &self.file_resolver
    }

    /// The factory runtime components should create their threads with.
    /// Threads made here are watched and counted like the runtime's own.
    pub fn thread_factory(&self) -> &Arc<dyn ThreadFactory> {
        &self.thread_factory
    }

    pub fn executor_factory(&self) -> &Arc<dyn ExecutorServiceFactory> {
        &self.executor_factory
    }

    pub fn cluster_manager(&self) -> Option<&Arc<dyn ClusterManager>> {
        self.cluster.as_ref().map(|c| &c.cluster_manager)
    }

    pub fn node_selector(&self) -> Option<&Arc<dyn NodeSelector>> {
        self.cluster.as_ref().map(|c| &c.node_selector)
    }

    pub fn is_clustered(&self) -> bool {
        self.cluster.is_some()
    }

    pub fn event_loops(&self) -> &[EventLoop] {
        &self.event_loops
    }

    pub fn worker_pool(&self) -> &Arc<dyn ExecutorService> {
        &self.worker_pool
    }

    pub fn blocked_thread_checker(&self) -> &BlockedThreadChecker {
        &self.checker
    }

    /// Run a non-blocking handler on the next event loop, round-robin.
    pub fn run_on_loop<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        anyhow::ensure!(!self.is_closed(), "Runtime is closed");
        let index = self.next_loop.fetch_add(1, Ordering::Relaxed) % self.event_loops.len();
        self.event_loops[index].execute(Box::new(handler))
    }

    /// Run a task that may block on the worker pool.
    pub fn execute_blocking<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        anyhow::ensure!(!self.is_closed(), "Runtime is closed");
        self.worker_pool.execute(Box::new(job))
    }

    /// Create an additional worker pool through the bound executor factory.
    pub fn new_worker_executor(
        &self,
        name_prefix: &str,
        pool_size: usize,
    ) -> Result<Arc<dyn ExecutorService>> {
        self.executor_factory.new_executor(
            self.thread_factory.clone(),
            PoolConfig::workers(
                name_prefix,
                pool_size,
                ExecBudget::from(self.options.max_worker_execute_time),
            ),
        )
    }

    /// Join the cluster through the bound manager. Waits as long as the
    /// manager does; bounding the wait is up to the caller.
    pub(crate) async fn join_cluster(&self) -> Result<()> {
        let Some(binding) = &self.cluster else {
            anyhow::bail!("Runtime was not built for clustering");
        };
        let manager = binding.cluster_manager.clone();
        debug!(cluster_manager = manager.name(), "Joining cluster");
        manager.join().await?;

        info!(
            cluster_manager = manager.name(),
            node_id = %manager.node_id(),
            "Joined cluster"
        );
        Ok(())
    }

    /// Leave the cluster (if clustered) and close the runtime.
    pub async fn shutdown(&self) -> Result<()> {
        let left = match &self.cluster {
            Some(binding) if !self.is_closed() => binding
                .cluster_manager
                .leave()
                .await
                .context("Failed to leave cluster"),
            _ => Ok(()),
        };
        self.close();
        left
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop event loops, the worker pool and the watchdog, then release the
    /// bound providers. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for event_loop in &self.event_loops {
            event_loop.stop();
        }
        self.worker_pool.shutdown();
        self.checker.close();

        if let Err(e) = self.file_resolver.close() {
            warn!(error = %e, "File resolver failed to close");
        }
        if let Some(tracer) = &self.tracer {
            tracer.close();
        }
        if let Some(metrics) = &self.metrics {
            metrics.close();
        }
        info!("Runtime closed");
    }
}

impl Drop for RuntimeInstance {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for RuntimeInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeInstance")
            .field("transport", &self.transport.name())
            .field("event_loops", &self.event_loops.len())
            .field("workers", &self.worker_pool.pool_size())
            .field("clustered", &self.is_clustered())
            .field("closed", &self.is_closed())
            .finish()
    }
}
