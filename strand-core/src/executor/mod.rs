//! Executor Services - Pools Built From the Thread Model
//!
//! The runtime runs blocking work on a worker pool and handlers on event
//! loops. Both are fixed-size pools of threads pulling jobs off a shared
//! queue; they differ only in the role and budget stamped on their threads.
//!
//! # Design Philosophy:
//! - **Factory-honoring**: every pool thread comes from the supplied
//!   [`ThreadFactory`], so custom factories see and classify all of them
//! - **Monitored**: each job runs inside [`ThreadMonitor::run`], which is
//!   what the watchdog samples
//! - **Replaceable**: [`ExecutorServiceFactory`] is bound like any other
//!   provider slot

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::thread::{current_monitor, ExecBudget, RuntimeThread, ThreadDescriptor, ThreadFactory, ThreadRole};

/// A unit of work submitted to an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Shape of a pool to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Threads are named `{name_prefix}-{index}`.
    pub name_prefix: String,
    pub pool_size: usize,
    pub role: ThreadRole,
    pub budget: ExecBudget,
}

impl PoolConfig {
    pub fn workers(name_prefix: impl Into<String>, pool_size: usize, budget: ExecBudget) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            pool_size,
            role: ThreadRole::Worker,
            budget,
        }
    }
}

/// Something that runs submitted jobs on threads it owns.
pub trait ExecutorService: Send + Sync {
    /// Queue a job. Fails once the executor has been shut down.
    fn execute(&self, job: Job) -> Result<()>;

    /// Stop accepting jobs, let queued ones drain and wait for the threads.
    /// Idempotent.
    fn shutdown(&self);

    fn pool_size(&self) -> usize;
}

/// Creates executor services on top of a thread factory.
pub trait ExecutorServiceFactory: Send + Sync {
    fn new_executor(
        &self,
        thread_factory: Arc<dyn ThreadFactory>,
        config: PoolConfig,
    ) -> Result<Arc<dyn ExecutorService>>;
}

/// Builds [`ThreadPoolExecutor`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultExecutorFactory;

impl ExecutorServiceFactory for DefaultExecutorFactory {
    fn new_executor(
        &self,
        thread_factory: Arc<dyn ThreadFactory>,
        config: PoolConfig,
    ) -> Result<Arc<dyn ExecutorService>> {
        Ok(Arc::new(ThreadPoolExecutor::start(thread_factory.as_ref(), &config)?))
    }
}

/// Fixed-size pool draining a shared FIFO queue.
pub struct ThreadPoolExecutor {
    name_prefix: String,
    sender: Mutex<Option<UnboundedSender<Job>>>,
    threads: Mutex<Vec<RuntimeThread>>,
    pool_size: usize,
}

impl ThreadPoolExecutor {
    pub fn start(thread_factory: &dyn ThreadFactory, config: &PoolConfig) -> Result<Self> {
        anyhow::ensure!(config.pool_size > 0, "pool '{}' needs at least one thread", config.name_prefix);

        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut threads = Vec::with_capacity(config.pool_size);

        for index in 0..config.pool_size {
            let name = format!("{}-{}", config.name_prefix, index);
            let descriptor = ThreadDescriptor::new(name.clone(), config.role, config.budget)?;
            let queue = receiver.clone();
            let spawned = thread_factory
                .new_thread(Box::new(move || drain(queue)), descriptor)
                .with_context(|| format!("Failed to start pool thread '{name}'"));
            match spawned {
                Ok(thread) => threads.push(thread),
                Err(e) => {
                    // Unwind the threads already started before reporting.
                    drop(sender);
                    for thread in threads {
                        let _ = thread.join();
                    }
                    return Err(e);
                }
            }
        }

        debug!(pool = %config.name_prefix, size = config.pool_size, role = %config.role, "Executor pool started");
        Ok(Self {
            name_prefix: config.name_prefix.clone(),
            sender: Mutex::new(Some(sender)),
            threads: Mutex::new(threads),
            pool_size: config.pool_size,
        })
    }

    /// Threads of this pool, e.g. to register them with a watchdog.
    pub fn with_threads<R>(&self, f: impl FnOnce(&[RuntimeThread]) -> R) -> R {
        f(&self.threads.lock())
    }
}

impl ExecutorService for ThreadPoolExecutor {
    fn execute(&self, job: Job) -> Result<()> {
        let sender = self.sender.lock();
        let sender = sender
            .as_ref()
            .with_context(|| format!("Executor '{}' has been shut down", self.name_prefix))?;
        sender
            .send(job)
            .map_err(|_| anyhow::anyhow!("Executor '{}' has no running threads", self.name_prefix))
    }

    fn shutdown(&self) {
        if self.sender.lock().take().is_none() {
            return;
        }
        let current = std::thread::current().id();
        for thread in self.threads.lock().drain(..) {
            // A pool thread shutting down its own pool cannot join itself.
            if thread.thread().id() == current {
                continue;
            }
            if let Err(e) = thread.join() {
                warn!(pool = %self.name_prefix, error = %e, "Pool thread exited abnormally");
            }
        }
        debug!(pool = %self.name_prefix, "Executor pool stopped");
    }

    fn pool_size(&self) -> usize {
        self.pool_size
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Body of every pool thread: run jobs until the queue closes.
pub(crate) fn drain(queue: Arc<Mutex<UnboundedReceiver<Job>>>) {
    let monitor = current_monitor();
    loop {
        let job = queue.lock().blocking_recv();
        let Some(job) = job else {
            break;
        };
        let outcome = match &monitor {
            Some(monitor) => monitor.run(|| panic::catch_unwind(AssertUnwindSafe(job))),
            None => panic::catch_unwind(AssertUnwindSafe(job)),
        };
        if outcome.is_err() {
            let name = std::thread::current().name().unwrap_or("<unnamed>").to_string();
            warn!(thread = %name, "Job panicked; pool thread keeps running");
        }
    }
}
