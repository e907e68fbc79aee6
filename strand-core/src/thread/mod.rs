//! Thread Model - Roles, Budgets and the Thread Factory
//!
//! Every thread the runtime owns is either an **event-loop** thread, which
//! runs short non-blocking handlers one at a time, or a **worker** thread,
//! which may block on I/O or heavy computation. Each thread carries an
//! execution budget: the longest a single unit of work may run before the
//! watchdog reports it.
//!
//! This module only manufactures correctly labeled threads. It does not
//! schedule work. Whoever drives a thread brackets each unit of work with
//! [`ThreadMonitor::run`] so the [`BlockedThreadChecker`] can see it.
//!
//! # Substitution:
//! [`ThreadFactory`] is the seam. The runtime never spawns a thread on its
//! own; it always goes through the bound factory, so a custom factory can wrap
//! or instrument every runtime thread.

pub mod watchdog;

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::BootstrapError;

pub use watchdog::{BlockedThread, BlockedThreadChecker, BlockedThreadHandler};

/// What a runtime thread is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadRole {
    /// Runs non-blocking handlers; must stay within a small budget.
    EventLoop,
    /// Runs tasks that may block.
    Worker,
}

impl fmt::Display for ThreadRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EventLoop => write!(f, "event-loop"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// Maximum time a single unit of work may run on a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecBudget {
    Bounded(Duration),
    Unbounded,
}

impl ExecBudget {
    pub fn limit(self) -> Option<Duration> {
        match self {
            Self::Bounded(d) => Some(d),
            Self::Unbounded => None,
        }
    }
}

impl From<Option<Duration>> for ExecBudget {
    fn from(value: Option<Duration>) -> Self {
        value.map_or(Self::Unbounded, Self::Bounded)
    }
}

/// Identity, role and budget of a runtime thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadDescriptor {
    name: String,
    role: ThreadRole,
    budget: ExecBudget,
}

impl ThreadDescriptor {
    /// Build a descriptor, enforcing that event-loop threads always carry a
    /// finite, non-zero budget.
    pub fn new(
        name: impl Into<String>,
        role: ThreadRole,
        budget: ExecBudget,
    ) -> Result<Self, BootstrapError> {
        let name = name.into();
        if role == ThreadRole::EventLoop {
            match budget {
                ExecBudget::Bounded(d) if !d.is_zero() => {}
                _ => {
                    return Err(BootstrapError::configuration(format!(
                        "event-loop thread '{name}' needs a finite, non-zero execution budget"
                    )))
                }
            }
        }
        Ok(Self { name, role, budget })
    }

    pub fn event_loop(name: impl Into<String>, budget: Duration) -> Result<Self, BootstrapError> {
        Self::new(name, ThreadRole::EventLoop, ExecBudget::Bounded(budget))
    }

    pub fn worker(name: impl Into<String>, budget: ExecBudget) -> Self {
        Self {
            name: name.into(),
            role: ThreadRole::Worker,
            budget,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> ThreadRole {
        self.role
    }

    pub fn budget(&self) -> ExecBudget {
        self.budget
    }
}

/// Tracks whether a runtime thread is currently executing a unit of work and
/// since when.
///
/// # Performance Pattern: Single Atomic
/// The start mark is one `AtomicU64` holding nanoseconds since the monitor's
/// epoch, plus one so that zero means idle. Marking is two relaxed stores.
#[derive(Debug)]
pub struct ThreadMonitor {
    descriptor: ThreadDescriptor,
    epoch: Instant,
    exec_start: AtomicU64,
}

impl ThreadMonitor {
    pub fn new(descriptor: ThreadDescriptor) -> Self {
        Self {
            descriptor,
            epoch: Instant::now(),
            exec_start: AtomicU64::new(0),
        }
    }

    pub fn descriptor(&self) -> &ThreadDescriptor {
        &self.descriptor
    }

    pub fn begin_execution(&self) {
        let since_epoch = self.epoch.elapsed().as_nanos() as u64;
        self.exec_start.store(since_epoch + 1, Ordering::Release);
    }

    pub fn end_execution(&self) {
        self.exec_start.store(0, Ordering::Release);
    }

    /// How long the current unit of work has been running at `now`, or
    /// `None` when the thread is idle.
    pub fn executing_for(&self, now: Instant) -> Option<Duration> {
        let mark = self.exec_start.load(Ordering::Acquire);
        if mark == 0 {
            return None;
        }
        let started = self.epoch + Duration::from_nanos(mark - 1);
        Some(now.saturating_duration_since(started))
    }

    /// Run `work` as one monitored unit of work.
    pub fn run<R>(&self, work: impl FnOnce() -> R) -> R {
        self.begin_execution();
        let _guard = ExecutionGuard(self);
        work()
    }
}

/// Clears the execution mark even if the work panics.
struct ExecutionGuard<'a>(&'a ThreadMonitor);

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        self.0.end_execution();
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<ThreadMonitor>>> = const { RefCell::new(None) };
}

/// The monitor of the runtime thread this is called from, if any.
pub fn current_monitor() -> Option<Arc<ThreadMonitor>> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Work handed to a new runtime thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a thread created through a [`ThreadFactory`].
pub struct RuntimeThread {
    monitor: Arc<ThreadMonitor>,
    handle: JoinHandle<()>,
}

impl RuntimeThread {
    /// Spawn a named OS thread for `descriptor` and run `task` on it.
    ///
    /// Custom factories that only want to decorate threads can call this and
    /// wrap the task.
    pub fn spawn(task: Task, descriptor: ThreadDescriptor) -> io::Result<Self> {
        let monitor = Arc::new(ThreadMonitor::new(descriptor));
        let thread_monitor = monitor.clone();
        let handle = std::thread::Builder::new()
            .name(monitor.descriptor().name().to_string())
            .spawn(move || {
                CURRENT.with(|current| *current.borrow_mut() = Some(thread_monitor));
                task();
                CURRENT.with(|current| current.borrow_mut().take());
            })?;
        debug!(
            thread = monitor.descriptor().name(),
            role = %monitor.descriptor().role(),
            "Runtime thread started"
        );
        Ok(Self { monitor, handle })
    }

    pub fn descriptor(&self) -> &ThreadDescriptor {
        self.monitor.descriptor()
    }

    pub fn monitor(&self) -> &Arc<ThreadMonitor> {
        &self.monitor
    }

    pub fn thread(&self) -> &std::thread::Thread {
        self.handle.thread()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the thread to exit. A panic on the thread is reported as an
    /// error.
    pub fn join(self) -> io::Result<()> {
        let name = self.monitor.descriptor().name().to_string();
        self.handle
            .join()
            .map_err(|_| io::Error::other(format!("runtime thread '{name}' panicked")))
    }
}

impl fmt::Debug for RuntimeThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeThread")
            .field("descriptor", self.descriptor())
            .finish()
    }
}

/// Creates every thread the runtime owns.
pub trait ThreadFactory: Send + Sync {
    fn new_thread(&self, task: Task, descriptor: ThreadDescriptor) -> io::Result<RuntimeThread>;
}

/// Plain OS threads named after their descriptor.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultThreadFactory;

impl ThreadFactory for DefaultThreadFactory {
    fn new_thread(&self, task: Task, descriptor: ThreadDescriptor) -> io::Result<RuntimeThread> {
        RuntimeThread::spawn(task, descriptor)
    }
}
