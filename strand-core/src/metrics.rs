//! Runtime Metrics - The Metrics Capability and Built-in Counters
//!
//! [`RuntimeMetrics`] is the hook surface a metrics provider implements. The
//! runtime calls it when threads are created, when the watchdog reports a
//! blocked thread, once the runtime has started, and on close.
//!
//! [`RuntimeCounters`] is the built-in implementation, contributed through
//! [`CountersProvider`] like any other provider.
//!
//! # Design Goals:
//! - Lock-free atomic counters
//! - Zero allocation in the hooks

use anyhow::Result;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::provider::{ActivationContext, Binding, ProviderKind, ServiceProvider};
use crate::thread::{BlockedThread, ThreadDescriptor, ThreadRole};

/// Hooks a metrics implementation receives from the runtime.
pub trait RuntimeMetrics: Send + Sync {
    fn name(&self) -> &str;

    fn thread_created(&self, _descriptor: &ThreadDescriptor) {}

    fn blocked_thread(&self, _report: &BlockedThread) {}

    /// Called once the runtime is fully started, with the time bootstrap took.
    fn runtime_started(&self, _bootstrap_time: Duration) {}

    fn close(&self) {}
}

/// Atomic counters covering the runtime's own activity.
#[derive(Debug, Default)]
pub struct RuntimeCounters {
    pub event_loop_threads: AtomicU64,
    pub worker_threads: AtomicU64,
    pub blocked_event_loop_reports: AtomicU64,
    pub blocked_worker_reports: AtomicU64,
    pub bootstrap_time_ns: AtomicU64,
    pub started: AtomicBool,
    pub closed: AtomicBool,
}

impl RuntimeCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get a snapshot of current counters
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            event_loop_threads: self.event_loop_threads.load(Ordering::Relaxed),
            worker_threads: self.worker_threads.load(Ordering::Relaxed),
            blocked_event_loop_reports: self.blocked_event_loop_reports.load(Ordering::Relaxed),
            blocked_worker_reports: self.blocked_worker_reports.load(Ordering::Relaxed),
            bootstrap_ms: self.bootstrap_time_ns.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            started: self.started.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero
    pub fn reset(&self) {
        self.event_loop_threads.store(0, Ordering::Relaxed);
        self.worker_threads.store(0, Ordering::Relaxed);
        self.blocked_event_loop_reports.store(0, Ordering::Relaxed);
        self.blocked_worker_reports.store(0, Ordering::Relaxed);
        self.bootstrap_time_ns.store(0, Ordering::Relaxed);
        self.started.store(false, Ordering::Relaxed);
        self.closed.store(false, Ordering::Relaxed);
    }
}

impl RuntimeMetrics for RuntimeCounters {
    fn name(&self) -> &str {
        "counters"
    }

    fn thread_created(&self, descriptor: &ThreadDescriptor) {
        match descriptor.role() {
            ThreadRole::EventLoop => self.event_loop_threads.fetch_add(1, Ordering::Relaxed),
            ThreadRole::Worker => self.worker_threads.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn blocked_thread(&self, report: &BlockedThread) {
        match report.role {
            ThreadRole::EventLoop => self.blocked_event_loop_reports.fetch_add(1, Ordering::Relaxed),
            ThreadRole::Worker => self.blocked_worker_reports.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn runtime_started(&self, bootstrap_time: Duration) {
        self.bootstrap_time_ns
            .store(bootstrap_time.as_nanos() as u64, Ordering::Relaxed);
        self.started.store(true, Ordering::Relaxed);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

/// A point-in-time snapshot of [`RuntimeCounters`]
#[derive(Debug, Clone, PartialEq)]
pub struct CountersSnapshot {
    pub event_loop_threads: u64,
    pub worker_threads: u64,
    pub blocked_event_loop_reports: u64,
    pub blocked_worker_reports: u64,
    pub bootstrap_ms: f64,
    pub started: bool,
    pub closed: bool,
}

/// Metrics provider binding a shared [`RuntimeCounters`].
///
/// Gated like every metrics provider: it only activates with metrics enabled.
#[derive(Debug, Clone)]
pub struct CountersProvider {
    counters: Arc<RuntimeCounters>,
}

impl CountersProvider {
    pub fn new(counters: Arc<RuntimeCounters>) -> Self {
        Self { counters }
    }

    pub fn counters(&self) -> &Arc<RuntimeCounters> {
        &self.counters
    }
}

impl Default for CountersProvider {
    fn default() -> Self {
        Self::new(RuntimeCounters::new())
    }
}

impl ServiceProvider for CountersProvider {
    fn name(&self) -> &str {
        "counters"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Metrics
    }

    fn activate(&self, _ctx: &ActivationContext<'_>) -> Result<Option<Binding>> {
        Ok(Some(Binding::Metrics(self.counters.clone())))
    }
}
