//! Blocked Thread Checker - Execution Budget Watchdog
//!
//! A dedicated thread samples every registered [`ThreadMonitor`] at a fixed
//! interval. A thread whose current unit of work has been running longer
//! than its budget is reported: logged, forwarded to an optional handler, and
//! reported again on every pass while it stays blocked.
//!
//! Detection only. The offending thread is never interrupted.
//!
//! # Escalation:
//! - blocked up to `warning_exception_time` → `warn!`
//! - blocked longer → `error!`

use parking_lot::Mutex;
use std::io;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use super::{ThreadMonitor, ThreadRole};

/// A budget violation observed by the watchdog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedThread {
    pub name: String,
    pub role: ThreadRole,
    pub budget: Duration,
    pub blocked_for: Duration,
}

/// Callback invoked for every reported violation, on the watchdog thread.
pub type BlockedThreadHandler = Arc<dyn Fn(&BlockedThread) + Send + Sync>;

struct CheckerState {
    threads: Mutex<Vec<Weak<ThreadMonitor>>>,
    warning_exception_time: Duration,
    handler: Option<BlockedThreadHandler>,
}

impl CheckerState {
    fn check(&self, now: Instant) -> Vec<BlockedThread> {
        let mut threads = self.threads.lock();
        // Drop monitors of threads that have gone away.
        threads.retain(|weak| weak.strong_count() > 0);

        let mut blocked = Vec::new();
        for monitor in threads.iter().filter_map(Weak::upgrade) {
            let descriptor = monitor.descriptor();
            let Some(budget) = descriptor.budget().limit() else {
                continue;
            };
            let Some(elapsed) = monitor.executing_for(now) else {
                continue;
            };
            if elapsed > budget {
                blocked.push(BlockedThread {
                    name: descriptor.name().to_string(),
                    role: descriptor.role(),
                    budget,
                    blocked_for: elapsed,
                });
            }
        }
        drop(threads);

        for report in &blocked {
            self.report(report);
        }
        blocked
    }

    fn report(&self, report: &BlockedThread) {
        let blocked_ms = report.blocked_for.as_millis() as u64;
        let budget_ms = report.budget.as_millis() as u64;
        if report.blocked_for > self.warning_exception_time {
            error!(
                thread = %report.name,
                role = %report.role,
                blocked_ms,
                budget_ms,
                "Thread blocked far beyond its execution budget"
            );
        } else {
            warn!(
                thread = %report.name,
                role = %report.role,
                blocked_ms,
                budget_ms,
                "Thread blocked past its execution budget"
            );
        }
        if let Some(handler) = &self.handler {
            handler(report);
        }
    }
}

/// Watchdog over runtime threads.
pub struct BlockedThreadChecker {
    state: Arc<CheckerState>,
    interval: Duration,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BlockedThreadChecker {
    /// Start the watchdog thread.
    ///
    /// The thread drives its own single-threaded tokio runtime, so the
    /// checker works whether or not the caller is inside one.
    pub fn start(
        interval: Duration,
        warning_exception_time: Duration,
        handler: Option<BlockedThreadHandler>,
    ) -> io::Result<Self> {
        let state = Arc::new(CheckerState {
            threads: Mutex::new(Vec::new()),
            warning_exception_time,
            handler,
        });

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let loop_state = state.clone();
        let handle = std::thread::Builder::new()
            .name("strand-blocked-thread-checker".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    loop {
                        tokio::select! {
                            _ = &mut stop_rx => break,
                            _ = tokio::time::sleep(interval) => {
                                loop_state.check(Instant::now());
                            }
                        }
                    }
                });
            })?;

        debug!(interval_ms = interval.as_millis() as u64, "Blocked thread checker started");
        Ok(Self {
            state,
            interval,
            stop: Mutex::new(Some(stop_tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Add a thread to the set being watched. Threads are forgotten once
    /// their monitor is dropped.
    pub fn register(&self, monitor: &Arc<ThreadMonitor>) {
        self.state.threads.lock().push(Arc::downgrade(monitor));
    }

    pub fn watched_threads(&self) -> usize {
        self.state
            .threads
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one sampling pass at `now`, reporting and returning violations.
    pub fn check_now(&self, now: Instant) -> Vec<BlockedThread> {
        self.state.check(now)
    }

    pub fn is_closed(&self) -> bool {
        self.stop.lock().is_none()
    }

    /// Stop the watchdog thread. Idempotent, and safe to call from a
    /// blocked-thread handler.
    pub fn close(&self) {
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(());
        }
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        // Closed from a handler: the loop sees the stop signal once the
        // handler returns.
        if handle.thread().id() == std::thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!("Blocked thread checker panicked");
        }
    }
}

impl Drop for BlockedThreadChecker {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::testing::recv_within;
    use crate::thread::{ExecBudget, ThreadDescriptor};
    use std::sync::OnceLock;
    use tokio::sync::mpsc;

    fn event_loop_monitor(budget_ms: u64) -> Arc<ThreadMonitor> {
        Arc::new(ThreadMonitor::new(
            ThreadDescriptor::event_loop("loop-0", Duration::from_millis(budget_ms)).unwrap(),
        ))
    }

    #[test]
    fn test_check_reports_over_budget_thread() {
        let checker = BlockedThreadChecker::start(Duration::from_secs(60), Duration::from_secs(5), None).unwrap();
        let monitor = event_loop_monitor(10);
        checker.register(&monitor);

        monitor.begin_execution();
        let later = Instant::now() + Duration::from_millis(50);
        let blocked = checker.check_now(later);
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].name, "loop-0");
        assert_eq!(blocked[0].role, ThreadRole::EventLoop);
        assert!(blocked[0].blocked_for > blocked[0].budget);

        monitor.end_execution();
        assert!(checker.check_now(later).is_empty());
    }

    #[test]
    fn test_within_budget_not_reported() {
        let checker = BlockedThreadChecker::start(Duration::from_secs(60), Duration::from_secs(5), None).unwrap();
        let monitor = event_loop_monitor(1_000);
        checker.register(&monitor);
        monitor.begin_execution();
        assert!(checker.check_now(Instant::now()).is_empty());
    }

    #[test]
    fn test_unbounded_worker_never_reported() {
        let checker = BlockedThreadChecker::start(Duration::from_secs(60), Duration::from_secs(5), None).unwrap();
        let monitor = Arc::new(ThreadMonitor::new(ThreadDescriptor::worker("worker-0", ExecBudget::Unbounded)));
        checker.register(&monitor);
        monitor.begin_execution();
        assert!(checker.check_now(Instant::now() + Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn test_dropped_monitors_are_forgotten() {
        let checker = BlockedThreadChecker::start(Duration::from_secs(60), Duration::from_secs(5), None).unwrap();
        let monitor = event_loop_monitor(10);
        checker.register(&monitor);
        assert_eq!(checker.watched_threads(), 1);
        drop(monitor);
        assert_eq!(checker.watched_threads(), 0);
    }

    #[tokio::test]
    async fn test_background_sampling_invokes_handler() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler: BlockedThreadHandler = Arc::new(move |report: &BlockedThread| {
            let _ = tx.send(report.clone());
        });
        let checker =
            BlockedThreadChecker::start(Duration::from_millis(10), Duration::from_secs(5), Some(handler)).unwrap();
        let monitor = event_loop_monitor(20);
        checker.register(&monitor);

        monitor.begin_execution();
        let report = recv_within(&mut rx).await;
        assert_eq!(report.name, "loop-0");
        monitor.end_execution();
        checker.close();
    }

    #[test]
    fn test_close_is_idempotent() {
        let checker = BlockedThreadChecker::start(Duration::from_millis(5), Duration::from_secs(5), None).unwrap();
        checker.close();
        checker.close();
        assert!(checker.is_closed());
    }

    #[tokio::test]
    async fn test_handler_may_close_its_own_checker() {
        let slot: Arc<OnceLock<Weak<BlockedThreadChecker>>> = Arc::new(OnceLock::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler_slot = slot.clone();
        let handler: BlockedThreadHandler = Arc::new(move |_report: &BlockedThread| {
            if let Some(checker) = handler_slot.get().and_then(Weak::upgrade) {
                checker.close();
                let _ = tx.send(std::thread::current().name().map(str::to_string));
            }
        });
        let checker = Arc::new(
            BlockedThreadChecker::start(Duration::from_millis(10), Duration::from_secs(5), Some(handler)).unwrap(),
        );
        slot.set(Arc::downgrade(&checker)).unwrap();
        let monitor = event_loop_monitor(20);
        checker.register(&monitor);

        monitor.begin_execution();
        let closed_on = recv_within(&mut rx).await;
        assert_eq!(closed_on.as_deref(), Some("strand-blocked-thread-checker"));
        assert!(checker.is_closed());
        // Closing again from the test thread has nothing left to join.
        checker.close();
        monitor.end_execution();
    }
}
