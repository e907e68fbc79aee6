//! Runtime Options - The Configuration Snapshot
//!
//! Every tunable the bootstrap and the runtime instance read lives here. The
//! snapshot is frozen once bootstrap begins: the bootstrap wraps it in an
//! `Arc` and nothing downstream mutates it.
//!
//! Options are plain serde structs so they can be loaded from the JSON file
//! the `strand` binary accepts. Durations are written as milliseconds.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::BootstrapError;

pub const DEFAULT_WORKER_POOL_SIZE: usize = 20;
pub const DEFAULT_MAX_EVENT_LOOP_EXECUTE_TIME: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_WORKER_EXECUTE_TIME: Duration = Duration::from_secs(60);
pub const DEFAULT_BLOCKED_THREAD_CHECK_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_WARNING_EXCEPTION_TIME: Duration = Duration::from_secs(5);
pub const DEFAULT_FILE_CACHE_DIR: &str = ".strand";

/// Two event loops per available core, matching the usual reactor sizing.
pub fn default_event_loop_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(2)
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeOptions {
    /// Number of event-loop threads.
    pub event_loop_pool_size: usize,
    /// Number of worker threads in the blocking pool.
    pub worker_pool_size: usize,
    /// Budget for a single handler on an event-loop thread.
    #[serde(with = "millis")]
    pub max_event_loop_execute_time: Duration,
    /// Budget for a single job on a worker thread. `None` means unbounded.
    #[serde(with = "opt_millis")]
    pub max_worker_execute_time: Option<Duration>,
    /// How often the watchdog samples runtime threads.
    #[serde(with = "millis")]
    pub blocked_thread_check_interval: Duration,
    /// Past this much blocking the watchdog escalates from `warn` to `error`.
    #[serde(with = "millis")]
    pub warning_exception_time: Duration,
    /// Try the OS-native readiness mechanism before the portable one.
    pub prefer_native_transport: bool,
    /// Metrics settings; `None` leaves metrics disabled.
    pub metrics: Option<MetricsOptions>,
    /// Tracing settings; `None` means tracing is not configured.
    pub tracing: Option<TracingOptions>,
    pub file_system: FileSystemOptions,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            event_loop_pool_size: default_event_loop_pool_size(),
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            max_event_loop_execute_time: DEFAULT_MAX_EVENT_LOOP_EXECUTE_TIME,
            max_worker_execute_time: Some(DEFAULT_MAX_WORKER_EXECUTE_TIME),
            blocked_thread_check_interval: DEFAULT_BLOCKED_THREAD_CHECK_INTERVAL,
            warning_exception_time: DEFAULT_WARNING_EXCEPTION_TIME,
            prefer_native_transport: false,
            metrics: None,
            tracing: None,
            file_system: FileSystemOptions::default(),
        }
    }
}

impl RuntimeOptions {
    /// Parse options from a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse runtime options")
    }

    /// Load options from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read options file {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics.as_ref().is_some_and(|m| m.enabled)
    }

    pub fn tracing_configured(&self) -> bool {
        self.tracing.is_some()
    }

    pub fn with_prefer_native_transport(mut self, prefer: bool) -> Self {
        self.prefer_native_transport = prefer;
        self
    }

    pub fn with_metrics_enabled(mut self, enabled: bool) -> Self {
        self.metrics = Some(MetricsOptions { enabled });
        self
    }

    pub fn with_tracing(mut self, tracing: TracingOptions) -> Self {
        self.tracing = Some(tracing);
        self
    }

    pub fn with_event_loop_pool_size(mut self, size: usize) -> Self {
        self.event_loop_pool_size = size;
        self
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    pub fn with_max_event_loop_execute_time(mut self, budget: Duration) -> Self {
        self.max_event_loop_execute_time = budget;
        self
    }

    pub fn with_max_worker_execute_time(mut self, budget: Option<Duration>) -> Self {
        self.max_worker_execute_time = budget;
        self
    }

    pub fn with_blocked_thread_check_interval(mut self, interval: Duration) -> Self {
        self.blocked_thread_check_interval = interval;
        self
    }

    /// Reject settings the runtime cannot start with.
    pub fn validate(&self) -> Result<(), BootstrapError> {
        if self.event_loop_pool_size == 0 {
            return Err(BootstrapError::configuration(
                "eventLoopPoolSize must be at least 1",
            ));
        }
        if self.worker_pool_size == 0 {
            return Err(BootstrapError::configuration(
                "workerPoolSize must be at least 1",
            ));
        }
        if self.max_event_loop_execute_time.is_zero() {
            return Err(BootstrapError::configuration(
                "maxEventLoopExecuteTime must be greater than zero",
            ));
        }
        if self.blocked_thread_check_interval.is_zero() {
            return Err(BootstrapError::configuration(
                "blockedThreadCheckInterval must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MetricsOptions {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TracingOptions {
    /// Name reported by the tracer for spans emitted by this runtime.
    pub service_name: Option<String>,
}

/// Settings for the default file resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileSystemOptions {
    pub file_caching_enabled: bool,
    /// Cache directory, relative to `base_dir` unless absolute.
    pub file_cache_dir: PathBuf,
    /// Directory relative paths resolve against; the process working
    /// directory when unset.
    pub base_dir: Option<PathBuf>,
}

impl Default for FileSystemOptions {
    fn default() -> Self {
        Self {
            file_caching_enabled: true,
            file_cache_dir: PathBuf::from(DEFAULT_FILE_CACHE_DIR),
            base_dir: None,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
