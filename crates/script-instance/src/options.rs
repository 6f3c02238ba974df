//! Instance configuration.
//!
//! `InstanceOptions` is captured once when a lifecycle initializes and is
//! read-only from then on. Both the host and worker threads read it through
//! an `Arc`.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::features::FeatureSet;

/// Default port for the debugging inspector.
pub const DEFAULT_INSPECTOR_PORT: u16 = 9229;

// ─────────────────────────────────────────────────────────────────────────────
// Threading
// ─────────────────────────────────────────────────────────────────────────────

/// Where the entry script and its tick loop run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadingPolicy {
    /// Everything runs synchronously on the host's update thread.
    #[default]
    HostThread,
    /// A dedicated worker thread is started per instance.
    DedicatedThread,
}

/// Execution hint for the dedicated worker thread.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHint {
    /// Thread name; defaults to `script-instance-<id>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Stack size in bytes; platform default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_size: Option<usize>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Instance Options
// ─────────────────────────────────────────────────────────────────────────────

/// Immutable configuration snapshot for one lifecycle cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceOptions {
    /// Host-thread vs dedicated-thread execution
    #[serde(default)]
    pub threading: ThreadingPolicy,

    /// Hint used when spawning the dedicated worker
    #[serde(default)]
    pub worker: WorkerHint,

    /// Capabilities injected before the entry script runs
    #[serde(default)]
    pub features: FeatureSet,

    /// Forward per-frame ticks to the script
    #[serde(default)]
    pub attach_to_tick: bool,

    /// Script executed once exposure has finished
    #[serde(default = "default_entry_script")]
    pub entry_script: PathBuf,

    /// Port for the debugging inspector
    #[serde(default = "default_inspector_port")]
    pub inspector_port: u16,

    /// Attach an inspector on startup (host-thread policy only)
    #[serde(default = "default_create_inspector")]
    pub create_inspector: bool,

    /// Sleep between synthetic ticks on the worker
    #[serde(default = "default_worker_tick_interval", with = "micros")]
    pub worker_tick_interval: Duration,

    /// Delta time reported with each synthetic worker tick
    #[serde(default = "default_worker_tick_delta")]
    pub worker_tick_delta: f32,

    /// Upper bound on waiting for the worker during teardown
    #[serde(default = "default_shutdown_timeout", with = "micros")]
    pub shutdown_timeout: Duration,

    /// Sleep between checks while waiting for the worker
    #[serde(default = "default_shutdown_poll_interval", with = "micros")]
    pub shutdown_poll_interval: Duration,
}

fn default_entry_script() -> PathBuf {
    PathBuf::from("main.js")
}

fn default_inspector_port() -> u16 {
    DEFAULT_INSPECTOR_PORT
}

fn default_create_inspector() -> bool {
    true
}

fn default_worker_tick_interval() -> Duration {
    Duration::from_millis(1)
}

fn default_worker_tick_delta() -> f32 {
    0.001
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_shutdown_poll_interval() -> Duration {
    Duration::from_micros(100)
}

impl Default for InstanceOptions {
    fn default() -> Self {
        Self {
            threading: ThreadingPolicy::default(),
            worker: WorkerHint::default(),
            features: FeatureSet::default(),
            attach_to_tick: false,
            entry_script: default_entry_script(),
            inspector_port: DEFAULT_INSPECTOR_PORT,
            create_inspector: true,
            worker_tick_interval: default_worker_tick_interval(),
            worker_tick_delta: default_worker_tick_delta(),
            shutdown_timeout: default_shutdown_timeout(),
            shutdown_poll_interval: default_shutdown_poll_interval(),
        }
    }
}

impl InstanceOptions {
    /// Create options for the given entry script
    pub fn new(entry_script: impl Into<PathBuf>) -> Self {
        Self {
            entry_script: entry_script.into(),
            ..Default::default()
        }
    }

    /// Set the threading policy
    pub fn with_threading(mut self, threading: ThreadingPolicy) -> Self {
        self.threading = threading;
        self
    }

    /// Set the worker hint
    pub fn with_worker(mut self, worker: WorkerHint) -> Self {
        self.worker = worker;
        self
    }

    /// Set the feature set
    pub fn with_features(mut self, features: FeatureSet) -> Self {
        self.features = features;
        self
    }

    /// Set attach-to-tick
    pub fn attach_to_tick(mut self, attach: bool) -> Self {
        self.attach_to_tick = attach;
        self
    }

    /// Configure the inspector
    pub fn with_inspector(mut self, create: bool, port: u16) -> Self {
        self.create_inspector = create;
        self.inspector_port = port;
        self
    }

    /// Set the worker tick interval
    pub fn with_worker_tick_interval(mut self, interval: Duration) -> Self {
        self.worker_tick_interval = interval;
        self
    }

    /// Set the teardown wait bound
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn uses_host_thread(&self) -> bool {
        self.threading == ThreadingPolicy::HostThread
    }
}

/// Durations as integer microseconds.
mod micros {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_micros() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_micros)
    }
}
