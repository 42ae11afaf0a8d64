//! Configuration types

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration
///
/// The deserialized form of the configuration file. During a cycle build
/// each section is merged into the owning module's configuration slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    /// Core process configuration
    #[serde(default)]
    pub core: CoreConfig,

    /// Event/connection table configuration
    #[serde(default)]
    pub events: EventConfig,

    /// Listening endpoints
    #[serde(default)]
    pub listen: Vec<ListenConfig>,

    /// Shared memory zones declared in configuration
    #[serde(default)]
    pub zones: Vec<ZoneConfig>,
}

/// Core process configuration.
///
/// The rlimit, priority, affinity, and identity fields are advisory until
/// applied during process start; they have no effect on an already-running
/// process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoreConfig {
    /// Worker thread count (0 = one per CPU)
    #[serde(default)]
    pub worker_processes: usize,

    /// Periodic timer granularity
    #[serde(default = "default_timer_resolution", with = "humantime_serde")]
    pub timer_resolution: Duration,

    /// Graceful-shutdown deadline; connections still open after it elapses
    /// are force-closed
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Open-file limit for workers
    #[serde(default)]
    pub rlimit_nofile: Option<u64>,

    /// Core-dump size limit for workers (bytes)
    #[serde(default)]
    pub rlimit_core: Option<u64>,

    /// Scheduling priority (niceness)
    #[serde(default)]
    pub priority: i32,

    /// Explicit per-worker CPU sets; when empty and `cpu_affinity_auto` is
    /// set, worker `n` is pinned to CPU `n % cpus`
    #[serde(default)]
    pub cpu_affinity: Vec<Vec<usize>>,

    /// Spread workers over CPUs automatically
    #[serde(default)]
    pub cpu_affinity_auto: bool,

    /// User to run workers as
    #[serde(default)]
    pub user: Option<String>,

    /// Group to run workers as
    #[serde(default)]
    pub group: Option<String>,

    /// Working directory for workers
    #[serde(default)]
    pub working_directory: Option<PathBuf>,

    /// Lock file path
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    /// Pid file path
    #[serde(default = "default_pid_file")]
    pub pid: PathBuf,

    /// Environment variables passed to children.
    ///
    /// `"VAR"` inherits the variable from the master's environment,
    /// `"VAR=value"` sets it explicitly.
    #[serde(default)]
    pub env: Vec<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            worker_processes: 0,
            timer_resolution: default_timer_resolution(),
            shutdown_timeout: default_shutdown_timeout(),
            rlimit_nofile: None,
            rlimit_core: None,
            priority: 0,
            cpu_affinity: Vec::new(),
            cpu_affinity_auto: false,
            user: None,
            group: None,
            working_directory: None,
            lock_file: default_lock_file(),
            pid: default_pid_file(),
            env: Vec::new(),
        }
    }
}

impl CoreConfig {
    /// Effective worker count (resolves 0 to the CPU count).
    pub fn worker_count(&self) -> usize {
        if self.worker_processes == 0 {
            num_cpus::get()
        } else {
            self.worker_processes
        }
    }

    /// Path of the "old pid" file written during a binary upgrade.
    pub fn oldpid_path(&self) -> PathBuf {
        let mut name = self.pid.as_os_str().to_os_string();
        name.push(".oldbin");
        PathBuf::from(name)
    }

    /// CPU set for worker `n`, if affinity is configured.
    pub fn worker_affinity(&self, n: usize) -> Option<Vec<usize>> {
        if !self.cpu_affinity.is_empty() {
            // The last explicit mask covers any extra workers.
            let idx = n.min(self.cpu_affinity.len() - 1);
            return Some(self.cpu_affinity[idx].clone());
        }
        if self.cpu_affinity_auto {
            return Some(vec![n % num_cpus::get()]);
        }
        None
    }
}

/// Event/connection table configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventConfig {
    /// Per-worker connection table size
    #[serde(default = "default_connections")]
    pub connections: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            connections: default_connections(),
        }
    }
}

/// One listening endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenConfig {
    /// Address to listen on
    pub addr: SocketAddr,

    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

/// A shared memory zone declared in configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZoneConfig {
    /// Zone name; zone identity across reloads
    pub name: String,

    /// Requested size in bytes
    pub size: u64,

    /// Owning module name, disambiguates same-named zones
    pub owner: String,

    /// Force a fresh region on every reload
    #[serde(default)]
    pub noreuse: bool,
}

fn default_timer_resolution() -> Duration {
    Duration::from_millis(100)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("tiller.lock")
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("tiller.pid")
}

fn default_connections() -> usize {
    512
}

fn default_backlog() -> i32 {
    511
}
