//! Worker configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};

/// Configuration for the worker daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Base URL of the backend store
    pub backend_url: String,

    /// Name the worker registers under (defaults to the host name)
    pub worker_name: Option<String>,

    /// Scratch directory for app archives moving between device and backend
    pub archive_dir: PathBuf,

    /// Store country used when a job does not name one
    pub default_store_country: String,

    /// Base URL of the App Store lookup service
    pub store_url: String,

    /// Attach the app container to the run as a result after execution
    pub save_run_results: bool,

    /// Polling intervals
    pub poll: PollConfig,

    /// Install and device-health policy
    pub install: InstallPolicy,

    /// Device tunnel settings
    pub tunnel: TunnelConfig,

    /// Backoff while the backend is unreachable at startup
    pub backoff: BackoffConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:8000".to_string(),
            worker_name: None,
            archive_dir: PathBuf::from("/tmp/apparchive"),
            default_store_country: "de".to_string(),
            store_url: "https://itunes.apple.com".to_string(),
            save_run_results: false,
            poll: PollConfig::default(),
            install: InstallPolicy::default(),
            tunnel: TunnelConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Get the worker name, falling back to the host name
    pub fn worker_name(&self) -> String {
        self.worker_name
            .clone()
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned())
    }
}

/// Fixed polling intervals of the worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Wait between job claims that returned no work
    #[serde(with = "duration_secs")]
    pub job_poll: Duration,

    /// Wait between agent status requests while a task runs
    #[serde(with = "duration_secs")]
    pub agent_status_poll: Duration,

    /// Wait between installed-app checks after pushing an archive
    #[serde(with = "duration_secs")]
    pub install_retry_interval: Duration,

    /// Interval of the supervisor's device enumeration
    #[serde(with = "duration_secs")]
    pub device_rescan: Duration,

    /// How long a stopped device loop may take to wind down before it is aborted
    #[serde(with = "duration_secs")]
    pub loop_join_timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            job_poll: Duration::from_secs(30),
            agent_status_poll: Duration::from_secs(5),
            install_retry_interval: Duration::from_secs(60),
            device_rescan: Duration::from_secs(5),
            loop_join_timeout: Duration::from_secs(10),
        }
    }
}

/// Install and device-health thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallPolicy {
    /// Device loops refuse work below this much free storage
    pub min_free_bytes: u64,

    /// Largest backend archive pushed directly to a device
    pub max_archive_install_bytes: u64,

    /// Installed-app checks after pushing an archive
    pub install_retries: u32,

    /// Newest OS major version that still supports archiving apps
    pub archive_max_os_major: u32,
}

impl Default for InstallPolicy {
    fn default() -> Self {
        Self {
            min_free_bytes: 1024 * 1024 * 1024,
            max_archive_install_bytes: 40_000_000,
            install_retries: 3,
            archive_max_os_major: 8,
        }
    }
}

/// Device tunnel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Host the per-device relay listeners bind to
    pub bind_host: String,

    /// Port of the agent on the device
    pub agent_port: u16,

    /// Transport rescan interval while no device is attached
    #[serde(with = "duration_millis")]
    pub idle_poll: Duration,

    /// Transport rescan interval while devices are attached
    #[serde(with = "duration_millis")]
    pub active_poll: Duration,

    /// Grace period for a relay to stop before it is aborted
    #[serde(with = "duration_secs")]
    pub relay_grace: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            agent_port: 8080,
            idle_poll: Duration::from_millis(1000),
            active_poll: Duration::from_millis(100),
            relay_grace: Duration::from_secs(5),
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}
