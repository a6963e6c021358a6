//! Watchdog configuration
//!
//! [`WatchdogConfig`] is either built in code through [`WatchdogConfigBuilder`]
//! or loaded from a JSON file. Durations are stored as milliseconds on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WatchdogError};
use crate::types::launch::LaunchParameters;
use crate::watchdog::policy::BackoffPolicy;

/// Default ceiling for one bridge payload in bytes
pub const DEFAULT_MAX_BRIDGE_PAYLOAD: usize = 8 * 1024;

/// Serde adapter storing a [`Duration`] as whole milliseconds
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize as milliseconds
    pub fn serialize<S>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserialize from milliseconds
    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Configuration for one watchdog instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchdogConfig {
    /// Name of the managed instance, reported to the worker
    pub instance_name: String,
    /// Engine executable that runs an artifact
    pub engine_executable: PathBuf,
    /// Extra engine flags (`flag` -> optional value), filtered by an allowlist
    pub engine_args: HashMap<String, Option<String>>,
    /// Extra environment for the worker
    pub env: HashMap<String, String>,
    /// Port the bridge server listens on
    pub bridge_port: u16,
    /// Largest single bridge payload in bytes
    pub max_bridge_payload: usize,
    /// How long a launched worker has to report startup
    #[serde(with = "duration_ms", rename = "startupTimeoutMs")]
    pub startup_timeout: Duration,
    /// Grace period for a graceful shutdown before the process is killed
    #[serde(with = "duration_ms", rename = "gracefulShutdownTimeoutMs")]
    pub graceful_shutdown_timeout: Duration,
    /// Launch attempts before the watchdog reports a fatal error
    pub launch_attempts: u32,
    /// Delay between failed launch attempts
    pub backoff: BackoffPolicy,
    /// Crashes in a row tolerated before settling offline
    pub max_consecutive_crashes: u32,
    /// Uptime after which a crash no longer counts toward the current streak
    #[serde(with = "duration_ms", rename = "stableUptimeMs")]
    pub stable_uptime: Duration,
    /// Timeout of the liveness probe sent to a worker before reattaching
    #[serde(with = "duration_ms", rename = "probeTimeoutMs")]
    pub probe_timeout: Duration,
    /// How long a deferred promotion may wait for a restart before one is forced
    #[serde(with = "duration_ms", rename = "promotionTimeoutMs")]
    pub promotion_timeout: Duration,
    /// Upper bound for delivering one event to the event consumer
    #[serde(with = "duration_ms", rename = "eventTimeoutMs")]
    pub event_timeout: Duration,
    /// Parameters of the first launch
    pub launch_parameters: LaunchParameters,
    /// Where the reattach record is persisted
    pub reattach_file: PathBuf,
    /// Directory of the artifact activated at startup (host binary only)
    pub artifact_directory: Option<PathBuf>,
    /// Entry file inside an artifact directory
    pub artifact_entry: String,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            instance_name: "default".to_string(),
            engine_executable: PathBuf::from("DreamDaemon"),
            engine_args: HashMap::new(),
            env: HashMap::new(),
            bridge_port: 5001,
            max_bridge_payload: DEFAULT_MAX_BRIDGE_PAYLOAD,
            startup_timeout: Duration::from_secs(60),
            graceful_shutdown_timeout: Duration::from_secs(10),
            launch_attempts: 3,
            backoff: BackoffPolicy::default(),
            max_consecutive_crashes: 5,
            stable_uptime: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(5),
            promotion_timeout: Duration::from_secs(30 * 60),
            event_timeout: Duration::from_secs(10),
            launch_parameters: LaunchParameters::default(),
            reattach_file: PathBuf::from("reattach.json"),
            artifact_directory: None,
            artifact_entry: "server.dmb".to_string(),
        }
    }
}

impl WatchdogConfig {
    /// Create a new builder for `WatchdogConfig`
    #[must_use]
    pub fn builder() -> WatchdogConfigBuilder {
        WatchdogConfigBuilder::default()
    }

    /// Load and validate a JSON config file
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed, or fails validation
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            WatchdogError::invalid_config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the supervision loop cannot work with
    ///
    /// # Errors
    /// Returns `InvalidConfig` describing the first offending field
    pub fn validate(&self) -> Result<()> {
        if self.launch_attempts == 0 {
            return Err(WatchdogError::invalid_config("launchAttempts must be at least 1"));
        }
        if self.max_bridge_payload < 64 {
            return Err(WatchdogError::invalid_config(
                "maxBridgePayload must be at least 64 bytes",
            ));
        }
        if self.startup_timeout.is_zero() {
            return Err(WatchdogError::invalid_config("startupTimeoutMs must be positive"));
        }
        if !(self.backoff.factor.is_finite() && self.backoff.factor > 0.0) {
            return Err(WatchdogError::invalid_config("backoff.factor must be positive"));
        }
        if self.bridge_port != 0 && self.bridge_port == self.launch_parameters.port {
            return Err(WatchdogError::invalid_config(
                "bridgePort must differ from the worker port",
            ));
        }
        if self.artifact_entry.is_empty() {
            return Err(WatchdogError::invalid_config("artifactEntry must not be empty"));
        }
        Ok(())
    }
}

// ============================================================================
// Builder for WatchdogConfig
// ============================================================================

/// Builder for `WatchdogConfig`
#[derive(Debug, Default)]
pub struct WatchdogConfigBuilder {
    config: WatchdogConfig,
}

impl WatchdogConfigBuilder {
    /// Set the instance name
    #[must_use]
    pub fn instance_name(mut self, name: impl Into<String>) -> Self {
        self.config.instance_name = name.into();
        self
    }

    /// Set the engine executable
    #[must_use]
    pub fn engine_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.engine_executable = path.into();
        self
    }

    /// Add an extra engine flag
    #[must_use]
    pub fn engine_arg(mut self, flag: impl Into<String>, value: Option<String>) -> Self {
        self.config.engine_args.insert(flag.into(), value);
        self
    }

    /// Add an environment variable for the worker
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.insert(key.into(), value.into());
        self
    }

    /// Set the bridge port
    #[must_use]
    pub fn bridge_port(mut self, port: u16) -> Self {
        self.config.bridge_port = port;
        self
    }

    /// Set the bridge payload ceiling
    #[must_use]
    pub fn max_bridge_payload(mut self, bytes: usize) -> Self {
        self.config.max_bridge_payload = bytes;
        self
    }

    /// Set the startup timeout
    #[must_use]
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.config.startup_timeout = timeout;
        self
    }

    /// Set the graceful shutdown grace period
    #[must_use]
    pub fn graceful_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.graceful_shutdown_timeout = timeout;
        self
    }

    /// Set the number of launch attempts
    #[must_use]
    pub fn launch_attempts(mut self, attempts: u32) -> Self {
        self.config.launch_attempts = attempts;
        self
    }

    /// Set the launch backoff policy
    #[must_use]
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.config.backoff = backoff;
        self
    }

    /// Set the crash ceiling
    #[must_use]
    pub fn max_consecutive_crashes(mut self, crashes: u32) -> Self {
        self.config.max_consecutive_crashes = crashes;
        self
    }

    /// Set the stable uptime window
    #[must_use]
    pub fn stable_uptime(mut self, uptime: Duration) -> Self {
        self.config.stable_uptime = uptime;
        self
    }

    /// Set the liveness probe timeout
    #[must_use]
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.probe_timeout = timeout;
        self
    }

    /// Set the promotion sanity timeout
    #[must_use]
    pub fn promotion_timeout(mut self, timeout: Duration) -> Self {
        self.config.promotion_timeout = timeout;
        self
    }

    /// Set the event delivery timeout
    #[must_use]
    pub fn event_timeout(mut self, timeout: Duration) -> Self {
        self.config.event_timeout = timeout;
        self
    }

    /// Set the initial launch parameters
    #[must_use]
    pub fn launch_parameters(mut self, parameters: LaunchParameters) -> Self {
        self.config.launch_parameters = parameters;
        self
    }

    /// Set the reattach record location
    #[must_use]
    pub fn reattach_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.reattach_file = path.into();
        self
    }

    /// Set the artifact entry file name
    #[must_use]
    pub fn artifact_entry(mut self, entry: impl Into<String>) -> Self {
        self.config.artifact_entry = entry.into();
        self
    }

    /// Build the `WatchdogConfig`
    #[must_use]
    pub fn build(self) -> WatchdogConfig {
        self.config
    }
}
