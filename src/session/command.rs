//! Engine command line building

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::artifacts::CompiledArtifact;
use crate::config::WatchdogConfig;
use crate::error::{Result, WatchdogError};
use crate::types::identifiers::AccessKey;
use crate::types::launch::LaunchParameters;
use crate::types::reattach::INTEROP_API_VERSION;

/// Environment variable carrying the bridge port
pub const ENV_BRIDGE_PORT: &str = "WATCHDOG_BRIDGE_PORT";

/// Environment variable carrying the session's access identifier
pub const ENV_ACCESS_IDENTIFIER: &str = "WATCHDOG_ACCESS_IDENTIFIER";

/// Environment variable carrying the interop API version
pub const ENV_API_VERSION: &str = "WATCHDOG_API_VERSION";

/// Environment variables that must not be overridden from configuration
///
/// These change how the engine loads code.
pub const DANGEROUS_ENV_VARS: &[&str] = &[
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "LD_AUDIT",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
    "PATH",
];

/// Engine flags that may be passed through `engine_args`
pub const ALLOWED_ENGINE_FLAGS: &[&str] = &["logself", "map-threads", "profile", "threads", "verbose"];

/// Resolve the engine executable.
///
/// Paths with a directory component must exist as given; bare names are
/// looked up on `PATH`.
///
/// # Errors
/// Returns `EngineNotFound` if nothing executable is found
pub fn find_engine(executable: &Path) -> Result<PathBuf> {
    if executable.components().count() > 1 {
        if executable.is_file() {
            return Ok(executable.to_path_buf());
        }
        return Err(WatchdogError::engine_not_found(executable));
    }

    which::which(executable).map_err(|_| WatchdogError::engine_not_found(executable))
}

/// Builds the engine command for one launch
pub struct CommandBuilder<'a> {
    engine: &'a Path,
    artifact: &'a CompiledArtifact,
    parameters: &'a LaunchParameters,
    config: &'a WatchdogConfig,
    access_key: &'a AccessKey,
}

impl<'a> CommandBuilder<'a> {
    /// Create a new command builder
    pub fn new(
        engine: &'a Path,
        artifact: &'a CompiledArtifact,
        parameters: &'a LaunchParameters,
        config: &'a WatchdogConfig,
        access_key: &'a AccessKey,
    ) -> Self {
        Self {
            engine,
            artifact,
            parameters,
            config,
            access_key,
        }
    }

    /// Engine arguments, in order
    #[must_use]
    pub fn arguments(&self) -> Vec<String> {
        let mut args = vec![
            self.artifact.entry_path().to_string_lossy().into_owned(),
            "-port".to_string(),
            self.parameters.port.to_string(),
            self.parameters.security_level.as_flag().to_string(),
            self.parameters.visibility.as_flag().to_string(),
        ];

        if self.parameters.allow_webclient {
            args.push("-webclient".to_string());
        }

        let mut extra: Vec<_> = self.config.engine_args.iter().collect();
        extra.sort_by(|a, b| a.0.cmp(b.0));
        for (flag, value) in extra {
            if !ALLOWED_ENGINE_FLAGS.contains(&flag.as_str()) {
                log::warn!("Ignoring engine flag -{} (not allowed)", flag);
                continue;
            }
            args.push(format!("-{flag}"));
            if let Some(value) = value {
                args.push(value.clone());
            }
        }

        args
    }

    /// Environment for the engine process
    #[must_use]
    pub fn environment(&self) -> HashMap<String, String> {
        let mut process_env = env::vars().collect::<HashMap<_, _>>();

        for (key, value) in &self.config.env {
            if DANGEROUS_ENV_VARS.contains(&key.as_str()) {
                log::warn!("Ignoring configured environment variable {}", key);
            } else {
                process_env.insert(key.clone(), value.clone());
            }
        }

        process_env.insert(ENV_BRIDGE_PORT.to_string(), self.config.bridge_port.to_string());
        process_env.insert(
            ENV_ACCESS_IDENTIFIER.to_string(),
            self.access_key.as_str().to_string(),
        );
        process_env.insert(ENV_API_VERSION.to_string(), INTEROP_API_VERSION.to_string());
        process_env
    }

    /// Build the complete engine command
    pub fn build(&self) -> Command {
        let mut cmd = Command::new(self.engine);
        cmd.args(self.arguments())
            .env_clear()
            .envs(self.environment())
            .current_dir(self.artifact.directory())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}
