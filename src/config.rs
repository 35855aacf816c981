//! Configuration management module
//!
//! Settings are layered: built-in defaults, then `DOCKER_SYNC_*` environment
//! variables, then command-line flags via [`SyncConfig::apply`]. A flag that
//! was given always wins, even when it names the default value.

use crate::error::{Result, SyncError};
use crate::image::Platform;
use crate::retry::DEFAULT_MAX_RETRIES;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_RETRY_TIMES: &str = "DOCKER_SYNC_RETRY_TIMES";
pub const ENV_COMMAND_TIMEOUT: &str = "DOCKER_SYNC_COMMAND_TIMEOUT";
pub const ENV_VERBOSE: &str = "DOCKER_SYNC_VERBOSE";
pub const ENV_OVERRIDE_OS: &str = "DOCKER_SYNC_OVERRIDE_OS";
pub const ENV_OVERRIDE_ARCH: &str = "DOCKER_SYNC_OVERRIDE_ARCH";

/// Application configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Retries per image after the first attempt
    pub retry_times: u32,
    /// Limit on the whole command, resolution and copies included
    pub command_timeout: Option<Duration>,
    pub verbose: bool,
    pub quiet: bool,
    /// Platform picked from manifest lists
    pub platform: Platform,
}

/// Values given explicitly on the command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub retry_times: Option<u32>,
    pub command_timeout: Option<Duration>,
    pub verbose: bool,
    pub quiet: bool,
    pub os: Option<String>,
    pub architecture: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry_times: DEFAULT_MAX_RETRIES,
            command_timeout: None,
            verbose: false,
            quiet: false,
            platform: Platform::default(),
        }
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| SyncError::Config(format!("Invalid value {:?} for {}: {}", value, name, e)))
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "" | "0" | "false" | "no" => Ok(false),
        _ => Err(SyncError::Config(format!(
            "Invalid value {:?} for {}: expected true or false",
            value, name
        ))),
    }
}

impl SyncConfig {
    /// Create config from environment variables and defaults
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SyncConfig::from_env`] with an explicit variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_RETRY_TIMES) {
            config.retry_times = parse_var(ENV_RETRY_TIMES, &value)?;
        }
        if let Some(value) = lookup(ENV_COMMAND_TIMEOUT) {
            let seconds: u64 = parse_var(ENV_COMMAND_TIMEOUT, &value)?;
            config.command_timeout = Some(Duration::from_secs(seconds));
        }
        if let Some(value) = lookup(ENV_VERBOSE) {
            config.verbose = parse_flag(ENV_VERBOSE, &value)?;
        }
        if let Some(os) = lookup(ENV_OVERRIDE_OS).filter(|v| !v.is_empty()) {
            config.platform.os = os;
        }
        if let Some(arch) = lookup(ENV_OVERRIDE_ARCH).filter(|v| !v.is_empty()) {
            config.platform.architecture = arch;
        }

        Ok(config)
    }

    /// Layer explicit command-line values on top
    pub fn apply(mut self, overrides: &ConfigOverrides) -> Self {
        if let Some(retry_times) = overrides.retry_times {
            self.retry_times = retry_times;
        }
        if let Some(timeout) = overrides.command_timeout {
            self.command_timeout = Some(timeout);
        }
        if overrides.verbose {
            self.verbose = true;
        }
        if overrides.quiet {
            self.quiet = true;
        }
        if let Some(os) = &overrides.os {
            self.platform.os = os.clone();
        }
        if let Some(architecture) = &overrides.architecture {
            self.platform.architecture = architecture.clone();
        }

        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.command_timeout == Some(Duration::ZERO) {
            return Err(SyncError::Validation(
                "command timeout must be greater than 0".to_string(),
            ));
        }
        if self.verbose && self.quiet {
            return Err(SyncError::Validation(
                "--verbose and --quiet cannot be used together".to_string(),
            ));
        }
        Ok(())
    }
}
