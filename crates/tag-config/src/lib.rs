#![warn(missing_docs)]

//! # tag-config
//!
//! Configuration loading for tagbox.
//!
//! Supports TOML configuration files with environment variable expansion.
//!
//! ## Example
//!
//! ```toml
//! [sandbox]
//! wall_time_ms = 5000
//! memory_mib = 64
//! callbacks = ["fetchTag", "httpRequest", "reply"]
//!
//! [pool]
//! min_workers = 1
//! max_workers = 4
//! limiter = ["/usr/bin/cpulimit", "-l", "50", "--"]
//!
//! [remote]
//! url = "https://judge.example.com"
//! auth_token = "${JUDGE_TOKEN}"
//!
//! [tags]
//! hello = "return 'hi ' + args.join(' ')"
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Bridge operation names accepted in `sandbox.callbacks`.
pub const KNOWN_CALLBACKS: &[&str] = &[
    "findUsers",
    "dumpTags",
    "fetchTag",
    "fetchMessage",
    "fetchMessages",
    "httpRequest",
    "reply",
];

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level tagbox configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TagConfig {
    /// Sandbox execution settings shared by both backends.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Worker pool settings.
    #[serde(default)]
    pub pool: PoolOverrides,

    /// Remote execution service settings. Absent means the remote backend is disabled.
    #[serde(default)]
    pub remote: Option<RemoteSettings>,

    /// Local tag table, keyed by tag name, served by the CLI bridge.
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

/// Sandbox configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxOverrides {
    /// Wall-clock limit per execution in milliseconds.
    #[serde(default)]
    pub wall_time_ms: Option<u64>,

    /// Heap ceiling per execution in MiB.
    #[serde(default)]
    pub memory_mib: Option<usize>,

    /// Maximum concurrent in-process isolates.
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Maximum script size in KiB.
    #[serde(default)]
    pub max_code_size_kb: Option<usize>,

    /// Maximum serialized result size in KiB.
    #[serde(default)]
    pub max_output_size_kb: Option<usize>,

    /// Bridge operations exposed to scripts. Defaults to all of them.
    #[serde(default)]
    pub callbacks: Option<Vec<String>>,
}

/// Worker pool configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PoolOverrides {
    /// Idle workers kept warm.
    #[serde(default)]
    pub min_workers: Option<usize>,

    /// Upper bound on live worker processes.
    #[serde(default)]
    pub max_workers: Option<usize>,

    /// Directory for worker sockets.
    #[serde(default)]
    pub socket_dir: Option<String>,

    /// How long a new worker may take to announce its socket.
    #[serde(default)]
    pub spawn_timeout_ms: Option<u64>,

    /// How long `acquire()` may wait for capacity.
    #[serde(default)]
    pub acquire_timeout_ms: Option<u64>,

    /// RLIMIT_CPU applied to each worker, in seconds.
    #[serde(default)]
    pub cpu_time_secs: Option<u64>,

    /// Scheduling niceness applied to each worker.
    #[serde(default)]
    pub nice: Option<i32>,

    /// External CPU limiter command prefixed to the worker command line.
    #[serde(default)]
    pub limiter: Option<Vec<String>>,
}

/// Remote execution service settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSettings {
    /// Base URL of the judge API.
    pub url: String,

    /// Optional `X-Auth-Token` value.
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Status poll interval in milliseconds.
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,

    /// Memory limit handed to the service, in KiB.
    #[serde(default)]
    pub memory_limit_kb: Option<u64>,
}

impl TagConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: TagConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sandbox.wall_time_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.wall_time_ms must be greater than zero".into(),
            ));
        }
        if self.sandbox.memory_mib == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.memory_mib must be greater than zero".into(),
            ));
        }
        if let Some(callbacks) = &self.sandbox.callbacks {
            for name in callbacks {
                if !KNOWN_CALLBACKS.contains(&name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "sandbox.callbacks: unknown operation '{}', supported: {}",
                        name,
                        KNOWN_CALLBACKS.join(", ")
                    )));
                }
            }
        }

        let min = self.pool.min_workers.unwrap_or(0);
        if let Some(max) = self.pool.max_workers {
            if max == 0 {
                return Err(ConfigError::Invalid(
                    "pool.max_workers must be at least 1".into(),
                ));
            }
            if min > max {
                return Err(ConfigError::Invalid(format!(
                    "pool.min_workers ({}) exceeds pool.max_workers ({})",
                    min, max
                )));
            }
        }
        if let Some(limiter) = &self.pool.limiter {
            match limiter.first() {
                None => {
                    return Err(ConfigError::Invalid(
                        "pool.limiter must name a command when present".into(),
                    ))
                }
                // Workers start with an empty environment, so there is no PATH.
                Some(command) if !Path::new(command).is_absolute() => {
                    return Err(ConfigError::Invalid(format!(
                        "pool.limiter command must be an absolute path, got '{command}'"
                    )))
                }
                Some(_) => {}
            }
        }

        if let Some(remote) = &self.remote {
            if !(remote.url.starts_with("http://") || remote.url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!(
                    "remote.url must be an http(s) URL, got '{}'",
                    remote.url
                )));
            }
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                Err(_) => {
                    // Leave the placeholder if env var not found
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(ch);
        }
    }

    result
}
