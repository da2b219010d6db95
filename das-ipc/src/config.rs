//! Component P — Configuration (ambient).
//!
//! `HostConfig` is assembled in four layers, each overriding the last
//! field-by-field: built-in defaults, an optional TOML file, `DAS_IPC_*`
//! environment variables, then CLI flags. CLI parsing is argv-scanning with
//! `--flag=value` prefix matching in the style of this workspace's
//! `jtag-mcp` worker, not a CLI-framework dependency.

use std::path::Path;

use serde::Deserialize;

use crate::error::{IpcError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct HostConfig {
    pub queue_prefix: String,
    pub shm_prefix: String,
    pub max_message_size: usize,
    pub max_messages: usize,
    pub shm_pool_size: usize,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub verbose: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            queue_prefix: "das_ipc".to_string(),
            shm_prefix: "das_ipc_shm".to_string(),
            // Comfortably fits the control-plane structs (§4.I) inline;
            // ordinary application payloads routinely take the SHM path.
            max_message_size: 4096,
            max_messages: 64,
            shm_pool_size: 64 * 1024 * 1024,
            heartbeat_interval_ms: crate::connection::HEARTBEAT_INTERVAL_MS,
            heartbeat_timeout_ms: crate::connection::HEARTBEAT_TIMEOUT_MS,
            verbose: false,
        }
    }
}

/// Mirror of `HostConfig` for the optional TOML layer: every field is
/// optional so a file can override just the settings it cares about.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
struct FileConfig {
    queue_prefix: Option<String>,
    shm_prefix: Option<String>,
    max_message_size: Option<usize>,
    max_messages: Option<usize>,
    shm_pool_size: Option<usize>,
    heartbeat_interval_ms: Option<u64>,
    heartbeat_timeout_ms: Option<u64>,
    verbose: Option<bool>,
}

impl HostConfig {
    fn apply_file(&mut self, file: FileConfig) {
        if let Some(v) = file.queue_prefix {
            self.queue_prefix = v;
        }
        if let Some(v) = file.shm_prefix {
            self.shm_prefix = v;
        }
        if let Some(v) = file.max_message_size {
            self.max_message_size = v;
        }
        if let Some(v) = file.max_messages {
            self.max_messages = v;
        }
        if let Some(v) = file.shm_pool_size {
            self.shm_pool_size = v;
        }
        if let Some(v) = file.heartbeat_interval_ms {
            self.heartbeat_interval_ms = v;
        }
        if let Some(v) = file.heartbeat_timeout_ms {
            self.heartbeat_timeout_ms = v;
        }
        if let Some(v) = file.verbose {
            self.verbose = v;
        }
    }

    fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("DAS_IPC_QUEUE_PREFIX") {
            self.queue_prefix = v;
        }
        if let Some(v) = get("DAS_IPC_SHM_PREFIX") {
            self.shm_prefix = v;
        }
        if let Some(v) = get("DAS_IPC_MAX_MESSAGE_SIZE").and_then(|v| v.parse().ok()) {
            self.max_message_size = v;
        }
        if let Some(v) = get("DAS_IPC_MAX_MESSAGES").and_then(|v| v.parse().ok()) {
            self.max_messages = v;
        }
        if let Some(v) = get("DAS_IPC_SHM_POOL_SIZE").and_then(|v| v.parse().ok()) {
            self.shm_pool_size = v;
        }
        if let Some(v) = get("DAS_IPC_HEARTBEAT_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.heartbeat_interval_ms = v;
        }
        if let Some(v) = get("DAS_IPC_HEARTBEAT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.heartbeat_timeout_ms = v;
        }
        if let Some(v) = get("DAS_IPC_VERBOSE").and_then(|v| v.parse().ok()) {
            self.verbose = v;
        }
    }

    /// Argv-scanning CLI layer: `--flag=value` prefix matching, `--verbose`
    /// as a bare switch. Unrecognized arguments are left for the caller
    /// (e.g. `--help`) rather than rejected here.
    fn apply_cli(&mut self, args: &[String]) {
        for arg in args {
            if arg == "--verbose" {
                self.verbose = true;
            } else if let Some(v) = arg.strip_prefix("--queue-prefix=") {
                self.queue_prefix = v.to_string();
            } else if let Some(v) = arg.strip_prefix("--shm-prefix=") {
                self.shm_prefix = v.to_string();
            } else if let Some(v) = arg.strip_prefix("--max-message-size=") {
                if let Ok(v) = v.parse() {
                    self.max_message_size = v;
                }
            } else if let Some(v) = arg.strip_prefix("--max-messages=") {
                if let Ok(v) = v.parse() {
                    self.max_messages = v;
                }
            } else if let Some(v) = arg.strip_prefix("--shm-pool-size=") {
                if let Ok(v) = v.parse() {
                    self.shm_pool_size = v;
                }
            } else if let Some(v) = arg.strip_prefix("--heartbeat-interval-ms=") {
                if let Ok(v) = v.parse() {
                    self.heartbeat_interval_ms = v;
                }
            } else if let Some(v) = arg.strip_prefix("--heartbeat-timeout-ms=") {
                if let Ok(v) = v.parse() {
                    self.heartbeat_timeout_ms = v;
                }
            }
        }
    }

    /// Load defaults, then `config_path` if it exists, then `DAS_IPC_*` env
    /// vars, then `args` (normally `std::env::args().skip(1)`, collected).
    pub fn load(config_path: Option<&Path>, args: &[String]) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path {
            if path.exists() {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    tracing::warn!(error = %e, path = %path.display(), "failed to read config file");
                    IpcError::InvalidArgument
                })?;
                let file: FileConfig = toml::from_str(&text).map_err(|e| {
                    tracing::warn!(error = %e, path = %path.display(), "failed to parse config file");
                    IpcError::DeserializationFailed
                })?;
                config.apply_file(file);
            }
        }

        config.apply_env(|key| std::env::var(key).ok());
        config.apply_cli(args);
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_connection_manager_constants() {
        let config = HostConfig::default();
        assert_eq!(config.heartbeat_interval_ms, crate::connection::HEARTBEAT_INTERVAL_MS);
        assert_eq!(config.heartbeat_timeout_ms, crate::connection::HEARTBEAT_TIMEOUT_MS);
        assert!(!config.verbose);
    }

    #[test]
    fn cli_flags_override_defaults() {
        let mut config = HostConfig::default();
        let args: Vec<String> = vec![
            "--verbose".to_string(),
            "--queue-prefix=custom_prefix".to_string(),
            "--max-message-size=8192".to_string(),
        ];
        config.apply_cli(&args);
        assert!(config.verbose);
        assert_eq!(config.queue_prefix, "custom_prefix");
        assert_eq!(config.max_message_size, 8192);
    }

    #[test]
    fn env_layer_overrides_defaults_but_not_cli() {
        let mut config = HostConfig::default();
        config.apply_env(|key| match key {
            "DAS_IPC_QUEUE_PREFIX" => Some("env_prefix".to_string()),
            "DAS_IPC_VERBOSE" => Some("true".to_string()),
            _ => None,
        });
        assert_eq!(config.queue_prefix, "env_prefix");
        assert!(config.verbose);

        config.apply_cli(&["--queue-prefix=cli_prefix".to_string()]);
        assert_eq!(config.queue_prefix, "cli_prefix");
    }

    #[test]
    fn file_layer_applies_only_present_fields() {
        let mut config = HostConfig::default();
        let original_prefix = config.queue_prefix.clone();
        config.apply_file(FileConfig {
            max_message_size: Some(2048),
            ..Default::default()
        });
        assert_eq!(config.max_message_size, 2048);
        assert_eq!(config.queue_prefix, original_prefix);
    }

    #[test]
    fn unknown_config_path_is_not_an_error() {
        let config = HostConfig::load(Some(Path::new("/nonexistent/das-ipc.toml")), &[]).unwrap();
        assert_eq!(config, HostConfig::default());
    }
}
