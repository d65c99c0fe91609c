use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Tool settings, optionally loaded from a TOML file passed with `--settings`.
///
/// Cluster coordinates (Nimbus host and port) are not here; they come from
/// `storm.yaml` via [`crate::storm_config`].
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct ToolConfig {
    pub wait: WaitConfig,
    pub nimbus: NimbusConfig,
    pub deploy: DeployConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    /// Consecutive identical samples required to declare a topology stopped.
    pub check_count: usize,
    /// Keep one stability window for the whole wait instead of starting
    /// fresh on every probe.
    pub carry_window: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NimbusConfig {
    /// Applies to the TCP connect and to each RPC round trip.
    pub rpc_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    pub scp_command: String,
    pub ssh_command: String,
    pub sshpass_command: String,
    /// Octal mode applied to the pushed file on each node.
    pub file_mode: String,
    pub connect_timeout_secs: u64,
}

// --- Default implementations ---

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            check_count: 5,
            carry_window: false,
        }
    }
}

impl Default for NimbusConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_secs: 30,
        }
    }
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            scp_command: "scp".to_string(),
            ssh_command: "ssh".to_string(),
            sshpass_command: "sshpass".to_string(),
            file_mode: "0664".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

/// Errors loading either the tool settings or the cluster config.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        detail: String,
    },
    Invalid {
        detail: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, detail } => {
                write!(f, "failed to parse {}: {}", path.display(), detail)
            }
            ConfigError::Invalid { detail } => write!(f, "invalid configuration: {detail}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl ToolConfig {
    /// Load settings from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ToolConfig = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        config.validate()?;
        tracing::debug!(path = %path.display(), ?config, "loaded tool settings");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wait.check_count == 0 {
            return Err(ConfigError::Invalid {
                detail: "wait.check_count must be at least 1".to_string(),
            });
        }
        if self.nimbus.rpc_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                detail: "nimbus.rpc_timeout_secs must be at least 1".to_string(),
            });
        }
        let mode = &self.deploy.file_mode;
        if mode.is_empty() || mode.len() > 4 || !mode.chars().all(|c| ('0'..='7').contains(&c)) {
            return Err(ConfigError::Invalid {
                detail: format!("deploy.file_mode {mode:?} is not an octal mode"),
            });
        }
        Ok(())
    }
}
