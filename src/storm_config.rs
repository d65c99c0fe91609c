/// Cluster configuration read from `storm.yaml`.
///
/// Only the keys needed to reach Nimbus are modelled; everything else in the
/// file is ignored.
use crate::config::ConfigError;
use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "/opt/storm/conf/storm.yaml";
pub const DEFAULT_NIMBUS_THRIFT_PORT: u16 = 6627;
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1_048_576;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StormConfig {
    #[serde(rename = "nimbus.host")]
    pub nimbus_host: Option<String>,
    /// Storm 1.x replaces `nimbus.host` with a seed list.
    #[serde(rename = "nimbus.seeds")]
    pub nimbus_seeds: Vec<String>,
    #[serde(rename = "nimbus.thrift.port")]
    pub nimbus_thrift_port: Option<u16>,
    #[serde(rename = "nimbus.thrift.max_buffer_size")]
    pub nimbus_thrift_max_buffer_size: Option<usize>,
}

/// Where and how to reach Nimbus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NimbusEndpoint {
    pub host: String,
    pub port: u16,
    pub max_buffer_size: usize,
}

impl StormConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents).map_err(|detail| ConfigError::Parse {
            path: path.to_path_buf(),
            detail,
        })
    }

    fn parse(contents: &str) -> Result<Self, String> {
        // A file holding only comments is a null document.
        let parsed: Option<StormConfig> =
            serde_yaml::from_str(contents).map_err(|e| e.to_string())?;
        Ok(parsed.unwrap_or_default())
    }

    /// Resolve the Nimbus endpoint, preferring `nimbus.host` over the first
    /// seed.
    pub fn nimbus_endpoint(&self) -> Result<NimbusEndpoint, ConfigError> {
        let host = self
            .nimbus_host
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .or_else(|| self.nimbus_seeds.first().map(String::as_str))
            .ok_or_else(|| ConfigError::Invalid {
                detail: "neither nimbus.host nor nimbus.seeds is set".to_string(),
            })?;
        Ok(NimbusEndpoint {
            host: host.trim().to_string(),
            port: self.nimbus_thrift_port.unwrap_or(DEFAULT_NIMBUS_THRIFT_PORT),
            max_buffer_size: self
                .nimbus_thrift_max_buffer_size
                .unwrap_or(DEFAULT_MAX_BUFFER_SIZE),
        })
    }
}
