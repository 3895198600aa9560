//! Driver configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::mount::StageMode;

pub const DRIVER_NAME: &str = "hostpath.csi.k8s.io";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DEFAULT_ENDPOINT: &str = "unix:///csi/csi.sock";
pub const DEFAULT_VOLUME_ROOT: &str = "/mnt/hostpath";

/// CSI caps plugin names at 63 characters.
const DRIVER_NAME_MAX_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub name: String,
    pub version: String,
    pub node_id: String,
    pub endpoint: String,
    pub volume_root: PathBuf,
    pub stage_mode: StageMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: DRIVER_NAME.to_string(),
            version: DRIVER_VERSION.to_string(),
            node_id: default_node_id(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            volume_root: PathBuf::from(DEFAULT_VOLUME_ROOT),
            stage_mode: StageMode::default(),
        }
    }
}

/// The local hostname, or "unknown" if it cannot be read.
pub fn default_node_id() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Where the gRPC server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl Endpoint {
    pub fn parse(endpoint: &str) -> Result<Self, ConfigError> {
        let unsupported = || ConfigError::UnsupportedScheme {
            endpoint: endpoint.to_string(),
        };
        if let Some(path) = endpoint.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(unsupported());
            }
            Ok(Self::Unix(PathBuf::from(path)))
        } else if let Some(addr) = endpoint.strip_prefix("tcp://") {
            addr.parse().map(Self::Tcp).map_err(|_| unsupported())
        } else {
            Err(unsupported())
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "name",
                reason: "must not be empty",
            });
        }
        if self.name.len() > DRIVER_NAME_MAX_LEN {
            return Err(ConfigError::InvalidValue {
                field: "name",
                reason: "must be at most 63 characters",
            });
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        {
            return Err(ConfigError::InvalidValue {
                field: "name",
                reason: "must contain only alphanumerics, '-' and '.'",
            });
        }
        if self.node_id.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "node_id",
                reason: "must not be empty",
            });
        }
        if !self.volume_root.is_absolute() {
            return Err(ConfigError::InvalidValue {
                field: "volume_root",
                reason: "must be an absolute path",
            });
        }
        Endpoint::parse(&self.endpoint)?;
        Ok(())
    }
}
