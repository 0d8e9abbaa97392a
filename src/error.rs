use std::path::PathBuf;

use thiserror::Error;

use crate::profile::CoreType;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to access {path:?}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path:?}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("profile {0} not found")]
    ProfileNotFound(String),

    #[error("no {core_type} executable found in {bin_dir:?}")]
    BinaryNotFound { core_type: CoreType, bin_dir: PathBuf },

    #[error("port {0} is already in use")]
    PortUnavailable(u16),

    #[error("failed to start {binary}: {reason}")]
    ProcessSpawn { binary: String, reason: String },

    #[error("config conversion failed: {0}")]
    Conversion(#[from] ConvertError),
}

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("source document has no `proxies` sequence")]
    MissingProxies,

    #[error("invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("listener {index} overflows the port range when starting at {start}")]
    PortRange { start: u16, index: usize },
}

pub type Result<T, E = CoreError> = std::result::Result<T, E>;
