//! Config loading and persistence.

mod env;
mod load;
mod schema;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::error::{Effect, Transience};

pub use env::{apply_env_overrides, apply_overrides_from};
pub use load::{CONFIG_ENV, config_path, load, load_from, write_config};
pub use schema::{
    Config, FileLoggingConfig, LockConfig, LogFormat, LogRotation, LoggingConfig, ServerConfig,
};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn transience(&self) -> Transience {
        match self {
            ConfigError::Read { .. } | ConfigError::Write { .. } => Transience::Unknown,
            _ => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            ConfigError::Write { .. } => Effect::Unknown,
            _ => Effect::None,
        }
    }
}
