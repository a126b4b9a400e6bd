use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::{Limits, ProductVersion};
use crate::daemon::apply::PipelineConfig;
use crate::daemon::handshake::HandshakeSettings;
use crate::daemon::locks::LockStatsMode;
use crate::daemon::object_ids::ObjectIdConfig;

use super::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub limits: Limits,
    pub pipeline: PipelineConfig,
    pub locks: LockConfig,
    pub object_ids: ObjectIdConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Rejects settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn nonzero(field: &'static str, value: u64) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
            Ok(())
        }

        nonzero("server.max_connections", self.server.max_connections as u64)?;
        nonzero("server.handshake_timeout_ms", self.server.handshake_timeout_ms)?;
        nonzero("pipeline.apply_workers", self.pipeline.apply_workers as u64)?;
        nonzero("pipeline.queue_capacity", self.pipeline.queue_capacity as u64)?;
        nonzero("limits.max_frame_bytes", self.limits.max_frame_bytes as u64)?;
        nonzero(
            "limits.channel_max_unacked",
            self.limits.channel_max_unacked as u64,
        )?;
        nonzero(
            "limits.channel_max_gap_messages",
            self.limits.channel_max_gap_messages as u64,
        )?;
        nonzero("limits.channel_ack_every", self.limits.channel_ack_every as u64)?;
        nonzero(
            "limits.outbound_queue_capacity",
            self.limits.outbound_queue_capacity as u64,
        )?;
        nonzero("object_ids.batch_size", self.object_ids.batch_size)?;
        if self.limits.keepalive_ms >= self.limits.dead_ms {
            return Err(ConfigError::Invalid {
                field: "limits.keepalive_ms",
                reason: format!(
                    "{} must be below limits.dead_ms ({})",
                    self.limits.keepalive_ms, self.limits.dead_ms
                ),
            });
        }
        self.server.product_version()?;
        Ok(())
    }

    pub fn handshake_settings(&self) -> Result<HandshakeSettings, ConfigError> {
        Ok(HandshakeSettings {
            server_version: self.server.product_version()?,
            enforce_version_match: self.server.enforce_version_match,
            timeout_ms: self.server.handshake_timeout_ms,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub max_connections: usize,
    /// Version reported to clients; major.minor must match theirs.
    pub server_version: String,
    pub enforce_version_match: bool,
    pub handshake_timeout_ms: u64,
}

impl ServerConfig {
    pub fn product_version(&self) -> Result<ProductVersion, ConfigError> {
        ProductVersion::parse(&self.server_version).ok_or_else(|| ConfigError::Invalid {
            field: "server.server_version",
            reason: format!("{:?} is not major.minor[.patch]", self.server_version),
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9510".to_string(),
            max_connections: 256,
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            enforce_version_match: true,
            handshake_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub stats: LockStatsMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Tree,
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Daily,
    Hourly,
    Minutely,
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    /// `EnvFilter` directives; `DSO_LOG` takes precedence.
    pub filter: Option<String>,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::Tree,
            filter: None,
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
    pub format: LogFormat,
    pub rotation: LogRotation,
    pub retention_max_age_days: Option<u64>,
    pub retention_max_files: Option<usize>,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            format: LogFormat::Json,
            rotation: LogRotation::Daily,
            retention_max_age_days: Some(7),
            retention_max_files: Some(10),
        }
    }
}
