use std::fs;
use std::path::{Path, PathBuf};

use super::env::apply_env_overrides;
use super::{Config, ConfigError};

/// Points at the config file to load instead of the default location.
pub const CONFIG_ENV: &str = "DSO_CONFIG";

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV)
        && !path.trim().is_empty()
    {
        return PathBuf::from(path);
    }
    crate::paths::config_dir().join("dso-l2.toml")
}

/// Loads [`config_path`]. A missing file yields the defaults.
pub fn load() -> Result<Config, ConfigError> {
    let path = config_path();
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        let mut config = Config::default();
        apply_env_overrides(&mut config);
        config.validate()?;
        return Ok(config);
    }
    load_from(&path)
}

/// Loads an explicit config file, then applies environment overrides.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

pub fn write_config(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|source| ConfigError::Write {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let contents = toml::to_string_pretty(cfg)?;
    atomic_write(path, contents.as_bytes())
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    fs::write(temp.path(), data).map_err(write_err)?;
    temp.persist(path).map_err(|err| write_err(err.error))?;
    Ok(())
}
