use std::str::FromStr;

use crate::daemon::locks::LockStatsMode;

use super::Config;

pub fn apply_env_overrides(config: &mut Config) {
    apply_overrides_from(config, |key| std::env::var(key).ok());
}

/// Applies overrides read through `lookup`. Malformed values are logged and
/// ignored.
pub fn apply_overrides_from(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let value = |key: &str| {
        lookup(key)
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
    };

    if let Some(addr) = value("DSO_LISTEN_ADDR") {
        config.server.listen_addr = addr;
    }
    if let Some(n) = parsed::<usize>("DSO_MAX_CONNECTIONS", value("DSO_MAX_CONNECTIONS")) {
        config.server.max_connections = n;
    }
    if let Some(n) = parsed::<usize>("DSO_APPLY_WORKERS", value("DSO_APPLY_WORKERS")) {
        config.pipeline.apply_workers = n;
    }
    if let Some(raw) = value("DSO_LOCK_STATS") {
        match raw.as_str() {
            "enabled" => config.locks.stats = LockStatsMode::Enabled,
            "disabled" => config.locks.stats = LockStatsMode::Disabled,
            other => tracing::warn!("invalid DSO_LOCK_STATS {other:?}, ignoring"),
        }
    }
}

fn parsed<T>(key: &str, raw: Option<String>) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = raw?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!("invalid {key}, ignoring: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = Config::default();
        apply_overrides_from(
            &mut config,
            env(&[
                ("DSO_LISTEN_ADDR", " 0.0.0.0:9999 "),
                ("DSO_MAX_CONNECTIONS", "12"),
                ("DSO_APPLY_WORKERS", "3"),
                ("DSO_LOCK_STATS", "enabled"),
            ]),
        );
        assert_eq!(config.server.listen_addr, "0.0.0.0:9999");
        assert_eq!(config.server.max_connections, 12);
        assert_eq!(config.pipeline.apply_workers, 3);
        assert_eq!(config.locks.stats, LockStatsMode::Enabled);
    }

    #[test]
    fn malformed_values_are_ignored() {
        let mut config = Config::default();
        apply_overrides_from(
            &mut config,
            env(&[("DSO_MAX_CONNECTIONS", "lots"), ("DSO_LISTEN_ADDR", "  ")]),
        );
        assert_eq!(config, Config::default());
    }
}
