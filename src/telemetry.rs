//! Tracing subscriber setup: stdout layer, optional rolling file layer and
//! an `EnvFilter` driven by `DSO_LOG`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::{FileLoggingConfig, LogFormat, LogRotation, LoggingConfig};
use crate::paths;

const LOG_FILE_PREFIX: &str = "dso-l2.log";
pub const LOG_ENV: &str = "DSO_LOG";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to install tracing subscriber: {0}")]
    Init(#[from] TryInitError),
}

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub verbosity: u8,
    pub logging: LoggingConfig,
}

impl TelemetryConfig {
    pub fn new(verbosity: u8, logging: LoggingConfig) -> Self {
        Self { verbosity, logging }
    }
}

/// Keeps the non-blocking file writers flushing until dropped.
pub struct TelemetryGuard {
    _guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
}

pub fn init(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let filter = build_filter(
        config.verbosity,
        std::env::var(LOG_ENV).ok().as_deref(),
        config.logging.filter.as_deref(),
    );

    let mut guards = Vec::new();
    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.logging.stdout {
        layers.push(format_layer(
            config.logging.stdout_format,
            std::io::stderr,
            true,
        ));
    }

    let mut prune_report = None;
    let mut setup_error = None;
    if config.logging.file.enabled {
        let dir = resolve_log_dir(&config.logging.file);
        match fs::create_dir_all(&dir) {
            Ok(()) => {
                let retention = RetentionLimits::from_file_config(&config.logging.file);
                if retention.is_enabled() {
                    match prune_logs(&dir, LOG_FILE_PREFIX, retention, SystemTime::now()) {
                        Ok(report) => prune_report = Some(report),
                        Err(err) => setup_error = Some(format!("log retention failed: {err}")),
                    }
                }
                let appender = tracing_appender::rolling::RollingFileAppender::new(
                    rotation(config.logging.file.rotation),
                    &dir,
                    LOG_FILE_PREFIX,
                );
                let (writer, guard) = tracing_appender::non_blocking(appender);
                layers.push(format_layer(config.logging.file.format, writer, false));
                guards.push(guard);
            }
            Err(err) => {
                setup_error = Some(format!("log dir init failed for {}: {err}", dir.display()));
            }
        }
    }

    layers.push(Box::new(filter));
    Registry::default().with(layers).try_init()?;

    if let Some(report) = prune_report {
        tracing::info!(
            pruned = report.removed,
            failed = report.failed,
            candidates = report.candidates,
            "log retention applied"
        );
    }
    if let Some(error) = setup_error {
        tracing::warn!("{error}");
    }

    Ok(TelemetryGuard { _guards: guards })
}

/// `DSO_LOG` wins over the configured filter; verbosity sets the fallback
/// level for targets neither mentions.
fn build_filter(verbosity: u8, from_env: Option<&str>, configured: Option<&str>) -> EnvFilter {
    let directives = from_env
        .filter(|raw| !raw.trim().is_empty())
        .or(configured)
        .unwrap_or_default();
    EnvFilter::builder()
        .with_default_directive(level_from_verbosity(verbosity).into())
        .parse_lossy(directives)
}

fn format_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Tree => Box::new(
            tracing_tree::HierarchicalLayer::new(2)
                .with_ansi(ansi)
                .with_writer(writer),
        ),
        LogFormat::Pretty => Box::new(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(writer)
                .with_ansi(ansi)
                .with_target(true)
                .with_thread_names(true),
        ),
        LogFormat::Compact => Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(writer)
                .with_ansi(ansi)
                .with_target(true)
                .with_thread_names(true),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_target(true)
                .with_thread_names(true)
                .with_current_span(true)
                .with_span_list(true),
        ),
    }
}

fn rotation(rotation: LogRotation) -> tracing_appender::rolling::Rotation {
    match rotation {
        LogRotation::Daily => tracing_appender::rolling::Rotation::DAILY,
        LogRotation::Hourly => tracing_appender::rolling::Rotation::HOURLY,
        LogRotation::Minutely => tracing_appender::rolling::Rotation::MINUTELY,
        LogRotation::Never => tracing_appender::rolling::Rotation::NEVER,
    }
}

fn level_from_verbosity(verbosity: u8) -> tracing::metadata::LevelFilter {
    match verbosity {
        0 => tracing::metadata::LevelFilter::WARN,
        1 => tracing::metadata::LevelFilter::INFO,
        2 => tracing::metadata::LevelFilter::DEBUG,
        _ => tracing::metadata::LevelFilter::TRACE,
    }
}

fn resolve_log_dir(config: &FileLoggingConfig) -> PathBuf {
    config.dir.clone().unwrap_or_else(paths::log_dir)
}

#[derive(Clone, Copy, Debug, Default)]
struct RetentionLimits {
    max_age: Option<Duration>,
    max_files: Option<usize>,
}

impl RetentionLimits {
    fn from_file_config(config: &FileLoggingConfig) -> Self {
        Self {
            max_age: config
                .retention_max_age_days
                .map(|days| Duration::from_secs(days.saturating_mul(24 * 60 * 60))),
            max_files: config.retention_max_files,
        }
    }

    fn is_enabled(&self) -> bool {
        self.max_age.is_some() || self.max_files.is_some()
    }
}

#[derive(Clone, Debug)]
struct LogEntry {
    path: PathBuf,
    modified: SystemTime,
}

#[derive(Clone, Debug, Default)]
struct PruneReport {
    candidates: usize,
    removed: usize,
    failed: usize,
}

fn prune_logs(
    dir: &Path,
    prefix: &str,
    retention: RetentionLimits,
    now: SystemTime,
) -> std::io::Result<PruneReport> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_log = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(prefix));
        let meta = entry.metadata()?;
        if !is_log || !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(now);
        entries.push(LogEntry { path, modified });
    }
    let candidates = entries.len();
    let mut report = PruneReport {
        candidates,
        ..PruneReport::default()
    };
    for path in select_expired(entries, retention, now) {
        match fs::remove_file(&path) {
            Ok(()) => report.removed += 1,
            Err(_) => report.failed += 1,
        }
    }
    Ok(report)
}

/// Files older than the age limit, then the oldest beyond the count limit.
fn select_expired(
    mut entries: Vec<LogEntry>,
    retention: RetentionLimits,
    now: SystemTime,
) -> Vec<PathBuf> {
    let mut removed = Vec::new();
    if let Some(max_age) = retention.max_age {
        let (old, keep): (Vec<_>, Vec<_>) = entries.into_iter().partition(|entry| {
            now.duration_since(entry.modified).unwrap_or(Duration::ZERO) > max_age
        });
        removed.extend(old.into_iter().map(|entry| entry.path));
        entries = keep;
    }
    if let Some(max_files) = retention.max_files
        && entries.len() > max_files
    {
        entries.sort_by_key(|entry| entry.modified);
        let excess = entries.len() - max_files;
        removed.extend(entries.drain(..excess).map(|entry| entry.path));
    }
    removed
}
