//! Minimal metrics emission helpers.
//!
//! These helpers emit structured metrics via tracing by default. A test sink can
//! be installed to capture emissions in unit tests.

use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;

use crate::core::{ClientId, LockId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetricValue {
    Counter(u64),
    Gauge(u64),
    Histogram(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricLabel {
    pub key: &'static str,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricEvent {
    pub name: &'static str,
    pub value: MetricValue,
    pub labels: Vec<MetricLabel>,
}

pub trait MetricSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&self, event: MetricEvent) {
        let (kind, value) = match event.value {
            MetricValue::Counter(value) => ("counter", value),
            MetricValue::Gauge(value) => ("gauge", value),
            MetricValue::Histogram(value) => ("histogram", value),
        };
        tracing::info!(
            target: "metrics",
            metric = event.name,
            kind,
            value,
            labels = ?event.labels
        );
    }
}

static METRIC_SINK: OnceLock<RwLock<Arc<dyn MetricSink>>> = OnceLock::new();

fn sink() -> Arc<dyn MetricSink> {
    METRIC_SINK
        .get_or_init(|| RwLock::new(Arc::new(TracingSink)))
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

pub fn set_sink(sink: Arc<dyn MetricSink>) {
    let lock = METRIC_SINK.get_or_init(|| RwLock::new(Arc::new(TracingSink)));
    *lock.write().unwrap_or_else(PoisonError::into_inner) = sink;
}

fn emit(name: &'static str, value: MetricValue, labels: Vec<MetricLabel>) {
    sink().record(MetricEvent { name, value, labels });
}

fn duration_ms(duration: Duration) -> u64 {
    let ms = duration.as_millis();
    u64::try_from(ms).unwrap_or(u64::MAX)
}

fn client_label(client: ClientId) -> Vec<MetricLabel> {
    vec![MetricLabel {
        key: "client",
        value: client.to_string(),
    }]
}

fn lock_label(lock: &LockId) -> Vec<MetricLabel> {
    vec![MetricLabel {
        key: "lock",
        value: lock.to_string(),
    }]
}

pub fn apply_ok(duration: Duration) {
    emit("apply_ok", MetricValue::Counter(1), Vec::new());
    emit(
        "apply_duration",
        MetricValue::Histogram(duration_ms(duration)),
        Vec::new(),
    );
}

pub fn apply_err(client: ClientId, duration: Duration) {
    emit("apply_err", MetricValue::Counter(1), client_label(client));
    emit(
        "apply_duration",
        MetricValue::Histogram(duration_ms(duration)),
        Vec::new(),
    );
}

pub fn txn_duplicate(client: ClientId) {
    emit("txn_duplicate", MetricValue::Counter(1), client_label(client));
}

pub fn broadcasts_out(count: usize) {
    emit("broadcasts_out", MetricValue::Counter(count as u64), Vec::new());
}

pub fn handshake_ok(duration: Duration) {
    emit("handshake_ok", MetricValue::Counter(1), Vec::new());
    emit(
        "handshake_duration",
        MetricValue::Histogram(duration_ms(duration)),
        Vec::new(),
    );
}

pub fn handshake_rejected(reason: &'static str) {
    emit(
        "handshake_rejected",
        MetricValue::Counter(1),
        vec![MetricLabel {
            key: "reason",
            value: reason.to_string(),
        }],
    );
}

pub fn lock_granted(lock: &LockId) {
    emit("lock_granted", MetricValue::Counter(1), lock_label(lock));
}

pub fn lock_contended(lock: &LockId) {
    emit("lock_contended", MetricValue::Counter(1), lock_label(lock));
}

pub fn lock_notified(lock: &LockId, waiters: usize) {
    emit(
        "lock_notified",
        MetricValue::Counter(waiters as u64),
        lock_label(lock),
    );
}

pub fn set_connections(value: usize) {
    emit("connections", MetricValue::Gauge(value as u64), Vec::new());
}

pub fn set_apply_queue_depth(worker: usize, depth: usize) {
    emit(
        "apply_queue_depth",
        MetricValue::Gauge(depth as u64),
        vec![MetricLabel {
            key: "worker",
            value: worker.to_string(),
        }],
    );
}
