//! Per-target execution metrics
//!
//! Keyed by `(source_topic, target_id)`: a monotonic execution counter and
//! a ring buffer of the most recent execution records. Counters use atomic
//! increments; ring buffers take a per-target lock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;

/// Ring buffer capacity per target.
const LOG_CAPACITY: usize = 50;

/// One execution record.
#[derive(Debug, Clone, Serialize)]
pub struct ExecRecord {
    pub ts: DateTime<Utc>,
    pub in_topic: String,
    pub out_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

struct TargetMetrics {
    count: AtomicU64,
    logs: Mutex<VecDeque<ExecRecord>>,
    last_emit: Mutex<Instant>,
}

impl TargetMetrics {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            logs: Mutex::new(VecDeque::with_capacity(LOG_CAPACITY)),
            // Allow the first emit immediately.
            last_emit: Mutex::new(Instant::now() - Duration::from_secs(3600)),
        }
    }

    fn record(&self, record: ExecRecord) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        if logs.len() >= LOG_CAPACITY {
            logs.pop_back();
        }
        logs.push_front(record);
    }
}

/// Snapshot of one target's metrics.
#[derive(Debug, Clone, Serialize)]
pub struct TargetSnapshot {
    pub source_topic: String,
    pub target_id: String,
    pub count: u64,
    pub logs: Vec<ExecRecord>,
}

/// All mapper metrics, shared between the engine and the metrics endpoint.
#[derive(Default)]
pub struct MapperMetrics {
    targets: DashMap<(String, String), Arc<TargetMetrics>>,
}

impl MapperMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn target(&self, source_topic: &str, target_id: &str) -> Arc<TargetMetrics> {
        self.targets
            .entry((source_topic.to_string(), target_id.to_string()))
            .or_insert_with(|| Arc::new(TargetMetrics::new()))
            .clone()
    }

    pub fn record(&self, source_topic: &str, target_id: &str, record: ExecRecord) {
        self.target(source_topic, target_id).record(record);
    }

    pub fn count(&self, source_topic: &str, target_id: &str) -> u64 {
        self.targets
            .get(&(source_topic.to_string(), target_id.to_string()))
            .map_or(0, |t| t.count.load(Ordering::Relaxed))
    }

    /// Throttle check for hub emission: true at most once per
    /// `min_interval` per target.
    pub fn should_emit(&self, source_topic: &str, target_id: &str, min_interval: Duration) -> bool {
        let target = self.target(source_topic, target_id);
        let mut last = target
            .last_emit
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if last.elapsed() >= min_interval {
            *last = Instant::now();
            true
        } else {
            false
        }
    }

    /// Drop metrics for targets that no longer exist in the active version.
    pub fn retain_targets(&self, live: &[(String, String)]) {
        self.targets.retain(|key, _| live.contains(key));
    }

    /// Full snapshot for `/mapper/metrics` and the hub channel.
    pub fn snapshot(&self) -> Vec<TargetSnapshot> {
        let mut out: Vec<TargetSnapshot> = self
            .targets
            .iter()
            .map(|entry| {
                let (source_topic, target_id) = entry.key().clone();
                let logs = entry
                    .logs
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .cloned()
                    .collect();
                TargetSnapshot {
                    source_topic,
                    target_id,
                    count: entry.count.load(Ordering::Relaxed),
                    logs,
                }
            })
            .collect();
        out.sort_by(|a, b| {
            (a.source_topic.as_str(), a.target_id.as_str())
                .cmp(&(b.source_topic.as_str(), b.target_id.as_str()))
        });
        out
    }
}

impl ExecRecord {
    pub fn ok(in_topic: &str, out_topic: &str, out_payload: Value) -> Self {
        Self {
            ts: Utc::now(),
            in_topic: in_topic.to_string(),
            out_topic: out_topic.to_string(),
            out_payload: Some(out_payload),
            error: None,
            trace: None,
        }
    }

    pub fn error(in_topic: &str, out_topic: &str, error: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            in_topic: in_topic.to_string(),
            out_topic: out_topic.to_string(),
            out_payload: None,
            error: Some(error.into()),
            trace: None,
        }
    }

    pub fn trace(in_topic: &str, out_topic: &str, trace: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            in_topic: in_topic.to_string(),
            out_topic: out_topic.to_string(),
            out_payload: None,
            error: None,
            trace: Some(trace.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_is_monotonic_across_outcomes() {
        let metrics = MapperMetrics::new();
        metrics.record("a/b", "t1", ExecRecord::ok("a/b", "u/v", Value::Null));
        metrics.record("a/b", "t1", ExecRecord::error("a/b", "u/v", "Timeout"));
        metrics.record("a/b", "t1", ExecRecord::trace("a/b", "u/v", "skipped"));
        assert_eq!(metrics.count("a/b", "t1"), 3);
    }

    #[test]
    fn ring_buffer_keeps_most_recent_first() {
        let metrics = MapperMetrics::new();
        for i in 0..(LOG_CAPACITY + 10) {
            metrics.record(
                "a/b",
                "t1",
                ExecRecord::ok("a/b", "u/v", Value::from(i as u64)),
            );
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].logs.len(), LOG_CAPACITY);
        assert_eq!(
            snapshot[0].logs[0].out_payload,
            Some(Value::from((LOG_CAPACITY + 9) as u64))
        );
    }

    #[test]
    fn retain_discards_deleted_targets() {
        let metrics = MapperMetrics::new();
        metrics.record("a/b", "t1", ExecRecord::ok("a/b", "u/v", Value::Null));
        metrics.record("a/b", "t2", ExecRecord::ok("a/b", "u/w", Value::Null));

        metrics.retain_targets(&[("a/b".to_string(), "t1".to_string())]);
        assert_eq!(metrics.count("a/b", "t1"), 1);
        assert_eq!(metrics.count("a/b", "t2"), 0);
    }

    #[test]
    fn emission_is_throttled_per_target() {
        let metrics = MapperMetrics::new();
        assert!(metrics.should_emit("a/b", "t1", Duration::from_millis(500)));
        assert!(!metrics.should_emit("a/b", "t1", Duration::from_millis(500)));
        // Different target throttles independently
        assert!(metrics.should_emit("a/b", "t2", Duration::from_millis(500)));
    }
}
