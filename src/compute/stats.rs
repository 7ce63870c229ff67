//! Per-flow counters and latency histograms with a JSON snapshot for the
//! end-of-run summary.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Histogram bucket boundaries in milliseconds.
const BUCKETS_MS: [u64; 8] = [50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000];

/// A fixed-bucket latency histogram.
#[derive(Debug, Default)]
pub struct Histogram {
    counts: Mutex<HistogramInner>,
}

#[derive(Debug, Default, Clone)]
struct HistogramInner {
    buckets: [u64; BUCKETS_MS.len() + 1],
    total: u64,
    sum_ms: u64,
}

impl Histogram {
    pub fn observe(&self, latency: Duration) {
        let ms = latency.as_millis() as u64;
        let index = BUCKETS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(BUCKETS_MS.len());
        let mut inner = self.counts.lock().expect("histogram poisoned");
        inner.buckets[index] += 1;
        inner.total += 1;
        inner.sum_ms += ms;
    }

    fn snapshot(&self) -> serde_json::Value {
        let inner = self.counts.lock().expect("histogram poisoned").clone();
        let mean_ms = if inner.total > 0 {
            inner.sum_ms / inner.total
        } else {
            0
        };
        serde_json::json!({
            "count": inner.total,
            "mean_ms": mean_ms,
            "buckets": BUCKETS_MS
                .iter()
                .map(|b| b.to_string())
                .chain(std::iter::once("inf".to_string()))
                .zip(inner.buckets.iter())
                .map(|(bound, count)| serde_json::json!({ "le_ms": bound, "count": count }))
                .collect::<Vec<_>>(),
        })
    }
}

/// Counters and histograms for one flow.
#[derive(Debug, Default)]
pub struct FlowStats {
    pub in_flight: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub skipped: AtomicU64,
    pub dead: AtomicU64,
    pub api_call: Histogram,
    pub db_write: Histogram,
    pub overall: Histogram,
}

impl FlowStats {
    fn snapshot(&self, effective_rpm: Option<u32>) -> serde_json::Value {
        serde_json::json!({
            "in_flight": self.in_flight.load(Ordering::SeqCst),
            "succeeded": self.succeeded.load(Ordering::SeqCst),
            "failed": self.failed.load(Ordering::SeqCst),
            "skipped": self.skipped.load(Ordering::SeqCst),
            "dead": self.dead.load(Ordering::SeqCst),
            "effective_rpm": effective_rpm,
            "latency": {
                "api_call": self.api_call.snapshot(),
                "db_write": self.db_write.snapshot(),
                "overall": self.overall.snapshot(),
            },
        })
    }
}

/// Engine-wide statistics, one `FlowStats` per flow.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub analysis: FlowStats,
    pub embedding: FlowStats,
}

/// Snapshot returned by `compute run`.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot(pub serde_json::Value);

impl EngineStats {
    pub fn snapshot(
        &self,
        analysis_rpm: Option<u32>,
        embedding_rpm: Option<u32>,
    ) -> StatsSnapshot {
        StatsSnapshot(serde_json::json!({
            "analysis": self.analysis.snapshot(analysis_rpm),
            "embedding": self.embedding.snapshot(embedding_rpm),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_and_mean_accumulate() {
        let stats = FlowStats::default();
        stats.api_call.observe(Duration::from_millis(40));
        stats.api_call.observe(Duration::from_millis(400));
        stats.api_call.observe(Duration::from_millis(20_000));
        stats.succeeded.store(3, Ordering::SeqCst);

        let snapshot = stats.snapshot(Some(60));
        assert_eq!(snapshot["succeeded"], 3);
        assert_eq!(snapshot["effective_rpm"], 60);
        assert_eq!(snapshot["latency"]["api_call"]["count"], 3);
        let buckets = snapshot["latency"]["api_call"]["buckets"]
            .as_array()
            .expect("buckets");
        // 40ms lands in the first bucket, 20s in the overflow bucket.
        assert_eq!(buckets[0]["count"], 1);
        assert_eq!(buckets[buckets.len() - 1]["count"], 1);
    }
}
