// mulewatch/src/metrics.rs
//
// Process-wide operational counters.
//
// Counters exposed:
//
//   mw_records_processed_total    Counter — records fully scored and acked
//   mw_records_dropped_total      Counter — poison records dropped (acked)
//   mw_retries_exhausted_total    Counter — store retry budgets exhausted
//   mw_deadline_exceeded_total    Counter — records past the soft deadline
//   mw_alerts_published_total     Counter — alerts fanned out
//   mw_alerts_dropped_total       Counter — alerts dropped on slow subscribers
//   mw_subscribers_pruned_total   Counter — dead subscribers removed
//   mw_alerts_by_level{level}     Counter — scored records by risk level
//   mw_analyzer_cycles_total      Counter — completed analyzer cycles
//   mw_analyzer_failures_total    Counter — failed cycles (snapshot kept)
//   mw_snapshot_seq               Gauge   — current collusion snapshot sequence
//   mw_risk_score_bucket{le}      Counter — fused score distribution
//
// Rendered by hand in Prometheus text exposition format; no exporter crate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::events::RiskLevel;

pub struct EngineMetrics {
    pub records_processed:  AtomicU64,
    pub records_dropped:    AtomicU64,
    pub retries_exhausted:  AtomicU64,
    pub deadline_exceeded:  AtomicU64,
    pub alerts_published:   AtomicU64,
    pub alerts_dropped:     AtomicU64,
    pub subscribers_pruned: AtomicU64,
    pub level_low:          AtomicU64,
    pub level_medium:       AtomicU64,
    pub level_high:         AtomicU64,
    pub mules_flagged:      AtomicU64,
    pub analyzer_cycles:    AtomicU64,
    pub analyzer_failures:  AtomicU64,
    pub snapshot_seq:       AtomicU64,
    /// Fused score buckets [0,10), [10,20) … [90,100].
    pub score_buckets:      [AtomicU64; 10],
}

impl EngineMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records_processed:  AtomicU64::new(0),
            records_dropped:    AtomicU64::new(0),
            retries_exhausted:  AtomicU64::new(0),
            deadline_exceeded:  AtomicU64::new(0),
            alerts_published:   AtomicU64::new(0),
            alerts_dropped:     AtomicU64::new(0),
            subscribers_pruned: AtomicU64::new(0),
            level_low:          AtomicU64::new(0),
            level_medium:       AtomicU64::new(0),
            level_high:         AtomicU64::new(0),
            mules_flagged:      AtomicU64::new(0),
            analyzer_cycles:    AtomicU64::new(0),
            analyzer_failures:  AtomicU64::new(0),
            snapshot_seq:       AtomicU64::new(0),
            score_buckets:      Default::default(),
        })
    }

    pub fn record_scored(&self, score: f64, level: RiskLevel) {
        self.records_processed.fetch_add(1, Ordering::Relaxed);
        let bucket = ((score / 10.0) as usize).min(9);
        self.score_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        match level {
            RiskLevel::Low    => self.level_low.fetch_add(1, Ordering::Relaxed),
            RiskLevel::Medium => self.level_medium.fetch_add(1, Ordering::Relaxed),
            RiskLevel::High   => self.level_high.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// JSON view for /dashboard/stats.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_processed:  self.records_processed.load(Ordering::Relaxed),
            records_dropped:    self.records_dropped.load(Ordering::Relaxed),
            retries_exhausted:  self.retries_exhausted.load(Ordering::Relaxed),
            deadline_exceeded:  self.deadline_exceeded.load(Ordering::Relaxed),
            alerts_published:   self.alerts_published.load(Ordering::Relaxed),
            alerts_dropped:     self.alerts_dropped.load(Ordering::Relaxed),
            subscribers_pruned: self.subscribers_pruned.load(Ordering::Relaxed),
            level_low:          self.level_low.load(Ordering::Relaxed),
            level_medium:       self.level_medium.load(Ordering::Relaxed),
            level_high:         self.level_high.load(Ordering::Relaxed),
            mules_flagged:      self.mules_flagged.load(Ordering::Relaxed),
            analyzer_cycles:    self.analyzer_cycles.load(Ordering::Relaxed),
            analyzer_failures:  self.analyzer_failures.load(Ordering::Relaxed),
            snapshot_seq:       self.snapshot_seq.load(Ordering::Relaxed),
        }
    }

    /// Prometheus text exposition format.
    pub fn prometheus_text(&self, accounts: usize, pending: usize) -> String {
        let mut out = String::with_capacity(4096);

        macro_rules! counter {
            ($name:expr, $help:expr, $val:expr) => {
                out.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} counter\n{} {}\n",
                    $name, $help, $name, $name, $val
                ));
            };
        }
        macro_rules! gauge {
            ($name:expr, $help:expr, $val:expr) => {
                out.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} gauge\n{} {}\n",
                    $name, $help, $name, $name, $val
                ));
            };
        }

        counter!("mw_records_processed_total", "Records fully scored",
                 self.records_processed.load(Ordering::Relaxed));
        counter!("mw_records_dropped_total", "Poison records dropped",
                 self.records_dropped.load(Ordering::Relaxed));
        counter!("mw_retries_exhausted_total", "Store retry budgets exhausted",
                 self.retries_exhausted.load(Ordering::Relaxed));
        counter!("mw_deadline_exceeded_total", "Records past the soft deadline",
                 self.deadline_exceeded.load(Ordering::Relaxed));
        counter!("mw_alerts_published_total", "Alerts fanned out to subscribers",
                 self.alerts_published.load(Ordering::Relaxed));
        counter!("mw_alerts_dropped_total", "Alerts dropped on slow subscribers",
                 self.alerts_dropped.load(Ordering::Relaxed));
        counter!("mw_subscribers_pruned_total", "Dead subscribers removed",
                 self.subscribers_pruned.load(Ordering::Relaxed));
        counter!("mw_mules_flagged_total", "Transactions classified as mule activity",
                 self.mules_flagged.load(Ordering::Relaxed));
        counter!("mw_analyzer_cycles_total", "Completed batch analyzer cycles",
                 self.analyzer_cycles.load(Ordering::Relaxed));
        counter!("mw_analyzer_failures_total", "Failed analyzer cycles",
                 self.analyzer_failures.load(Ordering::Relaxed));

        out.push_str("# HELP mw_records_by_level Scored records by risk level\n");
        out.push_str("# TYPE mw_records_by_level counter\n");
        out.push_str(&format!("mw_records_by_level{{level=\"low\"}} {}\n",
                              self.level_low.load(Ordering::Relaxed)));
        out.push_str(&format!("mw_records_by_level{{level=\"medium\"}} {}\n",
                              self.level_medium.load(Ordering::Relaxed)));
        out.push_str(&format!("mw_records_by_level{{level=\"high\"}} {}\n",
                              self.level_high.load(Ordering::Relaxed)));

        gauge!("mw_snapshot_seq", "Current collusion snapshot sequence",
               self.snapshot_seq.load(Ordering::Relaxed));
        gauge!("mw_accounts_active", "Accounts present in the graph store", accounts);
        gauge!("mw_stream_pending", "Unacknowledged stream entries", pending);

        out.push_str("# HELP mw_risk_score_bucket Fused score distribution (10-point buckets)\n");
        out.push_str("# TYPE mw_risk_score_bucket counter\n");
        for (i, bucket) in self.score_buckets.iter().enumerate() {
            out.push_str(&format!(
                "mw_risk_score_bucket{{le=\"{}\"}} {}\n",
                (i + 1) * 10,
                bucket.load(Ordering::Relaxed)
            ));
        }

        out
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub records_processed:  u64,
    pub records_dropped:    u64,
    pub retries_exhausted:  u64,
    pub deadline_exceeded:  u64,
    pub alerts_published:   u64,
    pub alerts_dropped:     u64,
    pub subscribers_pruned: u64,
    pub level_low:          u64,
    pub level_medium:       u64,
    pub level_high:         u64,
    pub mules_flagged:      u64,
    pub analyzer_cycles:    u64,
    pub analyzer_failures:  u64,
    pub snapshot_seq:       u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_buckets_and_levels_accumulate() {
        let m = EngineMetrics::new();
        m.record_scored(5.0, RiskLevel::Low);
        m.record_scored(45.0, RiskLevel::Medium);
        m.record_scored(100.0, RiskLevel::High); // top bucket, not out of range
        assert_eq!(m.score_buckets[0].load(Ordering::Relaxed), 1);
        assert_eq!(m.score_buckets[4].load(Ordering::Relaxed), 1);
        assert_eq!(m.score_buckets[9].load(Ordering::Relaxed), 1);
        assert_eq!(m.snapshot().level_medium, 1);

        let text = m.prometheus_text(3, 0);
        assert!(text.contains("mw_records_processed_total 3"));
        assert!(text.contains("mw_accounts_active 3"));
    }
}
