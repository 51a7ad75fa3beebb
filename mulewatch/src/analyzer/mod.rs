// mulewatch/src/analyzer/mod.rs
//
// Batch graph analyzer. Runs on its own cadence, never on worker tasks.
// Each cycle, in order:
//
//   1. refresh rolling account statistics (mean/std over the last 25
//      outgoing amounts, lifetime totals, last-active, dormancy flag)
//   2. refresh device user counts and derived risk
//   3. rebuild the account projection over TRANSFERRED_TO edges
//   4. Louvain → betweenness → PageRank(0.85) → clustering → WCC,
//      written back onto account profiles
//   5. six collusion detectors → new snapshot
//   6. cluster aggregates replaced wholesale
//
// The finished snapshot is swapped in atomically (arc-swap): readers see
// either the previous or the next complete cycle, never a mix. A failed
// cycle keeps the previous snapshot and bumps the failure counter.

pub mod algorithms;
pub mod collusion;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::extractors::device::device_base_risk;
use crate::metrics::EngineMetrics;
use crate::store::GraphStore;

pub use collusion::{CollusionPattern, CollusionSnapshot};

pub struct Analyzer {
    store:   Arc<GraphStore>,
    cache:   Arc<ArcSwap<CollusionSnapshot>>,
    metrics: Arc<EngineMetrics>,
    cfg:     Config,
}

impl Analyzer {
    pub fn new(store: Arc<GraphStore>, metrics: Arc<EngineMetrics>, cfg: Config) -> Arc<Self> {
        Arc::new(Self {
            store,
            cache: Arc::new(ArcSwap::from_pointee(CollusionSnapshot::empty())),
            metrics,
            cfg,
        })
    }

    /// Shared handle the workers and the API read snapshots through.
    pub fn cache(&self) -> Arc<ArcSwap<CollusionSnapshot>> {
        Arc::clone(&self.cache)
    }

    /// Cadence loop. Cycle failures leave the previous snapshot in place.
    pub async fn run(self: Arc<Self>) {
        let interval = Duration::from_secs(self.cfg.analyzer_interval_secs.max(1));
        loop {
            tokio::time::sleep(interval).await;
            self.tick(Utc::now());
        }
    }

    /// One cycle: compute, then swap. Extracted from `run` so tests and
    /// the replay path can drive cycles directly.
    pub fn tick(&self, now: DateTime<Utc>) {
        let seq = self.cache.load().seq + 1;
        match self.cycle(now, seq) {
            Ok(snapshot) => {
                self.cache.store(Arc::new(snapshot));
                self.metrics.analyzer_cycles.fetch_add(1, Ordering::Relaxed);
                self.metrics.snapshot_seq.store(seq, Ordering::Relaxed);
                debug!(seq, "analyzer cycle complete");
            }
            Err(e) => {
                self.metrics.analyzer_failures.fetch_add(1, Ordering::Relaxed);
                warn!("analyzer cycle failed, keeping previous snapshot: {e}");
            }
        }
    }

    fn cycle(&self, now: DateTime<Utc>, seq: u64) -> EngineResult<CollusionSnapshot> {
        self.refresh_account_profiles(now)?;
        self.refresh_devices(now);

        let edges = self.store.transfer_edges();
        let proj  = algorithms::build_projection(&edges);

        let communities = algorithms::louvain_communities(&proj);
        let betweenness = algorithms::betweenness(&proj);
        let pagerank    = algorithms::pagerank(&proj, 0.85, 50);
        let clustering  = algorithms::clustering_coefficients(&proj);
        let wcc         = algorithms::weakly_connected_components(&proj);

        for id in self.store.account_ids() {
            let Some(account) = self.store.accounts.get(&id).map(|a| a.clone()) else { continue };
            let mut a = account.write();
            a.profile.community_id = communities.get(&id).copied();
            a.profile.betweenness  = betweenness.get(&id).copied().unwrap_or(0.0);
            a.profile.pagerank     = pagerank.get(&id).copied().unwrap_or(0.0);
            a.profile.clustering   = clustering.get(&id).copied().unwrap_or(0.0);
            a.profile.wcc_id       = wcc.get(&id).copied();
        }

        let (patterns, clusters) = collusion::detect(
            &self.store, &edges, &communities, &betweenness, now, &self.cfg,
        );
        self.store.replace_clusters(clusters.clone());

        Ok(CollusionSnapshot {
            seq,
            generated_at: Some(now),
            membership:   communities,
            clusters:     clusters.into_iter().map(|c| (c.id, c)).collect(),
            patterns,
        })
    }

    /// Step 1 — the only writer of rolling statistics.
    fn refresh_account_profiles(&self, now: DateTime<Utc>) -> EngineResult<()> {
        for id in self.store.account_ids() {
            let Some(account) = self.store.accounts.get(&id).map(|a| a.clone()) else { continue };
            let mut a = account.write();

            let window: Vec<f64> = a.sent.iter().rev().take(25).map(|t| t.amount).collect();
            let (mean, std) = if window.is_empty() {
                (0.0, 0.0)
            } else {
                let mean = window.iter().sum::<f64>() / window.len() as f64;
                let var  = window.iter().map(|x| (x - mean).powi(2)).sum::<f64>()
                    / window.len() as f64;
                (mean, var.sqrt())
            };

            let last_active = a.last_activity();
            let dormant = last_active
                .map(|t| (now - t).num_days() > self.cfg.dormancy_days)
                .unwrap_or(false);

            if !mean.is_finite() || !std.is_finite() {
                return Err(EngineError::Analyzer(format!(
                    "non-finite rolling stats for account {id}"
                )));
            }

            a.profile.rolling_mean  = mean;
            a.profile.rolling_std   = std;
            a.profile.tx_count      = a.totals.sent_count + a.totals.recv_count;
            a.profile.outflow_total = a.totals.sent_sum;
            a.profile.last_active   = last_active;
            a.profile.dormant       = dormant;
            a.profile.refreshed_at  = Some(now);
        }
        Ok(())
    }

    /// Step 2 — device user counts and the derived-risk ladder.
    fn refresh_devices(&self, now: DateTime<Utc>) {
        let hashes: Vec<String> = self.store.devices.iter().map(|e| e.key().clone()).collect();
        for hash in hashes {
            let Some(view) = self.store.device_view(&hash, now) else { continue };
            let risk = device_base_risk(&view);
            if let Some(device) = self.store.devices.get(&hash).map(|d| d.clone()) {
                device.write().derived_risk = risk;
            }
        }
    }
}

/// A read handle over the swappable snapshot, cheap to clone into tasks.
pub type SnapshotHandle = Arc<ArcSwap<CollusionSnapshot>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TxRecord;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_772_000_000 + secs, 0).unwrap()
    }

    fn rec(tx: &str, from: &str, to: &str, amount: f64, at: DateTime<Utc>) -> TxRecord {
        serde_json::from_value(serde_json::json!({
            "tx_id": tx, "sender_id": from, "receiver_id": to,
            "amount": amount, "timestamp": at.to_rfc3339(),
        })).unwrap()
    }

    async fn ring_store() -> Arc<GraphStore> {
        let store = GraphStore::new(8);
        store.ingest(&rec("r1", "A", "B", 500.0, ts(0))).await.unwrap();
        store.ingest(&rec("r2", "B", "C", 480.0, ts(100))).await.unwrap();
        store.ingest(&rec("r3", "C", "A", 460.0, ts(200))).await.unwrap();
        store
    }

    #[tokio::test]
    async fn tick_swaps_a_complete_snapshot_with_increasing_seq() {
        let store = ring_store().await;
        let metrics = EngineMetrics::new();
        let analyzer = Analyzer::new(Arc::clone(&store), Arc::clone(&metrics), Config::default());
        let cache = analyzer.cache();

        assert_eq!(cache.load().seq, 0);
        analyzer.tick(ts(300));
        let snap1 = cache.load_full();
        assert_eq!(snap1.seq, 1);
        assert!(snap1.generated_at.is_some());

        analyzer.tick(ts(305));
        let snap2 = cache.load_full();
        assert_eq!(snap2.seq, 2);
        assert_eq!(metrics.snapshot().analyzer_cycles, 2);

        // the ring is a circular flow
        assert!(snap2.patterns_for("A").contains(&CollusionPattern::CircularFlow));
        assert!(snap2.patterns_for("B").contains(&CollusionPattern::CircularFlow));
    }

    #[tokio::test]
    async fn profiles_carry_rolling_stats_and_centrality_after_a_cycle() {
        let store = ring_store().await;
        let analyzer = Analyzer::new(Arc::clone(&store), EngineMetrics::new(), Config::default());
        analyzer.tick(ts(300));

        let profile = store.profile("A").unwrap();
        assert!((profile.rolling_mean - 500.0).abs() < 1e-9);
        assert_eq!(profile.tx_count, 2); // one sent, one received
        assert!(profile.community_id.is_some());
        assert!(profile.pagerank > 0.0);
        assert!(!profile.dormant);
    }

    #[tokio::test]
    async fn dormancy_flag_follows_the_configured_gap() {
        let store = GraphStore::new(8);
        store.ingest(&rec("t", "OLD", "B", 100.0, ts(0))).await.unwrap();
        let analyzer = Analyzer::new(Arc::clone(&store), EngineMetrics::new(), Config::default());

        analyzer.tick(ts(86_400 * 10)); // 10 days later
        assert!(!store.profile("OLD").unwrap().dormant);

        analyzer.tick(ts(86_400 * 40)); // 40 days later
        assert!(store.profile("OLD").unwrap().dormant);
    }

    #[tokio::test]
    async fn device_refresh_applies_the_ladder() {
        let store = GraphStore::new(8);
        for i in 0..5 {
            let r: TxRecord = serde_json::from_value(serde_json::json!({
                "tx_id": format!("d{i}"), "sender_id": format!("acct-{i}"),
                "receiver_id": "SINK", "amount": 10.0,
                "timestamp": ts(i).to_rfc3339(), "device_hash": "shared",
            })).unwrap();
            store.ingest(&r).await.unwrap();
        }
        let analyzer = Analyzer::new(Arc::clone(&store), EngineMetrics::new(), Config::default());
        analyzer.tick(ts(100));

        let view = store.device_view("shared", ts(100)).unwrap();
        assert_eq!(view.user_count, 5);
        assert_eq!(view.derived_risk, 100.0);
    }
}
