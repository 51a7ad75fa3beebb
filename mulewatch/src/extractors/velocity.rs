// mulewatch/src/extractors/velocity.rs
//
// Velocity extractor — burst and pass-through behaviour inside the
// configured window (default 60 s).
//
//   burst         activity ≥10: 30, ≥5: 15
//   pass-through  r = sent/received; r > 0.80: min(r/1.5, 1)·35, r > 0.5: 10
//   velocity      min(activity/10, 1)·20
//   dominance     +15 when one transfer is >80% of lifetime outflow

use chrono::Duration;

use crate::events::{ExtractorKind, FeatureScore, RuleFlag, TxRecord};

use super::ScoringContext;

pub async fn analyze(tx: &TxRecord, ctx: &ScoringContext<'_>) -> FeatureScore {
    let mut out = FeatureScore::new(ExtractorKind::Velocity);
    let cfg = ctx.cfg;
    let now = ctx.now(tx);

    let window = ctx.store.activity_in_window(
        &tx.sender_id,
        now - Duration::seconds(cfg.velocity_window_secs),
    );
    let activity = window.activity();

    // ── Burst ─────────────────────────────────────────────────────────────────
    if activity >= cfg.burst_threshold {
        out.add(30.0, RuleFlag::VelocityBurst);
    } else if activity >= 5 {
        out.score += 15.0;
    }

    // ── Pass-through ratio inside the window ──────────────────────────────────
    if window.recv_sum > 0.0 {
        let r = window.sent_sum / window.recv_sum;
        if r > 0.80 {
            out.add((r / 1.5).min(1.0) * 35.0, RuleFlag::PassThrough);
        } else if r > 0.5 {
            out.score += 10.0;
        }
    }

    // ── Continuous velocity component ─────────────────────────────────────────
    out.score += (activity as f64 / 10.0).min(1.0) * 20.0;

    // ── Single-transaction dominance ──────────────────────────────────────────
    let totals = ctx.store.totals(&tx.sender_id);
    if totals.sent_sum > 0.0 && tx.amount / totals.sent_sum > 0.80 {
        out.add(15.0, RuleFlag::SingleTxDominance);
    }

    out.clip()
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{quiet_report, seed, ts, tx};
    use super::super::ScoringContext;
    use super::*;
    use crate::analyzer::collusion::CollusionSnapshot;
    use crate::config::Config;
    use crate::store::GraphStore;

    async fn run(store: &GraphStore, record: &TxRecord) -> FeatureScore {
        let cfg = Config::default();
        let snap = CollusionSnapshot::empty();
        let report = quiet_report();
        let ctx = ScoringContext {
            store, cfg: &cfg, snapshot: &snap, asn: None, report: &report,
        };
        analyze(record, &ctx).await
    }

    #[tokio::test]
    async fn rapid_fire_sender_hits_the_burst_ceiling() {
        let store = GraphStore::new(8);
        for i in 0..9 {
            store.ingest(&tx(&format!("b{i}"), "A", "B", 100.0, ts(i))).await.unwrap();
        }
        let record = tx("cur", "A", "B", 100.0, ts(9));
        store.ingest(&record).await.unwrap();

        let s = run(&store, &record).await;
        assert!(s.flags.contains(&RuleFlag::VelocityBurst));
        // burst 30 + velocity 20
        assert!(s.score >= 50.0, "score was {}", s.score);
    }

    #[tokio::test]
    async fn pass_through_fires_when_outflow_tracks_inflow() {
        let store = GraphStore::new(8);
        // 1000 in, then 950 straight back out, inside one minute
        store.ingest(&tx("in", "SRC", "A", 1_000.0, ts(0))).await.unwrap();
        let record = tx("out", "A", "SINK", 950.0, ts(30));
        store.ingest(&record).await.unwrap();

        let s = run(&store, &record).await;
        assert!(s.flags.contains(&RuleFlag::PassThrough));
        // r = 0.95 → (0.95/1.5)·35 ≈ 22.2
        assert!(s.score >= 22.0, "score was {}", s.score);
        // first and only send dominates lifetime outflow
        assert!(s.flags.contains(&RuleFlag::SingleTxDominance));
    }

    #[tokio::test]
    async fn partial_pass_through_gets_the_flat_contribution() {
        let store = GraphStore::new(8);
        store.ingest(&tx("in", "SRC", "A", 1_000.0, ts(0))).await.unwrap();
        let record = tx("out", "A", "SINK", 600.0, ts(30));
        store.ingest(&record).await.unwrap();

        let s = run(&store, &record).await;
        assert!(!s.flags.contains(&RuleFlag::PassThrough));
        // flat 10 + velocity (2 events → 4) + dominance 15
        assert!((s.score - 29.0).abs() < 0.5, "score was {}", s.score);
    }

    #[tokio::test]
    async fn seasoned_sender_with_spread_outflow_scores_low() {
        let store = GraphStore::new(8);
        seed(&store, 20, "A", "B", 200.0, 3600).await;
        let record = tx("cur", "A", "B", 200.0, ts(21 * 3600));
        store.ingest(&record).await.unwrap();

        let s = run(&store, &record).await;
        assert!(s.score <= 5.0, "score was {}", s.score);
        assert!(s.flags.is_empty());
    }
}
