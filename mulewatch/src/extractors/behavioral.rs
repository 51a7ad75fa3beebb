// mulewatch/src/extractors/behavioral.rs
//
// Behavioural extractor — per-sender anomaly rules over rolling history.
// Additive contributions, clipped at 100:
//
//   amount z-score        min(|z|·10, 30)   vs latest 25 outgoing amounts
//   velocity burst        min(A/10, 1)·20   sends+receives in the window
//   impossible travel     +20               >250 km/h between fixes
//   night window          +5                local hour ≤5 or ≥23
//   IQR outlier           +15               1.5·IQR fences, N≥4
//   three-sigma spike     +10               vs stored profile
//   dormant burst         +15               dormant and above profile mean
//   ASN risk              risk·20           from the resolver assessment
//   endpoint rotation     +15               ≥5 distinct endpoints in 24h
//   fixed-amount repeat   +10               same amount ≥3 times in 24h
//   circadian anomaly     +20               hour frequency <2% over ≥10 txs
//   identical structuring +30               ≥3 near-identical to one receiver in 1h
//
// The circadian × first-seen-device compound is resolved in fusion — the
// device signal originates in a different extractor.

use chrono::Duration;

use crate::events::{ExtractorKind, FeatureScore, RuleFlag, TxRecord};
use crate::store::graph::local_hour;

use super::{haversine_km, ScoringContext};

pub async fn analyze(tx: &TxRecord, ctx: &ScoringContext<'_>) -> FeatureScore {
    let mut out = FeatureScore::new(ExtractorKind::Behavioral);
    let cfg = ctx.cfg;
    let now = ctx.now(tx);
    let profile = ctx.store.profile(&tx.sender_id).unwrap_or_default();

    // ── Amount z-score vs the latest 25 outgoing amounts ─────────────────────
    // With fewer than two observations, fall back to the stored profile
    // with sigma floored at half the mean.
    let history = ctx.store.recent_out_amounts(&tx.sender_id, 25, &tx.tx_id);
    let (mu, sigma) = if history.len() >= 2 {
        let mu = history.iter().sum::<f64>() / history.len() as f64;
        let var = history.iter().map(|a| (a - mu).powi(2)).sum::<f64>() / history.len() as f64;
        (mu, var.sqrt())
    } else {
        (profile.rolling_mean, profile.rolling_std.max(0.5 * profile.rolling_mean))
    };
    if mu > 0.0 || sigma > 0.0 {
        let z = (tx.amount - mu) / sigma.max(1e-9);
        let pts = (z.abs() * 10.0).min(30.0);
        if pts > 0.0 {
            out.score += pts;
            if pts >= 20.0 {
                out.flags.push(RuleFlag::AmountDeviation);
            }
        }
    }

    // ── Velocity burst inside the configured window ───────────────────────────
    let window = ctx.store.activity_in_window(
        &tx.sender_id,
        now - Duration::seconds(cfg.velocity_window_secs),
    );
    let activity = window.activity();
    out.score += (activity as f64 / 10.0).min(1.0) * 20.0;
    if activity >= cfg.burst_threshold {
        out.flags.push(RuleFlag::BurstActivity);
    }

    // ── Impossible travel ─────────────────────────────────────────────────────
    if let (Some((prev_ts, plat, plon)), Some(lat), Some(lon)) =
        (ctx.report.prev_coords, tx.sender_lat, tx.sender_lon)
    {
        let km = haversine_km(plat, plon, lat, lon);
        let hours = ((now - prev_ts).num_seconds().max(1)) as f64 / 3600.0;
        if km / hours > cfg.impossible_kmh {
            out.add(20.0, RuleFlag::ImpossibleTravel);
        }
    }

    // ── Night window (local time) ─────────────────────────────────────────────
    let hour = local_hour(now, cfg.utc_offset_minutes);
    if hour <= 5 || hour >= 23 {
        out.add(5.0, RuleFlag::NightTransaction);
    }

    // ── IQR outlier ───────────────────────────────────────────────────────────
    if history.len() >= 4 {
        let mut sorted = history.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let q1 = quantile(&sorted, 0.25);
        let q3 = quantile(&sorted, 0.75);
        let iqr = q3 - q1;
        if tx.amount < q1 - 1.5 * iqr || tx.amount > q3 + 1.5 * iqr {
            out.add(15.0, RuleFlag::AmountOutlier);
        }
    }

    // ── Three-sigma spike vs the stored profile ───────────────────────────────
    if profile.rolling_mean > 0.0
        && tx.amount > profile.rolling_mean + 3.0 * profile.rolling_std
    {
        out.add(10.0, RuleFlag::ThreeSigmaSpike);
    }

    // ── Dormant burst ─────────────────────────────────────────────────────────
    if profile.dormant && tx.amount > profile.rolling_mean {
        out.add(15.0, RuleFlag::DormantBurst);
    }

    // ── ASN risk ──────────────────────────────────────────────────────────────
    if let Some(asn) = ctx.asn {
        out.score += asn.contribution();
        if asn.is_risky() {
            out.flags.push(RuleFlag::RiskyAsn);
        }
    }

    // ── Endpoint rotation ─────────────────────────────────────────────────────
    let endpoints = ctx.store.distinct_endpoints_since(&tx.sender_id, now - Duration::hours(24));
    if endpoints >= cfg.endpoint_rotation_max {
        out.add(15.0, RuleFlag::EndpointRotation);
    }

    // ── Fixed-amount repetition ───────────────────────────────────────────────
    let repeats = ctx.store.amount_repeats_since(
        &tx.sender_id, tx.amount, 0.01, now - Duration::hours(24),
    );
    if repeats >= 3 {
        out.add(10.0, RuleFlag::FixedAmountRepeat);
    }

    // ── Circadian anomaly ─────────────────────────────────────────────────────
    let hist = ctx.store.hour_histogram(&tx.sender_id, &tx.tx_id, cfg.utc_offset_minutes);
    let total: u32 = hist.iter().sum();
    if total >= 10 && (hist[hour as usize] as f64 / total as f64) < 0.02 {
        out.add(cfg.circadian_penalty, RuleFlag::CircadianAnomaly);
    }

    // ── Identical-amount structuring ──────────────────────────────────────────
    let to_receiver = ctx.store.amounts_to_receiver_since(
        &tx.sender_id, &tx.receiver_id, now - Duration::hours(1),
    );
    let identical = to_receiver.iter().filter(|a| (**a - tx.amount).abs() < 1.0).count();
    if identical >= cfg.identical_min_count {
        out.add(cfg.identical_penalty, RuleFlag::IdenticalStructuring);
    }

    out.clip()
}

/// Linear-interpolated quantile over a sorted slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() { return 0.0; }
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{quiet_report, seed, ts, tx};
    use super::super::ScoringContext;
    use super::*;
    use crate::analyzer::collusion::CollusionSnapshot;
    use crate::config::Config;
    use crate::store::GraphStore;

    #[tokio::test]
    async fn steady_sender_scores_low() {
        let store = GraphStore::new(8);
        // hourly history with ordinary spread: mean 495, sigma ≈ 29
        for i in 0..10 {
            let r = tx(&format!("seed-{i}"), "A", "B", 450.0 + i as f64 * 10.0, ts(i * 3600));
            store.ingest(&r).await.unwrap();
        }
        // half past the last seeded hour, so the hour itself is familiar
        let record = tx("cur", "A", "B", 510.0, ts(9 * 3600 + 1800));
        store.ingest(&record).await.unwrap();

        let cfg = Config::default();
        let snap = CollusionSnapshot::empty();
        let report = quiet_report();
        let ctx = ScoringContext {
            store: &store, cfg: &cfg, snapshot: &snap, asn: None, report: &report,
        };
        let s = analyze(&record, &ctx).await;
        assert!(s.score < 25.0, "score was {}", s.score);
        assert!(!s.flags.contains(&RuleFlag::AmountDeviation));
    }

    #[tokio::test]
    async fn outlier_amount_fires_zscore_and_iqr() {
        let store = GraphStore::new(8);
        seed(&store, 12, "A", "B", 500.0, 3600).await;
        // tiny spread so the spike is many sigmas out
        store.ingest(&tx("v1", "A", "B", 520.0, ts(13 * 3600))).await.unwrap();
        store.ingest(&tx("v2", "A", "B", 480.0, ts(14 * 3600))).await.unwrap();
        let record = tx("cur", "A", "B", 50_000.0, ts(15 * 3600));
        store.ingest(&record).await.unwrap();

        let cfg = Config::default();
        let snap = CollusionSnapshot::empty();
        let report = quiet_report();
        let ctx = ScoringContext {
            store: &store, cfg: &cfg, snapshot: &snap, asn: None, report: &report,
        };
        let s = analyze(&record, &ctx).await;
        assert!(s.flags.contains(&RuleFlag::AmountDeviation));
        assert!(s.flags.contains(&RuleFlag::AmountOutlier));
        // z cap 30 + IQR 15, velocity floor small
        assert!(s.score >= 45.0, "score was {}", s.score);
        assert!(s.score <= 100.0);
    }

    #[tokio::test]
    async fn impossible_travel_fires_on_fast_relocation() {
        let store = GraphStore::new(8);
        let mut first = tx("t1", "A", "B", 100.0, ts(0));
        first.sender_lat = Some(19.076);   // Mumbai
        first.sender_lon = Some(72.8777);
        store.ingest(&first).await.unwrap();

        let mut second = tx("t2", "A", "B", 100.0, ts(120)); // 2 minutes later
        second.sender_lat = Some(28.6139); // Delhi
        second.sender_lon = Some(77.209);
        let report = store.ingest(&second).await.unwrap();
        assert!(report.prev_coords.is_some());

        let cfg = Config::default();
        let snap = CollusionSnapshot::empty();
        let ctx = ScoringContext {
            store: &store, cfg: &cfg, snapshot: &snap, asn: None, report: &report,
        };
        let s = analyze(&second, &ctx).await;
        assert!(s.flags.contains(&RuleFlag::ImpossibleTravel));
        assert!(s.score >= 20.0);
    }

    #[tokio::test]
    async fn structuring_fires_on_repeated_identical_amounts() {
        let store = GraphStore::new(8);
        // four 9_999 transfers to the same receiver inside 40 minutes
        for i in 0..3 {
            store.ingest(&tx(&format!("s{i}"), "A", "M", 9_999.0, ts(i * 600))).await.unwrap();
        }
        let record = tx("cur", "A", "M", 9_999.0, ts(3 * 600));
        store.ingest(&record).await.unwrap();

        let cfg = Config::default();
        let snap = CollusionSnapshot::empty();
        let report = quiet_report();
        let ctx = ScoringContext {
            store: &store, cfg: &cfg, snapshot: &snap, asn: None, report: &report,
        };
        let s = analyze(&record, &ctx).await;
        assert!(s.flags.contains(&RuleFlag::IdenticalStructuring));
        assert!(s.flags.contains(&RuleFlag::FixedAmountRepeat));
        assert!(s.score >= 40.0, "structuring 30 + fixed 10, got {}", s.score);
    }

    #[tokio::test]
    async fn score_is_clipped_at_100() {
        let store = GraphStore::new(8);
        seed(&store, 12, "A", "B", 100.0, 60).await;
        // burst of structured night transfers
        for i in 0..9 {
            store.ingest(&tx(&format!("b{i}"), "A", "M", 60_000.0, ts(800 + i))).await.unwrap();
        }
        let record = tx("cur", "A", "M", 60_000.0, ts(810));
        store.ingest(&record).await.unwrap();

        let cfg = Config::default();
        let snap = CollusionSnapshot::empty();
        let report = quiet_report();
        let ctx = ScoringContext {
            store: &store, cfg: &cfg, snapshot: &snap, asn: None, report: &report,
        };
        let s = analyze(&record, &ctx).await;
        assert!(s.score <= 100.0);
        assert!(s.score >= 70.0, "score was {}", s.score);
    }
}
