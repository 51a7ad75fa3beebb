// mulewatch/src/extractors/device.rs
//
// Device-risk extractor. Device farms run dozens of accounts through a
// handful of handsets; the sharing degree, the users' own risk, and
// device identity drift all contribute.
//
//   shared accounts       ≥5: 40, ≥3: 25, ≥2: 10
//   risk propagation      min(device_base_risk/100, 1)·25
//   multi-user burst      +25 when >3 distinct accounts in 24h
//   device drift          os change +5, caps hamming·0.3 (cap 5), combined cap 15
//   new device high value +15 for first-seen + amount ≥ 10k + MPIN
//   first-seen device     +12
//   high-risk co-user     +10 when any user's risk > 80
//   uncommon OS           +10 for non-Android/iOS

use crate::events::{CredentialKind, ExtractorKind, FeatureScore, RuleFlag, TxRecord};
use crate::store::DeviceView;

use super::ScoringContext;

/// Fixed ladder for the device's derived risk, from its user population.
pub fn device_base_risk(view: &DeviceView) -> f64 {
    if view.user_count >= 5 {
        100.0
    } else if view.user_count >= 3 {
        70.0
    } else if view.user_risks.iter().any(|r| *r > 80.0) {
        60.0
    } else if view.user_risks.is_empty() {
        0.0
    } else {
        let mean = view.user_risks.iter().sum::<f64>() / view.user_risks.len() as f64;
        mean * 0.5
    }
}

pub async fn analyze(tx: &TxRecord, ctx: &ScoringContext<'_>) -> FeatureScore {
    let mut out = FeatureScore::new(ExtractorKind::Device);
    let cfg = ctx.cfg;

    let Some(hash) = tx.device_hash.as_deref() else {
        return out; // no device signal on this record
    };
    let Some(view) = ctx.store.device_view(hash, ctx.now(tx)) else {
        return out;
    };

    // ── Shared-account exposure ───────────────────────────────────────────────
    let shared = match view.user_count {
        n if n >= 5 => 40.0,
        n if n >= 3 => 25.0,
        2           => 10.0,
        _           => 0.0,
    };
    if shared > 0.0 {
        out.add(shared, RuleFlag::SharedDevice);
    }

    // ── Risk propagation from the device's user population ────────────────────
    let base_risk = device_base_risk(&view);
    if base_risk > 0.0 {
        out.score += (base_risk / 100.0).min(1.0) * 25.0;
        if base_risk >= 60.0 {
            out.flags.push(RuleFlag::RiskyDevice);
        }
    }

    // ── Multi-user burst ──────────────────────────────────────────────────────
    if view.distinct_users_24h > cfg.multi_user_threshold {
        out.add(cfg.multi_user_penalty, RuleFlag::DeviceUserBurst);
    }

    // ── Device drift ──────────────────────────────────────────────────────────
    let mut drift = 0.0;
    if ctx.report.os_changed {
        drift += 5.0;
    }
    drift += (ctx.report.caps_hamming as f64 * 0.3).min(5.0);
    let drift = drift.min(15.0);
    if drift > 0.0 {
        out.add(drift, RuleFlag::DeviceDrift);
    }

    // ── First-seen device signals ─────────────────────────────────────────────
    if ctx.report.first_device_use {
        if tx.amount >= cfg.new_device_high_amount && tx.credential_type == CredentialKind::Mpin {
            out.add(15.0, RuleFlag::NewDeviceHighValue);
        }
        out.add(12.0, RuleFlag::FirstSeenDevice);
    }

    // ── High-risk co-user ─────────────────────────────────────────────────────
    if view.user_risks.iter().any(|r| *r > 80.0) {
        out.add(10.0, RuleFlag::HighRiskDeviceUser);
    }

    // ── OS anomaly ────────────────────────────────────────────────────────────
    if let Some(os) = view.os_family.as_deref() {
        let family = crate::store::graph::os_family(os).to_ascii_lowercase();
        if family != "android" && family != "ios" {
            out.add(10.0, RuleFlag::UncommonOs);
        }
    }

    out.clip()
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{ts, tx};
    use super::super::ScoringContext;
    use super::*;
    use crate::analyzer::collusion::CollusionSnapshot;
    use crate::config::Config;
    use crate::store::GraphStore;

    fn device_tx(id: &str, from: &str, amount: f64, at: chrono::DateTime<chrono::Utc>) -> TxRecord {
        serde_json::from_value(serde_json::json!({
            "tx_id": id, "sender_id": from, "receiver_id": "SINK",
            "amount": amount, "timestamp": at.to_rfc3339(),
            "device_hash": "farm-device", "device_os": "Android 13",
            "credential_type": "MPIN",
        })).unwrap()
    }

    #[tokio::test]
    async fn device_farm_compound_matches_the_ladder() {
        let store = GraphStore::new(8);
        // six accounts on one device within the day
        for i in 0..6 {
            store.ingest(&device_tx(&format!("d{i}"), &format!("acct-{i}"), 50.0, ts(i * 60)))
                .await.unwrap();
        }
        // one co-user carries a risk of 82
        if let Some(a) = store.accounts.get("acct-0") {
            a.write().risk_score = 82.0;
        }

        let record = device_tx("cur", "fresh-account", 15_000.0, ts(600));
        let report = store.ingest(&record).await.unwrap();
        assert!(report.first_device_use);

        let cfg = Config::default();
        let snap = CollusionSnapshot::empty();
        let ctx = ScoringContext {
            store: &store, cfg: &cfg, snapshot: &snap, asn: None, report: &report,
        };
        let s = analyze(&record, &ctx).await;

        // shared 40 + propagation 25 + burst 25 + new-device-high 15 +
        // first-seen 12 + co-user 10 → clipped at 100
        assert!(s.score >= 77.0, "score was {}", s.score);
        assert_eq!(s.score, 100.0);
        for f in [RuleFlag::SharedDevice, RuleFlag::RiskyDevice, RuleFlag::DeviceUserBurst,
                  RuleFlag::NewDeviceHighValue, RuleFlag::FirstSeenDevice,
                  RuleFlag::HighRiskDeviceUser] {
            assert!(s.flags.contains(&f), "missing {f:?}");
        }
    }

    #[tokio::test]
    async fn personal_device_scores_zero() {
        let store = GraphStore::new(8);
        let warm = device_tx("w", "A", 100.0, ts(0));
        store.ingest(&warm).await.unwrap();
        let record = device_tx("cur", "A", 100.0, ts(60));
        let report = store.ingest(&record).await.unwrap();

        let cfg = Config::default();
        let snap = CollusionSnapshot::empty();
        let ctx = ScoringContext {
            store: &store, cfg: &cfg, snapshot: &snap, asn: None, report: &report,
        };
        let s = analyze(&record, &ctx).await;
        assert_eq!(s.score, 0.0);
        assert!(s.flags.is_empty());
    }

    #[tokio::test]
    async fn missing_device_hash_is_a_zero_contribution() {
        let store = GraphStore::new(8);
        let record = tx("cur", "A", "B", 100.0, ts(0));
        let report = store.ingest(&record).await.unwrap();

        let cfg = Config::default();
        let snap = CollusionSnapshot::empty();
        let ctx = ScoringContext {
            store: &store, cfg: &cfg, snapshot: &snap, asn: None, report: &report,
        };
        let s = analyze(&record, &ctx).await;
        assert_eq!(s.score, 0.0);
    }

    #[tokio::test]
    async fn os_drift_and_uncommon_os_accumulate() {
        let store = GraphStore::new(8);
        store.ingest(&device_tx("w", "A", 100.0, ts(0))).await.unwrap();

        let mut record = device_tx("cur", "A", 100.0, ts(60));
        record.device_os = Some("KaiOS 3.1".into());
        let report = store.ingest(&record).await.unwrap();
        assert!(report.os_changed);

        let cfg = Config::default();
        let snap = CollusionSnapshot::empty();
        let ctx = ScoringContext {
            store: &store, cfg: &cfg, snapshot: &snap, asn: None, report: &report,
        };
        let s = analyze(&record, &ctx).await;
        assert!(s.flags.contains(&RuleFlag::DeviceDrift));
        assert!(s.flags.contains(&RuleFlag::UncommonOs));
        // drift 5 + uncommon 10
        assert!((s.score - 15.0).abs() < 1e-9, "score was {}", s.score);
    }

    #[test]
    fn base_risk_ladder() {
        let mk = |users: usize, risks: Vec<f64>| DeviceView {
            user_count: users, derived_risk: 0.0, os_family: None, caps_mask: None,
            user_risks: risks, distinct_users_24h: 0,
        };
        assert_eq!(device_base_risk(&mk(6, vec![0.0; 6])), 100.0);
        assert_eq!(device_base_risk(&mk(3, vec![0.0; 3])), 70.0);
        assert_eq!(device_base_risk(&mk(2, vec![10.0, 85.0])), 60.0);
        assert_eq!(device_base_risk(&mk(2, vec![20.0, 40.0])), 15.0);
        assert_eq!(device_base_risk(&mk(1, vec![])), 0.0);
    }
}
