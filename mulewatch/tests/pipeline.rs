// mulewatch/tests/pipeline.rs
//
// End-to-end scenarios over the full pipeline: ingest → enrich →
// extract → fuse → mule → persist → broadcast, with the batch analyzer
// driven explicitly between phases.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use mulewatch::config::Config;
use mulewatch::events::{RiskLevel, TxRecord};
use mulewatch::worker::Pipeline;

// 06:53 UTC → 12:23 local at UTC+05:30, comfortably mid-day
fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_772_002_400 + secs, 0).unwrap()
}

fn tx(id: &str, from: &str, to: &str, amount: f64, at: DateTime<Utc>) -> TxRecord {
    serde_json::from_value(serde_json::json!({
        "tx_id": id, "sender_id": from, "receiver_id": to,
        "amount": amount, "timestamp": at.to_rfc3339(),
    })).unwrap()
}

fn tx_full(
    id: &str, from: &str, to: &str, amount: f64, at: DateTime<Utc>,
    device: &str, ip: &str, credential: &str,
) -> TxRecord {
    serde_json::from_value(serde_json::json!({
        "tx_id": id, "sender_id": from, "receiver_id": to,
        "amount": amount, "timestamp": at.to_rfc3339(),
        "device_hash": device, "device_os": "Android 14",
        "ip_address": ip, "channel": "UPI", "credential_type": credential,
    })).unwrap()
}

fn asn_fixture() -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    writeln!(f, "49.37.0.0\t49.37.255.255\t55836\tIN\tReliance Jio Infocomm").unwrap();
    writeln!(f, "88.198.0.0\t88.198.255.255\t24940\tDE\tHetzner Online").unwrap();
    f.flush().unwrap();
    f
}

fn weighted_sum(scored: &mulewatch::events::ScoredRecord, cfg: &Config) -> f64 {
    let b = &scored.breakdown;
    cfg.weight_graph * b.graph
        + cfg.weight_behavioral * b.behavioral
        + cfg.weight_device * b.device
        + cfg.weight_dead * b.dead_account
        + cfg.weight_velocity * b.velocity
}

/// Invariant 1: bounds, and capping only ever reduces the weighted sum.
fn assert_fusion_invariants(scored: &mulewatch::events::ScoredRecord, cfg: &Config) {
    assert!(scored.risk_score >= 0.0 && scored.risk_score <= 100.0,
            "risk out of bounds: {}", scored.risk_score);
    let sum = weighted_sum(scored, cfg);
    assert!(scored.risk_score <= sum + 1e-9,
            "capping must only reduce: R={} sum={}", scored.risk_score, sum);
    if sum <= 100.0 {
        assert!((scored.risk_score - sum).abs() < 1e-9,
                "uncapped score must equal the weighted sum");
    }
}

// ── Scenario 1: normal mid-day payment ────────────────────────────────────────

#[tokio::test]
async fn normal_transaction_scores_low_with_no_flags() {
    let db = asn_fixture();
    let mut cfg = Config::default();
    cfg.asn_db_path = Some(db.path().to_string_lossy().into_owned());
    let p = Pipeline::new(cfg.clone());

    // mature sender: steady history on a known device and domestic mobile
    // ASN, with every hour of the day represented so no hour looks rare
    for i in 0..24 {
        let r = tx_full(&format!("h{i}"), "alice", "grocer", 480.0 + i as f64,
                        ts(i * 3_600), "alice-phone", "49.37.10.20", "MPIN");
        p.score_transaction(&r).await.unwrap();
    }
    p.analyzer.tick(ts(25 * 3_600));

    let rec = tx_full("cur", "alice", "grocer", 500.0, ts(26 * 3_600),
                      "alice-phone", "49.37.10.20", "MPIN");
    let scored = p.score_transaction(&rec).await.unwrap();

    assert_fusion_invariants(&scored, &cfg);
    assert_eq!(scored.risk_level, RiskLevel::Low);
    assert!(scored.risk_score < 40.0);
    assert!(scored.flags.is_empty(), "unexpected flags: {:?}", scored.flags);
    assert_eq!(scored.reason, "no risk rules fired");
    assert_eq!(scored.is_mule, None);
}

// ── Scenario 2: impossible travel ─────────────────────────────────────────────

#[tokio::test]
async fn impossible_travel_flags_without_inflating_the_level() {
    let cfg = Config::default();
    let p = Pipeline::new(cfg.clone());

    let mut first = tx("t1", "bob", "shop", 400.0, ts(0));
    first.sender_lat = Some(19.076);   // Mumbai
    first.sender_lon = Some(72.8777);
    p.score_transaction(&first).await.unwrap();

    let mut second = tx("t2", "bob", "shop", 400.0, ts(120)); // ~1150 km in 2 min
    second.sender_lat = Some(28.6139); // Delhi
    second.sender_lon = Some(77.209);
    let scored = p.score_transaction(&second).await.unwrap();

    assert_fusion_invariants(&scored, &cfg);
    assert!(scored.flags.contains(&"impossible_travel".into()));
    assert!(scored.breakdown.behavioral >= 20.0);
    assert_eq!(scored.risk_level, RiskLevel::Low); // one signal alone stays low
    assert!(scored.reason.contains("impossible travel"));
}

// ── Scenario 3: dormant reactivation with a spike ─────────────────────────────

#[tokio::test]
async fn dormant_reactivation_spike_dominates_the_dead_score() {
    let cfg = Config::default();
    let p = Pipeline::new(cfg.clone());

    p.score_transaction(&tx("warm", "sleeper", "shop", 100.0, ts(0))).await.unwrap();
    let gap = 45 * 86_400;
    p.analyzer.tick(ts(gap - 60)); // profile now carries the dormancy flag

    let scored = p.score_transaction(&tx("flash", "sleeper", "cashout", 6_000.0, ts(gap)))
        .await.unwrap();

    assert_fusion_invariants(&scored, &cfg);
    assert!(scored.breakdown.dead_account >= 75.0,
            "dead was {}", scored.breakdown.dead_account);
    assert!(scored.risk_score >= 11.25);
    assert!(scored.flags.contains(&"dormant_reactivation".into()));
    assert!(scored.flags.contains(&"sleep_and_flash".into()));
    assert!(scored.flags.contains(&"dormant_burst".into()));
}

// ── Scenario 4: device farm ───────────────────────────────────────────────────

#[tokio::test]
async fn device_farm_compound_lifts_the_device_score_past_77() {
    let cfg = Config::default();
    let p = Pipeline::new(cfg.clone());

    for i in 0..6 {
        let r = tx_full(&format!("farm{i}"), &format!("farm-{i}"), "sink", 50.0,
                        ts(i * 60), "farm-handset", "49.37.1.1", "MPIN");
        p.score_transaction(&r).await.unwrap();
    }
    // one established co-user carries a high risk score
    if let Some(a) = p.store.accounts.get("farm-0") {
        a.write().risk_score = 82.0;
    }

    let rec = tx_full("cur", "fresh-mule", "sink", 15_000.0, ts(600),
                      "farm-handset", "49.37.1.1", "MPIN");
    let scored = p.score_transaction(&rec).await.unwrap();

    assert_fusion_invariants(&scored, &cfg);
    assert!(scored.breakdown.device >= 77.0, "device was {}", scored.breakdown.device);
    assert!(scored.risk_score >= 15.4);
    for flag in ["shared_device", "new_device_high_value", "first_seen_device",
                 "high_risk_device_user"] {
        assert!(scored.flags.contains(&flag.into()), "missing {flag}");
    }
}

// ── Scenario 5: identical-amount structuring ──────────────────────────────────

#[tokio::test]
async fn structuring_fires_identicality_and_fixed_amount_rules() {
    let cfg = Config::default();
    let p = Pipeline::new(cfg.clone());

    // an established profile makes 9_999 a many-sigma outlier too
    for i in 0..15 {
        p.score_transaction(&tx(&format!("h{i}"), "smurf", "grocer", 500.0, ts(i * 3_600)))
            .await.unwrap();
    }
    p.analyzer.tick(ts(15 * 3_600 + 100));

    let base = 16 * 3_600;
    let mut last = None;
    for i in 0..4 {
        let r = tx(&format!("s{i}"), "smurf", "collector", 9_999.0, ts(base + i * 600));
        last = Some(p.score_transaction(&r).await.unwrap());
    }
    let scored = last.unwrap();

    assert_fusion_invariants(&scored, &cfg);
    assert!(scored.flags.contains(&"identical_structuring".into()));
    assert!(scored.flags.contains(&"fixed_amount_repeat".into()));
    assert!(scored.flags.contains(&"amount_deviation".into()));
    // identicality 30 + fixed 10 + z 20+ + IQR 15 + three-sigma 10
    assert!(scored.breakdown.behavioral >= 85.0,
            "behavioral was {}", scored.breakdown.behavioral);
    assert!(scored.risk_score >= 22.0);
}

// ── Scenario 6: hot Louvain community ─────────────────────────────────────────

#[tokio::test]
async fn hot_community_membership_feeds_the_graph_score() {
    let cfg = Config::default();
    let p = Pipeline::new(cfg.clone());

    // a dense 5-account ring with heavy mutual transfers
    let ring = ["m1", "m2", "m3", "m4", "m5"];
    let mut n = 0;
    for (i, from) in ring.iter().enumerate() {
        for (j, to) in ring.iter().enumerate() {
            if i == j { continue; }
            n += 1;
            p.score_transaction(&tx(&format!("r{n}"), from, to, 1_000.0, ts(n * 10)))
                .await.unwrap();
        }
    }
    for m in ring {
        if let Some(a) = p.store.accounts.get(m) {
            a.write().risk_score = 70.0;
        }
    }
    p.analyzer.tick(ts(10_000));

    let snap = p.snapshot.load_full();
    let cid = snap.cluster_of("m1").expect("m1 clustered");
    let stats = snap.cluster_stats(cid).expect("cluster stats");
    assert!(stats.member_count >= 5);
    assert!(stats.mean_risk > 50.0);

    let scored = p.score_transaction(&tx("cur", "m1", "m2", 1_000.0, ts(10_060)))
        .await.unwrap();
    assert_fusion_invariants(&scored, &cfg);
    assert!(scored.flags.contains(&"high_risk_community".into()));
    // community contribution alone is mean·0.30 ≥ 21
    assert!(scored.breakdown.graph >= 21.0, "graph was {}", scored.breakdown.graph);
    assert!(scored.risk_score >= 6.3);
    assert_eq!(scored.cluster_id, Some(cid));
}

// ── Laws ──────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn round_trip_stream_to_api_is_bit_exact() {
    let mut cfg = Config::default();
    cfg.workers = 1;
    cfg.record_deadline_ms = 5_000;
    let p = Pipeline::new(cfg);

    let record = tx("rt-1", "alice", "bob", 750.0, ts(0));
    p.stream.append(record.clone());
    let handles = p.spawn_workers();
    for _ in 0..300 {
        if p.stream.pending_count(&p.cfg.consumer_group) == 0 { break; }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(p.stream.pending_count(&p.cfg.consumer_group), 0, "worker acked");
    for h in handles { h.abort(); }

    let worker_result = p.store.scored_record("rt-1").expect("persisted");

    // the API path replays the same tx_id and must return the identical record
    let api_result = p.score_transaction(&record).await.unwrap();
    assert_eq!(serde_json::to_string(&*worker_result).unwrap(),
               serde_json::to_string(&*api_result).unwrap());
}

#[tokio::test]
async fn ingest_is_idempotent_on_tx_id() {
    let p = Pipeline::new(Config::default());
    let record = tx("dup", "alice", "bob", 750.0, ts(0));

    let first = p.score_transaction(&record).await.unwrap();
    let counts_before = p.store.counts();
    let second = p.score_transaction(&record).await.unwrap();

    assert_eq!(first.risk_score, second.risk_score);
    assert_eq!(first.reason, second.reason);
    let counts_after = p.store.counts();
    assert_eq!(counts_before.transactions, counts_after.transactions);
    assert_eq!(p.store.totals("alice").sent_count, 1);
}

#[tokio::test]
async fn explanations_are_deterministic_across_identical_pipelines() {
    let build = || async {
        let p = Pipeline::new(Config::default());
        let mut first = tx("t1", "bob", "shop", 400.0, ts(0));
        first.sender_lat = Some(19.076);
        first.sender_lon = Some(72.8777);
        p.score_transaction(&first).await.unwrap();
        let mut second = tx("t2", "bob", "shop", 400.0, ts(120));
        second.sender_lat = Some(28.6139);
        second.sender_lon = Some(77.209);
        p.score_transaction(&second).await.unwrap()
    };
    let a = build().await;
    let b = build().await;
    assert_eq!(a.reason, b.reason);
    assert_eq!(a.flags, b.flags);
    assert_eq!(a.risk_score, b.risk_score);
}

// ── Boundary cases ────────────────────────────────────────────────────────────

#[tokio::test]
async fn boundary_inputs_score_without_errors() {
    let cfg = Config::default();
    let p = Pipeline::new(cfg.clone());

    // zero amount
    let zero = p.score_transaction(&tx("z", "a", "b", 0.0, ts(0))).await.unwrap();
    assert_fusion_invariants(&zero, &cfg);

    // sender == receiver
    let selfie = p.score_transaction(&tx("s", "narc", "narc", 100.0, ts(1))).await.unwrap();
    assert_fusion_invariants(&selfie, &cfg);

    // empty behavioural history + first-seen device + unknown ip, no asn db
    let fresh = p.score_transaction(&tx_full("f", "newcomer", "b", 100.0, ts(2),
                                             "new-dev", "203.0.113.9", "OTP"))
        .await.unwrap();
    assert_fusion_invariants(&fresh, &cfg);
    assert!(fresh.flags.contains(&"first_seen_device".into()));

    // batch cache empty the whole time: graph contribution must be zero
    assert_eq!(zero.breakdown.graph, 0.0);
    assert_eq!(p.snapshot.load_full().seq, 0);
}

#[tokio::test]
async fn asn_database_absence_degrades_gracefully() {
    let p = Pipeline::new(Config::default()); // no asn_db_path
    let rec = tx_full("t", "a", "b", 100.0, ts(0), "d", "88.198.4.4", "MPIN");
    let scored = p.score_transaction(&rec).await.unwrap();
    // hosting-range ip contributes nothing without the database
    assert!(!scored.flags.contains(&"risky_asn".into()));
}

#[tokio::test]
async fn foreign_hosting_asn_contributes_when_the_database_is_present() {
    let db = asn_fixture();
    let mut cfg = Config::default();
    cfg.asn_db_path = Some(db.path().to_string_lossy().into_owned());
    let p = Pipeline::new(cfg);

    let rec = tx_full("t", "a", "b", 100.0, ts(0), "d", "88.198.4.4", "MPIN");
    let scored = p.score_transaction(&rec).await.unwrap();
    assert!(scored.flags.contains(&"risky_asn".into()));
    // foreign base 0.8·0.4 + foreign 0.2 → ≥ 0.52 → ≥ 10.4 points
    assert!(scored.breakdown.behavioral >= 10.0);
}

// ── Snapshot atomicity (invariant 5) ──────────────────────────────────────────

#[tokio::test]
async fn snapshot_sequence_is_strictly_monotone() {
    let p = Pipeline::new(Config::default());
    p.score_transaction(&tx("t1", "a", "b", 10.0, ts(0))).await.unwrap();

    let mut last = p.snapshot.load_full().seq;
    assert_eq!(last, 0);
    for i in 1..=5 {
        p.analyzer.tick(ts(i * 10));
        let snap = p.snapshot.load_full();
        assert_eq!(snap.seq, last + 1);
        assert!(snap.generated_at.is_some());
        last = snap.seq;
    }
    assert_eq!(p.metrics.snapshot().analyzer_cycles, 5);
}
