// mulewatch/src/engine/fusion.rs
//
// Weighted fusion of the five extractor scores into one risk score, the
// level mapping, and the explanation string.
//
// Weight distribution (configuration, must sum to 1.00; defaults):
//   Graph        0.30  — network position (highest precision once batch runs)
//   Behavioural  0.25  — per-sender anomaly rules
//   Device       0.20  — sharing and drift
//   Dormant      0.15  — reactivation patterns
//   Velocity     0.10  — burst / pass-through
//
// The explanation is assembled purely from the rule flags that fired
// during scoring: stable clause per flag, deduplicated, fixed extractor
// order. It never re-queries the graph, so identical inputs produce the
// identical string.

use std::time::Instant;

use chrono::Utc;

use crate::analyzer::CollusionSnapshot;
use crate::config::Config;
use crate::events::{
    ExtractorKind, FeatureScore, RiskLevel, RuleFlag, ScoreBreakdown, ScoredRecord, TxRecord,
};

pub struct FusionEngine {
    cfg: Config,
}

impl FusionEngine {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    /// Fuse the five extractor outputs for one transaction. `scores` is
    /// the fixed run_all order: behavioral, graph, device, dormant,
    /// velocity. Returns the scored record plus the deduplicated fired
    /// flags (the mule classifier consumes those directly).
    pub fn fuse(
        &self,
        tx:       &TxRecord,
        scores:   [FeatureScore; 5],
        snapshot: &CollusionSnapshot,
        started:  Instant,
    ) -> (ScoredRecord, Vec<RuleFlag>) {
        let [mut behav, graph, device, dead, vel] = scores;

        // The circadian × first-seen-device compound crosses extractor
        // boundaries, so it is resolved here: the circadian penalty is
        // raised to its compound value when the device was first seen.
        if behav.flags.contains(&RuleFlag::CircadianAnomaly)
            && device.flags.contains(&RuleFlag::FirstSeenDevice)
        {
            behav.score += self.cfg.circadian_compound - self.cfg.circadian_penalty;
            behav.flags.push(RuleFlag::CircadianNewDevice);
        }
        let behav = behav.clip();

        let breakdown = ScoreBreakdown {
            graph:        graph.score,
            behavioral:   behav.score,
            device:       device.score,
            dead_account: dead.score,
            velocity:     vel.score,
        };

        let [w_graph, w_behav, w_device, w_dead, w_vel] = self.cfg.weights();
        let fused = (w_graph * graph.score
            + w_behav * behav.score
            + w_device * device.score
            + w_dead * dead.score
            + w_vel * vel.score)
            .min(100.0);

        let level = RiskLevel::from_score(fused, self.cfg.high_threshold, self.cfg.medium_threshold);

        // Fixed presentation order, one firing per rule.
        let ordered = [&behav, &graph, &device, &dead, &vel];
        debug_assert_eq!(ordered[1].kind, ExtractorKind::GraphIntel);
        let mut seen: Vec<RuleFlag> = Vec::new();
        for fs in ordered {
            for flag in &fs.flags {
                if !seen.contains(flag) {
                    seen.push(*flag);
                }
            }
        }
        let flags: Vec<String> = seen.iter().map(|f| f.label().to_string()).collect();
        let reason = if seen.is_empty() {
            "no risk rules fired".to_string()
        } else {
            seen.iter().map(|f| f.clause()).collect::<Vec<_>>().join("; ")
        };

        let record = ScoredRecord {
            tx_id:              tx.tx_id.clone(),
            risk_score:         fused,
            risk_level:         level,
            breakdown,
            cluster_id:         snapshot.cluster_of(&tx.sender_id),
            flags,
            reason,
            is_mule:            None,
            mule_confidence:    None,
            processing_time_ms: started.elapsed().as_secs_f64() * 1_000.0,
            timestamp:          Utc::now(),
        };
        (record, seen)
    }
}
