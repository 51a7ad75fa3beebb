// mulewatch/src/engine/mule.rs
//
// Mule-account classifier. A per-transaction accumulator over weighted
// signals drawn from the rule flags and the collusion snapshot; the sum
// is capped at 1.0. A transaction is classified as mule activity when
// the accumulated score reaches 0.5 OR the fused risk reaches 65.

use crate::analyzer::{CollusionPattern, CollusionSnapshot};
use crate::events::{MuleVerdict, RuleFlag, TxRecord};

/// The 17 weighted mule signals, in evaluation order. Weights sit in the
/// 0.05–0.30 band; the strongest single tell is the relay pattern.
const SIGNALS: &[(MuleSignal, f64)] = &[
    (MuleSignal::Flag(RuleFlag::PassThrough),          0.25),
    (MuleSignal::Flag(RuleFlag::FanInPattern),         0.20),
    (MuleSignal::Flag(RuleFlag::SharedDevice),         0.20),
    (MuleSignal::Flag(RuleFlag::DeviceUserBurst),      0.25),
    (MuleSignal::Flag(RuleFlag::DormantReactivation),  0.15),
    (MuleSignal::FirstStrikeSpike,                     0.10),
    (MuleSignal::Flag(RuleFlag::SleepAndFlash),        0.15),
    (MuleSignal::Flag(RuleFlag::IdenticalStructuring), 0.20),
    (MuleSignal::Flag(RuleFlag::FixedAmountRepeat),    0.10),
    (MuleSignal::Flag(RuleFlag::EndpointRotation),     0.10),
    (MuleSignal::Flag(RuleFlag::RiskyAsn),             0.15),
    (MuleSignal::Flag(RuleFlag::HighRiskCommunity),    0.25),
    (MuleSignal::Flag(RuleFlag::SingleTxDominance),    0.05),
    (MuleSignal::Pattern(CollusionPattern::MoneyRouter),  0.20),
    (MuleSignal::Pattern(CollusionPattern::CircularFlow), 0.25),
    (MuleSignal::Pattern(CollusionPattern::RapidChain),   0.20),
    (MuleSignal::Pattern(CollusionPattern::RelayMule),    0.30),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MuleSignal {
    Flag(RuleFlag),
    Pattern(CollusionPattern),
    /// First strike compounded with a volume spike — two flags at once.
    FirstStrikeSpike,
}

impl MuleSignal {
    fn fires(&self, flags: &[RuleFlag], patterns: &[CollusionPattern]) -> bool {
        match self {
            Self::Flag(f)          => flags.contains(f),
            Self::Pattern(p)       => patterns.contains(p),
            Self::FirstStrikeSpike => {
                flags.contains(&RuleFlag::FirstStrike) && flags.contains(&RuleFlag::VolumeSpike)
            }
        }
    }

    fn name(&self) -> String {
        match self {
            Self::Flag(f)          => f.label().to_string(),
            Self::Pattern(p)       => p.to_string(),
            Self::FirstStrikeSpike => "first_strike_spike".to_string(),
        }
    }
}

/// Accumulator threshold and the fused-risk override.
const MULE_SCORE_THRESHOLD: f64 = 0.5;
const MULE_FUSED_THRESHOLD: f64 = 65.0;

#[derive(Default)]
pub struct MuleClassifier;

impl MuleClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(
        &self,
        tx:          &TxRecord,
        fired_flags: &[RuleFlag],
        snapshot:    &CollusionSnapshot,
        fused_score: f64,
    ) -> MuleVerdict {
        let patterns = snapshot.patterns_for(&tx.sender_id);

        let mut score = 0.0f64;
        let mut reasons = Vec::new();
        for (signal, weight) in SIGNALS {
            if signal.fires(fired_flags, patterns) {
                score += weight;
                reasons.push(signal.name());
            }
        }
        let score = score.min(1.0);

        let is_mule = score >= MULE_SCORE_THRESHOLD || fused_score >= MULE_FUSED_THRESHOLD;
        let confidence = if is_mule && fused_score >= MULE_FUSED_THRESHOLD {
            score.max(fused_score / 100.0)
        } else {
            score
        };

        MuleVerdict { is_mule, confidence, reasons }
    }
}
