// mulewatch/src/extractors/dormant.rs
//
// Dormant-account extractor. A classic mule opening move is an account
// that sleeps for weeks and reactivates with an outsized transfer.
//
//   inactivity        min(days_dormant/30, 1)·30
//   spike vs profile  min((amount/μ)/10, 1)·30, or 25 with no history and amount > 5000
//   first strike      +25 with a volume spike, +20 without
//   sleep-and-flash   +20 when amount/μ ≥ 50 and dormancy ≥ 30 days
//   thin history      +10 when lifetime activity ≤ 3
//
// An account that is neither dormant nor on its first strike contributes
// the damped spike (·0.3) only.

use crate::events::{ExtractorKind, FeatureScore, RuleFlag, TxRecord};

use super::ScoringContext;

pub async fn analyze(tx: &TxRecord, ctx: &ScoringContext<'_>) -> FeatureScore {
    let mut out = FeatureScore::new(ExtractorKind::DormantAccount);
    let cfg = ctx.cfg;
    let profile = ctx.store.profile(&tx.sender_id).unwrap_or_default();
    let totals  = ctx.store.totals(&tx.sender_id);
    let mu      = profile.rolling_mean;

    // Pre-ingest activity gap, captured atomically at ingest. Falls back
    // to the batch profile for accounts whose live history was pruned.
    let prev_activity = ctx.report.prev_activity.or(profile.last_active);
    let days_dormant = prev_activity
        .map(|prev| (ctx.now(tx) - prev).num_seconds().max(0) as f64 / 86_400.0)
        .unwrap_or(0.0);

    let no_history = prev_activity.is_none() && mu <= 0.0;
    let is_dormant = days_dormant >= cfg.dormancy_days as f64;

    let spike = if mu > 0.0 {
        ((tx.amount / mu) / 10.0).min(1.0) * 30.0
    } else if no_history && tx.amount > 5_000.0 {
        25.0
    } else {
        0.0
    };
    let volume_spike = (mu > 0.0 && tx.amount > 2.0 * mu)
        || (no_history && tx.amount > 5_000.0);

    if !is_dormant {
        // Active account: damped spike only.
        out.score = spike * 0.3;
        if volume_spike {
            out.flags.push(RuleFlag::VolumeSpike);
        }
        return out.clip();
    }

    // The transaction that ends a dormant gap IS the first strike.
    out.add((days_dormant / 30.0).min(1.0) * 30.0, RuleFlag::DormantReactivation);

    if spike > 0.0 {
        out.score += spike;
        if volume_spike {
            out.flags.push(RuleFlag::VolumeSpike);
        }
    }

    out.add(if volume_spike { 25.0 } else { 20.0 }, RuleFlag::FirstStrike);

    if mu > 0.0 && tx.amount / mu >= cfg.sleep_flash_ratio {
        out.add(20.0, RuleFlag::SleepAndFlash);
    }

    if totals.sent_count + totals.recv_count <= 3 {
        out.add(10.0, RuleFlag::ThinHistory);
    }

    out.clip()
}
