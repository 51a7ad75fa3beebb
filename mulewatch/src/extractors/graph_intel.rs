// mulewatch/src/extractors/graph_intel.rs
//
// Graph-intelligence extractor — network position of the sender. All
// community and centrality inputs come from the latest batch snapshot;
// before the analyzer has produced one, every contribution here is zero
// and the engine keeps running on the other four extractors.
//
//   community risk    cluster ≥3 with mean risk >50: mean·0.30, else
//                     ≥2 high-risk members: +40
//   betweenness       min(b·200, 30)
//   pagerank          min(pr·500, 15)
//   fan-out / fan-in  +15 each (out≥5,in≤2 / in≥5,out≤2)
//   tight ring        +10 (clustering >0.5, degree >4)
//   contagion         mean 1-hop neighbour risk·0.3, cap 15

use crate::events::{ExtractorKind, FeatureScore, RuleFlag, TxRecord};

use super::ScoringContext;

pub async fn analyze(tx: &TxRecord, ctx: &ScoringContext<'_>) -> FeatureScore {
    let mut out = FeatureScore::new(ExtractorKind::GraphIntel);
    let profile = ctx.store.profile(&tx.sender_id).unwrap_or_default();

    // ── Community risk from the collusion snapshot ────────────────────────────
    if let Some(cluster_id) = ctx.snapshot.cluster_of(&tx.sender_id) {
        if let Some(stats) = ctx.snapshot.cluster_stats(cluster_id) {
            if stats.member_count >= 3 && stats.mean_risk > 50.0 {
                out.add(stats.mean_risk.min(100.0) * 0.30, RuleFlag::HighRiskCommunity);
            } else if stats.high_risk_members >= 2 {
                out.add(40.0, RuleFlag::HighRiskPeers);
            }
        }
    }

    // ── Centrality ────────────────────────────────────────────────────────────
    let betweenness_pts = (profile.betweenness * 200.0).min(30.0);
    if betweenness_pts > 0.0 {
        out.score += betweenness_pts;
        if betweenness_pts >= 15.0 {
            out.flags.push(RuleFlag::BetweennessHub);
        }
    }
    let pagerank_pts = (profile.pagerank * 500.0).min(15.0);
    if pagerank_pts > 0.0 {
        out.score += pagerank_pts;
        if pagerank_pts >= 10.0 {
            out.flags.push(RuleFlag::PageRankHub);
        }
    }

    // ── Structural patterns (O(1) degree reads on the hot path) ───────────────
    let (out_deg, in_deg) = ctx.store.degrees(&tx.sender_id);
    if out_deg >= 5 && in_deg <= 2 {
        out.add(15.0, RuleFlag::FanOutPattern);
    }
    if in_deg >= 5 && out_deg <= 2 {
        out.add(15.0, RuleFlag::FanInPattern);
    }
    if profile.clustering > 0.5 && out_deg + in_deg > 4 {
        out.add(10.0, RuleFlag::TightRing);
    }

    // ── Neighbour contagion ───────────────────────────────────────────────────
    let contagion = (ctx.store.neighbour_mean_risk(&tx.sender_id) * 0.3).min(15.0);
    if contagion > 0.0 {
        out.score += contagion;
        if contagion >= 10.0 {
            out.flags.push(RuleFlag::RiskyNeighbours);
        }
    }

    out.clip()
}
