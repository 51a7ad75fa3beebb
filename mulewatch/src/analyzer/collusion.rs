// mulewatch/src/analyzer/collusion.rs
//
// Collusion pattern detection and the hot-path snapshot it produces.
//
// Six patterns, recomputed each batch cycle over the transfer graph:
//   fraud island   — community of ≥3 accounts with mean risk >40
//   money router   — betweenness at or above the configured threshold
//   circular flow  — A→B→…→A within 7 days, up to 5 nodes
//   rapid chain    — 2–4 hop path with consecutive hop gaps <300 s
//   star hub       — degree ≥5 with an asymmetric fan
//   relay mule     — outflow/inflow >0.75 over a 10-minute window
//
// The snapshot is immutable once built; readers take a pointer copy via
// arc-swap and never observe a partially updated cycle.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::Config;
use crate::store::{ClusterStats, GraphStore, TransferEdgeView};

// ── Patterns ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollusionPattern {
    FraudIsland,
    MoneyRouter,
    CircularFlow,
    RapidChain,
    StarHub,
    RelayMule,
}

impl std::fmt::Display for CollusionPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FraudIsland  => write!(f, "fraud_island"),
            Self::MoneyRouter  => write!(f, "money_router"),
            Self::CircularFlow => write!(f, "circular_flow"),
            Self::RapidChain   => write!(f, "rapid_chain"),
            Self::StarHub      => write!(f, "star_hub"),
            Self::RelayMule    => write!(f, "relay_mule"),
        }
    }
}

// ── Snapshot ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct CollusionSnapshot {
    pub seq:          u64,
    pub generated_at: Option<DateTime<Utc>>,
    pub membership:   HashMap<String, i64>,
    pub clusters:     HashMap<i64, ClusterStats>,
    pub patterns:     HashMap<String, Vec<CollusionPattern>>,
}

impl CollusionSnapshot {
    /// The pre-first-cycle snapshot: graph features contribute zero.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn cluster_of(&self, account: &str) -> Option<i64> {
        self.membership.get(account).copied()
    }

    pub fn cluster_stats(&self, id: i64) -> Option<&ClusterStats> {
        self.clusters.get(&id)
    }

    pub fn patterns_for(&self, account: &str) -> &[CollusionPattern] {
        self.patterns.get(account).map(Vec::as_slice).unwrap_or(&[])
    }
}

// ── Detection ─────────────────────────────────────────────────────────────────

const CIRCULAR_WINDOW_DAYS: i64 = 7;
const CHAIN_GAP_SECS:       i64 = 300;
const RELAY_WINDOW_MINS:    i64 = 10;
const RELAY_RATIO:          f64 = 0.75;

/// Run all six detectors. `communities` and `betweenness` come from the
/// algorithm pass of the same cycle.
pub fn detect(
    store:       &GraphStore,
    edges:       &[TransferEdgeView],
    communities: &HashMap<String, i64>,
    betweenness: &HashMap<String, f64>,
    now:         DateTime<Utc>,
    cfg:         &Config,
) -> (HashMap<String, Vec<CollusionPattern>>, Vec<ClusterStats>) {
    let mut patterns: HashMap<String, Vec<CollusionPattern>> = HashMap::new();
    let mut mark = |account: &str, p: CollusionPattern| {
        let entry = patterns.entry(account.to_string()).or_default();
        if !entry.contains(&p) {
            entry.push(p);
        }
    };

    // ── Cluster aggregates + fraud islands ────────────────────────────────────
    let mut members: HashMap<i64, Vec<String>> = HashMap::new();
    for (account, cid) in communities {
        members.entry(*cid).or_default().push(account.clone());
    }
    let mut cluster_stats = Vec::with_capacity(members.len());
    for (cid, accounts) in &members {
        let risks: Vec<f64> = accounts.iter().map(|a| store.account_risk(a)).collect();
        let mean = risks.iter().sum::<f64>() / risks.len().max(1) as f64;
        let max  = risks.iter().cloned().fold(0.0f64, f64::max);
        let high = risks.iter().filter(|r| **r > cfg.high_threshold).count();
        cluster_stats.push(ClusterStats {
            id:                *cid,
            member_count:      accounts.len(),
            mean_risk:         mean,
            max_risk:          max,
            high_risk_members: high,
        });
        if accounts.len() >= 3 && mean > 40.0 {
            for a in accounts {
                mark(a, CollusionPattern::FraudIsland);
            }
        }
    }
    cluster_stats.sort_by_key(|c| c.id);

    // ── Money routers ─────────────────────────────────────────────────────────
    for (account, b) in betweenness {
        if *b >= cfg.router_betweenness {
            mark(account, CollusionPattern::MoneyRouter);
        }
    }

    // ── Circular flows ────────────────────────────────────────────────────────
    for account in circular_accounts(edges, now) {
        mark(&account, CollusionPattern::CircularFlow);
    }

    // ── Rapid chains ──────────────────────────────────────────────────────────
    for account in rapid_chain_accounts(edges) {
        mark(&account, CollusionPattern::RapidChain);
    }

    // ── Star hubs ─────────────────────────────────────────────────────────────
    let mut fan_nodes: HashSet<&str> = HashSet::new();
    for e in edges {
        fan_nodes.insert(&e.from);
        fan_nodes.insert(&e.to);
    }
    for node in fan_nodes {
        let (out_deg, in_deg) = store.degrees(node);
        if out_deg + in_deg >= 5 && ((out_deg >= 5 && in_deg <= 2) || (in_deg >= 5 && out_deg <= 2)) {
            mark(node, CollusionPattern::StarHub);
        }
    }

    // ── Relay mules ───────────────────────────────────────────────────────────
    let since = now - Duration::minutes(RELAY_WINDOW_MINS);
    for account in communities.keys() {
        let w = store.activity_in_window(account, since);
        if w.recv_sum > 0.0 && w.sent_sum / w.recv_sum > RELAY_RATIO {
            mark(account, CollusionPattern::RelayMule);
        }
    }

    (patterns, cluster_stats)
}

/// Accounts on a directed cycle (length ≤5) whose every hop is fresher
/// than the 7-day window. Depth-bounded DFS per start node.
fn circular_accounts(edges: &[TransferEdgeView], now: DateTime<Utc>) -> Vec<String> {
    let cutoff = now - Duration::days(CIRCULAR_WINDOW_DAYS);
    let mut adj: HashMap<&str, Vec<&str>> = HashMap::new();
    for e in edges.iter().filter(|e| e.last_ts >= cutoff) {
        adj.entry(&e.from).or_default().push(&e.to);
    }
    for targets in adj.values_mut() {
        targets.sort();
    }

    let mut on_cycle: HashSet<String> = HashSet::new();
    let mut starts: Vec<&&str> = adj.keys().collect();
    starts.sort();

    for &start in starts {
        if on_cycle.contains(start) { continue; }
        let mut path: Vec<&str> = vec![start];
        dfs_cycle(start, start, &adj, &mut path, &mut on_cycle, 4);
    }
    let mut out: Vec<String> = on_cycle.into_iter().collect();
    out.sort();
    out
}

fn dfs_cycle<'a>(
    start:    &str,
    node:     &'a str,
    adj:      &HashMap<&'a str, Vec<&'a str>>,
    path:     &mut Vec<&'a str>,
    on_cycle: &mut HashSet<String>,
    budget:   usize,
) {
    if budget == 0 { return; }
    let Some(nexts) = adj.get(node) else { return };
    for &next in nexts {
        if next == start && path.len() >= 2 {
            for n in path.iter() {
                on_cycle.insert(n.to_string());
            }
            continue;
        }
        if path.contains(&next) { continue; }
        path.push(next);
        dfs_cycle(start, next, adj, path, on_cycle, budget - 1);
        path.pop();
    }
}

/// Accounts on a 2–4 hop directed path whose consecutive hop timestamps
/// are forward-ordered with gaps under 300 s.
fn rapid_chain_accounts(edges: &[TransferEdgeView]) -> Vec<String> {
    let mut by_source: HashMap<&str, Vec<&TransferEdgeView>> = HashMap::new();
    for e in edges {
        by_source.entry(&e.from).or_default().push(e);
    }

    let mut chained: HashSet<String> = HashSet::new();
    for e in edges {
        let mut path = vec![e];
        extend_chain(&by_source, &mut path, &mut chained);
    }
    let mut out: Vec<String> = chained.into_iter().collect();
    out.sort();
    out
}

fn extend_chain<'a>(
    by_source: &HashMap<&str, Vec<&'a TransferEdgeView>>,
    path:      &mut Vec<&'a TransferEdgeView>,
    chained:   &mut HashSet<String>,
) {
    let Some(&last) = path.last() else { return };
    if path.len() >= 2 {
        // a path of ≥2 rapid hops implicates every account on it
        chained.insert(path[0].from.clone());
        for e in path.iter() {
            chained.insert(e.to.clone());
        }
    }
    if path.len() >= 4 { return; }

    let Some(nexts) = by_source.get(last.to.as_str()) else { return };
    for &next in nexts {
        let gap = (next.last_ts - last.last_ts).num_seconds();
        if !(0..CHAIN_GAP_SECS).contains(&gap) { continue; }
        if path.iter().any(|e| std::ptr::eq(*e, next)) { continue; }
        path.push(next);
        extend_chain(by_source, path, chained);
        path.pop();
    }
}
