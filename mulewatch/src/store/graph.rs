// mulewatch/src/store/graph.rs
//
// Graph store adapter — the Neo4j-shaped hot-path store.
// DashMap = sharded concurrent HashMap — safe across tokio tasks with no
// global mutex.
//
// Node kinds: Account, Device, Endpoint, Transaction, Cluster.
// Edge kinds: SENT / RECEIVED_BY (transaction fields + per-account
// time-ordered indexes), USES_DEVICE / ACCESSED_FROM (reverse indexes),
// TRANSFERRED_TO (keyed aggregate edge), MEMBER_OF (batch-written
// community id on the account profile).
//
// Writes are MATCH-shaped and idempotent: replaying a tx_id is a no-op.
// Per-entity writer locks are acquired with a bounded wait; a timed-out
// acquisition is a serialization conflict and is retried with truncated
// exponential backoff (base 20 ms, factor 2, jitter ≤10 ms, 3 attempts)
// before surfacing as a transient store error.
//
// Rolling account statistics (mean/std over the last 25 outgoing amounts,
// dormancy flag, community/centrality fields) live on `AccountProfile` and
// are advanced ONLY by the batch analyzer. The hot path writes transaction
// history, edge aggregates, and the latest fused risk.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::Semaphore;

use crate::error::{EngineError, EngineResult};
use crate::events::{ScoredRecord, TxRecord};

// ── Retry policy ──────────────────────────────────────────────────────────────

pub const RETRY_BASE_MS:   u64 = 20;
pub const RETRY_FACTOR:    u64 = 2;
pub const RETRY_JITTER_MS: u64 = 10;
pub const RETRY_ATTEMPTS:  u32 = 3;

/// Bounded wait for a writer lock before declaring a serialization conflict.
const LOCK_WAIT: Duration = Duration::from_millis(25);

/// Per-account history retention (entries, not time): enough for every
/// hot-path window (60 s, 1 h, 24 h) and the 25-deep rolling profile.
const RETAIN_TX: usize = 512;
const RETAIN_ENDPOINTS: usize = 256;
const RETAIN_DEVICE_USERS: usize = 256;

#[derive(Debug)]
pub enum StoreConflict {
    /// Lock acquisition timed out — retryable.
    Transient(String),
    /// Structural violation — fatal to the current record.
    Fatal(String),
}

/// Run a store operation under the §4.A retry policy. The closure is
/// synchronous (the store is in-memory); only the backoff sleeps suspend.
pub async fn with_retry<T, F>(op: &'static str, mut f: F) -> EngineResult<T>
where
    F: FnMut() -> Result<T, StoreConflict>,
{
    let mut attempt = 0u32;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(StoreConflict::Fatal(detail)) => {
                return Err(EngineError::Store(format!("{op}: {detail}")));
            }
            Err(StoreConflict::Transient(detail)) => {
                attempt += 1;
                if attempt >= RETRY_ATTEMPTS {
                    return Err(EngineError::TransientStore { attempts: attempt, detail });
                }
                let backoff = RETRY_BASE_MS * RETRY_FACTOR.pow(attempt - 1);
                let jitter  = rand::thread_rng().gen_range(0..=RETRY_JITTER_MS);
                tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
            }
        }
    }
}

// ── Node state ────────────────────────────────────────────────────────────────

/// Batch-advanced account statistics. The hot path reads these, never
/// writes them, so mid-burst scoring sees the pre-burst profile.
#[derive(Debug, Clone, Default)]
pub struct AccountProfile {
    pub rolling_mean:  f64,
    pub rolling_std:   f64,
    pub tx_count:      u64,
    pub outflow_total: f64,
    pub last_active:   Option<DateTime<Utc>>,
    pub dormant:       bool,
    pub community_id:  Option<i64>,
    pub pagerank:      f64,
    pub betweenness:   f64,
    pub clustering:    f64,
    pub wcc_id:        Option<i64>,
    pub refreshed_at:  Option<DateTime<Utc>>,
}

/// Live aggregates advanced at ingest (edge-aggregate material, not part
/// of the batch-only rolling profile).
#[derive(Debug, Clone, Copy, Default)]
pub struct AccountTotals {
    pub sent_count: u64,
    pub sent_sum:   f64,
    pub recv_count: u64,
    pub recv_sum:   f64,
}

/// Compact transaction reference kept on per-account indexes.
#[derive(Debug, Clone)]
pub struct TxRef {
    pub tx_id:        String,
    pub amount:       f64,
    pub ts:           DateTime<Utc>,
    pub counterparty: String,
    pub device_hash:  Option<String>,
    pub lat:          Option<f64>,
    pub lon:          Option<f64>,
}

#[derive(Debug)]
pub struct AccountState {
    pub id:         String,
    pub profile:    AccountProfile,
    pub totals:     AccountTotals,
    pub risk_score: f64,
    pub sent:       VecDeque<TxRef>,
    pub received:   VecDeque<TxRef>,
    pub endpoints:  VecDeque<(DateTime<Utc>, String)>,
    pub devices:    HashSet<String>,
    pub created_at: DateTime<Utc>,
}

impl AccountState {
    fn new(id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id:         id.to_string(),
            profile:    AccountProfile::default(),
            totals:     AccountTotals::default(),
            risk_score: 0.0,
            sent:       VecDeque::new(),
            received:   VecDeque::new(),
            endpoints:  VecDeque::new(),
            devices:    HashSet::new(),
            created_at: now,
        }
    }

    /// Newest activity timestamp across both directions, from live history.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        match (self.sent.back(), self.received.back()) {
            (Some(s), Some(r)) => Some(s.ts.max(r.ts)),
            (Some(s), None)    => Some(s.ts),
            (None, Some(r))    => Some(r.ts),
            (None, None)       => None,
        }
    }
}

#[derive(Debug)]
pub struct DeviceState {
    pub hash:         String,
    pub users:        HashSet<String>,
    pub recent_users: VecDeque<(DateTime<Utc>, String)>,
    pub derived_risk: f64,
    pub os_family:    Option<String>,
    pub caps_mask:    Option<String>,
    pub first_seen:   DateTime<Utc>,
    pub last_seen:    DateTime<Utc>,
}

#[derive(Debug)]
pub struct EndpointState {
    pub ip:         String,
    pub asn:        Option<u32>,
    pub asn_org:    Option<String>,
    pub country:    Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen:  DateTime<Utc>,
}

#[derive(Debug)]
struct TxNode {
    record: TxRecord,
    risk:   Option<f64>,
}

#[derive(Debug, Default)]
struct TransferEdge {
    total:  f64,
    count:  u64,
    last_ts: Option<DateTime<Utc>>,
    recent: VecDeque<DateTime<Utc>>, // newest back, bounded
}

/// Batch-produced cluster aggregates, fully replaced each cycle.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ClusterStats {
    pub id:                i64,
    pub member_count:      usize,
    pub mean_risk:         f64,
    pub max_risk:          f64,
    pub high_risk_members: usize,
}

// ── Read views ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct ActivityWindow {
    pub sent_count: u32,
    pub recv_count: u32,
    pub sent_sum:   f64,
    pub recv_sum:   f64,
}

impl ActivityWindow {
    pub fn activity(&self) -> u32 { self.sent_count + self.recv_count }
}

#[derive(Debug, Clone)]
pub struct DeviceView {
    pub user_count:        usize,
    pub derived_risk:      f64,
    pub os_family:         Option<String>,
    pub caps_mask:         Option<String>,
    pub user_risks:        Vec<f64>,
    pub distinct_users_24h: usize,
}

#[derive(Debug, Clone)]
pub struct TransferEdgeView {
    pub from:   String,
    pub to:     String,
    pub total:  f64,
    pub count:  u64,
    pub last_ts: DateTime<Utc>,
    pub recent: Vec<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome { Ingested, Replay }

/// Facts captured atomically at ingest time that post-ingest queries can
/// no longer reconstruct (the current transaction is already in history).
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub outcome:            IngestOutcome,
    pub first_device_use:   bool,
    pub os_changed:         bool,
    pub caps_hamming:       u32,
    pub prev_coords:        Option<(DateTime<Utc>, f64, f64)>,
    pub prev_activity:      Option<DateTime<Utc>>,
}

impl IngestReport {
    fn replay() -> Self {
        Self {
            outcome:          IngestOutcome::Replay,
            first_device_use: false,
            os_changed:       false,
            caps_hamming:     0,
            prev_coords:      None,
            prev_activity:    None,
        }
    }
}

// ── Store ─────────────────────────────────────────────────────────────────────

pub struct GraphStore {
    // Node maps — the primary per-entity state
    pub accounts:            DashMap<String, Arc<RwLock<AccountState>>>,
    pub devices:             DashMap<String, Arc<RwLock<DeviceState>>>,
    pub endpoints:           DashMap<String, Arc<RwLock<EndpointState>>>,
    transactions:            DashMap<String, TxNode>,
    transfers:               DashMap<(String, String), Arc<RwLock<TransferEdge>>>,
    out_adj:                 DashMap<String, HashSet<String>>,
    in_adj:                  DashMap<String, HashSet<String>>,
    clusters:                DashMap<i64, ClusterStats>,
    scored:                  DashMap<String, Arc<ScoredRecord>>,
    /// Bounded operation permits standing in for the connection pool.
    permits:                 Semaphore,
    pub total_ingested:      AtomicU64,
}

impl GraphStore {
    pub fn new(pool_size: usize) -> Arc<Self> {
        Arc::new(Self {
            accounts:       DashMap::new(),
            devices:        DashMap::new(),
            endpoints:      DashMap::new(),
            transactions:   DashMap::new(),
            transfers:      DashMap::new(),
            out_adj:        DashMap::new(),
            in_adj:         DashMap::new(),
            clusters:       DashMap::new(),
            scored:         DashMap::new(),
            permits:        Semaphore::new(pool_size.max(1)),
            total_ingested: AtomicU64::new(0),
        })
    }

    // ── Upsert-on-ingest ──────────────────────────────────────────────────────

    /// Ensure all nodes and edges for one transaction exist and update the
    /// TRANSFERRED_TO aggregate. Safe against concurrent writers targeting
    /// the same account pair; idempotent on `tx_id`.
    pub async fn ingest(&self, rec: &TxRecord) -> EngineResult<IngestReport> {
        let _permit = self.permits.acquire().await
            .map_err(|_| EngineError::Store("store pool closed".into()))?;
        with_retry("ingest", || self.ingest_once(rec)).await
    }

    fn ingest_once(&self, rec: &TxRecord) -> Result<IngestReport, StoreConflict> {
        if self.transactions.contains_key(&rec.tx_id) {
            return Ok(IngestReport::replay());
        }

        let sender   = self.account_entry(&rec.sender_id, rec.timestamp);
        let receiver = self.account_entry(&rec.receiver_id, rec.timestamp);

        let mut report = IngestReport {
            outcome:          IngestOutcome::Ingested,
            first_device_use: false,
            os_changed:       false,
            caps_hamming:     0,
            prev_coords:      None,
            prev_activity:    None,
        };

        // Account writes. Lock order is by account id so concurrent
        // writers on the same pair cannot deadlock; a self-transfer takes
        // the single lock once.
        if rec.sender_id == rec.receiver_id {
            let mut s = sender.try_write_for(LOCK_WAIT)
                .ok_or_else(|| StoreConflict::Transient(format!("account {}", rec.sender_id)))?;
            report.prev_activity = s.last_activity();
            report.prev_coords   = last_coords(&s.sent);
            report.first_device_use = apply_sender_side(&mut s, rec);
            apply_receiver_side(&mut s, rec);
        } else {
            let (first, second, sender_first) = if rec.sender_id < rec.receiver_id {
                (&sender, &receiver, true)
            } else {
                (&receiver, &sender, false)
            };
            let mut a = first.try_write_for(LOCK_WAIT)
                .ok_or_else(|| StoreConflict::Transient("account pair".into()))?;
            let mut b = second.try_write_for(LOCK_WAIT)
                .ok_or_else(|| StoreConflict::Transient("account pair".into()))?;
            let (s, r) = if sender_first { (&mut a, &mut b) } else { (&mut b, &mut a) };
            report.prev_activity = s.last_activity();
            report.prev_coords   = last_coords(&s.sent);
            report.first_device_use = apply_sender_side(s, rec);
            apply_receiver_side(r, rec);
        }

        // Device node + USES_DEVICE.
        if let Some(hash) = rec.device_hash.as_deref() {
            let device = self.devices
                .entry(hash.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(DeviceState {
                    hash:         hash.to_string(),
                    users:        HashSet::new(),
                    recent_users: VecDeque::new(),
                    derived_risk: 0.0,
                    os_family:    None,
                    caps_mask:    None,
                    first_seen:   rec.timestamp,
                    last_seen:    rec.timestamp,
                })))
                .clone();
            let mut d = device.try_write_for(LOCK_WAIT)
                .ok_or_else(|| StoreConflict::Transient(format!("device {hash}")))?;
            if let (Some(prev), Some(cur)) = (d.os_family.as_deref(), rec.device_os.as_deref()) {
                report.os_changed = os_family(prev) != os_family(cur);
            }
            if let (Some(prev), Some(cur)) = (d.caps_mask.as_deref(), rec.device_caps()) {
                report.caps_hamming = hamming(prev, cur);
            }
            if rec.device_os.is_some() { d.os_family = rec.device_os.clone(); }
            if let Some(caps) = rec.device_caps() { d.caps_mask = Some(caps.to_string()); }
            d.users.insert(rec.sender_id.clone());
            d.recent_users.push_back((rec.timestamp, rec.sender_id.clone()));
            while d.recent_users.len() > RETAIN_DEVICE_USERS { d.recent_users.pop_front(); }
            d.last_seen = rec.timestamp;
        }

        // Endpoint node. ASN fields are filled by enrich_endpoint after
        // resolution.
        if let Some(ip) = rec.ip_address.as_deref() {
            let endpoint = self.endpoints
                .entry(ip.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(EndpointState {
                    ip:         ip.to_string(),
                    asn:        None,
                    asn_org:    None,
                    country:    None,
                    first_seen: rec.timestamp,
                    last_seen:  rec.timestamp,
                })))
                .clone();
            endpoint.try_write_for(LOCK_WAIT)
                .ok_or_else(|| StoreConflict::Transient(format!("endpoint {ip}")))?
                .last_seen = rec.timestamp;
        }

        // TRANSFERRED_TO aggregate — the contended write under concurrent
        // ingest of the same ordered pair.
        let key = (rec.sender_id.clone(), rec.receiver_id.clone());
        let edge = self.transfers.entry(key).or_default().clone();
        {
            let mut e = edge.try_write_for(LOCK_WAIT)
                .ok_or_else(|| StoreConflict::Transient("transfer edge".into()))?;
            e.total += rec.amount;
            e.count += 1;
            e.last_ts = Some(rec.timestamp);
            e.recent.push_back(rec.timestamp);
            while e.recent.len() > 16 { e.recent.pop_front(); }
        }
        self.out_adj.entry(rec.sender_id.clone()).or_default().insert(rec.receiver_id.clone());
        self.in_adj.entry(rec.receiver_id.clone()).or_default().insert(rec.sender_id.clone());

        // Transaction node last: its presence is the idempotence marker, so
        // a replayed id only short-circuits once everything else is durable.
        self.transactions.insert(rec.tx_id.clone(), TxNode { record: rec.clone(), risk: None });
        self.total_ingested.fetch_add(1, Ordering::Relaxed);
        Ok(report)
    }

    fn account_entry(&self, id: &str, now: DateTime<Utc>) -> Arc<RwLock<AccountState>> {
        self.accounts
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(AccountState::new(id, now))))
            .clone()
    }

    // ── Risk write-back ───────────────────────────────────────────────────────

    /// Write the fused risk onto the transaction (once) and the sender
    /// account (last-writer-wins), and cache the full scored record for
    /// idempotent replays.
    pub async fn persist_risk(&self, scored: Arc<ScoredRecord>, sender_id: &str) -> EngineResult<()> {
        let _permit = self.permits.acquire().await
            .map_err(|_| EngineError::Store("store pool closed".into()))?;
        let sid = sender_id.to_string();
        with_retry("persist_risk", move || {
            let mut tx = self.transactions.get_mut(&scored.tx_id)
                .ok_or_else(|| StoreConflict::Fatal(format!("unknown tx {}", scored.tx_id)))?;
            if tx.risk.is_none() {
                tx.risk = Some(scored.risk_score);
            }
            drop(tx);

            if let Some(account) = self.accounts.get(&sid).map(|a| a.clone()) {
                account.try_write_for(LOCK_WAIT)
                    .ok_or_else(|| StoreConflict::Transient(format!("account {sid}")))?
                    .risk_score = scored.risk_score;
            }
            self.scored.insert(scored.tx_id.clone(), Arc::clone(&scored));
            Ok(())
        }).await
    }

    pub fn scored_record(&self, tx_id: &str) -> Option<Arc<ScoredRecord>> {
        self.scored.get(tx_id).map(|r| Arc::clone(&r))
    }

    /// The stored transaction and its written-back risk, if any.
    pub fn transaction(&self, tx_id: &str) -> Option<(TxRecord, Option<f64>)> {
        self.transactions.get(tx_id).map(|t| (t.record.clone(), t.risk))
    }

    pub fn enrich_endpoint(&self, ip: &str, asn: u32, org: &str, country: &str) {
        if let Some(ep) = self.endpoints.get(ip).map(|e| e.clone()) {
            let mut e = ep.write();
            e.asn     = Some(asn);
            e.asn_org = Some(org.to_string());
            e.country = Some(country.to_string());
        }
    }

    // ── Read fan-out (hot path) ───────────────────────────────────────────────

    pub fn profile(&self, account: &str) -> Option<AccountProfile> {
        self.accounts.get(account).map(|a| a.read().profile.clone())
    }

    pub fn totals(&self, account: &str) -> AccountTotals {
        self.accounts.get(account).map(|a| a.read().totals).unwrap_or_default()
    }

    pub fn account_risk(&self, account: &str) -> f64 {
        self.accounts.get(account).map(|a| a.read().risk_score).unwrap_or(0.0)
    }

    /// Latest `n` outgoing amounts, oldest first, excluding `exclude_tx`.
    pub fn recent_out_amounts(&self, account: &str, n: usize, exclude_tx: &str) -> Vec<f64> {
        let Some(a) = self.accounts.get(account) else { return Vec::new() };
        let a = a.read();
        let mut out: Vec<f64> = a.sent.iter().rev()
            .filter(|t| t.tx_id != exclude_tx)
            .take(n)
            .map(|t| t.amount)
            .collect();
        out.reverse();
        out
    }

    pub fn activity_in_window(&self, account: &str, since: DateTime<Utc>) -> ActivityWindow {
        let Some(a) = self.accounts.get(account) else { return ActivityWindow::default() };
        let a = a.read();
        let mut w = ActivityWindow::default();
        for t in a.sent.iter().rev().take_while(|t| t.ts >= since) {
            w.sent_count += 1;
            w.sent_sum   += t.amount;
        }
        for t in a.received.iter().rev().take_while(|t| t.ts >= since) {
            w.recv_count += 1;
            w.recv_sum   += t.amount;
        }
        w
    }

    /// Outgoing-hour histogram over retained history, excluding the
    /// current transaction, shifted to the configured local offset.
    pub fn hour_histogram(&self, account: &str, exclude_tx: &str, offset_minutes: i32) -> [u32; 24] {
        let mut hist = [0u32; 24];
        let Some(a) = self.accounts.get(account) else { return hist };
        for t in a.read().sent.iter().filter(|t| t.tx_id != exclude_tx) {
            hist[local_hour(t.ts, offset_minutes) as usize] += 1;
        }
        hist
    }

    /// Amounts sent to `receiver` since `since`, including the current tx.
    pub fn amounts_to_receiver_since(&self, account: &str, receiver: &str, since: DateTime<Utc>) -> Vec<f64> {
        let Some(a) = self.accounts.get(account) else { return Vec::new() };
        let guard = a.read();
        guard.sent.iter().rev()
            .take_while(|t| t.ts >= since)
            .filter(|t| t.counterparty == receiver)
            .map(|t| t.amount)
            .collect()
    }

    /// How many retained outgoing transfers match `amount` within `tol`.
    pub fn amount_repeats_since(&self, account: &str, amount: f64, tol: f64, since: DateTime<Utc>) -> usize {
        let Some(a) = self.accounts.get(account) else { return 0 };
        let guard = a.read();
        guard.sent.iter().rev()
            .take_while(|t| t.ts >= since)
            .filter(|t| (t.amount - amount).abs() < tol)
            .count()
    }

    pub fn distinct_endpoints_since(&self, account: &str, since: DateTime<Utc>) -> usize {
        let Some(a) = self.accounts.get(account) else { return 0 };
        let guard = a.read();
        guard.endpoints.iter().rev()
            .take_while(|(ts, _)| *ts >= since)
            .map(|(_, ip)| ip.clone())
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn device_view(&self, hash: &str, now: DateTime<Utc>) -> Option<DeviceView> {
        let d = self.devices.get(hash)?.clone();
        let d = d.read();
        let cutoff = now - chrono::Duration::hours(24);
        let distinct_24h: HashSet<&String> = d.recent_users.iter().rev()
            .take_while(|(ts, _)| *ts >= cutoff)
            .map(|(_, u)| u)
            .collect();
        let user_risks = d.users.iter().map(|u| self.account_risk(u)).collect();
        Some(DeviceView {
            user_count:         d.users.len(),
            derived_risk:       d.derived_risk,
            os_family:          d.os_family.clone(),
            caps_mask:          d.caps_mask.clone(),
            user_risks,
            distinct_users_24h: distinct_24h.len(),
        })
    }

    pub fn degrees(&self, account: &str) -> (usize, usize) {
        let out = self.out_adj.get(account).map(|s| s.len()).unwrap_or(0);
        let inn = self.in_adj.get(account).map(|s| s.len()).unwrap_or(0);
        (out, inn)
    }

    /// Mean latest risk over distinct 1-hop neighbours (both directions).
    pub fn neighbour_mean_risk(&self, account: &str) -> f64 {
        let mut peers: HashSet<String> = HashSet::new();
        if let Some(s) = self.out_adj.get(account) { peers.extend(s.iter().cloned()); }
        if let Some(s) = self.in_adj.get(account)  { peers.extend(s.iter().cloned()); }
        peers.remove(account);
        if peers.is_empty() { return 0.0; }
        let sum: f64 = peers.iter().map(|p| self.account_risk(p)).sum();
        sum / peers.len() as f64
    }

    pub fn cluster_stats(&self, id: i64) -> Option<ClusterStats> {
        self.clusters.get(&id).map(|c| c.clone())
    }

    // ── Batch-side access ─────────────────────────────────────────────────────

    pub fn account_ids(&self) -> Vec<String> {
        self.accounts.iter().map(|e| e.key().clone()).collect()
    }

    pub fn transfer_edges(&self) -> Vec<TransferEdgeView> {
        self.transfers.iter()
            .filter_map(|e| {
                let edge = e.value().read();
                edge.last_ts.map(|last_ts| TransferEdgeView {
                    from:    e.key().0.clone(),
                    to:      e.key().1.clone(),
                    total:   edge.total,
                    count:   edge.count,
                    last_ts,
                    recent:  edge.recent.iter().cloned().collect(),
                })
            })
            .collect()
    }

    /// Replace the cluster aggregate set wholesale (batch step 6).
    pub fn replace_clusters(&self, stats: Vec<ClusterStats>) {
        self.clusters.clear();
        for c in stats {
            self.clusters.insert(c.id, c);
        }
    }

    /// Devices observed with at least `min_users` distinct accounts,
    /// ordered by sharing degree (for the device-sharing view).
    pub fn shared_devices(&self, min_users: usize) -> Vec<DeviceSharingSummary> {
        let mut out: Vec<DeviceSharingSummary> = self.devices.iter()
            .filter_map(|e| {
                let d = e.value().read();
                if d.users.len() < min_users {
                    return None;
                }
                let mut users: Vec<String> = d.users.iter().cloned().collect();
                users.sort();
                Some(DeviceSharingSummary {
                    device_hash:  d.hash.clone(),
                    user_count:   d.users.len(),
                    derived_risk: d.derived_risk,
                    users,
                })
            })
            .collect();
        out.sort_by(|a, b| b.user_count.cmp(&a.user_count)
            .then_with(|| a.device_hash.cmp(&b.device_hash)));
        out
    }

    pub fn counts(&self) -> StoreCounts {
        StoreCounts {
            accounts:     self.accounts.len(),
            devices:      self.devices.len(),
            endpoints:    self.endpoints.len(),
            transactions: self.transactions.len(),
            transfers:    self.transfers.len(),
            clusters:     self.clusters.len(),
        }
    }

    pub fn n_accounts(&self) -> usize { self.accounts.len() }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DeviceSharingSummary {
    pub device_hash:  String,
    pub user_count:   usize,
    pub derived_risk: f64,
    pub users:        Vec<String>,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct StoreCounts {
    pub accounts:     usize,
    pub devices:      usize,
    pub endpoints:    usize,
    pub transactions: usize,
    pub transfers:    usize,
    pub clusters:     usize,
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Sender-side index updates. Returns true when this is the sender's
/// first use of the record's device.
fn apply_sender_side(s: &mut AccountState, rec: &TxRecord) -> bool {
    let first_device_use = match rec.device_hash.as_deref() {
        Some(h) => s.devices.insert(h.to_string()),
        None    => false,
    };
    s.totals.sent_count += 1;
    s.totals.sent_sum   += rec.amount;
    s.sent.push_back(TxRef {
        tx_id:        rec.tx_id.clone(),
        amount:       rec.amount,
        ts:           rec.timestamp,
        counterparty: rec.receiver_id.clone(),
        device_hash:  rec.device_hash.clone(),
        lat:          rec.sender_lat,
        lon:          rec.sender_lon,
    });
    while s.sent.len() > RETAIN_TX { s.sent.pop_front(); }
    if let Some(ip) = rec.ip_address.as_deref() {
        s.endpoints.push_back((rec.timestamp, ip.to_string()));
        while s.endpoints.len() > RETAIN_ENDPOINTS { s.endpoints.pop_front(); }
    }
    first_device_use
}

fn apply_receiver_side(r: &mut AccountState, rec: &TxRecord) {
    r.totals.recv_count += 1;
    r.totals.recv_sum   += rec.amount;
    r.received.push_back(TxRef {
        tx_id:        rec.tx_id.clone(),
        amount:       rec.amount,
        ts:           rec.timestamp,
        counterparty: rec.sender_id.clone(),
        device_hash:  None,
        lat:          None,
        lon:          None,
    });
    while r.received.len() > RETAIN_TX { r.received.pop_front(); }
}

fn last_coords(sent: &VecDeque<TxRef>) -> Option<(DateTime<Utc>, f64, f64)> {
    sent.iter().rev().find_map(|t| match (t.lat, t.lon) {
        (Some(lat), Some(lon)) => Some((t.ts, lat, lon)),
        _ => None,
    })
}

/// Normalize an OS string to its family ("Android 14" and "Android 12"
/// are the same family; a move to anything else is drift).
pub fn os_family(os: &str) -> &str {
    let lower_end = os.find(|c: char| c.is_whitespace() || c.is_ascii_digit()).unwrap_or(os.len());
    &os[..lower_end]
}

fn hamming(a: &str, b: &str) -> u32 {
    let longest = a.len().max(b.len());
    let mut dist = 0u32;
    let mut ab = a.bytes();
    let mut bb = b.bytes();
    for _ in 0..longest {
        if ab.next() != bb.next() { dist += 1; }
    }
    dist
}

pub fn local_hour(ts: DateTime<Utc>, offset_minutes: i32) -> u32 {
    use chrono::Timelike;
    (ts + chrono::Duration::minutes(offset_minutes as i64)).hour()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn rec(tx: &str, from: &str, to: &str, amount: f64, ts: DateTime<Utc>) -> TxRecord {
        serde_json::from_value(serde_json::json!({
            "tx_id": tx, "sender_id": from, "receiver_id": to,
            "amount": amount, "timestamp": ts.to_rfc3339(),
            "device_hash": "dev-1", "device_os": "Android 14",
            "ip_address": "49.37.0.1",
        })).unwrap()
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn ingest_builds_nodes_edges_and_indexes() {
        let store = GraphStore::new(8);
        store.ingest(&rec("t1", "A", "B", 100.0, ts(0))).await.unwrap();
        store.ingest(&rec("t2", "A", "B", 50.0, ts(10))).await.unwrap();

        let counts = store.counts();
        assert_eq!(counts.accounts, 2);
        assert_eq!(counts.transactions, 2);
        assert_eq!(counts.transfers, 1);

        let edges = store.transfer_edges();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].count, 2);
        assert!((edges[0].total - 150.0).abs() < 1e-9);

        assert_eq!(store.degrees("A"), (1, 0));
        assert_eq!(store.degrees("B"), (0, 1));
        let t = store.totals("A");
        assert_eq!(t.sent_count, 2);
        assert!((t.sent_sum - 150.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn replaying_a_tx_id_is_a_no_op() {
        let store = GraphStore::new(8);
        let r = rec("t1", "A", "B", 100.0, ts(0));
        let first  = store.ingest(&r).await.unwrap();
        let second = store.ingest(&r).await.unwrap();
        assert_eq!(first.outcome, IngestOutcome::Ingested);
        assert_eq!(second.outcome, IngestOutcome::Replay);

        let edges = store.transfer_edges();
        assert_eq!(edges[0].count, 1);
        assert_eq!(store.totals("A").sent_count, 1);

        let (stored, risk) = store.transaction("t1").unwrap();
        assert_eq!(stored.amount, 100.0);
        assert_eq!(risk, None);
    }

    #[tokio::test]
    async fn first_device_use_is_reported_once() {
        let store = GraphStore::new(8);
        let a = store.ingest(&rec("t1", "A", "B", 10.0, ts(0))).await.unwrap();
        let b = store.ingest(&rec("t2", "A", "B", 10.0, ts(5))).await.unwrap();
        assert!(a.first_device_use);
        assert!(!b.first_device_use);
    }

    #[tokio::test]
    async fn windowed_reads_exclude_the_current_tx_where_specified() {
        let store = GraphStore::new(8);
        for (i, amt) in [100.0, 120.0, 90.0].iter().enumerate() {
            store.ingest(&rec(&format!("t{i}"), "A", "B", *amt, ts(i as i64))).await.unwrap();
        }
        let history = store.recent_out_amounts("A", 25, "t2");
        assert_eq!(history, vec![100.0, 120.0]);

        let w = store.activity_in_window("A", ts(1));
        assert_eq!(w.sent_count, 2);
        assert_eq!(store.activity_in_window("B", ts(0)).recv_count, 3);
    }

    #[tokio::test]
    async fn persist_risk_writes_once_and_caches_the_scored_record() {
        let store = GraphStore::new(8);
        store.ingest(&rec("t1", "A", "B", 10.0, ts(0))).await.unwrap();

        let scored = Arc::new(ScoredRecord {
            tx_id: "t1".into(), risk_score: 42.0,
            risk_level: crate::events::RiskLevel::Medium,
            breakdown: crate::events::ScoreBreakdown {
                graph: 0.0, behavioral: 42.0, device: 0.0, dead_account: 0.0, velocity: 0.0,
            },
            cluster_id: None, flags: vec![], reason: String::new(),
            is_mule: None, mule_confidence: None,
            processing_time_ms: 1.0, timestamp: ts(0),
        });
        store.persist_risk(Arc::clone(&scored), "A").await.unwrap();
        assert!((store.account_risk("A") - 42.0).abs() < 1e-9);
        assert_eq!(store.scored_record("t1").unwrap().risk_score, 42.0);

        // unknown tx is fatal, not transient
        let mut missing = (*scored).clone();
        missing.tx_id = "nope".into();
        let err = store.persist_risk(Arc::new(missing), "A").await.unwrap_err();
        assert!(matches!(err, EngineError::Store(_)));
    }

    #[test]
    fn os_family_and_hamming() {
        assert_eq!(os_family("Android 14"), "Android");
        assert_eq!(os_family("iOS17.2"), "iOS");
        assert_eq!(hamming("1011", "1001"), 1);
        assert_eq!(hamming("1011", "10"), 2);
    }

    #[test]
    fn local_hour_applies_the_offset() {
        // 20:00 UTC + 05:30 = 01:30 local
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 20, 0, 0).unwrap();
        assert_eq!(local_hour(t, 330), 1);
    }
}
