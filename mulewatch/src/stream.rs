// mulewatch/src/stream.rs
//
// Durable ordered queue with consumer groups — Redis-Streams semantics in
// process.
//
// Operations: append, consume-as-group (with blocking), acknowledge,
// pending-count. Entries get `ms-seq` ids. A consumed entry moves to the
// group's pending list and stays there until acknowledged; if its consumer
// dies (no ack within the visibility timeout) the entry is redelivered to
// the next live consumer that asks. At-least-once, per-consumer delivery
// within a group; independent groups each see the full log.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::events::TxRecord;

// ── Entry ids ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct StreamId {
    pub ms:  i64,
    pub seq: u64,
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

// ── Group state ───────────────────────────────────────────────────────────────

#[derive(Debug)]
struct PendingEntry {
    idx:          usize,
    consumer:     String,
    delivered_at: Instant,
    deliveries:   u32,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Next log index this group has not yet delivered.
    cursor:  usize,
    pending: HashMap<StreamId, PendingEntry>,
}

// ── Stream ────────────────────────────────────────────────────────────────────

pub struct TxStream {
    key:        String,
    log:        Mutex<Vec<(StreamId, Arc<TxRecord>)>>,
    groups:     DashMap<String, Arc<Mutex<GroupState>>>,
    notify:     Notify,
    visibility: Duration,
}

impl TxStream {
    pub fn new(key: &str, visibility: Duration) -> Arc<Self> {
        Arc::new(Self {
            key:        key.to_string(),
            log:        Mutex::new(Vec::new()),
            groups:     DashMap::new(),
            notify:     Notify::new(),
            visibility,
        })
    }

    pub fn key(&self) -> &str { &self.key }

    /// Append one record; returns its id. Ids are strictly increasing.
    pub fn append(&self, record: TxRecord) -> StreamId {
        let mut log = self.log.lock();
        let ms = chrono::Utc::now().timestamp_millis();
        let id = match log.last() {
            Some((last, _)) if last.ms >= ms => StreamId { ms: last.ms, seq: last.seq + 1 },
            _                                => StreamId { ms, seq: 0 },
        };
        log.push((id, Arc::new(record)));
        drop(log);
        self.notify.notify_waiters();
        id
    }

    fn group(&self, name: &str) -> Arc<Mutex<GroupState>> {
        self.groups.entry(name.to_string()).or_default().clone()
    }

    /// Consume up to `max` entries for `consumer` in `group`, blocking up
    /// to `block_ms` when nothing is available. Expired pending entries
    /// (visibility timeout passed) are claimed before new ones.
    pub async fn consume(
        &self,
        group:    &str,
        consumer: &str,
        max:      usize,
        block_ms: u64,
    ) -> Vec<(StreamId, Arc<TxRecord>)> {
        let deadline = Instant::now() + Duration::from_millis(block_ms);
        loop {
            let batch = self.try_consume(group, consumer, max);
            if !batch.is_empty() {
                return batch;
            }
            let now = Instant::now();
            if now >= deadline {
                return Vec::new();
            }
            let notified = self.notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return self.try_consume(group, consumer, max),
            }
        }
    }

    fn try_consume(&self, group: &str, consumer: &str, max: usize) -> Vec<(StreamId, Arc<TxRecord>)> {
        let group = self.group(group);
        let mut g = group.lock();
        let log = self.log.lock();
        let now = Instant::now();
        let mut out = Vec::new();

        // Reclaim expired pending entries first — a crashed worker's
        // records must reach a live consumer.
        let mut expired: Vec<StreamId> = g.pending.iter()
            .filter(|(_, p)| now.duration_since(p.delivered_at) >= self.visibility)
            .map(|(id, _)| *id)
            .collect();
        expired.sort();
        for id in expired.into_iter().take(max) {
            if let Some(p) = g.pending.get_mut(&id) {
                p.consumer     = consumer.to_string();
                p.delivered_at = now;
                p.deliveries  += 1;
                out.push((id, Arc::clone(&log[p.idx].1)));
            }
        }

        // Then fresh entries, advancing the group cursor.
        while out.len() < max && g.cursor < log.len() {
            let idx = g.cursor;
            let (id, rec) = &log[idx];
            g.cursor += 1;
            g.pending.insert(*id, PendingEntry {
                idx,
                consumer:     consumer.to_string(),
                delivered_at: now,
                deliveries:   1,
            });
            out.push((*id, Arc::clone(rec)));
        }
        out
    }

    /// Acknowledge one delivered entry. Returns false for unknown ids.
    pub fn ack(&self, group: &str, id: StreamId) -> bool {
        self.group(group).lock().pending.remove(&id).is_some()
    }

    /// Outstanding work for a group: delivered-but-unacked plus
    /// not-yet-delivered entries.
    pub fn pending_count(&self, group: &str) -> usize {
        let group = self.group(group);
        let g = group.lock();
        let backlog = self.log.lock().len().saturating_sub(g.cursor);
        g.pending.len() + backlog
    }

    /// Delivered-but-unacked only (Redis XPENDING semantics).
    pub fn unacked_count(&self, group: &str) -> usize {
        self.group(group).lock().pending.len()
    }

    pub fn len(&self) -> usize {
        self.log.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
