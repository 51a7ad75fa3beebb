// mulewatch/src/alerts.rs
//
// In-process alert broadcaster. Subscribers (websocket sessions,
// webhook pumps, dashboards) register a bounded channel; every scored
// record at or above the medium threshold is offered to each of them
// with a non-blocking send. A full channel drops the alert for that
// subscriber only; a closed channel marks the subscriber dead and it is
// pruned. Workers never block on fan-out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::events::ScoredRecord;
use crate::metrics::EngineMetrics;

/// Per-subscriber buffer: enough to ride out a slow websocket flush
/// without letting one laggard hold worker memory hostage.
const SUBSCRIBER_BUFFER: usize = 256;

struct Subscriber {
    id:    u64,
    label: String,
    tx:    mpsc::Sender<Arc<ScoredRecord>>,
}

pub struct AlertBroadcaster {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id:     AtomicU64,
    metrics:     Arc<EngineMetrics>,
}

impl AlertBroadcaster {
    pub fn new(metrics: Arc<EngineMetrics>) -> Arc<Self> {
        Arc::new(Self {
            subscribers: RwLock::new(Vec::new()),
            next_id:     AtomicU64::new(1),
            metrics,
        })
    }

    pub fn subscribe(&self, label: &str) -> (u64, mpsc::Receiver<Arc<ScoredRecord>>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push(Subscriber { id, label: label.to_string(), tx });
        debug!("alert subscriber {} ({}) attached", id, label);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.write().retain(|s| s.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Fire-and-forget fan-out. Slow subscribers lose this alert; dead
    /// ones are pruned afterwards under the writer lock.
    pub fn publish(&self, record: Arc<ScoredRecord>) {
        let mut dead: Vec<u64> = Vec::new();
        {
            let subs = self.subscribers.read();
            if subs.is_empty() {
                return;
            }
            for sub in subs.iter() {
                match sub.tx.try_send(Arc::clone(&record)) {
                    Ok(())  => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.metrics.alerts_dropped.fetch_add(1, Ordering::Relaxed);
                        debug!("alert dropped for slow subscriber {} ({})", sub.id, sub.label);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dead.push(sub.id);
                    }
                }
            }
        }
        if !dead.is_empty() {
            self.subscribers.write().retain(|s| !dead.contains(&s.id));
            self.metrics.subscribers_pruned.fetch_add(dead.len() as u64, Ordering::Relaxed);
        }
        self.metrics.alerts_published.fetch_add(1, Ordering::Relaxed);
    }
}
