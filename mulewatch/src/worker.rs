// mulewatch/src/worker.rs
//
// The scoring pipeline and its worker pool.
//
// Per record:
//   ingest → asn enrich → concurrent(behav, graph, device, dead, vel)
//   → fuse → mule → persist risk → broadcast if ≥ medium → ACK
//
// Worker loop: consume a bounded batch, process each record under the
// soft deadline, ack on success or poison, leave everything else for
// redelivery. When the stream backlog passes the high-water mark the
// batch is halved; when transient store conflicts keep exhausting their
// retry budget, all workers sleep on a shared EWMA-governed backoff.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::alerts::AlertBroadcaster;
use crate::analyzer::{Analyzer, SnapshotHandle};
use crate::asn::AsnResolver;
use crate::config::Config;
use crate::engine::{FusionEngine, MuleClassifier};
use crate::error::{EngineError, EngineResult};
use crate::events::{ScoredRecord, TxRecord};
use crate::extractors::{self, ScoringContext};
use crate::metrics::EngineMetrics;
use crate::store::{GraphStore, IngestOutcome};
use crate::stream::{StreamId, TxStream};

// ── Shared retry backoff ──────────────────────────────────────────────────────

/// EWMA over "did this record exhaust a store retry budget". Above the
/// trip point every worker pauses between batches, giving the store room
/// to clear whatever is causing the conflicts.
struct BackoffGovernor {
    ewma: Mutex<f64>,
}

const EWMA_ALPHA: f64 = 0.2;
const EWMA_TRIP:  f64 = 0.3;
const BACKOFF_SPAN_MS: f64 = 400.0;

impl BackoffGovernor {
    fn new() -> Self {
        Self { ewma: Mutex::new(0.0) }
    }

    fn record(&self, exhausted: bool) {
        let mut e = self.ewma.lock();
        *e = EWMA_ALPHA * if exhausted { 1.0 } else { 0.0 } + (1.0 - EWMA_ALPHA) * *e;
    }

    fn delay(&self) -> Option<Duration> {
        let e = *self.ewma.lock();
        (e > EWMA_TRIP).then(|| Duration::from_millis((e * BACKOFF_SPAN_MS) as u64))
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

pub struct Pipeline {
    pub cfg:         Config,
    pub store:       Arc<GraphStore>,
    pub stream:      Arc<TxStream>,
    pub resolver:    Arc<AsnResolver>,
    pub metrics:     Arc<EngineMetrics>,
    pub broadcaster: Arc<AlertBroadcaster>,
    pub analyzer:    Arc<Analyzer>,
    pub snapshot:    SnapshotHandle,
    pub started:     Instant,
    fusion:          FusionEngine,
    mule:            MuleClassifier,
    backoff:         BackoffGovernor,
}

impl Pipeline {
    pub fn new(cfg: Config) -> Arc<Self> {
        let metrics  = EngineMetrics::new();
        let store    = GraphStore::new(cfg.store_pool);
        let stream   = TxStream::new(&cfg.stream_key,
                                     Duration::from_millis(cfg.visibility_timeout_ms));
        let resolver = AsnResolver::new(
            cfg.asn_db_path.as_deref().map(std::path::Path::new),
            &cfg.domestic_country,
        );
        let analyzer = Analyzer::new(Arc::clone(&store), Arc::clone(&metrics), cfg.clone());
        let snapshot = analyzer.cache();
        let broadcaster = AlertBroadcaster::new(Arc::clone(&metrics));

        Arc::new(Self {
            fusion:  FusionEngine::new(cfg.clone()),
            mule:    MuleClassifier::new(),
            backoff: BackoffGovernor::new(),
            started: Instant::now(),
            cfg, store, stream, resolver, metrics, broadcaster, analyzer, snapshot,
        })
    }

    /// Score one transaction end to end (everything except the ACK —
    /// the synchronous HTTP path shares this verbatim with the workers).
    pub async fn score_transaction(&self, rec: &TxRecord) -> EngineResult<Arc<ScoredRecord>> {
        rec.validate()?;
        let started = Instant::now();

        let report = self.store.ingest(rec).await?;
        if report.outcome == IngestOutcome::Replay {
            // Idempotent replay: same tx_id, same graph state, same score.
            if let Some(cached) = self.store.scored_record(&rec.tx_id) {
                return Ok(cached);
            }
        }

        let asn = rec.ip_address.as_deref()
            .and_then(|ip| self.resolver.assess(&rec.sender_id, ip, rec.timestamp));
        if let (Some(ip), Some(a)) = (rec.ip_address.as_deref(), asn.as_ref()) {
            if let Some(number) = a.asn {
                self.store.enrich_endpoint(ip, number, &a.org, &a.country);
            }
        }

        let snapshot = self.snapshot.load_full();
        let ctx = ScoringContext {
            store:    &self.store,
            cfg:      &self.cfg,
            snapshot: &snapshot,
            asn:      asn.as_ref(),
            report:   &report,
        };
        let scores = extractors::run_all(rec, &ctx).await;

        let (mut scored, fired) = self.fusion.fuse(rec, scores, &snapshot, started);
        let verdict = self.mule.classify(rec, &fired, &snapshot, scored.risk_score);
        if verdict.is_mule {
            scored.is_mule = Some(true);
            scored.mule_confidence = Some(verdict.confidence);
            self.metrics.mules_flagged.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            debug!(tx = %rec.tx_id, confidence = verdict.confidence,
                   reasons = ?verdict.reasons, "mule classification");
        }

        let scored = Arc::new(scored);
        self.store.persist_risk(Arc::clone(&scored), &rec.sender_id).await?;
        self.metrics.record_scored(scored.risk_score, scored.risk_level);

        if scored.risk_score >= self.cfg.medium_threshold {
            self.broadcaster.publish(Arc::clone(&scored));
        }
        Ok(scored)
    }

    /// Spawn the worker pool.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.cfg.workers)
            .map(|idx| {
                let p = Arc::clone(self);
                tokio::spawn(async move { p.worker_loop(idx).await })
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, idx: usize) {
        let consumer = format!("scorer-{idx}");
        info!("worker {consumer} up");
        loop {
            let batch_size = self.effective_batch();
            let batch = self.stream
                .consume(&self.cfg.consumer_group, &consumer, batch_size, 500)
                .await;
            for (id, rec) in batch {
                self.process_entry(id, &rec).await;
            }
            if let Some(pause) = self.backoff.delay() {
                debug!("worker {consumer} backing off {:?}", pause);
                tokio::time::sleep(pause).await;
            }
        }
    }

    /// Halve the batch while the backlog is past the high-water mark.
    fn effective_batch(&self) -> usize {
        let pending = self.stream.pending_count(&self.cfg.consumer_group);
        if pending > self.cfg.pending_high_water {
            (self.cfg.worker_batch / 2).max(1)
        } else {
            self.cfg.worker_batch
        }
    }

    /// Process one delivered entry and decide its ACK fate.
    pub(crate) async fn process_entry(&self, id: StreamId, rec: &TxRecord) {
        let deadline = Duration::from_millis(self.cfg.record_deadline_ms);
        match tokio::time::timeout(deadline, self.score_transaction(rec)).await {
            Ok(Ok(scored)) => {
                self.backoff.record(false);
                self.stream.ack(&self.cfg.consumer_group, id);
                debug!(tx = %rec.tx_id, score = scored.risk_score, "scored and acked");
            }
            Ok(Err(e)) => {
                self.backoff.record(matches!(e, EngineError::TransientStore { .. }));
                match &e {
                    EngineError::InvalidInput(detail) => {
                        // poison message: ack so it never redelivers
                        self.stream.ack(&self.cfg.consumer_group, id);
                        self.metrics.records_dropped
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        warn!(tx = %rec.tx_id, "rejected record: {detail}");
                    }
                    EngineError::TransientStore { attempts, detail } => {
                        self.metrics.retries_exhausted
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        warn!(tx = %rec.tx_id,
                              "store conflict persisted through {attempts} attempts \
                               ({detail}); leaving for redelivery");
                    }
                    other => {
                        error!(tx = %rec.tx_id, "record failed, leaving for redelivery: {other}");
                    }
                }
            }
            Err(_) => {
                self.backoff.record(false);
                self.metrics.deadline_exceeded
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                warn!(tx = %rec.tx_id, "soft deadline exceeded, leaving for redelivery");
            }
        }
    }

    pub fn uptime_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}
