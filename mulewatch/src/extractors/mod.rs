// mulewatch/src/extractors/mod.rs
//
// The five feature extractors. Each is a pure scorer: graph reads in,
// a score in [0,100] plus rule flags out, no shared-state writes. All
// five run concurrently per transaction and join before fusion.

pub mod behavioral;
pub mod device;
pub mod dormant;
pub mod graph_intel;
pub mod velocity;

use chrono::{DateTime, Utc};

use crate::analyzer::collusion::CollusionSnapshot;
use crate::asn::AsnAssessment;
use crate::config::Config;
use crate::events::{FeatureScore, TxRecord};
use crate::store::{GraphStore, IngestReport};

/// Everything an extractor may read for one transaction. Window math is
/// anchored on the transaction timestamp, not the wall clock, so scoring
/// a replayed capture is deterministic.
pub struct ScoringContext<'a> {
    pub store:    &'a GraphStore,
    pub cfg:      &'a Config,
    pub snapshot: &'a CollusionSnapshot,
    pub asn:      Option<&'a AsnAssessment>,
    pub report:   &'a IngestReport,
}

impl ScoringContext<'_> {
    pub fn now(&self, tx: &TxRecord) -> DateTime<Utc> {
        tx.timestamp
    }
}

/// Run all five extractors concurrently and join. Order of the returned
/// array is fixed: behavioral, graph, device, dormant, velocity.
pub async fn run_all(tx: &TxRecord, ctx: &ScoringContext<'_>) -> [FeatureScore; 5] {
    let (behav, graph, dev, dead, vel) = tokio::join!(
        behavioral::analyze(tx, ctx),
        graph_intel::analyze(tx, ctx),
        device::analyze(tx, ctx),
        dormant::analyze(tx, ctx),
        velocity::analyze(tx, ctx),
    );
    [behav, graph, dev, dead, vel]
}

/// Great-circle distance in km.
pub(crate) fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const R: f64 = 6371.0;
    let (p1, p2) = (lat1.to_radians(), lat2.to_radians());
    let dp = (lat2 - lat1).to_radians();
    let dl = (lon2 - lon1).to_radians();
    let a = (dp / 2.0).sin().powi(2) + p1.cos() * p2.cos() * (dl / 2.0).sin().powi(2);
    2.0 * R * a.sqrt().atan2((1.0 - a).sqrt())
}
