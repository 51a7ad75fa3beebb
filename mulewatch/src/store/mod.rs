pub mod graph;

pub use graph::{
    AccountProfile, AccountTotals, ActivityWindow, ClusterStats, DeviceView, GraphStore,
    IngestOutcome, IngestReport, StoreConflict, TransferEdgeView, TxRef,
    RETRY_ATTEMPTS, RETRY_BASE_MS, RETRY_JITTER_MS,
};
