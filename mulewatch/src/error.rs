// mulewatch/src/error.rs
//
// Engine error kinds and their propagation contracts.
//
// The worker loop keys its ACK decision off these variants:
//   InvalidInput      — structured reject, record IS acked (poison drop)
//   TransientStore    — retried inside the store adapter; on exhaustion the
//                       record is NOT acked so the stream redelivers it
//   Store             — fatal to the record, not acked
//   Extractor         — fatal to the record, not acked
//   DeadlineExceeded  — record not acked, left for redelivery
//   Subscriber        — prunes the subscriber, never fails the record
//   Analyzer          — previous cache snapshot stays in place

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("transient store conflict after {attempts} attempts: {detail}")]
    TransientStore { attempts: u32, detail: String },

    #[error("store error: {0}")]
    Store(String),

    #[error("extractor {extractor} failed: {detail}")]
    Extractor { extractor: &'static str, detail: String },

    #[error("record deadline exceeded after {0} ms")]
    DeadlineExceeded(u64),

    #[error("subscriber {0} unreachable")]
    Subscriber(String),

    #[error("analyzer cycle failed: {0}")]
    Analyzer(String),
}

impl EngineError {
    /// True for errors the worker must NOT ack (the stream will redeliver).
    pub fn blocks_ack(&self) -> bool {
        !matches!(self, Self::InvalidInput(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
