use crate::pipeline::types::AnalyticsRecord;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SinkError {
    /// Worth retrying: locked database, I/O hiccup, connection loss
    #[error("transient sink error: {0}")]
    Transient(String),

    /// Retrying the same batch cannot succeed
    #[error("permanent sink error: {0}")]
    Permanent(String),

    #[error("sink write timed out after {0}ms")]
    Timeout(u64),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, SinkError::Permanent(_))
    }
}

/// Analytics store behind the sink writer
///
/// `upsert_batch` must be idempotent by natural key: writing the same batch
/// twice leaves the same rows.
#[async_trait]
pub trait AnalyticsSink: Send {
    /// Upsert a batch atomically (all rows or none)
    async fn upsert_batch(&mut self, records: &[AnalyticsRecord]) -> Result<(), SinkError>;

    /// Cheap liveness probe used while backpressure is engaged
    async fn health_check(&mut self) -> Result<(), SinkError>;

    /// Backend type for logging
    fn backend_type(&self) -> &'static str;
}
