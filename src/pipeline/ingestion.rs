//! Per-message worker logic
//!
//! validate → score → (sink record + window update) | dead letter
//!
//! Every message yields exactly one `ValidationResult`; a valid one yields one
//! sink submission and an invalid one yields one dead-letter write.

use super::config::PipelineConfig;
use super::dead_letter::DeadLetterRouter;
use super::risk::RiskScorer;
use super::stats::PipelineStats;
use super::types::{json_payload, AnalyticsRecord, DeadLetterReason, ValidationResult, VitalsRecord};
use super::validator::{ValidationError, Validator};
use super::windows::{IngestOutcome, WindowedAggregator};
use crate::sink::{SinkClosed, SinkHandle};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;

/// Convert a config duration for chrono arithmetic, saturating on overflow
pub fn chrono_duration(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365_000))
}

pub struct EventProcessor {
    validator: Validator,
    scorer: RiskScorer,
    aggregator: Arc<WindowedAggregator>,
    sink: SinkHandle,
    dead_letters: Arc<DeadLetterRouter>,
    stats: Arc<PipelineStats>,
    cancel: Option<watch::Receiver<bool>>,
}

impl EventProcessor {
    pub fn new(
        config: &PipelineConfig,
        aggregator: Arc<WindowedAggregator>,
        sink: SinkHandle,
        dead_letters: Arc<DeadLetterRouter>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            validator: Validator::new(
                chrono_duration(config.clock_skew_tolerance),
                chrono_duration(config.max_event_age()),
            ),
            scorer: RiskScorer::default(),
            aggregator,
            sink,
            dead_letters,
            stats,
            cancel: None,
        }
    }

    /// Abandon sink submissions once `cancel` turns true, dead-lettering the
    /// event as `ShutdownDrop`
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_scorer(mut self, scorer: RiskScorer) -> Self {
        self.scorer = scorer;
        self
    }

    /// Validate and score one payload; pure
    pub fn evaluate(&self, payload: &[u8], ingest_ts: DateTime<Utc>) -> ValidationResult {
        match self.validator.validate(payload, ingest_ts) {
            Ok(event) => {
                let risk = self.scorer.score(&event);
                ValidationResult::Valid { event, risk }
            }
            Err(reason) => ValidationResult::Invalid {
                raw_payload: payload.to_vec(),
                reason,
            },
        }
    }

    /// Run one message through the graph
    ///
    /// Only fails when the sink writer is gone, which means the pipeline is
    /// already shutting down.
    pub async fn process(&self, payload: &[u8], ingest_ts: DateTime<Utc>) -> Result<(), SinkClosed> {
        match self.evaluate(payload, ingest_ts) {
            ValidationResult::Valid { event, risk } => {
                PipelineStats::incr(&self.stats.valid_events);
                log::debug!("✅ patient {} @ {} → {}", event.patient_id, event.event_ts, risk);

                let record = AnalyticsRecord::Event(VitalsRecord::new(&event, risk));
                if !self.submit_unless_cancelled(record, payload, ingest_ts).await? {
                    return Ok(());
                }

                match self.aggregator.ingest(&event, risk) {
                    IngestOutcome::Accepted { evicted } => {
                        for window in evicted {
                            PipelineStats::incr(&self.stats.windows_evicted);
                            let payload = json_payload(&window);
                            self.dead_letters
                                .route(
                                    &payload,
                                    DeadLetterReason::LateData,
                                    format!(
                                        "window evicted by open-window ceiling: patient {} window {}",
                                        window.patient_id, window.window_start
                                    ),
                                    ingest_ts,
                                )
                                .await;
                        }
                    }
                    IngestOutcome::Late { window_start, watermark } => {
                        PipelineStats::incr(&self.stats.late_events);
                        let watermark = watermark.map_or_else(|| "none".to_string(), |w| w.to_rfc3339());
                        self.dead_letters
                            .route(
                                payload,
                                DeadLetterReason::LateData,
                                format!("window {} already closed (watermark {})", window_start, watermark),
                                ingest_ts,
                            )
                            .await;
                    }
                }
            }
            ValidationResult::Invalid { raw_payload, reason } => {
                PipelineStats::incr(&self.stats.invalid_events);
                if matches!(reason, ValidationError::TooLate { .. }) {
                    PipelineStats::incr(&self.stats.late_events);
                }
                log::debug!("⚠️  Invalid message ({}): {}", reason.reason(), reason);
                self.dead_letters
                    .route(&raw_payload, reason.reason(), reason.to_string(), ingest_ts)
                    .await;
            }
        }
        Ok(())
    }

    /// Returns false when the event was dropped by cancellation instead
    async fn submit_unless_cancelled(
        &self,
        record: AnalyticsRecord,
        payload: &[u8],
        ingest_ts: DateTime<Utc>,
    ) -> Result<bool, SinkClosed> {
        let Some(cancel) = &self.cancel else {
            self.sink.submit(record).await?;
            return Ok(true);
        };

        tokio::select! {
            biased;
            submitted = self.sink.submit(record) => {
                submitted?;
                Ok(true)
            }
            true = cancelled(cancel.clone()) => {
                PipelineStats::incr(&self.stats.shutdown_dropped);
                log::warn!("⚠️  Dropping in-flight event at shutdown deadline");
                self.dead_letters
                    .route(
                        payload,
                        DeadLetterReason::ShutdownDrop,
                        "shutdown deadline reached while waiting for the sink",
                        ingest_ts,
                    )
                    .await;
                Ok(false)
            }
        }
    }
}

/// Resolves to true once cancellation is requested; false if the sender is gone
pub async fn cancelled(mut cancel: watch::Receiver<bool>) -> bool {
    cancel.wait_for(|c| *c).await.is_ok()
}
