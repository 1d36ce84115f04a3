//! Batching sink writer
//!
//! Workers submit records through a bounded queue; one flush task owns the
//! sink and writes a batch when it reaches `batch_size` or when the batch
//! interval fires, whichever comes first.
//!
//! Failure handling:
//! - transient errors and timeouts are retried with capped exponential backoff
//! - a batch that exhausts its attempts (or hits a permanent error) is
//!   dead-lettered as `SinkRejected` and backpressure is engaged
//! - while engaged the task stops flushing, probes `health_check` on every
//!   recovery tick, and releases backpressure on the first healthy probe
//! - on close, queued records get one last flush bounded by the shutdown
//!   deadline; whatever cannot be written is dead-lettered as `ShutdownDrop`

use super::writer_backend::{AnalyticsSink, SinkError};
use crate::channel::error_handler::ExponentialBackoff;
use crate::pipeline::backpressure::BackpressureController;
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::dead_letter::DeadLetterRouter;
use crate::pipeline::types::{json_payload, AnalyticsRecord, DeadLetterReason};
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

#[derive(Debug, Clone)]
pub struct SinkWriterConfig {
    pub batch_size: usize,
    pub batch_interval: Duration,
    /// Total attempts per batch, including the first
    pub retry_max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub recovery_probe_interval: Duration,
}

impl SinkWriterConfig {
    pub fn from_pipeline(config: &PipelineConfig) -> Self {
        Self {
            batch_size: config.sink_batch_size,
            batch_interval: config.sink_batch_interval,
            retry_max_attempts: config.sink_retry_max_attempts,
            backoff_base: config.sink_retry_backoff_base,
            backoff_max: config.sink_retry_backoff_max,
            write_timeout: config.sink_write_timeout,
            queue_capacity: config.sink_queue_capacity,
            recovery_probe_interval: config.sink_recovery_probe_interval,
        }
    }
}

impl Default for SinkWriterConfig {
    fn default() -> Self {
        Self::from_pipeline(&PipelineConfig::default())
    }
}

#[derive(Debug, Default)]
pub struct SinkStats {
    pub records_written: AtomicU64,
    pub batches_written: AtomicU64,
    pub batches_rejected: AtomicU64,
    pub records_rejected: AtomicU64,
    pub shutdown_dropped: AtomicU64,
    pub retries: AtomicU64,
}

impl SinkStats {
    pub fn snapshot(&self) -> SinkReport {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        SinkReport {
            records_written: load(&self.records_written),
            batches_written: load(&self.batches_written),
            batches_rejected: load(&self.batches_rejected),
            records_rejected: load(&self.records_rejected),
            shutdown_dropped: load(&self.shutdown_dropped),
            retries: load(&self.retries),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SinkReport {
    pub records_written: u64,
    pub batches_written: u64,
    pub batches_rejected: u64,
    pub records_rejected: u64,
    pub shutdown_dropped: u64,
    pub retries: u64,
}

#[derive(Debug, Error, PartialEq)]
#[error("sink writer is closed")]
pub struct SinkClosed;

enum SinkCommand {
    Record(AnalyticsRecord),
    Flush(oneshot::Sender<()>),
}

/// Cloneable producer side of the sink queue
#[derive(Clone)]
pub struct SinkHandle {
    tx: mpsc::Sender<SinkCommand>,
}

impl SinkHandle {
    /// Queue a record; waits while the queue is full
    pub async fn submit(&self, record: AnalyticsRecord) -> Result<(), SinkClosed> {
        self.tx.send(SinkCommand::Record(record)).await.map_err(|_| SinkClosed)
    }

    /// Ask for an immediate flush and wait until the flush task has handled it
    ///
    /// Skipped (but still acknowledged) while backpressure is engaged.
    pub async fn flush(&self) -> Result<(), SinkClosed> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx.send(SinkCommand::Flush(ack_tx)).await.map_err(|_| SinkClosed)?;
        ack_rx.await.map_err(|_| SinkClosed)
    }

    /// Records waiting in the queue
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Owner of the flush task
pub struct SinkWriter {
    handle: SinkHandle,
    close_tx: oneshot::Sender<Instant>,
    task: JoinHandle<()>,
    stats: Arc<SinkStats>,
    backend_type: &'static str,
}

impl SinkWriter {
    pub fn spawn(
        sink: Box<dyn AnalyticsSink>,
        config: SinkWriterConfig,
        dead_letters: Arc<DeadLetterRouter>,
        backpressure: BackpressureController,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (close_tx, close_rx) = oneshot::channel();
        let stats = Arc::new(SinkStats::default());
        let backend_type = sink.backend_type();

        log::info!("🚀 Starting {} sink writer", backend_type);
        log::info!("   ├─ Batch: {} records or {}ms", config.batch_size, config.batch_interval.as_millis());
        log::info!(
            "   └─ Retries: {} attempts, backoff {}..{}ms, timeout {}ms",
            config.retry_max_attempts,
            config.backoff_base.as_millis(),
            config.backoff_max.as_millis(),
            config.write_timeout.as_millis()
        );

        let flush_task = FlushTask {
            sink,
            batch: Vec::with_capacity(config.batch_size),
            config,
            rx,
            dead_letters,
            backpressure,
            stats: stats.clone(),
            engaged: false,
        };
        let task = tokio::spawn(flush_task.run(close_rx));

        Self {
            handle: SinkHandle { tx },
            close_tx,
            task,
            stats,
            backend_type,
        }
    }

    pub fn handle(&self) -> SinkHandle {
        self.handle.clone()
    }

    pub fn stats(&self) -> Arc<SinkStats> {
        self.stats.clone()
    }

    pub fn backend_type(&self) -> &'static str {
        self.backend_type
    }

    /// Drain the queue and flush what remains before `deadline`
    pub async fn close(self, deadline: Instant) -> SinkReport {
        let _ = self.close_tx.send(deadline);
        drop(self.handle);

        if let Err(e) = self.task.await {
            log::error!("❌ Sink flush task failed: {}", e);
        }
        self.stats.snapshot()
    }
}

struct FlushTask {
    sink: Box<dyn AnalyticsSink>,
    config: SinkWriterConfig,
    rx: mpsc::Receiver<SinkCommand>,
    dead_letters: Arc<DeadLetterRouter>,
    backpressure: BackpressureController,
    stats: Arc<SinkStats>,
    batch: Vec<AnalyticsRecord>,
    engaged: bool,
}

impl FlushTask {
    async fn run(mut self, mut close_rx: oneshot::Receiver<Instant>) {
        let mut flush_timer = interval(self.config.batch_interval);
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut probe_timer = interval(self.config.recovery_probe_interval);
        probe_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let deadline = loop {
            // While engaged, stop taking records once a full batch is buffered
            // so the bounded queue pushes back on the workers
            let accepting = !(self.engaged && self.batch.len() >= self.config.batch_size);

            tokio::select! {
                close = &mut close_rx => {
                    break close.unwrap_or_else(|_| Instant::now() + self.config.write_timeout);
                }

                command = self.rx.recv(), if accepting => match command {
                    Some(SinkCommand::Record(record)) => {
                        self.batch.push(record);
                        if !self.engaged && self.batch.len() >= self.config.batch_size {
                            self.flush().await;
                        }
                    }
                    Some(SinkCommand::Flush(ack)) => {
                        if !self.engaged {
                            self.flush().await;
                        }
                        let _ = ack.send(());
                    }
                    None => break Instant::now() + self.config.write_timeout,
                },

                _ = flush_timer.tick(), if !self.engaged => {
                    self.flush().await;
                }

                _ = probe_timer.tick(), if self.engaged => {
                    self.probe().await;
                }
            }
        };

        self.shutdown(deadline).await;
    }

    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.batch);
        match self.write_with_retry(&batch, None).await {
            Ok(()) => {
                self.stats.records_written.fetch_add(batch.len() as u64, Ordering::Relaxed);
                self.stats.batches_written.fetch_add(1, Ordering::Relaxed);
                log::debug!("✅ Flushed {} records to {}", batch.len(), self.sink.backend_type());
            }
            Err(e) => {
                log::error!(
                    "❌ Sink rejected batch of {} records after retries: {}",
                    batch.len(),
                    e
                );
                self.stats.batches_rejected.fetch_add(1, Ordering::Relaxed);
                self.stats.records_rejected.fetch_add(batch.len() as u64, Ordering::Relaxed);
                self.reject(&batch, DeadLetterReason::SinkRejected, &e.to_string()).await;

                self.engaged = true;
                self.backpressure.engage();
            }
        }
    }

    async fn probe(&mut self) {
        let probe = tokio::time::timeout(self.config.write_timeout, self.sink.health_check()).await;
        match probe {
            Ok(Ok(())) => {
                log::info!("✅ {} sink healthy again", self.sink.backend_type());
                self.engaged = false;
                self.backpressure.release();
                self.flush().await;
            }
            Ok(Err(e)) => log::debug!("🔍 Sink probe failed: {}", e),
            Err(_) => log::debug!("🔍 Sink probe timed out"),
        }
    }

    /// Up to `retry_max_attempts` attempts, each bounded by the write timeout
    /// and, when given, by `deadline`
    async fn write_with_retry(
        &mut self,
        records: &[AnalyticsRecord],
        deadline: Option<Instant>,
    ) -> Result<(), SinkError> {
        let mut backoff = ExponentialBackoff::new(
            self.config.backoff_base,
            self.config.backoff_max,
            self.config.retry_max_attempts.saturating_sub(1),
        );

        loop {
            let mut budget = self.config.write_timeout;
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(SinkError::Timeout(0));
                }
                budget = budget.min(remaining);
            }

            let attempt = tokio::time::timeout(budget, self.sink.upsert_batch(records)).await;
            let error = match attempt {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => e,
                Err(_) => SinkError::Timeout(budget.as_millis() as u64),
            };

            if !error.is_transient() {
                return Err(error);
            }

            let Some(delay) = backoff.next_delay() else {
                return Err(error);
            };
            if let Some(deadline) = deadline {
                if Instant::now() + delay >= deadline {
                    return Err(error);
                }
            }

            log::warn!("⚠️  Sink write failed ({}), retrying", error);
            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            if backoff.sleep().await.is_err() {
                return Err(error);
            }
        }
    }

    async fn reject(&mut self, records: &[AnalyticsRecord], reason: DeadLetterReason, detail: &str) {
        for record in records {
            let payload = json_payload(record);
            self.dead_letters.route(&payload, reason, detail, Utc::now()).await;
        }
    }

    async fn shutdown(mut self, deadline: Instant) {
        self.rx.close();
        while let Ok(command) = self.rx.try_recv() {
            match command {
                SinkCommand::Record(record) => self.batch.push(record),
                SinkCommand::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }

        let remaining = std::mem::take(&mut self.batch);
        log::info!("🔄 Sink writer closing, {} records pending", remaining.len());

        let chunk_size = self.config.batch_size.max(1);
        let mut chunks = remaining.chunks(chunk_size);
        while let Some(chunk) = chunks.next() {
            match self.write_with_retry(chunk, Some(deadline)).await {
                Ok(()) => {
                    self.stats.records_written.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    self.stats.batches_written.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    log::error!("❌ Final flush failed, dropping {} records: {}", chunk.len(), e);
                    let mut dropped: Vec<AnalyticsRecord> = chunk.to_vec();
                    if Instant::now() >= deadline {
                        // No time left to try the rest
                        dropped.extend(chunks.by_ref().flatten().cloned());
                    }
                    self.stats.shutdown_dropped.fetch_add(dropped.len() as u64, Ordering::Relaxed);
                    self.reject(&dropped, DeadLetterReason::ShutdownDrop, &e.to_string()).await;
                }
            }
        }

        if self.engaged {
            self.backpressure.release();
        }

        let report = self.stats.snapshot();
        log::info!(
            "✅ Sink writer closed ({} written, {} rejected, {} dropped at shutdown)",
            report.records_written,
            report.records_rejected,
            report.shutdown_dropped
        );
    }
}
