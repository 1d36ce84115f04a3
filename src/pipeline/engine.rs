//! Pipeline coordinator
//!
//! ```text
//! MessageSource ──reader──▶ work queue ──▶ workers (EventProcessor) ──▶ SinkWriter ──▶ AnalyticsSink
//!      ▲                                      │            │
//!      └── backpressure (sink unhealthy)      │            └──▶ DeadLetterRouter
//!                                             ▼
//!                              WindowedAggregator ◀── window trigger (advance every tick)
//! ```
//!
//! Shutdown (termination signal, finite source exhausted, or fatal channel
//! loss), all bounded by one deadline:
//! 1. reader stops and closes the work queue
//! 2. workers drain it; past the deadline they are cancelled, and both their
//!    in-flight events and the rest of the queue are dead-lettered as `ShutdownDrop`
//! 3. trigger stops; closed windows are emitted, open ones drained as partial
//! 4. sink writer flushes and closes

use super::backpressure::{self, BackpressureController, BackpressureSignal};
use super::config::PipelineConfig;
use super::dead_letter::{DeadLetterBackend, DeadLetterRouter};
use super::ingestion::{cancelled, chrono_duration, EventProcessor};
use super::stats::{PipelineReport, PipelineStats};
use super::types::{json_payload, AnalyticsRecord, DeadLetterReason, WindowAggregate};
use super::windows::{AggregatorConfig, WindowedAggregator};
use crate::channel::{ExponentialBackoff, MessageSource, Received};
use crate::sink::{AnalyticsSink, SinkError, SinkHandle, SinkWriter, SinkWriterConfig};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, timeout, timeout_at, Instant, MissedTickBehavior};

/// Interval between throughput log lines
const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("channel lost: {0}")]
    ChannelLost(String),

    #[error("analytics sink unavailable at startup: {0}")]
    SinkUnavailable(#[from] SinkError),
}

/// Wall clock used for `ingest_ts` and dead-letter arrival times
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

struct WorkItem {
    payload: Vec<u8>,
    ingest_ts: DateTime<Utc>,
}

enum ReaderExit {
    Shutdown,
    Exhausted,
    Fatal(PipelineError),
}

pub struct PipelineCoordinator {
    config: PipelineConfig,
    sink: Box<dyn AnalyticsSink>,
    aggregator: Arc<WindowedAggregator>,
    dead_letters: Arc<DeadLetterRouter>,
    stats: Arc<PipelineStats>,
    backpressure: BackpressureController,
    clock: Clock,
}

impl PipelineCoordinator {
    pub fn new(
        config: PipelineConfig,
        sink: Box<dyn AnalyticsSink>,
        dead_letters: Box<dyn DeadLetterBackend>,
    ) -> Self {
        let aggregator = WindowedAggregator::new(AggregatorConfig {
            window_size: chrono_duration(config.window_size),
            allowed_lateness: chrono_duration(config.allowed_lateness),
            max_out_of_orderness: chrono_duration(config.max_out_of_orderness),
            open_window_ceiling: config.open_window_ceiling,
            shard_count: config.aggregator_shards,
            ..AggregatorConfig::default()
        });
        let dead_letters = DeadLetterRouter::new(dead_letters, config.dead_letter_write_timeout);
        let (backpressure, _) = backpressure::channel();

        Self {
            config,
            sink,
            aggregator: Arc::new(aggregator),
            dead_letters: Arc::new(dead_letters),
            stats: Arc::new(PipelineStats::new()),
            backpressure,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    pub fn backpressure(&self) -> BackpressureSignal {
        self.backpressure.signal()
    }

    pub fn aggregator(&self) -> Arc<WindowedAggregator> {
        self.aggregator.clone()
    }

    /// Run until `shutdown` resolves, the source is exhausted, or the channel
    /// is lost; always finishes with a graceful drain
    pub async fn run<F>(self, mut source: Box<dyn MessageSource>, shutdown: F) -> Result<PipelineReport, PipelineError>
    where
        F: Future<Output = ()> + Send,
    {
        let PipelineCoordinator {
            config,
            mut sink,
            aggregator,
            dead_letters,
            stats,
            backpressure,
            clock,
        } = self;

        log::info!("🚀 Starting vitals pipeline");
        config.log_summary();

        let probe = match timeout(config.sink_write_timeout, sink.health_check()).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout(config.sink_write_timeout.as_millis() as u64)),
        };
        if let Err(e) = probe {
            log::error!("❌ Sink health check failed: {}", e);
            return Err(PipelineError::SinkUnavailable(e));
        }
        log::info!("✅ {} sink reachable", sink.backend_type());

        let sink_writer = SinkWriter::spawn(
            sink,
            SinkWriterConfig::from_pipeline(&config),
            dead_letters.clone(),
            backpressure.clone(),
        );

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let processor = Arc::new(
            EventProcessor::new(
                &config,
                aggregator.clone(),
                sink_writer.handle(),
                dead_letters.clone(),
                stats.clone(),
            )
            .with_cancel(cancel_rx.clone()),
        );

        let (work_tx, work_rx) = mpsc::channel::<WorkItem>(config.channel_buffer);
        let work_rx = Arc::new(Mutex::new(work_rx));

        let mut workers = JoinSet::new();
        for worker_id in 0..config.worker_count {
            workers.spawn(run_worker(worker_id, work_rx.clone(), processor.clone(), cancel_rx.clone()));
        }
        drop(processor);
        log::info!("   ├─ ✅ {} workers spawned", config.worker_count);

        let (stop_tx, stop_rx) = watch::channel(false);
        let trigger = tokio::spawn(run_window_trigger(
            aggregator.clone(),
            sink_writer.handle(),
            stats.clone(),
            config.window_trigger_interval,
            stop_rx,
        ));
        log::info!("   └─ ✅ Window trigger every {}ms", config.window_trigger_interval.as_millis());
        log::info!("📖 Reading from {} source", source.source_type());

        let reader = ReadLoop {
            config: &config,
            aggregator: &aggregator,
            dead_letters: &dead_letters,
            stats: &stats,
            clock: &clock,
        };
        let sink_handle = sink_writer.handle();
        let mut shutdown = std::pin::pin!(shutdown);
        let exit = reader
            .run(
                source.as_mut(),
                &work_tx,
                &sink_handle,
                backpressure.signal(),
                shutdown.as_mut(),
            )
            .await;

        match &exit {
            ReaderExit::Shutdown => log::info!("⚠️  Shutdown requested, draining pipeline..."),
            ReaderExit::Exhausted => log::info!("📭 Source exhausted, draining pipeline..."),
            ReaderExit::Fatal(e) => log::error!("❌ {}; draining pipeline before exit", e),
        }

        let deadline = Instant::now() + config.shutdown_deadline;
        drop(work_tx);

        // Workers drain the queue
        let drained = timeout_at(deadline, async {
            while let Some(result) = workers.join_next().await {
                if let Err(e) = result {
                    log::error!("❌ Worker task failed: {}", e);
                }
            }
        })
        .await;
        if drained.is_err() {
            log::warn!("⚠️  Shutdown deadline reached, cancelling workers");
            let _ = cancel_tx.send(true);

            // A cancelled worker still writes one dead letter for its event
            let grace = config.dead_letter_write_timeout * 2;
            let stopped = timeout(grace, async {
                while let Some(result) = workers.join_next().await {
                    if let Err(e) = result {
                        log::error!("❌ Worker task failed: {}", e);
                    }
                }
            })
            .await;
            if stopped.is_err() {
                log::error!("❌ Workers ignored cancellation, aborting");
                workers.abort_all();
                while workers.join_next().await.is_some() {}
            }

            let mut queue = work_rx.lock().await;
            while let Ok(item) = queue.try_recv() {
                PipelineStats::incr(&stats.shutdown_dropped);
                dead_letters
                    .route(
                        &item.payload,
                        DeadLetterReason::ShutdownDrop,
                        "shutdown deadline reached before processing",
                        item.ingest_ts,
                    )
                    .await;
            }
        }

        // Stop the trigger and take back anything it could not hand over
        let _ = stop_tx.send(true);
        let mut windows = match trigger.await {
            Ok(unsent) => unsent,
            Err(e) => {
                log::error!("❌ Window trigger task failed: {}", e);
                Vec::new()
            }
        };

        windows.extend(aggregator.advance_to_watermark());
        let partial = aggregator.drain_all();
        PipelineStats::add(&stats.partial_windows, partial.len() as u64);
        log::info!(
            "🪟 Finalizing {} closed and {} partial windows",
            windows.len(),
            partial.len()
        );
        windows.extend(partial);

        for window in windows {
            let record = AnalyticsRecord::Window(window);
            match timeout_at(deadline, sink_handle.submit(record.clone())).await {
                Ok(Ok(())) => PipelineStats::incr(&stats.windows_emitted),
                _ => {
                    PipelineStats::incr(&stats.shutdown_dropped);
                    let payload = json_payload(&record);
                    dead_letters
                        .route(
                            &payload,
                            DeadLetterReason::ShutdownDrop,
                            "window could not be queued before shutdown deadline",
                            clock(),
                        )
                        .await;
                }
            }
        }
        drop(sink_handle);

        // The sink always gets at least one write attempt
        let sink_deadline = deadline.max(Instant::now() + config.sink_write_timeout);
        let sink_report = sink_writer.close(sink_deadline).await;
        dead_letters.flush().await;

        let mut report = stats.snapshot();
        report.records_written = sink_report.records_written;
        report.sink_batches_rejected = sink_report.batches_rejected;
        report.shutdown_dropped += sink_report.shutdown_dropped;
        report.dead_letters_written = dead_letters.routed_count();
        report.dead_letters_failed = dead_letters.failed_count();
        report.log_summary();

        match exit {
            ReaderExit::Fatal(e) => Err(e),
            _ => {
                log::info!("✅ Pipeline stopped");
                Ok(report)
            }
        }
    }
}

/// Reader side of the coordinator: channel → work queue
struct ReadLoop<'a> {
    config: &'a PipelineConfig,
    aggregator: &'a WindowedAggregator,
    dead_letters: &'a DeadLetterRouter,
    stats: &'a PipelineStats,
    clock: &'a Clock,
}

impl ReadLoop<'_> {
    async fn run(
        &self,
        source: &mut dyn MessageSource,
        work_tx: &mpsc::Sender<WorkItem>,
        sink: &SinkHandle,
        signal: BackpressureSignal,
        mut shutdown: Pin<&mut (dyn Future<Output = ()> + Send + '_)>,
    ) -> ReaderExit {
        let poll_interval = self.config.channel_poll_interval;
        let mut backoff = ExponentialBackoff::new(poll_interval, Duration::from_secs(5), u32::MAX);
        let mut failing_since: Option<Instant> = None;
        let mut last_status = Instant::now();
        let mut received_since_status = 0u64;

        loop {
            if signal.is_engaged() {
                PipelineStats::incr(&self.stats.backpressure_pauses);
                log::warn!("⏸️  Reader paused by backpressure");
                while signal.is_engaged() {
                    tokio::select! {
                        _ = shutdown.as_mut() => return ReaderExit::Shutdown,
                        _ = sleep(poll_interval) => {}
                    }
                }
                log::info!("▶️  Reader resumed");
            }

            if last_status.elapsed() >= STATUS_LOG_INTERVAL {
                let rate = received_since_status as f64 / last_status.elapsed().as_secs_f64();
                log::info!(
                    "📊 Ingestion rate: {:.1} msg/sec | work queue: {}/{} | sink queue: {} | open windows: {}",
                    rate,
                    work_tx.max_capacity() - work_tx.capacity(),
                    work_tx.max_capacity(),
                    sink.queued(),
                    self.aggregator.open_window_count()
                );
                last_status = Instant::now();
                received_since_status = 0;
            }

            let received = tokio::select! {
                _ = shutdown.as_mut() => return ReaderExit::Shutdown,
                received = timeout(self.config.channel_read_timeout, source.recv()) => received,
            };

            match received {
                // Quiet channel
                Err(_) => continue,

                Ok(Ok(Received::Message(message))) => {
                    failing_since = None;
                    backoff.reset();
                    PipelineStats::incr(&self.stats.messages_received);
                    received_since_status += 1;

                    let item = WorkItem {
                        payload: message.payload,
                        ingest_ts: (self.clock)(),
                    };

                    // A full queue means workers are behind; keep honoring shutdown
                    let permit = tokio::select! {
                        _ = shutdown.as_mut() => {
                            PipelineStats::incr(&self.stats.shutdown_dropped);
                            self.dead_letters
                                .route(
                                    &item.payload,
                                    DeadLetterReason::ShutdownDrop,
                                    "shutdown requested while work queue was full",
                                    item.ingest_ts,
                                )
                                .await;
                            self.stats.last_cursor.store(message.cursor, Ordering::Relaxed);
                            return ReaderExit::Shutdown;
                        }
                        permit = work_tx.reserve() => permit,
                    };
                    match permit {
                        Ok(permit) => permit.send(item),
                        Err(_) => return ReaderExit::Exhausted,
                    }
                    self.stats.last_cursor.store(message.cursor, Ordering::Relaxed);
                }

                Ok(Ok(Received::Idle)) => {
                    tokio::select! {
                        _ = shutdown.as_mut() => return ReaderExit::Shutdown,
                        _ = sleep(poll_interval) => {}
                    }
                }

                Ok(Ok(Received::Closed)) => return ReaderExit::Exhausted,

                Ok(Err(e)) => {
                    PipelineStats::incr(&self.stats.channel_errors);
                    let since = *failing_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= self.config.channel_failure_max {
                        return ReaderExit::Fatal(PipelineError::ChannelLost(format!(
                            "{} (failing for {}ms)",
                            e,
                            since.elapsed().as_millis()
                        )));
                    }

                    log::warn!("⚠️  Channel read failed: {}", e);
                    tokio::select! {
                        _ = shutdown.as_mut() => return ReaderExit::Shutdown,
                        _ = backoff.sleep() => {}
                    }
                }
            }
        }
    }
}

async fn run_worker(
    worker_id: usize,
    queue: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    processor: Arc<EventProcessor>,
    cancel: watch::Receiver<bool>,
) {
    loop {
        // Dequeue only; processing runs outside the lock
        let item = tokio::select! {
            biased;
            true = cancelled(cancel.clone()) => None,
            item = async { queue.lock().await.recv().await } => item,
        };
        let Some(item) = item else { break };

        if processor.process(&item.payload, item.ingest_ts).await.is_err() {
            log::error!("❌ Worker {} stopping: sink writer closed", worker_id);
            break;
        }
    }
    log::debug!("Worker {} finished", worker_id);
}

/// Advance windows on every tick; returns the windows it could not submit
/// before being stopped
async fn run_window_trigger(
    aggregator: Arc<WindowedAggregator>,
    sink: SinkHandle,
    stats: Arc<PipelineStats>,
    trigger_interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> Vec<WindowAggregate> {
    let mut ticker = interval(trigger_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.changed() => return Vec::new(),
            _ = ticker.tick() => {}
        }

        let mut pending: VecDeque<WindowAggregate> = aggregator.advance_to_watermark().into();
        if !pending.is_empty() {
            log::debug!("🪟 Emitting {} closed windows", pending.len());
        }

        while let Some(window) = pending.pop_front() {
            tokio::select! {
                _ = stop.changed() => {
                    pending.push_front(window);
                    return pending.into();
                }
                submitted = sink.submit(AnalyticsRecord::Window(window.clone())) => {
                    if submitted.is_err() {
                        pending.push_front(window);
                        return pending.into();
                    }
                    PipelineStats::incr(&stats.windows_emitted);
                }
            }
        }
    }
}
