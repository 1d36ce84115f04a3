//! Event-time tumbling windows per patient
//!
//! State is an arena of shards, each owning the open windows of the patients
//! that hash to it. A shard lock is only ever held for one key's work, so
//! patients in different shards never contend.
//!
//! Window lifecycle:
//! 1. Created by the first event whose `floor(event_ts, window_size)` matches
//! 2. Updated by every event for the same (patient_id, window_start)
//! 3. Emitted by `advance()` once `window_end + allowed_lateness <= watermark`
//! 4. Discarded after emission; events arriving later are rejected as late

use super::risk::RiskLevel;
use super::types::{VitalsEvent, WindowAggregate};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Sentinel for "no watermark yet"
const NO_WATERMARK: i64 = i64::MIN;

/// Key of one open window; orders oldest-first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowKey {
    /// Window start in epoch milliseconds
    pub window_start_ms: i64,
    pub patient_id: i64,
}

/// Running statistics for one (patient_id, window_start)
#[derive(Debug, Clone, PartialEq)]
pub struct WindowState {
    pub event_count: u64,
    pub heart_rate_sum: i64,
    pub spo2_alert_count: u64,
    pub max_risk: RiskLevel,
}

impl WindowState {
    fn new() -> Self {
        Self {
            event_count: 0,
            heart_rate_sum: 0,
            spo2_alert_count: 0,
            max_risk: RiskLevel::Normal,
        }
    }

    fn add(&mut self, event: &VitalsEvent, risk: RiskLevel, spo2_alert_below: i64) {
        self.event_count += 1;
        self.heart_rate_sum += event.heart_rate;
        if event.spo2 < spo2_alert_below {
            self.spo2_alert_count += 1;
        }
        self.max_risk = self.max_risk.max(risk);
    }

    pub fn avg_heart_rate(&self) -> f64 {
        if self.event_count == 0 {
            return 0.0;
        }
        self.heart_rate_sum as f64 / self.event_count as f64
    }
}

#[derive(Debug, Default)]
struct WindowShard {
    open: HashMap<WindowKey, WindowState>,
    /// Windows closed early by the ceiling; kept until the watermark passes them
    evicted: HashSet<WindowKey>,
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub window_size: Duration,
    pub allowed_lateness: Duration,
    pub max_out_of_orderness: Duration,
    pub open_window_ceiling: usize,
    pub shard_count: usize,
    /// An event with spo2 below this counts as an SpO2 alert
    pub spo2_alert_below: i64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            window_size: Duration::seconds(60),
            allowed_lateness: Duration::seconds(30),
            max_out_of_orderness: Duration::seconds(10),
            open_window_ceiling: 10_000,
            shard_count: 16,
            spo2_alert_below: 90,
        }
    }
}

/// Result of `ingest`
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Counted; carries any windows evicted to stay under the ceiling
    Accepted { evicted: Vec<WindowAggregate> },
    /// The event's window was already finalized or evicted
    Late {
        window_start: DateTime<Utc>,
        watermark: Option<DateTime<Utc>>,
    },
}

pub struct WindowedAggregator {
    shards: Vec<Mutex<WindowShard>>,
    window_size_ms: i64,
    allowed_lateness_ms: i64,
    max_out_of_orderness_ms: i64,
    open_window_ceiling: usize,
    spo2_alert_below: i64,
    open_windows: AtomicUsize,
    max_event_ts_ms: AtomicI64,
    /// Highest watermark ever handed to `advance`
    emitted_through_ms: AtomicI64,
}

impl WindowedAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        let shard_count = config.shard_count.max(1);
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(WindowShard::default())).collect(),
            window_size_ms: config.window_size.num_milliseconds().max(1),
            allowed_lateness_ms: config.allowed_lateness.num_milliseconds().max(0),
            max_out_of_orderness_ms: config.max_out_of_orderness.num_milliseconds().max(0),
            open_window_ceiling: config.open_window_ceiling.max(1),
            spo2_alert_below: config.spo2_alert_below,
            open_windows: AtomicUsize::new(0),
            max_event_ts_ms: AtomicI64::new(NO_WATERMARK),
            emitted_through_ms: AtomicI64::new(NO_WATERMARK),
        }
    }

    /// Number of windows currently holding state
    pub fn open_window_count(&self) -> usize {
        self.open_windows.load(Ordering::Acquire)
    }

    /// Max observed event time minus the out-of-orderness bound
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        let max_ts = self.max_event_ts_ms.load(Ordering::Acquire);
        if max_ts == NO_WATERMARK {
            return None;
        }
        Some(ms_to_ts(max_ts.saturating_sub(self.max_out_of_orderness_ms)))
    }

    /// Add an event to its window
    pub fn ingest(&self, event: &VitalsEvent, risk: RiskLevel) -> IngestOutcome {
        let event_ms = event.event_ts.timestamp_millis();
        self.max_event_ts_ms.fetch_max(event_ms, Ordering::AcqRel);

        let key = WindowKey {
            window_start_ms: self.window_start(event_ms),
            patient_id: event.patient_id,
        };

        let created = {
            let mut shard = self.lock_shard(key.patient_id);
            let watermark_ms = self.effective_watermark_ms();

            if shard.evicted.contains(&key) || self.is_closed(key, watermark_ms) {
                return IngestOutcome::Late {
                    window_start: ms_to_ts(key.window_start_ms),
                    watermark: (watermark_ms != NO_WATERMARK).then(|| ms_to_ts(watermark_ms)),
                };
            }

            let mut created = false;
            shard
                .open
                .entry(key)
                .or_insert_with(|| {
                    created = true;
                    WindowState::new()
                })
                .add(event, risk, self.spo2_alert_below);
            created
        };

        let mut evicted = Vec::new();
        if created {
            let open = self.open_windows.fetch_add(1, Ordering::AcqRel) + 1;
            if open > self.open_window_ceiling {
                evicted = self.evict_over_ceiling();
            }
        }

        IngestOutcome::Accepted { evicted }
    }

    /// Emit every window with `window_end + allowed_lateness <= watermark`
    ///
    /// Output is ordered by (window_start, patient_id).
    pub fn advance(&self, watermark: DateTime<Utc>) -> Vec<WindowAggregate> {
        let watermark_ms = watermark.timestamp_millis();
        // Publish first so concurrent ingests observe the closure
        self.emitted_through_ms.fetch_max(watermark_ms, Ordering::AcqRel);

        let mut emitted = Vec::new();
        for shard in &self.shards {
            let mut shard = lock(shard);
            let closed: Vec<WindowKey> = shard
                .open
                .keys()
                .filter(|key| self.is_closed(**key, watermark_ms))
                .copied()
                .collect();

            for key in closed {
                if let Some(state) = shard.open.remove(&key) {
                    self.open_windows.fetch_sub(1, Ordering::AcqRel);
                    emitted.push((key, state));
                }
            }

            // Eviction markers are redundant once the watermark covers them
            shard.evicted.retain(|key| !self.is_closed(*key, watermark_ms));
        }

        emitted.sort_by_key(|(key, _)| *key);
        emitted
            .into_iter()
            .map(|(key, state)| self.finalize(key, &state, false))
            .collect()
    }

    /// Advance to the aggregator's own watermark
    pub fn advance_to_watermark(&self) -> Vec<WindowAggregate> {
        match self.watermark() {
            Some(watermark) => self.advance(watermark),
            None => Vec::new(),
        }
    }

    /// Finalize every open window as partial (shutdown)
    pub fn drain_all(&self) -> Vec<WindowAggregate> {
        let mut drained = Vec::new();
        for shard in &self.shards {
            let mut shard = lock(shard);
            for (key, state) in shard.open.drain() {
                self.open_windows.fetch_sub(1, Ordering::AcqRel);
                drained.push((key, state));
            }
        }

        drained.sort_by_key(|(key, _)| *key);
        drained
            .into_iter()
            .map(|(key, state)| self.finalize(key, &state, true))
            .collect()
    }

    /// Evict oldest windows until the open count is back at the ceiling
    ///
    /// Each removal first claims one unit of excess from `open_windows`, so
    /// concurrent evictors never take the count below the ceiling. Shards are
    /// locked one at a time; a claim whose candidate vanished in between is
    /// handed back.
    fn evict_over_ceiling(&self) -> Vec<WindowAggregate> {
        let mut evicted = Vec::new();

        loop {
            let excess = self
                .open_windows
                .load(Ordering::Acquire)
                .saturating_sub(self.open_window_ceiling);
            if excess == 0 {
                break;
            }

            let candidates = self.oldest_keys(excess);
            if candidates.is_empty() {
                break;
            }

            for key in candidates {
                if !self.claim_eviction() {
                    return evicted;
                }

                let mut shard = self.lock_shard(key.patient_id);
                let Some(state) = shard.open.remove(&key) else {
                    self.open_windows.fetch_add(1, Ordering::AcqRel);
                    continue;
                };
                shard.evicted.insert(key);
                drop(shard);

                log::warn!(
                    "⚠️  Open-window ceiling ({}) exceeded, evicting patient {} window {}",
                    self.open_window_ceiling,
                    key.patient_id,
                    ms_to_ts(key.window_start_ms)
                );
                evicted.push(self.finalize(key, &state, true));
            }
        }

        evicted
    }

    /// Take one window off the open count, only while it is over the ceiling
    fn claim_eviction(&self) -> bool {
        self.open_windows
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open > self.open_window_ceiling).then(|| open - 1)
            })
            .is_ok()
    }

    /// Up to `limit` oldest open keys across all shards, oldest first
    fn oldest_keys(&self, limit: usize) -> Vec<WindowKey> {
        let mut heap = BinaryHeap::with_capacity(limit + 1);
        for shard in &self.shards {
            let shard = lock(shard);
            for key in shard.open.keys() {
                heap.push(*key);
                if heap.len() > limit {
                    heap.pop();
                }
            }
        }
        heap.into_sorted_vec()
    }

    fn finalize(&self, key: WindowKey, state: &WindowState, is_partial: bool) -> WindowAggregate {
        WindowAggregate {
            patient_id: key.patient_id,
            window_start: ms_to_ts(key.window_start_ms),
            window_end: ms_to_ts(key.window_start_ms + self.window_size_ms),
            avg_heart_rate: state.avg_heart_rate(),
            spo2_alert_count: state.spo2_alert_count,
            event_count: state.event_count,
            max_risk_level: state.max_risk,
            is_partial,
        }
    }

    fn window_start(&self, event_ms: i64) -> i64 {
        event_ms - event_ms.rem_euclid(self.window_size_ms)
    }

    fn is_closed(&self, key: WindowKey, watermark_ms: i64) -> bool {
        if watermark_ms == NO_WATERMARK {
            return false;
        }
        let window_end = key.window_start_ms + self.window_size_ms;
        window_end + self.allowed_lateness_ms <= watermark_ms
    }

    fn effective_watermark_ms(&self) -> i64 {
        let observed = match self.max_event_ts_ms.load(Ordering::Acquire) {
            NO_WATERMARK => NO_WATERMARK,
            max_ts => max_ts.saturating_sub(self.max_out_of_orderness_ms),
        };
        observed.max(self.emitted_through_ms.load(Ordering::Acquire))
    }

    fn lock_shard(&self, patient_id: i64) -> MutexGuard<'_, WindowShard> {
        let index = patient_id.rem_euclid(self.shards.len() as i64) as usize;
        lock(&self.shards[index])
    }
}

/// Shard locks are never held across a panic-prone call; recover if poisoned
fn lock(shard: &Mutex<WindowShard>) -> MutexGuard<'_, WindowShard> {
    shard.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn ms_to_ts(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or(DateTime::<Utc>::MIN_UTC)
}
