//! Pipeline configuration from environment variables
//!
//! Every setting has a default; a variable that is set but does not parse is
//! a startup error rather than a silent fallback.

use std::env;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?} as {expected}")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("{var}: {reason}")]
    OutOfRange { var: &'static str, reason: String },
}

/// Configuration for the pipeline runtime
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Tumbling window length
    pub window_size: Duration,
    /// How long after a window ends it still accepts events
    pub allowed_lateness: Duration,
    /// Watermark lag behind the newest event time
    pub max_out_of_orderness: Duration,
    pub open_window_ceiling: usize,
    pub aggregator_shards: usize,
    pub window_trigger_interval: Duration,

    pub sink_batch_size: usize,
    pub sink_batch_interval: Duration,
    /// Total attempts per batch, including the first
    pub sink_retry_max_attempts: u32,
    pub sink_retry_backoff_base: Duration,
    pub sink_retry_backoff_max: Duration,
    pub sink_write_timeout: Duration,
    pub sink_queue_capacity: usize,
    pub sink_recovery_probe_interval: Duration,

    pub clock_skew_tolerance: Duration,

    /// Work queue between the reader and the workers
    pub channel_buffer: usize,
    pub channel_read_timeout: Duration,
    pub channel_poll_interval: Duration,
    /// Sustained channel failure after which the pipeline gives up
    pub channel_failure_max: Duration,

    pub worker_count: usize,
    pub shutdown_deadline: Duration,

    pub dead_letter_write_timeout: Duration,
    pub dead_letter_max_size_mb: u64,
    pub dead_letter_max_rotations: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window_size: Duration::from_millis(60_000),
            allowed_lateness: Duration::from_millis(30_000),
            max_out_of_orderness: Duration::from_millis(10_000),
            open_window_ceiling: 10_000,
            aggregator_shards: 16,
            window_trigger_interval: Duration::from_millis(1_000),
            sink_batch_size: 100,
            sink_batch_interval: Duration::from_millis(2_000),
            sink_retry_max_attempts: 5,
            sink_retry_backoff_base: Duration::from_millis(200),
            sink_retry_backoff_max: Duration::from_millis(10_000),
            sink_write_timeout: Duration::from_millis(10_000),
            sink_queue_capacity: 10_000,
            sink_recovery_probe_interval: Duration::from_millis(1_000),
            clock_skew_tolerance: Duration::from_millis(300_000),
            channel_buffer: 10_000,
            channel_read_timeout: Duration::from_millis(5_000),
            channel_poll_interval: Duration::from_millis(100),
            channel_failure_max: Duration::from_millis(60_000),
            worker_count: num_cpus::get().max(1),
            shutdown_deadline: Duration::from_millis(10_000),
            dead_letter_write_timeout: Duration::from_millis(2_000),
            dead_letter_max_size_mb: 100,
            dead_letter_max_rotations: 10,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables (defaults in parentheses):
    /// - `WINDOW_SIZE_MS` (60000), `ALLOWED_LATENESS_MS` (30000),
    ///   `MAX_OUT_OF_ORDERNESS_MS` (10000)
    /// - `OPEN_WINDOW_CEILING` (10000), `AGGREGATOR_SHARDS` (16),
    ///   `WINDOW_TRIGGER_INTERVAL_MS` (1000)
    /// - `SINK_BATCH_SIZE` (100), `SINK_BATCH_INTERVAL_MS` (2000),
    ///   `SINK_RETRY_MAX_ATTEMPTS` (5), `SINK_RETRY_BACKOFF_BASE_MS` (200),
    ///   `SINK_RETRY_BACKOFF_MAX_MS` (10000), `SINK_WRITE_TIMEOUT_MS` (10000),
    ///   `SINK_QUEUE_CAPACITY` (10000), `SINK_RECOVERY_PROBE_MS` (1000)
    /// - `CLOCK_SKEW_TOLERANCE_MS` (300000)
    /// - `CHANNEL_BUFFER` (10000), `CHANNEL_READ_TIMEOUT_MS` (5000),
    ///   `CHANNEL_POLL_INTERVAL_MS` (100), `CHANNEL_FAILURE_MAX_MS` (60000)
    /// - `WORKER_COUNT` (CPU count), `SHUTDOWN_DEADLINE_MS` (10000)
    /// - `DEAD_LETTER_WRITE_TIMEOUT_MS` (2000), `DEAD_LETTER_MAX_SIZE_MB` (100),
    ///   `DEAD_LETTER_MAX_ROTATIONS` (10)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (tests pass a map instead of the env)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let vars = Vars { lookup: &lookup };

        let config = Self {
            window_size: vars.millis("WINDOW_SIZE_MS", d.window_size)?,
            allowed_lateness: vars.millis("ALLOWED_LATENESS_MS", d.allowed_lateness)?,
            max_out_of_orderness: vars.millis("MAX_OUT_OF_ORDERNESS_MS", d.max_out_of_orderness)?,
            open_window_ceiling: vars.number("OPEN_WINDOW_CEILING", d.open_window_ceiling)?,
            aggregator_shards: vars.number("AGGREGATOR_SHARDS", d.aggregator_shards)?,
            window_trigger_interval: vars.millis("WINDOW_TRIGGER_INTERVAL_MS", d.window_trigger_interval)?,
            sink_batch_size: vars.number("SINK_BATCH_SIZE", d.sink_batch_size)?,
            sink_batch_interval: vars.millis("SINK_BATCH_INTERVAL_MS", d.sink_batch_interval)?,
            sink_retry_max_attempts: vars.number("SINK_RETRY_MAX_ATTEMPTS", d.sink_retry_max_attempts)?,
            sink_retry_backoff_base: vars.millis("SINK_RETRY_BACKOFF_BASE_MS", d.sink_retry_backoff_base)?,
            sink_retry_backoff_max: vars.millis("SINK_RETRY_BACKOFF_MAX_MS", d.sink_retry_backoff_max)?,
            sink_write_timeout: vars.millis("SINK_WRITE_TIMEOUT_MS", d.sink_write_timeout)?,
            sink_queue_capacity: vars.number("SINK_QUEUE_CAPACITY", d.sink_queue_capacity)?,
            sink_recovery_probe_interval: vars.millis("SINK_RECOVERY_PROBE_MS", d.sink_recovery_probe_interval)?,
            clock_skew_tolerance: vars.millis("CLOCK_SKEW_TOLERANCE_MS", d.clock_skew_tolerance)?,
            channel_buffer: vars.number("CHANNEL_BUFFER", d.channel_buffer)?,
            channel_read_timeout: vars.millis("CHANNEL_READ_TIMEOUT_MS", d.channel_read_timeout)?,
            channel_poll_interval: vars.millis("CHANNEL_POLL_INTERVAL_MS", d.channel_poll_interval)?,
            channel_failure_max: vars.millis("CHANNEL_FAILURE_MAX_MS", d.channel_failure_max)?,
            worker_count: vars.number("WORKER_COUNT", d.worker_count)?,
            shutdown_deadline: vars.millis("SHUTDOWN_DEADLINE_MS", d.shutdown_deadline)?,
            dead_letter_write_timeout: vars.millis("DEAD_LETTER_WRITE_TIMEOUT_MS", d.dead_letter_write_timeout)?,
            dead_letter_max_size_mb: vars.number("DEAD_LETTER_MAX_SIZE_MB", d.dead_letter_max_size_mb)?,
            dead_letter_max_rotations: vars.number("DEAD_LETTER_MAX_ROTATIONS", d.dead_letter_max_rotations)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("WINDOW_SIZE_MS", self.window_size.is_zero()),
            ("WINDOW_TRIGGER_INTERVAL_MS", self.window_trigger_interval.is_zero()),
            ("SINK_BATCH_INTERVAL_MS", self.sink_batch_interval.is_zero()),
            ("SINK_WRITE_TIMEOUT_MS", self.sink_write_timeout.is_zero()),
            ("SINK_RECOVERY_PROBE_MS", self.sink_recovery_probe_interval.is_zero()),
            ("CHANNEL_READ_TIMEOUT_MS", self.channel_read_timeout.is_zero()),
            ("CHANNEL_POLL_INTERVAL_MS", self.channel_poll_interval.is_zero()),
            ("DEAD_LETTER_WRITE_TIMEOUT_MS", self.dead_letter_write_timeout.is_zero()),
            ("OPEN_WINDOW_CEILING", self.open_window_ceiling == 0),
            ("AGGREGATOR_SHARDS", self.aggregator_shards == 0),
            ("SINK_BATCH_SIZE", self.sink_batch_size == 0),
            ("SINK_RETRY_MAX_ATTEMPTS", self.sink_retry_max_attempts == 0),
            ("SINK_QUEUE_CAPACITY", self.sink_queue_capacity == 0),
            ("CHANNEL_BUFFER", self.channel_buffer == 0),
            ("WORKER_COUNT", self.worker_count == 0),
            ("DEAD_LETTER_MAX_SIZE_MB", self.dead_letter_max_size_mb == 0),
            ("DEAD_LETTER_MAX_ROTATIONS", self.dead_letter_max_rotations == 0),
        ];

        for (var, is_zero) in positive {
            if is_zero {
                return Err(ConfigError::OutOfRange {
                    var,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if self.sink_retry_backoff_max < self.sink_retry_backoff_base {
            return Err(ConfigError::OutOfRange {
                var: "SINK_RETRY_BACKOFF_MAX_MS",
                reason: format!(
                    "{}ms is below SINK_RETRY_BACKOFF_BASE_MS ({}ms)",
                    self.sink_retry_backoff_max.as_millis(),
                    self.sink_retry_backoff_base.as_millis()
                ),
            });
        }

        Ok(())
    }

    /// Oldest event age the validator still accepts
    pub fn max_event_age(&self) -> Duration {
        self.window_size + self.allowed_lateness + self.max_out_of_orderness
    }

    pub fn log_summary(&self) {
        log::info!("⚙️  Pipeline configuration:");
        log::info!(
            "   ├─ Windows: {}ms tumbling, {}ms lateness, {}ms out-of-orderness",
            self.window_size.as_millis(),
            self.allowed_lateness.as_millis(),
            self.max_out_of_orderness.as_millis()
        );
        log::info!(
            "   ├─ Aggregator: {} shards, ceiling {} open windows, trigger every {}ms",
            self.aggregator_shards,
            self.open_window_ceiling,
            self.window_trigger_interval.as_millis()
        );
        log::info!(
            "   ├─ Sink: batch {} / {}ms, {} attempts, backoff {}..{}ms",
            self.sink_batch_size,
            self.sink_batch_interval.as_millis(),
            self.sink_retry_max_attempts,
            self.sink_retry_backoff_base.as_millis(),
            self.sink_retry_backoff_max.as_millis()
        );
        log::info!(
            "   ├─ Workers: {} | work queue: {} | sink queue: {}",
            self.worker_count,
            self.channel_buffer,
            self.sink_queue_capacity
        );
        log::info!("   └─ Shutdown deadline: {}ms", self.shutdown_deadline.as_millis());
    }
}

struct Vars<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn number<T: std::str::FromStr>(&self, var: &'static str, default: T) -> Result<T, ConfigError> {
        match (self.lookup)(var) {
            None => Ok(default),
            Some(raw) => {
                let parsed = raw.trim().parse::<T>();
                parsed.map_err(|_| ConfigError::Invalid {
                    var,
                    value: raw,
                    expected: "a non-negative integer",
                })
            }
        }
    }

    fn millis(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let default_ms = default.as_millis() as u64;
        self.number(var, default_ms).map(Duration::from_millis)
    }
}
