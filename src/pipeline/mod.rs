//! # Vitals Pipeline
//!
//! Streaming validation and enrichment for patient vitals telemetry:
//!
//! ```text
//! channel → Validator ─┬─ valid → RiskScorer → SinkWriter (per-event rows)
//!                      │                    └→ WindowedAggregator → SinkWriter (window rows)
//!                      └─ invalid → DeadLetterRouter
//! ```
//!
//! ## Module Organization
//!
//! - `types` - VitalsEvent, ValidationResult, AnalyticsRecord, DeadLetterRecord
//! - `validator` - schema, range and timing checks
//! - `risk` - RiskLevel and threshold-based scoring
//! - `windows` - sharded event-time tumbling windows
//! - `dead_letter` - router plus JSONL/SQLite/memory backends
//! - `backpressure` - sink → reader pause signal
//! - `ingestion` - per-message worker logic
//! - `engine` - coordinator (reader, workers, window trigger, shutdown)
//! - `stats` - live counters and final report
//! - `config` - environment configuration

pub mod backpressure;
pub mod config;
pub mod dead_letter;
pub mod engine;
pub mod ingestion;
pub mod risk;
pub mod stats;
pub mod types;
pub mod validator;
pub mod windows;

pub use config::{ConfigError, PipelineConfig};
pub use dead_letter::{DeadLetterBackend, DeadLetterRouter, JsonlDeadLetterWriter, MemoryDeadLetterWriter, SqliteDeadLetterWriter};
pub use engine::{Clock, PipelineCoordinator, PipelineError};
pub use ingestion::EventProcessor;
pub use risk::{RiskLevel, RiskScorer, RiskThresholds};
pub use stats::{PipelineReport, PipelineStats};
pub use types::{AnalyticsRecord, DeadLetterReason, DeadLetterRecord, ValidationResult, VitalsEvent, WindowAggregate};
pub use validator::{ValidationError, Validator};
pub use windows::{IngestOutcome, WindowedAggregator};
