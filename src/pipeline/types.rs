//! Core data types flowing through the vitals pipeline
//!
//! - `VitalsEvent` - validated telemetry event (immutable)
//! - `ValidationResult` - per-message outcome of the validator
//! - `AnalyticsRecord` - sink write unit (per-event row or per-window aggregate)
//! - `DeadLetterRecord` - side-channel record for failed messages

use super::risk::RiskLevel;
use super::validator::ValidationError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Format a timestamp the way it is keyed in the analytics store
///
/// Fixed microsecond precision keeps natural keys byte-stable across replays.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Serialize a record for the dead-letter side channel
///
/// Falls back to the Debug rendering when JSON serialization fails, so the
/// dead letter still carries something an operator can read.
pub fn json_payload<T: Serialize + fmt::Debug>(value: &T) -> Vec<u8> {
    match serde_json::to_vec(value) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::error!("❌ Cannot serialize dead-letter payload, storing debug form: {}", e);
            format!("{:?}", value).into_bytes()
        }
    }
}

/// A telemetry event that passed schema, range and timing validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VitalsEvent {
    /// Source-claimed event time, normalized to UTC
    pub event_ts: DateTime<Utc>,
    pub patient_id: i64,
    pub heart_rate: i64,
    /// Body temperature in °F
    pub temperature: f64,
    pub bp_systolic: i64,
    pub bp_diastolic: i64,
    pub spo2: i64,
    /// Assigned by the pipeline when the message was read from the channel
    pub ingest_ts: DateTime<Utc>,
}

/// Outcome of validating and scoring one inbound message
///
/// Built by `EventProcessor::evaluate`; exactly one per message.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    Valid {
        event: VitalsEvent,
        risk: RiskLevel,
    },
    Invalid {
        raw_payload: Vec<u8>,
        reason: ValidationError,
    },
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid { .. })
    }
}

/// Per-event analytics row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VitalsRecord {
    pub event_ts: DateTime<Utc>,
    pub ingest_ts: DateTime<Utc>,
    pub patient_id: i64,
    pub heart_rate: i64,
    pub temperature: f64,
    pub bp_systolic: i64,
    pub bp_diastolic: i64,
    pub spo2: i64,
    pub risk_level: RiskLevel,
}

impl VitalsRecord {
    pub fn new(event: &VitalsEvent, risk_level: RiskLevel) -> Self {
        Self {
            event_ts: event.event_ts,
            ingest_ts: event.ingest_ts,
            patient_id: event.patient_id,
            heart_rate: event.heart_rate,
            temperature: event.temperature,
            bp_systolic: event.bp_systolic,
            bp_diastolic: event.bp_diastolic,
            spo2: event.spo2,
            risk_level,
        }
    }
}

/// Per-window aggregate row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowAggregate {
    pub patient_id: i64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub avg_heart_rate: f64,
    pub spo2_alert_count: u64,
    pub event_count: u64,
    pub max_risk_level: RiskLevel,
    /// True when the window was finalized before its watermark closed it
    /// (shutdown drain or ceiling eviction)
    pub is_partial: bool,
}

/// Natural key used for idempotent upserts
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKey {
    Event { patient_id: i64, event_ts: String },
    Window { patient_id: i64, window_start: String },
}

/// The sink's write unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record_type", rename_all = "snake_case")]
pub enum AnalyticsRecord {
    Event(VitalsRecord),
    Window(WindowAggregate),
}

impl AnalyticsRecord {
    pub fn natural_key(&self) -> RecordKey {
        match self {
            AnalyticsRecord::Event(r) => RecordKey::Event {
                patient_id: r.patient_id,
                event_ts: format_ts(&r.event_ts),
            },
            AnalyticsRecord::Window(w) => RecordKey::Window {
                patient_id: w.patient_id,
                window_start: format_ts(&w.window_start),
            },
        }
    }

    pub fn patient_id(&self) -> i64 {
        match self {
            AnalyticsRecord::Event(r) => r.patient_id,
            AnalyticsRecord::Window(w) => w.patient_id,
        }
    }
}

/// Why a message ended up in the dead-letter channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeadLetterReason {
    SchemaError,
    RangeError,
    ClockSkew,
    LateData,
    ShutdownDrop,
    /// Sink batch failed after exhausting retries
    SinkRejected,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::SchemaError => "SchemaError",
            DeadLetterReason::RangeError => "RangeError",
            DeadLetterReason::ClockSkew => "ClockSkew",
            DeadLetterReason::LateData => "LateData",
            DeadLetterReason::ShutdownDrop => "ShutdownDrop",
            DeadLetterReason::SinkRejected => "SinkRejected",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable dead-letter entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Original payload; base64 when the bytes were not valid UTF-8
    pub raw_payload: String,
    pub payload_encoding: PayloadEncoding,
    pub reason: DeadLetterReason,
    pub detail: String,
    pub arrival_ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    Utf8,
    Base64,
}

impl PayloadEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadEncoding::Utf8 => "utf8",
            PayloadEncoding::Base64 => "base64",
        }
    }
}

impl DeadLetterRecord {
    pub fn new(
        payload: &[u8],
        reason: DeadLetterReason,
        detail: impl Into<String>,
        arrival_ts: DateTime<Utc>,
    ) -> Self {
        let (raw_payload, payload_encoding) = match std::str::from_utf8(payload) {
            Ok(text) => (text.to_string(), PayloadEncoding::Utf8),
            Err(_) => (STANDARD.encode(payload), PayloadEncoding::Base64),
        };

        Self {
            raw_payload,
            payload_encoding,
            reason,
            detail: detail.into(),
            arrival_ts,
        }
    }

    /// Recover the exact bytes that were dead-lettered
    pub fn payload_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        match self.payload_encoding {
            PayloadEncoding::Utf8 => Ok(self.raw_payload.clone().into_bytes()),
            PayloadEncoding::Base64 => STANDARD.decode(&self.raw_payload),
        }
    }
}
