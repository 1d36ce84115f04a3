//! Schema, range and timing validation for inbound vitals payloads
//!
//! Fail closed: the first violated rule decides the outcome. Checks run in a
//! fixed order (schema for every field, then ranges, then timing) so the same
//! payload always yields the same error.

use super::types::{DeadLetterReason, VitalsEvent};
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("schema error on `{field}`: {detail}")]
    Schema { field: String, detail: String },

    #[error("{field}={value} outside [{min}, {max}]")]
    Range {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("bp_systolic={systolic} must exceed bp_diastolic={diastolic}")]
    PulsePressure { systolic: i64, diastolic: i64 },

    #[error("event_ts {event_ts} is {ahead_ms}ms ahead of ingest_ts {ingest_ts}")]
    ClockSkew {
        event_ts: DateTime<Utc>,
        ingest_ts: DateTime<Utc>,
        ahead_ms: i64,
    },

    #[error("event_ts {event_ts} is {age_ms}ms old, beyond the lateness bound")]
    TooLate { event_ts: DateTime<Utc>, age_ms: i64 },
}

impl ValidationError {
    fn schema(field: &str, detail: impl Into<String>) -> Self {
        ValidationError::Schema {
            field: field.to_string(),
            detail: detail.into(),
        }
    }

    /// Dead-letter reason code for this failure
    pub fn reason(&self) -> DeadLetterReason {
        match self {
            ValidationError::Schema { .. } => DeadLetterReason::SchemaError,
            ValidationError::Range { .. } | ValidationError::PulsePressure { .. } => {
                DeadLetterReason::RangeError
            }
            ValidationError::ClockSkew { .. } => DeadLetterReason::ClockSkew,
            ValidationError::TooLate { .. } => DeadLetterReason::LateData,
        }
    }
}

/// Inclusive physiological bounds
#[derive(Debug, Clone, PartialEq)]
pub struct RangeLimits {
    pub heart_rate: (i64, i64),
    pub spo2: (i64, i64),
    pub temperature: (f64, f64),
    pub bp_systolic: (i64, i64),
    pub bp_diastolic: (i64, i64),
}

impl Default for RangeLimits {
    fn default() -> Self {
        Self {
            heart_rate: (0, 300),
            spo2: (0, 100),
            temperature: (70.0, 115.0),
            bp_systolic: (40, 260),
            bp_diastolic: (20, 200),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Validator {
    limits: RangeLimits,
    clock_skew_tolerance: Duration,
    max_event_age: Duration,
}

impl Validator {
    pub fn new(clock_skew_tolerance: Duration, max_event_age: Duration) -> Self {
        Self::with_limits(RangeLimits::default(), clock_skew_tolerance, max_event_age)
    }

    pub fn with_limits(limits: RangeLimits, clock_skew_tolerance: Duration, max_event_age: Duration) -> Self {
        Self {
            limits,
            clock_skew_tolerance,
            max_event_age,
        }
    }

    /// Validate raw channel bytes
    pub fn validate(&self, payload: &[u8], ingest_ts: DateTime<Utc>) -> Result<VitalsEvent, ValidationError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| ValidationError::schema("payload", format!("not valid JSON: {}", e)))?;

        match value {
            Value::Object(fields) => self.validate_fields(&fields, ingest_ts),
            other => Err(ValidationError::schema(
                "payload",
                format!("expected JSON object, got {}", json_type(&other)),
            )),
        }
    }

    /// Validate an already-decoded payload
    pub fn validate_fields(
        &self,
        fields: &Map<String, Value>,
        ingest_ts: DateTime<Utc>,
    ) -> Result<VitalsEvent, ValidationError> {
        let event_ts = timestamp_field(fields, "event_ts")?;
        let patient_id = int_field(fields, "patient_id")?;
        if patient_id < 1 {
            return Err(ValidationError::schema(
                "patient_id",
                format!("must be a positive integer, got {}", patient_id),
            ));
        }
        let heart_rate = int_field(fields, "heart_rate")?;
        let temperature = float_field(fields, "temperature")?;
        let bp_systolic = int_field(fields, "bp_systolic")?;
        let bp_diastolic = int_field(fields, "bp_diastolic")?;
        let spo2 = int_field(fields, "spo2")?;

        let limits = &self.limits;
        check_int("heart_rate", heart_rate, limits.heart_rate)?;
        check_int("spo2", spo2, limits.spo2)?;
        check_float("temperature", temperature, limits.temperature)?;
        check_int("bp_systolic", bp_systolic, limits.bp_systolic)?;
        check_int("bp_diastolic", bp_diastolic, limits.bp_diastolic)?;
        if bp_systolic <= bp_diastolic {
            return Err(ValidationError::PulsePressure {
                systolic: bp_systolic,
                diastolic: bp_diastolic,
            });
        }

        let ahead = event_ts - ingest_ts;
        if ahead > self.clock_skew_tolerance {
            return Err(ValidationError::ClockSkew {
                event_ts,
                ingest_ts,
                ahead_ms: ahead.num_milliseconds(),
            });
        }
        let age = ingest_ts - event_ts;
        if age > self.max_event_age {
            return Err(ValidationError::TooLate {
                event_ts,
                age_ms: age.num_milliseconds(),
            });
        }

        Ok(VitalsEvent {
            event_ts,
            patient_id,
            heart_rate,
            temperature,
            bp_systolic,
            bp_diastolic,
            spo2,
            ingest_ts,
        })
    }
}

fn required<'a>(fields: &'a Map<String, Value>, name: &str) -> Result<&'a Value, ValidationError> {
    match fields.get(name) {
        None => Err(ValidationError::schema(name, "missing")),
        Some(Value::Null) => Err(ValidationError::schema(name, "null")),
        Some(value) => Ok(value),
    }
}

fn int_field(fields: &Map<String, Value>, name: &str) -> Result<i64, ValidationError> {
    let value = required(fields, name)?;
    value
        .as_i64()
        .ok_or_else(|| ValidationError::schema(name, format!("expected integer, got {}", json_type(value))))
}

fn float_field(fields: &Map<String, Value>, name: &str) -> Result<f64, ValidationError> {
    let value = required(fields, name)?;
    value
        .as_f64()
        .ok_or_else(|| ValidationError::schema(name, format!("expected number, got {}", json_type(value))))
}

fn timestamp_field(fields: &Map<String, Value>, name: &str) -> Result<DateTime<Utc>, ValidationError> {
    let value = required(fields, name)?;
    let text = value
        .as_str()
        .ok_or_else(|| ValidationError::schema(name, format!("expected timestamp string, got {}", json_type(value))))?;

    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| ValidationError::schema(name, format!("unparseable timestamp {:?}: {}", text, e)))
}

fn check_int(field: &'static str, value: i64, (min, max): (i64, i64)) -> Result<(), ValidationError> {
    if value < min || value > max {
        return Err(ValidationError::Range {
            field,
            value: value as f64,
            min: min as f64,
            max: max as f64,
        });
    }
    Ok(())
}

fn check_float(field: &'static str, value: f64, (min, max): (f64, f64)) -> Result<(), ValidationError> {
    if !(value >= min && value <= max) {
        return Err(ValidationError::Range { field, value, min, max });
    }
    Ok(())
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
