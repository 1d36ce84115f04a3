//! Synthetic patient vitals generator with fault injection
//!
//! Produces the same payload shape the pipeline consumes, plus an `_is_error`
//! flag marking records that had a fault injected.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{json, Map, Value};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Fields a fault may remove or null out
pub const REQUIRED_FIELDS: [&str; 7] = [
    "patient_id",
    "event_ts",
    "heart_rate",
    "temperature",
    "bp_systolic",
    "bp_diastolic",
    "spo2",
];

#[derive(Debug, Error, PartialEq)]
pub enum SimulatorConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },

    #[error("{0}")]
    OutOfRange(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorMode {
    /// Pick one of the concrete faults at random each time
    Mixed,
    None,
    MissingField,
    NullField,
    /// heart_rate = -1
    NegativeValue,
    /// spo2 = 150
    OutOfRange,
    /// bp_systolic = "one-sixty"
    BadType,
}

impl ErrorMode {
    const CONCRETE: [ErrorMode; 5] = [
        ErrorMode::MissingField,
        ErrorMode::NullField,
        ErrorMode::NegativeValue,
        ErrorMode::OutOfRange,
        ErrorMode::BadType,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorMode::Mixed => "mixed",
            ErrorMode::None => "none",
            ErrorMode::MissingField => "missing_field",
            ErrorMode::NullField => "null_field",
            ErrorMode::NegativeValue => "negative_value",
            ErrorMode::OutOfRange => "out_of_range",
            ErrorMode::BadType => "bad_type",
        }
    }
}

impl FromStr for ErrorMode {
    type Err = SimulatorConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mixed" => Ok(ErrorMode::Mixed),
            "none" => Ok(ErrorMode::None),
            "missing_field" => Ok(ErrorMode::MissingField),
            "null_field" => Ok(ErrorMode::NullField),
            "negative_value" => Ok(ErrorMode::NegativeValue),
            "out_of_range" => Ok(ErrorMode::OutOfRange),
            "bad_type" => Ok(ErrorMode::BadType),
            _ => Err(SimulatorConfigError::Invalid {
                var: "ERROR_MODE",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for ErrorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How `missing_field` faults drop a field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingFieldStyle {
    Delete,
    Null,
}

impl FromStr for MissingFieldStyle {
    type Err = SimulatorConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "delete" => Ok(MissingFieldStyle::Delete),
            "null" => Ok(MissingFieldStyle::Null),
            _ => Err(SimulatorConfigError::Invalid {
                var: "MISSING_FIELD_STYLE",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorConfig {
    pub patient_count: u32,
    pub stream_interval: Duration,
    /// Probability in [0, 1] that a record gets a fault
    pub error_rate: f64,
    pub error_mode: ErrorMode,
    pub missing_field_style: MissingFieldStyle,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            patient_count: 30,
            stream_interval: Duration::from_secs(1),
            error_rate: 0.1,
            error_mode: ErrorMode::Mixed,
            missing_field_style: MissingFieldStyle::Delete,
        }
    }
}

impl SimulatorConfig {
    /// Environment variables:
    /// - `PATIENT_COUNT` (default: 30)
    /// - `STREAM_INTERVAL` seconds, fractional allowed (default: 1)
    /// - `ERROR_RATE` (default: 0.1)
    /// - `ERROR_MODE` mixed|none|missing_field|null_field|negative_value|out_of_range|bad_type (default: mixed)
    /// - `MISSING_FIELD_STYLE` delete|null (default: delete)
    pub fn from_env() -> Result<Self, SimulatorConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, SimulatorConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        // Empty values fall back to defaults
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let patient_count = match get("PATIENT_COUNT") {
            Some(v) => v.trim().parse::<u32>().map_err(|_| SimulatorConfigError::Invalid {
                var: "PATIENT_COUNT",
                value: v.clone(),
            })?,
            None => d.patient_count,
        };
        let interval_secs = match get("STREAM_INTERVAL") {
            Some(v) => v.trim().parse::<f64>().map_err(|_| SimulatorConfigError::Invalid {
                var: "STREAM_INTERVAL",
                value: v.clone(),
            })?,
            None => d.stream_interval.as_secs_f64(),
        };
        let error_rate = match get("ERROR_RATE") {
            Some(v) => v.trim().parse::<f64>().map_err(|_| SimulatorConfigError::Invalid {
                var: "ERROR_RATE",
                value: v.clone(),
            })?,
            None => d.error_rate,
        };
        let error_mode = match get("ERROR_MODE") {
            Some(v) => v.parse()?,
            None => d.error_mode,
        };
        let missing_field_style = match get("MISSING_FIELD_STYLE") {
            Some(v) => v.parse()?,
            None => d.missing_field_style,
        };

        if !(interval_secs.is_finite() && interval_secs > 0.0) {
            return Err(SimulatorConfigError::OutOfRange("STREAM_INTERVAL must be > 0"));
        }

        let config = Self {
            patient_count,
            stream_interval: Duration::from_secs_f64(interval_secs),
            error_rate,
            error_mode,
            missing_field_style,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SimulatorConfigError> {
        if self.patient_count == 0 {
            return Err(SimulatorConfigError::OutOfRange("PATIENT_COUNT must be > 0"));
        }
        if self.stream_interval.is_zero() {
            return Err(SimulatorConfigError::OutOfRange("STREAM_INTERVAL must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.error_rate) {
            return Err(SimulatorConfigError::OutOfRange("ERROR_RATE must be between 0.0 and 1.0"));
        }
        Ok(())
    }
}

pub struct VitalsSimulator<R: Rng> {
    config: SimulatorConfig,
    rng: R,
}

impl<R: Rng> VitalsSimulator<R> {
    pub fn new(config: SimulatorConfig, rng: R) -> Self {
        Self { config, rng }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Vitals for a random patient, possibly with a fault, flagged `_is_error`
    pub fn next_payload(&mut self, now: DateTime<Utc>) -> Value {
        let patient_id = self.rng.gen_range(1..=self.config.patient_count) as i64;
        let mut record = self.gen_vitals(patient_id, now);

        let is_error = self.rng.gen::<f64>() < self.config.error_rate && self.config.error_mode != ErrorMode::None;
        if is_error {
            self.inject_error(&mut record);
        }
        record.insert("_is_error".to_string(), Value::Bool(is_error));

        Value::Object(record)
    }

    /// Plausible ranges, not clinical reference values
    pub fn gen_vitals(&mut self, patient_id: i64, now: DateTime<Utc>) -> Map<String, Value> {
        let temperature = (self.rng.gen_range(96.5..=102.5_f64) * 10.0).round() / 10.0;
        let record = json!({
            "event_ts": now.to_rfc3339(),
            "patient_id": patient_id,
            "heart_rate": self.rng.gen_range(55..=130),
            "temperature": temperature,
            "bp_systolic": self.rng.gen_range(90..=160),
            "bp_diastolic": self.rng.gen_range(55..=110),
            "spo2": self.rng.gen_range(88..=100),
        });

        match record {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    pub fn inject_error(&mut self, record: &mut Map<String, Value>) {
        let mode = match self.config.error_mode {
            ErrorMode::None => return,
            ErrorMode::Mixed => *ErrorMode::CONCRETE
                .choose(&mut self.rng)
                .unwrap_or(&ErrorMode::OutOfRange),
            mode => mode,
        };

        match mode {
            ErrorMode::MissingField => {
                let field = self.random_field();
                match self.config.missing_field_style {
                    MissingFieldStyle::Delete => {
                        record.remove(field);
                    }
                    MissingFieldStyle::Null => {
                        record.insert(field.to_string(), Value::Null);
                    }
                }
            }
            ErrorMode::NullField => {
                let field = self.random_field();
                record.insert(field.to_string(), Value::Null);
            }
            ErrorMode::NegativeValue => {
                record.insert("heart_rate".to_string(), json!(-1));
            }
            ErrorMode::OutOfRange => {
                record.insert("spo2".to_string(), json!(150));
            }
            ErrorMode::BadType => {
                record.insert("bp_systolic".to_string(), json!("one-sixty"));
            }
            ErrorMode::Mixed | ErrorMode::None => {}
        }
    }

    fn random_field(&mut self) -> &'static str {
        REQUIRED_FIELDS.choose(&mut self.rng).copied().unwrap_or("spo2")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::DeadLetterReason;
    use crate::pipeline::validator::{ValidationError, Validator};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    fn simulator(error_rate: f64, error_mode: ErrorMode) -> VitalsSimulator<StdRng> {
        let config = SimulatorConfig {
            error_rate,
            error_mode,
            ..SimulatorConfig::default()
        };
        VitalsSimulator::new(config, StdRng::seed_from_u64(42))
    }

    fn validator() -> Validator {
        Validator::new(chrono::Duration::minutes(5), chrono::Duration::seconds(100))
    }

    fn validate(payload: &Value, now: DateTime<Utc>) -> Result<(), ValidationError> {
        let bytes = serde_json::to_vec(payload).unwrap();
        validator().validate(&bytes, now).map(|_| ())
    }

    #[test]
    fn test_clean_payloads_pass_schema() {
        let mut sim = simulator(0.0, ErrorMode::Mixed);
        let now = Utc::now();

        for _ in 0..200 {
            let payload = sim.next_payload(now);
            assert_eq!(payload["_is_error"], false);
            let id = payload["patient_id"].as_i64().unwrap();
            assert!((1..=30).contains(&id));

            // Random systolic/diastolic can overlap; everything else is in range
            match validate(&payload, now) {
                Ok(()) | Err(ValidationError::PulsePressure { .. }) => {}
                Err(e) => panic!("unexpected rejection {:?} for {}", e, payload),
            }
        }
    }

    #[test]
    fn test_every_injected_fault_is_rejected() {
        let now = Utc::now();
        for mode in ErrorMode::CONCRETE {
            let mut sim = simulator(1.0, mode);
            for _ in 0..50 {
                let payload = sim.next_payload(now);
                assert_eq!(payload["_is_error"], true);
                assert!(validate(&payload, now).is_err(), "{} payload accepted: {}", mode, payload);
            }
        }
    }

    #[test]
    fn test_fault_reasons() {
        let now = Utc::now();
        let expected = [
            (ErrorMode::NegativeValue, DeadLetterReason::RangeError),
            (ErrorMode::OutOfRange, DeadLetterReason::RangeError),
            (ErrorMode::BadType, DeadLetterReason::SchemaError),
            (ErrorMode::NullField, DeadLetterReason::SchemaError),
            (ErrorMode::MissingField, DeadLetterReason::SchemaError),
        ];
        for (mode, reason) in expected {
            let mut sim = simulator(1.0, mode);
            let payload = sim.next_payload(now);
            assert_eq!(validate(&payload, now).unwrap_err().reason(), reason, "mode {}", mode);
        }
    }

    #[test]
    fn test_error_rate_roughly_honored() {
        let mut sim = simulator(0.1, ErrorMode::Mixed);
        let now = Utc::now();
        let errors = (0..2000)
            .filter(|_| sim.next_payload(now)["_is_error"] == true)
            .count();
        assert!((100..=300).contains(&errors), "errors = {}", errors);
    }

    #[test]
    fn test_none_mode_never_flags() {
        let mut sim = simulator(1.0, ErrorMode::None);
        assert_eq!(sim.next_payload(Utc::now())["_is_error"], false);
    }

    #[test]
    fn test_missing_field_styles() {
        let mut sim = simulator(1.0, ErrorMode::MissingField);
        let mut record = sim.gen_vitals(1, Utc::now());
        sim.inject_error(&mut record);
        assert_eq!(record.len(), REQUIRED_FIELDS.len() - 1);

        sim.config.missing_field_style = MissingFieldStyle::Null;
        let mut record = sim.gen_vitals(1, Utc::now());
        sim.inject_error(&mut record);
        assert_eq!(record.len(), REQUIRED_FIELDS.len());
        assert_eq!(record.values().filter(|v| v.is_null()).count(), 1);
    }

    #[test]
    fn test_same_seed_same_stream() {
        let now = Utc::now();
        let mut a = simulator(0.5, ErrorMode::Mixed);
        let mut b = simulator(0.5, ErrorMode::Mixed);
        for _ in 0..20 {
            assert_eq!(a.next_payload(now), b.next_payload(now));
        }
    }

    #[test]
    fn test_config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("PATIENT_COUNT", "5"),
            ("STREAM_INTERVAL", "0.25"),
            ("ERROR_MODE", "OUT_OF_RANGE"),
            ("MISSING_FIELD_STYLE", "null"),
            ("ERROR_RATE", ""),
        ]
        .into_iter()
        .collect();
        let config = SimulatorConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.patient_count, 5);
        assert_eq!(config.stream_interval, Duration::from_millis(250));
        assert_eq!(config.error_mode, ErrorMode::OutOfRange);
        assert_eq!(config.missing_field_style, MissingFieldStyle::Null);
        assert_eq!(config.error_rate, 0.1);
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let bad = |key: &'static str, value: &'static str| {
            SimulatorConfig::from_lookup(move |k| (k == key).then(|| value.to_string())).unwrap_err()
        };
        assert!(matches!(bad("PATIENT_COUNT", "0"), SimulatorConfigError::OutOfRange(_)));
        assert!(matches!(bad("PATIENT_COUNT", "many"), SimulatorConfigError::Invalid { .. }));
        assert!(matches!(bad("STREAM_INTERVAL", "0"), SimulatorConfigError::OutOfRange(_)));
        assert!(matches!(bad("ERROR_RATE", "1.5"), SimulatorConfigError::OutOfRange(_)));
        assert!(matches!(bad("ERROR_MODE", "chaos"), SimulatorConfigError::Invalid { .. }));
        assert!(matches!(bad("MISSING_FIELD_STYLE", "drop"), SimulatorConfigError::Invalid { .. }));
    }
}
