//! Risk classification from validated vitals
//!
//! Each vital is classified on its own against a fixed threshold table and the
//! event's level is the most severe of the five.

use super::types::VitalsEvent;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskLevel {
    Normal,
    Elevated,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Normal => "Normal",
            RiskLevel::Elevated => "Elevated",
            RiskLevel::Critical => "Critical",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Normal" => Some(RiskLevel::Normal),
            "Elevated" => Some(RiskLevel::Elevated),
            "Critical" => Some(RiskLevel::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive "normal" band; values outside it escalate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band<T> {
    pub low: T,
    pub high: T,
}

impl<T: PartialOrd + Copy> Band<T> {
    pub const fn new(low: T, high: T) -> Self {
        Self { low, high }
    }

    fn contains(&self, value: T) -> bool {
        value >= self.low && value <= self.high
    }
}

/// Threshold table for one vital: outside `critical` is Critical, outside
/// `elevated` is Elevated
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VitalThresholds<T> {
    pub critical: Band<T>,
    pub elevated: Band<T>,
}

impl<T: PartialOrd + Copy> VitalThresholds<T> {
    fn classify(&self, value: T) -> RiskLevel {
        if !self.critical.contains(value) {
            RiskLevel::Critical
        } else if !self.elevated.contains(value) {
            RiskLevel::Elevated
        } else {
            RiskLevel::Normal
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskThresholds {
    pub heart_rate: VitalThresholds<i64>,
    pub spo2: VitalThresholds<i64>,
    pub bp_systolic: VitalThresholds<i64>,
    pub bp_diastolic: VitalThresholds<i64>,
    pub temperature: TemperatureThresholds,
}

/// Temperature uses half-open bands: the fever cut-offs themselves escalate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureThresholds {
    pub critical_low: f64,
    pub elevated_low: f64,
    pub elevated_high: f64,
    pub critical_high: f64,
}

impl TemperatureThresholds {
    fn classify(&self, value: f64) -> RiskLevel {
        if value < self.critical_low || value >= self.critical_high {
            RiskLevel::Critical
        } else if value < self.elevated_low || value >= self.elevated_high {
            RiskLevel::Elevated
        } else {
            RiskLevel::Normal
        }
    }
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            heart_rate: VitalThresholds {
                critical: Band::new(40, 180),
                elevated: Band::new(50, 120),
            },
            // spo2 has no upper limit; 100 is the physical maximum
            spo2: VitalThresholds {
                critical: Band::new(90, 100),
                elevated: Band::new(95, 100),
            },
            bp_systolic: VitalThresholds {
                critical: Band::new(80, 180),
                elevated: Band::new(90, 140),
            },
            bp_diastolic: VitalThresholds {
                critical: Band::new(40, 120),
                elevated: Band::new(50, 90),
            },
            temperature: TemperatureThresholds {
                critical_low: 95.0,
                elevated_low: 96.8,
                elevated_high: 100.4,
                critical_high: 104.0,
            },
        }
    }
}

/// Deterministic risk scorer
#[derive(Debug, Clone, Default)]
pub struct RiskScorer {
    thresholds: RiskThresholds,
}

impl RiskScorer {
    pub fn new(thresholds: RiskThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &RiskThresholds {
        &self.thresholds
    }

    pub fn score(&self, event: &VitalsEvent) -> RiskLevel {
        let t = &self.thresholds;
        [
            t.heart_rate.classify(event.heart_rate),
            t.spo2.classify(event.spo2),
            t.bp_systolic.classify(event.bp_systolic),
            t.bp_diastolic.classify(event.bp_diastolic),
            t.temperature.classify(event.temperature),
        ]
        .into_iter()
        .max()
        .unwrap_or(RiskLevel::Normal)
    }
}
