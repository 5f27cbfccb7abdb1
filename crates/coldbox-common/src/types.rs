//! ---
//! cbx_section: "01-core-runtime"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Shared ColdBox types: actuator ids, temperature readings, strategy kinds."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a thermoelectric actuator as configured at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActuatorId(pub u8);

impl ActuatorId {
    /// The cooler driven first by every strategy.
    pub const PRIMARY: ActuatorId = ActuatorId(1);
    /// The cooler that only absorbs demand the primary cannot cover.
    pub const SECONDARY: ActuatorId = ActuatorId(2);
}

impl fmt::Display for ActuatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "actuator-{}", self.0)
    }
}

/// Where a temperature sample came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingSource {
    Device,
    Synthetic,
}

/// A single temperature sample. Values are kept at one decimal of precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReading {
    value: f64,
    timestamp: DateTime<Utc>,
    source: ReadingSource,
}

impl TemperatureReading {
    pub fn new(value: f64, timestamp: DateTime<Utc>, source: ReadingSource) -> Self {
        Self {
            value: round_tenth(value),
            timestamp,
            source,
        }
    }

    /// Reading produced by the PLC at the current wall-clock time.
    pub fn device(value: f64) -> Self {
        Self::new(value, Utc::now(), ReadingSource::Device)
    }

    /// Reading produced by the simulated feed at the current wall-clock time.
    pub fn synthetic(value: f64) -> Self {
        Self::new(value, Utc::now(), ReadingSource::Synthetic)
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source(&self) -> ReadingSource {
        self.source
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self.source, ReadingSource::Synthetic)
    }
}

/// Round to one decimal place, matching the thermocouple's resolution.
pub fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Control strategies the loop can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    Hysteresis,
    #[default]
    PidCascade,
    RbfAdaptive,
    NeuralMpc,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 4] = [
        StrategyKind::Hysteresis,
        StrategyKind::PidCascade,
        StrategyKind::RbfAdaptive,
        StrategyKind::NeuralMpc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Hysteresis => "hysteresis",
            StrategyKind::PidCascade => "pid-cascade",
            StrategyKind::RbfAdaptive => "rbf-adaptive",
            StrategyKind::NeuralMpc => "neural-mpc",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        StrategyKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("unknown control strategy: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readings_keep_one_decimal() {
        let reading = TemperatureReading::device(22.449);
        assert_eq!(reading.value(), 22.4);
        assert!(!reading.is_synthetic());
        assert!(TemperatureReading::synthetic(-3.04).is_synthetic());
    }

    #[test]
    fn strategy_kind_parses_kebab_and_snake_case() {
        assert_eq!(
            "rbf_adaptive".parse::<StrategyKind>().unwrap(),
            StrategyKind::RbfAdaptive
        );
        assert_eq!(
            "Neural-MPC".parse::<StrategyKind>().unwrap(),
            StrategyKind::NeuralMpc
        );
        assert!("fuzzy".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn reading_serializes_source_lowercase() {
        let reading = TemperatureReading::synthetic(4.0);
        let json = serde_json::to_value(&reading).unwrap();
        assert_eq!(json["source"], "synthetic");
        assert_eq!(json["value"], 4.0);
    }
}
