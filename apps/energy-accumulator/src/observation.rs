use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const STATE_UNKNOWN: &str = "unknown";
const STATE_UNAVAILABLE: &str = "unavailable";

/// A single (value, timestamp) reading, either pushed live or read back from history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Observation {
    pub fn new(value: f64, timestamp: DateTime<Utc>) -> Self {
        Self { value, timestamp }
    }
}

/// Latest state of a source entity as reported by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceState {
    #[serde(alias = "entity_id")]
    pub source_id: String,
    pub state: String,
    #[serde(default, alias = "unit_of_measurement")]
    pub unit: Option<String>,
    #[serde(default)]
    pub device_class: Option<String>,
    #[serde(alias = "last_updated")]
    pub updated_at: DateTime<Utc>,
}

impl SourceState {
    /// False when the host flags the entity as unknown/unavailable.
    pub fn is_available(&self) -> bool {
        let state = self.state.trim();
        !(state.eq_ignore_ascii_case(STATE_UNKNOWN) || state.eq_ignore_ascii_case(STATE_UNAVAILABLE))
    }

    /// Numeric reading stamped with the host's update time, or `None` when the state is not a
    /// usable power/energy value.
    pub fn observation(&self) -> Option<Observation> {
        if !self.is_available() {
            return None;
        }
        parse_reading(&self.state).map(|value| Observation::new(value, self.updated_at))
    }

    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref().map(str::trim).filter(|v| !v.is_empty())
    }
}

/// Parses a raw state string into a non-negative finite reading.
pub fn parse_reading(raw: &str) -> Option<f64> {
    let value = raw.trim().parse::<f64>().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some(value)
}
