mod energy;
mod period;

#[cfg(test)]
mod tests;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::reset::ResetKind;
use crate::units::ConversionFactor;

pub use energy::{EnergyMeter, PushOutcome};
pub use period::{period_delta, PeriodMeter, PeriodUpdate};

const SOURCE_PREFIX: &str = "sensor.";
const POWER_SUFFIX: &str = "_power";
const ENERGY_SUFFIX: &str = "energy";
const DEFAULT_STATISTICAL_WINDOW_MINUTES: i64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccumulatorKind {
    Energy,
    DailyEnergy,
    MonthlyEnergy,
}

impl AccumulatorKind {
    pub fn key_suffix(self) -> &'static str {
        match self {
            Self::Energy => ENERGY_SUFFIX,
            Self::DailyEnergy => ResetKind::Daily.key_suffix(),
            Self::MonthlyEnergy => ResetKind::Monthly.key_suffix(),
        }
    }
}

impl From<ResetKind> for AccumulatorKind {
    fn from(kind: ResetKind) -> Self {
        match kind {
            ResetKind::Daily => Self::DailyEnergy,
            ResetKind::Monthly => Self::MonthlyEnergy,
        }
    }
}

/// `sensor.kettle_power` -> `kettle`.
pub fn base_name(source_id: &str) -> String {
    let trimmed = source_id.trim();
    let without_prefix = trimmed.strip_prefix(SOURCE_PREFIX).unwrap_or(trimmed);
    without_prefix
        .strip_suffix(POWER_SUFFIX)
        .unwrap_or(without_prefix)
        .to_string()
}

pub fn accumulator_key(base: &str, kind: AccumulatorKind) -> String {
    format!("{base}_{}", kind.key_suffix())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Statistical,
    PointSampling,
}

/// Why a tick or push left an accumulator untouched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SkipReason {
    #[error("source has no readable state")]
    SourceUnavailable,
    #[error("source state {0:?} is not a non-negative number")]
    InvalidObservation(String),
    #[error("observation is older than the last tracked one")]
    StaleObservation,
    #[error("conversion factor not resolved yet")]
    UnresolvedUnit,
    #[error("source reports energy (unit {unit:?}, device class {device_class:?}), not power")]
    MisconfiguredSource {
        unit: Option<String>,
        device_class: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Another tick or push held the accumulator.
    Busy,
    Skipped(SkipReason),
    Seeded,
    Applied { method: Method, kwh: f64 },
    /// No method was permitted to run this tick.
    NoComputation,
}

/// Integration policy for power-derived accumulators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterSettings {
    pub use_statistical: bool,
    pub allow_point_sampling_fallback: bool,
    pub enable_point_sampling_backup: bool,
    pub max_plausible_power_watts: f64,
    pub statistical_window: ChronoDuration,
}

impl MeterSettings {
    /// Point sampling runs when it is the only method, or when the options allow it after a
    /// statistical miss.
    pub fn point_sampling_permitted(&self) -> bool {
        !self.use_statistical
            || self.allow_point_sampling_fallback
            || self.enable_point_sampling_backup
    }
}

impl Default for MeterSettings {
    fn default() -> Self {
        Self {
            use_statistical: true,
            allow_point_sampling_fallback: true,
            enable_point_sampling_backup: false,
            max_plausible_power_watts: 3000.0,
            statistical_window: ChronoDuration::minutes(DEFAULT_STATISTICAL_WINDOW_MINUTES),
        }
    }
}

/// Point-in-time view of one accumulator for the list and diagnose endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct AccumulatorSnapshot {
    pub key: String,
    pub kind: AccumulatorKind,
    pub source_id: String,
    pub value: f64,
    /// Source units for power accumulators, kWh for derived ones.
    pub last_observed: Option<f64>,
    pub last_update: Option<DateTime<Utc>>,
    pub last_reset: Option<DateTime<Utc>>,
    pub conversion_factor: Option<ConversionFactor>,
    pub source_unit: Option<String>,
    pub last_calculation: Option<DateTime<Utc>>,
    pub calculation_count: u64,
    pub last_method: Option<Method>,
    pub last_skip_reason: Option<String>,
}
