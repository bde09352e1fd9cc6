use serde::{Deserialize, Serialize};

use crate::observation::SourceState;

const KILOWATT_UNITS: [&str; 3] = ["kw", "kilowatt", "kilowatts"];
const WATT_UNITS: [&str; 3] = ["w", "watt", "watts"];
const ENERGY_UNITS: [&str; 3] = ["wh", "kwh", "mwh"];
const DEVICE_CLASS_ENERGY: &str = "energy";

/// Divisor that maps a power reading to kilowatts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum ConversionFactor {
    Kilowatts,
    Watts,
}

impl ConversionFactor {
    pub fn divisor(self) -> f64 {
        match self {
            Self::Kilowatts => 1.0,
            Self::Watts => 1000.0,
        }
    }
}

impl From<ConversionFactor> for u32 {
    fn from(value: ConversionFactor) -> Self {
        match value {
            ConversionFactor::Kilowatts => 1,
            ConversionFactor::Watts => 1000,
        }
    }
}

impl TryFrom<u32> for ConversionFactor {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Kilowatts),
            1000 => Ok(Self::Watts),
            other => Err(format!("unsupported conversion factor {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitResolution {
    Resolved {
        factor: ConversionFactor,
        /// The unit was missing or unrecognised and watts were assumed.
        defaulted: bool,
    },
    Unresolved,
}

/// Maps a free-text unit label to a conversion factor. Missing and unknown labels default to
/// watts, which is what sources that omit a unit almost always report.
pub fn factor_for_unit(unit: Option<&str>) -> (ConversionFactor, bool) {
    let normalized = unit.map(|u| u.trim().to_ascii_lowercase()).unwrap_or_default();
    if KILOWATT_UNITS.contains(&normalized.as_str()) {
        return (ConversionFactor::Kilowatts, false);
    }
    if WATT_UNITS.contains(&normalized.as_str()) {
        return (ConversionFactor::Watts, false);
    }
    (ConversionFactor::Watts, true)
}

/// Resolves the factor for a live source. Only a source with no readable state at all is
/// unresolved; a present source with a missing unit still resolves (defaulted).
pub fn resolve(source: Option<&SourceState>) -> UnitResolution {
    let Some(source) = source else {
        return UnitResolution::Unresolved;
    };
    if !source.is_available() {
        return UnitResolution::Unresolved;
    }
    let (factor, defaulted) = factor_for_unit(source.unit());
    UnitResolution::Resolved { factor, defaulted }
}

/// True when the configured "power" source actually reports energy. Integrating it would feed
/// an energy total back into itself.
pub fn reports_energy(source: &SourceState) -> bool {
    let unit_is_energy = source
        .unit()
        .map(|u| ENERGY_UNITS.contains(&u.to_ascii_lowercase().as_str()))
        .unwrap_or(false);
    let class_is_energy = source
        .device_class
        .as_deref()
        .map(|c| c.trim().eq_ignore_ascii_case(DEVICE_CLASS_ENERGY))
        .unwrap_or(false);
    unit_is_energy || class_is_energy
}
