//! Numeric integration of power observations into kWh.
//!
//! Two strategies exist. Point sampling applies the trapezoidal rule between the last tracked
//! observation and the current reading. The historical integrator replays every recorded
//! observation in a window as a left Riemann sum: power is held at the earlier sample until the
//! next one arrives, which matches how on/off and fixed-power loads behave. The history query
//! supplies the state in effect when the window opens, and the final sample is held until the
//! window closes, so consecutive windows tile without losing their edges.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use thiserror::Error;

use crate::observation::Observation;
use crate::sources::HistoryStore;
use crate::units::ConversionFactor;

const SECONDS_PER_HOUR: f64 = 3600.0;
const MIN_HISTORY_WINDOW_SECONDS: i64 = 2 * 60;
const MAX_SUB_INTERVAL_SECONDS: i64 = 6 * 60 * 60;
const MIN_HISTORY_SAMPLES: usize = 2;

/// Why the historical integrator produced no result. All of these are expected while a source
/// is new or sparsely updated.
#[derive(Debug, Error)]
pub enum HistoryUnavailable {
    #[error("no history backend configured")]
    NoBackend,
    #[error("window of {seconds}s is shorter than the 2 minute minimum")]
    WindowTooShort { seconds: i64 },
    #[error("only {count} valid samples in window")]
    TooFewSamples { count: usize },
    #[error("history query failed: {0:#}")]
    QueryFailed(anyhow::Error),
}

fn hours_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds() as f64 / 1000.0 / SECONDS_PER_HOUR
}

/// Trapezoidal energy between two observations. Never negative.
pub fn point_sample_kwh(prev: &Observation, curr: &Observation, factor: ConversionFactor) -> f64 {
    let hours = hours_between(prev.timestamp, curr.timestamp);
    let kwh = ((prev.value + curr.value) / 2.0) * hours / factor.divisor();
    if kwh.is_finite() && kwh > 0.0 {
        kwh
    } else {
        0.0
    }
}

/// Left Riemann sum over `observations` (sorted here). When several observations share a
/// timestamp the first one recorded holds until the next instant. Sub-intervals longer than six
/// hours are data gaps and contribute nothing.
pub fn left_riemann_kwh(observations: &[Observation], factor: ConversionFactor) -> f64 {
    let mut sorted: Vec<&Observation> = observations.iter().collect();
    sorted.sort_by_key(|o| o.timestamp);
    sorted.dedup_by_key(|o| o.timestamp);

    let mut kwh = 0.0;
    for pair in sorted.windows(2) {
        let (left, right) = (pair[0], pair[1]);
        let span = right.timestamp - left.timestamp;
        if span > ChronoDuration::seconds(MAX_SUB_INTERVAL_SECONDS) {
            continue;
        }
        kwh += left.value * hours_between(left.timestamp, right.timestamp) / factor.divisor();
    }
    kwh.max(0.0)
}

/// Largest energy a window can plausibly hold when drawing `max_power_watts` the whole time.
pub fn plausibility_ceiling_kwh(
    max_power_watts: f64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> f64 {
    max_power_watts / 1000.0 * hours_between(start, end).max(0.0)
}

#[derive(Clone)]
pub struct HistoricalIntegrator {
    history: Option<Arc<dyn HistoryStore>>,
}

impl HistoricalIntegrator {
    pub fn new(history: Option<Arc<dyn HistoryStore>>) -> Self {
        Self { history }
    }

    pub fn is_available(&self) -> bool {
        self.history.is_some()
    }

    pub async fn integrate(
        &self,
        source_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        factor: ConversionFactor,
    ) -> Result<f64, HistoryUnavailable> {
        let Some(history) = self.history.as_ref() else {
            return Err(HistoryUnavailable::NoBackend);
        };
        let seconds = (end - start).num_seconds();
        if seconds < MIN_HISTORY_WINDOW_SECONDS {
            return Err(HistoryUnavailable::WindowTooShort { seconds });
        }

        let mut observations: Vec<Observation> = history
            .query(source_id, start, end)
            .await
            .map_err(HistoryUnavailable::QueryFailed)?
            .into_iter()
            .filter(|o| o.value.is_finite() && o.value >= 0.0)
            .collect();
        if observations.len() < MIN_HISTORY_SAMPLES {
            return Err(HistoryUnavailable::TooFewSamples {
                count: observations.len(),
            });
        }

        hold_until(&mut observations, end);
        Ok(left_riemann_kwh(&observations, factor))
    }
}

/// Extends the value in effect after the final sample up to `end`, so the tail of the window is
/// counted now rather than dropped when the cursor moves past it.
fn hold_until(observations: &mut Vec<Observation>, end: DateTime<Utc>) {
    observations.sort_by_key(|o| o.timestamp);
    let Some(last_instant) = observations.last().map(|o| o.timestamp) else {
        return;
    };
    if last_instant >= end {
        return;
    }
    if let Some(held) = observations.iter().find(|o| o.timestamp == last_instant).copied() {
        observations.push(Observation::new(held.value, end));
    }
}
