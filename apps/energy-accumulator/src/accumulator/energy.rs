use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

use super::{
    accumulator_key, base_name, AccumulatorKind, AccumulatorSnapshot, MeterSettings, Method,
    SkipReason, TickOutcome,
};
use crate::integrate::{
    plausibility_ceiling_kwh, point_sample_kwh, HistoricalIntegrator, HistoryUnavailable,
};
use crate::observation::{parse_reading, Observation, SourceState};
use crate::sources::LiveStateSource;
use crate::store::{AccumulatorRecord, AccumulatorStore};
use crate::units::{self, ConversionFactor, UnitResolution};

#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    Seeded,
    Refreshed,
    Ignored(SkipReason),
}

#[derive(Debug, Default)]
pub(super) struct MeterState {
    total: f64,
    last: Option<Observation>,
    factor: Option<ConversionFactor>,
    source_unit: Option<String>,
    last_calculation: Option<DateTime<Utc>>,
    calculation_count: u64,
    last_method: Option<Method>,
    last_skip: Option<SkipReason>,
}

impl MeterState {
    fn from_record(record: AccumulatorRecord) -> Self {
        let last = match (record.last_power, record.last_update) {
            (Some(value), Some(ts)) if value.is_finite() && value >= 0.0 => {
                Some(Observation::new(value, ts))
            }
            _ => None,
        };
        let total = if record.value.is_finite() && record.value >= 0.0 {
            record.value
        } else {
            0.0
        };
        Self {
            total,
            last,
            factor: record.conversion_factor,
            source_unit: record.source_unit,
            last_calculation: record.last_calculation,
            ..Self::default()
        }
    }

    fn to_record(&self) -> AccumulatorRecord {
        AccumulatorRecord {
            value: self.total,
            last_power: self.last.map(|o| o.value),
            last_update: self.last.map(|o| o.timestamp),
            conversion_factor: self.factor,
            source_unit: self.source_unit.clone(),
            last_calculation: self.last_calculation,
            ..AccumulatorRecord::default()
        }
    }

    /// Cached factor while the unit label is unchanged, otherwise re-derived from `current`.
    fn resolve_factor(&mut self, key: &str, current: &SourceState) -> Option<ConversionFactor> {
        let unit = current.unit().map(str::to_string);
        if let Some(factor) = self.factor {
            if self.source_unit == unit {
                return Some(factor);
            }
        }
        match units::resolve(Some(current)) {
            UnitResolution::Resolved { factor, defaulted } => {
                if defaulted {
                    tracing::warn!(key, unit = ?unit, "unrecognised power unit; assuming watts");
                }
                if self.factor.is_some_and(|previous| previous != factor) {
                    tracing::info!(key, unit = ?unit, "source unit changed; conversion factor updated");
                }
                self.factor = Some(factor);
                self.source_unit = unit;
                Some(factor)
            }
            UnitResolution::Unresolved => None,
        }
    }
}

/// Running kWh total integrated from one power source.
pub struct EnergyMeter {
    key: String,
    source_id: String,
    settings: MeterSettings,
    live: Arc<dyn LiveStateSource>,
    historical: HistoricalIntegrator,
    store: AccumulatorStore,
    pub(super) state: Mutex<MeterState>,
    total_tx: watch::Sender<f64>,
}

impl EnergyMeter {
    /// Loads the persisted record for `source_id`, creating it when absent.
    pub async fn attach(
        source_id: &str,
        settings: MeterSettings,
        live: Arc<dyn LiveStateSource>,
        historical: HistoricalIntegrator,
        store: AccumulatorStore,
    ) -> Self {
        let key = accumulator_key(&base_name(source_id), AccumulatorKind::Energy);
        let record = store.load(&key).await;
        let created = record.is_none();
        let state = record.map(MeterState::from_record).unwrap_or_default();
        let (total_tx, _) = watch::channel(state.total);

        let meter = Self {
            key,
            source_id: source_id.to_string(),
            settings,
            live,
            historical,
            store,
            state: Mutex::new(state),
            total_tx,
        };
        if created {
            let state = meter.state.lock().await;
            meter.persist(&state).await;
        }
        tracing::info!(key = %meter.key, source_id, total_kwh = meter.total(), "energy accumulator attached");
        meter
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn total(&self) -> f64 {
        *self.total_tx.borrow()
    }

    /// Follows the total after every applied integration or correction.
    pub fn subscribe_total(&self) -> watch::Receiver<f64> {
        self.total_tx.subscribe()
    }

    /// A live update refreshes the tracked observation; only ticks integrate.
    pub async fn on_push(&self, source: &SourceState) -> PushOutcome {
        let mut state = self.state.lock().await;
        if units::reports_energy(source) {
            let reason = misconfigured(source);
            state.last_skip = Some(reason.clone());
            return PushOutcome::Ignored(reason);
        }
        let Some(obs) = source.observation() else {
            return PushOutcome::Ignored(SkipReason::InvalidObservation(source.state.clone()));
        };
        if state.last.is_some_and(|last| obs.timestamp < last.timestamp) {
            return PushOutcome::Ignored(SkipReason::StaleObservation);
        }

        let outcome = if state.last.is_none() {
            PushOutcome::Seeded
        } else {
            PushOutcome::Refreshed
        };
        state.last = Some(obs);
        self.persist(&state).await;
        tracing::debug!(key = %self.key, value = obs.value, ?outcome, "push");
        outcome
    }

    /// One integration step at `now`. Returns immediately with `Busy` if another step or a
    /// push holds the accumulator.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickOutcome {
        let Ok(mut state) = self.state.try_lock() else {
            tracing::debug!(key = %self.key, "tick skipped; accumulator busy");
            return TickOutcome::Busy;
        };
        let outcome = self.tick_locked(&mut state, now).await;
        match &outcome {
            TickOutcome::Skipped(reason) => state.last_skip = Some(reason.clone()),
            TickOutcome::Seeded | TickOutcome::Applied { .. } => state.last_skip = None,
            TickOutcome::Busy | TickOutcome::NoComputation => {}
        }
        tracing::debug!(key = %self.key, ?outcome, total_kwh = state.total, "tick");
        outcome
    }

    async fn tick_locked(&self, state: &mut MeterState, now: DateTime<Utc>) -> TickOutcome {
        let current = self
            .live
            .current_state(&self.source_id)
            .await
            .filter(SourceState::is_available);
        let Some(current) = current else {
            return TickOutcome::Skipped(if state.factor.is_some() {
                SkipReason::SourceUnavailable
            } else {
                SkipReason::UnresolvedUnit
            });
        };
        if units::reports_energy(&current) {
            let reason = misconfigured(&current);
            if state.last_skip.as_ref() != Some(&reason) {
                tracing::warn!(key = %self.key, source_id = %self.source_id, %reason, "refusing to integrate");
            }
            return TickOutcome::Skipped(reason);
        }
        let Some(factor) = state.resolve_factor(&self.key, &current) else {
            return TickOutcome::Skipped(SkipReason::UnresolvedUnit);
        };
        let Some(value) = parse_reading(&current.state) else {
            return TickOutcome::Skipped(SkipReason::InvalidObservation(current.state.clone()));
        };
        let reading = Observation::new(value, now);

        let Some(last) = state.last else {
            state.last = Some(reading);
            self.persist(state).await;
            return TickOutcome::Seeded;
        };

        if self.settings.use_statistical && self.historical.is_available() {
            let start = state
                .last_calculation
                .filter(|cursor| *cursor < now)
                .unwrap_or(now - self.settings.statistical_window);
            match self
                .historical
                .integrate(&self.source_id, start, now, factor)
                .await
            {
                Ok(kwh) if kwh > 0.0 => {
                    let ceiling =
                        plausibility_ceiling_kwh(self.settings.max_plausible_power_watts, start, now);
                    if kwh <= ceiling {
                        return self.apply(state, Method::Statistical, kwh, reading).await;
                    }
                    tracing::warn!(
                        key = %self.key,
                        kwh,
                        ceiling_kwh = ceiling,
                        "rejecting implausible statistical result"
                    );
                }
                Ok(_) => {
                    tracing::debug!(key = %self.key, "statistical window holds no energy");
                }
                // The window will cover this interval once it is long enough.
                Err(HistoryUnavailable::WindowTooShort { seconds })
                    if state.last_calculation.is_some() =>
                {
                    tracing::debug!(key = %self.key, seconds, "statistical window too short; deferring");
                    return TickOutcome::NoComputation;
                }
                Err(reason) => {
                    tracing::debug!(key = %self.key, %reason, "statistical integration unavailable");
                }
            }
        }

        if self.settings.point_sampling_permitted() {
            let kwh = point_sample_kwh(&last, &reading, factor);
            return self.apply(state, Method::PointSampling, kwh, reading).await;
        }
        TickOutcome::NoComputation
    }

    async fn apply(
        &self,
        state: &mut MeterState,
        method: Method,
        kwh: f64,
        reading: Observation,
    ) -> TickOutcome {
        let kwh = kwh.max(0.0);
        state.total += kwh;
        state.last = Some(reading);
        state.last_calculation = Some(reading.timestamp);
        state.calculation_count += 1;
        state.last_method = Some(method);
        self.persist(state).await;
        self.total_tx.send_replace(state.total);
        TickOutcome::Applied { method, kwh }
    }

    /// Multiplies the total by `factor` and persists. Returns the previous and new totals.
    pub async fn scale(&self, factor: f64) -> (f64, f64) {
        let mut state = self.state.lock().await;
        let previous = state.total;
        state.total = (previous * factor).max(0.0);
        self.persist(&state).await;
        self.total_tx.send_replace(state.total);
        (previous, state.total)
    }

    pub async fn snapshot(&self) -> AccumulatorSnapshot {
        let state = self.state.lock().await;
        AccumulatorSnapshot {
            key: self.key.clone(),
            kind: AccumulatorKind::Energy,
            source_id: self.source_id.clone(),
            value: state.total,
            last_observed: state.last.map(|o| o.value),
            last_update: state.last.map(|o| o.timestamp),
            last_reset: None,
            conversion_factor: state.factor,
            source_unit: state.source_unit.clone(),
            last_calculation: state.last_calculation,
            calculation_count: state.calculation_count,
            last_method: state.last_method,
            last_skip_reason: state.last_skip.as_ref().map(ToString::to_string),
        }
    }

    /// Final save on teardown.
    pub async fn flush(&self) {
        let state = self.state.lock().await;
        self.persist(&state).await;
    }

    async fn persist(&self, state: &MeterState) {
        if let Err(err) = self.store.save(&self.key, &state.to_record()).await {
            tracing::warn!(key = %self.key, error = %err, "failed to persist accumulator; keeping in-memory state");
        }
    }
}

fn misconfigured(source: &SourceState) -> SkipReason {
    SkipReason::MisconfiguredSource {
        unit: source.unit().map(str::to_string),
        device_class: source.device_class.clone(),
    }
}
