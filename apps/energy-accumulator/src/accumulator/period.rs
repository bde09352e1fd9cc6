use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{accumulator_key, AccumulatorKind, AccumulatorSnapshot};
use crate::reset::ResetPolicy;
use crate::store::{AccumulatorRecord, AccumulatorStore};

/// Energy added by a parent total moving from `last` to `new`. `None` means there was nothing
/// to compare against and `new` only seeds the tracker.
pub fn period_delta(last: Option<f64>, new: f64) -> Option<f64> {
    last.map(|last| (new - last).max(0.0))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PeriodUpdate {
    Seeded,
    Added(f64),
    Ignored,
}

#[derive(Debug)]
pub(super) struct PeriodState {
    total: f64,
    last_energy: Option<f64>,
    last_update: Option<DateTime<Utc>>,
    last_reset: DateTime<Utc>,
    updates: u64,
}

impl PeriodState {
    fn to_record(&self) -> AccumulatorRecord {
        AccumulatorRecord {
            value: self.total,
            last_energy: self.last_energy,
            last_update: self.last_update,
            last_reset: Some(self.last_reset),
            ..AccumulatorRecord::default()
        }
    }
}

/// Daily or monthly total that follows an energy accumulator and restarts at each local
/// boundary of its [`ResetPolicy`].
pub struct PeriodMeter {
    key: String,
    source_id: String,
    policy: ResetPolicy,
    store: AccumulatorStore,
    pub(super) state: Mutex<PeriodState>,
}

impl PeriodMeter {
    /// Loads (or creates) the record and applies any boundary crossed while detached.
    pub async fn attach(
        base: &str,
        source_id: &str,
        policy: ResetPolicy,
        store: AccumulatorStore,
        parent_total: Option<f64>,
        now: DateTime<Utc>,
    ) -> Self {
        let key = accumulator_key(base, AccumulatorKind::from(policy.kind));
        let record = store.load(&key).await;
        let needs_save = record.as_ref().map_or(true, |r| r.last_reset.is_none());
        let record = record.unwrap_or_default();
        let state = PeriodState {
            total: if record.value.is_finite() { record.value.max(0.0) } else { 0.0 },
            last_energy: record.last_energy.filter(|v| v.is_finite() && *v >= 0.0),
            last_update: record.last_update,
            last_reset: record.last_reset.unwrap_or(now),
            updates: 0,
        };

        let meter = Self {
            key,
            source_id: source_id.to_string(),
            policy,
            store,
            state: Mutex::new(state),
        };
        let reset = meter.check_reset(now, parent_total).await;
        if needs_save && !reset {
            meter.flush().await;
        }
        meter
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn total(&self) -> f64 {
        self.state.lock().await.total
    }

    /// Folds a new parent total into this period.
    pub async fn on_parent_total(&self, value: f64, now: DateTime<Utc>) -> PeriodUpdate {
        if !value.is_finite() || value < 0.0 {
            return PeriodUpdate::Ignored;
        }
        let mut state = self.state.lock().await;
        if self.policy.should_reset(now, state.last_reset) {
            let tracked = state.last_energy;
            self.reset_locked(&mut state, now, tracked);
        }

        let update = match period_delta(state.last_energy, value) {
            None => PeriodUpdate::Seeded,
            Some(delta) => {
                state.total += delta;
                state.updates += 1;
                PeriodUpdate::Added(delta)
            }
        };
        state.last_energy = Some(value);
        state.last_update = Some(now);
        self.persist(&state).await;
        update
    }

    /// Zeroes the period when `now` is past its boundary. `parent_total` becomes the new
    /// tracking point.
    pub async fn check_reset(&self, now: DateTime<Utc>, parent_total: Option<f64>) -> bool {
        let mut state = self.state.lock().await;
        if !self.policy.should_reset(now, state.last_reset) {
            return false;
        }
        let tracked = parent_total.or(state.last_energy);
        self.reset_locked(&mut state, now, tracked);
        self.persist(&state).await;
        true
    }

    fn reset_locked(&self, state: &mut PeriodState, now: DateTime<Utc>, parent_total: Option<f64>) {
        tracing::info!(
            key = %self.key,
            previous_kwh = state.total,
            last_reset = %state.last_reset,
            "period boundary crossed; resetting"
        );
        state.total = 0.0;
        state.last_energy = parent_total;
        state.last_reset = now;
    }

    pub async fn scale(&self, factor: f64) -> (f64, f64) {
        let mut state = self.state.lock().await;
        let previous = state.total;
        state.total = (previous * factor).max(0.0);
        self.persist(&state).await;
        (previous, state.total)
    }

    pub async fn snapshot(&self) -> AccumulatorSnapshot {
        let state = self.state.lock().await;
        AccumulatorSnapshot {
            key: self.key.clone(),
            kind: AccumulatorKind::from(self.policy.kind),
            source_id: self.source_id.clone(),
            value: state.total,
            last_observed: state.last_energy,
            last_update: state.last_update,
            last_reset: Some(state.last_reset),
            conversion_factor: None,
            source_unit: None,
            last_calculation: None,
            calculation_count: state.updates,
            last_method: None,
            last_skip_reason: None,
        }
    }

    pub async fn flush(&self) {
        let state = self.state.lock().await;
        self.persist(&state).await;
    }

    async fn persist(&self, state: &PeriodState) {
        if let Err(err) = self.store.save(&self.key, &state.to_record()).await {
            tracing::warn!(key = %self.key, error = %err, "failed to persist accumulator; keeping in-memory state");
        }
    }
}
