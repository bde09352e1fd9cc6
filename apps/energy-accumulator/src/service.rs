use chrono::Utc;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::accumulator::{
    base_name, AccumulatorKind, AccumulatorSnapshot, EnergyMeter, Method, PeriodMeter,
};
use crate::config::AccumulatorOptions;
use crate::integrate::HistoricalIntegrator;
use crate::observation::SourceState;
use crate::reset::{next_local_midnight, ResetKind, ResetPolicy};
use crate::sources::{HistoryStore, LiveStateSource};
use crate::store::AccumulatorStore;
use crate::units;

const DEFAULT_RESET_FACTOR: f64 = 0.5;

/// One power source with its energy accumulator and the period totals that follow it.
pub struct AccumulatorGroup {
    pub base: String,
    pub source_id: String,
    pub energy: EnergyMeter,
    pub periods: Vec<PeriodMeter>,
}

impl AccumulatorGroup {
    async fn snapshots(&self) -> Vec<AccumulatorSnapshot> {
        let mut out = vec![self.energy.snapshot().await];
        for period in &self.periods {
            out.push(period.snapshot().await);
        }
        out
    }

    async fn forward_total(&self, total: f64) {
        let now = Utc::now();
        for period in &self.periods {
            period.on_parent_total(total, now).await;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AccumulatorSummary {
    pub key: String,
    pub kind: AccumulatorKind,
    pub source_id: String,
    /// Rounded to two decimals for display.
    pub value: f64,
    pub raw_value: f64,
    pub last_method: Option<Method>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnosis {
    pub accumulator: AccumulatorSnapshot,
    pub source: Option<SourceState>,
    pub source_reports_energy: bool,
    pub sample_interval_seconds: u64,
    pub stored_format: &'static str,
    pub stored: Option<JsonValue>,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("no accumulator matches {name:?}")]
    NotFound { name: String, available: Vec<String> },
    #[error("reset_factor must be a finite number >= 0, got {0}")]
    InvalidResetFactor(f64),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResetRequest {
    #[serde(default = "default_reset_factor")]
    pub reset_factor: f64,
    #[serde(default)]
    pub reset_to_zero: bool,
    /// Base names (or source ids); empty means every group.
    #[serde(default)]
    pub sensors: Vec<String>,
}

fn default_reset_factor() -> f64 {
    DEFAULT_RESET_FACTOR
}

impl Default for ResetRequest {
    fn default() -> Self {
        Self {
            reset_factor: DEFAULT_RESET_FACTOR,
            reset_to_zero: false,
            sensors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResetEntry {
    pub key: String,
    pub previous: f64,
    pub value: f64,
}

#[derive(Clone)]
pub struct AccumulatorService {
    groups: Arc<Vec<Arc<AccumulatorGroup>>>,
    live: Arc<dyn LiveStateSource>,
    store: AccumulatorStore,
    options: Arc<AccumulatorOptions>,
    tz: Tz,
}

impl AccumulatorService {
    /// Attaches every accumulator selected in `options`.
    pub async fn build(
        options: AccumulatorOptions,
        tz: Tz,
        live: Arc<dyn LiveStateSource>,
        history: Option<Arc<dyn HistoryStore>>,
        store: AccumulatorStore,
    ) -> Self {
        if options.power_sensors.is_empty() {
            tracing::warn!("no power sensors selected; nothing to accumulate");
        }
        let historical = HistoricalIntegrator::new(history);
        let settings = options.meter_settings();
        let mut period_kinds = Vec::new();
        if options.create_daily_sensors {
            period_kinds.push(ResetKind::Daily);
        }
        if options.create_monthly_sensors {
            period_kinds.push(ResetKind::Monthly);
        }

        let mut groups = Vec::with_capacity(options.power_sensors.len());
        for source_id in &options.power_sensors {
            let base = base_name(source_id);
            match live.current_state(source_id).await {
                None => {
                    tracing::info!(source_id = %source_id, "selected source has not reported yet; tracking will start with its first reading")
                }
                Some(state) if units::reports_energy(&state) => {
                    tracing::warn!(source_id = %source_id, unit = ?state.unit(), "selected source reports energy, not power; it will not be integrated")
                }
                Some(_) => {}
            }

            let energy = EnergyMeter::attach(
                source_id,
                settings,
                live.clone(),
                historical.clone(),
                store.clone(),
            )
            .await;

            let now = Utc::now();
            let parent_total = energy.total();
            let mut periods = Vec::with_capacity(period_kinds.len());
            for kind in &period_kinds {
                let period = PeriodMeter::attach(
                    &base,
                    source_id,
                    ResetPolicy::new(*kind, tz),
                    store.clone(),
                    Some(parent_total),
                    now,
                )
                .await;
                period.on_parent_total(parent_total, now).await;
                periods.push(period);
            }

            groups.push(Arc::new(AccumulatorGroup {
                base,
                source_id: source_id.clone(),
                energy,
                periods,
            }));
        }

        Self {
            groups: Arc::new(groups),
            live,
            store,
            options: Arc::new(options),
            tz,
        }
    }

    pub fn groups(&self) -> &[Arc<AccumulatorGroup>] {
        &self.groups
    }

    /// Spawns one task per group plus the local-midnight boundary task. Subscriptions are in
    /// place when this returns.
    pub async fn start(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.groups.len() + 1);
        for group in self.groups.iter() {
            let pushes = self.live.subscribe(&group.source_id).await;
            let totals = group.energy.subscribe_total();
            handles.push(tokio::spawn(run_group(
                group.clone(),
                self.live.clone(),
                pushes,
                totals,
                self.options.sample_interval(),
                cancel.clone(),
            )));
        }
        handles.push(tokio::spawn(run_boundaries(
            self.groups.clone(),
            self.tz,
            cancel,
        )));
        handles
    }

    /// Final save of every accumulator.
    pub async fn shutdown(&self) {
        for group in self.groups.iter() {
            group.energy.flush().await;
            for period in &group.periods {
                period.flush().await;
            }
        }
        tracing::info!(groups = self.groups.len(), "accumulators saved");
    }

    pub async fn list(&self) -> Vec<AccumulatorSummary> {
        let mut out = Vec::new();
        for group in self.groups.iter() {
            for snapshot in group.snapshots().await {
                out.push(AccumulatorSummary {
                    key: snapshot.key,
                    kind: snapshot.kind,
                    source_id: snapshot.source_id,
                    value: round2(snapshot.value),
                    raw_value: snapshot.value,
                    last_method: snapshot.last_method,
                });
            }
        }
        out
    }

    /// Exact key match first, then the first case-insensitive partial match.
    pub async fn diagnose(&self, name: &str) -> Result<Diagnosis, ServiceError> {
        let mut snapshots = Vec::new();
        for group in self.groups.iter() {
            snapshots.extend(group.snapshots().await);
        }
        let needle = name.trim().to_ascii_lowercase();
        let position = snapshots
            .iter()
            .position(|s| s.key == name.trim())
            .or_else(|| {
                snapshots
                    .iter()
                    .position(|s| !needle.is_empty() && s.key.to_ascii_lowercase().contains(&needle))
            });
        let Some(position) = position else {
            return Err(ServiceError::NotFound {
                name: name.to_string(),
                available: snapshots.into_iter().map(|s| s.key).collect(),
            });
        };
        let accumulator = snapshots.swap_remove(position);

        let source = self.live.current_state(&accumulator.source_id).await;
        let source_reports_energy = source.as_ref().is_some_and(units::reports_energy);
        let stored = self.store.entries().await.remove(&accumulator.key);
        let stored_format = match &stored {
            None => "missing",
            Some(JsonValue::Number(_)) => "legacy_value",
            Some(_) => "record",
        };
        Ok(Diagnosis {
            accumulator,
            source,
            source_reports_energy,
            sample_interval_seconds: self.options.sample_interval_seconds,
            stored_format,
            stored,
        })
    }

    /// Scales (or zeroes) the totals of the selected groups. Used to correct doubled values.
    pub async fn reset(&self, request: &ResetRequest) -> Result<Vec<ResetEntry>, ServiceError> {
        let factor = if request.reset_to_zero {
            0.0
        } else {
            request.reset_factor
        };
        if !factor.is_finite() || factor < 0.0 {
            return Err(ServiceError::InvalidResetFactor(factor));
        }
        let selected: Vec<String> = request.sensors.iter().map(|s| base_name(s)).collect();

        let mut entries = Vec::new();
        for group in self.groups.iter() {
            if !selected.is_empty() && !selected.contains(&group.base) {
                continue;
            }
            let (previous, value) = group.energy.scale(factor).await;
            entries.push(ResetEntry {
                key: group.energy.key().to_string(),
                previous,
                value,
            });
            for period in &group.periods {
                let (previous, value) = period.scale(factor).await;
                entries.push(ResetEntry {
                    key: period.key().to_string(),
                    previous,
                    value,
                });
            }
        }
        for entry in &entries {
            tracing::info!(key = %entry.key, previous_kwh = entry.previous, kwh = entry.value, "accumulator corrected");
        }
        Ok(entries)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

async fn run_group(
    group: Arc<AccumulatorGroup>,
    live: Arc<dyn LiveStateSource>,
    mut pushes: broadcast::Receiver<SourceState>,
    mut totals: watch::Receiver<f64>,
    interval: StdDuration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                group.energy.tick(Utc::now()).await;
            }
            push = pushes.recv() => match push {
                Ok(state) => {
                    group.energy.on_push(&state).await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(source_id = %group.source_id, skipped, "push subscriber lagged; the next tick reads current state");
                }
                Err(RecvError::Closed) => {
                    pushes = live.subscribe(&group.source_id).await;
                }
            },
            changed = totals.changed() => {
                if changed.is_err() {
                    break;
                }
                let total = *totals.borrow_and_update();
                group.forward_total(total).await;
            }
        }
    }
    tracing::debug!(source_id = %group.source_id, "accumulator group stopped");
}

async fn run_boundaries(
    groups: Arc<Vec<Arc<AccumulatorGroup>>>,
    tz: Tz,
    cancel: CancellationToken,
) {
    loop {
        let now = Utc::now();
        let wait = (next_local_midnight(now, &tz) - now)
            .to_std()
            .unwrap_or(StdDuration::from_secs(1));
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {
                let now = Utc::now();
                for group in groups.iter() {
                    let parent_total = group.energy.total();
                    for period in &group.periods {
                        period.check_reset(now, Some(parent_total)).await;
                    }
                }
            }
        }
    }
}
