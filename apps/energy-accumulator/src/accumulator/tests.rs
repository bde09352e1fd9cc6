use super::*;
use crate::integrate::HistoricalIntegrator;
use crate::observation::SourceState;
use crate::reset::ResetPolicy;
use crate::sources::{HistoryStore, LiveStateSource, StateRegistry};
use crate::store::{AccumulatorRecord, AccumulatorStore};
use chrono::TimeZone;
use std::sync::Arc;
use tempfile::TempDir;

const SOURCE: &str = "sensor.kettle_power";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 3, 10, 0, 0).unwrap()
}

fn at(seconds: i64) -> DateTime<Utc> {
    t0() + ChronoDuration::seconds(seconds)
}

fn power(raw: &str, ts: DateTime<Utc>) -> SourceState {
    SourceState {
        source_id: SOURCE.to_string(),
        state: raw.to_string(),
        unit: Some("W".to_string()),
        device_class: Some("power".to_string()),
        updated_at: ts,
    }
}

fn point_only() -> MeterSettings {
    MeterSettings {
        use_statistical: false,
        ..MeterSettings::default()
    }
}

struct Harness {
    _dir: TempDir,
    registry: StateRegistry,
    store: AccumulatorStore,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = AccumulatorStore::new(dir.path().join("energy.json"));
        Self {
            _dir: dir,
            registry: StateRegistry::new(ChronoDuration::hours(24), true),
            store,
        }
    }

    async fn meter(&self, settings: MeterSettings, with_history: bool) -> EnergyMeter {
        let live: Arc<dyn LiveStateSource> = Arc::new(self.registry.clone());
        let history: Option<Arc<dyn HistoryStore>> = if with_history {
            Some(Arc::new(self.registry.clone()))
        } else {
            None
        };
        EnergyMeter::attach(
            SOURCE,
            settings,
            live,
            HistoricalIntegrator::new(history),
            self.store.clone(),
        )
        .await
    }

    async fn publish(&self, raw: &str, ts: DateTime<Utc>) {
        self.registry.publish(power(raw, ts)).await;
    }
}

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[test]
fn derives_keys_from_source_ids() {
    assert_eq!(base_name("sensor.kettle_power"), "kettle");
    assert_eq!(base_name("sensor.garage_heater"), "garage_heater");
    assert_eq!(base_name("pump_power"), "pump");
    assert_eq!(accumulator_key("kettle", AccumulatorKind::Energy), "kettle_energy");
    assert_eq!(
        accumulator_key("kettle", AccumulatorKind::DailyEnergy),
        "kettle_daily_energy"
    );
    assert_eq!(
        accumulator_key("kettle", AccumulatorKind::MonthlyEnergy),
        "kettle_monthly_energy"
    );
}

#[test]
fn point_sampling_permission_follows_options() {
    assert!(MeterSettings::default().point_sampling_permitted());
    assert!(point_only().point_sampling_permitted());
    let strict = MeterSettings {
        allow_point_sampling_fallback: false,
        ..MeterSettings::default()
    };
    assert!(!strict.point_sampling_permitted());
    let backup = MeterSettings {
        enable_point_sampling_backup: true,
        ..strict
    };
    assert!(backup.point_sampling_permitted());
}

#[tokio::test]
async fn first_tick_seeds_then_point_samples() {
    let h = Harness::new();
    let meter = h.meter(point_only(), false).await;

    h.publish("100", t0()).await;
    assert_eq!(meter.tick(t0()).await, TickOutcome::Seeded);
    assert_eq!(meter.total(), 0.0);

    h.publish("300", at(3600)).await;
    let outcome = meter.tick(at(3600)).await;
    let TickOutcome::Applied { method, kwh } = outcome else {
        panic!("expected an applied integration, got {outcome:?}");
    };
    assert_eq!(method, Method::PointSampling);
    assert!(approx(kwh, 0.2));
    assert!(approx(meter.total(), 0.2));

    let stored = h.store.load("kettle_energy").await.unwrap();
    assert!(approx(stored.value, 0.2));
    assert_eq!(stored.last_power, Some(300.0));
    assert_eq!(stored.last_update, Some(at(3600)));
    assert_eq!(stored.conversion_factor, Some(ConversionFactor::Watts));
    assert_eq!(stored.source_unit.as_deref(), Some("W"));
}

#[tokio::test]
async fn total_never_decreases_across_ticks() {
    let h = Harness::new();
    let meter = h.meter(point_only(), false).await;
    let readings = ["500", "0", "1200", "0", "0", "80"];

    let mut previous = meter.total();
    for (idx, raw) in readings.iter().enumerate() {
        let ts = at(idx as i64 * 60);
        h.publish(raw, ts).await;
        meter.tick(ts).await;
        assert!(meter.total() >= previous, "total dropped at tick {idx}");
        previous = meter.total();
    }
    assert!(previous > 0.0);
}

#[tokio::test]
async fn push_then_tick_integrates_the_interval_once() {
    let h = Harness::new();
    let meter = h.meter(point_only(), false).await;

    h.publish("100", t0()).await;
    assert_eq!(meter.tick(t0()).await, TickOutcome::Seeded);

    let pushed = power("300", at(1800));
    h.registry.publish(pushed.clone()).await;
    assert_eq!(meter.on_push(&pushed).await, PushOutcome::Refreshed);
    assert_eq!(meter.total(), 0.0, "pushes never integrate");

    assert_eq!(
        meter.tick(at(1800)).await,
        TickOutcome::Applied {
            method: Method::PointSampling,
            kwh: 0.0
        }
    );
    meter.tick(at(3600)).await;
    assert!(approx(meter.total(), 0.15));
}

#[tokio::test]
async fn first_push_seeds_and_stale_push_is_ignored() {
    let h = Harness::new();
    let meter = h.meter(point_only(), false).await;

    assert_eq!(meter.on_push(&power("50", at(60))).await, PushOutcome::Seeded);
    assert_eq!(
        meter.on_push(&power("70", at(30))).await,
        PushOutcome::Ignored(SkipReason::StaleObservation)
    );
    assert_eq!(
        meter.on_push(&power("unavailable", at(90))).await,
        PushOutcome::Ignored(SkipReason::InvalidObservation("unavailable".to_string()))
    );
    let snapshot = meter.snapshot().await;
    assert_eq!(snapshot.last_observed, Some(50.0));
    assert_eq!(snapshot.last_update, Some(at(60)));
}

#[tokio::test]
async fn statistical_integration_uses_the_cursor_window() {
    let h = Harness::new();
    h.store
        .save(
            "kettle_energy",
            &AccumulatorRecord {
                value: 1.0,
                last_power: Some(100.0),
                last_update: Some(t0()),
                conversion_factor: Some(ConversionFactor::Watts),
                source_unit: Some("W".to_string()),
                last_calculation: Some(t0()),
                ..AccumulatorRecord::default()
            },
        )
        .await
        .unwrap();
    let meter = h.meter(MeterSettings::default(), true).await;
    assert!(approx(meter.total(), 1.0));

    h.publish("100", t0()).await;
    h.publish("100", at(1800)).await;
    h.publish("300", at(1800)).await;
    h.publish("300", at(3600)).await;

    let outcome = meter.tick(at(3600)).await;
    let TickOutcome::Applied { method, kwh } = outcome else {
        panic!("expected a statistical integration, got {outcome:?}");
    };
    assert_eq!(method, Method::Statistical);
    assert!(approx(kwh, 0.1), "left Riemann result, not the 0.2 trapezoid");
    assert!(approx(meter.total(), 1.1));

    // One minute later the window is below the two minute minimum.
    assert_eq!(meter.tick(at(3660)).await, TickOutcome::NoComputation);
    assert!(approx(meter.total(), 1.1));

    let snapshot = meter.snapshot().await;
    assert_eq!(snapshot.last_calculation, Some(at(3600)));
    assert_eq!(snapshot.calculation_count, 1);
    assert_eq!(snapshot.last_method, Some(Method::Statistical));
}

#[tokio::test]
async fn missing_history_falls_back_to_point_sampling() {
    let h = Harness::new();
    let meter = h.meter(MeterSettings::default(), true).await;

    // Seeded by a push that never reached the recorder, so the window holds one sample.
    assert_eq!(meter.on_push(&power("100", t0())).await, PushOutcome::Seeded);
    h.publish("300", at(3600)).await;
    let outcome = meter.tick(at(3600)).await;
    assert!(
        matches!(outcome, TickOutcome::Applied { method: Method::PointSampling, .. }),
        "{outcome:?}"
    );
    assert!(approx(meter.total(), 0.2));
}

/// Publishes a steady reading 30 s into every minute and ticks on the minute for an hour.
/// Returns the number of statistical and deferred ticks.
async fn run_steady_hour(h: &Harness, meter: &EnergyMeter, raw: &str) -> (usize, usize) {
    let (mut statistical, mut deferred) = (0, 0);
    for minute in 1..=60 {
        h.publish(raw, at(minute * 60 - 30)).await;
        match meter.tick(at(minute * 60)).await {
            TickOutcome::Applied {
                method: Method::Statistical,
                ..
            } => statistical += 1,
            TickOutcome::NoComputation => deferred += 1,
            TickOutcome::Seeded => assert_eq!(minute, 1),
            other => panic!("unexpected outcome at minute {minute}: {other:?}"),
        }
    }
    (statistical, deferred)
}

#[tokio::test]
async fn statistical_windows_tile_a_steady_load() {
    let h = Harness::new();
    let meter = h.meter(MeterSettings::default(), true).await;

    let (statistical, deferred) = run_steady_hour(&h, &meter, "1000").await;
    assert_eq!(statistical, 30);
    assert_eq!(deferred, 29);
    // 1 kW from the first sample at 00:30 through the last tick at 60:00.
    assert!(
        approx(meter.total(), 3570.0 / 3600.0),
        "total {} kWh",
        meter.total()
    );
}

#[tokio::test]
async fn statistical_and_point_sampling_agree_on_a_steady_load() {
    let statistical_h = Harness::new();
    let statistical = statistical_h.meter(MeterSettings::default(), true).await;
    run_steady_hour(&statistical_h, &statistical, "600").await;

    let point_h = Harness::new();
    let point = point_h.meter(point_only(), false).await;
    for minute in 1..=60 {
        point_h.publish("600", at(minute * 60 - 30)).await;
        point.tick(at(minute * 60)).await;
    }

    // Point sampling starts at the seeding tick, 30 s after the first sample.
    assert!(approx(point.total(), 0.6 * 3540.0 / 3600.0));
    assert!((statistical.total() - point.total()).abs() < 0.6 * 31.0 / 3600.0);
}

async fn implausible_setup(h: &Harness, settings: MeterSettings) -> EnergyMeter {
    h.store
        .save(
            "kettle_energy",
            &AccumulatorRecord {
                value: 0.0,
                last_power: Some(100.0),
                last_update: Some(t0()),
                conversion_factor: Some(ConversionFactor::Watts),
                source_unit: Some("W".to_string()),
                last_calculation: Some(t0()),
                ..AccumulatorRecord::default()
            },
        )
        .await
        .unwrap();
    let meter = h.meter(settings, true).await;
    // 5 kW held for an hour is above the 3 kW ceiling.
    h.publish("5000", t0()).await;
    h.publish("5000", at(3600)).await;
    meter
}

#[tokio::test]
async fn implausible_statistical_result_falls_back_when_allowed() {
    let h = Harness::new();
    let meter = implausible_setup(&h, MeterSettings::default()).await;

    let outcome = meter.tick(at(3600)).await;
    let TickOutcome::Applied { method, kwh } = outcome else {
        panic!("expected fallback, got {outcome:?}");
    };
    assert_eq!(method, Method::PointSampling);
    assert!(approx(kwh, 2.55));
}

#[tokio::test]
async fn implausible_statistical_result_without_fallback_changes_nothing() {
    let h = Harness::new();
    let settings = MeterSettings {
        allow_point_sampling_fallback: false,
        ..MeterSettings::default()
    };
    let meter = implausible_setup(&h, settings).await;

    assert_eq!(meter.tick(at(3600)).await, TickOutcome::NoComputation);
    assert_eq!(meter.total(), 0.0);
    let stored = h.store.load("kettle_energy").await.unwrap();
    assert_eq!(stored.last_power, Some(100.0));
    assert_eq!(stored.last_calculation, Some(t0()));
}

#[tokio::test]
async fn energy_source_is_refused() {
    let h = Harness::new();
    let meter = h.meter(point_only(), false).await;
    let mut energy = power("12.5", t0());
    energy.unit = Some("kWh".to_string());
    energy.device_class = Some("energy".to_string());
    h.registry.publish(energy.clone()).await;

    let outcome = meter.tick(t0()).await;
    assert!(
        matches!(outcome, TickOutcome::Skipped(SkipReason::MisconfiguredSource { .. })),
        "{outcome:?}"
    );
    assert!(matches!(meter.on_push(&energy).await, PushOutcome::Ignored(_)));
    let snapshot = meter.snapshot().await;
    assert_eq!(snapshot.value, 0.0);
    assert_eq!(snapshot.last_observed, None);
    assert!(snapshot.last_skip_reason.is_some());
}

#[tokio::test]
async fn waits_for_unit_then_reports_unavailable_source() {
    let h = Harness::new();
    let meter = h.meter(point_only(), false).await;

    assert_eq!(
        meter.tick(t0()).await,
        TickOutcome::Skipped(SkipReason::UnresolvedUnit)
    );
    h.publish("100", at(60)).await;
    assert_eq!(meter.tick(at(60)).await, TickOutcome::Seeded);
    h.publish("unavailable", at(120)).await;
    assert_eq!(
        meter.tick(at(120)).await,
        TickOutcome::Skipped(SkipReason::SourceUnavailable)
    );
}

#[tokio::test]
async fn tick_while_busy_is_skipped() {
    let h = Harness::new();
    let meter = h.meter(point_only(), false).await;
    h.publish("100", t0()).await;

    let guard = meter.state.lock().await;
    assert_eq!(meter.tick(t0()).await, TickOutcome::Busy);
    drop(guard);
    assert_eq!(meter.tick(t0()).await, TickOutcome::Seeded);
}

#[tokio::test]
async fn state_survives_reattach() {
    let h = Harness::new();
    {
        let meter = h.meter(point_only(), false).await;
        h.publish("1000", t0()).await;
        meter.tick(t0()).await;
        h.publish("1000", at(1800)).await;
        meter.tick(at(1800)).await;
        assert!(approx(meter.total(), 0.5));
    }

    let meter = h.meter(point_only(), false).await;
    assert!(approx(meter.total(), 0.5));
    h.publish("1000", at(3600)).await;
    let outcome = meter.tick(at(3600)).await;
    assert!(matches!(outcome, TickOutcome::Applied { .. }), "{outcome:?}");
    assert!(approx(meter.total(), 1.0));
}

#[tokio::test]
async fn legacy_value_loads_and_seeds_on_first_tick() {
    let h = Harness::new();
    std::fs::write(h.store.path(), r#"{"kettle_energy": 42.5}"#).unwrap();
    let meter = h.meter(point_only(), false).await;
    assert!(approx(meter.total(), 42.5));

    h.publish("200", t0()).await;
    assert_eq!(meter.tick(t0()).await, TickOutcome::Seeded);
    assert!(approx(meter.total(), 42.5));
}

#[tokio::test]
async fn write_failures_keep_memory_authoritative() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, "not a directory").unwrap();
    let registry = StateRegistry::new(ChronoDuration::hours(1), false);
    let live: Arc<dyn LiveStateSource> = Arc::new(registry.clone());
    let meter = EnergyMeter::attach(
        SOURCE,
        point_only(),
        live,
        HistoricalIntegrator::new(None),
        AccumulatorStore::new(blocker.join("energy.json")),
    )
    .await;

    registry.publish(power("1000", t0())).await;
    meter.tick(t0()).await;
    registry.publish(power("1000", at(3600))).await;
    meter.tick(at(3600)).await;
    assert!(approx(meter.total(), 1.0));
}

#[tokio::test]
async fn scale_corrects_total_and_notifies_followers() {
    let h = Harness::new();
    let meter = h.meter(point_only(), false).await;
    let mut total_rx = meter.subscribe_total();
    h.publish("2000", t0()).await;
    meter.tick(t0()).await;
    h.publish("2000", at(3600)).await;
    meter.tick(at(3600)).await;
    assert!(total_rx.has_changed().unwrap());
    assert!(approx(*total_rx.borrow_and_update(), 2.0));

    let (before, after) = meter.scale(0.5).await;
    assert!(approx(before, 2.0));
    assert!(approx(after, 1.0));
    assert!(approx(*total_rx.borrow_and_update(), 1.0));
    assert!(approx(h.store.load("kettle_energy").await.unwrap().value, 1.0));
}

#[test]
fn derived_delta_sequence() {
    let mut last = None;
    let mut deltas = Vec::new();
    for value in [10.0, 10.5, 10.5, 0.2] {
        if let Some(delta) = period_delta(last, value) {
            deltas.push(delta);
        }
        last = Some(value);
    }
    assert_eq!(deltas.len(), 3);
    assert!(approx(deltas[0], 0.5));
    assert_eq!(deltas[1], 0.0);
    assert_eq!(deltas[2], 0.0);
}

fn daily(tz: chrono_tz::Tz) -> ResetPolicy {
    ResetPolicy::new(ResetKind::Daily, tz)
}

#[tokio::test]
async fn daily_meter_follows_parent_total() {
    let h = Harness::new();
    let tz = chrono_tz::UTC;
    let meter = PeriodMeter::attach("kettle", SOURCE, daily(tz), h.store.clone(), None, t0()).await;
    assert_eq!(meter.key(), "kettle_daily_energy");

    let updates = [
        meter.on_parent_total(10.0, at(60)).await,
        meter.on_parent_total(10.5, at(120)).await,
        meter.on_parent_total(10.5, at(180)).await,
        meter.on_parent_total(0.2, at(240)).await,
    ];
    assert_eq!(updates[0], PeriodUpdate::Seeded);
    assert_eq!(updates[1], PeriodUpdate::Added(0.5));
    assert_eq!(updates[2], PeriodUpdate::Added(0.0));
    assert_eq!(updates[3], PeriodUpdate::Added(0.0));
    assert!(approx(meter.total().await, 0.5));

    let stored = h.store.load("kettle_daily_energy").await.unwrap();
    assert_eq!(stored.last_energy, Some(0.2));
    assert_eq!(stored.last_reset, Some(t0()));
}

#[tokio::test]
async fn daily_meter_resets_at_local_midnight() {
    let h = Harness::new();
    let tz = chrono_tz::Europe::Berlin;
    let evening = tz
        .with_ymd_and_hms(2026, 6, 3, 23, 0, 0)
        .single()
        .unwrap()
        .with_timezone(&Utc);
    let after_midnight = evening + ChronoDuration::minutes(61);

    let meter = PeriodMeter::attach("kettle", SOURCE, daily(tz), h.store.clone(), None, evening).await;
    meter.on_parent_total(5.0, evening).await;
    meter.on_parent_total(6.0, evening + ChronoDuration::minutes(30)).await;
    assert!(approx(meter.total().await, 1.0));

    // Same local day: nothing to do.
    assert!(!meter.check_reset(evening + ChronoDuration::minutes(45), Some(6.0)).await);
    assert!(meter.check_reset(after_midnight, Some(6.25)).await);
    assert_eq!(meter.total().await, 0.0);
    assert!(!meter.check_reset(after_midnight, Some(6.25)).await, "reset applies once");

    assert_eq!(
        meter.on_parent_total(6.75, after_midnight + ChronoDuration::minutes(5)).await,
        PeriodUpdate::Added(0.5)
    );
    let snapshot = meter.snapshot().await;
    assert_eq!(snapshot.last_reset, Some(after_midnight));
    assert!(approx(snapshot.value, 0.5));
}

#[tokio::test]
async fn parent_update_after_boundary_starts_new_period() {
    let h = Harness::new();
    let tz = chrono_tz::UTC;
    let meter = PeriodMeter::attach("kettle", SOURCE, daily(tz), h.store.clone(), None, t0()).await;
    meter.on_parent_total(3.0, at(60)).await;
    meter.on_parent_total(4.0, at(120)).await;

    let next_day = t0() + ChronoDuration::days(1);
    assert_eq!(meter.on_parent_total(4.5, next_day).await, PeriodUpdate::Added(0.5));
    assert!(approx(meter.total().await, 0.5));
    assert_eq!(meter.snapshot().await.last_reset, Some(next_day));
}

#[tokio::test]
async fn monthly_meter_applies_missed_boundary_on_attach() {
    let h = Harness::new();
    let tz = chrono_tz::UTC;
    let jan_31 = Utc.with_ymd_and_hms(2026, 1, 31, 20, 0, 0).unwrap();
    h.store
        .save(
            "kettle_monthly_energy",
            &AccumulatorRecord {
                value: 31.0,
                last_energy: Some(120.0),
                last_update: Some(jan_31),
                last_reset: Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 5).unwrap()),
                ..AccumulatorRecord::default()
            },
        )
        .await
        .unwrap();

    let feb_1 = Utc.with_ymd_and_hms(2026, 2, 1, 0, 1, 0).unwrap();
    let policy = ResetPolicy::new(ResetKind::Monthly, tz);
    let meter = PeriodMeter::attach("kettle", SOURCE, policy, h.store.clone(), Some(121.0), feb_1).await;
    assert_eq!(meter.total().await, 0.0);

    let stored = h.store.load("kettle_monthly_energy").await.unwrap();
    assert_eq!(stored.value, 0.0);
    assert_eq!(stored.last_energy, Some(121.0));
    assert_eq!(stored.last_reset, Some(feb_1));

    let again = PeriodMeter::attach("kettle", SOURCE, policy, h.store.clone(), Some(121.0), feb_1).await;
    assert_eq!(again.snapshot().await.last_reset, Some(feb_1));
}

#[tokio::test]
async fn scaling_parent_does_not_re_add_energy() {
    let h = Harness::new();
    let tz = chrono_tz::UTC;
    let meter = PeriodMeter::attach("kettle", SOURCE, daily(tz), h.store.clone(), None, t0()).await;
    meter.on_parent_total(8.0, at(60)).await;
    meter.on_parent_total(10.0, at(120)).await;
    meter.scale(0.5).await;
    assert!(approx(meter.total().await, 1.0));

    // The parent total was halved too.
    assert_eq!(meter.on_parent_total(5.0, at(180)).await, PeriodUpdate::Added(0.0));
    assert_eq!(meter.on_parent_total(5.25, at(240)).await, PeriodUpdate::Added(0.25));
    assert!(approx(meter.total().await, 1.25));
}
