use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;

/// Period a derived accumulator covers before it is zeroed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetKind {
    Daily,
    Monthly,
}

impl ResetKind {
    pub fn key_suffix(self) -> &'static str {
        match self {
            Self::Daily => "daily_energy",
            Self::Monthly => "monthly_energy",
        }
    }
}

/// True once `now` sits in a later local day (or month) than `last_reset`.
pub fn should_reset(kind: ResetKind, now: DateTime<Utc>, last_reset: DateTime<Utc>, tz: &Tz) -> bool {
    let now_local = now.with_timezone(tz).date_naive();
    let last_local = last_reset.with_timezone(tz).date_naive();
    match kind {
        ResetKind::Daily => now_local > last_local,
        ResetKind::Monthly => {
            (now_local.year(), now_local.month()) > (last_local.year(), last_local.month())
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResetPolicy {
    pub kind: ResetKind,
    pub tz: Tz,
}

impl ResetPolicy {
    pub fn new(kind: ResetKind, tz: Tz) -> Self {
        Self { kind, tz }
    }

    pub fn should_reset(&self, now: DateTime<Utc>, last_reset: DateTime<Utc>) -> bool {
        should_reset(self.kind, now, last_reset, &self.tz)
    }
}

/// First instant of the next local day after `now`.
pub fn next_local_midnight(now: DateTime<Utc>, tz: &Tz) -> DateTime<Utc> {
    let today = now.with_timezone(tz).date_naive();
    let tomorrow = today.succ_opt().unwrap_or(today);
    local_day_start(tomorrow, tz).unwrap_or_else(|| now + ChronoDuration::hours(24))
}

// Zones that skip midnight on a DST change start the day at the first valid minute.
fn local_day_start(date: NaiveDate, tz: &Tz) -> Option<DateTime<Utc>> {
    let midnight = date.and_hms_opt(0, 0, 0)?;
    (0..=120)
        .step_by(15)
        .find_map(|minutes| {
            tz.from_local_datetime(&(midnight + ChronoDuration::minutes(minutes)))
                .earliest()
        })
        .map(|local| local.with_timezone(&Utc))
}
