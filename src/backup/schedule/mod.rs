//! Recurring schedules: when the next run is due, and which packages it covers.
//!
//! A schedule's next run is derived, never stored authoritatively. Whatever
//! `time_to_run` was persisted, every evaluation recomputes it from the anchor
//! (`time_placed`), the time of day and the interval, so edits take effect on
//! the next evaluation and a stale value can never keep an alarm in the past.

pub mod alarm;
pub mod scheduler;
pub mod service;
pub mod store;

use crate::backup::catalog::{DataKind, PackageCatalog, PackageInfo};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use bon::Builder;
use chrono::{DateTime, Days, Local, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Display;
use validator::Validate;

pub const MIN_TIME_FROM_NOW_MS: i64 = 60_000;

/// Which packages a schedule picks by origin.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageFilter {
    #[default]
    All,
    System,
    User,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialFilter {
    #[default]
    All,
    Launchable,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate, Builder)]
#[serde(deny_unknown_fields)]
pub struct Schedule {
    #[serde(default)]
    #[builder(default)]
    pub id: i64,
    #[serde(default)]
    #[builder(default)]
    pub enabled: bool,
    #[builder(into)]
    pub name: String,
    #[validate(range(max = 23))]
    #[builder(default)]
    pub time_hour: u32,
    #[validate(range(max = 59))]
    #[builder(default)]
    pub time_minute: u32,
    /// Days between runs
    #[validate(range(min = 1))]
    #[builder(default = 1)]
    pub interval: i32,
    /// Anchor of the interval lattice, epoch milliseconds
    #[serde(default)]
    #[builder(default)]
    pub time_placed: i64,
    /// Last computed run time, epoch milliseconds; a cache only
    #[serde(default)]
    #[builder(default)]
    pub time_to_run: i64,
    #[serde(default)]
    #[builder(default)]
    pub filter: PackageFilter,
    #[serde(default)]
    #[builder(default)]
    pub special_filter: SpecialFilter,
    #[serde(default = "default_kinds")]
    #[builder(default = default_kinds())]
    pub kinds: BTreeSet<DataKind>,
    #[serde(default)]
    #[builder(default)]
    pub custom_list: BTreeSet<String>,
    #[serde(default)]
    #[builder(default)]
    pub block_list: BTreeSet<String>,
}

fn default_kinds() -> BTreeSet<DataKind> {
    DataKind::ALL.into_iter().collect()
}

impl Schedule {
    /// Next run time in the local time zone.
    pub fn next_run(&self, now: i64) -> Result<i64> {
        self.next_run_in(now, &Local)
    }

    pub fn next_run_in<Tz: TimeZone>(&self, now: i64, tz: &Tz) -> Result<i64> {
        calculate_time_to_run(
            self.time_placed,
            self.time_hour,
            self.time_minute,
            self.interval,
            now,
            tz,
        )
    }

    pub fn batch_name(&self, start: DateTime<Utc>) -> String {
        batch_name(&self.name, start.with_timezone(&Local))
    }

    /// Packages this schedule acts on, sorted by name.
    pub fn resolve(&self, catalog: &dyn PackageCatalog) -> Vec<PackageInfo> {
        catalog
            .packages()
            .into_iter()
            .filter(|p| p.installed)
            .filter(|p| match self.filter {
                PackageFilter::All => true,
                PackageFilter::System => p.system,
                PackageFilter::User => !p.system,
            })
            .filter(|p| match self.special_filter {
                SpecialFilter::All => true,
                SpecialFilter::Launchable => p.launchable,
            })
            .filter(|p| self.custom_list.is_empty() || self.custom_list.contains(&p.name))
            .filter(|p| !self.block_list.contains(&p.name))
            .collect()
    }
}

/// `"<name> @ yyyy-MM-dd HH:mm:ss"`
pub fn batch_name<Tz: TimeZone>(name: &str, start: DateTime<Tz>) -> String
where
    Tz::Offset: Display,
{
    format!("{name} @ {}", start.format("%Y-%m-%d %H:%M:%S"))
}

/// Earliest instant at least one minute after `now` on the lattice
/// `time_placed + k * interval days`, with the time of day replaced by
/// `hour:minute:00.000` in `tz`.
///
/// Overdue schedules fast-forward to the lattice point just before `now`, so a
/// schedule that was not evaluated for years still lands on the next future
/// occurrence within the iteration bound. A time of day that does not exist on
/// some date (a DST gap) moves forward by the gap.
pub fn calculate_time_to_run<Tz: TimeZone>(
    time_placed: i64,
    hour: u32,
    minute: u32,
    interval: i32,
    now: i64,
    tz: &Tz,
) -> Result<i64> {
    if interval <= 0 {
        return Err(Error::ScheduleMisconfigured(format!(
            "interval must be at least one day, got {interval}"
        )));
    }
    let time_of_day = NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| {
        Error::ScheduleMisconfigured(format!("invalid time of day {hour:02}:{minute:02}"))
    })?;
    let min_time = now.saturating_add(MIN_TIME_FROM_NOW_MS);
    let placed_date = local_date(time_placed, tz)?;
    let min_date = local_date(min_time, tz)?;

    let interval = interval as u64;
    let days_behind = (min_date - placed_date).num_days().max(0) as u64;
    let mut step = (days_behind / interval).saturating_sub(1);
    let limit = (366 / interval).max(1) + 2;

    for _ in 0..limit {
        let date = placed_date
            .checked_add_days(Days::new(step * interval))
            .ok_or_else(|| Error::ScheduleMisconfigured("run date out of range".into()))?;
        if let Some(candidate) = local_instant(tz, date, time_of_day) {
            if candidate >= min_time {
                tracing::trace!(
                    "Next run at {} for anchor {} every {} days, now {}",
                    candidate,
                    time_placed,
                    interval,
                    now
                );
                return Ok(candidate);
            }
        }
        step += 1;
    }
    Err(Error::ScheduleMisconfigured(format!(
        "no run time found within {limit} intervals of {time_placed}"
    )))
}

fn local_date<Tz: TimeZone>(millis: i64, tz: &Tz) -> Result<NaiveDate> {
    DateTime::from_timestamp_millis(millis)
        .map(|t| t.with_timezone(tz).date_naive())
        .ok_or_else(|| Error::ScheduleMisconfigured(format!("timestamp {millis} out of range")))
}

fn local_instant<Tz: TimeZone>(tz: &Tz, date: NaiveDate, time: NaiveTime) -> Option<i64> {
    let naive = date.and_time(time);
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => Some(t.timestamp_millis()),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.timestamp_millis()),
        LocalResult::None => (1..=4)
            .map(|h| naive + chrono::Duration::minutes(30 * h))
            .find_map(|shifted| tz.from_local_datetime(&shifted).earliest())
            .map(|t| t.timestamp_millis()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::catalog::StaticCatalog;
    use chrono::FixedOffset;

    const DAY_MS: i64 = 86_400_000;

    fn ms(s: &str) -> i64 {
        DateTime::parse_from_rfc3339(s).unwrap().timestamp_millis()
    }

    #[test]
    fn test_next_day_after_todays_slot() {
        let next = calculate_time_to_run(
            ms("2024-03-10T03:00:00Z"),
            3,
            0,
            1,
            ms("2024-03-10T03:30:00Z"),
            &Utc,
        )
        .unwrap();
        assert_eq!(next, ms("2024-03-11T03:00:00Z"));
    }

    #[test]
    fn test_later_today() {
        let next = calculate_time_to_run(
            ms("2024-03-10T01:00:00Z"),
            22,
            15,
            3,
            ms("2024-03-10T08:00:00Z"),
            &Utc,
        )
        .unwrap();
        assert_eq!(next, ms("2024-03-10T22:15:00Z"));
    }

    #[test]
    fn test_within_a_minute_moves_on() {
        let next = calculate_time_to_run(
            ms("2024-03-10T00:00:00Z"),
            3,
            0,
            2,
            ms("2024-03-10T02:59:30Z"),
            &Utc,
        )
        .unwrap();
        assert_eq!(next, ms("2024-03-12T03:00:00Z"));
    }

    #[test]
    fn test_exactly_one_minute_ahead_is_allowed() {
        let next = calculate_time_to_run(
            ms("2024-03-10T00:00:00Z"),
            3,
            0,
            1,
            ms("2024-03-10T02:59:00Z"),
            &Utc,
        )
        .unwrap();
        assert_eq!(next, ms("2024-03-10T03:00:00Z"));
    }

    #[test]
    fn test_catch_up_stays_on_lattice() {
        let placed = ms("2020-01-01T12:00:00Z");
        let now = ms("2024-06-15T18:00:00Z");
        let next = calculate_time_to_run(placed, 4, 30, 7, now, &Utc).unwrap();
        assert!(next >= now + MIN_TIME_FROM_NOW_MS);
        assert!(next - now <= 7 * DAY_MS);
        let anchor = ms("2020-01-01T04:30:00Z");
        assert_eq!((next - anchor) % (7 * DAY_MS), 0);
    }

    #[test]
    fn test_deterministic_and_never_early() {
        let placed = ms("2023-11-02T09:41:00Z");
        for interval in [1, 2, 5, 30, 366, 1000] {
            for now in [placed - DAY_MS, placed, placed + 13 * DAY_MS + 7, placed + 900 * DAY_MS] {
                let a = calculate_time_to_run(placed, 9, 40, interval, now, &Utc).unwrap();
                let b = calculate_time_to_run(placed, 9, 40, interval, now, &Utc).unwrap();
                assert_eq!(a, b);
                assert!(a >= now + MIN_TIME_FROM_NOW_MS, "interval {interval} now {now}");
            }
        }
    }

    #[test]
    fn test_time_zone_applies_to_time_of_day() {
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        let next = calculate_time_to_run(
            ms("2024-03-10T00:00:00Z"),
            3,
            0,
            1,
            ms("2024-03-10T00:30:00Z"),
            &tz,
        )
        .unwrap();
        // 03:00 at +02:00
        assert_eq!(next, ms("2024-03-10T01:00:00Z"));
    }

    #[test]
    fn test_invalid_interval_rejected() {
        for interval in [0, -3] {
            let err = calculate_time_to_run(0, 3, 0, interval, 0, &Utc).unwrap_err();
            assert!(matches!(err, Error::ScheduleMisconfigured(_)));
        }
        let err = calculate_time_to_run(0, 24, 0, 1, 0, &Utc).unwrap_err();
        assert!(matches!(err, Error::ScheduleMisconfigured(_)));
    }

    #[test]
    fn test_schedule_validation() {
        let schedule = Schedule::builder().name("nightly").interval(0).build();
        assert!(schedule.validate().is_err());
        let schedule = Schedule::builder().name("nightly").time_hour(23).build();
        assert!(schedule.validate().is_ok());
        assert_eq!(schedule.kinds.len(), DataKind::ALL.len());
    }

    #[test]
    fn test_batch_name_format() {
        let start = DateTime::parse_from_rfc3339("2024-05-06T07:08:09+00:00").unwrap();
        assert_eq!(batch_name("nightly", start), "nightly @ 2024-05-06 07:08:09");
    }

    #[test]
    fn test_resolve_filters() {
        let catalog = StaticCatalog::from(vec![
            PackageInfo::builder().name("sys.app").system(true).launchable(true).build(),
            PackageInfo::builder().name("user.a").launchable(true).build(),
            PackageInfo::builder().name("user.b").build(),
            PackageInfo::builder().name("user.gone").installed(false).build(),
        ]);
        let names = |s: &Schedule| {
            s.resolve(&catalog)
                .into_iter()
                .map(|p| p.name)
                .collect::<Vec<_>>()
        };

        let all = Schedule::builder().name("s").build();
        assert_eq!(names(&all), vec!["sys.app", "user.a", "user.b"]);

        let user = Schedule::builder().name("s").filter(PackageFilter::User).build();
        assert_eq!(names(&user), vec!["user.a", "user.b"]);

        let launchable_user = Schedule::builder()
            .name("s")
            .filter(PackageFilter::User)
            .special_filter(SpecialFilter::Launchable)
            .build();
        assert_eq!(names(&launchable_user), vec!["user.a"]);

        let custom = Schedule::builder()
            .name("s")
            .custom_list(BTreeSet::from(["user.b".to_string(), "user.gone".to_string()]))
            .build();
        assert_eq!(names(&custom), vec!["user.b"]);

        let blocked = Schedule::builder()
            .name("s")
            .block_list(BTreeSet::from(["sys.app".to_string()]))
            .build();
        assert_eq!(names(&blocked), vec!["user.a", "user.b"]);
    }
}
