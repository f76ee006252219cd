//! Schedule kinds and next-due computation.

use std::mem;
use std::time::Duration as StdDuration;

use chrono::{
  DateTime, Datelike, Duration as ChronoDuration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday,
};
use chrono_tz::Tz;
use rand::Rng;

use crate::error::SchedulerError;

/// Upper bound on how many local days the calendar search walks before
/// concluding a schedule has no further occurrence.
const MAX_CALENDAR_SEARCH_DAYS: u32 = 400;

/// When a job is due. Exactly one kind is active per job, and the kind cannot
/// change for the lifetime of the job.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Schedule {
  /// Fire once at an absolute instant. An instant already in the past fires
  /// immediately.
  Once(DateTime<Utc>),
  /// Fire every `interval`, starting one interval after registration.
  FixedInterval(StdDuration),
  /// Fire after an interval drawn uniformly from `[min, max)`, re-drawn for
  /// every run.
  RandomInterval { min: StdDuration, max: StdDuration },
  /// Fire according to a cron expression.
  ///
  /// Six or seven field expressions (with seconds, optional year) are used
  /// as-is. Classic five field expressions run at second zero and number
  /// weekdays from `0` = Sunday. The expression
  /// is evaluated in `timezone`, or in the scheduler's timezone when `None`.
  #[cfg(feature = "cron_schedule")]
  Cron {
    expression: String,
    timezone: Option<Tz>,
  },
  /// Fire every day at each of `times` (scheduler timezone).
  Daily { times: Vec<NaiveTime> },
  /// Fire on each of `days` at each of `times` (scheduler timezone).
  Weekly {
    days: Vec<Weekday>,
    times: Vec<NaiveTime>,
  },
  /// Fire on each of `days` of the month at each of `times` (scheduler timezone).
  ///
  /// Days are `1..=31`, or `-1..=-31` counting back from the end of the month
  /// (`-1` is the last day). Months without a given day are skipped.
  Monthly { days: Vec<i32>, times: Vec<NaiveTime> },
}

impl Schedule {
  /// A short lowercase name for the schedule kind, used in logs and errors.
  pub fn kind_name(&self) -> &'static str {
    match self {
      Schedule::Once(_) => "once",
      Schedule::FixedInterval(_) => "fixed_interval",
      Schedule::RandomInterval { .. } => "random_interval",
      #[cfg(feature = "cron_schedule")]
      Schedule::Cron { .. } => "cron",
      Schedule::Daily { .. } => "daily",
      Schedule::Weekly { .. } => "weekly",
      Schedule::Monthly { .. } => "monthly",
    }
  }

  /// Whether `other` is the same schedule kind (parameters may differ).
  pub fn same_kind(&self, other: &Schedule) -> bool {
    mem::discriminant(self) == mem::discriminant(other)
  }

  /// Checks that the schedule can produce due instants.
  pub fn validate(&self) -> Result<(), SchedulerError> {
    match self {
      Schedule::Once(_) => Ok(()),
      Schedule::FixedInterval(interval) => {
        if interval.is_zero() {
          return Err(invalid("fixed interval must be greater than zero"));
        }
        to_chrono(*interval).map(|_| ())
      }
      Schedule::RandomInterval { min, max } => {
        if min.is_zero() || min >= max {
          return Err(invalid(format!(
            "random interval requires 0 < min < max (got min={:?}, max={:?})",
            min, max
          )));
        }
        to_chrono(*max).map(|_| ())
      }
      #[cfg(feature = "cron_schedule")]
      Schedule::Cron { expression, .. } => parse_cron(expression).map(|_| ()),
      Schedule::Daily { times } => require_times(times),
      Schedule::Weekly { days, times } => {
        if days.is_empty() {
          return Err(invalid("weekly schedule requires at least one weekday"));
        }
        require_times(times)
      }
      Schedule::Monthly { days, times } => {
        if days.is_empty() {
          return Err(invalid("monthly schedule requires at least one day"));
        }
        if let Some(bad) = days.iter().find(|d| **d == 0 || d.abs() > 31) {
          return Err(invalid(format!(
            "month day {} out of range (expected 1..=31 or -31..=-1)",
            bad
          )));
        }
        require_times(times)
      }
    }
  }

  /// The first due instant for a job registered at `now`.
  ///
  /// `tz` is the scheduler's timezone, used by calendar kinds.
  pub(crate) fn first_due(&self, now: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
    match self {
      Schedule::Once(at) => Some(if *at > now { *at } else { now }),
      Schedule::FixedInterval(interval) => add_interval(now, *interval),
      Schedule::RandomInterval { min, max } => add_interval(now, sample_interval(*min, *max)),
      _ => self.next_calendar(now, tz),
    }
  }

  /// The due instant following a run that was due at `reference`, evaluated
  /// at `now`.
  ///
  /// Missed ticks are never replayed: if the natural successor of `reference`
  /// is not after `now`, the cadence restarts from `now`. Returns `None` when
  /// the schedule is exhausted.
  pub(crate) fn next_due(
    &self,
    reference: DateTime<Utc>,
    now: DateTime<Utc>,
    tz: Tz,
  ) -> Option<DateTime<Utc>> {
    match self {
      Schedule::Once(_) => None,
      Schedule::FixedInterval(interval) => resume_interval(reference, now, *interval),
      Schedule::RandomInterval { min, max } => {
        resume_interval(reference, now, sample_interval(*min, *max))
      }
      _ => self.next_calendar(reference.max(now), tz),
    }
  }

  /// Up to `count` due instants starting with `from` and following the
  /// schedule's cadence from there.
  ///
  /// Random intervals are sampled, so their preview is only indicative.
  pub fn preview(&self, from: DateTime<Utc>, count: usize, tz: Tz) -> Vec<DateTime<Utc>> {
    let mut runs = Vec::with_capacity(count);
    let mut current = Some(from);
    while let Some(at) = current {
      if runs.len() >= count {
        break;
      }
      runs.push(at);
      current = self.next_due(at, at, tz);
    }
    runs
  }

  /// Next occurrence strictly after `after` for cron and calendar kinds.
  fn next_calendar(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
    match self {
      #[cfg(feature = "cron_schedule")]
      Schedule::Cron { expression, timezone } => {
        let schedule = parse_cron(expression).ok()?;
        let zone = timezone.unwrap_or(tz);
        schedule
          .after(&after.with_timezone(&zone))
          .next()
          .map(|dt| dt.with_timezone(&Utc))
      }
      Schedule::Daily { times } => next_local_occurrence(times, after, tz, |_| true),
      Schedule::Weekly { days, times } => {
        next_local_occurrence(times, after, tz, |date| days.contains(&date.weekday()))
      }
      Schedule::Monthly { days, times } => {
        next_local_occurrence(times, after, tz, |date| month_day_matches(date, days))
      }
      Schedule::Once(_) | Schedule::FixedInterval(_) | Schedule::RandomInterval { .. } => None,
    }
  }
}

fn invalid(message: impl Into<String>) -> SchedulerError {
  SchedulerError::InvalidSchedule(message.into())
}

fn require_times(times: &[NaiveTime]) -> Result<(), SchedulerError> {
  if times.is_empty() {
    Err(invalid("at least one time of day is required"))
  } else {
    Ok(())
  }
}

fn to_chrono(interval: StdDuration) -> Result<ChronoDuration, SchedulerError> {
  ChronoDuration::from_std(interval)
    .map_err(|_| invalid(format!("interval {:?} is out of range", interval)))
}

fn add_interval(base: DateTime<Utc>, interval: StdDuration) -> Option<DateTime<Utc>> {
  base.checked_add_signed(ChronoDuration::from_std(interval).ok()?)
}

fn resume_interval(
  reference: DateTime<Utc>,
  now: DateTime<Utc>,
  interval: StdDuration,
) -> Option<DateTime<Utc>> {
  match add_interval(reference, interval) {
    Some(next) if next > now => Some(next),
    _ => add_interval(now, interval),
  }
}

fn sample_interval(min: StdDuration, max: StdDuration) -> StdDuration {
  if min >= max {
    return min;
  }
  rand::thread_rng().gen_range(min..max)
}

#[cfg(feature = "cron_schedule")]
fn parse_cron(expression: &str) -> Result<cron::Schedule, SchedulerError> {
  use std::str::FromStr;

  let trimmed = expression.trim();
  if trimmed.is_empty() {
    return Err(invalid("cron expression is empty"));
  }
  let fields: Vec<&str> = trimmed.split_whitespace().collect();
  let normalized = if let [minute, hour, day, month, weekday] = fields.as_slice() {
    let weekday = classic_weekdays(weekday)
      .map_err(|reason| invalid(format!("cron expression '{}': {}", expression, reason)))?;
    format!("0 {} {} {} {} {}", minute, hour, day, month, weekday)
  } else {
    trimmed.to_string()
  };
  cron::Schedule::from_str(&normalized)
    .map_err(|e| invalid(format!("cron expression '{}': {}", expression, e)))
}

/// Rewrites a classic day-of-week field (0-6 from Sunday, 7 also Sunday) into
/// the 1-7 numbering the `cron` crate uses. Names and wildcards pass through.
#[cfg(feature = "cron_schedule")]
fn classic_weekdays(field: &str) -> Result<String, String> {
  let mut items = Vec::new();
  for item in field.split(',') {
    let (range, step) = match item.split_once('/') {
      Some((range, step)) => (range, Some(step)),
      None => (item, None),
    };
    let suffix = step.map(|s| format!("/{}", s)).unwrap_or_default();

    let Some((start, end)) = range.split_once('-') else {
      match classic_day(range)? {
        Some(day) => items.push(format!("{}{}", shift_day(day), suffix)),
        None => items.push(item.to_string()),
      }
      continue;
    };
    match (classic_day(start)?, classic_day(end)?) {
      (Some(7), Some(7)) => items.push("1".to_string()),
      (Some(start), Some(7)) => {
        items.push(format!("{}-7{}", shift_day(start), suffix));
        // Classic 7 closes the range on Sunday, which is 1 here.
        let step: u32 = step.and_then(|s| s.parse().ok()).unwrap_or(1);
        if start != 0 && step > 0 && (7 - start) % step == 0 {
          items.push("1".to_string());
        }
      }
      (Some(start), Some(end)) => {
        items.push(format!("{}-{}{}", shift_day(start), shift_day(end), suffix))
      }
      _ => items.push(item.to_string()),
    }
  }
  Ok(items.join(","))
}

#[cfg(feature = "cron_schedule")]
fn classic_day(token: &str) -> Result<Option<u32>, String> {
  match token.parse::<u32>() {
    Ok(day) if day <= 7 => Ok(Some(day)),
    Ok(day) => Err(format!("day of week {} is outside 0-7", day)),
    Err(_) => Ok(None),
  }
}

#[cfg(feature = "cron_schedule")]
fn shift_day(day: u32) -> u32 {
  if day == 7 {
    1
  } else {
    day + 1
  }
}

/// Walks local calendar days in `tz` and returns the earliest configured time
/// on a matching day that lies strictly after `after`.
fn next_local_occurrence(
  times: &[NaiveTime],
  after: DateTime<Utc>,
  tz: Tz,
  day_matches: impl Fn(NaiveDate) -> bool,
) -> Option<DateTime<Utc>> {
  if times.is_empty() {
    return None;
  }
  // Start a day early: a DST fall-back can map an instant after `after` onto
  // the previous local date.
  let mut day = after.with_timezone(&tz).date_naive().pred_opt()?;
  for _ in 0..MAX_CALENDAR_SEARCH_DAYS {
    if day_matches(day) {
      let best = times
        .iter()
        .filter_map(|time| resolve_local(tz, day, *time))
        .filter(|instant| *instant > after)
        .min();
      if best.is_some() {
        return best;
      }
    }
    day = day.succ_opt()?;
  }
  None
}

/// Maps a local wall-clock time to UTC. Ambiguous times take the earliest
/// instant; times inside a DST gap move forward by one hour.
fn resolve_local(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
  let naive = date.and_time(time);
  tz.from_local_datetime(&naive)
    .earliest()
    .or_else(|| {
      tz.from_local_datetime(&(naive + ChronoDuration::hours(1)))
        .earliest()
    })
    .map(|dt| dt.with_timezone(&Utc))
}

fn month_day_matches(date: NaiveDate, days: &[i32]) -> bool {
  let day = date.day() as i32;
  let length = days_in_month(date.year(), date.month()) as i32;
  days.iter().any(|&wanted| {
    if wanted > 0 {
      wanted == day
    } else {
      length + wanted + 1 == day
    }
  })
}

fn days_in_month(year: i32, month: u32) -> u32 {
  let (next_year, next_month) = if month == 12 {
    (year + 1, 1)
  } else {
    (year, month + 1)
  };
  NaiveDate::from_ymd_opt(next_year, next_month, 1)
    .and_then(|first| first.pred_opt())
    .map(|last| last.day())
    .unwrap_or(28)
}
