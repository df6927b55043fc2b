//! Scheduled execution gates.
//!
//! Gates block execution until a wall-clock or elapsed-time condition is
//! satisfied. Connection pools compose them in order: daily, then interval.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use rand::Rng;

use crate::error::{FetchError, Result};

/// Gate that only allows execution at a specific time of day.
pub struct DailyGate {
    time_of_day: NaiveTime,
    tz: Tz,
    startup_skip_if_already_today: bool,
    last_execution_date: Mutex<Option<NaiveDate>>,
}

impl DailyGate {
    /// `time_of_day` is "HH:MM"; `tz` is an IANA zone name.
    pub fn new(time_of_day: &str, tz: &str, startup_skip_if_already_today: bool) -> Result<Self> {
        let time_of_day = NaiveTime::parse_from_str(time_of_day, "%H:%M")
            .map_err(|e| FetchError::validation("time_of_day", format!("expected HH:MM: {e}")))?;
        let tz = Tz::from_str(tz)
            .map_err(|e| FetchError::validation("tz", format!("unknown timezone: {e}")))?;
        Ok(DailyGate {
            time_of_day,
            tz,
            startup_skip_if_already_today,
            last_execution_date: Mutex::new(None),
        })
    }

    /// Wait until the next occurrence of the configured time of day.
    /// Returns immediately if the gate already fired today and
    /// `startup_skip_if_already_today` is set.
    pub async fn wait_if_needed(&self) {
        let now = Utc::now().with_timezone(&self.tz);
        let today = now.date_naive();

        if self.startup_skip_if_already_today && *self.last_execution_date.lock() == Some(today) {
            return;
        }

        let target = next_occurrence(now, self.time_of_day);
        let wait = (target - now).to_std().unwrap_or(Duration::ZERO);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        *self.last_execution_date.lock() = Some(today);
    }
}

/// Next wall-clock occurrence of `target` at or after `now`, rolling to the
/// following day with calendar-correct arithmetic when the time has passed.
pub(crate) fn next_occurrence(now: DateTime<Tz>, target: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    let today_target = resolve_local(tz, now.date_naive(), target);
    if today_target > now {
        return today_target;
    }
    let tomorrow = now
        .date_naive()
        .checked_add_days(Days::new(1))
        .unwrap_or(now.date_naive());
    resolve_local(tz, tomorrow, target)
}

// DST gaps make some local times nonexistent; shift forward an hour in that
// case, and take the earlier instant when the local time is ambiguous.
fn resolve_local(tz: Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Tz> {
    let naive = date.and_time(time);
    match naive.and_local_timezone(tz) {
        chrono::LocalResult::Single(dt) => dt,
        chrono::LocalResult::Ambiguous(earliest, _) => earliest,
        chrono::LocalResult::None => (naive + chrono::Duration::hours(1))
            .and_local_timezone(tz)
            .earliest()
            .unwrap_or_else(|| Utc::now().with_timezone(&tz)),
    }
}

/// Gate that only allows execution once per interval, with optional jitter
/// added to the wait. The first call never sleeps.
pub struct IntervalGate {
    interval: Duration,
    jitter: Duration,
    last_execution: tokio::sync::Mutex<Option<tokio::time::Instant>>,
}

impl IntervalGate {
    pub fn new(interval: Duration, jitter: Duration) -> Self {
        IntervalGate {
            interval,
            jitter,
            last_execution: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn wait_if_needed(&self) {
        let mut last = self.last_execution.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.interval {
                let mut wait = self.interval - elapsed;
                if !self.jitter.is_zero() {
                    let jitter_secs = rand::thread_rng().gen_range(0.0..self.jitter.as_secs_f64());
                    wait += Duration::from_secs_f64(jitter_secs);
                }
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(tokio::time::Instant::now());
    }
}
