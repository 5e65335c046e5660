use chrono::{Local, TimeZone};

const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// Day key format persisted alongside each credit record
pub const DAY_KEY_FORMAT: &str = "%d.%m.%Y";

/// Source of the current time and of calendar-day boundaries
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_millis(&self) -> i64;

    /// Epoch milliseconds of the midnight that starts the day containing `now`
    fn day_start_millis(&self, now: i64) -> i64;

    /// Key identifying the calendar day containing `now`
    fn day_key(&self, now: i64) -> String;
}

/// Wall clock in the machine's local time zone
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Local::now().timestamp_millis()
    }

    fn day_start_millis(&self, now: i64) -> i64 {
        day_start_in(&Local, now)
    }

    fn day_key(&self, now: i64) -> String {
        day_key_in(&Local, now)
    }
}

pub(crate) fn day_start_in<Tz: TimeZone>(tz: &Tz, now: i64) -> i64 {
    tz.timestamp_millis_opt(now)
        .earliest()
        .and_then(|dt| dt.date_naive().and_hms_opt(0, 0, 0))
        .and_then(|midnight| tz.from_local_datetime(&midnight).earliest())
        .map(|dt| dt.timestamp_millis())
        // Midnight can be skipped by a DST jump; fall back to the UTC day.
        .unwrap_or_else(|| now - now.rem_euclid(DAY_MILLIS))
}

pub(crate) fn day_key_in<Tz: TimeZone>(tz: &Tz, now: i64) -> String
where
    Tz::Offset: std::fmt::Display,
{
    match tz.timestamp_millis_opt(now).earliest() {
        Some(dt) => dt.format(DAY_KEY_FORMAT).to_string(),
        None => String::from("01.01.1970"),
    }
}
