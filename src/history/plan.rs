//! Splitting a civil-time range into bounded historical windows

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::config::HistorySettings;
use crate::error::{ClientError, Result};
use crate::types::SecType;

/// One retrieval window, `[start, end)` in UTC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub bar_count: u32,
}

impl HistoryWindow {
    /// Request parameters for this window
    pub fn request(&self, settings: &HistorySettings, sec_type: SecType) -> HistoricalRequest {
        HistoricalRequest {
            end_time: self.end.format("%Y%m%d %H:%M:%S UTC").to_string(),
            duration: format!("{} S", self.bar_count as u64 * settings.bar_size_secs as u64),
            bar_size: settings.bar_size_setting(),
            what_to_show: settings.what_to_show(sec_type).to_string(),
            use_rth: settings.use_rth,
            date_format: settings.date_format,
        }
    }
}

/// Gateway parameters for one historical data call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalRequest {
    /// `yyyymmdd hh:mm:ss UTC`
    pub end_time: String,
    /// `<seconds> S`
    pub duration: String,
    /// `<n> secs`
    pub bar_size: String,
    pub what_to_show: String,
    pub use_rth: bool,
    pub date_format: i32,
}

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| ClientError::InvalidTimezone(name.to_string()))
}

/// Parse `yyyy-mm-dd hh:mm` (seconds optional)
pub fn parse_civil(value: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S"))
        .map_err(|e| ClientError::InvalidRange(format!("{}: {}", value, e)))
}

/// Cut `[start, end)` (civil time in `tz`) into windows.
///
/// Only weekdays are kept. Each day is intersected with the session
/// `[session_start, session_end)`; a session end at or before its start runs
/// to midnight. Windows hold at most `settings.max_block_bars` bars and come
/// out in chronological order.
pub fn plan_windows(
    start: NaiveDateTime,
    end: NaiveDateTime,
    tz: Tz,
    session_start: NaiveTime,
    session_end: NaiveTime,
    settings: &HistorySettings,
) -> Result<Vec<HistoryWindow>> {
    let mut windows = Vec::new();
    if end <= start {
        return Ok(windows);
    }

    let bar_secs = i64::from(settings.bar_size_secs.max(1));
    let max_bars = i64::from(settings.max_block_bars.max(1));

    let mut day = start.date();
    while day <= end.date() {
        if is_weekday(day) {
            let open = day.and_time(session_start);
            let close = if session_end > session_start {
                day.and_time(session_end)
            } else {
                next_midnight(day)
            };

            let lo = open.max(start);
            let hi = close.min(end);
            if lo < hi {
                let lo = to_utc(tz, lo)?;
                let hi = to_utc(tz, hi)?;
                cut_day(lo, hi, bar_secs, max_bars, &mut windows);
            }
        }
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }

    Ok(windows)
}

fn cut_day(lo: DateTime<Utc>, hi: DateTime<Utc>, bar_secs: i64, max_bars: i64, out: &mut Vec<HistoryWindow>) {
    let span = (hi - lo).num_seconds();
    let mut bars_left = (span + bar_secs - 1) / bar_secs;
    let mut cursor = lo;
    while bars_left > 0 {
        let bars = bars_left.min(max_bars);
        let block_end = cursor + Duration::seconds(bars * bar_secs);
        out.push(HistoryWindow {
            start: cursor,
            end: block_end,
            bar_count: bars as u32,
        });
        cursor = block_end;
        bars_left -= bars;
    }
}

fn is_weekday(day: NaiveDate) -> bool {
    !matches!(day.weekday(), Weekday::Sat | Weekday::Sun)
}

fn next_midnight(day: NaiveDate) -> NaiveDateTime {
    let next = day.succ_opt().unwrap_or(day);
    next.and_time(NaiveTime::MIN)
}

/// Civil time to UTC. Ambiguous times take the earlier instant; times in a
/// spring-forward gap are moved forward an hour.
fn to_utc(tz: Tz, civil: NaiveDateTime) -> Result<DateTime<Utc>> {
    let resolved = match tz.from_local_datetime(&civil) {
        LocalResult::Single(t) => Some(t),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => tz.from_local_datetime(&(civil + Duration::hours(1))).earliest(),
    };
    resolved
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| ClientError::InvalidRange(format!("{} does not exist in {}", civil, tz)))
}
