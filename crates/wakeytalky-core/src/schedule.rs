//! Schedule calculator: turns an alarm's time of day and weekdays into
//! concrete trigger instants.
//!
//! All instants are local wall-clock (`NaiveDateTime`); the caller supplies
//! "now". Nothing here reads the clock.

use chrono::{Datelike, Days, NaiveDate, NaiveDateTime, Weekday};
use tracing::warn;

use crate::alarm::{Alarm, AlarmId};
use crate::error::ScheduleError;

/// Next trigger instant strictly after `from`.
///
/// Recurring alarms take the earliest matching weekday; a candidate at or
/// before `from` rolls forward one week. One-shot alarms (no weekdays) ring
/// today if the time is still ahead, otherwise tomorrow.
///
/// Does not look at `enabled`.
pub fn next_trigger(alarm: &Alarm, from: NaiveDateTime) -> Result<NaiveDateTime, ScheduleError> {
    alarm.validate_schedule()?;
    let time = alarm.time.to_naive_time()?;
    let today = from.date();

    if alarm.is_one_shot() {
        let candidate = today.and_time(time);
        if candidate > from {
            return Ok(candidate);
        }
        return add_days(today, 1).map(|d| d.and_time(time));
    }

    let today_ord = weekday_ordinal(today.weekday()) as u64;
    let mut best: Option<NaiveDateTime> = None;
    for &day in &alarm.active_days {
        let offset = (day as u64 + 7 - today_ord) % 7;
        let mut candidate = add_days(today, offset)?.and_time(time);
        if candidate <= from {
            candidate = add_days(candidate.date(), 7)?.and_time(time);
        }
        best = Some(match best {
            Some(b) if b <= candidate => b,
            _ => candidate,
        });
    }
    best.ok_or_else(|| ScheduleError::invalid("active_days", "no weekdays to schedule"))
}

/// The next `count` trigger instants, in order. A one-shot alarm yields at
/// most one.
pub fn upcoming(alarm: &Alarm, from: NaiveDateTime, count: usize) -> Result<Vec<NaiveDateTime>, ScheduleError> {
    let mut out = Vec::with_capacity(count);
    let mut cursor = from;
    while out.len() < count {
        let next = next_trigger(alarm, cursor)?;
        out.push(next);
        if alarm.is_one_shot() {
            break;
        }
        cursor = next;
    }
    Ok(out)
}

/// Earliest trigger across enabled alarms. Invalid alarms are skipped.
pub fn next_enabled_trigger<'a>(
    alarms: impl IntoIterator<Item = &'a Alarm>,
    from: NaiveDateTime,
) -> Option<(AlarmId, NaiveDateTime)> {
    alarms
        .into_iter()
        .filter(|a| a.enabled)
        .filter_map(|a| match next_trigger(a, from) {
            Ok(at) => Some((a.id.clone(), at)),
            Err(e) => {
                warn!(alarm_id = %a.id, error = %e, "skipping unschedulable alarm");
                None
            }
        })
        .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)))
}

fn add_days(date: NaiveDate, days: u64) -> Result<NaiveDate, ScheduleError> {
    date.checked_add_days(Days::new(days))
        .ok_or_else(|| ScheduleError::invalid("from", "date out of range"))
}

/// 0 = Sunday .. 6 = Saturday.
pub fn weekday_ordinal(day: Weekday) -> u8 {
    day.num_days_from_sunday() as u8
}

pub fn weekday_from_ordinal(ordinal: u8) -> Option<Weekday> {
    match ordinal {
        0 => Some(Weekday::Sun),
        1 => Some(Weekday::Mon),
        2 => Some(Weekday::Tue),
        3 => Some(Weekday::Wed),
        4 => Some(Weekday::Thu),
        5 => Some(Weekday::Fri),
        6 => Some(Weekday::Sat),
        _ => None,
    }
}

/// Parse a weekday name or ordinal into its 0-6 ordinal.
pub fn parse_weekday(value: &str) -> Option<u8> {
    let day = match value.trim().to_ascii_lowercase().as_str() {
        "sun" | "sunday" | "0" => Weekday::Sun,
        "mon" | "monday" | "1" => Weekday::Mon,
        "tue" | "tues" | "tuesday" | "2" => Weekday::Tue,
        "wed" | "wednesday" | "3" => Weekday::Wed,
        "thu" | "thurs" | "thursday" | "4" => Weekday::Thu,
        "fri" | "friday" | "5" => Weekday::Fri,
        "sat" | "saturday" | "6" => Weekday::Sat,
        _ => return None,
    };
    Some(weekday_ordinal(day))
}

/// Comma-separated list of weekdays, or one of `daily`, `weekdays`, `weekends`.
/// An empty string is a one-shot alarm.
pub fn parse_weekday_list(value: &str) -> Result<Vec<u8>, ScheduleError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "once" => return Ok(Vec::new()),
        "daily" | "everyday" => return Ok((0..=6).collect()),
        "weekdays" => return Ok((1..=5).collect()),
        "weekends" => return Ok(vec![0, 6]),
        _ => {}
    }
    value
        .split(',')
        .map(|part| {
            parse_weekday(part)
                .ok_or_else(|| ScheduleError::invalid("active_days", format!("unknown weekday '{}'", part.trim())))
        })
        .collect()
}
