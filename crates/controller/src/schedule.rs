//! Calendar and schedule arithmetic: recurrence, active months, schedule
//! conflicts and activation-time windows. Everything here is pure.
//!
//! Day counting is done with explicit day-of-year arithmetic rather than a
//! calendar library, so the results match what the controller persisted in
//! `last_run_date` regardless of time zone handling.

use tracing::debug;

use crate::program::{CalendarDate, ClockTime, Program, Recurrence};

pub fn is_leap_year(year: i32) -> bool {
    year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
}

pub fn days_in_month(year: i32, month: u8) -> u8 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if is_leap_year(year) => 29,
        2 => 28,
        _ => 0,
    }
}

fn days_in_year(year: i32) -> i64 {
    if is_leap_year(year) {
        366
    } else {
        365
    }
}

/// 1-based day of the year.
pub fn day_of_year(date: CalendarDate) -> i64 {
    let before: i64 = (1..date.month)
        .map(|m| i64::from(days_in_month(date.year, m)))
        .sum();
    before + i64::from(date.day)
}

/// Whole days from `earlier` to `later`; negative if `later` comes first.
pub fn days_between(earlier: CalendarDate, later: CalendarDate) -> i64 {
    if later < earlier {
        return -days_between(later, earlier);
    }
    if earlier.year == later.year {
        return day_of_year(later) - day_of_year(earlier);
    }
    // Rest of the first year, every full year in between, then into the last.
    let mut days = days_in_year(earlier.year) - day_of_year(earlier);
    for year in (earlier.year + 1)..later.year {
        days += days_in_year(year);
    }
    days + day_of_year(later)
}

/// Whether the recurrence interval since the last run has elapsed.
/// Never-run programs are always due; unknown recurrences never are.
pub fn is_due_today(program: &Program, today: CalendarDate) -> bool {
    let Some(last_run) = program.last_run_date else {
        return true;
    };

    let since = days_between(last_run, today);
    let interval = match program.recurrence {
        Recurrence::Daily => 1,
        Recurrence::EveryOtherDay => 2,
        Recurrence::Custom => i64::from(program.interval_days.unwrap_or(1).max(1)),
        Recurrence::Unknown => return false,
    };

    debug!(
        program = %program.id,
        last_run = %last_run,
        days_since = since,
        interval,
        "due-date evaluation"
    );
    since >= interval
}

pub fn is_active_this_month(program: &Program, month: u8) -> bool {
    program.months.contains(&month)
}

/// Pairwise schedule conflict check.
///
/// Two programs conflict when their month sets intersect and their
/// activation times name the same minute; recurrence is not considered.
/// Returns the message to show the user for the first conflict found.
pub fn check_conflicts<'a>(
    candidate: &Program,
    existing: impl IntoIterator<Item = &'a Program>,
    exclude_id: Option<&str>,
) -> Option<String> {
    if candidate.months.is_empty() || candidate.activation_time.is_empty() {
        return None;
    }

    existing
        .into_iter()
        .filter(|p| Some(p.id.as_str()) != exclude_id)
        .find(|p| {
            same_time(&p.activation_time, &candidate.activation_time)
                && !p.months.is_disjoint(&candidate.months)
        })
        .map(|p| {
            format!(
                "conflicts with '{}' in the selected months at {}",
                p.name, p.activation_time
            )
        })
}

/// Equal as clock times when both parse, otherwise as strings.
fn same_time(a: &str, b: &str) -> bool {
    match (a.parse::<ClockTime>(), b.parse::<ClockTime>()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// How the current minute lined up with a program's activation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeMatch {
    Exact,
    /// One minute before the activation time; covers a poll that would
    /// otherwise straddle the activation minute.
    OneMinuteEarly,
    /// `hh:59` against an activation time of `(hh+1):00`.
    HourBoundary,
}

pub fn match_activation_time(now: ClockTime, activation: ClockTime) -> Option<TimeMatch> {
    let (h, m) = (i16::from(now.hour), i16::from(now.minute));
    let (ah, am) = (i16::from(activation.hour), i16::from(activation.minute));

    if h == ah && m == am {
        Some(TimeMatch::Exact)
    } else if h == ah && m == am - 1 {
        Some(TimeMatch::OneMinuteEarly)
    } else if am == 0 && m == 59 && h == ah - 1 {
        Some(TimeMatch::HourBoundary)
    } else {
        None
    }
}

// ===========================================================================
// Tests
// ===========================================================================
