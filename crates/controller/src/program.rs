//! Watering programs as persisted in `programs.json`.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const MAX_NAME_LEN: usize = 16;

/// One zone activation inside a program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub zone_id: u8,
    pub duration_min: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Recurrence {
    Daily,
    EveryOtherDay,
    /// Every `interval_days` days.
    Custom,
    /// Anything this firmware does not recognise. Never due.
    #[serde(other)]
    Unknown,
}

/// A date as the firmware stores it: `YYYY-MM-DD`, no time zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CalendarDate {
    pub year: i32,
    pub month: u8,
    pub day: u8,
}

impl CalendarDate {
    pub fn new(year: i32, month: u8, day: u8) -> Option<Self> {
        let date = Self { year, month, day };
        let valid = (1..=12).contains(&month)
            && day >= 1
            && day <= crate::schedule::days_in_month(year, month);
        valid.then_some(date)
    }

    /// Today's date in the controller's local time zone, falling back to UTC
    /// when the local offset cannot be determined.
    pub fn today() -> Self {
        let now = time::OffsetDateTime::now_local()
            .unwrap_or_else(|_| time::OffsetDateTime::now_utc());
        Self::from(now.date())
    }
}

impl From<time::Date> for CalendarDate {
    fn from(d: time::Date) -> Self {
        Self {
            year: d.year(),
            month: d.month() as u8,
            day: d.day(),
        }
    }
}

impl fmt::Display for CalendarDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

impl FromStr for CalendarDate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, '-');
        let mut next = || parts.next().ok_or_else(|| format!("invalid date '{s}'"));
        let year = next()?.parse::<i32>().map_err(|e| format!("invalid year in '{s}': {e}"))?;
        let month = next()?.parse::<u8>().map_err(|e| format!("invalid month in '{s}': {e}"))?;
        let day = next()?.parse::<u8>().map_err(|e| format!("invalid day in '{s}': {e}"))?;
        Self::new(year, month, day).ok_or_else(|| format!("date out of range '{s}'"))
    }
}

impl TryFrom<String> for CalendarDate {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<CalendarDate> for String {
    fn from(d: CalendarDate) -> Self {
        d.to_string()
    }
}

/// Wall-clock `HH:MM` parsed from an activation time string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockTime {
    pub hour: u8,
    pub minute: u8,
}

impl FromStr for ClockTime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (h, m) = s
            .split_once(':')
            .ok_or_else(|| format!("invalid time '{s}', expected HH:MM"))?;
        let digits = |part: &str, len: std::ops::RangeInclusive<usize>| {
            len.contains(&part.len()) && part.bytes().all(|b| b.is_ascii_digit())
        };
        if !digits(h, 1..=2) || !digits(m, 2..=2) {
            return Err(format!("invalid time '{s}', expected HH:MM"));
        }
        let hour: u8 = h.parse().map_err(|_| format!("invalid hour in '{s}'"))?;
        let minute: u8 = m.parse().map_err(|_| format!("invalid minute in '{s}'"))?;
        if hour > 23 || minute > 59 {
            return Err(format!("time out of range '{s}'"));
        }
        Ok(Self { hour, minute })
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub steps: Vec<Step>,
    /// Active months, 1 = January.
    pub months: BTreeSet<u8>,
    /// `HH:MM`, zero-padded once validated.
    pub activation_time: String,
    pub recurrence: Recurrence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_days: Option<u32>,
    #[serde(default = "default_automation")]
    pub automation_enabled: bool,
    #[serde(default)]
    pub last_run_date: Option<CalendarDate>,
}

fn default_automation() -> bool {
    true
}

/// The editable part of a program, as submitted on create and update.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProgramDraft {
    pub name: String,
    pub steps: Vec<Step>,
    pub months: BTreeSet<u8>,
    pub activation_time: String,
    pub recurrence: Recurrence,
    #[serde(default)]
    pub interval_days: Option<u32>,
}

impl ProgramDraft {
    pub fn into_program(self, id: String) -> Program {
        Program {
            id,
            name: self.name.trim().to_string(),
            steps: self.steps,
            months: self.months,
            activation_time: self.activation_time,
            recurrence: self.recurrence,
            interval_days: self.interval_days,
            automation_enabled: true,
            last_run_date: None,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
