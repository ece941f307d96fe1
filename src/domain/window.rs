//! Reboot window calculus.
//!
//! A window is `[Day ]HH:MM-HH:MM` in local wall-clock time. The day is
//! optional; without it the window recurs every day. An end before the start
//! spans midnight.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Duration, NaiveDateTime, NaiveTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowParseError {
    #[error("invalid reboot window '{0}' (expected 'Day HH:MM-HH:MM' or 'HH:MM-HH:MM')")]
    Format(String),
    #[error("unknown day '{0}' (expected Sun, Mon, Tue, Wed, Thu, Fri or Sat)")]
    Day(String),
    #[error("invalid hour '{0}' (must be 0-23)")]
    Hour(String),
    #[error("invalid minute '{0}' (must be 0-59)")]
    Minute(String),
}

/// A recurring span during which automatic reboots are permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RebootWindow {
    pub day: Option<Weekday>,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl RebootWindow {
    pub fn is_overnight(&self) -> bool {
        self.end < self.start
    }

    /// Whether `now` falls inside this window.
    pub fn contains(&self, now: NaiveDateTime) -> bool {
        if let Some(day) = self.day {
            if now.weekday() != day {
                return false;
            }
        }

        let current = minute_of_day(now.time());
        let start = minute_of_day(self.start);
        let end = minute_of_day(self.end);

        if end < start {
            current >= start || current < end
        } else {
            current >= start && current < end
        }
    }

    /// The first window start at or after `from`.
    pub fn next_start(&self, from: NaiveDateTime) -> NaiveDateTime {
        let mut start = from.date().and_time(self.start);
        if from > start {
            start += Duration::days(1);
        }
        if let Some(day) = self.day {
            while start.weekday() != day {
                start += Duration::days(1);
            }
        }
        start
    }
}

/// An absent window imposes no restriction.
pub fn is_in_window(window: Option<&RebootWindow>, now: NaiveDateTime) -> bool {
    window.map_or(true, |w| w.contains(now))
}

pub fn next_window_start(window: Option<&RebootWindow>, from: NaiveDateTime) -> NaiveDateTime {
    window.map_or(from, |w| w.next_start(from))
}

fn minute_of_day(t: NaiveTime) -> u32 {
    t.hour() * 60 + t.minute()
}

fn parse_day(token: &str) -> Result<Weekday, WindowParseError> {
    let day = match token.to_ascii_lowercase().as_str() {
        "sun" => Weekday::Sun,
        "mon" => Weekday::Mon,
        "tue" => Weekday::Tue,
        "wed" => Weekday::Wed,
        "thu" => Weekday::Thu,
        "fri" => Weekday::Fri,
        "sat" => Weekday::Sat,
        _ => return Err(WindowParseError::Day(token.to_string())),
    };
    Ok(day)
}

fn parse_clock(raw: &str, whole: &str) -> Result<NaiveTime, WindowParseError> {
    let (hour, minute) = raw
        .split_once(':')
        .ok_or_else(|| WindowParseError::Format(whole.to_string()))?;

    let digits = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    if !digits(hour) || hour.len() > 2 || !digits(minute) || minute.len() != 2 {
        return Err(WindowParseError::Format(whole.to_string()));
    }

    let h: u32 = hour
        .parse()
        .map_err(|_| WindowParseError::Hour(hour.to_string()))?;
    if h > 23 {
        return Err(WindowParseError::Hour(hour.to_string()));
    }
    let m: u32 = minute
        .parse()
        .map_err(|_| WindowParseError::Minute(minute.to_string()))?;
    if m > 59 {
        return Err(WindowParseError::Minute(minute.to_string()));
    }

    NaiveTime::from_hms_opt(h, m, 0).ok_or_else(|| WindowParseError::Format(whole.to_string()))
}

impl FromStr for RebootWindow {
    type Err = WindowParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let mut parts = trimmed.split_whitespace();
        let (day, range) = match (parts.next(), parts.next(), parts.next()) {
            (Some(range), None, None) => (None, range),
            (Some(day), Some(range), None) => (Some(parse_day(day)?), range),
            _ => return Err(WindowParseError::Format(s.to_string())),
        };

        let (start, end) = range
            .split_once('-')
            .ok_or_else(|| WindowParseError::Format(s.to_string()))?;

        Ok(RebootWindow {
            day,
            start: parse_clock(start, s)?,
            end: parse_clock(end, s)?,
        })
    }
}

impl TryFrom<String> for RebootWindow {
    type Error = WindowParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RebootWindow> for String {
    fn from(window: RebootWindow) -> Self {
        window.to_string()
    }
}

impl fmt::Display for RebootWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(day) = self.day {
            write!(f, "{} ", day)?;
        }
        write!(
            f,
            "{}-{}",
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, hh: u32, mm: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .and_then(|date| date.and_hms_opt(hh, mm, 0))
            .unwrap()
    }

    // 2026-10-17 is a Saturday, 2026-10-18 a Sunday.

    #[test]
    fn parses_day_scoped_window() {
        let w: RebootWindow = "Sun 02:00-04:00".parse().unwrap();
        assert_eq!(w.day, Some(Weekday::Sun));
        assert_eq!(w.start, NaiveTime::from_hms_opt(2, 0, 0).unwrap());
        assert_eq!(w.end, NaiveTime::from_hms_opt(4, 0, 0).unwrap());
        assert_eq!(w.to_string(), "Sun 02:00-04:00");
    }

    #[test]
    fn parses_daily_window_with_single_digit_hour() {
        let w: RebootWindow = "2:30-5:00".parse().unwrap();
        assert_eq!(w.day, None);
        assert_eq!(w.to_string(), "02:30-05:00");
    }

    #[test]
    fn rejects_bad_windows() {
        assert_eq!(
            "24:00-02:00".parse::<RebootWindow>(),
            Err(WindowParseError::Hour("24".into()))
        );
        assert_eq!(
            "02:60-03:00".parse::<RebootWindow>(),
            Err(WindowParseError::Minute("60".into()))
        );
        assert_eq!(
            "Funday 02:00-03:00".parse::<RebootWindow>(),
            Err(WindowParseError::Day("Funday".into()))
        );
        assert!(matches!(
            "02:00".parse::<RebootWindow>(),
            Err(WindowParseError::Format(_))
        ));
        assert!(matches!(
            "Sun 02:00 - 04:00".parse::<RebootWindow>(),
            Err(WindowParseError::Format(_))
        ));
        assert!(matches!(
            "".parse::<RebootWindow>(),
            Err(WindowParseError::Format(_))
        ));
    }

    #[test]
    fn day_scoped_membership() {
        let w: RebootWindow = "Sun 02:00-04:00".parse().unwrap();
        assert!(!w.contains(at(2026, 10, 17, 3, 0)));
        assert!(w.contains(at(2026, 10, 18, 3, 0)));
        assert!(w.contains(at(2026, 10, 18, 2, 0)));
        assert!(!w.contains(at(2026, 10, 18, 4, 0)));
    }

    #[test]
    fn overnight_membership() {
        let w: RebootWindow = "23:00-02:00".parse().unwrap();
        assert!(w.is_overnight());
        assert!(w.contains(at(2026, 10, 17, 23, 30)));
        assert!(w.contains(at(2026, 10, 18, 1, 0)));
        assert!(!w.contains(at(2026, 10, 18, 12, 0)));
        assert!(!w.contains(at(2026, 10, 18, 2, 0)));
    }

    #[test]
    fn absent_window_is_unrestricted() {
        let now = at(2026, 10, 17, 12, 0);
        assert!(is_in_window(None, now));
        assert_eq!(next_window_start(None, now), now);
    }

    #[test]
    fn next_start_later_today() {
        let w: RebootWindow = "02:00-04:00".parse().unwrap();
        assert_eq!(
            w.next_start(at(2026, 10, 17, 1, 0)),
            at(2026, 10, 17, 2, 0)
        );
    }

    #[test]
    fn next_start_rolls_to_tomorrow_once_passed() {
        let w: RebootWindow = "02:00-04:00".parse().unwrap();
        assert_eq!(
            w.next_start(at(2026, 10, 17, 2, 1)),
            at(2026, 10, 18, 2, 0)
        );
    }

    #[test]
    fn next_start_advances_to_weekday() {
        let w: RebootWindow = "Sun 02:00-04:00".parse().unwrap();
        // Monday noon: next Sunday.
        assert_eq!(
            w.next_start(at(2026, 10, 19, 12, 0)),
            at(2026, 10, 25, 2, 0)
        );
        // Saturday noon: tomorrow.
        assert_eq!(
            w.next_start(at(2026, 10, 17, 12, 0)),
            at(2026, 10, 18, 2, 0)
        );
    }

    #[test]
    fn serde_uses_window_string() {
        let w: RebootWindow = serde_json::from_str("\"Sat 23:00-01:30\"").unwrap();
        assert_eq!(w.day, Some(Weekday::Sat));
        assert_eq!(serde_json::to_string(&w).unwrap(), "\"Sat 23:00-01:30\"");
        assert!(serde_json::from_str::<RebootWindow>("\"Sat 25:00-01:30\"").is_err());
    }
}
