// src/workdays.rs
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use once_cell::sync::Lazy;
use std::collections::HashSet;

/// Reports whether a calendar date is a legal workday.
///
/// Pure and deterministic for a given date and holiday table; submission
/// decisions must never depend on anything else.
pub trait WorkdayCalendar: Send + Sync {
    fn is_workday(&self, date: NaiveDate) -> bool;
}

// Statutory holiday breaks for the covered years, one entry per break as
// (first day, length in days). Weekend days are excluded unconditionally in
// `is_workday`, so shifted makeup weekends need no entries here.
const STATUTORY_BREAKS: &[(i32, u32, u32, u64)] = &[
    // 2024
    (2024, 1, 1, 1),   // New Year
    (2024, 2, 10, 8),  // Spring Festival
    (2024, 4, 4, 3),   // Qingming
    (2024, 5, 1, 5),   // Labour Day
    (2024, 6, 8, 3),   // Dragon Boat
    (2024, 9, 15, 3),  // Mid-Autumn
    (2024, 10, 1, 7),  // National Day
    // 2025
    (2025, 1, 1, 1),
    (2025, 1, 28, 8),
    (2025, 4, 4, 3),
    (2025, 5, 1, 5),
    (2025, 5, 31, 3),
    (2025, 10, 1, 8),  // National Day week absorbs Mid-Autumn
    // 2026
    (2026, 1, 1, 1),
    (2026, 2, 16, 7),
    (2026, 4, 4, 3),
    (2026, 5, 1, 5),
    (2026, 6, 19, 3),
    (2026, 9, 25, 3),
    (2026, 10, 1, 7),
];

static STATUTORY_HOLIDAYS: Lazy<HashSet<NaiveDate>> = Lazy::new(|| {
    let mut dates = HashSet::new();
    for &(year, month, day, len) in STATUTORY_BREAKS {
        if let Some(first) = NaiveDate::from_ymd_opt(year, month, day) {
            for offset in 0..len {
                dates.insert(first + Duration::days(offset as i64));
            }
        }
    }
    dates
});

/// Workday calendar for the portal's jurisdiction: weekends plus the
/// statutory holiday table, optionally extended with per-deployment dates
/// (company closure days and the like).
pub struct HolidayCalendar {
    extra_holidays: HashSet<NaiveDate>,
}

impl HolidayCalendar {
    pub fn new() -> Self {
        Self {
            extra_holidays: HashSet::new(),
        }
    }

    pub fn with_extra_holidays<I>(dates: I) -> Self
    where
        I: IntoIterator<Item = NaiveDate>,
    {
        Self {
            extra_holidays: dates.into_iter().collect(),
        }
    }

    fn is_holiday(&self, date: NaiveDate) -> bool {
        STATUTORY_HOLIDAYS.contains(&date) || self.extra_holidays.contains(&date)
    }
}

impl Default for HolidayCalendar {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkdayCalendar for HolidayCalendar {
    fn is_workday(&self, date: NaiveDate) -> bool {
        if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        !self.is_holiday(date)
    }
}

/// Candidate dates for backfill: the `horizon_days` calendar days strictly
/// before `today`, filtered to workdays, most recent first.
///
/// Today itself is never a candidate — the portal keeps a same-day edit
/// window open for hours already reported, and submissions must not disturb
/// it. The ordering is load-bearing: the submitter reports its date range
/// from the first and last entries of this sequence.
pub fn candidate_window(
    today: NaiveDate,
    horizon_days: u32,
    calendar: &dyn WorkdayCalendar,
) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    for offset in 1..=i64::from(horizon_days) {
        let date = today - Duration::days(offset);
        if calendar.is_workday(date) {
            dates.push(date);
        }
    }
    dates
}
