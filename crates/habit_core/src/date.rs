use std::collections::HashMap;
use std::fmt;

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::HabitError;

static DAYS_IN_YEAR: Lazy<RwLock<HashMap<i32, u32>>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// Addresses a single calendar day as `(year, 1-based day of year)`.
///
/// Status records are nested maps keyed by these two numbers, so lookups stay
/// a pair of map indexes instead of timestamp arithmetic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub struct YearAndDay {
    pub year: i32,
    pub day_of_year: u32,
}

impl YearAndDay {
    pub fn new(year: i32, day_of_year: u32) -> Result<Self, HabitError> {
        if day_of_year == 0 || day_of_year > days_in_year(year) {
            return Err(HabitError::InvalidDate { year, day_of_year });
        }
        Ok(Self { year, day_of_year })
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            day_of_year: date.ordinal(),
        }
    }

    pub fn to_date(self) -> Result<NaiveDate, HabitError> {
        NaiveDate::from_yo_opt(self.year, self.day_of_year).ok_or(HabitError::InvalidDate {
            year: self.year,
            day_of_year: self.day_of_year,
        })
    }
}

impl From<NaiveDate> for YearAndDay {
    fn from(date: NaiveDate) -> Self {
        Self::from_date(date)
    }
}

impl fmt::Display for YearAndDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:03}", self.year, self.day_of_year)
    }
}

/// Number of days in `year` according to the proleptic Gregorian calendar.
pub fn days_in_year(year: i32) -> u32 {
    if let Some(days) = DAYS_IN_YEAR.read().get(&year) {
        return *days;
    }
    let days = NaiveDate::from_ymd_opt(year, 12, 31)
        .map(|last| last.ordinal())
        .unwrap_or(365);
    DAYS_IN_YEAR.write().insert(year, days);
    days
}

pub fn previous_day(date: YearAndDay) -> YearAndDay {
    if date.day_of_year > 1 {
        return YearAndDay {
            year: date.year,
            day_of_year: date.day_of_year - 1,
        };
    }
    let year = date.year - 1;
    YearAndDay {
        year,
        day_of_year: days_in_year(year),
    }
}

pub fn next_day(date: YearAndDay) -> YearAndDay {
    if date.day_of_year < days_in_year(date.year) {
        return YearAndDay {
            year: date.year,
            day_of_year: date.day_of_year + 1,
        };
    }
    YearAndDay {
        year: date.year + 1,
        day_of_year: 1,
    }
}

/// Steps back seven days, rolling into the previous year when needed.
pub fn previous_week(date: YearAndDay) -> YearAndDay {
    if date.day_of_year > 7 {
        return YearAndDay {
            year: date.year,
            day_of_year: date.day_of_year - 7,
        };
    }
    let year = date.year - 1;
    YearAndDay {
        year,
        day_of_year: days_in_year(year) + date.day_of_year - 7,
    }
}

pub fn next_week(date: YearAndDay) -> YearAndDay {
    let days = days_in_year(date.year);
    if date.day_of_year + 7 <= days {
        return YearAndDay {
            year: date.year,
            day_of_year: date.day_of_year + 7,
        };
    }
    YearAndDay {
        year: date.year + 1,
        day_of_year: date.day_of_year + 7 - days,
    }
}

/// Monday of the week containing `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

pub fn is_week_start(date: NaiveDate) -> bool {
    date.weekday() == Weekday::Mon
}

/// Key used to address week documents, e.g. `2024-03-04`.
pub fn week_key(start: NaiveDate) -> String {
    start.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    #[test]
    fn days_in_year_follows_the_calendar() {
        assert_eq!(days_in_year(2023), 365);
        assert_eq!(days_in_year(2024), 366);
        assert_eq!(days_in_year(1900), 365);
        assert_eq!(days_in_year(2000), 366);
    }

    #[test]
    fn previous_day_rolls_into_previous_year() {
        let jan_first = YearAndDay::new(2025, 1).unwrap();
        assert_eq!(previous_day(jan_first), YearAndDay::new(2024, 366).unwrap());
        let jan_first_2024 = YearAndDay::new(2024, 1).unwrap();
        assert_eq!(previous_day(jan_first_2024), YearAndDay::new(2023, 365).unwrap());
    }

    #[test]
    fn next_day_rolls_into_next_year() {
        assert_eq!(
            next_day(YearAndDay::new(2024, 366).unwrap()),
            YearAndDay::new(2025, 1).unwrap()
        );
        assert_eq!(
            next_day(YearAndDay::new(2023, 365).unwrap()),
            YearAndDay::new(2024, 1).unwrap()
        );
        assert_eq!(
            next_day(YearAndDay::new(2024, 365).unwrap()),
            YearAndDay::new(2024, 366).unwrap()
        );
    }

    #[test]
    fn day_steps_round_trip_across_boundaries() {
        let samples = [
            (2023, 1),
            (2023, 365),
            (2024, 1),
            (2024, 59),
            (2024, 60),
            (2024, 366),
            (1999, 200),
            (2100, 365),
        ];
        for (year, day) in samples {
            let date = YearAndDay::new(year, day).unwrap();
            assert_eq!(next_day(previous_day(date)), date, "{date}");
            assert_eq!(previous_day(next_day(date)), date, "{date}");
        }
    }

    #[test]
    fn day_steps_agree_with_chrono() {
        let mut date = ymd(2023, 12, 20);
        let mut addressed = YearAndDay::from(date);
        for _ in 0..400 {
            date = date.succ_opt().unwrap();
            addressed = next_day(addressed);
            assert_eq!(addressed, YearAndDay::from(date));
        }
    }

    #[test]
    fn previous_week_steps_seven_days_across_year_end() {
        let jan_third_2025 = YearAndDay::from(ymd(2025, 1, 3));
        assert_eq!(previous_week(jan_third_2025), YearAndDay::from(ymd(2024, 12, 27)));
        let jan_third_2024 = YearAndDay::from(ymd(2024, 1, 3));
        assert_eq!(previous_week(jan_third_2024), YearAndDay::from(ymd(2023, 12, 27)));
        assert_eq!(
            next_week(previous_week(jan_third_2025)),
            jan_third_2025
        );
    }

    #[test]
    fn rejects_out_of_range_days() {
        assert!(YearAndDay::new(2023, 366).is_err());
        assert!(YearAndDay::new(2023, 0).is_err());
        assert!(YearAndDay::new(2024, 366).is_ok());
    }

    #[test]
    fn week_start_is_monday() {
        assert_eq!(week_start(ymd(2024, 3, 7)), ymd(2024, 3, 4));
        assert_eq!(week_start(ymd(2024, 3, 4)), ymd(2024, 3, 4));
        assert_eq!(week_start(ymd(2024, 3, 10)), ymd(2024, 3, 4));
        assert!(is_week_start(ymd(2024, 3, 4)));
        assert_eq!(week_key(ymd(2024, 3, 4)), "2024-03-04");
    }
}
