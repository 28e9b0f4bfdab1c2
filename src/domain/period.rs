use std::fmt;

use chrono::{Datelike, Days, NaiveDate};

/// Days fetched ahead of the requested start so cumulative counters have a
/// predecessor reading for the first in-range day.
pub const MARGIN_DAYS: u64 = 1;

/// How much of a month bucket the audited period covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coverage {
    Whole,
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MonthBucket {
    pub year: i32,
    pub month: u32,
}

impl MonthBucket {
    pub fn containing(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn first_day(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
    }

    pub fn last_day(&self) -> Option<NaiveDate> {
        self.next().first_day()?.pred_opt()
    }

    pub fn coverage(&self, start: NaiveDate, end: NaiveDate) -> Coverage {
        match (self.first_day(), self.last_day()) {
            (Some(first), Some(last)) if start <= first && last <= end => Coverage::Whole,
            _ => Coverage::Partial,
        }
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn day(&self, day_of_month: u32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, day_of_month)
    }

    pub fn label(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }
}

impl fmt::Display for MonthBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Every calendar month intersecting `[start, end]`, including boundary
/// months that overlap by a single day. Empty when `start > end`.
pub fn month_buckets(start: NaiveDate, end: NaiveDate) -> Vec<MonthBucket> {
    if start > end {
        return Vec::new();
    }

    let last = MonthBucket::containing(end);
    let mut current = MonthBucket::containing(start);
    let mut buckets = vec![current];
    while current < last {
        current = current.next();
        buckets.push(current);
    }
    buckets
}

pub fn days_inclusive(start: NaiveDate, end: NaiveDate) -> usize {
    if start > end {
        return 0;
    }
    usize::try_from((end - start).num_days() + 1).unwrap_or(0)
}

pub fn fetch_start(start: NaiveDate) -> NaiveDate {
    start.checked_sub_days(Days::new(MARGIN_DAYS)).unwrap_or(start)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{Coverage, MonthBucket, days_inclusive, fetch_start, month_buckets};

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn includes_boundary_months_with_single_overlapping_day() {
        let buckets = month_buckets(day(2023, 11, 30), day(2024, 1, 1));

        assert_eq!(
            buckets,
            vec![
                MonthBucket { year: 2023, month: 11 },
                MonthBucket { year: 2023, month: 12 },
                MonthBucket { year: 2024, month: 1 },
            ]
        );
        assert_eq!(buckets[2].label(), "2024-01");
    }

    #[test]
    fn single_day_range_yields_one_bucket() {
        assert_eq!(month_buckets(day(2024, 2, 29), day(2024, 2, 29)).len(), 1);
        assert!(month_buckets(day(2024, 3, 2), day(2024, 3, 1)).is_empty());
    }

    #[test]
    fn margin_start_can_cross_into_previous_month() {
        assert_eq!(fetch_start(day(2024, 3, 1)), day(2024, 2, 29));
        assert_eq!(
            month_buckets(fetch_start(day(2024, 3, 1)), day(2024, 3, 31)).len(),
            2
        );
    }

    #[test]
    fn counts_days_inclusively() {
        assert_eq!(days_inclusive(day(2024, 1, 1), day(2024, 1, 31)), 31);
        assert_eq!(days_inclusive(day(2024, 1, 1), day(2024, 1, 1)), 1);
        assert_eq!(days_inclusive(day(2024, 1, 2), day(2024, 1, 1)), 0);
    }

    #[test]
    fn month_coverage_requires_both_ends_inside_period() {
        let february = MonthBucket { year: 2024, month: 2 };

        assert_eq!(february.last_day(), Some(day(2024, 2, 29)));
        assert_eq!(february.coverage(day(2024, 2, 1), day(2024, 2, 29)), Coverage::Whole);
        assert_eq!(february.coverage(day(2024, 1, 15), day(2024, 3, 2)), Coverage::Whole);
        assert_eq!(february.coverage(day(2024, 2, 1), day(2024, 2, 10)), Coverage::Partial);
        assert_eq!(february.coverage(day(2024, 2, 2), day(2024, 2, 29)), Coverage::Partial);
        assert_eq!(
            MonthBucket { year: 2023, month: 12 }.last_day(),
            Some(day(2023, 12, 31))
        );
    }
}
