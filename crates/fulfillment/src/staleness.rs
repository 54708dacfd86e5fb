//! Business-day arithmetic for the staleness scan.

use chrono::{DateTime, Datelike, Duration, Utc, Weekday};

/// Business days (Mon–Fri) elapsed from `from` to `to`.
///
/// Counts calendar days after `from`'s date up to and including `to`'s date
/// that fall on a weekday. Returns 0 when `to` is not after `from`.
pub fn business_days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    if to <= from {
        return 0;
    }

    let mut date = from.date_naive() + Duration::days(1);
    let end = to.date_naive();
    let mut days = 0;
    while date <= end {
        if !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            days += 1;
        }
        date += Duration::days(1);
    }
    days
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn same_day_is_zero() {
        assert_eq!(business_days_between(at(2026, 8, 5), at(2026, 8, 5)), 0);
    }

    #[test]
    fn friday_to_monday_is_one_business_day() {
        // 2026-08-07 is a Friday, 2026-08-10 a Monday.
        assert_eq!(business_days_between(at(2026, 8, 7), at(2026, 8, 10)), 1);
    }

    #[test]
    fn full_week_is_five_business_days() {
        assert_eq!(business_days_between(at(2026, 8, 3), at(2026, 8, 10)), 5);
    }

    #[test]
    fn weekend_only_span_is_zero() {
        // Saturday to Sunday.
        assert_eq!(business_days_between(at(2026, 8, 8), at(2026, 8, 9)), 0);
    }

    #[test]
    fn reversed_range_is_zero() {
        assert_eq!(business_days_between(at(2026, 8, 10), at(2026, 8, 3)), 0);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn bounded_by_calendar_days(start_day in 1u32..28, span in 0i64..60) {
                let from = at(2026, 3, start_day);
                let to = from + Duration::days(span);
                let days = business_days_between(from, to);
                prop_assert!(days >= 0);
                prop_assert!(days <= span);
            }

            #[test]
            fn a_calendar_week_adds_five_business_days(start_day in 1u32..21, weeks in 1i64..4) {
                let from = at(2026, 3, start_day);
                let to = from + Duration::days(7 * weeks);
                prop_assert_eq!(business_days_between(from, to), 5 * weeks);
            }
        }
    }
}
