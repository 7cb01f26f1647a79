//! Billing cycle calculator. Pure function `(subscription_start, now,
//! period_type) -> Period`, per spec.md §4.3. No I/O, fully unit-testable.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc};

use crate::types::{Period, PeriodType};

/// Epoch instant used as the `forever` period's zero start, and as the
/// synthetic subscription start for users with no entitlement record (the
/// default tier has no anniversary to anchor to).
pub(crate) fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).earliest().unwrap_or_default())
}

/// Far-future instant used as the `forever` period's end; non-expiring in practice.
fn far_future() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59)
        .single()
        .unwrap_or_else(|| epoch() + chrono::Duration::days(365 * 8000))
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    match (
        NaiveDate::from_ymd_opt(year, month, 1),
        NaiveDate::from_ymd_opt(next_year, next_month, 1),
    ) {
        (Some(this_month), Some(next_month)) => {
            u32::try_from((next_month - this_month).num_days()).unwrap_or(30)
        }
        _ => 30,
    }
}

/// The anchor-day occurrence in `(year, month)`, clamped to the month's last
/// day when the anchor day overflows it (spec.md §3 "Day D greater than the
/// target month's length clamps to the last day of that month").
fn anchor_occurrence(year: i32, month: u32, anchor_day: u32, time_of_day: NaiveTime) -> DateTime<Utc> {
    let day = anchor_day.min(days_in_month(year, month)).max(1);
    let date = NaiveDate::from_ymd_opt(year, month, day)
        .unwrap_or_else(|| NaiveDate::from_ymd_opt(year, month, 1).unwrap_or_default());
    Utc.from_utc_datetime(&date.and_time(time_of_day))
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 { (year + 1, 1) } else { (year, month + 1) }
}

fn prev_month(year: i32, month: u32) -> (i32, u32) {
    if month == 1 { (year - 1, 12) } else { (year, month - 1) }
}

/// Computes the half-open period of `period_type` covering `now`, anchored to
/// `subscription_start` for the `monthly` case.
pub fn compute_period(
    subscription_start: DateTime<Utc>,
    now: DateTime<Utc>,
    period_type: PeriodType,
) -> Period {
    match period_type {
        PeriodType::Daily => {
            let start_date = now.date_naive();
            let start = Utc.from_utc_datetime(&start_date.and_hms_opt(0, 0, 0).unwrap_or_default());
            Period {
                start,
                end: start + chrono::Duration::days(1),
                period_type: PeriodType::Daily,
            }
        }
        PeriodType::Forever => Period {
            start: epoch(),
            end: far_future(),
            period_type: PeriodType::Forever,
        },
        PeriodType::Monthly => {
            if now < subscription_start {
                // Subscription hasn't started yet: the first cycle is the one
                // anchored on the start date itself.
                let (ny, nm) = next_month(subscription_start.year(), subscription_start.month());
                let end = anchor_occurrence(ny, nm, subscription_start.day(), subscription_start.time());
                return Period {
                    start: subscription_start,
                    end,
                    period_type: PeriodType::Monthly,
                };
            }

            let anchor_day = subscription_start.day();
            let time_of_day = subscription_start.time();
            let mut year = now.year();
            let mut month = now.month();

            // Tie-break: the exact anniversary instant belongs to the new cycle,
            // so a strict `<=` on the candidate admits it.
            let mut start = anchor_occurrence(year, month, anchor_day, time_of_day);
            if start > now {
                (year, month) = prev_month(year, month);
                start = anchor_occurrence(year, month, anchor_day, time_of_day);
            }
            if start < subscription_start {
                start = subscription_start;
            }

            let (end_year, end_month) = next_month(year, month);
            let end = anchor_occurrence(end_year, end_month, anchor_day, time_of_day);
            Period {
                start,
                end,
                period_type: PeriodType::Monthly,
            }
        }
    }
}
