//! Day indices and the coarser aggregation epochs derived from them.
//!
//! All observation timestamps and report windows are expressed as a 32-bit
//! count of days since the Unix epoch, computed in UTC. Week and month
//! indices are derived from the day index by fixed arithmetic.

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Days since 1970-01-01 UTC.
pub type DayIndex = u32;

/// Sentinel meaning "the infinite past" in day-range queries.
pub const DAY_INDEX_INFINITE_PAST: DayIndex = 0;

/// Sentinel meaning "the infinite future" in day-range queries.
pub const DAY_INDEX_INFINITE_FUTURE: DayIndex = u32::MAX;

/// Returned by [`epoch_index`] when the index cannot be computed.
pub const INVALID_EPOCH_INDEX: u32 = u32::MAX;

const SECONDS_PER_DAY: i64 = 86_400;

/// The time window over which observations are grouped before decoding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EpochType {
    #[default]
    Day,
    Week,
    Month,
}

/// The current day index relative to UTC at the given instant.
///
/// Instants before the epoch clamp to day zero.
pub fn day_index_from_utc(time: DateTime<Utc>) -> DayIndex {
    let days = time.timestamp().div_euclid(SECONDS_PER_DAY);
    days.clamp(0, i64::from(u32::MAX)) as DayIndex
}

/// The first second (UTC) of the given day index.
pub fn day_index_to_unix_seconds(day_index: DayIndex) -> i64 {
    i64::from(day_index) * SECONDS_PER_DAY
}

/// Computes the epoch index for `day_index` under the given epoch type.
///
/// Observations within one epoch index are decoded together. Returns
/// [`INVALID_EPOCH_INDEX`] if the civil date for `day_index` is out of
/// chrono's representable range.
pub fn epoch_index(day_index: DayIndex, epoch_type: EpochType) -> u32 {
    match epoch_type {
        EpochType::Day => day_index,
        EpochType::Week => day_index / 7,
        EpochType::Month => month_index(day_index),
    }
}

/// Months since January 1970 of the civil UTC date for `day_index`.
fn month_index(day_index: DayIndex) -> u32 {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();
    match epoch.checked_add_days(Days::new(u64::from(day_index))) {
        Some(date) => {
            let years = date.year() - 1970;
            (years as u32) * 12 + date.month0()
        }
        None => INVALID_EPOCH_INDEX,
    }
}
