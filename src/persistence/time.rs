//! Tick-based date-time conversion for the persisted format.
//!
//! Timestamps are stored as `(ticks, offsetHours)` pairs: `ticks` counts
//! 100 ns intervals of the wall-clock (offset-applied) time since
//! 0001-01-01T00:00:00, and `offsetHours` carries the UTC offset. The pair
//! round-trips a `DateTime<FixedOffset>` exactly to tick precision.

use crate::error::{DaqError, Result};
use chrono::{DateTime, Duration, FixedOffset, Utc};

pub const TICKS_PER_SECOND: i64 = 10_000_000;
const NANOS_PER_TICK: i64 = 100;
/// Tick count at 1970-01-01T00:00:00.
const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

/// Ticks of the wall-clock time (the offset-applied clock face, not UTC).
pub fn to_ticks(time: &DateTime<FixedOffset>) -> i64 {
    let wall = time.naive_local().and_utc();
    UNIX_EPOCH_TICKS
        + wall.timestamp() * TICKS_PER_SECOND
        + i64::from(wall.timestamp_subsec_nanos()) / NANOS_PER_TICK
}

/// UTC offset of the timestamp, in hours.
pub fn offset_hours(time: &DateTime<FixedOffset>) -> f64 {
    f64::from(time.offset().local_minus_utc()) / 3600.0
}

/// Reconstructs a timestamp from its persisted pair.
pub fn from_ticks(ticks: i64, offset_hours: f64) -> Result<DateTime<FixedOffset>> {
    let offset_seconds = (offset_hours * 3600.0).round() as i32;
    let offset = FixedOffset::east_opt(offset_seconds)
        .ok_or_else(|| DaqError::State(format!("invalid UTC offset: {offset_hours}h")))?;

    let unix_ticks = ticks - UNIX_EPOCH_TICKS;
    let secs = unix_ticks.div_euclid(TICKS_PER_SECOND);
    let nanos = (unix_ticks.rem_euclid(TICKS_PER_SECOND) * NANOS_PER_TICK) as u32;
    let wall = DateTime::<Utc>::from_timestamp(secs, nanos)
        .ok_or_else(|| DaqError::State(format!("tick count out of range: {ticks}")))?
        .naive_utc();

    let naive_utc = wall - Duration::seconds(i64::from(offset_seconds));
    Ok(DateTime::from_naive_utc_and_offset(naive_utc, offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_epoch_ticks() {
        let epoch: DateTime<FixedOffset> = "1970-01-01T00:00:00Z".parse().unwrap();
        assert_eq!(to_ticks(&epoch), UNIX_EPOCH_TICKS);
        assert_eq!(offset_hours(&epoch), 0.0);
    }

    #[test]
    fn test_round_trip_utc() {
        let t: DateTime<FixedOffset> = "2024-01-01T12:34:56.7891234Z".parse().unwrap();
        let back = from_ticks(to_ticks(&t), offset_hours(&t)).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn test_round_trip_with_offset() {
        let t: DateTime<FixedOffset> = "2024-06-15T09:30:00-05:00".parse().unwrap();
        let ticks = to_ticks(&t);
        let hours = offset_hours(&t);
        assert_eq!(hours, -5.0);

        let back = from_ticks(ticks, hours).unwrap();
        assert_eq!(back, t);
        // The wall-clock face is preserved, not just the instant.
        assert_eq!(back.naive_local(), t.naive_local());
    }

    #[test]
    fn test_ticks_count_wall_time() {
        // Same instant, different offsets: tick counts differ by the
        // offset because ticks follow the clock face.
        let utc: DateTime<FixedOffset> = "2024-01-01T12:00:00Z".parse().unwrap();
        let east: DateTime<FixedOffset> = "2024-01-01T13:00:00+01:00".parse().unwrap();
        assert_eq!(utc, east);
        assert_eq!(to_ticks(&east) - to_ticks(&utc), 3600 * TICKS_PER_SECOND);
    }

    #[test]
    fn test_invalid_offset_is_rejected() {
        assert!(from_ticks(UNIX_EPOCH_TICKS, 999.0).is_err());
    }
}
