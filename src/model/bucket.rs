use chrono::{DateTime, FixedOffset, TimeDelta, TimeZone};

use super::duration::CandleDuration;

/// Seconds from 0001-01-01T00:00:00Z, a Monday, to the Unix epoch.
const MONDAY_ANCHOR_TO_EPOCH_SECS: i64 = 62_135_596_800;

/// Start of the bucket of length `duration` that contains `t`, expressed in
/// `zone`.
///
/// Buckets are aligned on absolute time counted from 0001-01-01 UTC, not on
/// the zone's wall clock. With a +09:00 zone a `1d` bucket opens at 09:00
/// local time and a `1w` bucket on Monday 09:00. The zone only changes how
/// the result is rendered, so every component that stores bucket times must
/// still pass the same `zone`.
pub fn bucket_start<Tz: TimeZone>(
    t: &DateTime<Tz>,
    duration: &CandleDuration,
    zone: FixedOffset,
) -> DateTime<FixedOffset> {
    let local = t.with_timezone(&zone);
    let rem = (local.timestamp() + MONDAY_ANCHOR_TO_EPOCH_SECS).rem_euclid(duration.as_secs());
    local
        - TimeDelta::seconds(rem)
        - TimeDelta::nanoseconds(i64::from(local.timestamp_subsec_nanos()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Utc, Weekday};

    fn jst() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    fn d(label: &str) -> CandleDuration {
        CandleDuration::parse(label).unwrap()
    }

    #[test]
    fn truncates_to_minute_and_hour() {
        let t = DateTime::parse_from_rfc3339("2024-03-01T10:17:42.731+09:00").unwrap();
        assert_eq!(
            bucket_start(&t, &d("1m"), jst()).to_rfc3339(),
            "2024-03-01T10:17:00+09:00"
        );
        assert_eq!(
            bucket_start(&t, &d("1h"), jst()).to_rfc3339(),
            "2024-03-01T10:00:00+09:00"
        );
        assert_eq!(
            bucket_start(&t, &d("15m"), jst()).to_rfc3339(),
            "2024-03-01T10:15:00+09:00"
        );
    }

    #[test]
    fn result_is_rendered_in_reference_zone() {
        let t = "2024-03-01T23:30:10Z".parse::<DateTime<Utc>>().unwrap();
        let start = bucket_start(&t, &d("1h"), jst());
        assert_eq!(start.to_rfc3339(), "2024-03-02T08:00:00+09:00");
        assert_eq!(start.offset(), &jst());
    }

    #[test]
    fn daily_buckets_open_at_utc_midnight() {
        // 08:30 JST is still the previous UTC day.
        let t = DateTime::parse_from_rfc3339("2024-03-01T08:30:00+09:00").unwrap();
        assert_eq!(
            bucket_start(&t, &d("1d"), jst()).to_rfc3339(),
            "2024-02-29T09:00:00+09:00"
        );
        let t = DateTime::parse_from_rfc3339("2024-03-01T09:00:00+09:00").unwrap();
        assert_eq!(bucket_start(&t, &d("1d"), jst()), t);
    }

    #[test]
    fn weekly_buckets_open_on_monday() {
        // Wednesday
        let t = DateTime::parse_from_rfc3339("2024-03-06T12:00:00+09:00").unwrap();
        let start = bucket_start(&t, &d("1w"), jst());
        assert_eq!(start.to_rfc3339(), "2024-03-04T09:00:00+09:00");
        assert_eq!(start.weekday(), Weekday::Mon);

        // Monday 08:59 JST still belongs to the previous week.
        let t = DateTime::parse_from_rfc3339("2024-03-04T08:59:00+09:00").unwrap();
        assert_eq!(
            bucket_start(&t, &d("1w"), jst()).to_rfc3339(),
            "2024-02-26T09:00:00+09:00"
        );
    }

    #[test]
    fn anchor_is_independent_of_zone() {
        let t = DateTime::parse_from_rfc3339("2024-03-06T12:00:00+09:00").unwrap();
        let utc = FixedOffset::east_opt(0).unwrap();
        assert_eq!(bucket_start(&t, &d("1w"), jst()), bucket_start(&t, &d("1w"), utc));
        assert_eq!(bucket_start(&t, &d("4h"), jst()), bucket_start(&t, &d("4h"), utc));
    }

    #[test]
    fn same_instant_in_different_zones_maps_to_same_bucket() {
        let a = DateTime::parse_from_rfc3339("2024-03-01T01:05:59Z").unwrap();
        let b = DateTime::parse_from_rfc3339("2024-03-01T10:05:01+09:00").unwrap();
        assert_eq!(
            bucket_start(&a, &d("1m"), jst()),
            bucket_start(&b, &d("1m"), jst())
        );
    }

    #[test]
    fn boundary_belongs_to_its_own_bucket() {
        let t = DateTime::parse_from_rfc3339("2024-03-01T10:01:00+09:00").unwrap();
        assert_eq!(bucket_start(&t, &d("1m"), jst()), t);
    }

    #[test]
    fn bucket_start_is_idempotent() {
        let t = DateTime::parse_from_rfc3339("2024-03-01T10:59:59.999+09:00").unwrap();
        let once = bucket_start(&t, &d("1h"), jst());
        assert_eq!(bucket_start(&once, &d("1h"), jst()), once);
    }
}
