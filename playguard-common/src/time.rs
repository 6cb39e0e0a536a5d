//! Playback interval math
//!
//! Sessions are half-open in practice: a stop timestamp of `None`
//! means the session is still in flight and the interval is treated as
//! open-ended.

use chrono::{DateTime, Duration, Utc};

/// True if two intervals overlap, or their gap is at most `gap`.
pub fn intervals_overlap_or_near(
    a_start: DateTime<Utc>,
    a_end: Option<DateTime<Utc>>,
    b_start: DateTime<Utc>,
    b_end: Option<DateTime<Utc>>,
    gap: Duration,
) -> bool {
    let a_end_eff = a_end.map(|e| e + gap);
    let b_end_eff = b_end.map(|e| e + gap);

    let a_before_b = match a_end_eff {
        Some(ae) => ae < b_start,
        None => false,
    };
    let b_before_a = match b_end_eff {
        Some(be) => be < a_start,
        None => false,
    };

    !a_before_b && !b_before_a
}

/// True if two intervals strictly overlap (no gap allowance).
pub fn intervals_overlap(
    a_start: DateTime<Utc>,
    a_end: Option<DateTime<Utc>>,
    b_start: DateTime<Utc>,
    b_end: Option<DateTime<Utc>>,
) -> bool {
    intervals_overlap_or_near(a_start, a_end, b_start, b_end, Duration::zero())
}

/// Fraction of the longer interval covered by the overlap, in [0, 1].
/// Returns None unless both intervals are closed and non-degenerate.
pub fn coincidence_ratio(
    a_start: DateTime<Utc>,
    a_end: Option<DateTime<Utc>>,
    b_start: DateTime<Utc>,
    b_end: Option<DateTime<Utc>>,
) -> Option<f64> {
    let a_end = a_end?;
    let b_end = b_end?;

    let longer = (a_end - a_start).max(b_end - b_start);
    if longer <= Duration::zero() {
        return None;
    }

    let overlap_start = a_start.max(b_start);
    let overlap_end = a_end.min(b_end);
    if overlap_end <= overlap_start {
        return Some(0.0);
    }

    let overlap = overlap_end - overlap_start;
    Some(overlap.num_milliseconds() as f64 / longer.num_milliseconds() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(min)
    }

    #[test]
    fn overlapping_intervals() {
        assert!(intervals_overlap(t(0), Some(t(60)), t(30), Some(t(90))));
        assert!(!intervals_overlap(t(0), Some(t(30)), t(31), Some(t(60))));
    }

    #[test]
    fn near_intervals_within_gap() {
        // 4-minute gap bridged by a 5-minute allowance
        assert!(intervals_overlap_or_near(
            t(0),
            Some(t(30)),
            t(34),
            Some(t(60)),
            Duration::minutes(5)
        ));
        assert!(!intervals_overlap_or_near(
            t(0),
            Some(t(30)),
            t(36),
            Some(t(60)),
            Duration::minutes(5)
        ));
    }

    #[test]
    fn open_ended_interval_overlaps_everything_after_start() {
        assert!(intervals_overlap(t(0), None, t(500), Some(t(510))));
        assert!(!intervals_overlap(t(500), None, t(0), Some(t(10))));
    }

    #[test]
    fn coincidence_ratio_for_identical_intervals() {
        let r = coincidence_ratio(t(0), Some(t(60)), t(0), Some(t(60))).unwrap();
        assert!((r - 1.0).abs() < 1e-9);
    }

    #[test]
    fn coincidence_ratio_for_half_overlap() {
        let r = coincidence_ratio(t(0), Some(t(60)), t(30), Some(t(90))).unwrap();
        assert!((r - 0.5).abs() < 1e-9);
    }

    #[test]
    fn coincidence_undefined_for_open_intervals() {
        assert!(coincidence_ratio(t(0), None, t(0), Some(t(60))).is_none());
    }
}
