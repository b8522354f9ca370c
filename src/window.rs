//! Window Engine (C5, spec.md §4.5): slices an order's
//! `[window_start, window_end]` into hour buckets and, for each bucket,
//! computes how many of its 60 minutes were consumed by planned downtime,
//! unplanned downtime, micro-stops, and materialized shift breaks — so the
//! OEE Calculator is left with a simple `productionMinutes` per bucket.

use crate::model::{DowntimeRecord, MachineId};
use std::collections::HashSet;
use time::{Date, Duration as TimeDuration, OffsetDateTime, Time};

/// One hour-long slice of an order's runtime window, with every
/// minutes-consumed category broken out so callers can audit where the 60
/// minutes went (spec.md §4.5, §8 Scenario D/E/F).
#[derive(Debug, Clone, PartialEq)]
pub struct HourBucket {
    pub bucket_start: OffsetDateTime,
    pub bucket_end: OffsetDateTime,
    pub planned_downtime_minutes: f64,
    pub unplanned_downtime_minutes: f64,
    pub microstop_minutes: f64,
    pub break_minutes: f64,
    pub production_minutes: f64,
}

/// A shift's break, materialized against one calendar day. Produced by
/// `materialize_breaks` from a `model::Shift`'s time-of-day fields.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializedBreak {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
    pub label: String,
}

/// Slice `[window_start, window_end)` into whole-hour buckets aligned to
/// the clock hour (`08:00-09:00`, `09:00-10:00`, ...), truncating the first
/// and last bucket to the window's actual boundaries (spec.md §4.5). An
/// empty or inverted window yields no buckets.
pub fn hour_buckets(window_start: OffsetDateTime, window_end: OffsetDateTime) -> Vec<(OffsetDateTime, OffsetDateTime)> {
    if window_start >= window_end {
        return Vec::new();
    }

    let mut buckets = Vec::new();
    let mut cursor = window_start;
    while cursor < window_end {
        let next_hour_boundary = truncate_to_hour(cursor) + TimeDuration::hours(1);
        let bucket_end = next_hour_boundary.min(window_end);
        buckets.push((cursor, bucket_end));
        cursor = bucket_end;
    }
    buckets
}

fn truncate_to_hour(dt: OffsetDateTime) -> OffsetDateTime {
    dt.replace_minute(0)
        .unwrap()
        .replace_second(0)
        .unwrap()
        .replace_nanosecond(0)
        .unwrap()
}

/// Overlap, in minutes, between `[a_start, a_end)` and `[b_start, b_end)`.
/// Zero for disjoint or degenerate intervals — never negative.
pub fn overlap_minutes(
    a_start: OffsetDateTime,
    a_end: OffsetDateTime,
    b_start: OffsetDateTime,
    b_end: OffsetDateTime,
) -> f64 {
    let start = a_start.max(b_start);
    let end = a_end.min(b_end);
    if end <= start {
        return 0.0;
    }
    (end - start).as_seconds_f64() / 60.0
}

/// Materialize a shift's break against every calendar day the window spans,
/// rolling the break forward a day when `break_end < break_start` would
/// otherwise place it before the shift begins (an overnight shift, spec.md
/// §4.5 edge case).
pub fn materialize_breaks(
    window_start: OffsetDateTime,
    window_end: OffsetDateTime,
    shift_start: Time,
    break_start: Time,
    break_end: Time,
) -> Vec<MaterializedBreak> {
    let mut breaks = Vec::new();
    // The shift instance covering the start of the window may have begun the
    // calendar day before it (an overnight shift whose break clock-time
    // rolls past midnight) — anchor one day early so that roll-forward below
    // lands inside the window instead of past it.
    let mut anchor = window_start.date().previous_day().unwrap_or(window_start.date());
    let last_anchor = window_end.date();

    while anchor <= last_anchor {
        let mut start = anchor.with_time(break_start).assume_utc_like(window_start);
        let mut end = anchor.with_time(break_end).assume_utc_like(window_start);

        // Break crosses midnight relative to its own start.
        if end <= start {
            end = end + TimeDuration::days(1);
        }
        // Shift itself starts after midnight but the break's clock time is
        // earlier than the shift start — the break belongs to the next day.
        if break_start < shift_start {
            start = start + TimeDuration::days(1);
            end = end + TimeDuration::days(1);
        }

        if start < window_end && end > window_start {
            breaks.push(MaterializedBreak {
                start: start.max(window_start),
                end: end.min(window_end),
                label: format!("break-{anchor}"),
            });
        }

        anchor = match anchor.next_day() {
            Some(d) => d,
            None => break,
        };
    }

    breaks
}

trait AssumeUtcLike {
    fn assume_utc_like(self, reference: OffsetDateTime) -> OffsetDateTime;
}

impl AssumeUtcLike for time::PrimitiveDateTime {
    fn assume_utc_like(self, reference: OffsetDateTime) -> OffsetDateTime {
        self.assume_offset(reference.offset())
    }
}

trait WithTime {
    fn with_time(self, t: Time) -> time::PrimitiveDateTime;
}

impl WithTime for Date {
    fn with_time(self, t: Time) -> time::PrimitiveDateTime {
        time::PrimitiveDateTime::new(self, t)
    }
}

/// Restrict a full (unfiltered, machine-agnostic) downtime/micro-stop
/// collection to the ones belonging to `machine_id` (spec.md §4.5 step 2:
/// "filter by machineId and overlap with the order window"). Records for
/// other machines, or with zero overlap against `[window_start,
/// window_end)`, contribute nothing — `overlap_minutes` already returns 0
/// for them, so this only needs to narrow by machine identity.
fn for_machine<'a>(records: &'a [DowntimeRecord], machine_id: &MachineId) -> Vec<&'a DowntimeRecord> {
    records.iter().filter(|r| &r.machine_id == machine_id).collect()
}

/// Compute one machine's full set of hour buckets for an order's window,
/// folding in planned downtime, unplanned downtime, micro-stops (all three
/// as unfiltered collections straight from the Reference Data Client — this
/// function does the per-machine filtering itself, spec.md §4.5 step 2) and
/// materialized breaks. Duplicate-labeled breaks (the same `label` seen
/// twice — a misconfigured shift table republishing the same break) are
/// skipped after the first occurrence (spec.md §4.5 edge case).
pub fn compute_buckets(
    machine_id: &MachineId,
    window_start: OffsetDateTime,
    window_end: OffsetDateTime,
    planned_downtime: &[DowntimeRecord],
    unplanned_downtime: &[DowntimeRecord],
    microstops: &[DowntimeRecord],
    breaks: &[MaterializedBreak],
) -> Vec<HourBucket> {
    let planned_downtime = for_machine(planned_downtime, machine_id);
    let unplanned_downtime = for_machine(unplanned_downtime, machine_id);
    let microstops = for_machine(microstops, machine_id);

    let mut seen_break_labels = HashSet::new();
    let deduped_breaks: Vec<&MaterializedBreak> = breaks
        .iter()
        .filter(|b| {
            if seen_break_labels.contains(&b.label) {
                tracing::warn!(machine = %machine_id, label = %b.label, "duplicate break label, skipping");
                false
            } else {
                seen_break_labels.insert(b.label.clone());
                true
            }
        })
        .collect();

    hour_buckets(window_start, window_end)
        .into_iter()
        .map(|(bucket_start, bucket_end)| {
            let planned: f64 = planned_downtime
                .iter()
                .map(|w| overlap_minutes(bucket_start, bucket_end, w.start, w.end))
                .sum();
            let unplanned: f64 = unplanned_downtime
                .iter()
                .map(|w| overlap_minutes(bucket_start, bucket_end, w.start, w.end))
                .sum();
            let micro: f64 = microstops
                .iter()
                .map(|w| overlap_minutes(bucket_start, bucket_end, w.start, w.end))
                .sum();
            let brk: f64 = deduped_breaks
                .iter()
                .map(|w| overlap_minutes(bucket_start, bucket_end, w.start, w.end))
                .sum();

            let rest = planned + unplanned + micro + brk;
            let bucket_capacity = (bucket_end - bucket_start).as_seconds_f64() / 60.0;
            let production_minutes = (bucket_capacity - rest).max(0.0);

            HourBucket {
                bucket_start,
                bucket_end,
                planned_downtime_minutes: planned,
                unplanned_downtime_minutes: unplanned,
                microstop_minutes: micro,
                break_minutes: brk,
                production_minutes,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{datetime, time};

    fn dw(start: OffsetDateTime, end: OffsetDateTime) -> DowntimeRecord {
        DowntimeRecord::new(MachineId("m1".into()), None, None, start, end, "test")
    }

    fn dw_for(machine_id: &str, start: OffsetDateTime, end: OffsetDateTime) -> DowntimeRecord {
        DowntimeRecord::new(MachineId(machine_id.into()), None, None, start, end, "test")
    }

    #[test]
    fn hour_buckets_splits_on_clock_hour_boundaries() {
        let buckets = hour_buckets(
            datetime!(2024-05-01 08:15:00 UTC),
            datetime!(2024-05-01 10:05:00 UTC),
        );
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[0], (datetime!(2024-05-01 08:15:00 UTC), datetime!(2024-05-01 09:00:00 UTC)));
        assert_eq!(buckets[1], (datetime!(2024-05-01 09:00:00 UTC), datetime!(2024-05-01 10:00:00 UTC)));
        assert_eq!(buckets[2], (datetime!(2024-05-01 10:00:00 UTC), datetime!(2024-05-01 10:05:00 UTC)));
    }

    #[test]
    fn hour_buckets_empty_for_inverted_window() {
        assert!(hour_buckets(
            datetime!(2024-05-01 10:00:00 UTC),
            datetime!(2024-05-01 09:00:00 UTC)
        )
        .is_empty());
    }

    #[test]
    fn overlap_minutes_handles_disjoint_intervals() {
        let m = overlap_minutes(
            datetime!(2024-05-01 08:00:00 UTC),
            datetime!(2024-05-01 09:00:00 UTC),
            datetime!(2024-05-01 10:00:00 UTC),
            datetime!(2024-05-01 11:00:00 UTC),
        );
        assert_eq!(m, 0.0);
    }

    #[test]
    fn overlap_minutes_handles_partial_overlap() {
        let m = overlap_minutes(
            datetime!(2024-05-01 08:00:00 UTC),
            datetime!(2024-05-01 09:00:00 UTC),
            datetime!(2024-05-01 08:30:00 UTC),
            datetime!(2024-05-01 09:30:00 UTC),
        );
        assert_eq!(m, 30.0);
    }

    #[test]
    fn compute_buckets_production_minutes_is_remainder() {
        let mid = MachineId("m1".into());
        let window_start = datetime!(2024-05-01 08:00:00 UTC);
        let window_end = datetime!(2024-05-01 09:00:00 UTC);
        let planned = vec![dw(
            datetime!(2024-05-01 08:00:00 UTC),
            datetime!(2024-05-01 08:10:00 UTC),
        )];
        let buckets = compute_buckets(&mid, window_start, window_end, &planned, &[], &[], &[]);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].planned_downtime_minutes, 10.0);
        assert_eq!(buckets[0].production_minutes, 50.0);
    }

    #[test]
    fn compute_buckets_never_goes_negative_when_overlaps_exceed_bucket() {
        let mid = MachineId("m1".into());
        let window_start = datetime!(2024-05-01 08:00:00 UTC);
        let window_end = datetime!(2024-05-01 09:00:00 UTC);
        // Deliberately overlapping planned + unplanned covering the whole hour twice over.
        let planned = vec![dw(window_start, window_end)];
        let unplanned = vec![dw(window_start, window_end)];
        let buckets = compute_buckets(&mid, window_start, window_end, &planned, &unplanned, &[], &[]);
        assert_eq!(buckets[0].production_minutes, 0.0);
    }

    #[test]
    fn materialize_breaks_produces_one_break_per_day_in_window() {
        let window_start = datetime!(2024-05-01 06:00:00 UTC);
        let window_end = datetime!(2024-05-02 14:00:00 UTC);
        let breaks = materialize_breaks(
            window_start,
            window_end,
            time!(6:00),
            time!(10:00),
            time!(10:15),
        );
        assert!(breaks.len() >= 1);
        for b in &breaks {
            assert!(b.start < b.end);
        }
    }

    #[test]
    fn compute_buckets_skips_duplicate_break_labels() {
        let mid = MachineId("m1".into());
        let window_start = datetime!(2024-05-01 08:00:00 UTC);
        let window_end = datetime!(2024-05-01 09:00:00 UTC);
        let b1 = MaterializedBreak {
            start: datetime!(2024-05-01 08:10:00 UTC),
            end: datetime!(2024-05-01 08:20:00 UTC),
            label: "break-2024-05-01".into(),
        };
        let b2 = MaterializedBreak {
            start: datetime!(2024-05-01 08:30:00 UTC),
            end: datetime!(2024-05-01 08:40:00 UTC),
            label: "break-2024-05-01".into(),
        };
        let buckets = compute_buckets(&mid, window_start, window_end, &[], &[], &[], &[b1, b2]);
        assert_eq!(buckets[0].break_minutes, 10.0);
    }

    #[test]
    fn scenario_d_break_splits_two_bucket_order() {
        let mid = MachineId("m1".into());
        let window_start = datetime!(2024-05-01 08:00:00 UTC);
        let window_end = datetime!(2024-05-01 10:00:00 UTC);
        let brk = MaterializedBreak {
            start: datetime!(2024-05-01 08:30:00 UTC),
            end: datetime!(2024-05-01 08:45:00 UTC),
            label: "break-2024-05-01".into(),
        };
        let buckets = compute_buckets(&mid, window_start, window_end, &[], &[], &[], &[brk]);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].break_minutes, 15.0);
        assert_eq!(buckets[0].production_minutes, 45.0);
        assert_eq!(buckets[1].break_minutes, 0.0);
        assert_eq!(buckets[1].production_minutes, 60.0);
    }

    #[test]
    fn scenario_e_overnight_break_rolls_forward_into_window() {
        // Shift 22:00-06:00, break 02:00-02:30, order 01:30Z-03:30Z.
        let window_start = datetime!(2024-05-01 01:30:00 UTC);
        let window_end = datetime!(2024-05-01 03:30:00 UTC);
        let breaks = materialize_breaks(
            window_start,
            window_end,
            time!(22:00),
            time!(2:00),
            time!(2:30),
        );
        assert_eq!(breaks.len(), 1);
        assert_eq!(breaks[0].start, datetime!(2024-05-01 02:00:00 UTC));
        assert_eq!(breaks[0].end, datetime!(2024-05-01 02:30:00 UTC));

        let mid = MachineId("m1".into());
        let buckets = compute_buckets(&mid, window_start, window_end, &[], &[], &[], &breaks);
        let bucket_02 = buckets
            .iter()
            .find(|b| b.bucket_start == datetime!(2024-05-01 02:00:00 UTC))
            .expect("02:00Z bucket present");
        assert_eq!(bucket_02.break_minutes, 30.0);

        let bucket_01 = buckets
            .iter()
            .find(|b| b.bucket_start <= datetime!(2024-05-01 01:30:00 UTC))
            .expect("01:00Z bucket present");
        assert_eq!(bucket_01.break_minutes, 0.0);
    }

    #[test]
    fn compute_buckets_ignores_downtime_for_other_machines() {
        let mid = MachineId("m1".into());
        let window_start = datetime!(2024-05-01 08:00:00 UTC);
        let window_end = datetime!(2024-05-01 09:00:00 UTC);
        let other_machine = dw_for(
            "m2",
            datetime!(2024-05-01 08:00:00 UTC),
            datetime!(2024-05-01 08:30:00 UTC),
        );
        let buckets = compute_buckets(&mid, window_start, window_end, &[other_machine], &[], &[], &[]);
        assert_eq!(buckets[0].planned_downtime_minutes, 0.0);
        assert_eq!(buckets[0].production_minutes, 60.0);
    }
}
