//! Data model shared across the core (spec.md §3). All timestamps are UTC
//! absolute instants (`time::OffsetDateTime`); shift times-of-day are
//! `time::Time` materialized against a bucket's calendar day at the point of
//! use (§4.5), never stored pre-materialized.

use serde::{Deserialize, Serialize};
use std::fmt;
use time::{OffsetDateTime, Time};

/// Newtype around a machine identity string, kept distinct from
/// `OrderNumber` so the many hash maps keyed by one or the other can't be
/// confused at a call site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineId(pub String);

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MachineId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderNumber(pub String);

impl fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OrderNumber {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    pub machine_id: MachineId,
    pub line_code: String,
    pub plant: String,
    pub area: String,
    pub oee_enabled: bool,
}

// ---------------------------------------------------------------------------
// Process Order
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Planned,
    Released,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessOrder {
    pub order_id: String,
    pub order_number: OrderNumber,
    pub machine_id: MachineId,
    pub status: OrderStatus,

    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,

    #[serde(default, with = "time::serde::rfc3339::option")]
    pub actual_start: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub actual_end: Option<OffsetDateTime>,

    pub setup_minutes: f64,
    pub processing_minutes: f64,
    pub teardown_minutes: f64,

    pub planned_quantity: f64,
    pub target_performance: f64,

    pub produced_quantity: f64,
    pub yield_quantity: f64,

    pub material_number: Option<String>,
    pub material_description: Option<String>,
}

impl ProcessOrder {
    /// Static invariants (spec.md §3). Does not validate the production
    /// counters — those are checked at compute time against the *current*
    /// values (§4.6), which can legitimately change between validations.
    pub fn validate_intervals(&self) -> Result<(), crate::error::OeeError> {
        if self.start > self.end {
            return Err(crate::error::OeeError::validation(format!(
                "order {}: start {} is after end {}",
                self.order_number, self.start, self.end
            )));
        }
        if let (Some(s), Some(e)) = (self.actual_start, self.actual_end) {
            if s > e {
                return Err(crate::error::OeeError::validation(format!(
                    "order {}: actual_start {} is after actual_end {}",
                    self.order_number, s, e
                )));
            }
        }
        Ok(())
    }

    /// `runtime = setupMinutes + processingMinutes + teardownMinutes` (§4.6).
    pub fn runtime_minutes(&self) -> f64 {
        self.setup_minutes + self.processing_minutes + self.teardown_minutes
    }

    /// The window the Window Engine slices: actual start when available,
    /// else planned start, floored to the hour; planned end, ceilinged to
    /// the hour (§4.5 — hour buckets must be whole, so the window itself
    /// has to land on hour boundaries before it's sliced).
    pub fn window_start(&self) -> OffsetDateTime {
        floor_to_hour(self.actual_start.unwrap_or(self.start))
    }

    pub fn window_end(&self) -> OffsetDateTime {
        ceil_to_hour(self.end)
    }
}

fn floor_to_hour(dt: OffsetDateTime) -> OffsetDateTime {
    dt.replace_minute(0)
        .unwrap()
        .replace_second(0)
        .unwrap()
        .replace_nanosecond(0)
        .unwrap()
}

fn ceil_to_hour(dt: OffsetDateTime) -> OffsetDateTime {
    let floored = floor_to_hour(dt);
    if floored == dt {
        floored
    } else {
        floored + time::Duration::hours(1)
    }
}

// ---------------------------------------------------------------------------
// Shift model
// ---------------------------------------------------------------------------

/// A shift's clock-time boundaries. Deserialized from the Reference Data
/// Provider's wire format (RFC3339 timestamps, see `refdata::ShiftWire`) by
/// keeping only the time-of-day component — materializing against a
/// specific calendar day happens in the Window Engine (§4.5), never here.
#[derive(Debug, Clone)]
pub struct Shift {
    pub machine_id: MachineId,
    pub shift_start: Time,
    pub shift_end: Time,
    pub break_start: Time,
    pub break_end: Time,
}

// ---------------------------------------------------------------------------
// Downtime / micro-stop records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DowntimeRecord {
    pub id: String,
    pub machine_id: MachineId,
    pub order_id: Option<String>,
    pub order_number: Option<OrderNumber>,
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
    pub reason: String,
    /// Normalized to seconds regardless of how the source variant the value
    /// arrived from expressed it (spec.md §9 open question ii).
    pub duration_seconds: i64,
}

impl DowntimeRecord {
    /// Builds an unplanned-downtime record the way the Command Handler does
    /// for a matched Hold/Unhold pair (spec.md §4.3): `reason` is always
    /// `"tbd"` there, but the Window Engine's seeded fixtures and tests build
    /// records with other reasons, so the literal is left to the caller.
    pub fn new(
        machine_id: MachineId,
        order_id: Option<String>,
        order_number: Option<OrderNumber>,
        start: OffsetDateTime,
        end: OffsetDateTime,
        reason: impl Into<String>,
    ) -> Self {
        let duration_seconds = (end - start).whole_seconds();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            machine_id,
            order_id,
            order_number,
            start,
            end,
            reason: reason.into(),
            duration_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn order(start: OffsetDateTime, end: OffsetDateTime) -> ProcessOrder {
        ProcessOrder {
            order_id: "o1".into(),
            order_number: "ORD-1".into(),
            machine_id: "m1".into(),
            status: OrderStatus::Released,
            start,
            end,
            actual_start: None,
            actual_end: None,
            setup_minutes: 5.0,
            processing_minutes: 50.0,
            teardown_minutes: 5.0,
            planned_quantity: 60.0,
            target_performance: 60.0,
            produced_quantity: 0.0,
            yield_quantity: 0.0,
            material_number: None,
            material_description: None,
        }
    }

    #[test]
    fn runtime_sums_three_phases() {
        let o = order(
            datetime!(2024-05-01 08:00:00 UTC),
            datetime!(2024-05-01 09:00:00 UTC),
        );
        assert_eq!(o.runtime_minutes(), 60.0);
    }

    #[test]
    fn validate_rejects_start_after_end() {
        let o = order(
            datetime!(2024-05-01 09:00:00 UTC),
            datetime!(2024-05-01 08:00:00 UTC),
        );
        assert!(o.validate_intervals().is_err());
    }

    #[test]
    fn validate_accepts_equal_start_end() {
        let t = datetime!(2024-05-01 08:00:00 UTC);
        let o = order(t, t);
        assert!(o.validate_intervals().is_ok());
    }

    #[test]
    fn validate_rejects_actual_start_after_actual_end() {
        let mut o = order(
            datetime!(2024-05-01 08:00:00 UTC),
            datetime!(2024-05-01 10:00:00 UTC),
        );
        o.actual_start = Some(datetime!(2024-05-01 09:30:00 UTC));
        o.actual_end = Some(datetime!(2024-05-01 09:00:00 UTC));
        assert!(o.validate_intervals().is_err());
    }

    #[test]
    fn window_start_prefers_actual_start() {
        let mut o = order(
            datetime!(2024-05-01 08:00:00 UTC),
            datetime!(2024-05-01 10:00:00 UTC),
        );
        o.actual_start = Some(datetime!(2024-05-01 08:15:00 UTC));
        assert_eq!(o.window_start(), datetime!(2024-05-01 08:00:00 UTC));
    }

    #[test]
    fn window_start_falls_back_to_planned_start() {
        let o = order(
            datetime!(2024-05-01 08:00:00 UTC),
            datetime!(2024-05-01 10:00:00 UTC),
        );
        assert_eq!(o.window_start(), datetime!(2024-05-01 08:00:00 UTC));
    }

    #[test]
    fn window_end_ceils_to_next_hour() {
        let o = order(
            datetime!(2024-05-01 08:00:00 UTC),
            datetime!(2024-05-01 10:05:00 UTC),
        );
        assert_eq!(o.window_end(), datetime!(2024-05-01 11:00:00 UTC));
    }

    #[test]
    fn window_end_leaves_on_hour_timestamp_unchanged() {
        let o = order(
            datetime!(2024-05-01 08:00:00 UTC),
            datetime!(2024-05-01 10:00:00 UTC),
        );
        assert_eq!(o.window_end(), datetime!(2024-05-01 10:00:00 UTC));
    }

    #[test]
    fn downtime_record_computes_duration_seconds() {
        let rec = DowntimeRecord::new(
            "m1".into(),
            Some("o1".into()),
            Some("ORD-1".into()),
            datetime!(2024-05-01 08:00:00 UTC),
            datetime!(2024-05-01 08:10:00 UTC),
            "tbd",
        );
        assert_eq!(rec.duration_seconds, 600);
    }
}
