//! OEE Calculator (C6, spec.md §4.6): holds per-machine OEE state (order
//! identification, planned/actual takt, expected completion) and turns a
//! machine's current production counters plus the Window Engine's aggregate
//! non-productive minutes into availability/performance/quality/OEE
//! fractions, classifying the result. Mirrors the stateful-per-entity shape
//! of `commands::CommandHandler`: state is created lazily on first
//! observation of a machine's order and mutated in place thereafter, never
//! recreated from scratch each cycle.

use crate::error::OeeError;
use crate::model::{MachineId, ProcessOrder};
use serde::Serialize;
use time::{Duration as TimeDuration, OffsetDateTime};

/// World-class/Excellent/Good/Average/Below-Average bands (spec.md §4.6),
/// evaluated against the OEE fraction (not the percentage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OeeClass {
    WorldClass,
    Excellent,
    Good,
    Average,
    BelowAverage,
}

pub fn classify(oee_fraction: f64) -> OeeClass {
    if oee_fraction >= 0.85 {
        OeeClass::WorldClass
    } else if oee_fraction >= 0.70 {
        OeeClass::Excellent
    } else if oee_fraction >= 0.60 {
        OeeClass::Good
    } else if oee_fraction >= 0.40 {
        OeeClass::Average
    } else {
        OeeClass::BelowAverage
    }
}

/// Per-machine OEE state (spec.md §4.6 "State init"): populated from the
/// active order on first sight, then refreshed every cycle as the order's
/// actual interval and counters progress. `planned_takt`/`actual_takt`/
/// `expected_end` are recomputed on every `compute_metrics` call since the
/// order's actuals can change between cycles; everything else is identity
/// that doesn't change once an order is released.
#[derive(Debug, Clone)]
pub struct OeeState {
    pub machine_id: MachineId,
    pub plant: String,
    pub area: String,
    pub order_id: String,
    pub order_number: String,
    pub material_number: Option<String>,
    pub material_description: Option<String>,

    pub planned_takt: f64,
    pub actual_takt: f64,
    pub expected_end: Option<OffsetDateTime>,

    last_metrics: Option<OeeMetrics>,
}

impl OeeState {
    /// Initialize state from an order at first observation (spec.md §4.6).
    /// `plannedTakt = plannedDurationMinutes / plannedQuantity`; `0.0` if the
    /// order has no planned quantity yet (validated away at compute time).
    pub fn init(machine_id: MachineId, plant: String, area: String, order: &ProcessOrder) -> Self {
        let mut state = Self {
            machine_id,
            plant,
            area,
            order_id: order.order_id.clone(),
            order_number: order.order_number.to_string(),
            material_number: order.material_number.clone(),
            material_description: order.material_description.clone(),
            planned_takt: 0.0,
            actual_takt: 0.0,
            expected_end: None,
            last_metrics: None,
        };
        state.refresh_takt(order);
        state
    }

    /// Recompute `actual_takt`/`expected_end` against the order's current
    /// actual interval and production counter (spec.md §4.6):
    /// - no `ActualStart` yet: `actualTakt = plannedTakt`, `expectedEnd =
    ///   plannedEnd`.
    /// - `ActualStart` set, no `ActualEnd`: same as above (order still
    ///   running, no actual duration to measure against yet).
    /// - both actuals set: `actualTakt = actualDurationMinutes /
    ///   plannedQuantity`; `remainingTime = (plannedQuantity -
    ///   producedQuantity) * actualTakt`; `expectedEnd = ActualEnd +
    ///   remainingTime`.
    pub fn refresh_takt(&mut self, order: &ProcessOrder) {
        let planned_duration_minutes = (order.end - order.start).as_seconds_f64() / 60.0;
        self.planned_takt = if order.planned_quantity > 0.0 {
            planned_duration_minutes / order.planned_quantity
        } else {
            0.0
        };

        match (order.actual_start, order.actual_end) {
            (Some(actual_start), Some(actual_end)) => {
                let actual_duration_minutes = (actual_end - actual_start).as_seconds_f64() / 60.0;
                self.actual_takt = if order.planned_quantity > 0.0 {
                    actual_duration_minutes / order.planned_quantity
                } else {
                    0.0
                };
                let remaining_minutes =
                    (order.planned_quantity - order.produced_quantity).max(0.0) * self.actual_takt;
                self.expected_end =
                    Some(actual_end + TimeDuration::seconds((remaining_minutes * 60.0).round() as i64));
            }
            _ => {
                self.actual_takt = self.planned_takt;
                self.expected_end = Some(order.end);
            }
        }
    }

    /// The last successfully computed metrics, or `OeeError::Internal`
    /// (spec.md §4.6's `OEENotComputed`, folded into the `InternalError`
    /// kind per spec.md §7) if no compute cycle has ever succeeded for this
    /// machine.
    pub fn current_metrics(&self) -> Result<&OeeMetrics, OeeError> {
        self.last_metrics.as_ref().ok_or_else(|| {
            OeeError::internal(format!(
                "OEE queried for machine {} before any successful compute",
                self.machine_id
            ))
        })
    }
}

/// Everything needed to reproduce one OEE computation, kept as fractions
/// internally (spec.md §9 open question: percent conversion is deferred to
/// the fan-out/sink layer via `Config::oee_as_percent`, applied by
/// `as_output_value`/`fanout::scale_for_output`).
#[derive(Debug, Clone, Serialize)]
pub struct OeeMetrics {
    pub machine_id: MachineId,
    pub plant: String,
    pub area: String,
    pub order_number: String,
    pub material_number: Option<String>,
    pub material_description: Option<String>,
    pub computed_at: String,

    pub availability: f64,
    pub performance: f64,
    pub quality: f64,
    pub oee: f64,
    pub class: OeeClass,

    pub planned_quantity: f64,
    pub produced_quantity: f64,
    pub yield_quantity: f64,
    pub scrap_quantity: f64,

    pub runtime_minutes: f64,
    pub total_unplanned_downtime_minutes: f64,
    pub planned_downtime_minutes: f64,
    pub microstop_minutes: f64,
}

impl PartialEq for OeeMetrics {
    fn eq(&self, other: &Self) -> bool {
        self.machine_id == other.machine_id
            && self.order_number == other.order_number
            && self.availability == other.availability
            && self.performance == other.performance
            && self.quality == other.quality
            && self.oee == other.oee
    }
}

/// Why a compute pass didn't produce `OeeMetrics` (spec.md §7: a failed
/// cycle never updates state — the previous metrics, if any, remain
/// current).
#[derive(Debug, Clone, PartialEq)]
pub enum OeeOutcome {
    Computed(Box<OeeMetrics>),
    /// The order's own data is internally inconsistent (spec.md §3/§4.6
    /// invariants) — surfaced instead of silently clamped.
    ValidationError(String),
}

/// Non-productive-minutes breakdown the Window Engine hands to the
/// calculator for one compute cycle (spec.md §4.6 "Compute metrics" inputs).
#[derive(Debug, Clone, Copy, Default)]
pub struct NonProductiveMinutes {
    pub unplanned_downtime: f64,
    pub planned_downtime: f64,
    pub breaks: f64,
    pub microstops: f64,
}

impl NonProductiveMinutes {
    pub fn total(&self) -> f64 {
        self.planned_downtime + self.breaks + self.microstops
    }
}

/// Compute OEE for one machine's active order (spec.md §4.6). `state` is
/// mutated in place: `refresh_takt` runs first so `performance` always sees
/// the current actual takt, and a successful computation is cached as
/// `current_metrics()` for later queries; a failed one leaves the previous
/// metrics untouched.
pub fn compute_metrics(
    state: &mut OeeState,
    order: &ProcessOrder,
    non_productive: NonProductiveMinutes,
    produced_quantity: f64,
    yield_quantity: f64,
    now: OffsetDateTime,
) -> OeeOutcome {
    state.refresh_takt(order);

    if let Err(e) = order.validate_intervals() {
        return OeeOutcome::ValidationError(e.to_string());
    }

    let runtime_minutes = order.runtime_minutes();
    if runtime_minutes <= 0.0 {
        return OeeOutcome::ValidationError(format!(
            "order {}: runtime must be > 0",
            order.order_number
        ));
    }
    if order.planned_quantity <= 0.0 {
        return OeeOutcome::ValidationError(format!(
            "order {}: plannedQuantity must be > 0",
            order.order_number
        ));
    }
    if produced_quantity < 0.0 || yield_quantity < 0.0 {
        return OeeOutcome::ValidationError(format!(
            "order {}: negative production counters",
            order.order_number
        ));
    }
    if yield_quantity > produced_quantity {
        return OeeOutcome::ValidationError(format!(
            "order {}: yieldQuantity exceeds producedQuantity",
            order.order_number
        ));
    }
    if produced_quantity > order.target_performance {
        return OeeOutcome::ValidationError(format!(
            "order {}: producedQuantity exceeds targetPerformance",
            order.order_number
        ));
    }

    let availability =
        ((runtime_minutes - non_productive.unplanned_downtime) / runtime_minutes).clamp(0.0, 1.0);

    let performance = if state.actual_takt > 0.0 {
        (state.planned_takt / state.actual_takt).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let quality = if produced_quantity > 0.0 {
        (yield_quantity / produced_quantity).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let oee = availability * performance * quality;
    let scrap_quantity = produced_quantity - yield_quantity;

    let metrics = OeeMetrics {
        machine_id: state.machine_id.clone(),
        plant: state.plant.clone(),
        area: state.area.clone(),
        order_number: state.order_number.clone(),
        material_number: state.material_number.clone(),
        material_description: state.material_description.clone(),
        computed_at: now
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| now.to_string()),
        availability,
        performance,
        quality,
        oee,
        class: classify(oee),
        planned_quantity: order.planned_quantity,
        produced_quantity,
        yield_quantity,
        scrap_quantity,
        runtime_minutes,
        total_unplanned_downtime_minutes: non_productive.unplanned_downtime,
        planned_downtime_minutes: non_productive.planned_downtime,
        microstop_minutes: non_productive.microstops,
    };

    state.last_metrics = Some(metrics.clone());
    OeeOutcome::Computed(Box::new(metrics))
}

/// Scale an internal fraction to the configured output representation
/// (spec.md §9 open question — applied only at the C7 boundary).
pub fn as_output_value(fraction: f64, as_percent: bool) -> f64 {
    if as_percent {
        fraction * 100.0
    } else {
        fraction
    }
}
