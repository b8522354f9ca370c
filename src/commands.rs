//! Command Handler (C3, spec.md §4.3): tracks Hold/Unhold DCMD metrics per
//! machine and turns a matched Hold→Unhold pair into an unplanned downtime
//! record. Modeled on the teacher's `scheduler.rs` per-entity state machine
//! (guard-clause-heavy handlers, a small enum of outcomes) rather than on a
//! single boolean flag, since a machine can have more than one order with an
//! outstanding hold at a time.

use crate::model::{DowntimeRecord, MachineId, OrderNumber, ProcessOrder};
use std::collections::HashMap;
use time::OffsetDateTime;

/// One outstanding Hold waiting for its matching Unhold.
#[derive(Debug, Clone)]
struct OpenHold {
    started_at: OffsetDateTime,
}

/// Per-machine Hold state: a stack per order number, per spec.md §4.3 — the
/// same order can be held multiple times in sequence (e.g. two consecutive
/// short stops before the order completes), and holds for different orders
/// on the same machine must not interfere with each other.
#[derive(Default)]
pub struct CommandHandler {
    holds: HashMap<MachineId, HashMap<OrderNumber, Vec<OpenHold>>>,
}

/// What happened as a result of feeding in a DCMD metric.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// A Hold was opened.
    HoldOpened,
    /// Hold ignored: value wasn't a true/1, or there's no released order for
    /// the machine to hold against.
    HoldIgnored,
    /// Unhold closed a hold whose duration fell below `threshold_seconds`;
    /// discarded without producing a downtime record.
    UnholdDiscarded,
    /// Unhold closed a hold at or above `threshold_seconds`; produced this
    /// record.
    UnholdRecorded(DowntimeRecord),
    /// Unhold with no matching open Hold for this machine/order.
    UnholdUnmatched,
}

impl CommandHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Hold` metric received with boolean/numeric value `1` (true). Ignored
    /// if the value isn't truthy, or if the caller has no released order to
    /// attribute the hold to (spec.md §4.3 edge cases).
    pub fn hold(
        &mut self,
        machine_id: &MachineId,
        order: Option<&ProcessOrder>,
        value_is_true: bool,
        now: OffsetDateTime,
    ) -> CommandOutcome {
        let Some(order) = order else {
            return CommandOutcome::HoldIgnored;
        };
        if !value_is_true {
            return CommandOutcome::HoldIgnored;
        }

        self.holds
            .entry(machine_id.clone())
            .or_default()
            .entry(order.order_number.clone())
            .or_default()
            .push(OpenHold { started_at: now });

        CommandOutcome::HoldOpened
    }

    /// `Unhold` metric received. Pops the most recent open hold for this
    /// machine/order. An unmatched Unhold (nothing open) is logged by the
    /// caller and otherwise ignored — it never panics or creates a negative
    /// duration record.
    pub fn unhold(
        &mut self,
        machine_id: &MachineId,
        order: Option<&ProcessOrder>,
        threshold_seconds: i64,
        now: OffsetDateTime,
    ) -> CommandOutcome {
        let Some(order) = order else {
            return CommandOutcome::UnholdUnmatched;
        };
        let order_number = &order.order_number;

        let Some(machine_holds) = self.holds.get_mut(machine_id) else {
            return CommandOutcome::UnholdUnmatched;
        };
        let Some(stack) = machine_holds.get_mut(order_number) else {
            return CommandOutcome::UnholdUnmatched;
        };
        let Some(open) = stack.pop() else {
            return CommandOutcome::UnholdUnmatched;
        };

        if stack.is_empty() {
            machine_holds.remove(order_number);
        }
        if machine_holds.is_empty() {
            self.holds.remove(machine_id);
        }

        let elapsed = (now - open.started_at).whole_seconds();
        if elapsed < threshold_seconds {
            return CommandOutcome::UnholdDiscarded;
        }

        let record = DowntimeRecord::new(
            machine_id.clone(),
            Some(order.order_id.clone()),
            Some(order_number.clone()),
            open.started_at,
            now,
            "tbd",
        );
        CommandOutcome::UnholdRecorded(record)
    }

    /// Number of machines with at least one outstanding hold — used by the
    /// supervisor's shutdown path to log anything still open.
    pub fn open_machine_count(&self) -> usize {
        self.holds.len()
    }
}
