//! Metric Router (C4, spec.md §4.4): maintains each machine's current
//! `{metricName -> value}` view and decides, on every incoming DDATA metric,
//! whether it changed enough to warrant a recompute. Modeled on the
//! teacher's `state.rs` shared-state-behind-a-lock pattern, but keyed by
//! machine instead of by sensor node.

use crate::model::{MachineId, ProcessOrder};
use crate::sparkplug::MetricValue;
use std::collections::{HashMap, HashSet};

/// Static per-metric configuration (spec.md §4.4): whether a metric's value
/// is accepted live off MQTT while the machine reports connected
/// (`machine_connect`), or whether it belongs to the fixed mandatory-static
/// set that is instead derived once per order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MetricConfig {
    machine_connect: bool,
    mandatory_static: bool,
}

/// Metrics the core understands by name. Anything else is classified
/// `Unknown` and discarded with a warning rather than silently buffered
/// (spec.md §4.4 edge cases) — an unrecognized metric name is far more
/// often a misconfigured PLC tag than a new feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricClass {
    /// `machineConnect=true` in the configuration map: accepted from MQTT,
    /// buffered, and triggers a recompute on change.
    Live,
    /// One of the three mandatory-static metrics (`plannedProductionQuantity`,
    /// `runtime`, `targetPerformance`): never read off the wire, derived from
    /// the active process order by `apply_order_statics` instead.
    MandatoryStatic,
    Unknown,
}

fn metric_config(metric_name: &str) -> Option<MetricConfig> {
    match metric_name {
        "machineConnect" | "producedQuantity" | "yieldQuantity" | "actualTakt" => {
            Some(MetricConfig { machine_connect: true, mandatory_static: false })
        }
        "plannedProductionQuantity" | "runtime" | "targetPerformance" => {
            Some(MetricConfig { machine_connect: false, mandatory_static: true })
        }
        _ => None,
    }
}

pub fn classify(metric_name: &str) -> MetricClass {
    match metric_config(metric_name) {
        Some(c) if c.machine_connect => MetricClass::Live,
        Some(c) if c.mandatory_static => MetricClass::MandatoryStatic,
        _ => MetricClass::Unknown,
    }
}

/// Every metric name this router recognizes — live and mandatory-static —
/// used by the MQTT subscriber to build its per-machine subscription list
/// (spec.md §4.2: "for each configured metric, subscribe to the
/// corresponding topic").
pub fn known_metric_names() -> &'static [&'static str] {
    &[
        "machineConnect",
        "producedQuantity",
        "yieldQuantity",
        "actualTakt",
        "plannedProductionQuantity",
        "runtime",
        "targetPerformance",
    ]
}

/// The mandatory static metrics every machine carries regardless of what
/// arrives over MQTT, derived once per order and merged into the buffer the
/// same way a wire metric would be (spec.md §4.4: `runtime = setupMinutes +
/// processingMinutes + teardownMinutes`; the other two copy straight off the
/// order).
pub fn mandatory_static_metrics(order: &ProcessOrder) -> HashMap<String, f64> {
    let mut m = HashMap::new();
    m.insert("runtime".to_string(), order.runtime_minutes());
    m.insert("plannedProductionQuantity".to_string(), order.planned_quantity);
    m.insert("targetPerformance".to_string(), order.target_performance);
    m
}

/// Per-machine `{name -> value}` buffer plus the set of machines whose
/// buffer changed since the last drain — the coalescing point the
/// supervisor polls instead of scheduling one recompute per metric (spec.md
/// §5: "cooperative single writer per machine" wants batched, not
/// per-message, recomputation).
#[derive(Default)]
pub struct MetricRouter {
    buffers: HashMap<MachineId, HashMap<String, f64>>,
    dirty: HashSet<MachineId>,
}

impl MetricRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one decoded metric in. Returns `true` if it changed the buffer
    /// (and therefore marked the machine dirty), `false` if it was
    /// unchanged, unknown, or not a numeric value the OEE calc can use.
    pub fn ingest(&mut self, machine_id: &MachineId, name: &str, value: &MetricValue) -> bool {
        match classify(name) {
            MetricClass::Unknown => {
                tracing::warn!(machine = %machine_id, metric = name, "discarding unknown metric");
                false
            }
            MetricClass::MandatoryStatic => {
                tracing::warn!(
                    machine = %machine_id,
                    metric = name,
                    "mandatory-static metric arrived over the wire; ignoring, use apply_order_statics"
                );
                false
            }
            MetricClass::Live => {
                let Some(numeric) = value.as_f64() else {
                    tracing::warn!(machine = %machine_id, metric = name, "non-numeric value for metric");
                    return false;
                };
                self.set(machine_id, name, numeric)
            }
        }
    }

    /// Merge the order-derived mandatory-static metrics into a machine's
    /// buffer. Called whenever the active order changes (spec.md §4.6).
    pub fn apply_order_statics(&mut self, machine_id: &MachineId, order: &ProcessOrder) {
        for (name, value) in mandatory_static_metrics(order) {
            self.set(machine_id, &name, value);
        }
    }

    fn set(&mut self, machine_id: &MachineId, name: &str, value: f64) -> bool {
        let buffer = self.buffers.entry(machine_id.clone()).or_default();
        let changed = buffer.get(name).copied() != Some(value);
        buffer.insert(name.to_string(), value);
        if changed {
            self.dirty.insert(machine_id.clone());
        }
        changed
    }

    pub fn get(&self, machine_id: &MachineId, name: &str) -> Option<f64> {
        self.buffers.get(machine_id).and_then(|b| b.get(name).copied())
    }

    pub fn snapshot(&self, machine_id: &MachineId) -> HashMap<String, f64> {
        self.buffers.get(machine_id).cloned().unwrap_or_default()
    }

    /// Drain the set of machines that changed since the last drain — the
    /// supervisor calls this once per tick to decide which per-machine
    /// workers need a recompute pass.
    pub fn drain_dirty(&mut self) -> Vec<MachineId> {
        self.dirty.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OrderStatus;
    use time::macros::datetime;

    fn order() -> ProcessOrder {
        ProcessOrder {
            order_id: "o1".into(),
            order_number: "ORD-1".into(),
            machine_id: "m1".into(),
            status: OrderStatus::Released,
            start: datetime!(2024-05-01 08:00:00 UTC),
            end: datetime!(2024-05-01 09:00:00 UTC),
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
    fn classify_known_and_unknown_metrics() {
        assert_eq!(classify("machineConnect"), MetricClass::Live);
        assert_eq!(classify("producedQuantity"), MetricClass::Live);
        assert_eq!(classify("runtime"), MetricClass::MandatoryStatic);
        assert_eq!(classify("plannedProductionQuantity"), MetricClass::MandatoryStatic);
        assert_eq!(classify("targetPerformance"), MetricClass::MandatoryStatic);
        assert_eq!(classify("bogusTag"), MetricClass::Unknown);
    }

    #[test]
    fn ingest_unknown_metric_is_discarded() {
        let mut router = MetricRouter::new();
        let mid = MachineId("m1".into());
        let changed = router.ingest(&mid, "bogusTag", &MetricValue::Double(1.0));
        assert!(!changed);
        assert_eq!(router.get(&mid, "bogusTag"), None);
    }

    #[test]
    fn ingest_marks_machine_dirty_on_change() {
        let mut router = MetricRouter::new();
        let mid = MachineId("m1".into());
        assert!(router.ingest(&mid, "producedQuantity", &MetricValue::Double(10.0)));
        assert_eq!(router.drain_dirty(), vec![mid.clone()]);
        // Same value again: no change, no dirty entry.
        assert!(!router.ingest(&mid, "producedQuantity", &MetricValue::Double(10.0)));
        assert!(router.drain_dirty().is_empty());
    }

    #[test]
    fn apply_order_statics_derives_runtime_and_copies_targets() {
        let mut router = MetricRouter::new();
        let mid = MachineId("m1".into());
        router.apply_order_statics(&mid, &order());
        assert_eq!(router.get(&mid, "runtime"), Some(60.0));
        assert_eq!(router.get(&mid, "plannedProductionQuantity"), Some(60.0));
        assert_eq!(router.get(&mid, "targetPerformance"), Some(60.0));
    }

    #[test]
    fn mandatory_static_arriving_over_wire_is_ignored() {
        let mut router = MetricRouter::new();
        let mid = MachineId("m1".into());
        let changed = router.ingest(&mid, "runtime", &MetricValue::Double(999.0));
        assert!(!changed);
        assert_eq!(router.get(&mid, "runtime"), None);
    }

    #[test]
    fn snapshot_returns_empty_map_for_unknown_machine() {
        let router = MetricRouter::new();
        assert!(router.snapshot(&MachineId("none".into())).is_empty());
    }
}
