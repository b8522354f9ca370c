//! Supervisor (C8, spec.md §4.8): owns one worker task per machine, routes
//! MQTT-decoded envelopes and coalesced recompute signals to them, and
//! drains in-flight work on shutdown. Modeled on the teacher's `main.rs`
//! event loop — a single `tokio::select!` pump reading off channels — but
//! generalized from "one hub handling all zones inline" to "one task per
//! machine" since spec.md §5 calls for per-machine isolation ("cooperative
//! single writer").

use crate::commands::{CommandHandler, CommandOutcome};
use crate::config::Config;
use crate::fanout::Fanout;
use crate::metrics::MetricRouter;
use crate::model::{MachineId, ProcessOrder};
use crate::mqtt::{DataType, RoutedEnvelope};
use crate::oee::{self, NonProductiveMinutes, OeeOutcome, OeeState};
use crate::refdata::RefdataClient;
use crate::sparkplug::MetricValue;
use crate::window;
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Bounded so a burst of metrics for one machine coalesces rather than
/// growing unbounded memory — new envelopes are still delivered, but a
/// worker that falls behind processes fewer, larger recompute passes
/// instead of an ever-growing backlog (spec.md §5).
const PER_MACHINE_QUEUE_DEPTH: usize = 256;

struct MachineWorker {
    handle: JoinHandle<()>,
    sender: mpsc::Sender<RoutedEnvelope>,
}

/// Orchestrates machine workers: looks up (or lazily spawns) the worker for
/// a machine as envelopes for it arrive, and fans shutdown out to all of
/// them within the configured grace window.
pub struct Supervisor {
    config: Arc<Config>,
    refdata: Arc<RefdataClient>,
    fanout: Arc<Fanout>,
    workers: tokio::sync::Mutex<HashMap<MachineId, MachineWorker>>,
}

impl Supervisor {
    pub fn new(config: Arc<Config>, refdata: Arc<RefdataClient>, fanout: Arc<Fanout>) -> Arc<Self> {
        Arc::new(Self {
            config,
            refdata,
            fanout,
            workers: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Route one decoded MQTT envelope to the right machine's worker,
    /// spawning the worker on first sight of that machine. Resolution of
    /// `lineCode -> MachineId` goes through the reference data cache
    /// (spec.md §4.1).
    pub async fn route(&self, routed: RoutedEnvelope) {
        let machine_id = match self
            .refdata
            .resolve_machine_id_by_line_code(&routed.topic.line_code)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(line_code = %routed.topic.line_code, error = %e, "could not resolve machine for topic");
                return;
            }
        };

        let mut workers = self.workers.lock().await;
        let worker = workers.entry(machine_id.clone()).or_insert_with(|| {
            self.spawn_worker(machine_id.clone())
        });

        if worker.sender.try_send(routed).is_err() {
            tracing::warn!(machine = %machine_id, "per-machine queue full, dropping oldest work is not possible with mpsc — envelope discarded");
        }
    }

    fn spawn_worker(&self, machine_id: MachineId) -> MachineWorker {
        let (tx, rx) = mpsc::channel(PER_MACHINE_QUEUE_DEPTH);
        let config = self.config.clone();
        let refdata = self.refdata.clone();
        let fanout = self.fanout.clone();
        let handle = tokio::spawn(machine_worker_loop(machine_id, config, refdata, fanout, rx));
        MachineWorker { handle, sender: tx }
    }

    /// Drain every worker, giving each up to `config.shutdown_grace` to
    /// finish in-flight computations before the process abandons it
    /// (spec.md §4.8).
    pub async fn shutdown(&self) {
        let mut workers = self.workers.lock().await;
        for (machine_id, worker) in workers.drain() {
            drop(worker.sender);
            match tokio::time::timeout(self.config.shutdown_grace, worker.handle).await {
                Ok(Ok(())) => tracing::info!(machine = %machine_id, "worker drained"),
                Ok(Err(e)) => tracing::warn!(machine = %machine_id, error = %e, "worker panicked"),
                Err(_) => tracing::warn!(machine = %machine_id, "worker did not finish within shutdown grace"),
            }
        }
    }
}

/// Per-machine cooperative single-writer loop: owns this machine's command
/// state and metric buffer exclusively, so no locking is needed within a
/// worker (spec.md §5).
async fn machine_worker_loop(
    machine_id: MachineId,
    config: Arc<Config>,
    refdata: Arc<RefdataClient>,
    fanout: Arc<Fanout>,
    mut rx: mpsc::Receiver<RoutedEnvelope>,
) {
    let mut commands = CommandHandler::new();
    let mut router = MetricRouter::new();
    let mut oee_state: Option<OeeState> = None;

    while let Some(routed) = rx.recv().await {
        let order = match refdata.active_orders(&machine_id).await {
            Ok(orders) => orders.into_iter().next(),
            Err(e) => {
                tracing::warn!(machine = %machine_id, error = %e, "no active order available");
                None
            }
        };

        if let Some(order) = &order {
            router.apply_order_statics(&machine_id, order);
        }

        for metric in &routed.envelope.metrics {
            match routed.topic.data_type {
                DataType::Command => {
                    dispatch_command(
                        &machine_id,
                        order.as_ref(),
                        &metric.name,
                        &metric.value,
                        &config,
                        &refdata,
                        &mut commands,
                        routed.envelope.timestamp,
                    )
                    .await;
                }
                DataType::Data => {
                    router.ingest(&machine_id, &metric.name, &metric.value);
                }
                _ => {}
            }
        }

        let dirty = !router.drain_dirty().is_empty();
        if dirty || matches!(routed.topic.data_type, DataType::Data) {
            if let Some(order) = &order {
                recompute(&machine_id, &refdata, &fanout, &router, order, &mut oee_state).await;
            }
        }
    }
}

async fn dispatch_command(
    machine_id: &MachineId,
    order: Option<&ProcessOrder>,
    metric_name: &str,
    value: &MetricValue,
    config: &Config,
    refdata: &RefdataClient,
    commands: &mut CommandHandler,
    now: OffsetDateTime,
) {
    let is_true = value.as_f64().map(|v| v != 0.0).unwrap_or(false);
    let outcome = match metric_name {
        "Hold" => commands.hold(machine_id, order, is_true, now),
        "Unhold" => commands.unhold(machine_id, order, config.threshold_seconds, now),
        other => {
            tracing::warn!(machine = %machine_id, metric = other, "unrecognized DCMD metric");
            return;
        }
    };

    match outcome {
        CommandOutcome::UnholdRecorded(record) => {
            if let Err(e) = refdata.append_unplanned_downtime(&record).await {
                tracing::warn!(machine = %machine_id, error = %e, "failed to append downtime record");
            }
        }
        CommandOutcome::UnholdUnmatched => {
            tracing::warn!(machine = %machine_id, "unmatched Unhold command");
        }
        CommandOutcome::HoldOpened | CommandOutcome::HoldIgnored | CommandOutcome::UnholdDiscarded => {}
    }
}

/// One recompute cycle: rebuild the window's hour buckets from the
/// reference-data collections, fold them into a `NonProductiveMinutes`
/// summary, and feed that plus the machine's current live production
/// counters into the OEE calculator. `producedQuantity`/`yieldQuantity` are
/// read from the live metric buffer when the machine has reported them over
/// MQTT, falling back to the order snapshot's counters before the first
/// live reading arrives (spec.md §4.6: "current producedQuantity, current
/// yieldQuantity").
async fn recompute(
    machine_id: &MachineId,
    refdata: &RefdataClient,
    fanout: &Fanout,
    router: &MetricRouter,
    order: &ProcessOrder,
    oee_state: &mut Option<OeeState>,
) {
    let now = OffsetDateTime::now_utc();
    let window_start = order.window_start();
    let window_end = now.min(order.window_end());

    let shifts = match refdata.shift_models(machine_id).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(machine = %machine_id, error = %e, "no shift model, skipping break accounting");
            Vec::new()
        }
    };

    let breaks: Vec<window::MaterializedBreak> = shifts
        .iter()
        .flat_map(|shift| {
            window::materialize_breaks(
                window_start,
                window_end,
                shift.shift_start,
                shift.break_start,
                shift.break_end,
            )
        })
        .collect();

    let planned = refdata.load_planned_downtime().await.unwrap_or_default();
    let unplanned = refdata.load_unplanned_downtime().await.unwrap_or_default();
    let microstops = refdata.load_microstops().await.unwrap_or_default();

    let buckets = window::compute_buckets(
        machine_id,
        window_start,
        window_end,
        &planned,
        &unplanned,
        &microstops,
        &breaks,
    );

    let non_productive = buckets.iter().fold(NonProductiveMinutes::default(), |acc, b| {
        NonProductiveMinutes {
            unplanned_downtime: acc.unplanned_downtime + b.unplanned_downtime_minutes,
            planned_downtime: acc.planned_downtime + b.planned_downtime_minutes,
            breaks: acc.breaks + b.break_minutes,
            microstops: acc.microstops + b.microstop_minutes,
        }
    });

    let produced_quantity = router
        .get(machine_id, "producedQuantity")
        .unwrap_or(order.produced_quantity);
    let yield_quantity = router
        .get(machine_id, "yieldQuantity")
        .unwrap_or(order.yield_quantity);

    let state = match oee_state {
        Some(state) if state.order_id == order.order_id => state,
        _ => {
            let machine = refdata.machine(machine_id).await.ok();
            let (plant, area) = machine
                .map(|m| (m.plant, m.area))
                .unwrap_or_else(|| ("unknown".to_string(), "unknown".to_string()));
            *oee_state = Some(OeeState::init(machine_id.clone(), plant, area, order));
            oee_state.as_mut().expect("just initialized")
        }
    };

    match oee::compute_metrics(state, order, non_productive, produced_quantity, yield_quantity, now) {
        OeeOutcome::Computed(metrics) => {
            let completed = order.status == crate::model::OrderStatus::Completed;
            fanout.broadcast_oee(*metrics, completed).await;
        }
        OeeOutcome::ValidationError(reason) => {
            tracing::warn!(machine = %machine_id, reason, "order failed validation");
        }
    }

    fanout
        .broadcast_microstops(machine_id.clone(), microstops)
        .await;
}
