//! Reference Data Client (C1, spec.md §4.1): a read-through cache in front
//! of the external REST reference-data provider, built the way the teacher's
//! `db.rs` wraps its storage layer behind a handful of narrow `async fn`s —
//! except the backing store here is `reqwest` against HTTP instead of sqlx
//! against SQLite, since there is nothing to persist locally (§1 Non-goals).
//!
//! Every collection is fetched once and cached for the process lifetime
//! (spec.md §4.1); per-machine filtering happens at the call site (the
//! Window Engine) rather than on the HTTP request, since the upstream
//! endpoints for downtime/micro-stops (§6) return the whole collection with
//! no query parameters.

use crate::error::OeeError;
use crate::model::{DowntimeRecord, Machine, MachineId, ProcessOrder, Shift};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use time::{OffsetDateTime, Time};
use tokio::sync::RwLock;

/// Wire shape for a shift as returned by the reference data provider: plain
/// RFC3339 timestamps, from which only the time-of-day component survives
/// into `model::Shift` (§4.5 materializes shifts against a calendar day at
/// use time, never ahead of it).
#[derive(Debug, Deserialize)]
struct ShiftWire {
    machine_id: String,
    #[serde(with = "time::serde::rfc3339")]
    shift_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    shift_end: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    break_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    break_end: OffsetDateTime,
}

impl From<ShiftWire> for Shift {
    fn from(w: ShiftWire) -> Self {
        Shift {
            machine_id: MachineId(w.machine_id),
            shift_start: time_of(w.shift_start),
            shift_end: time_of(w.shift_end),
            break_start: time_of(w.break_start),
            break_end: time_of(w.break_end),
        }
    }
}

fn time_of(dt: OffsetDateTime) -> Time {
    Time::from_hms(dt.hour(), dt.minute(), dt.second()).expect("valid hms from OffsetDateTime")
}

/// Which cache an `invalidate` call targets (spec.md §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Machines,
    Orders,
    Shifts,
    PlannedDowntime,
    UnplannedDowntime,
    Microstops,
    All,
}

#[derive(Default)]
struct Caches {
    machines: Option<Vec<Machine>>,
    /// Active ("released") orders, keyed by machine, per spec.md §4.1's
    /// `loadActiveOrder(machineId)`.
    active_orders: Option<HashMap<MachineId, Vec<ProcessOrder>>>,
    shifts: Option<HashMap<MachineId, Vec<Shift>>>,
    planned_downtime: Option<Vec<DowntimeRecord>>,
    unplanned_downtime: Option<Vec<DowntimeRecord>>,
    microstops: Option<Vec<DowntimeRecord>>,
}

/// Read-through REST cache for machines, active orders, shift models and
/// downtime/micro-stop records. Every miss fetches from `base_url` (or
/// `planned_downtime_override_url` for planned downtime, per spec.md §6's
/// `plannedDowntimeApiUrl`) and populates the relevant cache; every failure
/// is surfaced as `OeeError::SourceUnavailable` or `OeeError::Decode` so
/// callers (the Window/OEE engines) can treat a provider outage as "can't
/// compute right now" rather than panic.
pub struct RefdataClient {
    http: reqwest::Client,
    base_url: String,
    planned_downtime_override_url: Option<String>,
    cache: RwLock<Caches>,
    /// Unix seconds of the last successful upstream fetch, `0` if none yet —
    /// read by the fan-out's `/healthz` route (spec.md §9 ambient addition).
    last_fetch_success: std::sync::atomic::AtomicI64,
}

impl RefdataClient {
    pub fn new(base_url: impl Into<String>) -> Arc<Self> {
        Self::with_planned_downtime_override(base_url, None)
    }

    pub fn with_planned_downtime_override(
        base_url: impl Into<String>,
        planned_downtime_override_url: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            planned_downtime_override_url,
            cache: RwLock::new(Caches::default()),
            last_fetch_success: std::sync::atomic::AtomicI64::new(0),
        })
    }

    /// Unix timestamp of the last successful upstream fetch of any kind, or
    /// `None` if the process has never completed one.
    pub fn last_fetch_success_unix(&self) -> Option<i64> {
        match self.last_fetch_success.load(std::sync::atomic::Ordering::Relaxed) {
            0 => None,
            ts => Some(ts),
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T, OeeError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| OeeError::source_unavailable(format!("GET {url} failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(OeeError::source_unavailable(format!(
                "GET {url} returned {}",
                resp.status()
            )));
        }

        let parsed = resp
            .json::<T>()
            .await
            .map_err(|e| OeeError::decode(format!("malformed response from {url}: {e}")))?;

        self.last_fetch_success.store(
            OffsetDateTime::now_utc().unix_timestamp(),
            std::sync::atomic::Ordering::Relaxed,
        );
        Ok(parsed)
    }

    /// `loadMachines()` (spec.md §4.1, §6 `GET /machines`).
    pub async fn load_machines(&self) -> Result<Vec<Machine>, OeeError> {
        if let Some(m) = self.cache.read().await.machines.as_ref() {
            return Ok(m.clone());
        }
        let machines: Vec<Machine> = self.get_json(&format!("{}/machines", self.base_url)).await?;
        self.cache.write().await.machines = Some(machines.clone());
        Ok(machines)
    }

    pub async fn machine(&self, id: &MachineId) -> Result<Machine, OeeError> {
        self.load_machines()
            .await?
            .into_iter()
            .find(|m| &m.machine_id == id)
            .ok_or_else(|| OeeError::source_unavailable(format!("unknown machine {id}")))
    }

    /// Resolve a Sparkplug `lineCode` topic segment to the `MachineId` the
    /// rest of the core keys state by (§4.1). Only machines with
    /// `oeeEnabled=true` resolve — §4.2 gates subscription/processing on
    /// that flag, and this is the one place every inbound topic passes
    /// through before any state is touched.
    pub async fn resolve_machine_id_by_line_code(
        &self,
        line_code: &str,
    ) -> Result<MachineId, OeeError> {
        self.load_machines()
            .await?
            .into_iter()
            .find(|m| m.line_code == line_code && m.oee_enabled)
            .map(|m| m.machine_id)
            .ok_or_else(|| {
                OeeError::source_unavailable(format!(
                    "no OEE-enabled machine with lineCode {line_code}"
                ))
            })
    }

    /// `loadActiveOrder(machineId)` (spec.md §4.1, §6 `GET
    /// /processorders/rel?machineId=<id>&mark=true`): "the first element, if
    /// any, is the active released order." Cached per machine since each
    /// machine's active order is fetched independently from the upstream.
    pub async fn active_orders(&self, id: &MachineId) -> Result<Vec<ProcessOrder>, OeeError> {
        if let Some(orders) = self
            .cache
            .read()
            .await
            .active_orders
            .as_ref()
            .and_then(|o| o.get(id))
        {
            return Ok(orders.clone());
        }

        let url = format!(
            "{}/processorders/rel?machineId={}&mark=true",
            self.base_url, id.0
        );
        let orders: Vec<ProcessOrder> = self.get_json(&url).await?;

        let mut cache = self.cache.write().await;
        let by_machine = cache.active_orders.get_or_insert_with(HashMap::new);
        by_machine.insert(id.clone(), orders.clone());
        Ok(orders)
    }

    /// `loadShiftModels(machineId)` (spec.md §4.1, §6 `GET
    /// /shiftmodels/machine/<id>`).
    pub async fn shift_models(&self, id: &MachineId) -> Result<Vec<Shift>, OeeError> {
        if let Some(s) = self.cache.read().await.shifts.as_ref().and_then(|m| m.get(id)) {
            return Ok(s.clone());
        }

        let url = format!("{}/shiftmodels/machine/{}", self.base_url, id.0);
        let wire: Vec<ShiftWire> = self.get_json(&url).await?;
        let shifts: Vec<Shift> = wire.into_iter().map(Into::into).collect();

        let mut cache = self.cache.write().await;
        let by_machine = cache.shifts.get_or_insert_with(HashMap::new);
        by_machine.insert(id.clone(), shifts.clone());
        Ok(shifts)
    }

    /// `loadPlannedDowntime()` (spec.md §4.1, §6 `GET /planneddowntime`).
    /// Returns the whole collection; callers filter by `machineId` and order
    /// overlap (§4.5). Honors `plannedDowntimeApiUrl` when configured.
    pub async fn load_planned_downtime(&self) -> Result<Vec<DowntimeRecord>, OeeError> {
        if let Some(records) = self.cache.read().await.planned_downtime.as_ref() {
            return Ok(records.clone());
        }
        let url = match &self.planned_downtime_override_url {
            Some(override_url) => override_url.clone(),
            None => format!("{}/planneddowntime", self.base_url),
        };
        let records: Vec<DowntimeRecord> = self.get_json(&url).await?;
        self.cache.write().await.planned_downtime = Some(records.clone());
        Ok(records)
    }

    /// `loadUnplannedDowntime()` (spec.md §4.1, §6 `GET /unplanneddowntime`).
    pub async fn load_unplanned_downtime(&self) -> Result<Vec<DowntimeRecord>, OeeError> {
        if let Some(records) = self.cache.read().await.unplanned_downtime.as_ref() {
            return Ok(records.clone());
        }
        let url = format!("{}/unplanneddowntime", self.base_url);
        let records: Vec<DowntimeRecord> = self.get_json(&url).await?;
        self.cache.write().await.unplanned_downtime = Some(records.clone());
        Ok(records)
    }

    /// `loadMicrostops()` (spec.md §4.1, §6 `GET /microstops`).
    pub async fn load_microstops(&self) -> Result<Vec<DowntimeRecord>, OeeError> {
        if let Some(records) = self.cache.read().await.microstops.as_ref() {
            return Ok(records.clone());
        }
        let url = format!("{}/microstops", self.base_url);
        let records: Vec<DowntimeRecord> = self.get_json(&url).await?;
        self.cache.write().await.microstops = Some(records.clone());
        Ok(records)
    }

    /// `appendUnplannedDowntime(record)` (spec.md §4.1, §6 `POST
    /// /unplanneddowntime`) — the only write the core performs on reference
    /// data. Invalidates the unplanned-downtime cache so the next window
    /// computation observes it.
    pub async fn append_unplanned_downtime(&self, record: &DowntimeRecord) -> Result<(), OeeError> {
        let url = format!("{}/unplanneddowntime", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(record)
            .send()
            .await
            .map_err(|e| OeeError::sink(format!("POST {url} failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(OeeError::sink(format!(
                "POST {url} returned {}",
                resp.status()
            )));
        }

        self.invalidate(CacheKind::UnplannedDowntime).await;
        Ok(())
    }

    pub async fn invalidate(&self, kind: CacheKind) {
        let mut cache = self.cache.write().await;
        match kind {
            CacheKind::Machines => cache.machines = None,
            CacheKind::Orders => cache.active_orders = None,
            CacheKind::Shifts => cache.shifts = None,
            CacheKind::PlannedDowntime => cache.planned_downtime = None,
            CacheKind::UnplannedDowntime => cache.unplanned_downtime = None,
            CacheKind::Microstops => cache.microstops = None,
            CacheKind::All => *cache = Caches::default(),
        }
    }
}
