//! Fan-out & Sink (C7, spec.md §4.7): pushes `OeeMetrics`/microstop updates
//! to connected dashboard clients over WebSocket, and optionally mirrors
//! completed-order metrics to a time-series backend. The `Router`/`AppState`
//! shape follows the teacher's `web.rs` almost exactly; the broadcast
//! registry and `TimeseriesSink` trait are new, grounded on the pack's
//! axum-with-`ws` usage (`get-convex-convex-backend`) and `reqwest` HTTP
//! sink usage (`adamtc007-ob-poc`).

use crate::model::{DowntimeRecord, MachineId};
use crate::oee::OeeMetrics;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};

/// Envelope shapes pushed to dashboard clients. Tagged so a single
/// WebSocket stream can carry both OEE updates and microstop snapshots
/// (spec.md §4.7).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FanoutMessage {
    OeeData(Box<OeeMetrics>),
    Microstops {
        machine_id: MachineId,
        windows: Vec<DowntimeRecord>,
    },
}

const CLIENT_BUFFER: usize = 64;

struct Client {
    sender: mpsc::Sender<FanoutMessage>,
}

/// Registry of connected dashboard clients plus the last microstop snapshot
/// per machine, so a freshly connected client gets a snapshot before any
/// incremental update (spec.md §4.7: "initial connection receives
/// Microstops before anything else").
#[derive(Default)]
struct Registry {
    clients: HashMap<u64, Client>,
    last_microstops: HashMap<MachineId, Vec<DowntimeRecord>>,
}

pub struct Fanout {
    registry: RwLock<Registry>,
    next_client_id: AtomicU64,
    sink: Option<Arc<dyn TimeseriesSink>>,
    sink_on_completion_only: bool,
    oee_as_percent: bool,
}

impl Fanout {
    pub fn new(
        sink: Option<Arc<dyn TimeseriesSink>>,
        sink_on_completion_only: bool,
        oee_as_percent: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: RwLock::new(Registry::default()),
            next_client_id: AtomicU64::new(1),
            sink,
            sink_on_completion_only,
            oee_as_percent,
        })
    }

    /// Broadcast an OEE update to every connected client. A client whose
    /// buffer is full is dropped from this broadcast — slow consumers never
    /// back-pressure the machine workers (spec.md §4.7). `oeeAsPercent` is
    /// applied here, at the boundary where metrics leave the calculator —
    /// the calculator itself always holds fractions (spec.md §9).
    pub async fn broadcast_oee(&self, mut metrics: OeeMetrics, order_completed: bool) {
        metrics.availability = crate::oee::as_output_value(metrics.availability, self.oee_as_percent);
        metrics.performance = crate::oee::as_output_value(metrics.performance, self.oee_as_percent);
        metrics.quality = crate::oee::as_output_value(metrics.quality, self.oee_as_percent);
        metrics.oee = crate::oee::as_output_value(metrics.oee, self.oee_as_percent);

        if let Some(sink) = &self.sink {
            if !self.sink_on_completion_only || order_completed {
                if let Err(e) = sink.write(&metrics).await {
                    tracing::warn!(error = %e, "time-series sink write failed");
                }
            }
        }

        let msg = FanoutMessage::OeeData(Box::new(metrics));
        self.send_to_all(msg).await;
    }

    pub async fn broadcast_microstops(&self, machine_id: MachineId, windows: Vec<DowntimeRecord>) {
        {
            let mut reg = self.registry.write().await;
            reg.last_microstops.insert(machine_id.clone(), windows.clone());
        }
        self.send_to_all(FanoutMessage::Microstops { machine_id, windows })
            .await;
    }

    async fn send_to_all(&self, msg: FanoutMessage) {
        let mut reg = self.registry.write().await;
        let mut dead = Vec::new();
        for (id, client) in reg.clients.iter() {
            if client.sender.try_send(msg.clone()).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            reg.clients.remove(&id);
        }
    }

    async fn register(&self) -> (u64, mpsc::Receiver<FanoutMessage>, Vec<(MachineId, Vec<DowntimeRecord>)>) {
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        let mut reg = self.registry.write().await;
        let id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
        reg.clients.insert(id, Client { sender: tx });
        let snapshot = reg
            .last_microstops
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        (id, rx, snapshot)
    }

    async fn unregister(&self, id: u64) {
        self.registry.write().await.clients.remove(&id);
    }
}

/// Optional mirror of completed-order OEE metrics to an external
/// time-series store (spec.md §4.7, §9 open question on write cadence).
#[async_trait]
pub trait TimeseriesSink: Send + Sync {
    async fn write(&self, metrics: &OeeMetrics) -> Result<(), crate::error::OeeError>;
}

pub struct NullSink;

#[async_trait]
impl TimeseriesSink for NullSink {
    async fn write(&self, _metrics: &OeeMetrics) -> Result<(), crate::error::OeeError> {
        Ok(())
    }
}

/// Line-protocol-over-HTTP sink (InfluxDB-compatible `/write` endpoint),
/// using the same `reqwest` client style as `refdata::RefdataClient`.
pub struct HttpTimeseriesSink {
    http: reqwest::Client,
    url: String,
    token: String,
    org: String,
    bucket: String,
}

impl HttpTimeseriesSink {
    pub fn new(url: impl Into<String>, token: impl Into<String>, org: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            token: token.into(),
            org: org.into(),
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl TimeseriesSink for HttpTimeseriesSink {
    async fn write(&self, metrics: &OeeMetrics) -> Result<(), crate::error::OeeError> {
        // Tag set: {plant, area, machineId, orderNumber, materialNumber,
        // materialDescription}; field set: {oee, availability, performance,
        // quality, plannedQuantity, plannedDowntimeMinutes,
        // unplannedDowntimeMinutes, microstopMinutes} (spec.md §4.7).
        let material_number = metrics.material_number.as_deref().unwrap_or("unknown");
        let material_description = metrics
            .material_description
            .as_deref()
            .unwrap_or("unknown")
            .replace(' ', "\\ ");
        let line = format!(
            "oee_metrics,plant={},area={},machine_id={},order_number={},material_number={},material_description={} \
             oee={},availability={},performance={},quality={},planned_quantity={},planned_downtime_minutes={},\
             unplanned_downtime_minutes={},microstop_minutes={}",
            metrics.plant,
            metrics.area,
            metrics.machine_id,
            metrics.order_number,
            material_number,
            material_description,
            metrics.oee,
            metrics.availability,
            metrics.performance,
            metrics.quality,
            metrics.planned_quantity,
            metrics.planned_downtime_minutes,
            metrics.total_unplanned_downtime_minutes,
            metrics.microstop_minutes,
        );
        let endpoint = format!(
            "{}/api/v2/write?org={}&bucket={}",
            self.url, self.org, self.bucket
        );
        let resp = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.token)
            .body(line)
            .send()
            .await
            .map_err(|e| crate::error::OeeError::sink(format!("timeseries write failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(crate::error::OeeError::sink(format!(
                "timeseries write returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

/// Liveness inputs for `/healthz`, kept separate from `Fanout` itself since
/// neither the MQTT connection state nor the reference-data cache's last
/// fetch time are this component's own state — they're handed in at
/// startup so the route can report on them without reaching across task
/// boundaries (spec.md §9 ambient addition).
#[derive(Clone)]
pub struct HealthState {
    pub mqtt: crate::mqtt::ConnectionStateHandle,
    pub refdata: Arc<crate::refdata::RefdataClient>,
}

#[derive(Clone)]
pub struct AppState {
    pub fanout: Arc<Fanout>,
    pub health: HealthState,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let mqtt_state = match state.health.mqtt.get() {
        crate::mqtt::ConnectionState::Disconnected => "disconnected",
        crate::mqtt::ConnectionState::Connecting => "connecting",
        crate::mqtt::ConnectionState::Connected => "connected",
        crate::mqtt::ConnectionState::Reconnecting => "reconnecting",
        crate::mqtt::ConnectionState::Stopped => "stopped",
    };
    axum::Json(serde_json::json!({
        "status": "ok",
        "mqtt": mqtt_state,
        "lastRefdataFetchUnix": state.health.refdata.last_fetch_success_unix(),
    }))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let (id, mut rx, snapshot) = state.fanout.register().await;

    for (machine_id, windows) in snapshot {
        let msg = FanoutMessage::Microstops { machine_id, windows };
        if let Ok(json) = serde_json::to_string(&msg) {
            if socket.send(Message::Text(json)).await.is_err() {
                state.fanout.unregister(id).await;
                return;
            }
        }
    }

    while let Some(msg) = rx.recv().await {
        let Ok(json) = serde_json::to_string(&msg) else {
            continue;
        };
        if socket.send(Message::Text(json)).await.is_err() {
            break;
        }
    }

    state.fanout.unregister(id).await;
}

pub async fn serve(
    fanout: Arc<Fanout>,
    health: HealthState,
    port: u16,
) -> Result<(), crate::error::OeeError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| crate::error::OeeError::internal(format!("failed to bind web port: {e}")))?;

    tracing::info!(%addr, "dashboard listening");
    axum::serve(listener, router(AppState { fanout, health }))
        .await
        .map_err(|e| crate::error::OeeError::internal(format!("web server error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_health_state() -> HealthState {
        HealthState {
            mqtt: crate::mqtt::ConnectionStateHandle::new(),
            refdata: crate::refdata::RefdataClient::new("http://127.0.0.1:1"),
        }
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let fanout = Fanout::new(None, false, false);
        let app = router(AppState { fanout, health: test_health_state() });
        let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["mqtt"], "disconnected");
        assert!(json["lastRefdataFetchUnix"].is_null());
    }

    #[tokio::test]
    async fn register_then_unregister_empties_registry() {
        let fanout = Fanout::new(None, false, false);
        let (id, _rx, snapshot) = fanout.register().await;
        assert!(snapshot.is_empty());
        assert_eq!(fanout.registry.read().await.clients.len(), 1);
        fanout.unregister(id).await;
        assert_eq!(fanout.registry.read().await.clients.len(), 0);
    }

    #[tokio::test]
    async fn broadcast_microstops_is_retained_as_snapshot_for_new_clients() {
        let fanout = Fanout::new(None, false, false);
        let mid = MachineId("m1".into());
        fanout.broadcast_microstops(mid.clone(), vec![]).await;
        let (_id, _rx, snapshot) = fanout.register().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, mid);
    }

    #[tokio::test]
    async fn null_sink_accepts_any_metrics() {
        let sink = NullSink;
        let metrics = OeeMetrics {
            machine_id: MachineId("m1".into()),
            plant: "plant-1".into(),
            area: "area-1".into(),
            order_number: "o1".into(),
            material_number: None,
            material_description: None,
            computed_at: "2024-05-01T08:00:00Z".into(),
            availability: 1.0,
            performance: 1.0,
            quality: 1.0,
            oee: 1.0,
            class: crate::oee::OeeClass::WorldClass,
            planned_quantity: 60.0,
            produced_quantity: 100.0,
            yield_quantity: 100.0,
            scrap_quantity: 0.0,
            runtime_minutes: 60.0,
            total_unplanned_downtime_minutes: 0.0,
            planned_downtime_minutes: 0.0,
            microstop_minutes: 0.0,
        };
        assert!(sink.write(&metrics).await.is_ok());
    }
}
