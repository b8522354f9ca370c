//! MQTT Subscriber (C2, spec.md §4.2): owns the broker connection, topic
//! subscription and the Sparkplug decode/dispatch step. Built around
//! `rumqttc::{AsyncClient, EventLoop}` the same way the teacher's `main.rs`
//! drives its broker connection inside a `tokio::select!` loop, but adds the
//! connection state machine and watchdog spec.md calls for explicitly.

use crate::config::{Config, TlsMaterial};
use crate::error::OeeError;
use crate::sparkplug::{self, DecodedEnvelope};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport, TlsConfiguration};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// `spBv1.0/{plant}/{area}/{dataType}/{lineCode}/{metricName}` (spec.md §4.2).
/// `metricName` is only present on a per-metric publish; group/compound
/// payloads (DDATA/DCMD carrying many metrics in one message) omit it, so it
/// stays optional here and metric identity is instead read off each decoded
/// Sparkplug metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparkplugTopic {
    pub plant: String,
    pub area: String,
    pub data_type: DataType,
    pub line_code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Data,
    Command,
    Birth,
    Death,
    Other,
}

impl From<&str> for DataType {
    fn from(s: &str) -> Self {
        match s {
            "DDATA" | "NDATA" => DataType::Data,
            "DCMD" | "NCMD" => DataType::Command,
            "DBIRTH" | "NBIRTH" => DataType::Birth,
            "DDEATH" | "NDEATH" => DataType::Death,
            _ => DataType::Other,
        }
    }
}

/// Parse a Sparkplug topic into its grammar components. Anything that
/// doesn't fit the five-segment `spBv1.0/...` shape is rejected — callers
/// discard the message rather than guess at a malformed topic (spec.md
/// §4.2 edge cases).
pub fn parse_topic(topic: &str) -> Option<SparkplugTopic> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() < 5 || parts[0] != "spBv1.0" {
        return None;
    }
    Some(SparkplugTopic {
        plant: parts[1].to_string(),
        area: parts[2].to_string(),
        data_type: parts[3].into(),
        line_code: parts[4].to_string(),
    })
}

/// Connection lifecycle state (spec.md §4.2). Exposed for the fan-out
/// `/healthz` route and for tests; the subscriber loop is the sole writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

impl ConnectionState {
    fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Reconnecting => 3,
            ConnectionState::Stopped => 4,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Reconnecting,
            4 => ConnectionState::Stopped,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Cheap, clonable handle onto a `Subscriber`'s connection state, readable
/// from the fan-out's `/healthz` route without needing a lock on the
/// subscriber itself (spec.md §9 ambient addition: liveness reporting).
#[derive(Clone)]
pub struct ConnectionStateHandle(std::sync::Arc<std::sync::atomic::AtomicU8>);

impl ConnectionStateHandle {
    pub(crate) fn new() -> Self {
        Self(std::sync::Arc::new(std::sync::atomic::AtomicU8::new(
            ConnectionState::Disconnected.to_u8(),
        )))
    }

    fn set(&self, state: ConnectionState) {
        self.0.store(state.to_u8(), std::sync::atomic::Ordering::Relaxed);
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(std::sync::atomic::Ordering::Relaxed))
    }
}

/// A decoded message routed to the rest of the core, tagged with the topic
/// it arrived on so the Command Handler / Metric Router can tell DCMD from
/// DDATA without re-parsing.
#[derive(Debug, Clone)]
pub struct RoutedEnvelope {
    pub topic: SparkplugTopic,
    pub envelope: DecodedEnvelope,
}

const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

fn backoff_for_attempt(attempt: u32) -> Duration {
    let secs = 1u64.saturating_shl(attempt.min(6)); // 1,2,4,8,16,32,64 capped below
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

/// Build a rustls-backed `Transport` from the configured key/cert/ca paths
/// (spec.md §4.2: mutual TLS when `MQTT_TLS_*` is set). Mirrors the pack's
/// `rumqttc` + rustls wiring — build a `rustls::ClientConfig` and hand it to
/// `TlsConfiguration::Rustls` — but trusts the configured CA and presents a
/// client certificate instead of skipping verification.
fn load_tls_transport(tls: &TlsMaterial) -> Result<Transport, OeeError> {
    let read = |path: &str, what: &str| {
        std::fs::read(path).map_err(|e| OeeError::config(format!("reading MQTT TLS {what} '{path}': {e}")))
    };
    let ca_pem = read(&tls.ca_path, "ca")?;
    let cert_pem = read(&tls.cert_path, "cert")?;
    let key_pem = read(&tls.key_path, "key")?;

    let mut root_store = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca_pem.as_slice()) {
        let cert = cert.map_err(|e| OeeError::config(format!("parsing MQTT TLS ca: {e}")))?;
        root_store
            .add(cert)
            .map_err(|e| OeeError::config(format!("adding MQTT TLS ca to trust store: {e}")))?;
    }

    let cert_chain = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| OeeError::config(format!("parsing MQTT TLS client cert: {e}")))?;
    let private_key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| OeeError::config(format!("parsing MQTT TLS client key: {e}")))?
        .ok_or_else(|| OeeError::config(format!("no private key found in '{}'", tls.key_path)))?;

    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_client_auth_cert(cert_chain, private_key)
        .map_err(|e| OeeError::config(format!("building MQTT TLS client config: {e}")))?;

    Ok(Transport::tls_with_config(TlsConfiguration::Rustls(
        std::sync::Arc::new(client_config),
    )))
}

/// Drives one `AsyncClient`/`EventLoop` pair: subscribes to the configured
/// topic filter, decodes every publish and forwards it on `out`, and
/// reconnects with exponential backoff when the event loop errors or the
/// watchdog doesn't see a message within `WATCHDOG_TIMEOUT`.
pub struct Subscriber {
    client: AsyncClient,
    eventloop: EventLoop,
    topic_filter: String,
    state: ConnectionState,
    handle: ConnectionStateHandle,
    attempt: u32,
}

impl Subscriber {
    pub fn new(cfg: &Config) -> Result<Self, OeeError> {
        let mut opts = MqttOptions::new("oee-core", cfg.broker_host.clone(), cfg.broker_port);
        opts.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&cfg.mqtt_username, &cfg.mqtt_password) {
            opts.set_credentials(user.clone(), pass.clone());
        }
        if let Some(tls) = &cfg.tls {
            opts.set_transport(load_tls_transport(tls)?);
        }

        let (client, eventloop) = AsyncClient::new(opts, 64);
        Ok(Self {
            client,
            eventloop,
            topic_filter: "spBv1.0/#".to_string(),
            state: ConnectionState::Disconnected,
            handle: ConnectionStateHandle::new(),
            attempt: 0,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// A cloneable, lock-free handle onto this subscriber's connection
    /// state — handed to the fan-out's `/healthz` route at startup so
    /// liveness checks never need to reach into the subscriber task itself.
    pub fn state_handle(&self) -> ConnectionStateHandle {
        self.handle.clone()
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.handle.set(state);
    }

    /// Runs until `out` is dropped (its receiver closed) or the process is
    /// asked to stop via `stop`. Reconnect attempts grow exponentially and
    /// reset to zero on every successful connection.
    pub async fn run(
        &mut self,
        out: mpsc::Sender<RoutedEnvelope>,
        mut stop: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), OeeError> {
        self.set_state(ConnectionState::Connecting);
        let mut last_message = Instant::now();

        loop {
            if *stop.borrow() {
                self.set_state(ConnectionState::Stopped);
                let _ = self.client.disconnect().await;
                return Ok(());
            }

            let watchdog = tokio::time::sleep_until(last_message + WATCHDOG_TIMEOUT);

            tokio::select! {
                _ = stop.changed() => {
                    if *stop.borrow() {
                        self.set_state(ConnectionState::Stopped);
                        let _ = self.client.disconnect().await;
                        return Ok(());
                    }
                }
                _ = watchdog => {
                    tracing::warn!("mqtt watchdog timeout — forcing reconnect");
                    self.reconnect_with_backoff().await;
                    last_message = Instant::now();
                }
                event = self.eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            self.set_state(ConnectionState::Connected);
                            self.attempt = 0;
                            last_message = Instant::now();
                            if let Err(e) = self
                                .client
                                .subscribe(&self.topic_filter, QoS::AtLeastOnce)
                                .await
                            {
                                tracing::warn!(error = %e, "subscribe failed");
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            last_message = Instant::now();
                            self.dispatch(&publish.topic, &publish.payload, &out).await;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "mqtt event loop error");
                            self.reconnect_with_backoff().await;
                            last_message = Instant::now();
                        }
                    }
                }
            }
        }
    }

    async fn reconnect_with_backoff(&mut self) {
        self.set_state(ConnectionState::Reconnecting);
        let delay = backoff_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        tracing::info!(attempt = self.attempt, delay_secs = delay.as_secs(), "reconnecting");
        tokio::time::sleep(delay).await;
    }

    async fn dispatch(&self, topic: &str, payload: &[u8], out: &mpsc::Sender<RoutedEnvelope>) {
        let Some(parsed) = parse_topic(topic) else {
            tracing::warn!(topic, "discarding message on unparseable topic");
            return;
        };
        match sparkplug::decode_envelope(payload) {
            Ok(envelope) => {
                if out
                    .send(RoutedEnvelope { topic: parsed, envelope })
                    .await
                    .is_err()
                {
                    tracing::warn!("routed envelope dropped, receiver closed");
                }
            }
            Err(e) => {
                tracing::warn!(topic, error = %e, "discarding undecodable payload");
            }
        }
    }
}
