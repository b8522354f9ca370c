//! OEE core entry point: reads env config, wires up the reference data
//! client, MQTT subscriber, per-machine supervisor and WebSocket fan-out,
//! then runs until SIGINT/SIGTERM, draining in-flight work before exit.
//!
//! Structure mirrors the teacher's hub `main.rs`: structured logging init,
//! env-driven config load, a handful of long-running tasks wired together
//! with `tokio::spawn` + `tokio::select!`, and a graceful-shutdown tail.

mod commands;
mod config;
mod error;
mod fanout;
mod metrics;
mod model;
mod mqtt;
mod oee;
mod refdata;
mod sparkplug;
mod supervisor;
mod window;

use anyhow::{Context, Result};
use config::Config;
use fanout::{Fanout, HttpTimeseriesSink, NullSink, TimeseriesSink};
use mqtt::Subscriber;
use refdata::RefdataClient;
use std::sync::Arc;
use supervisor::Supervisor;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

const ROUTED_ENVELOPE_QUEUE_DEPTH: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = Config::from_env().context("loading configuration")?;
    let cfg = Arc::new(cfg);

    let refdata = RefdataClient::with_planned_downtime_override(
        cfg.refdata_base_url.clone(),
        cfg.planned_downtime_api_url.clone(),
    );

    let sink: Option<Arc<dyn TimeseriesSink>> = match &cfg.timeseries {
        Some(ts) => Some(Arc::new(HttpTimeseriesSink::new(
            ts.url.clone(),
            ts.token.clone(),
            ts.org.clone(),
            ts.bucket.clone(),
        ))),
        None => {
            if cfg.sink_on_order_completion_only {
                warn!("sinkOnOrderCompletionOnly set but no time-series backend configured");
            }
            Some(Arc::new(NullSink))
        }
    };
    let fanout = Fanout::new(sink, cfg.sink_on_order_completion_only, cfg.oee_as_percent);

    let supervisor = Supervisor::new(cfg.clone(), refdata.clone(), fanout.clone());

    let mut subscriber = Subscriber::new(&cfg).context("constructing mqtt subscriber")?;
    let health = fanout::HealthState {
        mqtt: subscriber.state_handle(),
        refdata: refdata.clone(),
    };

    let web_handle = if cfg.websocket_enabled {
        let fanout_for_web = fanout.clone();
        let port = cfg.web_port;
        Some(tokio::spawn(async move {
            if let Err(e) = fanout::serve(fanout_for_web, health, port).await {
                error!(error = %e, "dashboard server exited");
            }
        }))
    } else {
        None
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    let (routed_tx, mut routed_rx) = mpsc::channel(ROUTED_ENVELOPE_QUEUE_DEPTH);

    let mqtt_handle = {
        tokio::spawn(async move {
            if let Err(e) = subscriber.run(routed_tx, stop_rx).await {
                error!(error = %e, "mqtt subscriber exited");
            }
        })
    };

    let routing_handle = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            while let Some(routed) = routed_rx.recv().await {
                supervisor.route(routed).await;
            }
        })
    };

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;

    let exit_reason: &str;
    tokio::select! {
        result = mqtt_handle => {
            if let Err(e) = result {
                error!(error = %e, "mqtt task panicked");
            }
            exit_reason = "mqtt task exited";
        }
        result = routing_handle => {
            if let Err(e) = result {
                error!(error = %e, "routing task panicked");
            }
            exit_reason = "routing task exited";
        }
        _ = &mut ctrl_c => {
            exit_reason = "SIGINT";
        }
        _ = sigterm.recv() => {
            exit_reason = "SIGTERM";
        }
    }

    warn!(signal = exit_reason, "shutting down");
    let _ = stop_tx.send(true);
    supervisor.shutdown().await;

    if let Some(handle) = web_handle {
        handle.abort();
    }

    info!("shutdown complete");
    Ok(())
}
