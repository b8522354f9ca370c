//! Startup configuration (spec.md §6), assembled from environment
//! variables the way the teacher's `main.rs` builds its broker/db settings
//! (`env::var(...).ok().and_then(|s| s.parse().ok()).unwrap_or(default)`),
//! but validated eagerly in one place so a missing required field fails
//! fast with `OeeError::Config` instead of panicking deep in a worker.

use crate::error::OeeError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicMethod {
    Parris,
    Schultz,
}

#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub key_path: String,
    pub cert_path: String,
    pub ca_path: String,
}

#[derive(Debug, Clone)]
pub struct TimeseriesConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub broker_host: String,
    pub broker_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub tls: Option<TlsMaterial>,

    pub method: TopicMethod,
    pub topic_format: String,

    pub threshold_seconds: i64,
    pub oee_as_percent: bool,

    pub refdata_base_url: String,
    pub planned_downtime_api_url: Option<String>,

    pub timeseries: Option<TimeseriesConfig>,
    pub sink_on_order_completion_only: bool,

    pub websocket_enabled: bool,
    pub web_port: u16,

    pub shutdown_grace: Duration,
}

/// Env var values of the literal string `"null"` mean "unset" (spec.md §6).
fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty() && v != "null")
}

fn env_required(key: &str) -> Result<String, OeeError> {
    env_opt(key).ok_or_else(|| OeeError::config(format!("required config '{key}' is missing")))
}

impl Config {
    pub fn from_env() -> Result<Self, OeeError> {
        let broker_host = env_required("MQTT_BROKER_HOST")?;
        let broker_port: u16 = env::var("MQTT_BROKER_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1883);

        let mqtt_username = env_opt("MQTT_USERNAME");
        let mqtt_password = env_opt("MQTT_PASSWORD");

        let tls = match (
            env_opt("MQTT_TLS_KEY"),
            env_opt("MQTT_TLS_CERT"),
            env_opt("MQTT_TLS_CA"),
        ) {
            (Some(key_path), Some(cert_path), Some(ca_path)) => Some(TlsMaterial {
                key_path,
                cert_path,
                ca_path,
            }),
            (None, None, None) => None,
            _ => {
                return Err(OeeError::config(
                    "MQTT TLS material must be fully specified (key, cert, ca) or fully absent",
                ))
            }
        };

        let method = match env::var("OEE_METHOD")
            .unwrap_or_else(|_| "parris".to_string())
            .as_str()
        {
            "parris" => TopicMethod::Parris,
            "schultz" => TopicMethod::Schultz,
            other => return Err(OeeError::config(format!("unknown OEE_METHOD '{other}'"))),
        };

        let topic_format = env::var("OEE_TOPIC_FORMAT").unwrap_or_else(|_| {
            "spBv1.0/{plant}/{area}/{dataType}/{lineCode}/{metricName}".to_string()
        });

        let threshold_seconds: i64 = env::var("OEE_HOLD_THRESHOLD_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(300);

        let oee_as_percent = env::var("OEE_AS_PERCENT")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let refdata_base_url = env_required("REFDATA_BASE_URL")?;
        let planned_downtime_api_url = env_opt("PLANNED_DOWNTIME_API_URL");

        let timeseries = match (
            env_opt("TIMESERIES_URL"),
            env_opt("TIMESERIES_TOKEN"),
            env_opt("TIMESERIES_ORG"),
            env_opt("TIMESERIES_BUCKET"),
        ) {
            (Some(url), Some(token), Some(org), Some(bucket)) => {
                Some(TimeseriesConfig { url, token, org, bucket })
            }
            (None, None, None, None) => None,
            _ => {
                tracing::warn!("partial time-series config supplied — sink disabled");
                None
            }
        };

        let sink_on_order_completion_only = env::var("TIMESERIES_SINK_ON_COMPLETION_ONLY")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let websocket_enabled = env::var("WEBSOCKET_ENABLED")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);

        let web_port: u16 = env::var("WEB_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8080);

        let shutdown_grace = Duration::from_secs(
            env::var("SHUTDOWN_GRACE_SECONDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
        );

        let cfg = Self {
            broker_host,
            broker_port,
            mqtt_username,
            mqtt_password,
            tls,
            method,
            topic_format,
            threshold_seconds,
            oee_as_percent,
            refdata_base_url,
            planned_downtime_api_url,
            timeseries,
            sink_on_order_completion_only,
            websocket_enabled,
            web_port,
            shutdown_grace,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), OeeError> {
        if self.threshold_seconds < 0 {
            return Err(OeeError::config("OEE_HOLD_THRESHOLD_SECONDS must be >= 0"));
        }
        if self.broker_host.is_empty() {
            return Err(OeeError::config("MQTT_BROKER_HOST must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for k in [
            "MQTT_BROKER_HOST",
            "MQTT_BROKER_PORT",
            "MQTT_TLS_KEY",
            "MQTT_TLS_CERT",
            "MQTT_TLS_CA",
            "OEE_METHOD",
            "OEE_HOLD_THRESHOLD_SECONDS",
            "OEE_AS_PERCENT",
            "REFDATA_BASE_URL",
            "TIMESERIES_URL",
            "TIMESERIES_TOKEN",
            "TIMESERIES_ORG",
            "TIMESERIES_BUCKET",
            "WEBSOCKET_ENABLED",
        ] {
            env::remove_var(k);
        }
    }

    #[test]
    fn missing_broker_host_is_config_error() {
        let _g = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var("REFDATA_BASE_URL", "http://localhost:9000");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, OeeError::Config(_)));
        clear_env();
    }

    #[test]
    fn missing_refdata_url_is_config_error() {
        let _g = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var("MQTT_BROKER_HOST", "localhost");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, OeeError::Config(_)));
        clear_env();
    }

    #[test]
    fn tls_literal_null_treated_as_unset() {
        let _g = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var("MQTT_BROKER_HOST", "localhost");
        env::set_var("REFDATA_BASE_URL", "http://localhost:9000");
        env::set_var("MQTT_TLS_KEY", "null");
        env::set_var("MQTT_TLS_CERT", "null");
        env::set_var("MQTT_TLS_CA", "null");
        let cfg = Config::from_env().unwrap();
        assert!(cfg.tls.is_none());
        clear_env();
    }

    #[test]
    fn partial_tls_material_is_config_error() {
        let _g = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var("MQTT_BROKER_HOST", "localhost");
        env::set_var("REFDATA_BASE_URL", "http://localhost:9000");
        env::set_var("MQTT_TLS_KEY", "/tmp/key.pem");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, OeeError::Config(_)));
        clear_env();
    }

    #[test]
    fn defaults_are_sane() {
        let _g = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var("MQTT_BROKER_HOST", "localhost");
        env::set_var("REFDATA_BASE_URL", "http://localhost:9000");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.broker_port, 1883);
        assert_eq!(cfg.threshold_seconds, 300);
        assert!(!cfg.oee_as_percent);
        assert!(cfg.websocket_enabled);
        assert!(cfg.timeseries.is_none());
        clear_env();
    }

    #[test]
    fn partial_timeseries_config_disables_sink_with_warning() {
        let _g = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var("MQTT_BROKER_HOST", "localhost");
        env::set_var("REFDATA_BASE_URL", "http://localhost:9000");
        env::set_var("TIMESERIES_URL", "http://influx:8086");
        let cfg = Config::from_env().unwrap();
        assert!(cfg.timeseries.is_none());
        clear_env();
    }
}
