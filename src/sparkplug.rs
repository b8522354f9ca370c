//! Sparkplug B payload decode, isolated behind a single operation per the
//! design note in spec.md §9: the rest of the core only ever sees
//! `(timestamp, Vec<(name, MetricValue)>)` and never touches protobuf wire
//! details.
//!
//! The wire structs below mirror the public Sparkplug B `Payload`/`Metric`
//! messages (Eclipse Tahu `sparkplug_b.proto`) closely enough to decode real
//! broker traffic, encoded with hand-written `prost::Message` derives rather
//! than a build-time `.proto` compile step.

use prost::Message;
use time::OffsetDateTime;

#[derive(Clone, PartialEq, Message, Default)]
pub struct SparkplugMetric {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(uint64, optional, tag = "8")]
    pub timestamp: Option<u64>,
    #[prost(uint32, optional, tag = "4")]
    pub datatype: Option<u32>,

    #[prost(uint32, tag = "10")]
    pub int_value: u32,
    #[prost(uint64, tag = "11")]
    pub long_value: u64,
    #[prost(float, tag = "12")]
    pub float_value: f32,
    #[prost(double, tag = "13")]
    pub double_value: f64,
    #[prost(bool, tag = "14")]
    pub boolean_value: bool,
    #[prost(string, tag = "15")]
    pub string_value: String,
}

#[derive(Clone, PartialEq, Message, Default)]
pub struct SparkplugPayload {
    #[prost(uint64, optional, tag = "1")]
    pub timestamp: Option<u64>,
    #[prost(message, repeated, tag = "2")]
    pub metrics: Vec<SparkplugMetric>,
    #[prost(uint64, optional, tag = "3")]
    pub seq: Option<u64>,
}

/// Sparkplug B `DataType` enum values relevant to this core (Eclipse Tahu
/// assigns 1=Int8 .. 13=String, etc; we only discriminate the handful of
/// wire-value unions `SparkplugMetric` actually carries).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DataTypeTag {
    Int,
    Long,
    Float,
    Double,
    Boolean,
    String,
    Unknown(u32),
}

impl From<u32> for DataTypeTag {
    fn from(v: u32) -> Self {
        match v {
            1..=4 => DataTypeTag::Int,
            5 | 6 | 8 => DataTypeTag::Long,
            9 => DataTypeTag::Float,
            10 => DataTypeTag::Double,
            11 => DataTypeTag::Boolean,
            12 => DataTypeTag::String,
            other => DataTypeTag::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Int(u32),
    Long(u64),
    Float(f32),
    Double(f64),
    Boolean(bool),
    String(String),
}

impl MetricValue {
    /// Best-effort numeric coercion — most OEE metrics arrive as Int/Long/
    /// Double regardless of the exact Sparkplug datatype a given PLC driver
    /// chose.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Int(v) => Some(*v as f64),
            MetricValue::Long(v) => Some(*v as f64),
            MetricValue::Float(v) => Some(*v as f64),
            MetricValue::Double(v) => Some(*v),
            MetricValue::Boolean(v) => Some(if *v { 1.0 } else { 0.0 }),
            MetricValue::String(s) => s.parse::<f64>().ok(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecodedMetric {
    pub name: String,
    pub value: MetricValue,
}

#[derive(Debug, Clone)]
pub struct DecodedEnvelope {
    pub timestamp: OffsetDateTime,
    pub metrics: Vec<DecodedMetric>,
}

/// Decode a raw Sparkplug B protobuf payload. Any structural decode failure
/// or a metric missing both a name and a usable value is reported as
/// `OeeError::Decode` — callers drop the message and move on (spec.md §4.2).
pub fn decode_envelope(raw: &[u8]) -> Result<DecodedEnvelope, crate::error::OeeError> {
    let payload = SparkplugPayload::decode(raw)
        .map_err(|e| crate::error::OeeError::decode(format!("protobuf decode failed: {e}")))?;

    let timestamp = payload
        .timestamp
        .and_then(|ms| {
            OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000).ok()
        })
        .unwrap_or_else(OffsetDateTime::now_utc);

    let mut metrics = Vec::with_capacity(payload.metrics.len());
    for m in payload.metrics {
        let Some(name) = m.name else {
            continue; // anonymous metric (alias-only) — unsupported, skip
        };
        let tag: DataTypeTag = m.datatype.unwrap_or(10).into();
        let value = match tag {
            DataTypeTag::Int => MetricValue::Int(m.int_value),
            DataTypeTag::Long => MetricValue::Long(m.long_value),
            DataTypeTag::Float => MetricValue::Float(m.float_value),
            DataTypeTag::Double => MetricValue::Double(m.double_value),
            DataTypeTag::Boolean => MetricValue::Boolean(m.boolean_value),
            DataTypeTag::String => MetricValue::String(m.string_value),
            DataTypeTag::Unknown(_) => MetricValue::Double(m.double_value),
        };
        metrics.push(DecodedMetric { name, value });
    }

    Ok(DecodedEnvelope { timestamp, metrics })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(payload: &SparkplugPayload) -> Vec<u8> {
        let mut buf = Vec::new();
        payload.encode(&mut buf).unwrap();
        buf
    }

    #[test]
    fn decode_roundtrips_double_metric() {
        let payload = SparkplugPayload {
            timestamp: Some(1_714_550_400_000),
            seq: Some(1),
            metrics: vec![SparkplugMetric {
                name: Some("Hold".to_string()),
                timestamp: None,
                datatype: Some(10),
                double_value: 1.0,
                ..Default::default()
            }],
        };
        let raw = encode(&payload);
        let decoded = decode_envelope(&raw).unwrap();
        assert_eq!(decoded.metrics.len(), 1);
        assert_eq!(decoded.metrics[0].name, "Hold");
        assert_eq!(decoded.metrics[0].value.as_f64(), Some(1.0));
    }

    #[test]
    fn decode_skips_anonymous_metric() {
        let payload = SparkplugPayload {
            timestamp: Some(0),
            seq: None,
            metrics: vec![SparkplugMetric {
                name: None,
                datatype: Some(10),
                double_value: 42.0,
                ..Default::default()
            }],
        };
        let raw = encode(&payload);
        let decoded = decode_envelope(&raw).unwrap();
        assert!(decoded.metrics.is_empty());
    }

    #[test]
    fn decode_malformed_bytes_is_decode_error() {
        let raw = vec![0xFF, 0xFF, 0xFF];
        let err = decode_envelope(&raw).unwrap_err();
        assert!(matches!(err, crate::error::OeeError::Decode(_)));
    }

    #[test]
    fn decode_boolean_metric() {
        let payload = SparkplugPayload {
            timestamp: Some(0),
            seq: None,
            metrics: vec![SparkplugMetric {
                name: Some("machineConnect".to_string()),
                datatype: Some(11),
                boolean_value: true,
                ..Default::default()
            }],
        };
        let raw = encode(&payload);
        let decoded = decode_envelope(&raw).unwrap();
        assert_eq!(decoded.metrics[0].value, MetricValue::Boolean(true));
        assert_eq!(decoded.metrics[0].value.as_f64(), Some(1.0));
    }

    #[test]
    fn decode_missing_timestamp_uses_now() {
        let payload = SparkplugPayload {
            timestamp: None,
            seq: None,
            metrics: vec![],
        };
        let raw = encode(&payload);
        let decoded = decode_envelope(&raw).unwrap();
        let delta = (OffsetDateTime::now_utc() - decoded.timestamp).whole_seconds().abs();
        assert!(delta < 5);
    }
}
