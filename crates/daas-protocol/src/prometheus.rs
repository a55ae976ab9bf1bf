//! Prometheus-style query responses and the `[ticks, value]` sample codec.
//!
//! Sample timestamps travel as a count of 100-nanosecond ticks since
//! 1970-01-01T00:00:00Z, not as Unix seconds. Consumers of the existing wire
//! format depend on that unit, so it is kept exactly.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{de, ser::SerializeTuple, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

pub const TICKS_PER_SECOND: i64 = 10_000_000;
const NANOS_PER_TICK: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("instant {0} precedes the Unix epoch")]
    BeforeEpoch(DateTime<Utc>),
    #[error("tick count {0} is outside the representable range")]
    TicksOutOfRange(i64),
    #[error("expected a 2-element array, found {0}")]
    Shape(String),
    #[error("expected an integer tick count, found {0}")]
    Ticks(String),
    #[error("expected a scalar sample value, found {0}")]
    Value(String),
}

/// Converts an instant into ticks since the epoch.
pub fn to_ticks(instant: DateTime<Utc>) -> Result<i64, CodecError> {
    let seconds = instant.timestamp();
    if seconds < 0 {
        return Err(CodecError::BeforeEpoch(instant));
    }
    let sub_ticks = i64::from(instant.timestamp_subsec_nanos() / NANOS_PER_TICK);
    seconds
        .checked_mul(TICKS_PER_SECOND)
        .and_then(|ticks| ticks.checked_add(sub_ticks))
        .ok_or(CodecError::TicksOutOfRange(seconds))
}

pub fn from_ticks(ticks: i64) -> Result<DateTime<Utc>, CodecError> {
    if ticks < 0 {
        return Err(CodecError::TicksOutOfRange(ticks));
    }
    let seconds = ticks / TICKS_PER_SECOND;
    let nanos = (ticks % TICKS_PER_SECOND) as u32 * NANOS_PER_TICK;
    DateTime::<Utc>::from_timestamp(seconds, nanos).ok_or(CodecError::TicksOutOfRange(ticks))
}

/// One sample: an instant and its value in string form (absent for `null`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrometheusValue {
    pub timestamp: DateTime<Utc>,
    pub value: Option<String>,
}

impl PrometheusValue {
    pub fn new(timestamp: DateTime<Utc>, value: Option<String>) -> Self {
        Self { timestamp, value }
    }

    pub fn encode(&self) -> Result<Value, CodecError> {
        let ticks = to_ticks(self.timestamp)?;
        let value = match &self.value {
            Some(text) => Value::String(text.clone()),
            None => Value::Null,
        };
        Ok(Value::Array(vec![Value::from(ticks), value]))
    }

    pub fn decode(raw: &Value) -> Result<Self, CodecError> {
        let items = raw
            .as_array()
            .filter(|items| items.len() == 2)
            .ok_or_else(|| CodecError::Shape(raw.to_string()))?;
        let ticks = items[0]
            .as_i64()
            .ok_or_else(|| CodecError::Ticks(items[0].to_string()))?;
        let timestamp = from_ticks(ticks)?;
        let value = match &items[1] {
            Value::Null => None,
            Value::String(text) => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            Value::Bool(flag) => Some(flag.to_string()),
            other => return Err(CodecError::Value(other.to_string())),
        };
        Ok(Self { timestamp, value })
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.value.as_deref().and_then(|text| text.trim().parse().ok())
    }
}

impl Serialize for PrometheusValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let ticks = to_ticks(self.timestamp).map_err(serde::ser::Error::custom)?;
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&ticks)?;
        tuple.serialize_element(&self.value)?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for PrometheusValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Self::decode(&raw).map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstantSample {
    #[serde(default)]
    pub metric: BTreeMap<String, String>,
    pub value: PrometheusValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeSeries {
    #[serde(default)]
    pub metric: BTreeMap<String, String>,
    #[serde(default)]
    pub values: Vec<PrometheusValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
pub enum QueryData {
    Matrix(Vec<RangeSeries>),
    Vector(Vec<InstantSample>),
    Scalar(PrometheusValue),
    String(PrometheusValue),
}

impl QueryData {
    pub fn result_type(&self) -> &'static str {
        match self {
            QueryData::Matrix(_) => "matrix",
            QueryData::Vector(_) => "vector",
            QueryData::Scalar(_) => "scalar",
            QueryData::String(_) => "string",
        }
    }

    /// Latest sample per series. Scalars and strings yield one unlabelled sample.
    pub fn latest_samples(&self) -> Vec<InstantSample> {
        match self {
            QueryData::Vector(samples) => samples.clone(),
            QueryData::Matrix(series) => series
                .iter()
                .filter_map(|series| {
                    series.values.last().map(|value| InstantSample {
                        metric: series.metric.clone(),
                        value: value.clone(),
                    })
                })
                .collect(),
            QueryData::Scalar(value) | QueryData::String(value) => vec![InstantSample {
                metric: BTreeMap::new(),
                value: value.clone(),
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueryError {
    #[error("query failed ({error_type}): {message}")]
    Failed { error_type: String, message: String },
    #[error("query succeeded without a data section")]
    MissingData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub status: QueryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<QueryData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl QueryResponse {
    pub fn into_data(self) -> Result<QueryData, QueryError> {
        match self.status {
            QueryStatus::Error => Err(QueryError::Failed {
                error_type: self.error_type.unwrap_or_else(|| "unknown".to_string()),
                message: self.error.unwrap_or_default(),
            }),
            QueryStatus::Success => self.data.ok_or(QueryError::MissingData),
        }
    }
}
