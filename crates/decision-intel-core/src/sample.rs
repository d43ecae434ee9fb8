use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};

use crate::baseline::BaselineKey;

/// A validated telemetry sample. Natural key is
/// `(tenant_id, entity_id, metric_name, timestamp)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub tenant_id: String,
    pub entity_id: String,
    pub metric_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub value: f64,
}

impl MetricSample {
    #[must_use]
    pub fn key(&self) -> BaselineKey {
        BaselineKey {
            tenant_id: self.tenant_id.clone(),
            entity_id: self.entity_id.clone(),
            metric_name: self.metric_name.clone(),
        }
    }
}

/// Why a sample was refused at the ingress boundary.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum SampleRejection {
    #[error("missing field: {0}")]
    MissingField(String),
    #[error("field {0} MUST NOT be empty")]
    EmptyIdentifier(String),
    #[error("value MUST be a JSON number, got {0}")]
    NonNumericValue(String),
    #[error("value MUST be finite")]
    NonFiniteValue,
    #[error("malformed timestamp: {0}")]
    MalformedTimestamp(String),
    #[error("timestamp outside the storable range: {0}")]
    OutOfRangeTimestamp(String),
}

impl SampleRejection {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingField(_) => "missing_field",
            Self::EmptyIdentifier(_) => "empty_identifier",
            Self::NonNumericValue(_) => "non_numeric_value",
            Self::NonFiniteValue => "non_finite_value",
            Self::MalformedTimestamp(_) => "malformed_timestamp",
            Self::OutOfRangeTimestamp(_) => "out_of_range_timestamp",
        }
    }
}

/// Wire form of a sample before validation. Every field is optional so that
/// absence is reported as a typed rejection instead of a decode failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawMetricSample {
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub metric_name: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl RawMetricSample {
    /// Validates the wire sample. Values are never coerced: a string holding
    /// digits is still a non-numeric value.
    ///
    /// # Errors
    /// Returns the first [`SampleRejection`] encountered.
    pub fn validate(&self) -> Result<MetricSample, SampleRejection> {
        let tenant_id = required_identifier("tenant_id", self.tenant_id.as_deref())?;
        let entity_id = required_identifier("entity_id", self.entity_id.as_deref())?;
        let metric_name = required_identifier("metric_name", self.metric_name.as_deref())?;

        let value = match &self.value {
            None | Some(Value::Null) => {
                return Err(SampleRejection::MissingField("value".to_string()))
            }
            Some(Value::Number(number)) => number
                .as_f64()
                .ok_or_else(|| SampleRejection::NonNumericValue(number.to_string()))?,
            Some(other) => return Err(SampleRejection::NonNumericValue(json_kind(other))),
        };
        if !value.is_finite() {
            return Err(SampleRejection::NonFiniteValue);
        }

        let Some(raw_timestamp) = self.timestamp.as_deref() else {
            return Err(SampleRejection::MissingField("timestamp".to_string()));
        };
        let timestamp = parse_iso8601(raw_timestamp)?;

        Ok(MetricSample {
            tenant_id,
            entity_id,
            metric_name,
            timestamp,
            value,
        })
    }
}

fn required_identifier(name: &str, value: Option<&str>) -> Result<String, SampleRejection> {
    let Some(raw) = value else {
        return Err(SampleRejection::MissingField(name.to_string()));
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SampleRejection::EmptyIdentifier(name.to_string()));
    }
    Ok(trimmed.to_string())
}

fn json_kind(value: &Value) -> String {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
    .to_string()
}

/// Accepts any RFC3339 offset and normalizes to UTC. The instant must fit in
/// signed 64-bit nanoseconds since the Unix epoch.
fn parse_iso8601(raw: &str) -> Result<OffsetDateTime, SampleRejection> {
    let parsed = OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339)
        .map(|parsed| parsed.to_offset(UtcOffset::UTC))
        .map_err(|err| SampleRejection::MalformedTimestamp(format!("{raw}: {err}")))?;
    if i64::try_from(parsed.unix_timestamp_nanos()).is_err() {
        return Err(SampleRejection::OutOfRangeTimestamp(raw.to_string()));
    }
    Ok(parsed)
}
