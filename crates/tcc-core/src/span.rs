//! Span model
//!
//! The records handed to the pipeline by the instrumentation layer. The core
//! only reads them, apart from stamping the run identity attribute when a
//! span starts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Attribute map carried by every span
pub type AttributeMap = HashMap<String, AttributeValue>;

/// A single attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    StringArray(Vec<String>),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view of the value. Integral doubles and numeric strings are
    /// accepted since token counts are not always recorded as integers.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Int(i) => Some(*i),
            AttributeValue::Double(d) if d.fract() == 0.0 && d.is_finite() => Some(*d as i64),
            AttributeValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(b) => write!(f, "{}", b),
            AttributeValue::Int(i) => write!(f, "{}", i),
            AttributeValue::Double(d) => write!(f, "{}", d),
            AttributeValue::String(s) => f.write_str(s),
            AttributeValue::StringArray(values) => {
                let json = serde_json::to_string(values).map_err(|_| fmt::Error)?;
                f.write_str(&json)
            }
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Double(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

/// Span status code, serialized as its OTLP integer value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum StatusCode {
    #[default]
    Unset,
    Ok,
    Error,
}

impl StatusCode {
    pub fn as_u8(self) -> u8 {
        match self {
            StatusCode::Unset => 0,
            StatusCode::Ok => 1,
            StatusCode::Error => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(StatusCode::Unset),
            1 => Some(StatusCode::Ok),
            2 => Some(StatusCode::Error),
            _ => None,
        }
    }
}

impl From<StatusCode> for u8 {
    fn from(code: StatusCode) -> Self {
        code.as_u8()
    }
}

impl TryFrom<u8> for StatusCode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        StatusCode::from_u8(value).ok_or_else(|| format!("invalid span status code: {}", value))
    }
}

/// Span status
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpanStatus {
    pub code: StatusCode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SpanStatus {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Error,
            message: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.code == StatusCode::Error
    }
}

/// A span produced by the instrumentation layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanData {
    /// Trace ID (32 hex chars)
    pub trace_id: String,

    /// Span ID (16 hex chars), unique within a process lifetime
    pub span_id: String,

    /// Parent span ID
    #[serde(default)]
    pub parent_span_id: Option<String>,

    /// Span name, used for classification
    pub name: String,

    /// Start time
    pub start_time: DateTime<Utc>,

    /// End time, absent while the span is in flight
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,

    /// Status
    #[serde(default)]
    pub status: SpanStatus,

    /// Attributes
    #[serde(default)]
    pub attributes: AttributeMap,
}

impl SpanData {
    pub fn new(
        trace_id: impl Into<String>,
        span_id: impl Into<String>,
        name: impl Into<String>,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: span_id.into(),
            parent_span_id: None,
            name: name.into(),
            start_time,
            end_time: None,
            status: SpanStatus::default(),
            attributes: AttributeMap::new(),
        }
    }

    pub fn with_parent(mut self, parent_span_id: impl Into<String>) -> Self {
        self.parent_span_id = Some(parent_span_id.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.set_attribute(key, value);
        self
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    /// Mark the span as finished
    pub fn end(&mut self, end_time: DateTime<Utc>, status: SpanStatus) {
        self.end_time = Some(end_time);
        self.status = status;
    }

    /// Duration in nanoseconds; zero while the span is in flight
    pub fn duration_ns(&self) -> i64 {
        self.end_time
            .map(|end| (end - self.start_time).num_nanoseconds().unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}

/// A span lifecycle event, as written to replay files (one per JSONL line)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "span", rename_all = "snake_case")]
pub enum SpanEvent {
    Start(SpanData),
    End(SpanData),
}

/// Generate a random 32-char hex trace ID
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Generate a random 16-char hex span ID
pub fn new_span_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_duration_in_nanoseconds() {
        let start = Utc::now();
        let mut span = SpanData::new(new_trace_id(), new_span_id(), "ai.toolCall", start);
        assert_eq!(span.duration_ns(), 0);

        span.end(start + Duration::microseconds(1500), SpanStatus::ok());
        assert_eq!(span.duration_ns(), 1_500_000);
        assert_eq!(span.status.code, StatusCode::Ok);
    }

    #[test]
    fn test_status_code_wire_format() {
        assert_eq!(serde_json::to_string(&StatusCode::Error).unwrap(), "2");
        let code: StatusCode = serde_json::from_str("1").unwrap();
        assert_eq!(code, StatusCode::Ok);
        assert!(serde_json::from_str::<StatusCode>("7").is_err());
    }

    #[test]
    fn test_attribute_value_untagged() {
        let attrs: AttributeMap = serde_json::from_str(
            r#"{"a": 3, "b": 2.5, "c": "x", "d": true, "e": ["t1", "t2"]}"#,
        )
        .unwrap();
        assert_eq!(attrs["a"], AttributeValue::Int(3));
        assert_eq!(attrs["b"], AttributeValue::Double(2.5));
        assert_eq!(attrs["c"].as_str(), Some("x"));
        assert_eq!(attrs["d"], AttributeValue::Bool(true));
        assert_eq!(attrs["e"].to_string(), r#"["t1","t2"]"#);
    }

    #[test]
    fn test_attribute_numeric_view() {
        assert_eq!(AttributeValue::Double(42.0).as_i64(), Some(42));
        assert_eq!(AttributeValue::Double(4.2).as_i64(), None);
        assert_eq!(AttributeValue::from("17").as_i64(), Some(17));
        assert_eq!(AttributeValue::Bool(true).as_i64(), None);
    }

    #[test]
    fn test_span_event_format() {
        let span = SpanData::new("t", "s", "ai.streamText", Utc::now());
        let json = serde_json::to_value(SpanEvent::Start(span)).unwrap();
        assert_eq!(json["event"], "start");
        assert_eq!(json["span"]["name"], "ai.streamText");
    }

    #[test]
    fn test_generated_ids() {
        assert_eq!(new_trace_id().len(), 32);
        assert_eq!(new_span_id().len(), 16);
    }
}
