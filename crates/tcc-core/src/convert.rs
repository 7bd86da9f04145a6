//! Snapshot conversion
//!
//! Projects raw spans into the run, step and tool call records consumed by
//! observers.

use crate::classify::{classify, SpanKind};
use crate::span::{AttributeMap, AttributeValue, SpanData, StatusCode};
use crate::store::NewItems;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Recorded when no usage attribute is present
pub const UNKNOWN_TOKEN_COUNT: i64 = -1;

const PROMPT_TOKEN_KEYS: &[&str] = &[
    "ai.usage.promptTokens",
    "gen_ai.usage.input_tokens",
    "ai.usage.inputTokens",
];

const COMPLETION_TOKEN_KEYS: &[&str] = &[
    "ai.usage.completionTokens",
    "gen_ai.usage.output_tokens",
    "ai.usage.outputTokens",
];

const PROMPT_KEY: &str = "ai.prompt";
const RESPONSE_TEXT_KEY: &str = "ai.response.text";
const TOOL_NAME_KEY: &str = "ai.toolCall.name";
const TOOL_ARGS_KEY: &str = "ai.toolCall.args";
const TOOL_RESULT_KEY: &str = "ai.toolCall.result";

/// Fields shared by every record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanSnapshot {
    pub trace_id: String,
    pub span_id: String,
    pub start_time: DateTime<Utc>,
    pub duration_ns: i64,
    pub status_code: StatusCode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,

    #[serde(default)]
    pub attributes: AttributeMap,
}

impl SpanSnapshot {
    pub fn from_span(span: &SpanData) -> Self {
        Self {
            trace_id: span.trace_id.clone(),
            span_id: span.span_id.clone(),
            start_time: span.start_time,
            duration_ns: span.duration_ns(),
            status_code: span.status.code,
            status_message: span.status.message.clone(),
            attributes: span.attributes.clone(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status_code == StatusCode::Error
    }
}

/// Top-level agent run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    #[serde(flatten)]
    pub span: SpanSnapshot,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub prompt: String,
    pub response: String,
}

/// One model round-trip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    #[serde(flatten)]
    pub span: SpanSnapshot,
    pub response: String,
}

/// One tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    #[serde(flatten)]
    pub span: SpanSnapshot,
    pub tool_name: String,
    pub tool_args: String,
    pub tool_result: String,
}

/// A converted span
#[derive(Debug, Clone, PartialEq)]
pub enum SpanRecord {
    Run(RunRecord),
    Step(StepRecord),
    ToolCall(ToolCallRecord),
}

impl SpanRecord {
    pub fn snapshot(&self) -> &SpanSnapshot {
        match self {
            SpanRecord::Run(r) => &r.span,
            SpanRecord::Step(s) => &s.span,
            SpanRecord::ToolCall(t) => &t.span,
        }
    }
}

/// Convert a classified span. Unknown spans have no record.
pub fn to_record(span: &SpanData, kind: SpanKind) -> Option<SpanRecord> {
    let snapshot = SpanSnapshot::from_span(span);
    let record = match kind {
        SpanKind::Unknown => return None,
        SpanKind::Run => SpanRecord::Run(RunRecord {
            span: snapshot,
            prompt_tokens: token_count(span, PROMPT_TOKEN_KEYS),
            completion_tokens: token_count(span, COMPLETION_TOKEN_KEYS),
            prompt: user_prompt_from_attribute(&text_attribute(span, PROMPT_KEY)),
            response: text_attribute(span, RESPONSE_TEXT_KEY),
        }),
        SpanKind::Step => SpanRecord::Step(StepRecord {
            span: snapshot,
            response: text_attribute(span, RESPONSE_TEXT_KEY),
        }),
        SpanKind::ToolCall => SpanRecord::ToolCall(ToolCallRecord {
            span: snapshot,
            tool_name: text_attribute(span, TOOL_NAME_KEY),
            tool_args: text_attribute(span, TOOL_ARGS_KEY),
            tool_result: text_attribute(span, TOOL_RESULT_KEY),
        }),
    };
    Some(record)
}

/// Convert a set of spans into a reconciliation delta, keeping input order
pub fn shape_spans(spans: &[SpanData]) -> NewItems {
    let mut items = NewItems::default();
    for span in spans {
        match to_record(span, classify(span)) {
            Some(SpanRecord::Run(run)) => items.runs.push(run),
            Some(SpanRecord::Step(step)) => items.steps.push(step),
            Some(SpanRecord::ToolCall(call)) => items.tool_calls.push(call),
            None => {}
        }
    }
    items
}

/// First numeric value found along the key chain
fn token_count(span: &SpanData, keys: &[&str]) -> i64 {
    keys.iter()
        .find_map(|key| span.attribute(key).and_then(AttributeValue::as_i64))
        .unwrap_or(UNKNOWN_TOKEN_COUNT)
}

/// Attribute rendered as text; missing attributes are empty
fn text_attribute(span: &SpanData, key: &str) -> String {
    match span.attribute(key) {
        Some(AttributeValue::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Extract the user-facing prompt from a serialized `ai.prompt` attribute.
///
/// Understands `{"prompt": ...}` and `{"messages": [...]}` payloads and
/// falls back to the raw text for anything else.
pub fn user_prompt_from_attribute(raw: &str) -> String {
    let Ok(parsed) = serde_json::from_str::<Value>(raw) else {
        return raw.to_string();
    };

    if let Some(prompt) = parsed.get("prompt").and_then(Value::as_str) {
        return prompt.to_string();
    }

    let message = parsed
        .get("messages")
        .and_then(Value::as_array)
        .and_then(|messages| {
            messages
                .iter()
                .rev()
                .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
                .or_else(|| messages.last())
        });

    match message.and_then(|m| m.get("content")) {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => raw.to_string(),
    }
}
