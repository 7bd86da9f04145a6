//! Client sync protocol
//!
//! Messages pushed from the local exporter to observers, and the mirror an
//! observer keeps of the exporter's store.

use crate::store::{reconcile, NewItems, TraceStore};
use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::debug;

/// ISO-8601 UTC timestamps as produced by the exporter
static ISO_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d{1,9})?Z$")
        .expect("timestamp pattern is valid")
});

/// Sync protocol errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Invalid sync message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown sync message type: {0}")]
    UnknownMessage(String),
}

/// A message from the local exporter to an observer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum SyncMessage {
    /// Full store, sent once per connection
    InitialStore(TraceStore),

    /// Delta produced by one export
    NewItems(NewItems),
}

impl SyncMessage {
    pub fn to_json(&self) -> Result<String, SyncError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::InitialStore(_) => "initialStore",
            SyncMessage::NewItems(_) => "newItems",
        }
    }
}

/// Parse a sync message, normalizing every timestamp-shaped string first
pub fn decode_message(text: &str) -> Result<SyncMessage, SyncError> {
    let mut value: Value = serde_json::from_str(text)?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if kind != "initialStore" && kind != "newItems" {
        return Err(SyncError::UnknownMessage(kind));
    }

    if let Some(data) = value.get_mut("data") {
        rehydrate_dates(data);
    }
    Ok(serde_json::from_value(value)?)
}

/// Record fields carrying timestamps
const DATE_FIELDS: &[&str] = &["startTime", "endTime"];

/// Rewrite timestamp fields anywhere in the tree in canonical RFC 3339 form.
/// Other strings, including everything under `attributes`, are user data and
/// stay untouched. Look-alikes that fail to parse are left as they are.
pub fn rehydrate_dates(value: &mut Value) {
    match value {
        Value::Array(items) => items.iter_mut().for_each(rehydrate_dates),
        Value::Object(fields) => {
            for (key, field) in fields.iter_mut() {
                if key == "attributes" {
                    continue;
                }
                match field {
                    Value::String(s) if DATE_FIELDS.contains(&key.as_str()) => canonicalize(s),
                    Value::Array(_) | Value::Object(_) => rehydrate_dates(field),
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

fn canonicalize(s: &mut String) {
    if !ISO_TIMESTAMP.is_match(s.as_str()) {
        return;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
        *s = parsed
            .with_timezone(&Utc)
            .to_rfc3339_opts(SecondsFormat::AutoSi, true);
    }
}

/// Observer-side copy of the exporter's store
#[derive(Debug)]
pub struct StoreMirror {
    store: TraceStore,
    expanded: bool,
    has_unseen_failures: bool,
}

impl Default for StoreMirror {
    fn default() -> Self {
        Self {
            store: TraceStore::new(),
            expanded: true,
            has_unseen_failures: false,
        }
    }
}

impl StoreMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, message: SyncMessage) {
        match message {
            SyncMessage::InitialStore(store) => {
                debug!("Mirror received initial store with {} traces", store.len());
                self.store = store;
            }
            SyncMessage::NewItems(items) => {
                if !self.expanded && items.has_failure() {
                    self.has_unseen_failures = true;
                }
                self.store = reconcile(std::mem::take(&mut self.store), &items);
            }
        }
    }

    /// Decode and apply a raw message
    pub fn apply_text(&mut self, text: &str) -> Result<(), SyncError> {
        let message = decode_message(text)?;
        self.apply(message);
        Ok(())
    }

    pub fn store(&self) -> &TraceStore {
        &self.store
    }

    pub fn is_expanded(&self) -> bool {
        self.expanded
    }

    /// Expanding the observer marks failures as seen
    pub fn set_expanded(&mut self, expanded: bool) {
        if expanded && !self.expanded {
            self.has_unseen_failures = false;
        }
        self.expanded = expanded;
    }

    pub fn has_unseen_failures(&self) -> bool {
        self.has_unseen_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::StatusCode;
    use crate::store::tests::{call, run, step};
    use serde_json::json;

    #[test]
    fn test_rehydrate_canonicalizes_timestamps() {
        let mut value = json!({
            "startTime": "2025-01-01T12:00:00.000Z",
            "nested": [{"endTime": "2025-01-01T12:00:00.500Z"}],
            "later": {"startTime": "2025-13-45T99:99:99.000Z"},
            "text": "hello",
            "n": 3
        });
        rehydrate_dates(&mut value);

        assert_eq!(value["startTime"], "2025-01-01T12:00:00Z");
        assert_eq!(value["nested"][0]["endTime"], "2025-01-01T12:00:00.500Z");
        assert_eq!(value["later"]["startTime"], "2025-13-45T99:99:99.000Z");
        assert_eq!(value["text"], "hello");
        assert_eq!(value["n"], 3);
    }

    #[test]
    fn test_rehydrate_leaves_user_text_alone() {
        let mut value = json!({
            "runs": [{
                "startTime": "2025-01-01T12:00:00.000Z",
                "prompt": "2025-01-01T12:00:00.000Z",
                "response": "2025-01-01T12:00:00.000Z",
                "attributes": {
                    "ai.prompt": "2025-01-01T12:00:00.000Z",
                    "startTime": "2025-01-01T12:00:00.000Z"
                }
            }]
        });
        rehydrate_dates(&mut value);

        let run = &value["runs"][0];
        assert_eq!(run["startTime"], "2025-01-01T12:00:00Z");
        assert_eq!(run["prompt"], "2025-01-01T12:00:00.000Z");
        assert_eq!(run["response"], "2025-01-01T12:00:00.000Z");
        assert_eq!(run["attributes"]["ai.prompt"], "2025-01-01T12:00:00.000Z");
        assert_eq!(run["attributes"]["startTime"], "2025-01-01T12:00:00.000Z");
    }

    #[test]
    fn test_decode_keeps_timestamp_shaped_prompt() {
        let mut record = run("t1", 0);
        record.prompt = "2025-01-01T12:00:00.000Z".to_string();
        let message = SyncMessage::NewItems(NewItems {
            runs: vec![record],
            ..Default::default()
        });

        let SyncMessage::NewItems(items) = decode_message(&message.to_json().unwrap()).unwrap() else {
            panic!("expected new items");
        };
        assert_eq!(items.runs[0].prompt, "2025-01-01T12:00:00.000Z");
    }

    #[test]
    fn test_message_wire_format() {
        let message = SyncMessage::NewItems(NewItems {
            runs: vec![run("t1", 0)],
            ..Default::default()
        });
        let json: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "newItems");
        assert_eq!(json["data"]["runs"][0]["traceId"], "t1");

        let decoded = decode_message(&message.to_json().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_decode_millisecond_timestamps() {
        let text = r#"{"type":"initialStore","data":{"t1":{"run":null,"steps":[{
            "traceId":"t1","spanId":"s1","startTime":"2025-01-01T12:00:00.250Z",
            "durationNs":1000,"statusCode":0,"attributes":{},"response":""
        }],"toolCalls":[]}}}"#;

        let SyncMessage::InitialStore(store) = decode_message(text).unwrap() else {
            panic!("expected initial store");
        };
        let entry = store.get("t1").unwrap();
        assert_eq!(entry.steps[0].span.start_time.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(decode_message("not json"), Err(SyncError::Json(_))));
        assert!(matches!(
            decode_message(r#"{"type":"feedback","data":{}}"#),
            Err(SyncError::UnknownMessage(kind)) if kind == "feedback"
        ));
    }

    #[test]
    fn test_mirror_replaces_then_reconciles() {
        let mut mirror = StoreMirror::new();
        let initial = reconcile(
            TraceStore::new(),
            &NewItems {
                runs: vec![run("t1", 0)],
                ..Default::default()
            },
        );
        mirror.apply(SyncMessage::InitialStore(initial));
        mirror.apply(SyncMessage::NewItems(NewItems {
            steps: vec![step("t1", "s1", 1)],
            tool_calls: vec![call("t2", "c1", 2)],
            ..Default::default()
        }));

        assert_eq!(mirror.store().len(), 2);
        assert_eq!(mirror.store().get("t1").unwrap().steps.len(), 1);

        mirror.apply(SyncMessage::InitialStore(TraceStore::new()));
        assert!(mirror.store().is_empty());
    }

    #[test]
    fn test_unseen_failures_only_while_collapsed() {
        let mut failed = call("t1", "c1", 0);
        failed.span.status_code = StatusCode::Error;
        let failing = NewItems {
            tool_calls: vec![failed],
            ..Default::default()
        };

        let mut mirror = StoreMirror::new();
        mirror.apply(SyncMessage::NewItems(failing.clone()));
        assert!(!mirror.has_unseen_failures());

        mirror.set_expanded(false);
        mirror.apply(SyncMessage::NewItems(failing));
        assert!(mirror.has_unseen_failures());

        mirror.set_expanded(true);
        assert!(!mirror.has_unseen_failures());
    }
}
