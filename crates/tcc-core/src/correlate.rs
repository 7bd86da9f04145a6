//! Run correlation
//!
//! Propagates run identity from a run span down to its steps and tool calls
//! by parent span lookup. Only in-flight spans are tracked; entries are
//! forgotten once the batch holding them has been flushed.

use crate::classify::{classify, SpanKind};
use crate::span::SpanData;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Attribute stamped onto every attributed span
pub const RUN_ID_ATTRIBUTE: &str = "tcc.runId";

/// Caller-supplied run id metadata, checked in order
pub const RUN_ID_METADATA_KEYS: &[&str] = &[
    "ai.telemetry.metadata.tcc.runId",
    "ai.telemetry.metadata.tcc.run_id",
];

/// Identity of one logical agent run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random run id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Run id supplied through telemetry metadata, if any
    pub fn from_metadata(span: &SpanData) -> Option<Self> {
        RUN_ID_METADATA_KEYS.iter().find_map(|key| {
            span.attribute(key)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(RunId::new)
        })
    }

    /// Run id previously stamped onto a span
    pub fn from_stamp(span: &SpanData) -> Option<Self> {
        span.attribute(RUN_ID_ATTRIBUTE)
            .and_then(|v| v.as_str())
            .map(RunId::new)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Span id to run id mapping for in-flight spans
#[derive(Debug, Default)]
pub struct RunCorrelator {
    span_runs: HashMap<String, RunId>,
}

impl RunCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign run identity when a span starts and stamp it onto the span.
    ///
    /// Returns `None` for unknown spans and for children whose parent is not
    /// attributed to any run.
    pub fn on_start(&mut self, span: &mut SpanData) -> Option<RunId> {
        let kind = classify(span);
        let run_id = match kind {
            SpanKind::Unknown => {
                debug!("Ignoring unknown span type: {}", span.name);
                return None;
            }
            SpanKind::Run => {
                let run_id = RunId::from_metadata(span).unwrap_or_else(RunId::generate);
                self.span_runs.insert(span.span_id.clone(), run_id.clone());
                run_id
            }
            SpanKind::Step | SpanKind::ToolCall => {
                let run_id = self.parent_run(span)?;
                // Tool calls are leaves; only steps can parent further spans
                if kind == SpanKind::Step {
                    self.span_runs.insert(span.span_id.clone(), run_id.clone());
                }
                run_id
            }
        };

        span.set_attribute(RUN_ID_ATTRIBUTE, run_id.as_str());
        Some(run_id)
    }

    /// Resolve the run an ended span belongs to.
    ///
    /// A run span is looked up by its own id, every other span via its parent.
    pub fn resolve_end(&self, span: &SpanData, kind: SpanKind) -> Option<RunId> {
        match kind {
            SpanKind::Unknown => None,
            SpanKind::Run => self.span_runs.get(&span.span_id).cloned(),
            SpanKind::Step | SpanKind::ToolCall => self.parent_run(span),
        }
    }

    fn parent_run(&self, span: &SpanData) -> Option<RunId> {
        let Some(parent) = span.parent_span_id.as_deref() else {
            debug!("Span {} ({}) has no parent span id", span.span_id, span.name);
            return None;
        };

        let run_id = self.span_runs.get(parent).cloned();
        if run_id.is_none() {
            debug!("Span {} has no parent run id (parent {})", span.span_id, parent);
        }
        run_id
    }

    /// Forget the given spans
    pub fn forget<'a>(&mut self, span_ids: impl IntoIterator<Item = &'a str>) {
        for span_id in span_ids {
            self.span_runs.remove(span_id);
        }
    }

    pub fn run_of(&self, span_id: &str) -> Option<&RunId> {
        self.span_runs.get(span_id)
    }

    pub fn len(&self) -> usize {
        self.span_runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.span_runs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn span(id: &str, name: &str) -> SpanData {
        SpanData::new("trace-1", id, name, Utc::now())
    }

    #[test]
    fn test_run_generates_id_and_stamps() {
        let mut correlator = RunCorrelator::new();
        let mut run = span("r1", "ai.generateText");

        let run_id = correlator.on_start(&mut run).unwrap();
        assert!(uuid::Uuid::parse_str(run_id.as_str()).is_ok());
        assert_eq!(RunId::from_stamp(&run), Some(run_id.clone()));
        assert_eq!(correlator.run_of("r1"), Some(&run_id));
    }

    #[test]
    fn test_metadata_run_id_preferred() {
        let mut correlator = RunCorrelator::new();

        let mut run = span("r1", "ai.streamText")
            .with_attribute("ai.telemetry.metadata.tcc.runId", "custom-run");
        assert_eq!(correlator.on_start(&mut run), Some(RunId::from("custom-run")));

        let mut snake = span("r2", "ai.streamText")
            .with_attribute("ai.telemetry.metadata.tcc.run_id", "snake-run");
        assert_eq!(correlator.on_start(&mut snake), Some(RunId::from("snake-run")));
    }

    #[test]
    fn test_identity_propagates_through_steps() {
        let mut correlator = RunCorrelator::new();
        let mut run = span("r1", "ai.generateText");
        let run_id = correlator.on_start(&mut run).unwrap();

        let mut step = span("s1", "ai.generateText.doGenerate").with_parent("r1");
        assert_eq!(correlator.on_start(&mut step), Some(run_id.clone()));

        // A tool call nested below the step still resolves
        let mut tool = span("t1", "ai.toolCall").with_parent("s1");
        assert_eq!(correlator.on_start(&mut tool), Some(run_id.clone()));
        assert_eq!(RunId::from_stamp(&tool), Some(run_id));

        // Tool calls are not recorded as parents
        assert!(correlator.run_of("t1").is_none());
        assert_eq!(correlator.len(), 2);
    }

    #[test]
    fn test_orphans_are_unattributed() {
        let mut correlator = RunCorrelator::new();

        let mut no_parent = span("s1", "ai.streamText.doStream");
        assert_eq!(correlator.on_start(&mut no_parent), None);

        let mut unknown_parent = span("t1", "ai.toolCall").with_parent("missing");
        assert_eq!(correlator.on_start(&mut unknown_parent), None);
        assert!(unknown_parent.attribute(RUN_ID_ATTRIBUTE).is_none());

        let mut unknown = span("x1", "http.request");
        assert_eq!(correlator.on_start(&mut unknown), None);
        assert!(correlator.is_empty());
    }

    #[test]
    fn test_resolve_end_and_forget() {
        let mut correlator = RunCorrelator::new();
        let mut run = span("r1", "ai.generateText");
        let run_id = correlator.on_start(&mut run).unwrap();
        let mut step = span("s1", "ai.generateText.doGenerate").with_parent("r1");
        correlator.on_start(&mut step);

        assert_eq!(correlator.resolve_end(&run, SpanKind::Run), Some(run_id.clone()));
        assert_eq!(correlator.resolve_end(&step, SpanKind::Step), Some(run_id));

        correlator.forget(["s1", "r1"]);
        assert!(correlator.resolve_end(&run, SpanKind::Run).is_none());
        assert!(correlator.is_empty());
    }
}
