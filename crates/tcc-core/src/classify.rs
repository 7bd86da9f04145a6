//! Span classification
//!
//! Maps AI SDK span names onto the three shapes the pipeline understands.

use crate::span::SpanData;
use serde::{Deserialize, Serialize};

/// Top-level generation calls
const RUN_SPAN_NAMES: &[&str] = &[
    "ai.generateText",
    "ai.streamText",
    "ai.generateObject",
    "ai.streamObject",
];

/// Single model round-trips within a run
const STEP_SPAN_NAMES: &[&str] = &[
    "ai.generateText.doGenerate",
    "ai.streamText.doStream",
    "ai.generateObject.doGenerate",
    "ai.streamObject.doStream",
];

const TOOL_CALL_SPAN_NAME: &str = "ai.toolCall";

/// Semantic kind of a span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Run,
    Step,
    ToolCall,
    /// Not part of an agent run; ignored downstream
    Unknown,
}

impl SpanKind {
    pub fn is_known(self) -> bool {
        self != SpanKind::Unknown
    }
}

/// Classify a span by its name
pub fn classify(span: &SpanData) -> SpanKind {
    classify_name(&span.name)
}

pub fn classify_name(name: &str) -> SpanKind {
    if RUN_SPAN_NAMES.contains(&name) {
        SpanKind::Run
    } else if STEP_SPAN_NAMES.contains(&name) {
        SpanKind::Step
    } else if name == TOOL_CALL_SPAN_NAME {
        SpanKind::ToolCall
    } else {
        SpanKind::Unknown
    }
}
