//! Run timelines
//!
//! Orders the steps of a run by start time and attaches each tool call to
//! the step that was open when it started.

use crate::convert::{RunRecord, StepRecord, ToolCallRecord};
use crate::store::TraceEntry;
use serde::{Deserialize, Serialize};

/// A step and the tool calls made during it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedStep {
    #[serde(flatten)]
    pub step: StepRecord,
    pub tool_calls: Vec<ToolCallRecord>,
}

/// A run with its ordered steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedRun {
    #[serde(flatten)]
    pub run: RunRecord,
    pub steps: Vec<EnrichedStep>,
}

enum TimelineItem<'a> {
    Step(&'a StepRecord),
    ToolCall(&'a ToolCallRecord),
}

impl TimelineItem<'_> {
    fn start_time(&self) -> chrono::DateTime<chrono::Utc> {
        match self {
            TimelineItem::Step(s) => s.span.start_time,
            TimelineItem::ToolCall(t) => t.span.start_time,
        }
    }
}

/// Build the timeline of a trace. Traces whose run is unknown have none.
///
/// Tool calls that start before every step have no owner and are left out.
pub fn enrich(entry: &TraceEntry) -> Option<EnrichedRun> {
    let run = entry.run.as_ref()?;

    let mut timeline: Vec<TimelineItem<'_>> = entry
        .steps
        .iter()
        .map(TimelineItem::Step)
        .chain(entry.tool_calls.iter().map(TimelineItem::ToolCall))
        .collect();
    // Stable: steps stay ahead of tool calls sharing their start time
    timeline.sort_by_key(TimelineItem::start_time);

    let mut steps = Vec::with_capacity(entry.steps.len());
    let mut current: Option<EnrichedStep> = None;

    for item in timeline {
        match item {
            TimelineItem::Step(step) => {
                if let Some(done) = current.replace(EnrichedStep {
                    step: step.clone(),
                    tool_calls: Vec::new(),
                }) {
                    steps.push(done);
                }
            }
            TimelineItem::ToolCall(call) => {
                if let Some(open) = current.as_mut() {
                    open.tool_calls.push(call.clone());
                }
            }
        }
    }
    steps.extend(current);

    Some(EnrichedRun {
        run: run.clone(),
        steps,
    })
}
