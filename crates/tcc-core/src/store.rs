//! Per-trace record store
//!
//! Reconciles incrementally arriving records into one entry per trace.
//! Children may arrive before their run; entries are created lazily and
//! their steps and tool calls are only ever appended to.

use crate::convert::{RunRecord, StepRecord, ToolCallRecord};
use crate::enrich::{enrich, EnrichedRun};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Everything known about one trace
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEntry {
    #[serde(default)]
    pub run: Option<RunRecord>,

    #[serde(default)]
    pub steps: Vec<StepRecord>,

    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
}

/// A delta of newly converted records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewItems {
    #[serde(default)]
    pub runs: Vec<RunRecord>,

    #[serde(default)]
    pub steps: Vec<StepRecord>,

    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
}

impl NewItems {
    pub fn len(&self) -> usize {
        self.runs.len() + self.steps.len() + self.tool_calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any record in the delta has an error status
    pub fn has_failure(&self) -> bool {
        self.runs.iter().any(|r| r.span.is_error())
            || self.steps.iter().any(|s| s.span.is_error())
            || self.tool_calls.iter().any(|t| t.span.is_error())
    }
}

/// A run or tool call that ended with an error status
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Failure {
    Run(RunRecord),
    ToolCall(ToolCallRecord),
}

impl Failure {
    pub fn trace_id(&self) -> &str {
        match self {
            Failure::Run(r) => &r.span.trace_id,
            Failure::ToolCall(t) => &t.span.trace_id,
        }
    }
}

/// Trace id to entry map
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceStore {
    entries: HashMap<String, TraceEntry>,
}

impl TraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, trace_id: &str) -> Option<&TraceEntry> {
        self.entries.get(trace_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &TraceEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge a delta in place. Runs replace the entry's run; steps and tool
    /// calls are appended without deduplication.
    pub fn merge(&mut self, items: &NewItems) {
        for run in &items.runs {
            self.entries
                .entry(run.span.trace_id.clone())
                .or_default()
                .run = Some(run.clone());
        }

        for step in &items.steps {
            self.entries
                .entry(step.span.trace_id.clone())
                .or_default()
                .steps
                .push(step.clone());
        }

        for call in &items.tool_calls {
            self.entries
                .entry(call.span.trace_id.clone())
                .or_default()
                .tool_calls
                .push(call.clone());
        }
    }

    /// Drop every entry
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Runs, newest first
    pub fn runs(&self) -> Vec<&RunRecord> {
        let mut runs: Vec<&RunRecord> = self.entries.values().filter_map(|e| e.run.as_ref()).collect();
        runs.sort_by(|a, b| b.span.start_time.cmp(&a.span.start_time));
        runs
    }

    /// Tool calls across all traces, newest first
    pub fn tool_calls(&self) -> Vec<&ToolCallRecord> {
        let mut calls: Vec<&ToolCallRecord> =
            self.entries.values().flat_map(|e| e.tool_calls.iter()).collect();
        calls.sort_by(|a, b| b.span.start_time.cmp(&a.span.start_time));
        calls
    }

    /// Failed runs followed by failed tool calls, each newest first
    pub fn failures(&self) -> Vec<Failure> {
        let runs = self
            .runs()
            .into_iter()
            .filter(|r| r.span.is_error())
            .map(|r| Failure::Run(r.clone()));
        let calls = self
            .tool_calls()
            .into_iter()
            .filter(|t| t.span.is_error())
            .map(|t| Failure::ToolCall(t.clone()));
        runs.chain(calls).collect()
    }

    /// Timeline for one trace, if its run is known
    pub fn enriched_run(&self, trace_id: &str) -> Option<EnrichedRun> {
        self.entries.get(trace_id).and_then(enrich)
    }

    /// Timelines for every trace with a known run, newest first
    pub fn enriched_runs(&self) -> Vec<EnrichedRun> {
        let mut runs: Vec<EnrichedRun> = self.entries.values().filter_map(enrich).collect();
        runs.sort_by(|a, b| b.run.span.start_time.cmp(&a.run.span.start_time));
        runs
    }
}

/// Reconcile a delta into a store, returning the updated store
pub fn reconcile(mut store: TraceStore, items: &NewItems) -> TraceStore {
    store.merge(items);
    store
}
