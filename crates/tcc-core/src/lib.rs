//! TCC Core - Span correlation, run batching and store reconciliation
//!
//! This crate provides the foundational types and pipeline stages of the
//! TCC Sensor:
//!
//! - **Spans**: the span model and its classification into runs, steps and
//!   tool calls
//! - **Batching**: run identity propagation and one export per run
//! - **Plugins**: exporter sink and span processor traits
//! - **Store**: record conversion, reconciliation and run timelines
//! - **Sync**: the protocol used to mirror the store in observers

pub mod batch;
pub mod classify;
pub mod config;
pub mod convert;
pub mod correlate;
pub mod enrich;
pub mod generator;
pub mod plugins;
pub mod processor;
pub mod span;
pub mod store;
pub mod sync;

// Re-export commonly used types
pub use batch::{BatchConfig, BatchStats, RunBatchProcessor};
pub use classify::{classify, SpanKind};
pub use config::{ConfigLoader, TccConfig};
pub use convert::{shape_spans, RunRecord, StepRecord, ToolCallRecord};
pub use correlate::{RunCorrelator, RunId, RUN_ID_ATTRIBUTE};
pub use enrich::{enrich, EnrichedRun, EnrichedStep};
pub use plugins::{
    ExportReceipt, PluginError, PluginInfo, PluginResult, SpanBatch, SpanExporter, SpanProcessor,
};
pub use processor::{FanoutProcessor, SimpleSpanProcessor, SpanTracker};
pub use span::{AttributeValue, SpanData, SpanEvent, SpanStatus, StatusCode};
pub use store::{reconcile, NewItems, TraceEntry, TraceStore};
pub use sync::{decode_message, StoreMirror, SyncMessage};

/// Sensor version
pub const SENSOR_VERSION: &str = env!("CARGO_PKG_VERSION");
