//! Plugin traits for the span pipeline
//!
//! Span processors sit between the instrumentation layer and the exporter
//! sinks. Both are traits so sinks and processors can be composed freely.

use crate::correlate::RunId;
use crate::span::SpanData;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::oneshot;

/// Plugin error type
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Plugin initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Plugin operation failed: {0}")]
    OperationFailed(String),

    #[error("Plugin has been shut down")]
    ShutDown,

    #[error("Export failed: {0}")]
    ExportFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type PluginResult<T> = Result<T, PluginError>;

/// Basic plugin information
pub trait PluginInfo {
    /// Plugin name
    fn name(&self) -> &str;

    /// Plugin version
    fn version(&self) -> &str;

    /// Plugin description
    fn description(&self) -> &str {
        ""
    }
}

// =============================================================================
// EXPORT PLUGINS
// =============================================================================

/// The spans of one run, handed to a sink as a single unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanBatch {
    /// Run the spans belong to, when known
    pub run_id: Option<RunId>,

    /// Spans in arrival order
    pub spans: Vec<SpanData>,
}

impl SpanBatch {
    pub fn new(run_id: Option<RunId>, spans: Vec<SpanData>) -> Self {
        Self { run_id, spans }
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

/// Completion handle for a single export
#[derive(Debug)]
pub struct ExportReceipt {
    rx: oneshot::Receiver<PluginResult<()>>,
}

impl ExportReceipt {
    /// Receipt plus the sender the sink resolves it with
    pub fn channel() -> (oneshot::Sender<PluginResult<()>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Receipt that is already resolved
    pub fn ready(result: PluginResult<()>) -> Self {
        let (tx, receipt) = Self::channel();
        let _ = tx.send(result);
        receipt
    }

    /// Wait for the export to finish
    pub async fn wait(self) -> PluginResult<()> {
        self.rx.await.unwrap_or_else(|_| {
            Err(PluginError::OperationFailed(
                "export abandoned before completion".to_string(),
            ))
        })
    }

    /// Result, if the export has already finished
    pub fn try_wait(&mut self) -> Option<PluginResult<()>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(PluginError::OperationFailed(
                "export abandoned before completion".to_string(),
            ))),
        }
    }
}

/// Exporter sink - receives completed batches
#[async_trait]
pub trait SpanExporter: PluginInfo + Send + Sync {
    /// Hand a batch to the sink. Never blocks; the outcome is reported on
    /// the receipt. After shutdown the receipt resolves to an error.
    fn export(&self, batch: SpanBatch) -> ExportReceipt;

    /// Wait for in-flight exports without starting new ones
    async fn force_flush(&self) -> PluginResult<()> {
        Ok(())
    }

    /// Stop accepting batches, drain and release resources. Idempotent.
    async fn shutdown(&self) -> PluginResult<()>;
}

// =============================================================================
// PROCESSOR PLUGINS
// =============================================================================

/// Span processor - observes span lifecycle events
#[async_trait]
pub trait SpanProcessor: Send + Sync {
    /// Called when a span starts; may stamp attributes onto it
    fn on_start(&self, span: &mut SpanData);

    /// Called when a span ends
    fn on_end(&self, span: SpanData);

    /// Export everything pending and wait for the sinks
    async fn force_flush(&self) -> PluginResult<()>;

    /// Flush and shut down
    async fn shutdown(&self) -> PluginResult<()>;
}

// =============================================================================
// MEMORY EXPORTER
// =============================================================================

/// Sink that keeps every batch in memory
#[derive(Debug, Default)]
pub struct MemoryExporter {
    batches: Mutex<Vec<SpanBatch>>,
    closed: AtomicBool,
}

impl MemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// All batches received so far
    pub fn batches(&self) -> Vec<SpanBatch> {
        self.batches.lock().clone()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn span_count(&self) -> usize {
        self.batches.lock().iter().map(SpanBatch::len).sum()
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl PluginInfo for MemoryExporter {
    fn name(&self) -> &str {
        "memory"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn description(&self) -> &str {
        "Keeps exported batches in memory"
    }
}

#[async_trait]
impl SpanExporter for MemoryExporter {
    fn export(&self, batch: SpanBatch) -> ExportReceipt {
        if self.closed.load(Ordering::SeqCst) {
            return ExportReceipt::ready(Err(PluginError::ShutDown));
        }
        self.batches.lock().push(batch);
        ExportReceipt::ready(Ok(()))
    }

    async fn shutdown(&self) -> PluginResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
