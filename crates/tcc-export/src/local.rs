//! Local store exporter
//!
//! Keeps the reconciled trace store in memory and broadcasts every delta to
//! live observers (the WebSocket transport subscribes here).

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tcc_core::convert::shape_spans;
use tcc_core::plugins::{
    ExportReceipt, PluginError, PluginInfo, PluginResult, SpanBatch, SpanExporter,
};
use tcc_core::store::{NewItems, TraceStore};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Local exporter configuration
#[derive(Debug, Clone)]
pub struct LocalExporterConfig {
    /// Delta channel buffer size
    pub buffer_size: usize,
}

impl Default for LocalExporterConfig {
    fn default() -> Self {
        Self { buffer_size: 1024 }
    }
}

/// Exporter reconciling batches into an in-memory store
pub struct LocalSpanExporter {
    store: RwLock<TraceStore>,
    tx: broadcast::Sender<NewItems>,
    closed: AtomicBool,
    batches_received: AtomicU64,
    records_merged: AtomicU64,
}

impl LocalSpanExporter {
    pub fn new(config: LocalExporterConfig) -> Self {
        let (tx, _) = broadcast::channel(config.buffer_size.max(1));
        Self {
            store: RwLock::new(TraceStore::new()),
            tx,
            closed: AtomicBool::new(false),
            batches_received: AtomicU64::new(0),
            records_merged: AtomicU64::new(0),
        }
    }

    /// Copy of the current store
    pub fn snapshot(&self) -> TraceStore {
        self.store.read().clone()
    }

    /// Receiver for deltas merged from now on
    pub fn subscribe(&self) -> broadcast::Receiver<NewItems> {
        self.tx.subscribe()
    }

    /// Snapshot and receiver taken together, so no delta is missed or
    /// applied twice
    pub fn subscribe_with_snapshot(&self) -> (TraceStore, broadcast::Receiver<NewItems>) {
        let store = self.store.read();
        (store.clone(), self.tx.subscribe())
    }

    /// Drop everything held so far
    pub fn reset(&self) {
        self.store.write().reset();
        info!("Local trace store reset");
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn batches_received(&self) -> u64 {
        self.batches_received.load(Ordering::Relaxed)
    }

    pub fn records_merged(&self) -> u64 {
        self.records_merged.load(Ordering::Relaxed)
    }
}

impl Default for LocalSpanExporter {
    fn default() -> Self {
        Self::new(LocalExporterConfig::default())
    }
}

impl PluginInfo for LocalSpanExporter {
    fn name(&self) -> &str {
        "local-store"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn description(&self) -> &str {
        "Reconciles spans into a local store for live observers"
    }
}

#[async_trait]
impl SpanExporter for LocalSpanExporter {
    fn export(&self, batch: SpanBatch) -> ExportReceipt {
        if self.closed.load(Ordering::SeqCst) {
            debug!("Ignoring export called after shutdown");
            return ExportReceipt::ready(Err(PluginError::ShutDown));
        }

        self.batches_received.fetch_add(1, Ordering::Relaxed);
        let items = shape_spans(&batch.spans);
        if items.is_empty() {
            return ExportReceipt::ready(Ok(()));
        }

        // Merge and publish under the write lock so subscribe_with_snapshot
        // never sees a delta that is already in its snapshot
        let mut store = self.store.write();
        store.merge(&items);
        self.records_merged
            .fetch_add(items.len() as u64, Ordering::Relaxed);
        debug!("Merged {} records into local store", items.len());
        let _ = self.tx.send(items);
        drop(store);

        ExportReceipt::ready(Ok(()))
    }

    async fn shutdown(&self) -> PluginResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.store.write().reset();
        debug!("Local exporter shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tcc_core::span::{SpanData, SpanStatus};

    fn run_batch(trace_id: &str) -> SpanBatch {
        let start = Utc::now();
        let mut run = SpanData::new(trace_id, "aaaaaaaaaaaaaaaa", "ai.streamText", start)
            .with_attribute("ai.prompt", r#"{"prompt":"hello"}"#);
        run.end(start, SpanStatus::ok());
        let mut call = SpanData::new(trace_id, "bbbbbbbbbbbbbbbb", "ai.toolCall", start)
            .with_parent("aaaaaaaaaaaaaaaa")
            .with_attribute("ai.toolCall.name", "search");
        call.end(start, SpanStatus::error("boom"));
        SpanBatch::new(None, vec![call, run])
    }

    #[tokio::test]
    async fn test_export_merges_and_broadcasts() {
        let exporter = LocalSpanExporter::default();
        let mut rx = exporter.subscribe();

        exporter.export(run_batch("t1")).wait().await.unwrap();

        let delta = rx.recv().await.unwrap();
        assert_eq!(delta.runs.len(), 1);
        assert_eq!(delta.tool_calls.len(), 1);
        assert!(delta.has_failure());

        let store = exporter.snapshot();
        let entry = store.get("t1").unwrap();
        assert_eq!(entry.run.as_ref().unwrap().prompt, "hello");
        assert_eq!(exporter.records_merged(), 2);
    }

    #[tokio::test]
    async fn test_subscribe_with_snapshot() {
        let exporter = LocalSpanExporter::default();
        exporter.export(run_batch("t1")).wait().await.unwrap();

        let (snapshot, mut rx) = exporter.subscribe_with_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(rx.try_recv().is_err());

        exporter.export(run_batch("t2")).wait().await.unwrap();
        let delta = rx.try_recv().unwrap();
        assert_eq!(delta.runs[0].span.trace_id, "t2");
    }

    #[tokio::test]
    async fn test_unknown_spans_not_broadcast() {
        let exporter = LocalSpanExporter::default();
        let mut rx = exporter.subscribe();
        let other = SpanData::new("t1", "cccccccccccccccc", "http.request", Utc::now());

        exporter.export(SpanBatch::new(None, vec![other])).wait().await.unwrap();
        assert!(rx.try_recv().is_err());
        assert!(exporter.snapshot().is_empty());
        assert_eq!(exporter.batches_received(), 1);
    }

    #[tokio::test]
    async fn test_reset() {
        let exporter = LocalSpanExporter::default();
        exporter.export(run_batch("t1")).wait().await.unwrap();
        exporter.reset();
        assert!(exporter.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_clears_and_rejects() {
        let exporter = LocalSpanExporter::default();
        exporter.export(run_batch("t1")).wait().await.unwrap();

        exporter.shutdown().await.unwrap();
        assert!(exporter.snapshot().is_empty());

        let result = exporter.export(run_batch("t2")).wait().await;
        assert!(matches!(result, Err(PluginError::ShutDown)));
        exporter.shutdown().await.unwrap();
    }
}
