//! Run batching
//!
//! Groups the spans of each run into one batch and hands it to an exporter
//! sink as a single unit. A batch is flushed when its run span ends, or when
//! no span has been added to it for the idle timeout.
//!
//! Correlation, batch and timer state share one lock and are always mutated
//! together. The sink is only called after the lock is released.

use crate::classify::{classify, SpanKind};
use crate::correlate::{RunCorrelator, RunId};
use crate::plugins::{ExportReceipt, PluginResult, SpanBatch, SpanExporter, SpanProcessor};
use crate::span::SpanData;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default idle window before a run is flushed without its run span
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Batch manager configuration
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Idle window after the last added span
    pub idle_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Batch manager statistics
#[derive(Debug, Clone, Default)]
pub struct BatchStats {
    pub pending_runs: usize,
    pub tracked_spans: usize,
    pub spans_batched: u64,
    pub spans_dropped: u64,
    pub batches_exported: u64,
}

struct IdleTimer {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl IdleTimer {
    fn cancel(self) {
        if let Some(handle) = self.handle {
            handle.abort();
        }
    }
}

#[derive(Default)]
struct BatchState {
    correlator: RunCorrelator,
    batches: HashMap<RunId, Vec<SpanData>>,
    timers: HashMap<RunId, IdleTimer>,
    next_generation: u64,
}

impl BatchState {
    /// Remove a run's batch, timer and correlation entries
    fn take(&mut self, run_id: &RunId) -> Option<Vec<SpanData>> {
        if let Some(timer) = self.timers.remove(run_id) {
            timer.cancel();
        }
        let spans = self.batches.remove(run_id)?;
        self.correlator
            .forget(spans.iter().map(|span| span.span_id.as_str()));
        Some(spans)
    }
}

struct Inner {
    exporter: Arc<dyn SpanExporter>,
    config: BatchConfig,
    state: Mutex<BatchState>,
    closed: AtomicBool,
    no_runtime_warned: AtomicBool,
    spans_batched: AtomicU64,
    spans_dropped: AtomicU64,
    batches_exported: AtomicU64,
}

impl Inner {
    fn append(self: &Arc<Self>, state: &mut BatchState, run_id: &RunId, span: SpanData) {
        state.batches.entry(run_id.clone()).or_default().push(span);
        self.spans_batched.fetch_add(1, Ordering::Relaxed);
    }

    /// Cancel the run's previous timer and start a new one
    fn restart_timer(self: &Arc<Self>, state: &mut BatchState, run_id: &RunId) {
        if let Some(previous) = state.timers.remove(run_id) {
            previous.cancel();
        }

        state.next_generation += 1;
        let generation = state.next_generation;

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let weak: Weak<Inner> = Arc::downgrade(self);
                let run_id = run_id.clone();
                let timeout = self.config.idle_timeout;
                Some(runtime.spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.idle_flush(&run_id, generation);
                    }
                }))
            }
            Err(_) => {
                if !self.no_runtime_warned.swap(true, Ordering::Relaxed) {
                    warn!("No tokio runtime, idle flush disabled");
                }
                debug!("No idle timer for run {}", run_id);
                None
            }
        };

        state
            .timers
            .insert(run_id.clone(), IdleTimer { generation, handle });
    }

    fn idle_flush(&self, run_id: &RunId, generation: u64) {
        let spans = {
            let mut state = self.state.lock();
            match state.timers.get(run_id) {
                Some(timer) if timer.generation == generation => {}
                _ => return,
            }
            // This task is the timer; drop its handle instead of aborting it
            state.timers.remove(run_id);
            state.take(run_id)
        };

        if let Some(spans) = spans {
            debug!("Idle timeout reached for run {}", run_id);
            self.export(run_id.clone(), spans);
        }
    }

    fn export(&self, run_id: RunId, spans: Vec<SpanData>) -> ExportReceipt {
        debug!(
            "Sending batch {} ({} spans) to {}",
            run_id,
            spans.len(),
            self.exporter.name()
        );
        self.batches_exported.fetch_add(1, Ordering::Relaxed);
        self.exporter.export(SpanBatch::new(Some(run_id), spans))
    }
}

/// Batch manager: one batch per active run
#[derive(Clone)]
pub struct RunBatchProcessor {
    inner: Arc<Inner>,
}

impl RunBatchProcessor {
    pub fn new(exporter: Arc<dyn SpanExporter>, config: BatchConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                exporter,
                config,
                state: Mutex::new(BatchState::default()),
                closed: AtomicBool::new(false),
                no_runtime_warned: AtomicBool::new(false),
                spans_batched: AtomicU64::new(0),
                spans_dropped: AtomicU64::new(0),
                batches_exported: AtomicU64::new(0),
            }),
        }
    }

    /// Assign and stamp run identity on a starting span
    pub fn on_start(&self, span: &mut SpanData) -> Option<RunId> {
        if self.is_closed() {
            return None;
        }
        self.inner.state.lock().correlator.on_start(span)
    }

    /// Batch an ended span. A run span closes its batch immediately.
    pub fn on_end(&self, span: SpanData) -> Option<ExportReceipt> {
        if self.is_closed() {
            debug!("Batch processor closed, ignoring span {}", span.span_id);
            return None;
        }

        let kind = classify(&span);
        if kind == SpanKind::Unknown {
            debug!("Ignoring unknown span type: {}", span.name);
            return None;
        }

        let inner = &self.inner;
        let (run_id, spans) = {
            let mut state = inner.state.lock();
            let Some(run_id) = state.correlator.resolve_end(&span, kind) else {
                debug!("Dropping unattributed span {} ({})", span.span_id, span.name);
                inner.spans_dropped.fetch_add(1, Ordering::Relaxed);
                return None;
            };

            if kind != SpanKind::Run {
                inner.append(&mut state, &run_id, span);
                inner.restart_timer(&mut state, &run_id);
                return None;
            }

            inner.append(&mut state, &run_id, span);
            let spans = state.take(&run_id);
            (run_id, spans)
        };

        spans.map(|spans| inner.export(run_id, spans))
    }

    /// Append a span to a run's batch and restart the run's idle timer
    pub fn add_span(&self, run_id: &RunId, span: SpanData) {
        if self.is_closed() {
            return;
        }
        let mut state = self.inner.state.lock();
        self.inner.append(&mut state, run_id, span);
        self.inner.restart_timer(&mut state, run_id);
    }

    /// Export a run's batch. Unknown or already flushed runs are a no-op.
    pub fn flush(&self, run_id: &RunId) -> Option<ExportReceipt> {
        let spans = self.inner.state.lock().take(run_id);
        match spans {
            Some(spans) => Some(self.inner.export(run_id.clone(), spans)),
            None => {
                debug!("Batch {} not found", run_id);
                None
            }
        }
    }

    /// Export every pending batch
    pub fn flush_all(&self) -> Vec<ExportReceipt> {
        let drained: Vec<(RunId, Vec<SpanData>)> = {
            let mut state = self.inner.state.lock();
            let run_ids: Vec<RunId> = state.batches.keys().cloned().collect();
            run_ids
                .into_iter()
                .filter_map(|run_id| state.take(&run_id).map(|spans| (run_id, spans)))
                .collect()
        };

        drained
            .into_iter()
            .map(|(run_id, spans)| self.inner.export(run_id, spans))
            .collect()
    }

    /// Flush every batch and wait for the sink to drain
    pub async fn force_flush(&self) -> PluginResult<()> {
        self.flush_all();
        self.inner.exporter.force_flush().await
    }

    /// Stop accepting spans, flush and shut the sink down. Idempotent.
    pub async fn shutdown(&self) -> PluginResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let receipts = self.flush_all();
        info!(
            "Batch processor shutting down, flushed {} pending runs",
            receipts.len()
        );
        // The sink is shut down even when its flush fails; the first error wins
        let flushed = self.inner.exporter.force_flush().await;
        if let Err(e) = &flushed {
            warn!("Error flushing {} on shutdown: {}", self.inner.exporter.name(), e);
        }
        let shut_down = self.inner.exporter.shutdown().await;

        self.inner.state.lock().correlator = RunCorrelator::new();
        flushed.and(shut_down)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn pending_runs(&self) -> usize {
        self.inner.state.lock().batches.len()
    }

    /// Number of spans waiting in a run's batch
    pub fn pending_spans(&self, run_id: &RunId) -> usize {
        self.inner
            .state
            .lock()
            .batches
            .get(run_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> BatchStats {
        let state = self.inner.state.lock();
        BatchStats {
            pending_runs: state.batches.len(),
            tracked_spans: state.correlator.len(),
            spans_batched: self.inner.spans_batched.load(Ordering::Relaxed),
            spans_dropped: self.inner.spans_dropped.load(Ordering::Relaxed),
            batches_exported: self.inner.batches_exported.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl SpanProcessor for RunBatchProcessor {
    fn on_start(&self, span: &mut SpanData) {
        RunBatchProcessor::on_start(self, span);
    }

    fn on_end(&self, span: SpanData) {
        RunBatchProcessor::on_end(self, span);
    }

    async fn force_flush(&self) -> PluginResult<()> {
        RunBatchProcessor::force_flush(self).await
    }

    async fn shutdown(&self) -> PluginResult<()> {
        RunBatchProcessor::shutdown(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlate::RUN_ID_ATTRIBUTE;
    use crate::plugins::{MemoryExporter, PluginError};
    use chrono::Utc;

    fn setup() -> (RunBatchProcessor, Arc<MemoryExporter>) {
        let exporter = Arc::new(MemoryExporter::new());
        let processor = RunBatchProcessor::new(exporter.clone(), BatchConfig::default());
        (processor, exporter)
    }

    fn span(id: &str, name: &str, parent: Option<&str>) -> SpanData {
        let span = SpanData::new("trace-1", id, name, Utc::now());
        match parent {
            Some(parent) => span.with_parent(parent),
            None => span,
        }
    }

    fn started(processor: &RunBatchProcessor, id: &str, name: &str, parent: Option<&str>) -> SpanData {
        let mut span = span(id, name, parent);
        processor.on_start(&mut span);
        span
    }

    fn span_ids(batch: &SpanBatch) -> Vec<&str> {
        batch.spans.iter().map(|s| s.span_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_run_end_exports_steps_and_run() {
        let (processor, exporter) = setup();

        let run = started(&processor, "r1", "ai.generateText", None);
        let step = started(&processor, "s1", "ai.generateText.doGenerate", Some("r1"));
        let run_id = RunId::from_stamp(&run).unwrap();
        assert_eq!(RunId::from_stamp(&step), Some(run_id.clone()));

        processor.on_end(step);
        assert_eq!(exporter.batch_count(), 0);
        assert_eq!(processor.pending_spans(&run_id), 1);

        let receipt = processor.on_end(run).unwrap();
        receipt.wait().await.unwrap();

        let batches = exporter.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].run_id, Some(run_id.clone()));
        assert_eq!(span_ids(&batches[0]), vec!["s1", "r1"]);
        for span in &batches[0].spans {
            assert_eq!(
                span.attribute(RUN_ID_ATTRIBUTE).and_then(|v| v.as_str()),
                Some(run_id.as_str())
            );
        }
        assert_eq!(processor.pending_runs(), 0);
        assert_eq!(processor.stats().tracked_spans, 0);
    }

    #[tokio::test]
    async fn test_batch_contains_all_descendants() {
        let (processor, exporter) = setup();

        let run = started(&processor, "r1", "ai.streamText", None);
        let mut ended = Vec::new();
        for i in 0..3 {
            let step_id = format!("s{}", i);
            ended.push(started(&processor, &step_id, "ai.streamText.doStream", Some("r1")));
            ended.push(started(&processor, &format!("t{}", i), "ai.toolCall", Some("r1")));
        }
        for span in ended {
            processor.on_end(span);
        }
        processor.on_end(run);

        let batches = exporter.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 7);
        assert_eq!(span_ids(&batches[0]).last(), Some(&"r1"));
    }

    #[tokio::test]
    async fn test_unattributed_tool_call_dropped() {
        let (processor, exporter) = setup();

        let tool = started(&processor, "t1", "ai.toolCall", Some("unknown"));
        assert!(tool.attribute(RUN_ID_ATTRIBUTE).is_none());
        assert!(processor.on_end(tool).is_none());

        processor.force_flush().await.unwrap();
        assert_eq!(exporter.batch_count(), 0);
        assert_eq!(processor.stats().spans_dropped, 1);
    }

    #[tokio::test]
    async fn test_unknown_spans_ignored() {
        let (processor, exporter) = setup();

        let other = started(&processor, "x1", "http.request", None);
        assert!(processor.on_end(other).is_none());
        assert_eq!(processor.stats().spans_dropped, 0);
        assert_eq!(exporter.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_flush_twice_exports_once() {
        let (processor, exporter) = setup();
        let run_id = RunId::from("run-1");

        processor.add_span(&run_id, span("s1", "ai.generateText.doGenerate", None));
        assert!(processor.flush(&run_id).is_some());
        assert!(processor.flush(&run_id).is_none());
        assert!(processor.flush(&RunId::from("never-seen")).is_none());

        assert_eq!(exporter.batch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_flushes_open_run() {
        let (processor, exporter) = setup();

        let run = started(&processor, "r1", "ai.generateText", None);
        let step = started(&processor, "s1", "ai.generateText.doGenerate", Some("r1"));
        processor.on_end(step);

        tokio::time::sleep(Duration::from_secs(599)).await;
        assert_eq!(exporter.batch_count(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(exporter.batch_count(), 1);
        assert_eq!(span_ids(&exporter.batches()[0]), vec!["s1"]);

        // The run span's own mapping survives, so its late end still exports
        processor.on_end(run);
        assert_eq!(exporter.batch_count(), 2);
        assert_eq!(span_ids(&exporter.batches()[1]), vec!["r1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_span_restarts_idle_timer() {
        let (processor, exporter) = setup();
        let run_id = RunId::from("run-1");

        processor.add_span(&run_id, span("s1", "ai.streamText.doStream", None));
        tokio::time::sleep(Duration::from_secs(300)).await;
        processor.add_span(&run_id, span("s2", "ai.streamText.doStream", None));

        // Past the first timer's deadline but not the second's
        tokio::time::sleep(Duration::from_secs(400)).await;
        assert_eq!(exporter.batch_count(), 0);

        tokio::time::sleep(Duration::from_secs(250)).await;
        assert_eq!(exporter.batch_count(), 1);
        assert_eq!(exporter.batches()[0].len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_idle_timeout() {
        let exporter = Arc::new(MemoryExporter::new());
        let processor = RunBatchProcessor::new(
            exporter.clone(),
            BatchConfig {
                idle_timeout: Duration::from_secs(5),
            },
        );

        processor.add_span(&RunId::from("run-1"), span("s1", "ai.toolCall", None));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(exporter.batch_count(), 1);
    }

    #[test]
    fn test_without_runtime_batches_without_timer() {
        let (processor, exporter) = setup();
        let run_id = RunId::from("run-1");

        processor.add_span(&run_id, span("s1", "ai.toolCall", None));
        assert_eq!(processor.pending_spans(&run_id), 1);

        let mut receipt = processor.flush(&run_id).unwrap();
        assert!(matches!(receipt.try_wait(), Some(Ok(()))));
        assert_eq!(exporter.batch_count(), 1);
    }

    #[test]
    fn test_without_runtime_warns_once() {
        let (processor, _exporter) = setup();

        processor.add_span(&RunId::from("run-1"), span("s1", "ai.toolCall", None));
        assert!(processor.inner.no_runtime_warned.load(Ordering::Relaxed));

        // Later runs keep batching without a timer
        processor.add_span(&RunId::from("run-2"), span("s2", "ai.toolCall", None));
        assert_eq!(processor.pending_runs(), 2);
        assert!(processor.inner.state.lock().timers.values().all(|t| t.handle.is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_flush_cancels_idle_timer() {
        let (processor, exporter) = setup();
        let run_id = RunId::from("run-1");

        processor.add_span(&run_id, span("s1", "ai.generateText.doGenerate", None));
        processor.flush(&run_id).unwrap().wait().await.unwrap();

        tokio::time::sleep(DEFAULT_IDLE_TIMEOUT + Duration::from_secs(100)).await;
        assert_eq!(exporter.batch_count(), 1);
        assert_eq!(processor.stats().batches_exported, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_end_cancels_idle_timer() {
        let (processor, exporter) = setup();

        let run = started(&processor, "r1", "ai.generateText", None);
        let step = started(&processor, "s1", "ai.generateText.doGenerate", Some("r1"));
        processor.on_end(step);
        processor.on_end(run).unwrap().wait().await.unwrap();

        tokio::time::sleep(DEFAULT_IDLE_TIMEOUT + Duration::from_secs(100)).await;
        assert_eq!(exporter.batch_count(), 1);
        assert_eq!(exporter.batches()[0].len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_closes() {
        let (processor, exporter) = setup();

        let run = started(&processor, "r1", "ai.generateObject", None);
        let step = started(&processor, "s1", "ai.generateObject.doGenerate", Some("r1"));
        processor.on_end(step);

        processor.shutdown().await.unwrap();
        assert!(processor.is_closed());
        assert!(exporter.is_shut_down());
        assert_eq!(exporter.batch_count(), 1);

        // Second shutdown is a no-op and spans are ignored from now on
        processor.shutdown().await.unwrap();
        assert!(processor.on_end(run).is_none());
        let mut late = span("r2", "ai.generateText", None);
        assert!(processor.on_start(&mut late).is_none());
        assert_eq!(exporter.batch_count(), 1);

        let rejected = exporter
            .export(SpanBatch::new(None, vec![late]))
            .wait()
            .await;
        assert!(matches!(rejected, Err(PluginError::ShutDown)));
    }

    /// Sink whose flush always fails
    #[derive(Default)]
    struct FailingFlushExporter {
        exported: AtomicU64,
        shut_down: AtomicBool,
    }

    impl crate::plugins::PluginInfo for FailingFlushExporter {
        fn name(&self) -> &str {
            "failing-flush"
        }

        fn version(&self) -> &str {
            "0.0.0"
        }
    }

    #[async_trait]
    impl SpanExporter for FailingFlushExporter {
        fn export(&self, _batch: SpanBatch) -> ExportReceipt {
            self.exported.fetch_add(1, Ordering::SeqCst);
            ExportReceipt::ready(Ok(()))
        }

        async fn force_flush(&self) -> PluginResult<()> {
            Err(PluginError::ExportFailed("disk full".to_string()))
        }

        async fn shutdown(&self) -> PluginResult<()> {
            self.shut_down.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shutdown_reaches_sink_when_flush_fails() {
        let exporter = Arc::new(FailingFlushExporter::default());
        let processor = RunBatchProcessor::new(exporter.clone(), BatchConfig::default());

        let _run = started(&processor, "r1", "ai.generateText", None);
        let step = started(&processor, "s1", "ai.generateText.doGenerate", Some("r1"));
        processor.on_end(step);

        let result = processor.shutdown().await;
        assert!(matches!(result, Err(PluginError::ExportFailed(msg)) if msg == "disk full"));
        assert!(exporter.shut_down.load(Ordering::SeqCst));
        assert_eq!(exporter.exported.load(Ordering::SeqCst), 1);
        assert_eq!(processor.stats().tracked_spans, 0);

        // Already closed; nothing left to do
        processor.shutdown().await.unwrap();
    }
}
