//! Span processors other than the run batcher, plus the lifecycle driver that
//! feeds them.

use crate::classify::{classify, SpanKind};
use crate::correlate::{RunId, RUN_ID_ATTRIBUTE};
use crate::plugins::{PluginResult, SpanBatch, SpanExporter, SpanProcessor};
use crate::span::{SpanData, SpanEvent};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Exports every ended, known span on its own, without batching
pub struct SimpleSpanProcessor {
    exporter: Arc<dyn SpanExporter>,
    closed: AtomicBool,
}

impl SimpleSpanProcessor {
    pub fn new(exporter: Arc<dyn SpanExporter>) -> Self {
        Self {
            exporter,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl SpanProcessor for SimpleSpanProcessor {
    fn on_start(&self, _span: &mut SpanData) {}

    fn on_end(&self, span: SpanData) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if classify(&span) == SpanKind::Unknown {
            debug!("Ignoring unknown span type: {}", span.name);
            return;
        }

        let run_id = RunId::from_stamp(&span).unwrap_or_else(|| RunId::new(span.trace_id.as_str()));
        let _ = self.exporter.export(SpanBatch::new(Some(run_id), vec![span]));
    }

    async fn force_flush(&self) -> PluginResult<()> {
        self.exporter.force_flush().await
    }

    async fn shutdown(&self) -> PluginResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.exporter.shutdown().await
    }
}

/// Feeds one span stream to several processors, in order
#[derive(Default)]
pub struct FanoutProcessor {
    processors: Vec<Arc<dyn SpanProcessor>>,
}

impl FanoutProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, processor: Arc<dyn SpanProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn push(&mut self, processor: Arc<dyn SpanProcessor>) {
        self.processors.push(processor);
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

#[async_trait]
impl SpanProcessor for FanoutProcessor {
    fn on_start(&self, span: &mut SpanData) {
        // Later processors see what earlier ones stamped
        for processor in &self.processors {
            processor.on_start(span);
        }
    }

    fn on_end(&self, span: SpanData) {
        if let Some((last, rest)) = self.processors.split_last() {
            for processor in rest {
                processor.on_end(span.clone());
            }
            last.on_end(span);
        }
    }

    async fn force_flush(&self) -> PluginResult<()> {
        let mut first_error = None;
        for processor in &self.processors {
            if let Err(e) = processor.force_flush().await {
                warn!("Processor flush failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn shutdown(&self) -> PluginResult<()> {
        let mut first_error = None;
        for processor in &self.processors {
            if let Err(e) = processor.shutdown().await {
                warn!("Processor shutdown failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Drives span lifecycle events into a processor.
///
/// Keeps each started span so attributes stamped at start are still present
/// when the matching end event arrives.
pub struct SpanTracker {
    processor: Arc<dyn SpanProcessor>,
    started: Mutex<HashMap<String, SpanData>>,
}

impl SpanTracker {
    pub fn new(processor: Arc<dyn SpanProcessor>) -> Self {
        Self {
            processor,
            started: Mutex::new(HashMap::new()),
        }
    }

    /// Start a span; returns it as stamped by the processor
    pub fn start(&self, mut span: SpanData) -> SpanData {
        self.processor.on_start(&mut span);
        self.started
            .lock()
            .insert(span.span_id.clone(), span.clone());
        span
    }

    /// End a span, merging the end event into the started span
    pub fn end(&self, span: SpanData) {
        let started = self.started.lock().remove(&span.span_id);
        let mut merged = match started {
            Some(mut started) => {
                let stamp = started.attributes.get(RUN_ID_ATTRIBUTE).cloned();
                started.attributes.extend(span.attributes);
                if let Some(stamp) = stamp {
                    started.attributes.insert(RUN_ID_ATTRIBUTE.to_string(), stamp);
                }
                started.end_time = span.end_time;
                started.status = span.status;
                started
            }
            None => {
                debug!("End event for untracked span {}", span.span_id);
                span
            }
        };

        if merged.end_time.is_none() {
            merged.end_time = Some(Utc::now());
        }
        self.processor.on_end(merged);
    }

    pub fn handle(&self, event: SpanEvent) {
        match event {
            SpanEvent::Start(span) => {
                self.start(span);
            }
            SpanEvent::End(span) => self.end(span),
        }
    }

    /// Spans started but not yet ended
    pub fn in_flight(&self) -> usize {
        self.started.lock().len()
    }

    pub async fn force_flush(&self) -> PluginResult<()> {
        self.processor.force_flush().await
    }

    pub async fn shutdown(&self) -> PluginResult<()> {
        self.processor.shutdown().await
    }
}
