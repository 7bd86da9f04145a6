//! Span pipeline wiring
//!
//! Run batches go to the remote and file sinks through a single
//! `RunBatchProcessor`; the local store sees every known span as soon as it
//! ends so observers update live.

use crate::sinks::ExporterSet;
use std::path::PathBuf;
use std::sync::Arc;
use tcc_core::batch::{BatchConfig, BatchStats, RunBatchProcessor};
use tcc_core::config::TccConfig;
use tcc_core::plugins::{SpanExporter, SpanProcessor};
use tcc_core::processor::{FanoutProcessor, SimpleSpanProcessor, SpanTracker};
use tcc_core::span::SpanEvent;
use tcc_export::{
    JsonlExporter, JsonlExporterConfig, LocalExporterConfig, LocalSpanExporter,
    OtlpExporterConfig, OtlpHttpJsonExporter,
};
use tracing::info;

pub struct Pipeline {
    tracker: SpanTracker,
    batcher: Arc<RunBatchProcessor>,
    local: Option<Arc<LocalSpanExporter>>,
    sink_names: Vec<String>,
}

impl Pipeline {
    /// Build the sinks enabled in `config`. `output` forces a JSONL sink.
    pub fn from_config(config: &TccConfig, output: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut sinks: Vec<Arc<dyn SpanExporter>> = Vec::new();

        if config.export.otlp.enabled {
            let otlp = OtlpHttpJsonExporter::new(OtlpExporterConfig::from(&config.export.otlp))?;
            sinks.push(Arc::new(otlp));
        }

        let jsonl_path = output.or_else(|| {
            config
                .export
                .jsonl
                .enabled
                .then(|| PathBuf::from(&config.export.jsonl.path))
        });
        if let Some(path) = jsonl_path {
            let jsonl = JsonlExporter::new(JsonlExporterConfig {
                path,
                ..Default::default()
            })?;
            sinks.push(Arc::new(jsonl));
        }

        let local = config.export.local.enabled.then(|| {
            Arc::new(LocalSpanExporter::new(LocalExporterConfig {
                buffer_size: config.export.local.buffer_size,
            }))
        });

        Ok(Self::with_sinks(config.batch.batch_config(), sinks, local))
    }

    pub fn with_sinks(
        batch_config: BatchConfig,
        sinks: Vec<Arc<dyn SpanExporter>>,
        local: Option<Arc<LocalSpanExporter>>,
    ) -> Self {
        let sinks = ExporterSet::new(sinks);
        let sink_names = sinks.names().into_iter().map(String::from).collect();
        let batcher = Arc::new(RunBatchProcessor::new(Arc::new(sinks), batch_config));

        // Batching runs first so the local store sees stamped run ids
        let mut fanout = FanoutProcessor::new().with(batcher.clone() as Arc<dyn SpanProcessor>);
        if let Some(local) = &local {
            fanout.push(Arc::new(SimpleSpanProcessor::new(local.clone())));
        }

        Self {
            tracker: SpanTracker::new(Arc::new(fanout)),
            batcher,
            local,
            sink_names,
        }
    }

    pub fn handle(&self, event: SpanEvent) {
        self.tracker.handle(event);
    }

    pub fn local(&self) -> Option<Arc<LocalSpanExporter>> {
        self.local.clone()
    }

    pub fn sink_names(&self) -> &[String] {
        &self.sink_names
    }

    pub fn stats(&self) -> BatchStats {
        self.batcher.stats()
    }

    /// Spans started but not yet ended
    pub fn in_flight(&self) -> usize {
        self.tracker.in_flight()
    }

    /// Flush every pending run and shut all sinks down
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.tracker.shutdown().await?;
        let stats = self.stats();
        info!(
            "Pipeline stopped: {} batches exported, {} spans batched, {} dropped",
            stats.batches_exported, stats.spans_batched, stats.spans_dropped
        );
        Ok(())
    }
}
