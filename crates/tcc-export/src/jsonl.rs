//! JSONL file exporter

use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tcc_core::plugins::{
    ExportReceipt, PluginError, PluginInfo, PluginResult, SpanBatch, SpanExporter,
};
use tracing::{info, warn};

/// JSONL exporter configuration
#[derive(Debug, Clone)]
pub struct JsonlExporterConfig {
    /// Output file path
    pub path: PathBuf,

    /// Whether to append to existing file
    pub append: bool,

    /// Flush after each write
    pub flush_each: bool,
}

impl Default for JsonlExporterConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tcc-batches.jsonl"),
            append: true,
            flush_each: true,
        }
    }
}

/// Writes one `{"runId": ..., "spans": [...]}` line per batch
pub struct JsonlExporter {
    config: JsonlExporterConfig,
    writer: Mutex<Option<BufWriter<File>>>,
    batches_written: AtomicU64,
}

impl JsonlExporter {
    pub fn new(config: JsonlExporterConfig) -> PluginResult<Self> {
        let file = if config.append {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.path)?
        } else {
            File::create(&config.path)?
        };
        info!("JSONL exporter writing to: {:?}", config.path);

        Ok(Self {
            config,
            writer: Mutex::new(Some(BufWriter::new(file))),
            batches_written: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.config.path
    }

    pub fn batches_written(&self) -> u64 {
        self.batches_written.load(Ordering::Relaxed)
    }

    fn write_batch(&self, batch: &SpanBatch) -> PluginResult<()> {
        let json = serde_json::to_string(batch)?;

        let mut guard = self
            .writer
            .lock()
            .map_err(|e| PluginError::OperationFailed(format!("Lock poisoned: {}", e)))?;
        let writer = guard.as_mut().ok_or(PluginError::ShutDown)?;

        writeln!(writer, "{}", json)?;
        if self.config.flush_each {
            writer.flush()?;
        }

        self.batches_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush_writer(&self) -> PluginResult<()> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|e| PluginError::OperationFailed(format!("Lock poisoned: {}", e)))?;
        if let Some(writer) = guard.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

impl PluginInfo for JsonlExporter {
    fn name(&self) -> &str {
        "jsonl-exporter"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn description(&self) -> &str {
        "Exports run batches to JSONL files"
    }
}

#[async_trait]
impl SpanExporter for JsonlExporter {
    fn export(&self, batch: SpanBatch) -> ExportReceipt {
        let result = self.write_batch(&batch);
        if let Err(e) = &result {
            warn!("Failed to write batch of {} spans: {}", batch.len(), e);
        }
        ExportReceipt::ready(result)
    }

    async fn force_flush(&self) -> PluginResult<()> {
        self.flush_writer()
    }

    async fn shutdown(&self) -> PluginResult<()> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|e| PluginError::OperationFailed(format!("Lock poisoned: {}", e)))?;
        if let Some(mut writer) = guard.take() {
            writer.flush()?;
        }
        Ok(())
    }
}
