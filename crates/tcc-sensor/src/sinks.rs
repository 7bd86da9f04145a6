//! Composite exporter handing each run batch to every configured sink

use async_trait::async_trait;
use std::sync::Arc;
use tcc_core::plugins::{
    ExportReceipt, PluginError, PluginInfo, PluginResult, SpanBatch, SpanExporter,
};
use tracing::warn;

pub struct ExporterSet {
    exporters: Vec<Arc<dyn SpanExporter>>,
}

impl ExporterSet {
    pub fn new(exporters: Vec<Arc<dyn SpanExporter>>) -> Self {
        Self { exporters }
    }

    pub fn names(&self) -> Vec<&str> {
        self.exporters.iter().map(|e| e.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.exporters.is_empty()
    }
}

impl PluginInfo for ExporterSet {
    fn name(&self) -> &str {
        "exporter-set"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }
}

#[async_trait]
impl SpanExporter for ExporterSet {
    fn export(&self, batch: SpanBatch) -> ExportReceipt {
        let mut receipts: Vec<ExportReceipt> = self
            .exporters
            .iter()
            .map(|e| e.export(batch.clone()))
            .collect();

        match receipts.len() {
            0 => return ExportReceipt::ready(Ok(())),
            1 => return receipts.remove(0),
            _ => {}
        }

        // The batch is already with every sink; report what has settled
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return ExportReceipt::ready(settled(receipts));
        };

        // Resolve with the first failure, after every sink has finished
        let (tx, receipt) = ExportReceipt::channel();
        handle.spawn(async move {
            let mut outcome = Ok(());
            for receipt in receipts {
                if let Err(e) = receipt.wait().await {
                    if outcome.is_ok() {
                        outcome = Err(e);
                    }
                }
            }
            let _ = tx.send(outcome);
        });
        receipt
    }

    async fn force_flush(&self) -> PluginResult<()> {
        let mut outcome = Ok(());
        for exporter in &self.exporters {
            if let Err(e) = exporter.force_flush().await {
                warn!("Error flushing exporter {}: {}", exporter.name(), e);
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        outcome
    }

    async fn shutdown(&self) -> PluginResult<()> {
        let mut outcome = Ok(());
        for exporter in &self.exporters {
            if let Err(e) = exporter.shutdown().await {
                warn!("Error shutting down exporter {}: {}", exporter.name(), e);
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        outcome
    }
}

/// First failure among receipts that have already resolved. A receipt still
/// pending cannot be awaited without a runtime and counts as a failure.
fn settled(receipts: Vec<ExportReceipt>) -> PluginResult<()> {
    let mut outcome = Ok(());
    for mut receipt in receipts {
        let result = receipt.try_wait().unwrap_or_else(|| {
            Err(PluginError::OperationFailed(
                "export still pending without a tokio runtime".to_string(),
            ))
        });
        if let Err(e) = result {
            if outcome.is_ok() {
                outcome = Err(e);
            }
        }
    }
    outcome
}
