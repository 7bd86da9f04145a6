//! Exporter sinks for TCC Sensor

#[cfg(feature = "jsonl")]
pub mod jsonl;

#[cfg(feature = "local")]
pub mod local;

#[cfg(feature = "otlp")]
pub mod otlp;

#[cfg(feature = "jsonl")]
pub use jsonl::{JsonlExporter, JsonlExporterConfig};

#[cfg(feature = "local")]
pub use local::{LocalExporterConfig, LocalSpanExporter};

#[cfg(feature = "otlp")]
pub use otlp::{OtlpExporterConfig, OtlpHttpJsonExporter, OtlpStats};
