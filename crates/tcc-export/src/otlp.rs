//! OTLP/HTTP JSON exporter
//!
//! Sends each run batch to a collector as one OTLP/JSON trace request.
//! Network errors and 5xx responses are retried with exponential backoff;
//! 4xx responses are not.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tcc_core::config::OtlpExportConfig;
use tcc_core::plugins::{
    ExportReceipt, PluginError, PluginInfo, PluginResult, SpanBatch, SpanExporter,
};
use tcc_core::span::{AttributeValue, SpanData};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Identifies the exporter, its language and version to the collector
pub const USER_AGENT: &str = concat!("OTel-OTLP-Exporter-Rust/", env!("CARGO_PKG_VERSION"));

const SCOPE_NAME: &str = "tcc-sensor";

// =============================================================================
// WIRE FORMAT
// =============================================================================

/// OTLP/JSON trace export request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportTraceServiceRequest {
    pub resource_spans: Vec<ResourceSpans>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpans {
    pub resource: Resource,
    pub scope_spans: Vec<ScopeSpans>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub attributes: Vec<KeyValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeSpans {
    pub scope: InstrumentationScope,
    pub spans: Vec<OtlpSpan>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentationScope {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtlpSpan {
    pub trace_id: String,
    pub span_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,

    pub name: String,

    /// Always SPAN_KIND_INTERNAL
    pub kind: u8,

    /// Unix nanoseconds, as a decimal string
    pub start_time_unix_nano: String,
    pub end_time_unix_nano: String,

    pub attributes: Vec<KeyValue>,
    pub status: OtlpStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtlpStatus {
    pub code: u8,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: AnyValue,
}

impl KeyValue {
    fn string(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: AnyValue::StringValue(value.to_string()),
        }
    }
}

/// Typed attribute value; 64-bit integers travel as strings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AnyValue {
    StringValue(String),
    BoolValue(bool),
    IntValue(String),
    DoubleValue(f64),
    ArrayValue(ArrayValue),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayValue {
    pub values: Vec<AnyValue>,
}

impl From<&AttributeValue> for AnyValue {
    fn from(value: &AttributeValue) -> Self {
        match value {
            AttributeValue::Bool(b) => AnyValue::BoolValue(*b),
            AttributeValue::Int(i) => AnyValue::IntValue(i.to_string()),
            AttributeValue::Double(d) => AnyValue::DoubleValue(*d),
            AttributeValue::String(s) => AnyValue::StringValue(s.clone()),
            AttributeValue::StringArray(values) => AnyValue::ArrayValue(ArrayValue {
                values: values.iter().cloned().map(AnyValue::StringValue).collect(),
            }),
        }
    }
}

fn unix_nanos(time: chrono::DateTime<chrono::Utc>) -> String {
    time.timestamp_nanos_opt().unwrap_or_default().to_string()
}

fn encode_span(span: &SpanData) -> OtlpSpan {
    let mut attributes: Vec<KeyValue> = span
        .attributes
        .iter()
        .map(|(key, value)| KeyValue {
            key: key.clone(),
            value: value.into(),
        })
        .collect();
    attributes.sort_by(|a, b| a.key.cmp(&b.key));

    OtlpSpan {
        trace_id: span.trace_id.clone(),
        span_id: span.span_id.clone(),
        parent_span_id: span.parent_span_id.clone(),
        name: span.name.clone(),
        kind: 1,
        start_time_unix_nano: unix_nanos(span.start_time),
        end_time_unix_nano: unix_nanos(span.end_time.unwrap_or(span.start_time)),
        attributes,
        status: OtlpStatus {
            code: span.status.code.as_u8(),
            message: span.status.message.clone(),
        },
    }
}

/// Encode a batch as a single trace request
pub fn encode_batch(batch: &SpanBatch, service_name: &str) -> ExportTraceServiceRequest {
    ExportTraceServiceRequest {
        resource_spans: vec![ResourceSpans {
            resource: Resource {
                attributes: vec![
                    KeyValue::string("service.name", service_name),
                    KeyValue::string("telemetry.sdk.language", "rust"),
                    KeyValue::string("telemetry.sdk.name", SCOPE_NAME),
                ],
            },
            scope_spans: vec![ScopeSpans {
                scope: InstrumentationScope {
                    name: SCOPE_NAME.to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
                spans: batch.spans.iter().map(encode_span).collect(),
            }],
        }],
    }
}

// =============================================================================
// EXPORTER
// =============================================================================

/// OTLP exporter configuration
#[derive(Debug, Clone)]
pub struct OtlpExporterConfig {
    /// Collector traces URL
    pub url: String,

    /// Bearer token
    pub api_key: Option<String>,

    /// Static headers to include in all requests
    pub headers: HashMap<String, String>,

    /// Request timeout
    pub timeout: Duration,

    /// Maximum number of retries
    pub max_retries: u32,

    /// Initial retry delay (doubles with each retry)
    pub initial_retry_delay: Duration,

    /// Maximum retry delay
    pub max_retry_delay: Duration,

    /// `service.name` resource attribute
    pub service_name: String,
}

impl Default for OtlpExporterConfig {
    fn default() -> Self {
        Self {
            url: tcc_core::config::PROD_TRACES_URL.to_string(),
            api_key: None,
            headers: HashMap::new(),
            timeout: Duration::from_secs(10),
            max_retries: 3,
            initial_retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(30),
            service_name: "tcc-sensor".to_string(),
        }
    }
}

impl From<&OtlpExportConfig> for OtlpExporterConfig {
    fn from(settings: &OtlpExportConfig) -> Self {
        Self {
            url: settings.resolved_url(),
            api_key: settings.api_key.clone(),
            headers: settings.headers.clone(),
            timeout: Duration::from_secs(settings.timeout_secs),
            max_retries: settings.max_retries,
            ..Default::default()
        }
    }
}

/// OTLP export statistics
#[derive(Debug, Clone, Default)]
pub struct OtlpStats {
    pub batches_exported: u64,
    pub spans_exported: u64,
    pub batches_failed: u64,
    pub retries: u64,
}

/// OTLP-specific error types
#[derive(Debug)]
enum OtlpError {
    Network(reqwest::Error),
    ClientError { status: StatusCode, body: String },
    ServerError { status: StatusCode, body: String },
}

impl std::fmt::Display for OtlpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OtlpError::Network(e) => write!(f, "Network error: {}", e),
            OtlpError::ClientError { status, body } => {
                write!(f, "Client error {}: {}", status, body)
            }
            OtlpError::ServerError { status, body } => {
                write!(f, "Server error {}: {}", status, body)
            }
        }
    }
}

impl std::error::Error for OtlpError {}

/// State shared with in-flight sends
struct Sender {
    client: Client,
    config: OtlpExporterConfig,
    batches_exported: AtomicU64,
    spans_exported: AtomicU64,
    batches_failed: AtomicU64,
    retries: AtomicU64,
}

impl Sender {
    async fn send_request(&self, body: &str) -> Result<(), OtlpError> {
        let mut request = self
            .client
            .post(&self.config.url)
            .header("Content-Type", "application/json");

        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        for (key, value) in &self.config.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request
            .body(body.to_string())
            .send()
            .await
            .map_err(OtlpError::Network)?;
        let status = response.status();

        if status.is_success() {
            Ok(())
        } else if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            Err(OtlpError::ClientError { status, body })
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(OtlpError::ServerError { status, body })
        }
    }

    async fn send_with_retry(&self, body: &str, span_count: usize) -> PluginResult<()> {
        let mut delay = self.config.initial_retry_delay;
        let mut attempts = 0;

        loop {
            match self.send_request(body).await {
                Ok(()) => {
                    self.batches_exported.fetch_add(1, Ordering::Relaxed);
                    self.spans_exported
                        .fetch_add(span_count as u64, Ordering::Relaxed);
                    debug!("Successfully exported {} spans", span_count);
                    return Ok(());
                }
                Err(OtlpError::ClientError { status, body }) => {
                    warn!("Collector rejected {} spans with {}: {}", span_count, status, body);
                    self.batches_failed.fetch_add(1, Ordering::Relaxed);
                    return Err(PluginError::ExportFailed(format!(
                        "Collector client error {}: {}",
                        status, body
                    )));
                }
                Err(e) => {
                    attempts += 1;
                    if attempts > self.config.max_retries {
                        warn!("Exporting {} spans failed after {} attempts: {}", span_count, attempts, e);
                        self.batches_failed.fetch_add(1, Ordering::Relaxed);
                        return Err(PluginError::ExportFailed(format!(
                            "Export failed after {} attempts: {}",
                            attempts, e
                        )));
                    }

                    debug!(
                        "Export failed (attempt {}), retrying in {:?}: {}",
                        attempts, delay, e
                    );
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, self.config.max_retry_delay);
                }
            }
        }
    }
}

/// Exporter posting OTLP/JSON to a collector
pub struct OtlpHttpJsonExporter {
    sender: Arc<Sender>,
    in_flight: Mutex<JoinSet<()>>,
    closed: AtomicBool,
}

impl OtlpHttpJsonExporter {
    pub fn new(config: OtlpExporterConfig) -> PluginResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .gzip(true)
            .build()
            .map_err(|e| {
                PluginError::InitializationFailed(format!("Failed to create HTTP client: {}", e))
            })?;

        info!("OTLP exporter sending to {}", config.url);

        Ok(Self {
            sender: Arc::new(Sender {
                client,
                config,
                batches_exported: AtomicU64::new(0),
                spans_exported: AtomicU64::new(0),
                batches_failed: AtomicU64::new(0),
                retries: AtomicU64::new(0),
            }),
            in_flight: Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Number of sends not yet reaped
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Get export statistics
    pub fn stats(&self) -> OtlpStats {
        OtlpStats {
            batches_exported: self.sender.batches_exported.load(Ordering::Relaxed),
            spans_exported: self.sender.spans_exported.load(Ordering::Relaxed),
            batches_failed: self.sender.batches_failed.load(Ordering::Relaxed),
            retries: self.sender.retries.load(Ordering::Relaxed),
        }
    }

    async fn drain(&self) {
        let mut pending = std::mem::take(&mut *self.in_flight.lock());
        while let Some(joined) = pending.join_next().await {
            if let Err(e) = joined {
                warn!("OTLP send task failed: {}", e);
            }
        }
    }
}

impl PluginInfo for OtlpHttpJsonExporter {
    fn name(&self) -> &str {
        "otlp-http-json"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn description(&self) -> &str {
        "Exports run batches to an OTLP/HTTP JSON collector"
    }
}

#[async_trait]
impl SpanExporter for OtlpHttpJsonExporter {
    fn export(&self, batch: SpanBatch) -> ExportReceipt {
        if self.closed.load(Ordering::SeqCst) {
            debug!("Ignoring export called after shutdown");
            return ExportReceipt::ready(Err(PluginError::ShutDown));
        }
        if batch.is_empty() {
            return ExportReceipt::ready(Ok(()));
        }

        let body = match serde_json::to_string(&encode_batch(&batch, &self.sender.config.service_name)) {
            Ok(body) => body,
            Err(e) => return ExportReceipt::ready(Err(e.into())),
        };
        if tokio::runtime::Handle::try_current().is_err() {
            return ExportReceipt::ready(Err(PluginError::OperationFailed(
                "OTLP export requires a tokio runtime".to_string(),
            )));
        }

        debug!("Exporting {} spans", batch.len());
        let (tx, receipt) = ExportReceipt::channel();
        let sender = self.sender.clone();
        let span_count = batch.len();

        let mut in_flight = self.in_flight.lock();
        while in_flight.try_join_next().is_some() {}
        in_flight.spawn(async move {
            let result = sender.send_with_retry(&body, span_count).await;
            let _ = tx.send(result);
        });

        receipt
    }

    async fn force_flush(&self) -> PluginResult<()> {
        self.drain().await;
        Ok(())
    }

    async fn shutdown(&self) -> PluginResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Shutting down OTLP exporter");
        self.drain().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tcc_core::correlate::RunId;
    use tcc_core::span::SpanStatus;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> OtlpExporterConfig {
        OtlpExporterConfig {
            url: format!("{}/v1/traces", server.uri()),
            api_key: Some("test-key".to_string()),
            initial_retry_delay: Duration::from_millis(1),
            max_retry_delay: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn batch() -> SpanBatch {
        let start = Utc::now();
        let mut run = SpanData::new("0af7651916cd43dd8448eb211c80319c", "b7ad6b7169203331", "ai.generateText", start)
            .with_attribute("tcc.runId", "run-1")
            .with_attribute("ai.usage.promptTokens", 12i64)
            .with_attribute("ai.prompt.tools", AttributeValue::StringArray(vec!["a".into(), "b".into()]));
        run.end(start + chrono::Duration::seconds(1), SpanStatus::ok());
        let step = SpanData::new("0af7651916cd43dd8448eb211c80319c", "00f067aa0ba902b7", "ai.generateText.doGenerate", start)
            .with_parent("b7ad6b7169203331");
        SpanBatch::new(Some(RunId::from("run-1")), vec![step, run])
    }

    #[test]
    fn test_encode_batch() {
        let request = encode_batch(&batch(), "svc");
        let json = serde_json::to_value(&request).unwrap();

        let resource = &json["resourceSpans"][0];
        assert_eq!(resource["resource"]["attributes"][0]["value"]["stringValue"], "svc");

        let spans = resource["scopeSpans"][0]["spans"].as_array().unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0]["parentSpanId"], "b7ad6b7169203331");
        assert!(spans[1].get("parentSpanId").is_none());
        assert_eq!(spans[1]["status"]["code"], 1);

        let attrs = spans[1]["attributes"].as_array().unwrap();
        let tokens = attrs.iter().find(|kv| kv["key"] == "ai.usage.promptTokens").unwrap();
        assert_eq!(tokens["value"]["intValue"], "12");
        let tools = attrs.iter().find(|kv| kv["key"] == "ai.prompt.tools").unwrap();
        assert_eq!(tools["value"]["arrayValue"]["values"][1]["stringValue"], "b");

        let start: i64 = spans[1]["startTimeUnixNano"].as_str().unwrap().parse().unwrap();
        let end: i64 = spans[1]["endTimeUnixNano"].as_str().unwrap().parse().unwrap();
        assert_eq!(end - start, 1_000_000_000);
    }

    #[tokio::test]
    async fn test_export_sends_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/traces"))
            .and(header("authorization", "Bearer test-key"))
            .and(header("user-agent", USER_AGENT))
            .and(header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let exporter = OtlpHttpJsonExporter::new(config(&server)).unwrap();
        exporter.export(batch()).wait().await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: ExportTraceServiceRequest = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body.resource_spans[0].scope_spans[0].spans.len(), 2);

        let stats = exporter.stats();
        assert_eq!(stats.batches_exported, 1);
        assert_eq!(stats.spans_exported, 2);
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let exporter = OtlpHttpJsonExporter::new(config(&server)).unwrap();
        exporter.export(batch()).wait().await.unwrap();
        assert_eq!(exporter.stats().retries, 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let exporter = OtlpHttpJsonExporter::new(OtlpExporterConfig {
            max_retries: 1,
            ..config(&server)
        })
        .unwrap();
        let result = exporter.export(batch()).wait().await;
        assert!(matches!(result, Err(PluginError::ExportFailed(_))));
        assert_eq!(exporter.stats().batches_failed, 1);
    }

    #[tokio::test]
    async fn test_client_errors_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .expect(1)
            .mount(&server)
            .await;

        let exporter = OtlpHttpJsonExporter::new(config(&server)).unwrap();
        let result = exporter.export(batch()).wait().await;
        assert!(matches!(result, Err(PluginError::ExportFailed(msg)) if msg.contains("bad key")));
        assert_eq!(exporter.stats().retries, 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_rejects() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(50)))
            .expect(1)
            .mount(&server)
            .await;

        let exporter = OtlpHttpJsonExporter::new(config(&server)).unwrap();
        let mut receipt = exporter.export(batch());

        exporter.shutdown().await.unwrap();
        assert!(matches!(receipt.try_wait(), Some(Ok(()))));
        assert_eq!(exporter.in_flight(), 0);

        let rejected = exporter.export(batch()).wait().await;
        assert!(matches!(rejected, Err(PluginError::ShutDown)));
        exporter.shutdown().await.unwrap();
    }

    #[test]
    fn test_config_from_settings() {
        let settings = OtlpExportConfig {
            enabled: true,
            api_key: Some("dev_key".to_string()),
            timeout_secs: 3,
            ..Default::default()
        };
        let config = OtlpExporterConfig::from(&settings);
        assert_eq!(config.url, tcc_core::config::DEV_TRACES_URL);
        assert_eq!(config.timeout, Duration::from_secs(3));
        assert_eq!(config.api_key.as_deref(), Some("dev_key"));
    }
}
