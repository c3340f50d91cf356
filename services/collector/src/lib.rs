pub mod api;
pub mod audit;
pub mod config;
pub mod transport;
#[cfg(feature = "async-transport")]
pub mod transport_axum;

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use auth::{AuthDecision, ManifestError, TokenStore};
use serde::Serialize;
use serde_json::Value;
use store::{AppendOutcome, DatasetPath, RotatingWriter, StoreError};

use crate::{
    api::{CollectorError, HealthStatus, IngestReceipt, RequestMeta},
    audit::{AuditRecord, AuditSink, TracingAuditSink, payload_excerpt, redacted_headers},
    config::CollectorConfig,
};

pub const HEALTHY_MESSAGE: &str = "Everything is ay oh kay";

/// One persisted line. The client payload is nested so service fields
/// can never be overwritten by client keys.
#[derive(Debug, Serialize)]
struct StoredRecord<'a> {
    timestamp: f64,
    client_ip: Option<&'a str>,
    request_headers: BTreeMap<&'a str, &'a str>,
    request_url: String,
    posted_data: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    authenticated_user: Option<&'a str>,
}

pub struct Collector {
    data_dir: PathBuf,
    tokens: TokenStore,
    writer: RotatingWriter,
    manifest_path: Option<PathBuf>,
    audit: Arc<dyn AuditSink>,
    storage_fault: Mutex<Option<String>>,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("data_dir", &self.data_dir)
            .field("auth_enabled", &self.tokens.is_enabled())
            .field("max_file_size_bytes", &self.writer.max_file_size_bytes())
            .finish_non_exhaustive()
    }
}

impl Collector {
    pub fn new(data_dir: impl Into<PathBuf>, tokens: TokenStore, max_file_size_bytes: u64) -> Self {
        Self {
            data_dir: data_dir.into(),
            tokens,
            writer: RotatingWriter::new(max_file_size_bytes),
            manifest_path: None,
            audit: Arc::new(TracingAuditSink),
            storage_fault: Mutex::new(None),
        }
    }

    pub fn from_config(config: &CollectorConfig) -> Result<Self, ManifestError> {
        let tokens = TokenStore::load(config.tokens_file.as_deref(), config.token_header.clone())?;
        let collector = Self::new(config.data_dir.clone(), tokens, config.max_file_size_bytes);
        Ok(match config.tokens_file.as_ref() {
            Some(path) => collector.with_manifest_path(path.clone()),
            None => collector,
        })
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    /// GET never serves this file, even if it lives in the data directory.
    pub fn with_manifest_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.manifest_path = Some(path.into());
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn writer(&self) -> &RotatingWriter {
        &self.writer
    }

    pub fn ingest(
        &self,
        dataset_raw: &str,
        body: &[u8],
        meta: &RequestMeta,
    ) -> Result<IngestReceipt, CollectorError> {
        let mut record = AuditRecord::begin("ingest", meta, self.tokens.header_name());
        record.dataset = Some(dataset_raw.to_string());
        record.payload_bytes = Some(body.len());

        let result = self.ingest_inner(dataset_raw, body, meta, &mut record);
        match &result {
            Ok(receipt) => {
                record.succeed(200, format!("appended {} bytes", receipt.bytes));
            }
            Err(err) => {
                if matches!(err, CollectorError::MalformedPayload { .. }) {
                    record.payload_excerpt = Some(payload_excerpt(body));
                }
                record.fail(err);
            }
        }
        self.audit.record(&record);
        result
    }

    fn ingest_inner(
        &self,
        dataset_raw: &str,
        body: &[u8],
        meta: &RequestMeta,
        record: &mut AuditRecord,
    ) -> Result<IngestReceipt, CollectorError> {
        let user = self.authenticate(meta)?;
        record.authenticated_user = user.clone();
        let dataset = store::sanitize_dataset_name(&self.data_dir, dataset_raw)?;

        if let Some(content_type) = meta.header("content-type") {
            if !is_json_media_type(content_type) {
                return Err(CollectorError::MalformedPayload {
                    detail: format!("unsupported content type '{content_type}'"),
                });
            }
        }
        let posted: Value =
            serde_json::from_slice(body).map_err(|err| CollectorError::MalformedPayload {
                detail: err.to_string(),
            })?;

        let line = self.encode_record(&posted, meta, user.as_deref())?;
        let outcome = match self.writer.append(&dataset, &line) {
            Ok(outcome) => outcome,
            Err(err) => return Err(self.storage_failure(&dataset, err)),
        };
        self.clear_storage_fault();

        let (bytes, retired_file) = match outcome {
            AppendOutcome::Written { bytes } => (bytes, None),
            AppendOutcome::RotatedThenWritten { bytes, retired } => (bytes, Some(retired)),
        };
        Ok(IngestReceipt {
            dataset: dataset.name().to_string(),
            bytes,
            retired_file,
            authenticated_user: user,
        })
    }

    pub fn fetch(&self, dataset_raw: &str, meta: &RequestMeta) -> Result<Vec<u8>, CollectorError> {
        let mut record = AuditRecord::begin("fetch", meta, self.tokens.header_name());
        record.dataset = Some(dataset_raw.to_string());

        let result = self.fetch_inner(dataset_raw, meta, &mut record);
        match &result {
            Ok(bytes) => {
                record.payload_bytes = Some(bytes.len());
                record.succeed(200, format!("served {} bytes", bytes.len()));
            }
            Err(err) => record.fail(err),
        }
        self.audit.record(&record);
        result
    }

    fn fetch_inner(
        &self,
        dataset_raw: &str,
        meta: &RequestMeta,
        record: &mut AuditRecord,
    ) -> Result<Vec<u8>, CollectorError> {
        let user = self.authenticate(meta)?;
        record.authenticated_user = user;
        let dataset = store::sanitize_dataset_name(&self.data_dir, dataset_raw)?;

        if self.is_manifest_path(dataset.path()) {
            return Err(CollectorError::NotFound {
                dataset: dataset.name().to_string(),
            });
        }

        match store::read_current(&dataset) {
            Ok(Some(bytes)) => Ok(bytes),
            Ok(None) => Err(CollectorError::NotFound {
                dataset: dataset.name().to_string(),
            }),
            Err(err) => {
                tracing::error!(dataset = dataset.name(), error = %err, "dataset read failed");
                Err(CollectorError::StorageUnavailable {
                    detail: err.to_string(),
                })
            }
        }
    }

    pub fn check_health(&self, meta: &RequestMeta) -> HealthStatus {
        let mut record = AuditRecord::begin("health", meta, self.tokens.header_name());
        let status = match store::probe_data_dir(&self.data_dir) {
            Err(err) => HealthStatus::Unhealthy(err.to_string()),
            Ok(()) => match self.storage_fault() {
                Some(detail) => HealthStatus::Unhealthy(format!("last write failed: {detail}")),
                None => HealthStatus::Healthy,
            },
        };
        match &status {
            HealthStatus::Healthy => record.succeed(200, "healthy"),
            HealthStatus::Unhealthy(detail) => {
                tracing::warn!(detail = %detail, "health check failed");
                record.status = 500;
                record.outcome = "error";
                record.reason = detail.clone();
            }
        }
        self.audit.record(&record);
        status
    }

    /// Audits a request that never reached a dataset operation.
    pub fn record_route_rejection(&self, meta: &RequestMeta, status: u16, reason: &str) {
        let mut record = AuditRecord::begin("route", meta, self.tokens.header_name());
        record.reject(status, reason);
        self.audit.record(&record);
    }

    pub fn storage_fault(&self) -> Option<String> {
        self.storage_fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn authenticate(&self, meta: &RequestMeta) -> Result<Option<String>, CollectorError> {
        match self
            .tokens
            .authenticate(meta.header(self.tokens.header_name()))
        {
            AuthDecision::Allowed(user) => Ok(user),
            AuthDecision::Unauthorized(message) => Err(CollectorError::AuthRequired(message)),
            AuthDecision::Forbidden(message) => Err(CollectorError::AuthRejected(message.into())),
        }
    }

    fn encode_record(
        &self,
        posted: &Value,
        meta: &RequestMeta,
        user: Option<&str>,
    ) -> Result<Vec<u8>, CollectorError> {
        let stored = StoredRecord {
            timestamp: unix_timestamp_secs(),
            client_ip: meta.remote_addr.as_deref(),
            request_headers: redacted_headers(&meta.headers, self.tokens.header_name()),
            request_url: meta.request_url(),
            posted_data: posted,
            authenticated_user: if self.tokens.is_enabled() { user } else { None },
        };
        serde_json::to_vec(&stored).map_err(|err| CollectorError::StorageUnavailable {
            detail: format!("record encoding failed: {err}"),
        })
    }

    fn is_manifest_path(&self, candidate: &Path) -> bool {
        let Some(manifest) = self.manifest_path.as_deref() else {
            return false;
        };
        if manifest == candidate {
            return true;
        }
        match (manifest.canonicalize(), candidate.canonicalize()) {
            (Ok(left), Ok(right)) => left == right,
            _ => false,
        }
    }

    fn storage_failure(&self, dataset: &DatasetPath, err: StoreError) -> CollectorError {
        tracing::error!(dataset = dataset.name(), error = %err, "dataset append failed");
        let detail = err.to_string();
        *self
            .storage_fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(detail.clone());
        CollectorError::StorageUnavailable { detail }
    }

    fn clear_storage_fault(&self) {
        let mut fault = self
            .storage_fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if fault.take().is_some() {
            tracing::info!("storage recovered after a failed write");
        }
    }
}

fn unix_timestamp_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_secs_f64())
        .unwrap_or(0.0)
}

/// `application/json` or any `+json` structured syntax type; parameters are ignored.
fn is_json_media_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence == "application/json" || (essence.contains('/') && essence.ends_with("+json"))
}
