use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;

use crate::api::{CollectorError, RequestMeta};

pub const AUDIT_TARGET: &str = "json_collector::audit";
pub const REDACTION_MARKER: &str = "[REDACTED]";

const PAYLOAD_EXCERPT_MAX_CHARS: usize = 512;
const ALWAYS_REDACTED_HEADERS: [&str; 3] = ["authorization", "proxy-authorization", "cookie"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    pub ts_unix_ms: u64,
    pub action: &'static str,
    pub method: String,
    pub target: String,
    pub remote_addr: Option<String>,
    pub dataset: Option<String>,
    pub status: u16,
    pub outcome: &'static str,
    pub reason: String,
    pub authenticated_user: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub payload_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_excerpt: Option<String>,
}

impl AuditRecord {
    pub fn begin(action: &'static str, meta: &RequestMeta, token_header: &str) -> Self {
        Self {
            ts_unix_ms: unix_timestamp_millis(),
            action,
            method: meta.method.clone(),
            target: meta.target.clone(),
            remote_addr: meta.remote_addr.clone(),
            dataset: None,
            status: 0,
            outcome: "pending",
            reason: String::new(),
            authenticated_user: None,
            headers: redacted_headers(&meta.headers, token_header)
                .into_iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            payload_bytes: None,
            payload_excerpt: None,
        }
    }

    pub fn succeed(&mut self, status: u16, reason: impl Into<String>) {
        self.status = status;
        self.outcome = "success";
        self.reason = reason.into();
    }

    pub fn fail(&mut self, error: &CollectorError) {
        self.status = error.status();
        self.outcome = error.outcome();
        self.reason = error.detail();
    }

    pub fn reject(&mut self, status: u16, reason: impl Into<String>) {
        self.status = status;
        self.outcome = "rejected";
        self.reason = reason.into();
    }

    pub fn render(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Destination for audit records. Implementations must not fail the request.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord);
}

/// Emits each audit record as one JSON line on the [`AUDIT_TARGET`] target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) {
        match record.render() {
            Ok(line) => tracing::info!(target: AUDIT_TARGET, "{line}"),
            Err(err) => tracing::warn!(
                target: AUDIT_TARGET,
                error = %err,
                action = record.action,
                status = record.status,
                "audit record serialization failed"
            ),
        }
    }
}

/// Keeps audit records in memory; used by tests and embedding callers.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last(&self) -> Option<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: &AuditRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
    }
}

/// Copies `headers` with every credential-bearing value replaced by
/// [`REDACTION_MARKER`]. The token header is redacted even in open mode.
pub fn redacted_headers<'a>(
    headers: &'a HashMap<String, String>,
    token_header: &str,
) -> BTreeMap<&'a str, &'a str> {
    let token_header = token_header.to_ascii_lowercase();
    headers
        .iter()
        .map(|(name, value)| {
            let secret = name.eq_ignore_ascii_case(&token_header)
                || ALWAYS_REDACTED_HEADERS
                    .iter()
                    .any(|redacted| name.eq_ignore_ascii_case(redacted));
            if secret {
                (name.as_str(), REDACTION_MARKER)
            } else {
                (name.as_str(), value.as_str())
            }
        })
        .collect()
}

pub fn payload_excerpt(body: &[u8]) -> String {
    String::from_utf8_lossy(body)
        .replace('\n', "")
        .replace('\t', " ")
        .chars()
        .take(PAYLOAD_EXCERPT_MAX_CHARS)
        .collect()
}

pub(crate) fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacted_headers_hide_token_and_credentials() {
        let meta = RequestMeta::new("POST", "/json-collector/feed")
            .with_header("X-Custom-Token", "token-123")
            .with_header("Authorization", "Bearer abc")
            .with_header("Content-Type", "application/json");

        let headers = redacted_headers(&meta.headers, "X-Custom-Token");
        assert_eq!(headers.get("x-custom-token"), Some(&REDACTION_MARKER));
        assert_eq!(headers.get("authorization"), Some(&REDACTION_MARKER));
        assert_eq!(headers.get("content-type"), Some(&"application/json"));
    }

    #[test]
    fn rendered_record_never_contains_token_value() {
        let meta = RequestMeta::new("GET", "/json-collector/feed")
            .with_header("X-JSON-Collector-Token", "t1")
            .with_remote_addr("10.0.0.7");
        let mut record = AuditRecord::begin("fetch", &meta, "X-JSON-Collector-Token");
        record.authenticated_user = Some("alice".to_string());
        record.succeed(200, "served 0 bytes");

        let line = record.render().unwrap();
        assert!(!line.contains("\"t1\""));
        assert!(line.contains(REDACTION_MARKER));
        assert!(line.contains("\"authenticated_user\":\"alice\""));
        assert!(line.contains("\"remote_addr\":\"10.0.0.7\""));
        assert!(!line.contains("payload_excerpt"));
    }

    #[test]
    fn fail_uses_error_status_and_detail() {
        let meta = RequestMeta::new("POST", "/json-collector/feed");
        let mut record = AuditRecord::begin("ingest", &meta, "X-JSON-Collector-Token");
        record.fail(&CollectorError::MalformedPayload {
            detail: "EOF while parsing an object".to_string(),
        });

        assert_eq!(record.status, 400);
        assert_eq!(record.outcome, "rejected");
        assert_eq!(record.reason, "EOF while parsing an object");
    }

    #[test]
    fn payload_excerpt_flattens_and_truncates() {
        assert_eq!(payload_excerpt(b"{\n\t\"a\": 1\n"), "{ \"a\": 1");
        let long = vec![b'x'; PAYLOAD_EXCERPT_MAX_CHARS + 10];
        assert_eq!(payload_excerpt(&long).len(), PAYLOAD_EXCERPT_MAX_CHARS);
    }

    #[test]
    fn memory_sink_keeps_records_in_order() {
        let sink = MemoryAuditSink::default();
        let meta = RequestMeta::new("GET", "/json-collector/health-check");
        let mut first = AuditRecord::begin("health", &meta, "X-JSON-Collector-Token");
        first.succeed(200, "healthy");
        let mut second = first.clone();
        second.reject(404, "unknown path");

        sink.record(&first);
        sink.record(&second);

        assert_eq!(sink.records().len(), 2);
        assert_eq!(sink.last().map(|r| r.status), Some(404));
    }
}
