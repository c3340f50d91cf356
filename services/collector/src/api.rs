use std::{collections::HashMap, path::PathBuf};

use store::DatasetNameError;

/// What the core needs to know about an incoming request besides its body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    pub method: String,
    pub target: String,
    pub remote_addr: Option<String>,
    /// Header names are stored lower-cased.
    pub headers: HashMap<String, String>,
}

impl RequestMeta {
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_remote_addr(mut self, remote_addr: impl Into<String>) -> Self {
        self.remote_addr = Some(remote_addr.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn request_url(&self) -> String {
        match self.header("host") {
            Some(host) if !host.is_empty() => format!("http://{host}{}", self.target),
            _ => self.target.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReceipt {
    pub dataset: String,
    pub bytes: u64,
    pub retired_file: Option<PathBuf>,
    pub authenticated_user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("{0}")]
    AuthRequired(String),
    #[error("{0}")]
    AuthRejected(String),
    #[error("invalid dataset name: {0}")]
    InvalidDatasetName(#[from] DatasetNameError),
    #[error("ERROR - improperly formatted JSON data")]
    MalformedPayload { detail: String },
    #[error("storage unavailable")]
    StorageUnavailable { detail: String },
    #[error("Unknown URL")]
    NotFound { dataset: String },
}

impl CollectorError {
    pub fn status(&self) -> u16 {
        match self {
            Self::AuthRequired(_) => 401,
            Self::AuthRejected(_) => 403,
            Self::InvalidDatasetName(_) | Self::MalformedPayload { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::StorageUnavailable { .. } => 500,
        }
    }

    pub fn outcome(&self) -> &'static str {
        match self {
            Self::AuthRequired(_) | Self::AuthRejected(_) => "denied",
            Self::InvalidDatasetName(_) | Self::MalformedPayload { .. } | Self::NotFound { .. } => {
                "rejected"
            }
            Self::StorageUnavailable { .. } => "error",
        }
    }

    /// Internal detail for the audit trail; never sent to clients.
    pub fn detail(&self) -> String {
        match self {
            Self::MalformedPayload { detail } | Self::StorageUnavailable { detail } => {
                detail.clone()
            }
            Self::NotFound { dataset } => format!("dataset '{dataset}' has no current file"),
            other => other.to_string(),
        }
    }
}
