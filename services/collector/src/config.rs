use std::{
    path::{Path, PathBuf},
    str::FromStr,
};

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub const DEFAULT_DATA_DIR: &str = "/run/collector";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";
pub const DEFAULT_HTTP_WORKERS: usize = 4;
pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be a positive integer, got '{value}'")]
    InvalidNumber { key: &'static str, value: String },
    #[error("token header name must not be empty")]
    EmptyTokenHeader,
    #[error("unknown transport runtime '{0}' (expected 'std' or 'axum')")]
    InvalidTransport(String),
    #[error("unknown log format '{0}' (expected 'console' or 'json')")]
    InvalidLogFormat(String),
    #[error("invalid log filter '{filter}': {detail}")]
    InvalidLogFilter { filter: String, detail: String },
    #[error("logging already initialised: {0}")]
    LoggingInit(String),
    #[error("data directory {}: {source}", .path.display())]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportRuntime {
    #[default]
    Std,
    Axum,
}

impl TransportRuntime {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Std => "std",
            Self::Axum => "axum",
        }
    }
}

impl FromStr for TransportRuntime {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "std" => Ok(Self::Std),
            "axum" => Ok(Self::Axum),
            _ => Err(ConfigError::InvalidTransport(raw.to_string())),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable console output
    #[default]
    Console,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "console" => Ok(Self::Console),
            "json" => Ok(Self::Json),
            _ => Err(ConfigError::InvalidLogFormat(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directives, e.g. `info` or `info,json_collector::audit=warn`.
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            format: LogFormat::Console,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorConfig {
    pub data_dir: PathBuf,
    pub max_file_size_bytes: u64,
    pub tokens_file: Option<PathBuf>,
    pub token_header: String,
    pub bind_addr: String,
    pub http_workers: usize,
    pub transport: TransportRuntime,
    pub log: LogConfig,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            max_file_size_bytes: store::DEFAULT_MAX_FILE_SIZE_BYTES,
            tokens_file: None,
            token_header: auth::DEFAULT_TOKEN_HEADER.to_string(),
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            http_workers: DEFAULT_HTTP_WORKERS,
            transport: TransportRuntime::Std,
            log: LogConfig::default(),
        }
    }
}

impl CollectorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from `lookup`, which maps a variable name to
    /// its value. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let with_fallback =
            |primary: &'static str, fallback: &'static str| -> Option<(&'static str, String)> {
                get(primary)
                    .map(|value| (primary, value))
                    .or_else(|| get(fallback).map(|value| (fallback, value)))
            };

        let defaults = Self::default();

        let data_dir = with_fallback("JSON_COLLECTOR_DATA_DIR", "DATA_FILE_DIR")
            .map(|(_, value)| PathBuf::from(value))
            .unwrap_or(defaults.data_dir);

        let max_file_size_bytes =
            match with_fallback("JSON_COLLECTOR_MAX_FILE_SIZE", "MAX_JSONL_FILE_SIZE") {
                Some((key, value)) => parse_positive::<u64>(key, &value)?,
                None => defaults.max_file_size_bytes,
            };

        let tokens_file = with_fallback("JSON_COLLECTOR_TOKENS_FILE", "AUTHORIZED_TOKENS_FILE")
            .map(|(_, value)| PathBuf::from(value));

        let token_header = match lookup("JSON_COLLECTOR_TOKEN_HEADER") {
            Some(value) if value.trim().is_empty() => return Err(ConfigError::EmptyTokenHeader),
            Some(value) => value.trim().to_string(),
            None => defaults.token_header,
        };

        let bind_addr = get("JSON_COLLECTOR_BIND").unwrap_or(defaults.bind_addr);

        let http_workers = match get("JSON_COLLECTOR_HTTP_WORKERS") {
            Some(value) => parse_positive::<usize>("JSON_COLLECTOR_HTTP_WORKERS", &value)?,
            None => defaults.http_workers,
        };

        let transport = match get("JSON_COLLECTOR_TRANSPORT") {
            Some(value) => value.parse()?,
            None => defaults.transport,
        };

        let log = LogConfig {
            filter: with_fallback("JSON_COLLECTOR_LOG_LEVEL", "RUST_LOG")
                .map(|(_, value)| value)
                .unwrap_or(defaults.log.filter),
            format: match get("JSON_COLLECTOR_LOG_FORMAT") {
                Some(value) => value.parse()?,
                None => defaults.log.format,
            },
        };

        Ok(Self {
            data_dir,
            max_file_size_bytes,
            tokens_file,
            token_header,
            bind_addr,
            http_workers,
            transport,
            log,
        })
    }

    /// Makes `data_dir` absolute and creates it when missing.
    pub fn prepare_data_dir(&mut self) -> Result<(), ConfigError> {
        let absolute = std::path::absolute(&self.data_dir).map_err(|source| ConfigError::DataDir {
            path: self.data_dir.clone(),
            source,
        })?;
        std::fs::create_dir_all(&absolute).map_err(|source| ConfigError::DataDir {
            path: absolute.clone(),
            source,
        })?;
        self.data_dir = absolute;
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

fn parse_positive<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    match raw.parse::<T>() {
        Ok(value) if value > T::default() => Ok(value),
        _ => Err(ConfigError::InvalidNumber {
            key,
            value: raw.to_string(),
        }),
    }
}

/// Installs the global tracing subscriber.
pub fn init_logging(config: &LogConfig) -> Result<(), ConfigError> {
    let filter = EnvFilter::try_new(&config.filter).map_err(|err| ConfigError::InvalidLogFilter {
        filter: config.filter.clone(),
        detail: err.to_string(),
    })?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Console => registry
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true).with_current_span(false))
            .try_init(),
    };
    installed.map_err(|err| ConfigError::LoggingInit(err.to_string()))
}
