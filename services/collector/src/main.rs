use std::sync::Arc;

use collector::{
    Collector,
    config::{CollectorConfig, TransportRuntime, init_logging},
    transport::serve_http_with_workers,
};

fn main() {
    let mut config = match CollectorConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("json-collector configuration error: {err}");
            std::process::exit(2);
        }
    };
    if let Err(err) = init_logging(&config.log) {
        eprintln!("json-collector logging error: {err}");
        std::process::exit(2);
    }
    if let Err(err) = config.prepare_data_dir() {
        tracing::error!(error = %err, "json-collector data directory unusable");
        std::process::exit(2);
    }

    let collector = match Collector::from_config(&config) {
        Ok(collector) => Arc::new(collector),
        Err(err) => {
            tracing::error!(error = %err, "json-collector token manifest rejected");
            std::process::exit(2);
        }
    };

    tracing::info!(
        bind_addr = %config.bind_addr,
        data_dir = %config.data_dir.display(),
        max_file_size_bytes = config.max_file_size_bytes,
        auth_enabled = collector.tokens().is_enabled(),
        authorized_users = collector
            .tokens()
            .manifest()
            .map(|manifest| manifest.len())
            .unwrap_or(0),
        token_header = collector.tokens().header_name(),
        transport = config.transport.as_str(),
        http_workers = config.http_workers,
        "json-collector listening on http://{}/json-collector/",
        config.bind_addr
    );

    match config.transport {
        TransportRuntime::Std => {
            if let Err(err) =
                serve_http_with_workers(collector, &config.bind_addr, config.http_workers)
            {
                tracing::error!(error = %err, "json-collector transport failed");
                std::process::exit(1);
            }
        }
        TransportRuntime::Axum => {
            #[cfg(feature = "async-transport")]
            {
                if let Err(err) = collector::transport_axum::serve_http_with_axum(
                    collector,
                    &config.bind_addr,
                    config.http_workers,
                ) {
                    tracing::error!(error = %err, "json-collector transport failed");
                    std::process::exit(1);
                }
            }
            #[cfg(not(feature = "async-transport"))]
            {
                drop(collector);
                tracing::error!(
                    "json-collector transport runtime 'axum' requires build feature 'async-transport'"
                );
                std::process::exit(2);
            }
        }
    }
}
