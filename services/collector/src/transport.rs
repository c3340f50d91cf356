use std::{
    net::{TcpListener, TcpStream},
    sync::{Arc, Mutex, mpsc},
    time::Duration,
};

use crate::{
    Collector, HEALTHY_MESSAGE,
    api::{CollectorError, HealthStatus, RequestMeta},
};

mod http;
mod request;
mod routes;
mod server_runtime;
#[cfg(test)]
mod tests;

pub(crate) use http::{HttpRequest, HttpResponse};
use http::{render_response_bytes, write_backpressure_response, write_response};
use request::{
    MAX_HTTP_HEADER_BYTES, RequestRejection, content_length, parse_header_line, parse_request_line,
    read_http_request, request_path,
};
pub(crate) use routes::handle_request;
pub use server_runtime::{serve_http_with_workers, serve_listener};

pub const ROUTE_PREFIX: &str = "/json-collector/";
pub const HEALTH_CHECK_DATASET: &str = "health-check";
pub const UNKNOWN_URL_MESSAGE: &str = "Unknown URL";

pub(crate) const MAX_HTTP_BODY_BYTES: usize = 16 * 1024 * 1024;
const SOCKET_TIMEOUT_SECS: u64 = 5;
const HTTP_QUEUE_CAPACITY_PER_WORKER: usize = 64;

pub fn serve_http(collector: Arc<Collector>, bind_addr: &str) -> std::io::Result<()> {
    serve_http_with_workers(collector, bind_addr, crate::config::DEFAULT_HTTP_WORKERS)
}

/// Runs one raw HTTP/1.1 request through the router and returns the raw
/// response. The peer address is unknown on this path. Requests that cannot
/// be parsed are audited and returned as `Err`.
pub fn handle_http_request_bytes(
    collector: &Collector,
    raw_request: &[u8],
) -> Result<Vec<u8>, String> {
    let request = parse_http_request_bytes(raw_request).map_err(|rejection| {
        rejection.record(collector);
        rejection.reason
    })?;
    let response = handle_request(collector, &request);
    Ok(render_response_bytes(&response))
}

fn parse_http_request_bytes(raw_request: &[u8]) -> Result<HttpRequest, RequestRejection> {
    let mut meta = RequestMeta::default();
    let split_at = raw_request
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .ok_or_else(|| RequestRejection::bad_request("missing HTTP header terminator", &meta))?;
    if split_at > MAX_HTTP_HEADER_BYTES {
        return Err(RequestRejection::new(
            431,
            format!("request headers exceed {MAX_HTTP_HEADER_BYTES} bytes"),
            &meta,
        ));
    }
    let header_block = std::str::from_utf8(&raw_request[..split_at])
        .map_err(|_| RequestRejection::bad_request("request headers must be valid UTF-8", &meta))?;
    let body = &raw_request[split_at + 4..];

    let mut lines = header_block.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| RequestRejection::bad_request("missing request line", &meta))?;
    let (method, target) = parse_request_line(request_line)
        .map_err(|reason| RequestRejection::bad_request(reason, &meta))?;
    meta.method = method;
    meta.target = target;

    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let (name, value) = parse_header_line(line)
            .map_err(|reason| RequestRejection::bad_request(reason, &meta))?;
        meta.headers.insert(name, value);
    }

    let content_length = content_length(&meta.headers)
        .map_err(|reason| RequestRejection::bad_request(reason, &meta))?;
    if content_length != body.len() {
        return Err(RequestRejection::bad_request(
            "content-length does not match body size",
            &meta,
        ));
    }

    Ok(HttpRequest {
        method: meta.method,
        target: meta.target,
        headers: meta.headers,
        remote_addr: None,
        body: body.to_vec(),
    })
}

fn resolve_http_queue_capacity(worker_count: usize) -> usize {
    worker_count
        .max(1)
        .saturating_mul(HTTP_QUEUE_CAPACITY_PER_WORKER)
}
