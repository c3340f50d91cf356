use std::{
    collections::HashMap,
    io::{BufRead, BufReader, Read},
    net::TcpStream,
};

use super::{Collector, HttpRequest, HttpResponse, MAX_HTTP_BODY_BYTES, RequestMeta};

/// Request line plus headers; anything longer is refused with 431.
pub(crate) const MAX_HTTP_HEADER_BYTES: usize = 64 * 1024;

/// A request refused before it reached the router. `meta` holds whatever
/// was parsed so the refusal can still be audited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestRejection {
    pub(crate) status: u16,
    pub(crate) reason: String,
    pub(crate) meta: RequestMeta,
}

impl RequestRejection {
    pub(crate) fn new(status: u16, reason: impl Into<String>, meta: &RequestMeta) -> Self {
        Self {
            status,
            reason: reason.into(),
            meta: meta.clone(),
        }
    }

    pub(crate) fn bad_request(reason: impl Into<String>, meta: &RequestMeta) -> Self {
        Self::new(400, reason, meta)
    }

    pub(crate) fn record(&self, collector: &Collector) {
        collector.record_route_rejection(&self.meta, self.status, &self.reason);
    }

    pub(crate) fn response(&self) -> HttpResponse {
        HttpResponse::error_with_status(self.status, &self.reason)
    }
}

pub(super) fn read_http_request(
    stream: &mut TcpStream,
) -> Result<Option<HttpRequest>, RequestRejection> {
    let mut meta = RequestMeta {
        remote_addr: stream.peer_addr().ok().map(|addr| addr.ip().to_string()),
        ..RequestMeta::default()
    };
    let mut reader = BufReader::new(stream);

    {
        let mut head = (&mut reader).take(MAX_HTTP_HEADER_BYTES as u64);

        let mut request_line = String::new();
        let bytes = read_head_line(&mut head, &mut request_line, &meta)?;
        if bytes == 0 {
            return Ok(None);
        }
        let (method, target) = parse_request_line(&request_line)
            .map_err(|reason| RequestRejection::bad_request(reason, &meta))?;
        meta.method = method;
        meta.target = target;

        loop {
            let mut header_line = String::new();
            let bytes = read_head_line(&mut head, &mut header_line, &meta)?;
            if bytes == 0 || header_line == "\r\n" || header_line == "\n" {
                break;
            }
            let (name, value) = parse_header_line(&header_line)
                .map_err(|reason| RequestRejection::bad_request(reason, &meta))?;
            meta.headers.insert(name, value);
        }
    }

    let content_length = content_length(&meta.headers)
        .map_err(|reason| RequestRejection::bad_request(reason, &meta))?;
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader
            .read_exact(&mut body)
            .map_err(|e| RequestRejection::bad_request(e.to_string(), &meta))?;
    }

    Ok(Some(HttpRequest {
        method: meta.method,
        target: meta.target,
        headers: meta.headers,
        remote_addr: meta.remote_addr,
        body,
    }))
}

fn read_head_line<R: BufRead>(
    head: &mut std::io::Take<R>,
    line: &mut String,
    meta: &RequestMeta,
) -> Result<usize, RequestRejection> {
    let bytes = head
        .read_line(line)
        .map_err(|e| RequestRejection::bad_request(e.to_string(), meta))?;
    if bytes > 0 && !line.ends_with('\n') && head.limit() == 0 {
        return Err(RequestRejection::new(
            431,
            format!("request headers exceed {MAX_HTTP_HEADER_BYTES} bytes"),
            meta,
        ));
    }
    Ok(bytes)
}

pub(super) fn parse_header_line(line: &str) -> Result<(String, String), String> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| "invalid HTTP header".to_string())?;
    Ok((name.trim().to_ascii_lowercase(), value.trim().to_string()))
}

pub(super) fn content_length(headers: &HashMap<String, String>) -> Result<usize, String> {
    let content_length = match headers.get("content-length") {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| "invalid content-length header".to_string())?,
        None => 0,
    };
    if content_length > MAX_HTTP_BODY_BYTES {
        return Err(format!(
            "content-length exceeds max body size ({MAX_HTTP_BODY_BYTES} bytes)"
        ));
    }
    Ok(content_length)
}

/// Path part of a request target, without query string or fragment.
pub(super) fn request_path(target: &str) -> &str {
    let end = target.find(['?', '#']).unwrap_or(target.len());
    &target[..end]
}

pub(super) fn parse_request_line(line: &str) -> Result<(String, String), String> {
    let line = line.trim();
    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| "missing HTTP method".to_string())?;
    let target = parts
        .next()
        .ok_or_else(|| "missing HTTP target".to_string())?;
    let version = parts
        .next()
        .ok_or_else(|| "missing HTTP version".to_string())?;
    if !version.starts_with("HTTP/1.") {
        return Err("unsupported HTTP version".to_string());
    }
    Ok((method.to_string(), target.to_string()))
}
