use std::{collections::HashMap, io::Write, net::TcpStream, time::Duration};

use crate::{Collector, api::RequestMeta};

const BACKPRESSURE_QUEUE_FULL_MESSAGE: &str = "service unavailable: collector worker queue full";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HttpRequest {
    pub(crate) method: String,
    pub(crate) target: String,
    pub(crate) headers: HashMap<String, String>,
    pub(crate) remote_addr: Option<String>,
    pub(crate) body: Vec<u8>,
}

impl HttpRequest {
    pub(crate) fn meta(&self) -> RequestMeta {
        RequestMeta {
            method: self.method.clone(),
            target: self.target.clone(),
            remote_addr: self.remote_addr.clone(),
            headers: self.headers.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HttpResponse {
    pub(crate) status: u16,
    pub(crate) content_type: &'static str,
    pub(crate) body: Vec<u8>,
}

impl HttpResponse {
    pub(crate) fn ok_plain(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: "text/plain; charset=utf-8",
            body: body.into().into_bytes(),
        }
    }

    pub(crate) fn ok_ndjson(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: "application/x-ndjson",
            body,
        }
    }

    pub(crate) fn bad_request(message: &str) -> Self {
        Self::error_with_status(400, message)
    }

    pub(crate) fn not_found(message: &str) -> Self {
        Self::error_with_status(404, message)
    }

    pub(crate) fn method_not_allowed(message: &str) -> Self {
        Self::error_with_status(405, message)
    }

    pub(crate) fn internal_server_error(message: &str) -> Self {
        Self::error_with_status(500, message)
    }

    pub(crate) fn service_unavailable(message: &str) -> Self {
        Self::error_with_status(503, message)
    }

    pub(crate) fn error_with_status(status: u16, message: &str) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: serde_json::json!({ "error": message })
                .to_string()
                .into_bytes(),
        }
    }
}

pub(crate) fn backpressure_rejection_response() -> HttpResponse {
    HttpResponse::service_unavailable(BACKPRESSURE_QUEUE_FULL_MESSAGE)
}

pub(crate) fn write_backpressure_response(
    collector: &Collector,
    mut stream: TcpStream,
    socket_timeout_secs: u64,
) -> std::io::Result<()> {
    let meta = RequestMeta {
        remote_addr: stream.peer_addr().ok().map(|addr| addr.ip().to_string()),
        ..RequestMeta::default()
    };
    collector.record_route_rejection(&meta, 503, BACKPRESSURE_QUEUE_FULL_MESSAGE);
    stream.set_write_timeout(Some(Duration::from_secs(socket_timeout_secs)))?;
    write_response(&mut stream, &backpressure_rejection_response())
}

pub(crate) fn write_response(
    stream: &mut TcpStream,
    response: &HttpResponse,
) -> std::io::Result<()> {
    stream.write_all(&render_response_bytes(response))?;
    stream.flush()
}

pub(crate) fn status_text(status: u16) -> &'static str {
    match status {
        200 => "200 OK",
        400 => "400 Bad Request",
        401 => "401 Unauthorized",
        403 => "403 Forbidden",
        404 => "404 Not Found",
        405 => "405 Method Not Allowed",
        431 => "431 Request Header Fields Too Large",
        503 => "503 Service Unavailable",
        _ => "500 Internal Server Error",
    }
}

pub(crate) fn render_response_bytes(response: &HttpResponse) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status_text(response.status),
        response.content_type,
        response.body.len()
    )
    .into_bytes();
    out.extend_from_slice(&response.body);
    out
}
