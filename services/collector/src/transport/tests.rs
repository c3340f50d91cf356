use super::*;
use crate::audit::MemoryAuditSink;
use auth::{TokenManifest, TokenStore};
use std::io::{Read, Write};
use std::path::Path;

const TOKEN_HEADER: &str = "X-JSON-Collector-Token";

fn open_collector(dir: &Path) -> (Collector, Arc<MemoryAuditSink>) {
    let sink = Arc::new(MemoryAuditSink::default());
    let collector = Collector::new(
        dir,
        TokenStore::open(TOKEN_HEADER),
        store::DEFAULT_MAX_FILE_SIZE_BYTES,
    )
    .with_audit_sink(sink.clone());
    (collector, sink)
}

fn request(method: &str, target: &str, headers: &[(&str, &str)], body: &[u8]) -> HttpRequest {
    HttpRequest {
        method: method.to_string(),
        target: target.to_string(),
        headers: headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.to_string()))
            .collect(),
        remote_addr: Some("192.0.2.10".to_string()),
        body: body.to_vec(),
    }
}

fn body_text(response: &HttpResponse) -> String {
    String::from_utf8(response.body.clone()).expect("response body should be UTF-8")
}

#[test]
fn post_then_get_round_trips_through_router() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let (collector, _) = open_collector(dir.path());

    let post = request(
        "POST",
        "/json-collector/clicks",
        &[("Content-Type", "application/json")],
        br#"{"button":"buy"}"#,
    );
    let response = handle_request(&collector, &post);
    assert_eq!(response.status, 200);
    assert_eq!(response.content_type, "text/plain; charset=utf-8");
    assert_eq!(body_text(&response), "JSON data accepted for clicks");

    let get = request("GET", "/json-collector/clicks?pretty=1", &[], b"");
    let response = handle_request(&collector, &get);
    assert_eq!(response.status, 200);
    assert_eq!(response.content_type, "application/x-ndjson");
    let text = body_text(&response);
    assert_eq!(text.lines().count(), 1);
    let record: serde_json::Value =
        serde_json::from_str(text.trim_end()).expect("stored line should be JSON");
    assert_eq!(record["posted_data"]["button"], "buy");
    assert_eq!(record["client_ip"], "192.0.2.10");
}

#[test]
fn unknown_paths_return_unknown_url() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let (collector, sink) = open_collector(dir.path());

    for target in ["/", "/health", "/json-collector", "/other/clicks"] {
        let response = handle_request(&collector, &request("GET", target, &[], b""));
        assert_eq!(response.status, 404, "{target}");
        assert_eq!(body_text(&response), r#"{"error":"Unknown URL"}"#);
    }
    assert!(sink.records().iter().all(|record| record.action == "route"));
}

#[test]
fn unsupported_methods_return_405() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let (collector, sink) = open_collector(dir.path());

    let response = handle_request(
        &collector,
        &request("POST", "/json-collector/health-check", &[], b"{}"),
    );
    assert_eq!(response.status, 405);

    let response = handle_request(
        &collector,
        &request("DELETE", "/json-collector/clicks", &[], b""),
    );
    assert_eq!(response.status, 405);
    assert!(!dir.path().join("clicks.jsonl").exists());
    assert_eq!(sink.last().map(|record| record.status), Some(405));
}

#[test]
fn health_check_returns_plain_text() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let (collector, _) = open_collector(dir.path());

    let response = handle_request(
        &collector,
        &request("GET", "/json-collector/health-check", &[], b""),
    );
    assert_eq!(response.status, 200);
    assert_eq!(body_text(&response), HEALTHY_MESSAGE);
}

#[test]
fn health_check_returns_500_when_data_dir_is_a_file() {
    let root = tempfile::tempdir().expect("tempdir should be created");
    let data_path = root.path().join("data");
    std::fs::write(&data_path, b"occupied").expect("file should be written");
    let (collector, _) = open_collector(&data_path);

    let response = handle_request(
        &collector,
        &request("GET", "/json-collector/health-check", &[], b""),
    );
    assert_eq!(response.status, 500);
    assert!(body_text(&response).contains("is not a directory"));
}

#[test]
fn collector_errors_render_as_json_error_bodies() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let manifest =
        TokenManifest::from_json(&serde_json::json!({"alice": "t1"})).expect("valid manifest");
    let collector = Collector::new(
        dir.path(),
        TokenStore::with_manifest(TOKEN_HEADER, manifest),
        store::DEFAULT_MAX_FILE_SIZE_BYTES,
    )
    .with_audit_sink(Arc::new(MemoryAuditSink::default()));

    let response = handle_request(
        &collector,
        &request("POST", "/json-collector/clicks", &[], b"{}"),
    );
    assert_eq!(response.status, 401);
    assert_eq!(response.content_type, "application/json");
    assert_eq!(
        body_text(&response),
        r#"{"error":"Missing required token header 'X-JSON-Collector-Token'"}"#
    );

    let response = handle_request(
        &collector,
        &request(
            "POST",
            "/json-collector/clicks",
            &[(TOKEN_HEADER, "t1")],
            b"not json",
        ),
    );
    assert_eq!(response.status, 400);
    assert_eq!(
        body_text(&response),
        r#"{"error":"ERROR - improperly formatted JSON data"}"#
    );
}

#[test]
fn handle_http_request_bytes_accepts_binary_safe_body() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let (collector, _) = open_collector(dir.path());
    let body = "{\"name\":\"caf\u{e9}\"}";
    let raw = format!(
        "POST /json-collector/unicode HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );

    let response = handle_http_request_bytes(&collector, raw.as_bytes())
        .expect("request should parse and return response");
    let response = String::from_utf8(response).expect("response should be UTF-8");
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("JSON data accepted for unicode"));
}

#[test]
fn handle_http_request_bytes_rejects_length_mismatch() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let (collector, sink) = open_collector(dir.path());
    let raw = b"POST /json-collector/a HTTP/1.1\r\nContent-Length: 10\r\n\r\n{}";

    let err = handle_http_request_bytes(&collector, raw).expect_err("mismatch should fail");
    assert!(err.contains("content-length does not match"));
    let audit = sink.last().expect("rejection should be audited");
    assert_eq!(audit.status, 400);
    assert_eq!(audit.target, "/json-collector/a");
}

#[test]
fn handle_http_request_bytes_audits_oversized_post() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let (collector, sink) = open_collector(dir.path());
    let raw = b"POST /json-collector/big HTTP/1.1\r\nHost: localhost\r\nContent-Length: 20000000\r\n\r\n";

    let err = handle_http_request_bytes(&collector, raw).expect_err("oversized should fail");
    assert!(err.contains("exceeds max body size"));

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].action, "route");
    assert_eq!(records[0].outcome, "rejected");
    assert_eq!(records[0].status, 400);
    assert_eq!(records[0].method, "POST");
    assert_eq!(records[0].target, "/json-collector/big");
    assert!(!dir.path().join("big.jsonl").exists());
}

#[test]
fn handle_http_request_bytes_refuses_oversized_header_block() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let (collector, sink) = open_collector(dir.path());
    let padding = "a".repeat(MAX_HTTP_HEADER_BYTES);
    let raw = format!("GET /json-collector/a HTTP/1.1\r\nX-Padding: {padding}\r\n\r\n");

    let err = handle_http_request_bytes(&collector, raw.as_bytes())
        .expect_err("oversized headers should fail");
    assert!(err.contains("request headers exceed"));
    assert_eq!(sink.last().expect("rejection should be audited").status, 431);
}

#[test]
fn content_length_rejects_garbage_and_oversize() {
    let mut headers = std::collections::HashMap::new();
    assert_eq!(content_length(&headers), Ok(0));
    headers.insert("content-length".to_string(), "12".to_string());
    assert_eq!(content_length(&headers), Ok(12));
    headers.insert("content-length".to_string(), "-1".to_string());
    assert!(content_length(&headers).is_err());
    headers.insert(
        "content-length".to_string(),
        (MAX_HTTP_BODY_BYTES + 1).to_string(),
    );
    assert!(content_length(&headers).is_err());
}

#[test]
fn request_path_drops_query_and_fragment() {
    assert_eq!(request_path("/json-collector/a?x=1"), "/json-collector/a");
    assert_eq!(request_path("/json-collector/a#top"), "/json-collector/a");
    assert_eq!(request_path("/json-collector/a"), "/json-collector/a");
}

#[test]
fn parse_request_line_requires_http1() {
    assert_eq!(
        parse_request_line("GET /json-collector/a HTTP/1.1\r\n"),
        Ok(("GET".to_string(), "/json-collector/a".to_string()))
    );
    assert!(parse_request_line("GET /json-collector/a HTTP/2").is_err());
    assert!(parse_request_line("GET").is_err());
}

#[test]
fn resolve_http_queue_capacity_scales_with_workers() {
    assert_eq!(resolve_http_queue_capacity(0), HTTP_QUEUE_CAPACITY_PER_WORKER);
    assert_eq!(resolve_http_queue_capacity(3), 3 * HTTP_QUEUE_CAPACITY_PER_WORKER);
}

#[test]
fn write_backpressure_response_returns_http_503_payload() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("listener bind should succeed");
    let addr = listener.local_addr().expect("local addr should resolve");
    let client = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).expect("client connect should succeed");
        let mut response = String::new();
        stream
            .read_to_string(&mut response)
            .expect("client should read response");
        response
    });

    let dir = tempfile::tempdir().expect("tempdir should be created");
    let (collector, sink) = open_collector(dir.path());
    let (server_stream, _) = listener.accept().expect("accept should succeed");
    write_backpressure_response(&collector, server_stream, SOCKET_TIMEOUT_SECS)
        .expect("response write should succeed");
    let response = client.join().expect("client thread should join");
    assert!(response.starts_with("HTTP/1.1 503 Service Unavailable"));
    assert!(response.contains("Content-Type: application/json"));
    assert!(response.contains("collector worker queue full"));

    let audit = sink.last().expect("backpressure should be audited");
    assert_eq!(audit.status, 503);
    assert_eq!(audit.outcome, "rejected");
    assert_eq!(audit.remote_addr.as_deref(), Some("127.0.0.1"));
}

#[test]
fn serve_listener_records_peer_address() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let (collector, _) = open_collector(dir.path());
    let collector = Arc::new(collector);
    let listener = TcpListener::bind("127.0.0.1:0").expect("listener bind should succeed");
    let addr = listener.local_addr().expect("local addr should resolve");
    {
        let collector = Arc::clone(&collector);
        std::thread::spawn(move || serve_listener(collector, listener, 2));
    }

    let body = br#"{"via":"tcp"}"#;
    let mut stream = TcpStream::connect(addr).expect("client connect should succeed");
    write!(
        stream,
        "POST /json-collector/tcp HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .expect("request head should be written");
    stream.write_all(body).expect("request body should be written");
    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .expect("client should read response");
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");

    let stored = std::fs::read_to_string(dir.path().join("tcp.jsonl"))
        .expect("dataset file should exist");
    let record: serde_json::Value =
        serde_json::from_str(stored.trim_end()).expect("stored line should be JSON");
    assert_eq!(record["client_ip"], "127.0.0.1");
    assert_eq!(record["request_url"], format!("http://{addr}/json-collector/tcp"));
}

#[test]
fn serve_listener_audits_oversized_content_length() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let (collector, sink) = open_collector(dir.path());
    let collector = Arc::new(collector);
    let listener = TcpListener::bind("127.0.0.1:0").expect("listener bind should succeed");
    let addr = listener.local_addr().expect("local addr should resolve");
    {
        let collector = Arc::clone(&collector);
        std::thread::spawn(move || serve_listener(collector, listener, 1));
    }

    let mut stream = TcpStream::connect(addr).expect("client connect should succeed");
    write!(
        stream,
        "POST /json-collector/big HTTP/1.1\r\nHost: {addr}\r\nContent-Length: 20000000\r\n\r\n"
    )
    .expect("request head should be written");
    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .expect("client should read response");
    assert!(response.starts_with("HTTP/1.1 400 Bad Request"), "{response}");
    assert!(response.contains("exceeds max body size"));

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, 400);
    assert_eq!(records[0].target, "/json-collector/big");
    assert_eq!(records[0].remote_addr.as_deref(), Some("127.0.0.1"));
    assert!(!dir.path().join("big.jsonl").exists());
}

#[test]
fn serve_listener_answers_431_for_unterminated_header_flood() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let (collector, sink) = open_collector(dir.path());
    let collector = Arc::new(collector);
    let listener = TcpListener::bind("127.0.0.1:0").expect("listener bind should succeed");
    let addr = listener.local_addr().expect("local addr should resolve");
    {
        let collector = Arc::clone(&collector);
        std::thread::spawn(move || serve_listener(collector, listener, 1));
    }

    let mut stream = TcpStream::connect(addr).expect("client connect should succeed");
    let head = "GET /json-collector/a HTTP/1.1\r\nX-Padding: ";
    let flood = format!("{head}{}", "a".repeat(MAX_HTTP_HEADER_BYTES - head.len()));
    stream
        .write_all(flood.as_bytes())
        .expect("header flood should be written");
    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .expect("client should read response");
    assert!(
        response.starts_with("HTTP/1.1 431 Request Header Fields Too Large"),
        "{response}"
    );
    assert_eq!(sink.last().expect("rejection should be audited").status, 431);
}
