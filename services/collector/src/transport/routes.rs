use super::*;

pub(crate) fn handle_request(collector: &Collector, request: &HttpRequest) -> HttpResponse {
    let meta = request.meta();
    let path = request_path(&request.target);

    let Some(dataset) = path.strip_prefix(ROUTE_PREFIX) else {
        collector.record_route_rejection(&meta, 404, "path outside collector prefix");
        return HttpResponse::not_found(UNKNOWN_URL_MESSAGE);
    };

    if dataset == HEALTH_CHECK_DATASET {
        return match request.method.as_str() {
            "GET" => health_response(collector.check_health(&meta)),
            _ => reject_method(collector, &meta),
        };
    }

    match request.method.as_str() {
        "POST" => match collector.ingest(dataset, &request.body, &meta) {
            Ok(receipt) => {
                HttpResponse::ok_plain(format!("JSON data accepted for {}", receipt.dataset))
            }
            Err(err) => error_response(&err),
        },
        "GET" => match collector.fetch(dataset, &meta) {
            Ok(bytes) => HttpResponse::ok_ndjson(bytes),
            Err(err) => error_response(&err),
        },
        _ => reject_method(collector, &meta),
    }
}

fn health_response(status: HealthStatus) -> HttpResponse {
    match status {
        HealthStatus::Healthy => HttpResponse::ok_plain(HEALTHY_MESSAGE),
        HealthStatus::Unhealthy(detail) => HttpResponse::internal_server_error(&detail),
    }
}

fn reject_method(collector: &Collector, meta: &RequestMeta) -> HttpResponse {
    let message = format!("method {} not allowed", meta.method);
    collector.record_route_rejection(meta, 405, &message);
    HttpResponse::method_not_allowed(&message)
}

pub(crate) fn error_response(error: &CollectorError) -> HttpResponse {
    HttpResponse::error_with_status(error.status(), &error.to_string())
}
