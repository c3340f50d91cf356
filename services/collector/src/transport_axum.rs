use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::{Body, to_bytes},
    extract::{ConnectInfo, State},
    http::{HeaderValue, Request, Response, StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
    routing::any,
};

use crate::{
    Collector,
    api::RequestMeta,
    transport::{HttpRequest, HttpResponse, MAX_HTTP_BODY_BYTES, handle_request},
};

#[derive(Clone)]
struct AppState {
    collector: Arc<Collector>,
}

pub fn serve_http_with_axum(
    collector: Arc<Collector>,
    bind_addr: &str,
    worker_threads: usize,
) -> Result<(), String> {
    let worker_threads = worker_threads.max(1);
    let tokio_runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
        .map_err(|e| format!("failed to build tokio runtime: {e}"))?;

    let bind_addr = bind_addr.to_string();
    tokio_runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| format!("failed to bind {bind_addr}: {e}"))?;

        axum::serve(
            listener,
            router(collector).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .map_err(|e| format!("axum server failed: {e}"))
    })
}

fn router(collector: Arc<Collector>) -> Router {
    Router::new()
        .fallback(any(dispatch))
        .with_state(AppState { collector })
        .layer(axum::extract::DefaultBodyLimit::max(MAX_HTTP_BODY_BYTES))
}

async fn dispatch(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request<Body>,
) -> impl IntoResponse {
    let method = request.method().to_string();
    let target = request
        .uri()
        .path_and_query()
        .map(|value| value.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let mut headers = HashMap::new();
    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
        }
    }
    if let Some(authority) = request.uri().authority() {
        headers
            .entry("host".to_string())
            .or_insert_with(|| authority.to_string());
    }

    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr.ip().to_string());
    let body = match to_bytes(request.into_body(), MAX_HTTP_BODY_BYTES).await {
        Ok(bytes) => bytes.to_vec(),
        Err(err) => {
            let reason = format!("request body error: {err}");
            let meta = RequestMeta {
                method,
                target,
                remote_addr,
                headers,
            };
            state.collector.record_route_rejection(&meta, 400, &reason);
            return response_from_transport(HttpResponse::bad_request(&reason));
        }
    };

    let request = HttpRequest {
        method,
        target,
        headers,
        remote_addr,
        body,
    };

    // Engine calls do blocking file I/O.
    let collector = Arc::clone(&state.collector);
    let response = match tokio::task::spawn_blocking(move || handle_request(&collector, &request))
        .await
    {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(error = %err, "collector request task failed");
            HttpResponse::internal_server_error("request handling failed")
        }
    };
    response_from_transport(response)
}

fn response_from_transport(response: HttpResponse) -> Response<Body> {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = status;
    out.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static(response.content_type),
    );
    out
}
